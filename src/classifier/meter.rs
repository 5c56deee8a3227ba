//! Built-in classifier: bidirectional flow accounting.
//!
//! Tracks every conversation seen by its worker and reports it as a JSON
//! document in the shape the collector stores. A flow is reported when it
//! ends (RST, or FIN from both sides), when it has been idle for
//! `idle_timeout`, and every `active_timeout` while it stays active; updates
//! reuse the flow's `uuid` so the collector can upsert.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use serde::Serialize;
use tracing::{trace, warn};
use uuid::Uuid;

use super::{Classifier, ClassifierFactory, WorkerId};
use crate::api::{FlowRecord, PacketView};
use crate::errors::InitError;
use crate::flow::{self, Endpoint, FlowKey, FlowPacket};

/// Idle flows are looked for once every this many packets.
const SCAN_INTERVAL: u32 = 1024;

/// Country / AS enrichment. The databases themselves are opaque here.
pub trait GeoLookup: Send + Sync {
    fn country(&self, addr: IpAddr) -> Option<String>;
    fn asn(&self, addr: IpAddr) -> Option<String>;
}

#[derive(Clone)]
pub struct FlowMeterConfig {
    pub idle_timeout: Duration,
    pub active_timeout: Duration,
    pub country_db: Option<PathBuf>,
    pub asn_db: Option<PathBuf>,
    pub geo: Option<Arc<dyn GeoLookup>>,
}

impl Default for FlowMeterConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            active_timeout: Duration::from_secs(120),
            country_db: None,
            asn_db: None,
            geo: None,
        }
    }
}

impl fmt::Debug for FlowMeterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowMeterConfig")
            .field("idle_timeout", &self.idle_timeout)
            .field("active_timeout", &self.active_timeout)
            .field("country_db", &self.country_db)
            .field("asn_db", &self.asn_db)
            .field("geo", &self.geo.is_some())
            .finish()
    }
}

impl ClassifierFactory for FlowMeterConfig {
    fn create(&self, worker: WorkerId) -> Result<Box<dyn Classifier>, InitError> {
        for path in [&self.country_db, &self.asn_db].into_iter().flatten() {
            if !path.is_file() {
                return Err(InitError::Classifier {
                    worker: worker.index,
                    reason: format!("enrichment database {} not found", path.display()),
                });
            }
        }
        Ok(Box::new(FlowMeter::new(self.clone())))
    }
}

struct FlowState {
    id: Uuid,
    client: Endpoint,
    server: Endpoint,
    proto: u8,
    ip_version: u8,
    fingerprint: String,
    first_seen: Duration,
    last_seen: Duration,
    last_report: Duration,
    client_pkts: u64,
    server_pkts: u64,
    client_bytes: u64,
    server_bytes: u64,
    client_fin: bool,
    server_fin: bool,
}

impl FlowState {
    fn new(pkt: &FlowPacket, ts: Duration) -> Self {
        // A SYN-ACK as first packet means we missed the SYN: the sender is the server.
        let reversed = pkt.tcp.is_some_and(|t| t.syn && t.ack);
        let (client, server) = if reversed {
            (pkt.dst, pkt.src)
        } else {
            (pkt.src, pkt.dst)
        };
        Self {
            id: Uuid::new_v4(),
            client,
            server,
            proto: pkt.proto,
            ip_version: pkt.ip_version,
            fingerprint: String::new(),
            first_seen: ts,
            last_seen: ts,
            last_report: ts,
            client_pkts: 0,
            server_pkts: 0,
            client_bytes: 0,
            server_bytes: 0,
            client_fin: false,
            server_fin: false,
        }
    }

    fn update(&mut self, pkt: &FlowPacket, len: u32, ts: Duration) {
        let from_client = pkt.src == self.client;
        if from_client {
            self.client_pkts += 1;
            self.client_bytes += len as u64;
        } else {
            self.server_pkts += 1;
            self.server_bytes += len as u64;
        }
        self.last_seen = self.last_seen.max(ts);
        if let Some(tcp) = pkt.tcp {
            if from_client && tcp.syn && !tcp.ack && self.fingerprint.is_empty() {
                self.fingerprint = format!("{}_{}", tcp.window, pkt.ttl);
            }
            if tcp.fin {
                if from_client {
                    self.client_fin = true;
                } else {
                    self.server_fin = true;
                }
            }
        }
    }

    fn finished(&self, pkt: &FlowPacket) -> bool {
        pkt.tcp.is_some_and(|t| t.rst) || (self.client_fin && self.server_fin)
    }
}

#[derive(Serialize)]
struct FlowSummary<'a> {
    uuid: String,
    src_ip: String,
    dest_ip: String,
    src_port: u16,
    dst_port: u16,
    ip: u8,
    tcp_fingerprint: &'a str,
    proto: &'static str,
    src_country: String,
    dst_country: String,
    src_as: String,
    dst_as: String,
    first_seen: String,
    last_seen: String,
    client_num_pkts: u64,
    server_num_pkts: u64,
    client_len_pkts: u64,
    server_len_pkts: u64,
}

fn format_ts(ts: Duration) -> String {
    DateTime::from_timestamp(ts.as_secs() as i64, ts.subsec_nanos())
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_default()
}

fn render(state: &FlowState, geo: Option<&dyn GeoLookup>) -> Option<FlowRecord> {
    let lookup = |addr: IpAddr| {
        geo.map(|g| (g.country(addr).unwrap_or_default(), g.asn(addr).unwrap_or_default()))
            .unwrap_or_default()
    };
    let (src_country, src_as) = lookup(state.client.addr);
    let (dst_country, dst_as) = lookup(state.server.addr);
    let summary = FlowSummary {
        uuid: state.id.to_string(),
        src_ip: state.client.addr.to_string(),
        dest_ip: state.server.addr.to_string(),
        src_port: state.client.port,
        dst_port: state.server.port,
        ip: state.ip_version,
        tcp_fingerprint: &state.fingerprint,
        proto: flow::proto_name(state.proto),
        src_country,
        dst_country,
        src_as,
        dst_as,
        first_seen: format_ts(state.first_seen),
        last_seen: format_ts(state.last_seen),
        client_num_pkts: state.client_pkts,
        server_num_pkts: state.server_pkts,
        client_len_pkts: state.client_bytes,
        server_len_pkts: state.server_bytes,
    };
    match serde_json::to_vec(&summary) {
        Ok(bytes) => Some(FlowRecord::from(bytes)),
        Err(e) => {
            warn!(error = %e, "failed to serialize flow summary");
            None
        }
    }
}

pub struct FlowMeter {
    config: FlowMeterConfig,
    flows: HashMap<FlowKey, FlowState>,
    since_scan: u32,
}

impl FlowMeter {
    pub fn new(config: FlowMeterConfig) -> Self {
        Self {
            config,
            flows: HashMap::new(),
            since_scan: 0,
        }
    }

    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    fn expire(&mut self, now: Duration, emit: &mut dyn FnMut(FlowRecord)) {
        let idle = self.config.idle_timeout;
        let geo = self.config.geo.as_deref();
        let before = self.flows.len();
        self.flows.retain(|_, state| {
            if now.saturating_sub(state.last_seen) < idle {
                return true;
            }
            if let Some(record) = render(state, geo) {
                emit(record);
            }
            false
        });
        trace!(expired = before - self.flows.len(), "idle scan");
    }
}

impl Classifier for FlowMeter {
    fn process(&mut self, packet: &PacketView<'_>, _worker: WorkerId, emit: &mut dyn FnMut(FlowRecord)) {
        let Some(pkt) = FlowPacket::parse(packet.data) else {
            if packet.is_truncated() {
                trace!(caplen = packet.caplen, len = packet.len, "truncated frame not classified");
            }
            return;
        };
        let ts = packet.timestamp;
        let key = pkt.key();
        let geo = self.config.geo.as_deref();
        let state = self
            .flows
            .entry(key)
            .or_insert_with(|| FlowState::new(&pkt, ts));
        state.update(&pkt, packet.len, ts);

        if state.finished(&pkt) {
            if let Some(state) = self.flows.remove(&key) {
                if let Some(record) = render(&state, geo) {
                    emit(record);
                }
            }
        } else if ts.saturating_sub(state.last_report) >= self.config.active_timeout {
            state.last_report = ts;
            if let Some(record) = render(state, geo) {
                emit(record);
            }
        }

        self.since_scan += 1;
        if self.since_scan >= SCAN_INTERVAL {
            self.since_scan = 0;
            self.expire(ts, emit);
        }
    }

    fn flush(&mut self, emit: &mut dyn FnMut(FlowRecord)) {
        let geo = self.config.geo.as_deref();
        for (_, state) in self.flows.drain() {
            if let Some(record) = render(&state, geo) {
                emit(record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::tests::{tcp_frame, udp_frame};
    use serde_json::Value;

    const WORKER: WorkerId = WorkerId { index: 0, count: 1 };

    fn feed(meter: &mut FlowMeter, secs: u64, frame: &[u8]) -> Vec<Value> {
        let mut out = Vec::new();
        let view = PacketView::new(Duration::from_secs(secs), frame.len() as u32, frame);
        meter.process(&view, WORKER, &mut |rec: FlowRecord| {
            out.push(serde_json::from_slice(rec.as_bytes()).unwrap())
        });
        out
    }

    #[test]
    fn reports_when_both_sides_finish() {
        let mut meter = FlowMeter::new(FlowMeterConfig::default());
        let c = [192, 168, 1, 10];
        let s = [93, 184, 216, 34];
        assert!(feed(&mut meter, 100, &tcp_frame(c, 50000, s, 80, false)).is_empty());
        assert!(feed(&mut meter, 101, &tcp_frame(s, 80, c, 50000, false)).is_empty());
        assert!(feed(&mut meter, 102, &tcp_frame(c, 50000, s, 80, true)).is_empty());
        let out = feed(&mut meter, 103, &tcp_frame(s, 80, c, 50000, true));
        assert_eq!(out.len(), 1);
        let rec = &out[0];
        assert_eq!(rec["src_ip"], "192.168.1.10");
        assert_eq!(rec["dest_ip"], "93.184.216.34");
        assert_eq!(rec["dst_port"], 80);
        assert_eq!(rec["proto"], "TCP");
        assert_eq!(rec["client_num_pkts"], 2);
        assert_eq!(rec["server_num_pkts"], 2);
        assert_eq!(rec["first_seen"], "1970-01-01T00:01:40");
        assert_eq!(meter.active_flows(), 0);
    }

    #[test]
    fn truncated_headers_are_skipped() {
        let mut meter = FlowMeter::new(FlowMeterConfig::default());
        let frame = udp_frame([10, 0, 0, 1], 5000, [10, 0, 0, 2], 53);
        let view = PacketView::new(Duration::from_secs(1), frame.len() as u32, &frame[..20]);
        assert!(view.is_truncated());
        meter.process(&view, WORKER, &mut |_: FlowRecord| panic!("no record expected"));
        assert_eq!(meter.active_flows(), 0);
    }

    #[test]
    fn active_flows_get_periodic_updates_with_stable_id() {
        let config = FlowMeterConfig {
            active_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let mut meter = FlowMeter::new(config);
        let frame = udp_frame([10, 0, 0, 1], 5000, [10, 0, 0, 2], 53);
        assert!(feed(&mut meter, 0, &frame).is_empty());
        assert!(feed(&mut meter, 5, &frame).is_empty());
        let first = feed(&mut meter, 10, &frame);
        let second = feed(&mut meter, 20, &frame);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0]["uuid"], second[0]["uuid"]);
        assert_eq!(second[0]["client_num_pkts"], 4);
    }

    #[test]
    fn idle_flows_expire_on_scan() {
        let mut meter = FlowMeter::new(FlowMeterConfig::default());
        feed(&mut meter, 0, &udp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 53));
        let busy = udp_frame([10, 0, 0, 3], 2, [10, 0, 0, 4], 53);
        let mut reported = Vec::new();
        for _ in 1..SCAN_INTERVAL {
            reported.extend(feed(&mut meter, 60, &busy));
        }
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0]["src_ip"], "10.0.0.1");
        assert_eq!(meter.active_flows(), 1);
    }

    #[test]
    fn flush_reports_everything() {
        let mut meter = FlowMeter::new(FlowMeterConfig::default());
        for port in 0..5 {
            feed(&mut meter, 1, &udp_frame([10, 0, 0, 1], port, [10, 0, 0, 2], 53));
        }
        let mut n = 0;
        meter.flush(&mut |_: FlowRecord| n += 1);
        assert_eq!(n, 5);
        assert_eq!(meter.active_flows(), 0);
    }

    struct FixedGeo;

    impl GeoLookup for FixedGeo {
        fn country(&self, _addr: IpAddr) -> Option<String> {
            Some("NL".to_string())
        }
        fn asn(&self, _addr: IpAddr) -> Option<String> {
            None
        }
    }

    #[test]
    fn enrichment_is_applied() {
        let config = FlowMeterConfig {
            geo: Some(Arc::new(FixedGeo)),
            ..Default::default()
        };
        let mut meter = FlowMeter::new(config);
        feed(&mut meter, 1, &udp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 53));
        let mut out = Vec::new();
        meter.flush(&mut |rec: FlowRecord| out.push(serde_json::from_slice::<Value>(rec.as_bytes()).unwrap()));
        assert_eq!(out[0]["src_country"], "NL");
        assert_eq!(out[0]["dst_as"], "");
    }

    #[test]
    fn factory_checks_database_paths() {
        let config = FlowMeterConfig {
            country_db: Some(PathBuf::from("/nonexistent/country.mmdb")),
            ..Default::default()
        };
        let err = config.create(WORKER).err().unwrap();
        assert!(matches!(err, InitError::Classifier { worker: 0, .. }));
        assert!(FlowMeterConfig::default().create(WORKER).is_ok());
    }
}
