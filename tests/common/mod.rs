#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use etherparse::PacketBuilder;
use parking_lot::Mutex;

use traffic_inspector::api::{FlowRecord, PacketView};
use traffic_inspector::classifier::{Classifier, WorkerId};
use traffic_inspector::errors::SendError;
use traffic_inspector::exporter::Transport;

pub fn udp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4(src, dst, 64)
        .udp(sport, dport);
    let payload = [0xabu8; 32];
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, &payload).unwrap();
    out
}

pub fn tcp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4(src, dst, 64)
        .tcp(sport, dport, 1, 8192);
    let payload = [0u8; 16];
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, &payload).unwrap();
    out
}

/// Emits one record per packet: `"<worker index>:<on-wire length>"`.
pub struct PerPacket;

impl Classifier for PerPacket {
    fn process(&mut self, packet: &PacketView<'_>, worker: WorkerId, emit: &mut dyn FnMut(FlowRecord)) {
        emit(FlowRecord::from(format!("{}:{}", worker.index, packet.len)));
    }
}

/// Counts how many instances are alive.
pub struct Tracked {
    live: Arc<AtomicUsize>,
}

impl Tracked {
    pub fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self { live: live.clone() }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Classifier for Tracked {
    fn process(&mut self, _packet: &PacketView<'_>, _worker: WorkerId, _emit: &mut dyn FnMut(FlowRecord)) {}
}

/// In-memory transport. Scripted outcomes are consumed first; once they run
/// out every send succeeds.
#[derive(Clone, Default)]
pub struct MockTransport {
    pub script: Arc<Mutex<VecDeque<Result<(), SendError>>>>,
    pub delivered: Arc<Mutex<Vec<Vec<u8>>>>,
    pub always_block: bool,
}

impl MockTransport {
    pub fn blocking_for(times: usize) -> Self {
        let mock = Self::default();
        mock.script
            .lock()
            .extend((0..times).map(|_| Err(SendError::WouldBlock)));
        mock
    }

    pub fn delivered(&self) -> Vec<Vec<u8>> {
        self.delivered.lock().clone()
    }
}

impl Transport for MockTransport {
    fn try_send(&mut self, payload: &[u8]) -> Result<(), SendError> {
        if self.always_block {
            return Err(SendError::WouldBlock);
        }
        let outcome = self.script.lock().pop_front().unwrap_or(Ok(()));
        if outcome.is_ok() {
            self.delivered.lock().push(payload.to_vec());
        }
        outcome
    }
}
