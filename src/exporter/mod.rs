//! Forwarding of flow records to the collector.
//!
//! One exporter thread drains the record queue and pushes every record
//! through a non-blocking [`Transport`]. A transport at its high-water-mark
//! reports [`SendError::WouldBlock`]; the exporter then sleeps for
//! [`RETRY_BACKOFF`] and offers the same record again. Any other failure
//! drops the record: delivery is best-effort.

pub mod tcp;
#[cfg(feature = "zmq")]
pub mod zeromq;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};
use triomphe::Arc;

use crate::errors::{ConnectError, InitError, SendError};
use crate::queue::{self, Consumer};

/// Default bound on messages outstanding in a transport.
pub const DEFAULT_SEND_HWM: usize = 1000;

/// Sleep between attempts to send a record the transport refused.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(1);

pub trait Transport: Send {
    /// Offers one message without blocking.
    fn try_send(&mut self, payload: &[u8]) -> Result<(), SendError>;

    /// Number of previously accepted messages the transport has since
    /// thrown away, reset to zero by the call.
    fn take_discarded(&mut self) -> u64 {
        0
    }

    /// Flushes what can still be flushed and releases the transport.
    fn close(&mut self) {}
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn try_send(&mut self, payload: &[u8]) -> Result<(), SendError> {
        (**self).try_send(payload)
    }

    fn take_discarded(&mut self) -> u64 {
        (**self).take_discarded()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// An open transport plus the endpoint it talks to.
pub struct ExporterSession<T> {
    endpoint: String,
    transport: T,
}

impl<T: Transport> ExporterSession<T> {
    pub fn new(endpoint: impl Into<String>, transport: T) -> Self {
        Self {
            endpoint: endpoint.into(),
            transport,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Closes the transport and returns how many accepted messages it
    /// discarded while closing.
    pub fn close(mut self) -> u64 {
        self.transport.close();
        let discarded = self.transport.take_discarded();
        debug!(endpoint = %self.endpoint, discarded, "exporter session closed");
        discarded
    }
}

const FRAMED_TCP: &str = "tcp+framed://";

#[cfg(feature = "zmq")]
const ZMQ_SCHEMES: [&str; 3] = ["tcp://", "ipc://", "inproc://"];

/// Opens a session for `endpoint`.
///
/// `tcp://`, `ipc://` and `inproc://` endpoints bind a ZeroMQ PUSH socket
/// for the collector's PULL socket to connect to (`zmq` feature, on by
/// default). `tcp+framed://host:port` connects the length-prefixed TCP
/// transport instead.
pub fn connect(endpoint: &str, send_hwm: usize) -> Result<ExporterSession<Box<dyn Transport>>, ConnectError> {
    let io_err = |source| ConnectError::Io {
        endpoint: endpoint.to_string(),
        source,
    };
    if let Some(addr) = endpoint.strip_prefix(FRAMED_TCP) {
        let transport = tcp::TcpTransport::connect(addr, send_hwm).map_err(io_err)?;
        info!(endpoint, send_hwm, "connected to collector");
        return Ok(ExporterSession::new(endpoint, Box::new(transport)));
    }
    #[cfg(feature = "zmq")]
    if ZMQ_SCHEMES.iter().any(|scheme| endpoint.starts_with(scheme)) {
        let transport = zeromq::ZmqTransport::bind(endpoint, send_hwm).map_err(io_err)?;
        let bound = transport.local_endpoint();
        info!(endpoint, bound = bound.as_deref(), send_hwm, "zmq push socket bound");
        return Ok(ExporterSession::new(endpoint, Box::new(transport)));
    }
    Err(ConnectError::UnsupportedEndpoint(endpoint.to_string()))
}

/// True when [`connect`] understands the scheme of `endpoint`.
pub fn supports_endpoint(endpoint: &str) -> bool {
    #[cfg(feature = "zmq")]
    if ZMQ_SCHEMES.iter().any(|scheme| endpoint.starts_with(scheme)) {
        return true;
    }
    endpoint.starts_with(FRAMED_TCP)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExporterStats {
    pub sent: u64,
    /// Would-block events; one record may be retried many times.
    pub retried: u64,
    pub dropped: u64,
}

impl ExporterStats {
    /// Moves `n` records the transport accepted but later lost from
    /// `sent` to `dropped`.
    fn discard(&mut self, n: u64) {
        let n = n.min(self.sent);
        self.sent -= n;
        self.dropped += n;
    }
}

/// The running exporter thread.
pub struct Exporter {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<(Consumer, ExporterStats)>,
}

impl Exporter {
    pub fn start<T>(session: ExporterSession<T>, consumer: Consumer) -> Result<Self, InitError>
    where
        T: Transport + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("ti-exporter".to_string())
                .spawn(move || run(session, consumer, &stop))
                .map_err(InitError::Spawn)?
        };
        Ok(Self { stop, handle })
    }

    /// Asks the exporter to drain the queue and return, then joins it.
    ///
    /// Once asked to stop, a record the transport keeps refusing is dropped
    /// instead of retried.
    pub fn stop(self) -> std::thread::Result<(Consumer, ExporterStats)> {
        self.stop.store(true, Ordering::Release);
        self.handle.join()
    }
}

/// Drains `consumer` into `session` until `stop` is set and the queue is
/// empty. Returns the consumer so the caller can destroy the queue.
pub fn run<T: Transport>(
    mut session: ExporterSession<T>,
    consumer: Consumer,
    stop: &AtomicBool,
) -> (Consumer, ExporterStats) {
    let mut stats = ExporterStats::default();
    debug!(endpoint = session.endpoint(), "exporter running");
    loop {
        let Some(record) = consumer.dequeue() else {
            if stop.load(Ordering::Acquire) {
                break;
            }
            thread::sleep(queue::IDLE_BACKOFF);
            continue;
        };
        loop {
            let outcome = session.transport.try_send(record.as_bytes());
            if outcome.is_ok() {
                stats.sent += 1;
            }
            stats.discard(session.transport.take_discarded());
            match outcome {
                Ok(()) => break,
                Err(SendError::WouldBlock) => {
                    if stop.load(Ordering::Acquire) {
                        stats.dropped += 1;
                        break;
                    }
                    stats.retried += 1;
                    thread::sleep(RETRY_BACKOFF);
                }
                Err(SendError::Fatal(e)) => {
                    warn!(endpoint = session.endpoint(), error = %e, "dropping flow record");
                    stats.dropped += 1;
                    break;
                }
            }
        }
    }
    let endpoint = session.endpoint().to_string();
    stats.discard(session.close());
    info!(
        endpoint,
        sent = stats.sent,
        retried = stats.retried,
        dropped = stats.dropped,
        "exporter drained"
    );
    (consumer, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::FlowRecord;
    use std::io;

    struct Flaky {
        outcomes: Vec<Result<(), SendError>>,
        delivered: Vec<Vec<u8>>,
    }

    impl Transport for &mut Flaky {
        fn try_send(&mut self, payload: &[u8]) -> Result<(), SendError> {
            let outcome = if self.outcomes.is_empty() {
                Ok(())
            } else {
                self.outcomes.remove(0)
            };
            if outcome.is_ok() {
                self.delivered.push(payload.to_vec());
            }
            outcome
        }
    }

    #[test]
    fn fatal_errors_drop_and_continue() {
        let mut flaky = Flaky {
            outcomes: vec![Err(SendError::Fatal(io::Error::other("gone")))],
            delivered: Vec::new(),
        };
        let (tx, rx) = queue::channel();
        tx.enqueue(FlowRecord::from("a"));
        tx.enqueue(FlowRecord::from("b"));
        drop(tx);
        let stop = AtomicBool::new(true);
        let (rx, stats) = run(ExporterSession::new("mock", &mut flaky), rx, &stop);
        assert_eq!(stats, ExporterStats { sent: 1, retried: 0, dropped: 1 });
        assert_eq!(flaky.delivered, vec![b"b".to_vec()]);
        assert_eq!(rx.destroy().ok().unwrap().freed, 0);
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(matches!(
            connect("udp://127.0.0.1:1", 10).err().unwrap(),
            ConnectError::UnsupportedEndpoint(_)
        ));
        assert!(supports_endpoint("tcp+framed://collector:5556"));
        assert!(!supports_endpoint("collector:5556"));
        assert_eq!(supports_endpoint("tcp://*:5556"), cfg!(feature = "zmq"));
        assert_eq!(supports_endpoint("ipc:///tmp/flows"), cfg!(feature = "zmq"));
    }

    struct Lossy {
        accepted: u64,
        lose_on_close: bool,
        discarded: u64,
    }

    impl Transport for Lossy {
        fn try_send(&mut self, _payload: &[u8]) -> Result<(), SendError> {
            self.accepted += 1;
            if self.accepted == 3 {
                // connection reset: the two buffered records and this one are gone
                self.discarded += 3;
            }
            Ok(())
        }

        fn take_discarded(&mut self) -> u64 {
            std::mem::take(&mut self.discarded)
        }

        fn close(&mut self) {
            if self.lose_on_close {
                self.discarded += self.accepted - 3;
            }
        }
    }

    #[test]
    fn discarded_records_count_as_dropped() {
        let (tx, rx) = queue::channel();
        for i in 0..5 {
            tx.enqueue(FlowRecord::from(format!("{i}")));
        }
        drop(tx);
        let stop = AtomicBool::new(true);
        let lossy = Lossy {
            accepted: 0,
            lose_on_close: true,
            discarded: 0,
        };
        let (rx, stats) = run(ExporterSession::new("lossy", lossy), rx, &stop);
        assert_eq!(stats, ExporterStats { sent: 0, retried: 0, dropped: 5 });
        assert_eq!(rx.destroy().ok().unwrap().enqueued, 5);

        let (tx, rx) = queue::channel();
        for i in 0..5 {
            tx.enqueue(FlowRecord::from(format!("{i}")));
        }
        drop(tx);
        let lossy = Lossy {
            accepted: 0,
            lose_on_close: false,
            discarded: 0,
        };
        let (_rx, stats) = run(ExporterSession::new("lossy", lossy), rx, &stop);
        assert_eq!(stats, ExporterStats { sent: 2, retried: 0, dropped: 3 });
    }
}
