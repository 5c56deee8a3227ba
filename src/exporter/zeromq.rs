//! ZeroMQ PUSH transport, matching the collector's PULL socket.

use std::io;

use super::Transport;
use crate::errors::SendError;

/// Milliseconds `close` lets queued messages drain.
const LINGER_MS: i32 = 1000;

pub struct ZmqTransport {
    socket: zmq::Socket,
    // Kept alive for as long as the socket.
    _ctx: zmq::Context,
}

fn io_error(e: zmq::Error) -> io::Error {
    io::Error::other(e)
}

impl ZmqTransport {
    /// Binds a PUSH socket to `endpoint` with `ZMQ_SNDHWM = hwm`.
    pub fn bind(endpoint: &str, hwm: usize) -> io::Result<Self> {
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::PUSH).map_err(io_error)?;
        let hwm = i32::try_from(hwm).unwrap_or(i32::MAX);
        socket.set_sndhwm(hwm).map_err(io_error)?;
        socket.bind(endpoint).map_err(io_error)?;
        Ok(Self { socket, _ctx: ctx })
    }

    /// The endpoint actually bound, with wildcards resolved.
    pub fn local_endpoint(&self) -> Option<String> {
        self.socket.get_last_endpoint().ok()?.ok()
    }
}

impl Transport for ZmqTransport {
    fn try_send(&mut self, payload: &[u8]) -> Result<(), SendError> {
        match self.socket.send(payload, zmq::DONTWAIT) {
            Ok(()) => Ok(()),
            Err(zmq::Error::EAGAIN) => Err(SendError::WouldBlock),
            Err(e) => Err(SendError::Fatal(io_error(e))),
        }
    }

    fn close(&mut self) {
        let _ = self.socket.set_linger(LINGER_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn pull_socket_receives_pushed_records() {
        let mut push = ZmqTransport::bind("tcp://127.0.0.1:*", 10).unwrap();
        let endpoint = push.local_endpoint().unwrap();
        let ctx = zmq::Context::new();
        let pull = ctx.socket(zmq::PULL).unwrap();
        pull.set_rcvtimeo(2000).unwrap();
        pull.connect(&endpoint).unwrap();

        // The PUSH side has no peer until the connect completes.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match push.try_send(b"{\"uuid\":\"a\"}") {
                Ok(()) => break,
                Err(SendError::WouldBlock) => {
                    assert!(Instant::now() < deadline, "pull socket never connected");
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        push.try_send(b"{\"uuid\":\"b\"}").unwrap();
        assert_eq!(pull.recv_bytes(0).unwrap(), b"{\"uuid\":\"a\"}");
        assert_eq!(pull.recv_bytes(0).unwrap(), b"{\"uuid\":\"b\"}");
        push.close();
    }

    #[test]
    fn no_peer_means_would_block() {
        let mut push = ZmqTransport::bind("inproc://ti-exporter-no-peer", 1).unwrap();
        assert!(matches!(push.try_send(b"x"), Err(SendError::WouldBlock)));
        push.close();
    }
}
