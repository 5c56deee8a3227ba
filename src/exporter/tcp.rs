//! Framed TCP push transport.
//!
//! Each message is sent as a big-endian `u32` length followed by the
//! payload. Writes are non-blocking; messages the socket can't take yet wait
//! in a user-space buffer bounded by the high-water-mark. Buffered messages
//! lost with the connection are reported through
//! [`Transport::take_discarded`].

use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::Transport;
use crate::errors::SendError;

/// Minimum delay between reconnect attempts after a broken connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long `close` may block flushing what is still buffered.
const LINGER: Duration = Duration::from_secs(1);

/// Upper bound on one connect attempt, so a dead collector can't stall the
/// exporter thread.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

pub struct TcpTransport {
    addr: String,
    peer: SocketAddr,
    hwm: usize,
    stream: Option<TcpStream>,
    pending: VecDeque<Vec<u8>>,
    /// Bytes of `pending.front()` already written.
    offset: usize,
    retry_at: Option<Instant>,
    /// Buffered messages thrown away since the last `take_discarded`.
    discarded: u64,
}

fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("'{addr}' resolved to no address"),
        )
    })
}

fn open(peer: &SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(peer, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}

fn frame(payload: &[u8]) -> io::Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record larger than 4 GiB"))?;
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

impl TcpTransport {
    /// Connects to `addr` (`host:port`). The name is resolved once; each
    /// connect attempt gives up after [`CONNECT_TIMEOUT`]. At most `hwm`
    /// messages are kept pending before `try_send` reports would-block.
    pub fn connect(addr: &str, hwm: usize) -> io::Result<Self> {
        let peer = resolve(addr)?;
        let stream = open(&peer)?;
        Ok(Self {
            addr: addr.to_string(),
            peer,
            hwm: hwm.max(1),
            stream: Some(stream),
            pending: VecDeque::new(),
            offset: 0,
            retry_at: None,
            discarded: 0,
        })
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn discard_pending(&mut self) {
        self.discarded += self.pending.len() as u64;
        self.pending.clear();
        self.offset = 0;
    }

    fn reset(&mut self, err: &io::Error) {
        warn!(addr = %self.addr, lost = self.pending.len(), error = %err, "collector connection lost");
        self.stream = None;
        self.discard_pending();
        self.retry_at = Some(Instant::now() + RECONNECT_DELAY);
    }

    fn ensure_connected(&mut self) -> io::Result<&mut TcpStream> {
        if self.stream.is_none() {
            if self.retry_at.is_some_and(|at| Instant::now() < at) {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "collector unreachable"));
            }
            match open(&self.peer) {
                Ok(stream) => {
                    debug!(addr = %self.addr, "reconnected to collector");
                    self.retry_at = None;
                    self.stream = Some(stream);
                }
                Err(e) => {
                    self.retry_at = Some(Instant::now() + RECONNECT_DELAY);
                    return Err(e);
                }
            }
        }
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    /// Writes as much of the pending buffer as the socket accepts.
    fn flush_pending(&mut self) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        while let Some(front) = self.pending.front() {
            match stream.write(&front[self.offset..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.offset += n;
                    if self.offset == front.len() {
                        self.pending.pop_front();
                        self.offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn try_send(&mut self, payload: &[u8]) -> Result<(), SendError> {
        self.ensure_connected()?;
        if let Err(e) = self.flush_pending() {
            self.reset(&e);
            return Err(e.into());
        }
        if self.pending.len() >= self.hwm {
            return Err(SendError::WouldBlock);
        }
        self.pending.push_back(frame(payload)?);
        // Once buffered the message is accepted; losing it now counts as a
        // discard, not as a failed send.
        if let Err(e) = self.flush_pending() {
            self.reset(&e);
        }
        Ok(())
    }

    fn take_discarded(&mut self) -> u64 {
        std::mem::take(&mut self.discarded)
    }

    fn close(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        let lingered = stream
            .set_nonblocking(false)
            .and_then(|()| stream.set_write_timeout(Some(LINGER)))
            .and_then(|()| {
                let mut stream = &stream;
                let mut offset = self.offset;
                for msg in &self.pending {
                    stream.write_all(&msg[offset..])?;
                    offset = 0;
                }
                stream.flush()
            });
        match lingered {
            Ok(()) => {
                self.pending.clear();
                self.offset = 0;
            }
            Err(e) => {
                warn!(addr = %self.addr, pending = self.pending.len(), error = %e, "unsent records discarded");
                self.discard_pending();
            }
        }
        let _ = stream.shutdown(Shutdown::Both);
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
