//! Per-packet view handed to classifiers.

use std::time::Duration;

/// Borrowed view of one received frame.
///
/// Borrows the backend's slot, so it cannot outlive the callback it was
/// passed to.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    /// Capture time, relative to the Unix epoch.
    pub timestamp: Duration,
    /// Bytes available in `data` (may be less than `len` when truncated).
    pub caplen: u32,
    /// Original on-wire length.
    pub len: u32,
    pub data: &'a [u8],
}

impl<'a> PacketView<'a> {
    pub fn new(timestamp: Duration, len: u32, data: &'a [u8]) -> Self {
        Self {
            timestamp,
            caplen: data.len() as u32,
            len: len.max(data.len() as u32),
            data,
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.caplen < self.len
    }
}
