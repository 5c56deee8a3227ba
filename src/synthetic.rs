//! In-memory capture backend.
//!
//! A [`Hub`] plays the role of the kernel fanout group: frames injected into
//! it are assigned to one member by the symmetric flow hash, so both
//! directions of a flow always reach the same [`Sock`]. Used to drive the
//! pipeline without a NIC or privileges.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;
use triomphe::Arc;

use crate::api::{self, Capture, FanoutGroupId, PacketView, Wake};
use crate::errors::CaptureError;
use crate::flow::FlowPacket;

struct Frame {
    timestamp: Duration,
    data: Vec<u8>,
}

struct Mailbox {
    id: usize,
    frames: Mutex<VecDeque<Frame>>,
    ready: Condvar,
    woken: AtomicBool,
}

struct HubInner {
    device: String,
    group: Mutex<Option<FanoutGroupId>>,
    members: Mutex<Vec<Arc<Mailbox>>>,
    next_id: AtomicUsize,
    /// Joins allowed before `open` starts failing; `usize::MAX` means unlimited.
    join_budget: AtomicUsize,
}

/// An emulated fanout group bound to one device name.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(device: &str) -> Self {
        Self {
            inner: Arc::new(HubInner {
                device: device.to_string(),
                group: Mutex::new(None),
                members: Mutex::new(Vec::new()),
                next_id: AtomicUsize::new(0),
                join_budget: AtomicUsize::new(usize::MAX),
            }),
        }
    }

    /// Makes every join after the first `joins` fail with `FanoutJoinFailed`.
    pub fn fail_joins_after(&self, joins: usize) {
        self.inner.join_budget.store(joins, Ordering::SeqCst);
    }

    /// Number of channels currently joined.
    pub fn members(&self) -> usize {
        self.inner.members.lock().len()
    }

    /// Frames queued but not yet received, across all members.
    pub fn pending(&self) -> usize {
        self.inner
            .members
            .lock()
            .iter()
            .map(|m| m.frames.lock().len())
            .sum()
    }

    /// Hands a frame to the member its flow hashes to. Non-IP frames go to
    /// the first member. Returns the member slot, or `None` without members.
    pub fn inject(&self, timestamp: Duration, data: Vec<u8>) -> Option<usize> {
        let members = self.inner.members.lock();
        if members.is_empty() {
            return None;
        }
        let slot = FlowPacket::parse(&data)
            .map(|pkt| (pkt.key().fanout_hash() % members.len() as u64) as usize)
            .unwrap_or(0);
        let mailbox = &members[slot];
        mailbox.frames.lock().push_back(Frame { timestamp, data });
        mailbox.ready.notify_one();
        Some(slot)
    }

    fn join(&self, group: FanoutGroupId) -> api::Result<Arc<Mailbox>> {
        {
            let mut current = self.inner.group.lock();
            match *current {
                Some(g) if g != group => {
                    return Err(CaptureError::FanoutJoinFailed {
                        group: group.into(),
                        source: std::io::Error::other(format!("hub already bound to group {g}")),
                    });
                }
                _ => *current = Some(group),
            }
        }
        let admitted = self
            .inner
            .join_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                usize::MAX => Some(n),
                0 => None,
                n => Some(n - 1),
            });
        if admitted.is_err() {
            return Err(CaptureError::FanoutJoinFailed {
                group: group.into(),
                source: std::io::Error::other("join rejected"),
            });
        }
        let mailbox = Arc::new(Mailbox {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            frames: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            woken: AtomicBool::new(false),
        });
        self.inner.members.lock().push(mailbox.clone());
        Ok(mailbox)
    }

    fn leave(&self, id: usize) {
        let mut members = self.inner.members.lock();
        members.retain(|m| m.id != id);
        if members.is_empty() {
            *self.inner.group.lock() = None;
        }
    }
}

/// -------- Flags ------------------------------------------------------------------

#[derive(Clone)]
pub struct SyntheticFlags {
    pub hub: Hub,
}

impl std::fmt::Debug for SyntheticFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticFlags")
            .field("device", &self.hub.inner.device)
            .finish()
    }
}

impl api::Flags for SyntheticFlags {}

/// -------- Waker ------------------------------------------------------------------

#[derive(Clone)]
pub struct Waker {
    mailbox: Arc<Mailbox>,
}

impl Wake for Waker {
    fn wake(&self) {
        self.mailbox.woken.store(true, Ordering::Release);
        // Taking the lock orders the flag store before a concurrent wait.
        let _frames = self.mailbox.frames.lock();
        self.mailbox.ready.notify_all();
    }

    fn is_woken(&self) -> bool {
        self.mailbox.woken.load(Ordering::Acquire)
    }
}

/// -------- Socket -----------------------------------------------------------------

pub struct Sock {
    hub: Hub,
    mailbox: Arc<Mailbox>,
}

impl Capture for Sock {
    type Flags = SyntheticFlags;
    type Waker = Waker;

    fn open(device: &str, group: FanoutGroupId, flags: &Self::Flags) -> api::Result<Self> {
        if device != flags.hub.inner.device {
            return Err(CaptureError::NoSuchDevice(device.to_string()));
        }
        let mailbox = flags.hub.join(group)?;
        debug!(device, %group, member = mailbox.id, "synthetic channel joined");
        Ok(Self {
            hub: flags.hub.clone(),
            mailbox,
        })
    }

    fn run<F>(&mut self, mut on_packet: F) -> api::Result<()>
    where
        F: FnMut(&PacketView<'_>),
    {
        loop {
            let frame = {
                let mut frames = self.mailbox.frames.lock();
                loop {
                    if self.mailbox.woken.load(Ordering::Acquire) {
                        return Ok(());
                    }
                    if let Some(frame) = frames.pop_front() {
                        break frame;
                    }
                    self.mailbox.ready.wait(&mut frames);
                }
            };
            let view = PacketView::new(frame.timestamp, frame.data.len() as u32, &frame.data);
            on_packet(&view);
        }
    }

    fn waker(&self) -> Self::Waker {
        Waker {
            mailbox: self.mailbox.clone(),
        }
    }
}

impl Drop for Sock {
    fn drop(&mut self) {
        self.hub.leave(self.mailbox.id);
    }
}
