//! Capture trait and related types.

use std::fmt::Debug;

use super::Result;
use super::fanout::FanoutGroupId;
use super::packet::PacketView;

/// Trait for backend-specific capture configuration flags.
pub trait Flags: Clone + Debug + Send + Sync {}

/// Handle that asks a running capture loop to return.
///
/// Waking is sticky: once woken, every later call to [`Capture::run`] on the
/// owning channel returns immediately.
pub trait Wake: Clone + Send + Sync + 'static {
    fn wake(&self);

    fn is_woken(&self) -> bool;
}

/// A capture channel: one receive endpoint that is a member of a fanout group.
///
/// Each backend implements this trait. The channel is owned by exactly one
/// worker thread; only its [`Waker`](Capture::Waker) crosses threads.
///
/// ```ignore
/// let mut sock = Sock::open("eth0", group, &flags)?;
/// let waker = sock.waker();
/// // on another thread: waker.wake();
/// sock.run(|pkt| classify(pkt))?;
/// sock.close();
/// ```
pub trait Capture: Send + Sized + 'static {
    type Flags: Flags;
    type Waker: Wake;

    /// Opens a channel on `device` and joins fanout group `group`.
    fn open(device: &str, group: FanoutGroupId, flags: &Self::Flags) -> Result<Self>;

    /// Blocks, invoking `on_packet` once per received frame, until the
    /// channel's waker fires. The view passed to `on_packet` is only valid
    /// for the duration of the call.
    fn run<F>(&mut self, on_packet: F) -> Result<()>
    where
        F: FnMut(&PacketView<'_>);

    /// Returns a handle that can unblock [`run`](Capture::run) from another thread.
    fn waker(&self) -> Self::Waker;

    /// Releases the channel. Leaving the fanout group happens as part of it.
    fn close(self) {
        drop(self)
    }
}
