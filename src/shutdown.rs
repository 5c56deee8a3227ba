//! Process-wide shutdown request.
//!
//! SIGINT/SIGTERM only set the flag and notify; the control loop waits on
//! the notification and performs the teardown itself.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, const_mutex};
use tracing::info;

use crate::errors::Error;

/// Lifecycle of a probe run. Transitions are linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Running,
    StopRequested,
    Draining,
    Stopped,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Running => "running",
            State::StopRequested => "stop-requested",
            State::Draining => "draining",
            State::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

pub struct ShutdownSignal {
    requested: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

static GLOBAL: ShutdownSignal = ShutdownSignal::new();

impl ShutdownSignal {
    pub const fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            lock: const_mutex(()),
            cv: Condvar::new(),
        }
    }

    /// The flag written by the signal handlers.
    pub fn global() -> &'static ShutdownSignal {
        &GLOBAL
    }

    /// Routes SIGINT and SIGTERM to [`request`](Self::request).
    pub fn install_handlers(&'static self) -> Result<(), Error> {
        ctrlc::set_handler(move || self.request())?;
        Ok(())
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let _guard = self.lock.lock();
        self.cv.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Waits until a stop is requested or `timeout` passes. Returns whether
    /// a stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.lock.lock();
        if !self.is_requested() {
            let _ = self.cv.wait_for(&mut guard, timeout);
        }
        self.is_requested()
    }

    /// Blocks until a stop is requested, re-checking every `poll` in case a
    /// notification is missed.
    pub fn wait(&self, poll: Duration) {
        while !self.wait_timeout(poll) {}
        info!(event.name = "shutdown.requested", "stop requested");
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
