//! Classifier interface.
//!
//! A classifier instance belongs to exactly one worker. It sees every packet
//! its worker receives, keeps whatever per-flow state it needs, and emits
//! [`FlowRecord`]s whenever a flow is ready to report.

mod meter;

use std::fmt;

use crate::api::{FlowRecord, PacketView};
use crate::errors::InitError;

pub use meter::{FlowMeter, FlowMeterConfig, GeoLookup};

/// Position of a worker within its pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkerId {
    pub index: usize,
    pub count: usize,
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}

pub trait Classifier: Send {
    /// Called synchronously for every received frame.
    fn process(&mut self, packet: &PacketView<'_>, worker: WorkerId, emit: &mut dyn FnMut(FlowRecord));

    /// Called once after the worker's capture loop has returned.
    fn flush(&mut self, _emit: &mut dyn FnMut(FlowRecord)) {}
}

/// Builds one classifier per worker.
pub trait ClassifierFactory: Send + Sync {
    fn create(&self, worker: WorkerId) -> Result<Box<dyn Classifier>, InitError>;
}

impl<F> ClassifierFactory for F
where
    F: Fn(WorkerId) -> Result<Box<dyn Classifier>, InitError> + Send + Sync,
{
    fn create(&self, worker: WorkerId) -> Result<Box<dyn Classifier>, InitError> {
        self(worker)
    }
}
