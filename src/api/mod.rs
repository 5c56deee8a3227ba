//! Backend-neutral capture API.
//!
//! A capture backend provides a [`Capture`] implementation; everything above
//! it (workers, classifiers, the queue) only depends on the traits and types
//! re-exported here.

mod fanout;
mod packet;
mod record;
mod socket;

pub use fanout::FanoutGroupId;
pub use packet::PacketView;
pub use record::FlowRecord;
pub use socket::{Capture, Flags, Wake};

pub type Result<T> = std::result::Result<T, crate::errors::CaptureError>;
