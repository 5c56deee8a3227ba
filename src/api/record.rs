//! Owned flow summaries travelling from classifiers to the exporter.

use std::fmt;
use std::ops::Deref;

/// A serialized flow summary.
///
/// Move-only: the classifier hands it to the queue, the queue hands it to
/// the exporter, and it is freed exactly once when the last owner drops it.
#[derive(PartialEq, Eq)]
pub struct FlowRecord(Box<[u8]>);

impl FlowRecord {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Box<[u8]> {
        self.0
    }
}

impl From<Vec<u8>> for FlowRecord {
    fn from(val: Vec<u8>) -> Self {
        Self(val.into_boxed_slice())
    }
}

impl From<String> for FlowRecord {
    fn from(val: String) -> Self {
        Self(val.into_bytes().into_boxed_slice())
    }
}

impl From<&str> for FlowRecord {
    fn from(val: &str) -> Self {
        Self(Box::from(val.as_bytes()))
    }
}

impl Deref for FlowRecord {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.debug_tuple("FlowRecord").field(&s).finish(),
            Err(_) => f.debug_tuple("FlowRecord").field(&self.0.len()).finish(),
        }
    }
}
