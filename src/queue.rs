//! Multi-producer / single-consumer handoff of flow records.
//!
//! Producers never block: the queue is an unbounded lock-free segment queue.
//! The consumer side is a single non-`Clone` handle, and destroying the
//! queue requires every producer to be gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use triomphe::Arc;

use crate::api::FlowRecord;

/// Sleep applied by consumers between empty polls.
pub const IDLE_BACKOFF: Duration = Duration::from_millis(1);

struct Shared {
    records: SegQueue<FlowRecord>,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
}

/// Counters of a queue at the time it was destroyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    /// Records still pending at destroy time, freed without delivery.
    pub freed: u64,
}

#[derive(Clone)]
pub struct Producer {
    shared: Arc<Shared>,
}

impl Producer {
    /// Takes ownership of `record`. Never blocks.
    #[inline]
    pub fn enqueue(&self, record: FlowRecord) {
        self.shared.records.push(record);
        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    /// Next pending record, if any. Hands ownership to the caller.
    #[inline]
    pub fn dequeue(&self) -> Option<FlowRecord> {
        let record = self.shared.records.pop()?;
        self.shared.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.shared.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.records.is_empty()
    }

    /// Frees every pending record and returns the final counters.
    ///
    /// Fails, handing the consumer back, while any [`Producer`] is alive.
    pub fn destroy(self) -> Result<QueueStats, Consumer> {
        let shared = Arc::try_unwrap(self.shared).map_err(|shared| Consumer { shared })?;
        let mut freed = 0;
        while let Some(record) = shared.records.pop() {
            drop(record);
            freed += 1;
        }
        Ok(QueueStats {
            enqueued: shared.enqueued.into_inner(),
            dequeued: shared.dequeued.into_inner(),
            freed,
        })
    }
}

pub fn channel() -> (Producer, Consumer) {
    let shared = Arc::new(Shared {
        records: SegQueue::new(),
        enqueued: AtomicU64::new(0),
        dequeued: AtomicU64::new(0),
    });
    (
        Producer {
            shared: shared.clone(),
        },
        Consumer { shared },
    )
}
