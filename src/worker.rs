//! Capture workers and the pool that owns them.
//!
//! A [`Worker`] pairs one capture channel with one classifier instance.
//! [`WorkerPool::init`] builds all of them or none; [`WorkerPool::start`]
//! moves each into its own thread; [`RunningPool::stop`] wakes and joins
//! them, moving their resources back out for release.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::api::{Capture, FanoutGroupId, FlowRecord, Wake};
use crate::classifier::{Classifier, ClassifierFactory, WorkerId};
use crate::errors::InitError;
use crate::queue::Producer;

static SPAWNED: AtomicUsize = AtomicUsize::new(0);

/// Number of worker threads spawned by this process so far.
pub fn spawned_worker_threads() -> usize {
    SPAWNED.load(Ordering::SeqCst)
}

/// Per-worker counters, returned when the worker is joined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub index: usize,
    pub packets: u64,
    pub records: u64,
    /// Set when the capture loop failed or the thread panicked.
    pub error: Option<String>,
}

pub struct Worker<C: Capture> {
    id: WorkerId,
    capture: C,
    classifier: Box<dyn Classifier>,
    producer: Producer,
}

impl<C: Capture> Worker<C> {
    fn open(
        id: WorkerId,
        device: &str,
        group: FanoutGroupId,
        flags: &C::Flags,
        factory: &dyn ClassifierFactory,
        producer: Producer,
    ) -> Result<Self, InitError> {
        let capture = C::open(device, group, flags).map_err(|source| InitError::Capture {
            worker: id.index,
            source,
        })?;
        // On classifier failure `capture` is dropped here, leaving the group.
        let classifier = factory.create(id)?;
        Ok(Self {
            id,
            capture,
            classifier,
            producer,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    fn release(self) {
        debug!(worker = %self.id, "releasing worker");
        self.capture.close();
        drop(self.classifier);
    }

    fn run(self) -> WorkerReport {
        let Worker {
            id,
            mut capture,
            mut classifier,
            producer,
        } = self;
        let mut packets = 0u64;
        let mut records = 0u64;

        let result = capture.run(|pkt| {
            packets += 1;
            classifier.process(pkt, id, &mut |record: FlowRecord| {
                records += 1;
                producer.enqueue(record);
            });
        });
        let error = match result {
            Ok(()) => None,
            Err(e) => {
                error!(worker = %id, error = %e, "capture loop failed");
                Some(e.to_string())
            }
        };

        classifier.flush(&mut |record: FlowRecord| {
            records += 1;
            producer.enqueue(record);
        });
        capture.close();
        drop(classifier);
        drop(producer);

        debug!(worker = %id, packets, records, "worker finished");
        WorkerReport {
            index: id.index,
            packets,
            records,
            error,
        }
    }
}

/// Workers that are initialized but not yet running.
pub struct WorkerPool<C: Capture> {
    workers: Vec<Worker<C>>,
}

impl<C: Capture> WorkerPool<C> {
    /// Opens `count` channels on `group` and creates one classifier per
    /// channel. On failure every worker created so far is released, most
    /// recent first, before the error is returned.
    pub fn init(
        count: usize,
        device: &str,
        group: FanoutGroupId,
        flags: &C::Flags,
        factory: &dyn ClassifierFactory,
        producer: &Producer,
    ) -> Result<Self, InitError> {
        if count == 0 {
            return Err(InitError::NoWorkers);
        }
        let mut workers: Vec<Worker<C>> = Vec::with_capacity(count);
        for index in 0..count {
            let id = WorkerId { index, count };
            match Worker::open(id, device, group, flags, factory, producer.clone()) {
                Ok(worker) => {
                    debug!(worker = %id, device, %group, "worker initialized");
                    workers.push(worker);
                }
                Err(e) => {
                    warn!(worker = %id, error = %e, rollback = workers.len(), "worker init failed");
                    while let Some(worker) = workers.pop() {
                        worker.release();
                    }
                    return Err(e);
                }
            }
        }
        info!(workers = count, device, %group, "worker pool initialized");
        Ok(Self { workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Moves every worker onto its own named thread.
    ///
    /// If a thread can't be spawned, the workers already running are stopped
    /// and the rest are released before the error is returned.
    pub fn start(self) -> Result<RunningPool<C>, InitError> {
        let mut running = RunningPool {
            threads: Vec::with_capacity(self.workers.len()),
        };
        let mut pending = self.workers.into_iter();
        while let Some(worker) = pending.next() {
            let id = worker.id;
            let waker = worker.capture.waker();
            // A failed spawn drops the closure, and with it the worker.
            let spawned = thread::Builder::new()
                .name(format!("ti-worker-{}", id.index))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => {
                    SPAWNED.fetch_add(1, Ordering::SeqCst);
                    running.threads.push(WorkerThread { id, waker, handle });
                }
                Err(e) => {
                    error!(worker = %id, error = %e, "failed to spawn worker thread");
                    pending.for_each(Worker::release);
                    running.stop();
                    return Err(InitError::Spawn(e));
                }
            }
        }
        info!(workers = running.threads.len(), "worker threads started");
        Ok(running)
    }

    /// Releases every worker without running it.
    pub fn release(self) {
        for worker in self.workers.into_iter().rev() {
            worker.release();
        }
    }
}

struct WorkerThread<W> {
    id: WorkerId,
    waker: W,
    handle: JoinHandle<WorkerReport>,
}

/// Workers running on their own threads.
pub struct RunningPool<C: Capture> {
    threads: Vec<WorkerThread<C::Waker>>,
}

impl<C: Capture> RunningPool<C> {
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Wakes every worker, then joins them in order. Blocks until all have
    /// returned; there is no timeout.
    pub fn stop(self) -> Vec<WorkerReport> {
        for t in &self.threads {
            t.waker.wake();
        }
        self.threads
            .into_iter()
            .map(|t| match t.handle.join() {
                Ok(report) => report,
                Err(_) => {
                    error!(worker = %t.id, "worker thread panicked");
                    WorkerReport {
                        index: t.id.index,
                        error: Some("worker thread panicked".to_string()),
                        ..Default::default()
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PacketView;
    use crate::flow::tests::udp_frame;
    use crate::queue;
    use crate::synthetic::{Hub, Sock, SyntheticFlags};
    use std::sync::Arc;
    use std::time::Duration;

    struct Echo;

    impl Classifier for Echo {
        fn process(&mut self, packet: &PacketView<'_>, worker: WorkerId, emit: &mut dyn FnMut(FlowRecord)) {
            emit(FlowRecord::from(format!("{}:{}", worker.index, packet.len)));
        }
    }

    fn echo(_: WorkerId) -> Result<Box<dyn Classifier>, InitError> {
        Ok(Box::new(Echo))
    }

    #[test]
    fn zero_workers_is_rejected() {
        let hub = Hub::new("syn0");
        let (tx, _rx) = queue::channel();
        let flags = SyntheticFlags { hub };
        let err = WorkerPool::<Sock>::init(0, "syn0", FanoutGroupId::from(3), &flags, &echo, &tx)
            .err()
            .unwrap();
        assert!(matches!(err, InitError::NoWorkers));
    }

    #[test]
    fn packets_become_records() {
        let hub = Hub::new("syn0");
        let (tx, rx) = queue::channel();
        let flags = SyntheticFlags { hub: hub.clone() };
        let pool = WorkerPool::<Sock>::init(2, "syn0", FanoutGroupId::from(3), &flags, &echo, &tx).unwrap();
        drop(tx);
        let running = pool.start().unwrap();
        for port in 0..20u16 {
            hub.inject(Duration::from_millis(1), udp_frame([10, 0, 0, 1], port, [10, 0, 0, 2], 53));
        }
        while hub.pending() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        let reports = running.stop();
        assert_eq!(reports.iter().map(|r| r.packets).sum::<u64>(), 20);
        assert!(reports.iter().all(|r| r.error.is_none()));
        assert_eq!(hub.members(), 0);
        let stats = rx.destroy().ok().unwrap();
        assert_eq!(stats.freed, 20);
    }

    #[test]
    fn classifier_failure_rolls_back() {
        let hub = Hub::new("syn0");
        let (tx, _rx) = queue::channel();
        let flags = SyntheticFlags { hub: hub.clone() };
        let created = Arc::new(AtomicUsize::new(0));
        let factory = {
            let created = created.clone();
            move |id: WorkerId| -> Result<Box<dyn Classifier>, InitError> {
                if id.index == 2 {
                    return Err(InitError::Classifier {
                        worker: id.index,
                        reason: "boom".into(),
                    });
                }
                created.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(Echo))
            }
        };
        let err = WorkerPool::<Sock>::init(4, "syn0", FanoutGroupId::from(3), &flags, &factory, &tx)
            .err()
            .unwrap();
        assert!(matches!(err, InitError::Classifier { worker: 2, .. }));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(hub.members(), 0);
    }
}
