//! The probe: queue, worker pool and exporter of one run.

use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::api::{Capture, FanoutGroupId};
use crate::classifier::ClassifierFactory;
use crate::errors::InitError;
use crate::exporter::{Exporter, ExporterSession, ExporterStats, Transport};
use crate::queue::{self, QueueStats};
use crate::shutdown::{ShutdownSignal, State};
use crate::worker::{RunningPool, WorkerPool, WorkerReport};

/// Fallback wake-up period of the control loop.
pub const CONTROL_POLL: Duration = Duration::from_secs(1);

/// Counters of a finished run.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub workers: Vec<WorkerReport>,
    pub exporter: ExporterStats,
    pub queue: QueueStats,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn packets(&self) -> u64 {
        self.workers.iter().map(|w| w.packets).sum()
    }

    pub fn records(&self) -> u64 {
        self.workers.iter().map(|w| w.records).sum()
    }

    /// Every enqueued record was sent, dropped or freed at destroy.
    pub fn is_balanced(&self) -> bool {
        self.queue.enqueued == self.exporter.sent + self.exporter.dropped + self.queue.freed
    }
}

pub struct Probe<C: Capture> {
    pool: RunningPool<C>,
    exporter: Exporter,
    state: State,
    started: Instant,
}

impl<C: Capture> Probe<C> {
    /// Creates the queue, initializes all workers, starts the exporter and
    /// then the worker threads. Nothing is left running on failure.
    pub fn launch<T>(
        workers: usize,
        device: &str,
        group: FanoutGroupId,
        flags: &C::Flags,
        factory: &dyn ClassifierFactory,
        session: ExporterSession<T>,
    ) -> Result<Self, InitError>
    where
        T: Transport + 'static,
    {
        let started = Instant::now();
        let (producer, consumer) = queue::channel();
        let pool = WorkerPool::<C>::init(workers, device, group, flags, factory, &producer)?;
        drop(producer);

        let exporter = match Exporter::start(session, consumer) {
            Ok(exporter) => exporter,
            Err(e) => {
                pool.release();
                return Err(e);
            }
        };
        let pool = match pool.start() {
            Ok(pool) => pool,
            Err(e) => {
                if exporter.stop().is_err() {
                    error!("exporter thread panicked");
                }
                return Err(e);
            }
        };
        info!(event.name = "probe.started", workers, device, %group, "probe running");
        Ok(Self {
            pool,
            exporter,
            state: State::Running,
            started,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn workers(&self) -> usize {
        self.pool.len()
    }

    /// Blocks until `signal` requests a stop.
    pub fn run_until(&mut self, signal: &ShutdownSignal) {
        signal.wait(CONTROL_POLL);
        self.state = State::StopRequested;
    }

    /// Joins every worker, then drains and joins the exporter, then destroys
    /// the queue. Blocks for as long as any of them takes.
    pub fn shutdown(mut self) -> ShutdownReport {
        self.state = State::Draining;
        info!(event.name = "probe.draining", state = %self.state, "stopping workers");
        let workers = self.pool.stop();

        let (exporter, queue) = match self.exporter.stop() {
            Ok((consumer, exporter)) => match consumer.destroy() {
                Ok(queue) => (exporter, queue),
                Err(consumer) => {
                    error!(pending = consumer.len(), "queue still has producers");
                    (exporter, QueueStats::default())
                }
            },
            Err(_) => {
                error!("exporter thread panicked");
                Default::default()
            }
        };

        let report = ShutdownReport {
            workers,
            exporter,
            queue,
            elapsed: self.started.elapsed(),
        };
        info!(
            event.name = "probe.stopped",
            state = %State::Stopped,
            packets = report.packets(),
            records = report.records(),
            sent = report.exporter.sent,
            retried = report.exporter.retried,
            dropped = report.exporter.dropped,
            freed = report.queue.freed,
            "probe stopped"
        );
        report
    }
}
