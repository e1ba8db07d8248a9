/// Worker — the polling loop that drives `process_queue`.
///
/// One worker per database. Each iteration leases at most one job; when the
/// queue is idle the worker sleeps for the poll interval plus a random
/// jitter. Stale leases are recovered at start-up and again whenever the
/// queue looks idle and a lease timeout has passed since the last sweep.
/// A job in flight is always finished before shutdown is honoured.
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::error::ServiceError;
use crate::service::engine::WorldEngine;
use crate::service::workflow::QueueOutcome;

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub succeeded: u64,
    pub failed: u64,
    pub lease_lost: u64,
    pub idle_polls: u64,
    pub store_errors: u64,
    /// Stale leases failed by recovery sweeps.
    pub recovered: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &QueueOutcome) {
        match outcome {
            QueueOutcome::Idle => self.idle_polls += 1,
            QueueOutcome::Succeeded { .. } => self.succeeded += 1,
            QueueOutcome::Failed { .. } => self.failed += 1,
            QueueOutcome::LeaseLost { .. } => self.lease_lost += 1,
            QueueOutcome::StoreUnavailable(_) => self.store_errors += 1,
        }
    }
}

pub struct Worker {
    engine: WorldEngine,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(engine: WorldEngine, config: WorkerConfig) -> Self {
        Self { engine, config }
    }

    /// Fail jobs left `RUNNING` by a previous process.
    pub fn recover(&self) -> Result<usize, ServiceError> {
        let recovered = self
            .engine
            .recover_stale_leases(Duration::from_secs(self.config.lease_timeout_secs))?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "recovered stale leases");
        }
        Ok(recovered.len())
    }

    /// Process jobs until the queue is empty. Returns what happened.
    pub async fn drain(&self) -> WorkerStats {
        let mut stats = WorkerStats::default();
        loop {
            let outcome = self.engine.process_queue().await;
            stats.record(&outcome);
            if matches!(outcome, QueueOutcome::Idle | QueueOutcome::StoreUnavailable(_)) {
                return stats;
            }
        }
    }

    /// Run until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> WorkerStats
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut stats = WorkerStats::default();
        let sweep_every = Duration::from_secs(self.config.lease_timeout_secs);

        self.sweep(&mut stats);
        let mut last_sweep = Instant::now();
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            idle_jitter_ms = self.config.idle_jitter_ms,
            "worker started"
        );

        loop {
            let outcome = self.engine.process_queue().await;
            stats.record(&outcome);

            let idle = matches!(outcome, QueueOutcome::Idle | QueueOutcome::StoreUnavailable(_));
            // An idle queue may be a lease nobody will settle.
            if idle && last_sweep.elapsed() >= sweep_every {
                self.sweep(&mut stats);
                last_sweep = Instant::now();
            }

            let pause = if idle { self.idle_delay() } else { Duration::ZERO };

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            idle_polls = stats.idle_polls,
            recovered = stats.recovered,
            "worker stopped"
        );
        stats
    }

    fn sweep(&self, stats: &mut WorkerStats) {
        match self.recover() {
            Ok(count) => stats.recovered += count as u64,
            Err(e) => warn!(error = %e, "stale lease recovery failed"),
        }
    }

    fn idle_delay(&self) -> Duration {
        let jitter = if self.config.idle_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.idle_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.config.poll_interval_ms + jitter)
    }
}
