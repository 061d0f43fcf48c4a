//! Worker pool: crash-recovery sweep, poll loop, bounded execution, graceful
//! shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};

use super::error::JobError;
use super::lifecycle::Lifecycle;
use super::store::SortOrder;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Due jobs picked per poll
    pub pick_size: u64,
    /// Execution units running at once
    pub exec_size: usize,
    /// Deadline of one action invocation
    pub exec_timeout: Duration,
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight units before aborting them
    pub shutdown_grace: Duration,
    pub order: SortOrder,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            pick_size: 10,
            exec_size: 10,
            exec_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(10),
            order: SortOrder::Descending,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_pick_size(mut self, pick_size: u64) -> Self {
        self.pick_size = pick_size;
        self
    }

    pub fn with_exec_size(mut self, exec_size: usize) -> Self {
        self.exec_size = exec_size;
        self
    }

    pub fn with_exec_timeout(mut self, exec_timeout: Duration) -> Self {
        self.exec_timeout = exec_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }
}

#[derive(Debug, Default)]
struct WorkerStats {
    recovered: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Worker runtime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub recovered: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Polls for due jobs and runs them on a bounded pool of tasks.
pub struct Worker {
    lifecycle: Arc<dyn Lifecycle>,
    config: WorkerConfig,
    stats: Arc<WorkerStats>,
}

impl Worker {
    pub fn new(lifecycle: Arc<dyn Lifecycle>, config: WorkerConfig) -> Self {
        Self {
            lifecycle,
            config,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            recovered: self.stats.recovered.load(Ordering::Relaxed),
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    /// Run until SIGINT, SIGTERM or SIGQUIT.
    pub async fn start(&self) {
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        let signals = tokio::spawn(async move {
            shutdown_signal().await;
            trigger.cancel();
        });

        self.run(shutdown).await;
        signals.abort();
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Abandoned jobs are reset before the first poll. After cancellation no
    /// new unit is dispatched; in-flight units get the grace period, then are
    /// aborted.
    #[instrument(skip_all, fields(worker = %self.config.name))]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            pick_size = self.config.pick_size,
            exec_size = self.config.exec_size,
            exec_timeout_secs = self.config.exec_timeout.as_secs(),
            "worker started"
        );
        let semaphore = Arc::new(Semaphore::new(self.config.exec_size.max(1)));
        let mut units: JoinSet<()> = JoinSet::new();

        self.recover(&semaphore).await;

        while !shutdown.is_cancelled() {
            if let Err(err) = self.poll(&semaphore, &mut units, &shutdown).await {
                error!(error = %err, "poll iteration failed");
            }
            reap(&mut units);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        self.drain(&mut units).await;
        info!(stats = ?self.stats(), "worker stopped");
    }

    async fn recover(&self, semaphore: &Arc<Semaphore>) {
        let ids = match self.lifecycle.abandoned_jobs().await {
            Ok(ids) => ids,
            Err(err) => {
                error!(error = %err, "listing abandoned jobs failed");
                return;
            }
        };
        if ids.is_empty() {
            debug!("no abandoned jobs");
            return;
        }

        info!(count = ids.len(), "resetting abandoned jobs");
        let mut sweep = JoinSet::new();
        for id in ids {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let lifecycle = self.lifecycle.clone();
            let stats = self.stats.clone();
            sweep.spawn(
                async move {
                    let _permit = permit;
                    match lifecycle.clean_job(id).await {
                        Ok(()) => {
                            stats.recovered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => error!(job_id = %id, error = %err, "resetting abandoned job failed"),
                    }
                }
                .in_current_span(),
            );
        }

        while let Some(joined) = sweep.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "recovery task died");
            }
        }
    }

    async fn poll(
        &self,
        semaphore: &Arc<Semaphore>,
        units: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) -> Result<(), JobError> {
        let ids = self
            .lifecycle
            .due_jobs(self.config.pick_size, self.config.order)
            .await?;
        if ids.is_empty() {
            info!("fetched 0 jobs");
            return Ok(());
        }
        debug!(count = ids.len(), "fetched due jobs");

        for id in ids {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                permit = semaphore.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                return Ok(());
            };

            let lifecycle = self.lifecycle.clone();
            let stats = self.stats.clone();
            let timeout = self.config.exec_timeout;
            stats.dispatched.fetch_add(1, Ordering::Relaxed);
            units.spawn(
                async move {
                    let _permit = permit;
                    match lifecycle.run_job(id, timeout).await {
                        Ok(()) => {
                            stats.completed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            stats.failed.fetch_add(1, Ordering::Relaxed);
                            error!(job_id = %id, error = %err, "execution unit failed");
                        }
                    }
                }
                .in_current_span(),
            );
        }
        Ok(())
    }

    async fn drain(&self, units: &mut JoinSet<()>) {
        if units.is_empty() {
            return;
        }
        info!(
            in_flight = units.len(),
            grace_secs = self.config.shutdown_grace.as_secs(),
            "waiting for in-flight jobs"
        );

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(joined) = units.join_next().await {
                log_join_error(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(aborted = units.len(), "grace period over, aborting in-flight jobs");
            units.abort_all();
            while units.join_next().await.is_some() {}
        }
    }
}

fn reap(units: &mut JoinSet<()>) {
    while let Some(joined) = units.try_join_next() {
        log_join_error(joined);
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            error!(error = %err, "execution unit panicked");
        }
    }
}

/// Wait for SIGINT, SIGTERM or SIGQUIT.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = unix_signal(tokio::signal::unix::SignalKind::terminate());
    #[cfg(unix)]
    let quit = unix_signal(tokio::signal::unix::SignalKind::quit());

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    #[cfg(not(unix))]
    let quit = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = quit => {},
    }

    info!("shutdown signal received");
}

#[cfg(unix)]
async fn unix_signal(kind: tokio::signal::unix::SignalKind) {
    match tokio::signal::unix::signal(kind) {
        Ok(mut signal) => {
            signal.recv().await;
        }
        Err(err) => {
            error!(error = %err, "failed to install signal handler");
            std::future::pending::<()>().await;
        }
    }
}
