//! Worker process wiring.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use cirrus_events::LogNotifier;

use crate::config::Settings;
use crate::jobs::{ActionRegistry, JobController, PostgresJobStore, Worker, WorkerConfig};

/// Run a worker process until a termination signal.
///
/// Connects to the database, applies migrations, resets jobs abandoned by a
/// previous run and polls for due jobs with the given actions.
pub async fn run_worker(settings: Settings, actions: ActionRegistry) -> anyhow::Result<()> {
    cirrus_observability::init_with(settings.log_format);

    let store = PostgresJobStore::connect(&settings.database)
        .await
        .context("connecting to the job database")?;
    store.migrate().await.context("applying job migrations")?;

    info!(actions = ?actions.kinds(), "job engine ready");
    let controller = JobController::new(Arc::new(store), actions).with_notifier(LogNotifier);
    let worker = Worker::new(Arc::new(controller), WorkerConfig::from(&settings.worker));
    worker.start().await;
    Ok(())
}
