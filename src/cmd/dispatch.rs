use std::sync::Arc;

use anyhow::{Context, Result};

use conductor::dispatch::{
    DispatchOptions, LogReporter, QueueSource, TaskSource, run_dispatch,
};
use conductor::process::SystemProcessRunner;
use conductor::store::{Store, StoreHandle};
use conductor::{Engine, JobOptions};

/// Drain a fixed queue of tasks, one job per task, and exit.
pub async fn execute(tasks: Vec<String>, job: JobOptions) -> Result<i32> {
    let db_path = conductor::config::db_path();
    let store = tokio::task::spawn_blocking(move || Store::open(&db_path))
        .await
        .context("Store open task panicked")??;
    let engine = Engine::new(StoreHandle::new(store), Arc::new(SystemProcessRunner::new()));

    let source = QueueSource::new(tasks);
    let options = DispatchOptions {
        stop_when_empty: true,
        job,
        ..Default::default()
    };
    run_dispatch(
        &engine,
        &[&source as &dyn TaskSource],
        &LogReporter,
        options,
    )
    .await?;

    let failed = source.failed.lock().unwrap().len();
    Ok(if failed == 0 { 0 } else { 1 })
}
