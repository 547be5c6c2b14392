use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;

use conductor::process::SystemProcessRunner;
use conductor::store::{Store, StoreHandle};
use conductor::{Engine, JobOptions};

/// Run one job and map its terminal status to an exit code: 0 for `done`
/// and `needs_manual_review`, 1 otherwise.
pub async fn execute(task: &str, options: JobOptions) -> Result<i32> {
    let db_path = conductor::config::db_path();
    let store = tokio::task::spawn_blocking(move || Store::open(&db_path))
        .await
        .context("Store open task panicked")??;
    let engine = Engine::new(StoreHandle::new(store), Arc::new(SystemProcessRunner::new()));

    let report = engine.run_job(task, options).await?;

    if report.succeeded() {
        println!(
            "{} job {} finished: {}",
            style("ok").green().bold(),
            report.job_id,
            report.status
        );
        if let Some(merge) = &report.merge {
            println!("  {}", merge.notes);
            for file in &merge.touched_files {
                println!("  {}", file);
            }
        }
        Ok(0)
    } else {
        println!(
            "{} job {} failed",
            style("failed").red().bold(),
            report.job_id
        );
        if let Some(failure) = &report.failure {
            println!("  {}", failure);
        }
        Ok(1)
    }
}
