//! Task dispatcher: feeds user tasks from ordered sources into the engine,
//! strictly one job at a time.
//!
//! Sources and the reporter are seams so ingestion front-ends (CLI
//! arguments, bots, queues) stay out of the engine entirely: they only
//! produce task strings and consume completion callbacks.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::{Engine, FinalReport, JobOptions};

/// Default sleep between empty polling passes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// A provider of user tasks.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// The next task, or None when the source is currently empty.
    async fn next_task(&self) -> Result<Option<String>>;
    async fn mark_done(&self, task: &str);
    async fn mark_failed(&self, task: &str, error: &str);
}

/// Lifecycle callbacks around each dispatched job.
#[async_trait]
pub trait DispatchReporter: Send + Sync {
    async fn on_start(&self, _task: &str) {}
    async fn on_success(&self, _task: &str, _report: &FinalReport) {}
    async fn on_failure(&self, _task: &str, _error: &str) {}
    async fn on_idle(&self) {}
}

/// Reporter that only writes diagnostics to stderr.
pub struct LogReporter;

#[async_trait]
impl DispatchReporter for LogReporter {
    async fn on_start(&self, task: &str) {
        eprintln!("[dispatch] starting: {}", first_line(task));
    }

    async fn on_success(&self, task: &str, report: &FinalReport) {
        eprintln!(
            "[dispatch] {} finished {} ({})",
            report.job_id,
            report.status,
            first_line(task)
        );
    }

    async fn on_failure(&self, task: &str, error: &str) {
        eprintln!("[dispatch] failed ({}): {}", first_line(task), error);
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub poll_interval: Duration,
    pub stop_when_empty: bool,
    /// Template for every job; `job_id` is cleared so each job gets its
    /// own generated id.
    pub job: JobOptions,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_when_empty: false,
            job: JobOptions::default(),
        }
    }
}

/// In-memory FIFO source, for CLI invocations and tests.
#[derive(Default)]
pub struct QueueSource {
    tasks: Mutex<VecDeque<String>>,
    pub done: Mutex<Vec<String>>,
    pub failed: Mutex<Vec<(String, String)>>,
}

impl QueueSource {
    pub fn new(tasks: impl IntoIterator<Item = String>) -> Self {
        Self {
            tasks: Mutex::new(tasks.into_iter().collect()),
            done: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, task: impl Into<String>) {
        self.tasks.lock().unwrap().push_back(task.into());
    }
}

#[async_trait]
impl TaskSource for QueueSource {
    async fn next_task(&self) -> Result<Option<String>> {
        Ok(self.tasks.lock().unwrap().pop_front())
    }

    async fn mark_done(&self, task: &str) {
        self.done.lock().unwrap().push(task.to_string());
    }

    async fn mark_failed(&self, task: &str, error: &str) {
        self.failed
            .lock()
            .unwrap()
            .push((task.to_string(), error.to_string()));
    }
}

/// Poll `sources` in order, running every task through the engine. When a
/// whole pass yields nothing, `on_idle` fires; then either stop (with
/// `stop_when_empty`) or sleep and poll again.
pub async fn run_dispatch(
    engine: &Engine,
    sources: &[&dyn TaskSource],
    reporter: &dyn DispatchReporter,
    options: DispatchOptions,
) -> Result<()> {
    loop {
        let mut processed_any = false;

        for source in sources {
            loop {
                let Some(task) = source.next_task().await? else {
                    break;
                };
                processed_any = true;
                reporter.on_start(&task).await;

                let mut job_options = options.job.clone();
                job_options.job_id = None;
                match engine.run_job(&task, job_options).await {
                    Ok(report) if report.succeeded() => {
                        reporter.on_success(&task, &report).await;
                        source.mark_done(&task).await;
                    }
                    Ok(report) => {
                        let error = report
                            .failure
                            .clone()
                            .unwrap_or_else(|| format!("job ended {}", report.status));
                        reporter.on_failure(&task, &error).await;
                        source.mark_failed(&task, &error).await;
                    }
                    Err(e) => {
                        let error = format!("{:#}", e);
                        reporter.on_failure(&task, &error).await;
                        source.mark_failed(&task, &error).await;
                    }
                }
            }
        }

        if !processed_any {
            reporter.on_idle().await;
            if options.stop_when_empty {
                return Ok(());
            }
            tokio::time::sleep(options.poll_interval).await;
        }
    }
}
