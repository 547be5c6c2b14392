//! Worker CLI stages.
//!
//! Every stage follows the same skeleton: resolve the directory it runs
//! in, make sure any dedicated worktree exists, build a prompt, run the
//! worker CLI while harvesting a live progress tail, recover the final
//! JSON object from its output, normalise, commit stray edits where the
//! stage is allowed to write, and persist the result. The stage functions
//! themselves only add their prompt, schema and persistence target.

pub mod analyze;
pub mod merge;
pub mod plan;
pub mod prompts;
pub mod refactor;
pub mod subtask;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;

use crate::config;
use crate::errors::{StageError, cap_output};
use crate::git::Git;
use crate::jsonext::{extract_json, extract_json_either};
use crate::logsink::SinkSet;
use crate::process::{ProcessRunner, RunRequest, salvage_output};
use crate::store::{ArtifactKind, JobMeta, StoreHandle};

/// How many recent output lines the progress tail keeps.
const PROGRESS_TAIL_LINES: usize = 20;

/// Minimum interval between progress artifacts (1 Hz).
const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a stage needs to run. Built once per job by the engine;
/// the runner is injected so tests can script worker behaviour.
#[derive(Clone)]
pub struct StageContext {
    pub meta: JobMeta,
    pub repo_root: PathBuf,
    pub base_branch: String,
    pub jobs_root: PathBuf,
    pub worktrees_root: PathBuf,
    pub store: StoreHandle,
    pub runner: Arc<dyn ProcessRunner>,
    pub sinks: SinkSet,
    pub worker_cmd: String,
}

impl StageContext {
    pub fn job_id(&self) -> &str {
        &self.meta.job_id
    }

    pub fn user_task(&self) -> &str {
        self.meta.user_task.as_deref().unwrap_or_default()
    }
}

/// Resolve the directory a stage runs in.
///
/// Precedence: the job's resolved repo root wins; a relative override is
/// joined to it and an absolute override outside it is clamped back to the
/// root (no path escapes). Without a repo root: absolute override, then
/// override joined to the configured base dir, then the base dir or the
/// current directory.
pub fn resolve_stage_root(
    context_root: Option<&Path>,
    project_root: Option<&Path>,
) -> Result<PathBuf> {
    let resolved = match (context_root, project_root) {
        (Some(root), None) => root.to_path_buf(),
        (Some(root), Some(over)) => {
            if over.is_absolute() {
                if over.starts_with(root) {
                    over.to_path_buf()
                } else {
                    root.to_path_buf()
                }
            } else {
                root.join(over)
            }
        }
        (None, Some(over)) if over.is_absolute() => over.to_path_buf(),
        (None, Some(over)) => match config::base_dir() {
            Some(base) => base.join(over),
            None => std::env::current_dir()?.join(over),
        },
        (None, None) => config::base_dir()
            .map(Ok)
            .unwrap_or_else(std::env::current_dir)?,
    };
    if !resolved.is_dir() {
        return Err(StageError::InvalidRoot(resolved).into());
    }
    Ok(resolved)
}

/// Ensure `branch` exists (created from the base branch if not) and that
/// `path` is a worktree checked out to it. Reuses an existing worktree.
pub async fn ensure_worktree(ctx: &StageContext, path: &Path, branch: &str) -> Result<Git> {
    let repo = Git::new(&ctx.repo_root);
    if path.is_dir() {
        let wt = Git::new(path);
        // Already checked out; trust but verify the branch.
        if let Some(current) = wt.current_branch().await? {
            if current == branch {
                return Ok(wt);
            }
        }
        repo.ensure_branch_from(branch, &ctx.base_branch).await?;
        wt.run_checked(&["checkout", branch]).await?;
        return Ok(wt);
    }
    if repo.branch_exists(branch).await? {
        repo.worktree_add(path, branch, None).await?;
    } else {
        repo.worktree_add(path, branch, Some(&ctx.base_branch))
            .await?;
    }
    Ok(Git::new(path))
}

/// Where progress lines for a stage get persisted: job-level stages
/// append `*_progress` artifacts, subtasks stream into `lastReasoning`.
pub enum ProgressTarget {
    Job(ArtifactKind),
    Subtask(String),
}

/// Background task that turns the worker's recent output lines into
/// `*_progress` artifacts at most once a second.
pub struct ProgressHarvester {
    buffer: Arc<std::sync::Mutex<Vec<String>>>,
    task: tokio::task::JoinHandle<()>,
}

impl ProgressHarvester {
    pub fn spawn(ctx: &StageContext, target: ProgressTarget) -> (Self, crate::process::LineCallback) {
        let buffer: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let cb_buffer = buffer.clone();
        let callback: crate::process::LineCallback = Arc::new(move |line: &str| {
            let line = line.trim_end();
            if line.is_empty() {
                return;
            }
            if let Ok(mut buf) = cb_buffer.lock() {
                buf.push(line.to_string());
                if buf.len() > PROGRESS_TAIL_LINES {
                    let excess = buf.len() - PROGRESS_TAIL_LINES;
                    buf.drain(..excess);
                }
            }
        });

        let store = ctx.store.clone();
        let meta = ctx.meta.clone();
        let task_buffer = buffer.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROGRESS_FLUSH_INTERVAL);
            ticker.tick().await;
            let mut last = String::new();
            loop {
                ticker.tick().await;
                let snapshot = match task_buffer.lock() {
                    Ok(buf) => buf.join("\n"),
                    Err(_) => continue,
                };
                if snapshot.is_empty() || snapshot == last {
                    continue;
                }
                last = snapshot.clone();
                match &target {
                    ProgressTarget::Job(kind) => {
                        store
                            .record_progress(meta.clone(), *kind, None, snapshot)
                            .await;
                    }
                    ProgressTarget::Subtask(subtask_id) => {
                        store
                            .record_subtask_reasoning(
                                meta.job_id.clone(),
                                subtask_id.clone(),
                                snapshot,
                            )
                            .await;
                    }
                }
            }
        });

        (Self { buffer, task }, callback)
    }

    /// Stop harvesting and return the final tail.
    pub fn finish(self) -> String {
        self.task.abort();
        match self.buffer.lock() {
            Ok(buf) => buf.join("\n"),
            Err(_) => String::new(),
        }
    }
}

/// Run the worker CLI with a stage prompt in `cwd` and recover its final
/// JSON object. A non-zero exit with a parseable object on either stream
/// is still a result; anything else is `StageError::ParseFailed`.
pub async fn run_worker(
    ctx: &StageContext,
    cwd: &Path,
    label: &str,
    prompt: &str,
    callback: crate::process::LineCallback,
) -> Result<Value> {
    let req = RunRequest::new(&ctx.worker_cmd, cwd)
        .arg("exec")
        .arg("--full-auto")
        .arg("--config")
        .arg("model_reasoning_effort=\"medium\"")
        .arg(prompt)
        .label(label)
        .sinks(ctx.sinks.clone())
        .on_stdout(callback.clone())
        .on_stderr(callback);

    let stage = label.to_string();
    match ctx.runner.run(req).await {
        Ok(out) => match extract_json(&out.stdout).or_else(|_| extract_json(&out.stderr)) {
            Ok(value) => Ok(value),
            Err(_) => Err(StageError::ParseFailed {
                stage,
                message: "no JSON object in worker output".into(),
                stdout: cap_output(&out.stdout),
                stderr: cap_output(&out.stderr),
            }
            .into()),
        },
        Err(err) => {
            let Some((stdout, stderr)) = salvage_output(&err) else {
                return Err(err);
            };
            match extract_json_either(&stdout, &stderr) {
                Ok(value) => Ok(value),
                Err(_) => Err(StageError::ParseFailed {
                    stage,
                    message: format!("worker failed: {}", err),
                    stdout: cap_output(&stdout),
                    stderr: cap_output(&stderr),
                }
                .into()),
            }
        }
    }
}

/// Commit any dirty state left behind by a writing stage, with the
/// orchestrator author identity.
pub async fn commit_if_dirty(git: &Git, message: &str) -> Result<bool> {
    if !git.is_dirty().await? {
        return Ok(false);
    }
    git.add_all().await?;
    git.commit(message).await?;
    Ok(true)
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::testing::fixture;

    #[tokio::test]
    async fn resolve_prefers_context_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        let resolved = resolve_stage_root(Some(root), None).unwrap();
        assert_eq!(resolved, root);
    }

    #[tokio::test]
    async fn resolve_joins_relative_override_to_context_root() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let resolved =
            resolve_stage_root(Some(dir.path()), Some(Path::new("sub"))).unwrap();
        assert_eq!(resolved, dir.path().join("sub"));
    }

    #[tokio::test]
    async fn resolve_clamps_escaping_absolute_override() {
        let dir = tempfile::TempDir::new().unwrap();
        let other = tempfile::TempDir::new().unwrap();
        let resolved = resolve_stage_root(Some(dir.path()), Some(other.path())).unwrap();
        assert_eq!(resolved, dir.path());
    }

    #[tokio::test]
    async fn resolve_allows_absolute_override_inside_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let inside = dir.path().join("inner");
        std::fs::create_dir(&inside).unwrap();
        let resolved = resolve_stage_root(Some(dir.path()), Some(&inside)).unwrap();
        assert_eq!(resolved, inside);
    }

    #[tokio::test]
    async fn resolve_rejects_missing_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = resolve_stage_root(Some(&dir.path().join("nope")), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StageError>(),
            Some(StageError::InvalidRoot(_))
        ));
    }

    #[tokio::test]
    async fn ensure_worktree_creates_then_reuses() {
        let fx = fixture("job-wt").await;
        let path = fx.ctx.worktrees_root.join("refactor");
        let wt = ensure_worktree(&fx.ctx, &path, "refactor-job-wt").await.unwrap();
        assert_eq!(
            wt.current_branch().await.unwrap().as_deref(),
            Some("refactor-job-wt")
        );

        // Second call reuses the same checkout.
        let again = ensure_worktree(&fx.ctx, &path, "refactor-job-wt").await.unwrap();
        assert_eq!(again.workdir(), path.as_path());
    }

    #[tokio::test]
    async fn run_worker_builds_the_exec_invocation() {
        let fx = fixture("job-inv").await;
        fx.runner.push_stdout("{\"ok\": true}");
        let value = run_worker(
            &fx.ctx,
            &fx.ctx.repo_root.clone(),
            "worker:test",
            "do the thing",
            Arc::new(|_| {}),
        )
        .await
        .unwrap();
        assert_eq!(value["ok"], true);

        let requests = fx.runner.requests.lock().unwrap();
        assert_eq!(requests[0].command, "worker-cli");
        assert_eq!(requests[0].args[0], "exec");
        assert_eq!(requests[0].args[1], "--full-auto");
        assert_eq!(requests[0].args[2], "--config");
        assert_eq!(requests[0].args[3], "model_reasoning_effort=\"medium\"");
        assert_eq!(requests[0].args[4], "do the thing");
    }

    #[tokio::test]
    async fn run_worker_salvages_json_from_failed_stderr() {
        let fx = fixture("job-salvage").await;
        fx.runner
            .push_failure(1, "garbage", "{\"status\": \"failed\", \"summary\": \"boom\"}");
        let value = run_worker(
            &fx.ctx,
            &fx.ctx.repo_root.clone(),
            "worker:test",
            "p",
            Arc::new(|_| {}),
        )
        .await
        .unwrap();
        assert_eq!(value["status"], "failed");
    }

    #[tokio::test]
    async fn run_worker_fails_without_any_json() {
        let fx = fixture("job-nojson").await;
        fx.runner.push_failure(1, "nothing here", "still nothing");
        let err = run_worker(
            &fx.ctx,
            &fx.ctx.repo_root.clone(),
            "worker:test",
            "p",
            Arc::new(|_| {}),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StageError>(),
            Some(StageError::ParseFailed { .. })
        ));
    }

    #[tokio::test]
    async fn commit_if_dirty_round_trip() {
        let fx = fixture("job-dirty").await;
        assert!(!commit_if_dirty(&fx.repo, "noop").await.unwrap());
        std::fs::write(fx.repo.workdir().join("x.txt"), "x").unwrap();
        assert!(commit_if_dirty(&fx.repo, "job job-dirty: stage edits").await.unwrap());
        assert!(!fx.repo.is_dirty().await.unwrap());
    }
}
