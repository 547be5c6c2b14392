//! Execute one planned subtask in its own worktree.
//!
//! The worktree is `task-<slug>` on branch `task-<slug>-<jobId>` created
//! from the base branch. The worker edits; the orchestrator commits with a
//! message that names the job and subtask. A worker failure that still
//! yields a parseable result object is recorded as a failed subtask, not
//! as an infrastructure error — the distinction matters because the engine
//! lets the rest of the batch finish either way.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::{
    ProgressHarvester, ProgressTarget, StageContext, commit_if_dirty, ensure_worktree, prompts,
    run_worker,
};
use crate::store::PlanSubtask;

/// Commit subject line cap for the subtask summary.
const SUMMARY_COMMIT_CAP: usize = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerSubtask {
    #[serde(default)]
    subtask_id: String,
    status: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    important_files: Vec<String>,
}

/// What the engine gets back for every attempted subtask, success or not.
#[derive(Debug, Clone)]
pub struct SubtaskOutcome {
    pub subtask_id: String,
    pub ok: bool,
    pub summary: String,
    pub important_files: Vec<String>,
    pub error: Option<String>,
    pub branch: String,
    pub worktree: std::path::PathBuf,
}

fn truncate_chars(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        return s.to_string();
    }
    s.chars().take(cap).collect()
}

pub async fn run_subtask(
    ctx: &StageContext,
    subtask: &PlanSubtask,
    worktree_name: &str,
) -> Result<SubtaskOutcome> {
    let branch = crate::git::sanitize_branch(&format!("{}-{}", worktree_name, ctx.job_id()));
    let worktree = ctx.worktrees_root.join(worktree_name);
    let git = ensure_worktree(ctx, &worktree, &branch).await?;

    ctx.store
        .record_subtask_start(
            ctx.meta.clone(),
            subtask.id.clone(),
            subtask.title.clone(),
            subtask.description.clone(),
            subtask.parallel_group.clone(),
            worktree.display().to_string(),
            branch.clone(),
        )
        .await;

    let prompt =
        prompts::subtask_prompt(ctx.user_task(), &subtask.id, &subtask.title, &subtask.description);
    let (harvester, callback) =
        ProgressHarvester::spawn(ctx, ProgressTarget::Subtask(subtask.id.clone()));
    let label = format!("worker:{}", subtask.id);
    let result = run_worker(ctx, &worktree, &label, &prompt, callback).await;
    harvester.finish();

    let outcome = match result {
        Ok(raw) => match serde_json::from_value::<WorkerSubtask>(raw) {
            Ok(worker) => {
                let ok = worker.status == "ok";
                SubtaskOutcome {
                    subtask_id: subtask.id.clone(),
                    ok,
                    summary: worker.summary,
                    important_files: worker.important_files,
                    error: if ok {
                        None
                    } else {
                        Some(format!("worker reported status {}", worker.status))
                    },
                    branch: branch.clone(),
                    worktree: worktree.clone(),
                }
            }
            Err(e) => SubtaskOutcome {
                subtask_id: subtask.id.clone(),
                ok: false,
                summary: String::new(),
                important_files: Vec::new(),
                error: Some(format!("unexpected result shape: {}", e)),
                branch: branch.clone(),
                worktree: worktree.clone(),
            },
        },
        Err(e) => SubtaskOutcome {
            subtask_id: subtask.id.clone(),
            ok: false,
            summary: String::new(),
            important_files: Vec::new(),
            error: Some(format!("{:#}", e)),
            branch: branch.clone(),
            worktree: worktree.clone(),
        },
    };

    // Commit whatever the worker left behind, even on failure — partial
    // work stays on the subtask branch.
    let message = format!(
        "job {}: subtask {} – {}",
        ctx.job_id(),
        subtask.id,
        truncate_chars(&outcome.summary, SUMMARY_COMMIT_CAP)
    );
    if let Err(e) = commit_if_dirty(&git, &message).await {
        eprintln!(
            "[stage] Failed to commit subtask {} edits: {:#}",
            subtask.id, e
        );
    }

    ctx.store
        .record_subtask_result(
            ctx.meta.clone(),
            outcome.subtask_id.clone(),
            outcome.ok,
            outcome.summary.clone(),
            outcome.important_files.clone(),
            outcome.error.clone(),
        )
        .await;

    Ok(outcome)
}
