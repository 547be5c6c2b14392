//! Fold all subtask branches into the per-job result branch.
//!
//! Branches merge sequentially into the `result-<jobId>` worktree. A
//! conflicted merge hands the conflicted files to the worker CLI with git
//! explicitly forbidden; the worktree's `.git` pointer file is read before
//! the worker runs and must be byte-identical afterwards, otherwise the
//! whole merge aborts. Conflicts that survive the worker abort too —
//! nothing half-merged ever gets committed.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::{ProgressHarvester, ProgressTarget, StageContext, ensure_worktree, prompts};
use crate::errors::{GitError, StageError};
use crate::git::Git;
use crate::jsonext::extract_json_either;
use crate::process::{RunRequest, salvage_output};
use crate::store::{ArtifactKind, MergeResult, MergeStatus};

/// One branch to fold in, as produced by a completed subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeInput {
    pub subtask_id: String,
    pub branch: String,
    pub worktree: String,
    #[serde(default)]
    pub summary: String,
}

pub async fn run_merge(ctx: &StageContext, inputs: &[MergeInput]) -> Result<MergeResult> {
    let input_data = serde_json::json!({ "branches": inputs });
    ctx.store
        .record_merge_start(ctx.meta.clone(), input_data)
        .await;

    match merge_inner(ctx, inputs).await {
        Ok(result) => {
            ctx.store
                .record_merge_result(ctx.meta.clone(), result.clone())
                .await;
            Ok(result)
        }
        Err(e) => {
            ctx.store
                .record_merge_failure(ctx.meta.clone(), format!("{:#}", e))
                .await;
            Err(e)
        }
    }
}

async fn merge_inner(ctx: &StageContext, inputs: &[MergeInput]) -> Result<MergeResult> {
    let result_branch = format!("result-{}", ctx.job_id());
    let worktree_path = ctx.worktrees_root.join("result");
    let git = ensure_worktree(ctx, &worktree_path, &result_branch).await?;

    let mut needs_review = false;

    for input in inputs {
        let out = git.merge_no_commit(&input.branch).await?;
        let unmerged = git.unmerged_files().await?;

        if unmerged.is_empty() {
            if !out.success() {
                return Err(GitError::Failed {
                    args: format!("merge --no-commit --no-ff {}", input.branch),
                    exit_code: out.exit_code,
                    stdout: out.stdout,
                    stderr: out.stderr,
                }
                .into());
            }
            // "Already up to date" leaves nothing to commit.
            if git.is_dirty().await? {
                git.commit(&format!(
                    "Merge branch {} into {}",
                    input.branch, result_branch
                ))
                .await?;
            }
            continue;
        }

        let resolution = resolve_conflicts(ctx, &git, input, &unmerged).await?;
        if resolution.needs_review {
            needs_review = true;
        }

        // The worker may not run git, so the unmerged index entries only
        // clear once we stage its edits. Files still carrying conflict
        // markers are unresolved whatever the index says.
        let mut remaining: Vec<String> = unmerged
            .iter()
            .filter(|f| {
                std::fs::read_to_string(git.workdir().join(f))
                    .map(|c| c.lines().any(|l| l.starts_with("<<<<<<<")))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        git.add_all().await?;
        for f in git.unmerged_files().await? {
            if !remaining.contains(&f) {
                remaining.push(f);
            }
        }
        if !remaining.is_empty() {
            return Err(StageError::MergeUnresolved {
                branch: input.branch.clone(),
                files: remaining,
            }
            .into());
        }
        git.commit(&format!(
            "Merge branch {} into {} (conflicts resolved via worker CLI)",
            input.branch, result_branch
        ))
        .await?;
    }

    let touched_files = git
        .diff_names(&format!("{}...HEAD", ctx.base_branch))
        .await?;

    let mut notes = format!(
        "Merged {} branch{} into {}",
        inputs.len(),
        if inputs.len() == 1 { "" } else { "es" },
        result_branch
    );
    if ctx.meta.push_result {
        git.push("origin", &result_branch).await?;
        notes.push_str(", pushed to origin");
    }

    Ok(MergeResult {
        status: if needs_review {
            MergeStatus::NeedsManualReview
        } else {
            MergeStatus::Ok
        },
        notes,
        touched_files,
    })
}

struct Resolution {
    needs_review: bool,
}

/// Hand the conflicted files to the worker, guarding the worktree's git
/// metadata. The worker's exit code is advisory here — the re-queried
/// unmerged set is what decides — but a tampered `.git` pointer aborts
/// unconditionally.
async fn resolve_conflicts(
    ctx: &StageContext,
    git: &Git,
    input: &MergeInput,
    files: &[String],
) -> Result<Resolution> {
    let pointer_path = git.workdir().join(".git");
    let pointer_before = std::fs::read(&pointer_path)
        .with_context(|| format!("Failed to read {}", pointer_path.display()))?;

    let prompt = prompts::conflict_prompt(&input.branch, files);
    let (harvester, callback) =
        ProgressHarvester::spawn(ctx, ProgressTarget::Job(ArtifactKind::MergeProgress));

    let req = RunRequest::new(&ctx.worker_cmd, git.workdir())
        .arg("exec")
        .arg("--full-auto")
        .arg("--config")
        .arg("model_reasoning_effort=\"medium\"")
        .arg(&prompt)
        .label(format!("worker:merge:{}", input.subtask_id))
        .sinks(ctx.sinks.clone())
        .on_stdout(callback.clone())
        .on_stderr(callback);

    let run = ctx.runner.run(req).await;
    harvester.finish();

    let pointer_after = std::fs::read(&pointer_path)
        .with_context(|| format!("Failed to re-read {}", pointer_path.display()))?;
    if pointer_before != pointer_after {
        return Err(StageError::MergePointerTampered {
            branch: input.branch.clone(),
        }
        .into());
    }

    let (stdout, stderr) = match &run {
        Ok(out) => (out.stdout.clone(), out.stderr.clone()),
        Err(e) => salvage_output(e).ok_or_else(|| anyhow!("worker failed during conflict resolution: {:#}", e))?,
    };
    let needs_review = extract_json_either(&stdout, &stderr)
        .ok()
        .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(String::from))
        .is_some_and(|s| s == "needs_manual_review");

    Ok(Resolution { needs_review })
}
