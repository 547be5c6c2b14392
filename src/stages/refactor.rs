//! Preparatory refactor in a dedicated worktree.
//!
//! Runs on branch `refactor-<jobId>` created from the base branch. The
//! worker edits; the orchestrator stages and commits whatever it left
//! behind, then recomputes the touched-file list from the actual diff so
//! the report never depends on the worker's own accounting.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{
    ProgressHarvester, ProgressTarget, StageContext, commit_if_dirty, ensure_worktree, prompts,
    run_worker,
};
use crate::store::ArtifactKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefactorStatus {
    Ok,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefactorReport {
    pub status: RefactorStatus,
    #[serde(default)]
    pub summary: String,
    pub branch: String,
    pub worktree_path: String,
    #[serde(default)]
    pub touched_files: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Shape the worker actually answers with; branch and worktree are ours.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerRefactor {
    status: RefactorStatus,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    notes: Option<String>,
}

pub async fn run_refactor(ctx: &StageContext, analysis_notes: &str) -> Result<RefactorReport> {
    ctx.store
        .mark_job_status(ctx.meta.clone(), crate::store::JobStatus::Refactoring)
        .await;

    let branch = format!("refactor-{}", ctx.job_id());
    let worktree = ctx.worktrees_root.join("refactor");
    let git = ensure_worktree(ctx, &worktree, &branch).await?;

    let prompt = prompts::refactor_prompt(ctx.user_task(), analysis_notes);
    let (harvester, callback) =
        ProgressHarvester::spawn(ctx, ProgressTarget::Job(ArtifactKind::RefactorProgress));
    let result = run_worker(ctx, &worktree, "worker:refactor", &prompt, callback).await;
    harvester.finish();
    let raw = result?;

    let worker: WorkerRefactor = serde_json::from_value(raw)
        .context("Refactor output did not match the expected shape")?;

    commit_if_dirty(&git, &format!("job {}: preparatory refactor", ctx.job_id())).await?;

    // The authoritative touched list comes from the branch diff, not the
    // worker's claim.
    let touched_files = git
        .diff_names(&format!("{}..HEAD", ctx.base_branch))
        .await?;

    let report = RefactorReport {
        status: worker.status,
        summary: worker.summary,
        branch,
        worktree_path: worktree.display().to_string(),
        touched_files,
        notes: worker.notes,
    };

    ctx.store
        .record_refactor_output(ctx.meta.clone(), serde_json::to_value(&report)?)
        .await;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::fixture;

    #[tokio::test]
    async fn refactor_commits_edits_and_recomputes_touched_files() {
        let fx = fixture("job-rf").await;
        let worktree = fx.ctx.worktrees_root.join("refactor");

        // The fake runner cannot edit files itself, so pre-create the
        // worktree and plant an edit that the stage should commit.
        super::ensure_worktree(&fx.ctx, &worktree, "refactor-job-rf")
            .await
            .unwrap();
        std::fs::write(worktree.join("split.rs"), "pub mod a;\n").unwrap();

        fx.runner
            .push_stdout(r#"{"status": "ok", "summary": "split the module"}"#);

        let report = run_refactor(&fx.ctx, "notes from analysis").await.unwrap();
        assert_eq!(report.status, RefactorStatus::Ok);
        assert_eq!(report.branch, "refactor-job-rf");
        assert_eq!(report.touched_files, vec!["split.rs"]);

        // The worktree is clean again and the commit is on the branch.
        let git = crate::git::Git::new(&worktree);
        assert!(!git.is_dirty().await.unwrap());
        let log = git
            .run_checked(&["log", "-1", "--format=%s"])
            .await
            .unwrap();
        assert_eq!(log.stdout.trim(), "job job-rf: preparatory refactor");
    }

    #[tokio::test]
    async fn skipped_refactor_reports_no_touched_files() {
        let fx = fixture("job-rf2").await;
        fx.runner
            .push_stdout(r#"{"status": "skipped", "summary": "nothing to do"}"#);
        let report = run_refactor(&fx.ctx, "").await.unwrap();
        assert_eq!(report.status, RefactorStatus::Skipped);
        assert!(report.touched_files.is_empty());

        let dash = fx.ctx.store.read_dashboard_data().await.unwrap();
        assert!(
            dash.jobs[0]
                .artifacts
                .iter()
                .any(|a| a.kind == ArtifactKind::Refactor)
        );
    }
}
