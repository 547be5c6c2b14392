//! Pre-factor analysis: should a preparatory refactor run first?
//!
//! Read-only; runs straight in the repo root with no dedicated worktree.
//! Only invoked when the job has the pre-factor option enabled.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{ProgressHarvester, ProgressTarget, StageContext, prompts, run_worker};
use crate::store::ArtifactKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    #[serde(default)]
    pub should_refactor: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub focus_areas: Vec<FocusArea>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusArea {
    pub path: String,
    #[serde(default)]
    pub why: String,
    #[serde(default)]
    pub suggested_split: Option<String>,
}

pub async fn run_analyze(ctx: &StageContext) -> Result<AnalysisReport> {
    ctx.store
        .mark_job_status(ctx.meta.clone(), crate::store::JobStatus::Analyzing)
        .await;

    let prompt = prompts::analyze_prompt(ctx.user_task());
    let (harvester, callback) =
        ProgressHarvester::spawn(ctx, ProgressTarget::Job(ArtifactKind::AnalysisProgress));
    let result = run_worker(ctx, &ctx.repo_root, "worker:analyze", &prompt, callback).await;
    harvester.finish();
    let raw = result?;

    let report: AnalysisReport = serde_json::from_value(raw.clone())
        .context("Analysis output did not match the expected shape")?;

    let data = serde_json::to_value(&report)?;
    ctx.store
        .record_analysis_output(ctx.meta.clone(), data.clone())
        .await;

    // Keep a copy next to the job log for offline inspection.
    tokio::fs::create_dir_all(&ctx.jobs_root).await.ok();
    if let Ok(pretty) = serde_json::to_string_pretty(&data) {
        tokio::fs::write(ctx.jobs_root.join("analysis-output.json"), pretty)
            .await
            .ok();
    }

    Ok(report)
}
