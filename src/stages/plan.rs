//! Planning: turn the user task into a deterministic subtask plan.
//!
//! Read-only. Runs in the refactor worktree when the pre-factor ran (so
//! the planner sees the restructured tree), otherwise in the repo root.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

use super::{ProgressHarvester, ProgressTarget, StageContext, prompts, run_worker};
use crate::store::{ArtifactKind, Plan};

/// Coerce loosely-typed planner output into the persisted plan shape:
/// `parallelGroup` becomes a string whatever the worker emitted, missing
/// `context`/`notes` become null, and whitespace around ids and titles is
/// dropped.
fn normalize_plan(mut raw: Value) -> Value {
    if let Some(subtasks) = raw.get_mut("subtasks").and_then(Value::as_array_mut) {
        for sub in subtasks {
            let Some(obj) = sub.as_object_mut() else {
                continue;
            };
            let group = match obj.get("parallelGroup") {
                None | Some(Value::Null) => Value::Null,
                Some(Value::String(s)) => {
                    let trimmed = s.trim();
                    if trimmed.is_empty() {
                        Value::Null
                    } else {
                        Value::String(trimmed.to_string())
                    }
                }
                Some(other) => Value::String(other.to_string().trim_matches('"').to_string()),
            };
            obj.insert("parallelGroup".into(), group);
            for key in ["context", "notes"] {
                if !obj.contains_key(key) {
                    obj.insert(key.into(), Value::Null);
                }
            }
            for key in ["id", "title", "description"] {
                let trimmed = match obj.get(key) {
                    Some(Value::String(s)) => Some(s.trim().to_string()),
                    _ => None,
                };
                if let Some(t) = trimmed {
                    obj.insert(key.into(), Value::String(t));
                }
            }
        }
    }
    if raw.get("canParallelize").is_none() {
        if let Some(obj) = raw.as_object_mut() {
            obj.insert("canParallelize".into(), Value::Bool(false));
        }
    }
    raw
}

pub async fn run_plan(ctx: &StageContext, cwd: &Path) -> Result<Plan> {
    ctx.store
        .mark_job_status(ctx.meta.clone(), crate::store::JobStatus::Planning)
        .await;

    let prompt = prompts::plan_prompt(ctx.user_task());
    let (harvester, callback) =
        ProgressHarvester::spawn(ctx, ProgressTarget::Job(ArtifactKind::PlanProgress));
    let result = run_worker(ctx, cwd, "worker:plan", &prompt, callback).await;
    harvester.finish();
    let raw = normalize_plan(result?);

    let plan: Plan = serde_json::from_value(raw.clone())
        .context("Plan output did not match the expected shape")?;

    ctx.store
        .record_planner_output(ctx.meta.clone(), raw.clone())
        .await;

    tokio::fs::create_dir_all(&ctx.jobs_root).await.ok();
    if let Ok(pretty) = serde_json::to_string_pretty(&raw) {
        tokio::fs::write(ctx.jobs_root.join("planner-output.json"), pretty)
            .await
            .ok();
    }

    Ok(plan)
}
