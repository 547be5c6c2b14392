//! The job pipeline engine.
//!
//! One deterministic state machine per job: resolve context, optionally
//! analyze + refactor, plan, execute subtask batches, merge, and always
//! leave the job in a terminal state. Batches are barriers — every member
//! runs to completion before the next batch starts, and a failure anywhere
//! finishes the current batch but skips everything after it, merge
//! included.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Local;

use crate::config;
use crate::git::Git;
use crate::logsink::{JobLog, LineSink, SinkSet, TerminalTee};
use crate::process::ProcessRunner;
use crate::stages::merge::{MergeInput, run_merge};
use crate::stages::subtask::{SubtaskOutcome, run_subtask};
use crate::stages::{StageContext, analyze::run_analyze, plan::run_plan, refactor::run_refactor};
use crate::store::{JobMeta, JobStatus, MergeResult, MergeStatus, Plan, PlanSubtask, StoreHandle};

/// Caller-facing knobs for one job.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub repo_root: Option<PathBuf>,
    pub base_branch: Option<String>,
    pub job_id: Option<String>,
    pub push_result: bool,
    pub enable_prefactor: bool,
    pub verbose_log: bool,
}

/// What a finished job reports back to the caller.
#[derive(Debug, Clone)]
pub struct FinalReport {
    pub job_id: String,
    pub status: JobStatus,
    pub merge: Option<MergeResult>,
    pub failure: Option<String>,
}

impl FinalReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, JobStatus::Done | JobStatus::NeedsManualReview)
    }
}

/// Job ids end up in branch names and paths; keep them to `[A-Za-z0-9._-]`.
pub fn sanitize_job_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('-').to_string();
    if trimmed.is_empty() {
        default_job_id()
    } else {
        trimmed
    }
}

pub fn default_job_id() -> String {
    format!("job-{}", Local::now().format("%Y%m%d-%H%M%S"))
}

/// Lowercased, non-alphanumerics collapsed to single dashes.
fn slugify(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Group the plan into execution batches.
///
/// With `canParallelize`, subtasks sharing a non-empty group label form
/// one batch, ordered by the label's first appearance; unlabelled
/// subtasks get their own solo batch at their position. Otherwise every
/// subtask is a singleton batch in plan order.
pub fn batch_plan(plan: &Plan) -> Vec<Vec<PlanSubtask>> {
    if !plan.can_parallelize {
        return plan.subtasks.iter().cloned().map(|s| vec![s]).collect();
    }
    let mut batches: Vec<(Option<String>, Vec<PlanSubtask>)> = Vec::new();
    for subtask in &plan.subtasks {
        let group = subtask
            .parallel_group
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(String::from);
        match group {
            Some(key) => {
                if let Some((_, batch)) = batches
                    .iter_mut()
                    .find(|(g, _)| g.as_deref() == Some(key.as_str()))
                {
                    batch.push(subtask.clone());
                } else {
                    batches.push((Some(key), vec![subtask.clone()]));
                }
            }
            None => batches.push((None, vec![subtask.clone()])),
        }
    }
    batches.into_iter().map(|(_, batch)| batch).collect()
}

/// Assign each subtask a worktree name `task-<slug>`, suffixing `-2`,
/// `-3`, ... when slugs collide within the job.
pub fn assign_worktree_names(subtasks: &[&PlanSubtask]) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::new();
    let mut names = Vec::with_capacity(subtasks.len());
    for subtask in subtasks {
        let slug = slugify(&subtask.id);
        let base = if slug.is_empty() {
            "task".to_string()
        } else {
            format!("task-{}", slug)
        };
        let mut candidate = base.clone();
        let mut n = 2;
        while taken.contains(&candidate) {
            candidate = format!("{}-{}", base, n);
            n += 1;
        }
        taken.insert(candidate.clone());
        names.push(candidate);
    }
    names
}

pub struct Engine {
    store: StoreHandle,
    runner: Arc<dyn ProcessRunner>,
}

impl Engine {
    pub fn new(store: StoreHandle, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { store, runner }
    }

    /// Terminate all in-flight children. Completed subtask commits stay
    /// valid; the store keeps whatever was recorded.
    pub async fn shutdown(&self) {
        self.runner.kill_all().await;
    }

    /// Resolve the job context from options, environment and repo state.
    async fn build_context(&self, user_task: &str, options: &JobOptions) -> Result<StageContext> {
        let repo_root = crate::stages::resolve_stage_root(None, options.repo_root.as_deref())?
            .canonicalize()
            .context("Failed to canonicalise repository root")?;

        let git = Git::new(&repo_root);
        let base_branch = match options
            .base_branch
            .clone()
            .or_else(config::env_base_branch)
        {
            Some(branch) => branch,
            None => match git.current_branch().await {
                Ok(Some(branch)) => branch,
                _ => config::DEFAULT_BASE_BRANCH.to_string(),
            },
        };

        let job_id = sanitize_job_id(
            &options
                .job_id
                .clone()
                .or_else(config::env_job_id)
                .unwrap_or_else(default_job_id),
        );

        let jobs_root = repo_root.join(".codex").join("jobs").join(&job_id);
        let worktrees_root = jobs_root.join("worktrees");

        let mut sinks = SinkSet::new();
        match JobLog::create(&jobs_root.join("orchestrator.log")) {
            Ok(log) => sinks.push(Arc::new(log) as Arc<dyn LineSink>),
            Err(e) => eprintln!("[engine] Job log unavailable: {:#}", e),
        }
        if config::tee_enabled(options.verbose_log) {
            sinks.push(Arc::new(TerminalTee) as Arc<dyn LineSink>);
        }

        let task = user_task.lines().next().unwrap_or_default();
        let task = task.chars().take(100).collect::<String>();
        let meta = JobMeta {
            job_id,
            repo_root: Some(repo_root.display().to_string()),
            base_branch: Some(base_branch.clone()),
            task: Some(task),
            user_task: Some(user_task.to_string()),
            push_result: options.push_result,
        };

        Ok(StageContext {
            meta,
            repo_root,
            base_branch,
            jobs_root,
            worktrees_root,
            store: self.store.clone(),
            runner: self.runner.clone(),
            sinks,
            worker_cmd: config::worker_command(),
        })
    }

    /// Drive one user task from intake to a terminal status.
    pub async fn run_job(&self, user_task: &str, options: JobOptions) -> Result<FinalReport> {
        let ctx = self.build_context(user_task, &options).await?;
        let job_id = ctx.job_id().to_string();

        let result = self.run_stages(&ctx, options.enable_prefactor).await;

        let report = match result {
            Ok(merge) => FinalReport {
                job_id: job_id.clone(),
                status: match merge.status {
                    MergeStatus::Ok => JobStatus::Done,
                    MergeStatus::NeedsManualReview => JobStatus::NeedsManualReview,
                },
                merge: Some(merge),
                failure: None,
            },
            Err(e) => {
                let failure = format!("{:#}", e);
                eprintln!("[engine] job {}: {}", job_id, failure);
                self.store
                    .mark_job_status(ctx.meta.clone(), JobStatus::Failed)
                    .await;
                FinalReport {
                    job_id: job_id.clone(),
                    status: JobStatus::Failed,
                    merge: None,
                    failure: Some(failure),
                }
            }
        };

        // Whatever happened above, never leave a live-but-finished job.
        self.store
            .ensure_terminal_job_status(job_id, JobStatus::Done)
            .await;

        Ok(report)
    }

    async fn run_stages(&self, ctx: &StageContext, enable_prefactor: bool) -> Result<MergeResult> {
        // Optional pre-factor pair.
        let mut plan_cwd = ctx.repo_root.clone();
        if enable_prefactor {
            let analysis = run_analyze(ctx).await?;
            if analysis.should_refactor {
                let notes = analysis.notes.clone().unwrap_or_else(|| {
                    analysis
                        .reasons
                        .join("; ")
                });
                let refactor = run_refactor(ctx, &notes).await?;
                plan_cwd = PathBuf::from(&refactor.worktree_path);
            }
        }

        let plan = run_plan(ctx, &plan_cwd).await?;
        if plan.subtasks.is_empty() {
            let result = MergeResult {
                status: MergeStatus::Ok,
                notes: "Plan produced no subtasks; nothing to merge".into(),
                touched_files: Vec::new(),
            };
            ctx.store
                .record_merge_result(ctx.meta.clone(), result.clone())
                .await;
            return Ok(result);
        }

        // Fix worktree names up front so collisions resolve deterministically
        // in plan order, independent of batch scheduling.
        let ordered: Vec<&PlanSubtask> = plan.subtasks.iter().collect();
        let names = assign_worktree_names(&ordered);
        let name_of = |id: &str| -> String {
            ordered
                .iter()
                .position(|s| s.id == id)
                .map(|i| names[i].clone())
                .unwrap_or_else(|| format!("task-{}", slugify(id)))
        };

        let batches = batch_plan(&plan);
        let mut outcomes: Vec<SubtaskOutcome> = Vec::new();
        let mut failed = false;

        for batch in &batches {
            let mut handles = Vec::new();
            for subtask in batch {
                let ctx = ctx.clone();
                let subtask = subtask.clone();
                let worktree_name = name_of(&subtask.id);
                handles.push(tokio::spawn(async move {
                    run_subtask(&ctx, &subtask, &worktree_name).await
                }));
            }

            // Batch barrier: the whole batch finishes, failures included.
            for handle in handles {
                match handle.await {
                    Ok(Ok(outcome)) => {
                        if !outcome.ok {
                            failed = true;
                        }
                        outcomes.push(outcome);
                    }
                    Ok(Err(e)) => {
                        eprintln!("[engine] subtask execution error: {:#}", e);
                        failed = true;
                    }
                    Err(join_err) => {
                        eprintln!("[engine] subtask task panicked: {}", join_err);
                        failed = true;
                    }
                }
            }

            if failed {
                break;
            }
        }

        if failed {
            let failures: Vec<String> = outcomes
                .iter()
                .filter(|o| !o.ok)
                .map(|o| {
                    format!(
                        "{}: {}",
                        o.subtask_id,
                        o.error.as_deref().unwrap_or("failed")
                    )
                })
                .collect();
            self.store
                .mark_job_status(ctx.meta.clone(), JobStatus::Failed)
                .await;
            bail!("Subtask(s) failed, merge skipped: {}", failures.join("; "));
        }

        // Merge in plan order, not completion order.
        let mut inputs: Vec<MergeInput> = Vec::new();
        for subtask in &plan.subtasks {
            if let Some(outcome) = outcomes.iter().find(|o| o.subtask_id == subtask.id) {
                inputs.push(MergeInput {
                    subtask_id: outcome.subtask_id.clone(),
                    branch: outcome.branch.clone(),
                    worktree: outcome.worktree.display().to_string(),
                    summary: outcome.summary.clone(),
                });
            }
        }

        run_merge(ctx, &inputs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{FakeRunner, fixture};
    use crate::store::SubtaskStatus;

    fn plan_subtask(id: &str, group: Option<&str>) -> PlanSubtask {
        PlanSubtask {
            id: id.into(),
            title: format!("Task {}", id),
            description: format!("do {}", id),
            parallel_group: group.map(String::from),
            context: None,
            notes: None,
        }
    }

    fn plan(can_parallelize: bool, subtasks: Vec<PlanSubtask>) -> Plan {
        Plan {
            can_parallelize,
            subtasks,
        }
    }

    #[test]
    fn batches_group_by_label_in_first_appearance_order() {
        let p = plan(
            true,
            vec![
                plan_subtask("a", Some("g1")),
                plan_subtask("b", Some("g2")),
                plan_subtask("c", Some("g1")),
                plan_subtask("d", None),
            ],
        );
        let batches = batch_plan(&p);
        assert_eq!(batches.len(), 3);
        assert_eq!(
            batches[0].iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
        assert_eq!(batches[1][0].id, "b");
        assert_eq!(batches[2][0].id, "d");
    }

    #[test]
    fn sequential_plans_get_singleton_batches() {
        let p = plan(
            false,
            vec![plan_subtask("a", Some("g1")), plan_subtask("b", Some("g1"))],
        );
        let batches = batch_plan(&p);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0][0].id, "a");
        assert_eq!(batches[1][0].id, "b");
    }

    #[test]
    fn empty_group_labels_are_solo_batches() {
        let p = plan(
            true,
            vec![plan_subtask("a", Some("  ")), plan_subtask("b", Some(""))],
        );
        let batches = batch_plan(&p);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn worktree_names_are_unique_within_a_job() {
        let a = plan_subtask("Fix API", None);
        let b = plan_subtask("fix api", None);
        let c = plan_subtask("fix-api", None);
        let names = assign_worktree_names(&[&a, &b, &c]);
        assert_eq!(names, vec!["task-fix-api", "task-fix-api-2", "task-fix-api-3"]);
    }

    #[test]
    fn slugify_lowercases_and_collapses() {
        assert_eq!(slugify("Fix the API!"), "fix-the-api");
        assert_eq!(slugify("a__b"), "a-b");
        assert_eq!(slugify("--x--"), "x");
    }

    #[test]
    fn sanitize_job_id_strips_illegal_characters() {
        assert_eq!(sanitize_job_id("job 1/2"), "job-1-2");
        assert_eq!(sanitize_job_id("job-20250101-120000"), "job-20250101-120000");
        assert!(sanitize_job_id("///").starts_with("job-"));
    }

    fn script_subtask(runner: &FakeRunner, id: &str) {
        runner.push_keyed(
            &format!("\"subtaskId\": \"{}\"", id),
            &format!(
                r#"{{"subtaskId": "{}", "status": "ok", "summary": "done {}", "importantFiles": []}}"#,
                id, id
            ),
        );
    }

    #[tokio::test]
    async fn happy_path_parallel_plan_reaches_done() {
        let fx = fixture("job-e2e").await;
        let engine = Engine::new(fx.ctx.store.clone(), fx.runner.clone());

        // Plan: a,b share g1; c is g2 — two batches.
        fx.runner.push_keyed(
            "implementation plan",
            r#"{"canParallelize": true, "subtasks": [
                {"id": "a", "title": "A", "description": "da", "parallelGroup": "g1"},
                {"id": "b", "title": "B", "description": "db", "parallelGroup": "g1"},
                {"id": "c", "title": "C", "description": "dc", "parallelGroup": "g2"}
            ]}"#,
        );
        for id in ["a", "b", "c"] {
            script_subtask(&fx.runner, id);
        }

        let options = JobOptions {
            repo_root: Some(fx.ctx.repo_root.clone()),
            base_branch: Some("main".into()),
            job_id: Some("job-e2e".into()),
            ..Default::default()
        };
        let report = engine.run_job("add the feature", options).await.unwrap();
        assert_eq!(report.status, JobStatus::Done);
        assert!(report.succeeded());
        let merge = report.merge.unwrap();
        assert_eq!(merge.status, MergeStatus::Ok);
        assert!(merge.notes.contains("Merged 3 branches"));

        let dash = fx.ctx.store.read_dashboard_data().await.unwrap();
        let snap = &dash.jobs[0];
        assert_eq!(snap.job.status, JobStatus::Done);
        assert_eq!(snap.subtasks.len(), 3);
        assert!(
            snap.subtasks
                .iter()
                .all(|s| s.status == SubtaskStatus::Completed)
        );
        // Branches embed the job id and are pairwise distinct.
        let branches: Vec<_> = snap
            .subtasks
            .iter()
            .map(|s| s.branch.clone().unwrap())
            .collect();
        assert!(branches.iter().all(|b| b.ends_with("-job-e2e")));
        let unique: std::collections::HashSet<_> = branches.iter().collect();
        assert_eq!(unique.len(), branches.len());
    }

    #[tokio::test]
    async fn failed_subtask_skips_later_batches_and_merge() {
        let fx = fixture("job-fail").await;
        let engine = Engine::new(fx.ctx.store.clone(), fx.runner.clone());

        fx.runner.push_keyed(
            "implementation plan",
            r#"{"canParallelize": true, "subtasks": [
                {"id": "s1", "title": "One", "description": "d1", "parallelGroup": "g1"},
                {"id": "s2", "title": "Two", "description": "d2", "parallelGroup": "g2"}
            ]}"#,
        );
        // s1 fails with a parseable failure object on stderr.
        fx.runner.push_keyed_failure(
            "\"subtaskId\": \"s1\"",
            1,
            "",
            r#"{"subtaskId": "s1", "status": "failed", "summary": "boom", "importantFiles": []}"#,
        );
        // No response scripted for s2 — it must never run.

        let options = JobOptions {
            repo_root: Some(fx.ctx.repo_root.clone()),
            job_id: Some("job-fail".into()),
            ..Default::default()
        };
        let report = engine.run_job("task", options).await.unwrap();
        assert_eq!(report.status, JobStatus::Failed);
        assert!(report.failure.as_deref().unwrap().contains("merge skipped"));

        let dash = fx.ctx.store.read_dashboard_data().await.unwrap();
        let snap = &dash.jobs[0];
        assert_eq!(snap.job.status, JobStatus::Failed);
        assert_eq!(snap.subtasks.len(), 1);
        assert_eq!(snap.subtasks[0].status, SubtaskStatus::Failed);
        assert!(snap.merge_result.is_none());
        assert!(
            !snap
                .artifacts
                .iter()
                .any(|a| a.kind == crate::store::ArtifactKind::MergeInput)
        );
    }

    #[tokio::test]
    async fn empty_plan_promotes_to_done() {
        let fx = fixture("job-empty").await;
        let engine = Engine::new(fx.ctx.store.clone(), fx.runner.clone());
        fx.runner
            .push_keyed("implementation plan", r#"{"canParallelize": false, "subtasks": []}"#);

        let options = JobOptions {
            repo_root: Some(fx.ctx.repo_root.clone()),
            job_id: Some("job-empty".into()),
            ..Default::default()
        };
        let report = engine.run_job("task", options).await.unwrap();
        assert_eq!(report.status, JobStatus::Done);
        let merge = report.merge.unwrap();
        assert!(merge.touched_files.is_empty());

        let dash = fx.ctx.store.read_dashboard_data().await.unwrap();
        assert_eq!(dash.jobs[0].job.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn prefactor_respects_analyze_verdict() {
        let fx = fixture("job-pref").await;
        let engine = Engine::new(fx.ctx.store.clone(), fx.runner.clone());

        fx.runner.push_keyed(
            "preparatory refactor would",
            r#"{"shouldRefactor": false, "reasons": ["already modular"]}"#,
        );
        fx.runner
            .push_keyed("implementation plan", r#"{"canParallelize": false, "subtasks": []}"#);

        let options = JobOptions {
            repo_root: Some(fx.ctx.repo_root.clone()),
            job_id: Some("job-pref".into()),
            enable_prefactor: true,
            ..Default::default()
        };
        let report = engine.run_job("task", options).await.unwrap();
        assert_eq!(report.status, JobStatus::Done);

        // Two worker invocations: analyze + plan, no refactor.
        assert_eq!(fx.runner.requests.lock().unwrap().len(), 2);
        let dash = fx.ctx.store.read_dashboard_data().await.unwrap();
        assert!(
            dash.jobs[0]
                .artifacts
                .iter()
                .any(|a| a.kind == crate::store::ArtifactKind::Analysis)
        );
        assert!(
            !dash.jobs[0]
                .artifacts
                .iter()
                .any(|a| a.kind == crate::store::ArtifactKind::Refactor)
        );
    }

    #[tokio::test]
    async fn rerunning_a_terminal_job_id_stays_frozen() {
        let fx = fixture("job-rerun").await;
        let engine = Engine::new(fx.ctx.store.clone(), fx.runner.clone());
        fx.runner
            .push_keyed("implementation plan", r#"{"subtasks": []}"#);

        let options = JobOptions {
            repo_root: Some(fx.ctx.repo_root.clone()),
            job_id: Some("job-rerun".into()),
            ..Default::default()
        };
        let report = engine.run_job("task", options.clone()).await.unwrap();
        assert_eq!(report.status, JobStatus::Done);

        // Second run of the same id: plan fails hard, but the stored job
        // stays done.
        fx.runner.push_keyed_failure("implementation plan", 1, "", "");
        let report2 = engine.run_job("task", options).await.unwrap();
        assert_eq!(report2.status, JobStatus::Failed);
        let dash = fx.ctx.store.read_dashboard_data().await.unwrap();
        assert_eq!(dash.jobs[0].job.status, JobStatus::Done);
    }
}
