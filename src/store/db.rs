//! SQLite-backed state store.
//!
//! One writer at a time behind a mutex, WAL journaling for concurrent
//! readers, foreign keys on. Every recorder call runs in a single
//! transaction. The async facade (`StoreHandle`) runs closures on the
//! blocking pool and — for the recorder methods — swallows failures with a
//! diagnostic line: storage trouble must never stop the pipeline, it only
//! costs dashboard fidelity.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, params};
use serde_json::Value;
use uuid::Uuid;

use super::models::*;

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Identity and context of a job, carried by every recorder call so the
/// job row can be upserted on first contact.
#[derive(Debug, Clone)]
pub struct JobMeta {
    pub job_id: String,
    pub repo_root: Option<String>,
    pub base_branch: Option<String>,
    pub task: Option<String>,
    pub user_task: Option<String>,
    pub push_result: bool,
}

impl JobMeta {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            repo_root: None,
            base_branch: None,
            task: None,
            user_task: None,
            push_result: false,
        }
    }
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL")?;
        self.conn
            .pragma_update(None, "foreign_keys", "ON")
            .context("Failed to enable foreign keys")?;
        self.conn
            .pragma_update(None, "busy_timeout", 5_000)
            .context("Failed to set busy timeout")?;
        self.run_migrations().context("Failed to run migrations")
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    job_id TEXT PRIMARY KEY,
                    repo_root TEXT,
                    base_branch TEXT,
                    task TEXT,
                    user_task TEXT,
                    push_result INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS subtasks (
                    job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
                    subtask_id TEXT NOT NULL,
                    title TEXT,
                    description TEXT,
                    parallel_group TEXT,
                    worktree TEXT,
                    branch TEXT,
                    summary TEXT,
                    important_files TEXT NOT NULL DEFAULT '[]',
                    error TEXT,
                    last_reasoning TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    started_at TEXT,
                    finished_at TEXT,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (job_id, subtask_id)
                );

                CREATE TABLE IF NOT EXISTS artifacts (
                    artifact_id TEXT PRIMARY KEY,
                    job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
                    kind TEXT NOT NULL,
                    label TEXT,
                    subtask_id TEXT,
                    created_at TEXT NOT NULL,
                    data TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_subtasks_job ON subtasks(job_id);
                CREATE INDEX IF NOT EXISTS idx_artifacts_job ON artifacts(job_id);
                CREATE INDEX IF NOT EXISTS idx_artifacts_kind ON artifacts(job_id, kind);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Job writes ────────────────────────────────────────────────────

    /// Insert or update the job row. Status only ever climbs the ladder;
    /// terminal states freeze. Context fields are refreshed on every call.
    fn upsert_job(&self, meta: &JobMeta, status: JobStatus) -> Result<()> {
        let ts = now();
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM jobs WHERE job_id = ?1",
                params![meta.job_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("Failed to read job status")?;

        match existing {
            None => {
                self.conn
                    .execute(
                        "INSERT INTO jobs (job_id, repo_root, base_branch, task, user_task, push_result, status, started_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                        params![
                            meta.job_id,
                            meta.repo_root,
                            meta.base_branch,
                            meta.task,
                            meta.user_task,
                            meta.push_result as i64,
                            status.as_str(),
                            ts,
                        ],
                    )
                    .context("Failed to insert job")?;
            }
            Some(current) => {
                let current =
                    JobStatus::from_str(&current).map_err(|e| anyhow::anyhow!(e))?;
                let next = if current.is_terminal() || status.priority() < current.priority() {
                    current
                } else {
                    status
                };
                self.conn
                    .execute(
                        "UPDATE jobs SET
                            repo_root = COALESCE(?2, repo_root),
                            base_branch = COALESCE(?3, base_branch),
                            task = COALESCE(?4, task),
                            user_task = COALESCE(?5, user_task),
                            push_result = ?6,
                            status = ?7,
                            updated_at = ?8
                         WHERE job_id = ?1",
                        params![
                            meta.job_id,
                            meta.repo_root,
                            meta.base_branch,
                            meta.task,
                            meta.user_task,
                            meta.push_result as i64,
                            next.as_str(),
                            ts,
                        ],
                    )
                    .context("Failed to update job")?;
            }
        }
        Ok(())
    }

    fn append_artifact(
        &self,
        job_id: &str,
        kind: ArtifactKind,
        label: Option<&str>,
        subtask_id: Option<&str>,
        data: &Value,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO artifacts (artifact_id, job_id, kind, label, subtask_id, created_at, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    job_id,
                    kind.as_str(),
                    label,
                    subtask_id,
                    now(),
                    data.to_string(),
                ],
            )
            .context("Failed to insert artifact")?;
        Ok(())
    }

    fn tx<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&Store) -> Result<()>,
    {
        let tx = self.conn.unchecked_transaction()?;
        f(self)?;
        tx.commit().context("Failed to commit transaction")
    }

    pub fn mark_job_status(&mut self, meta: &JobMeta, status: JobStatus) -> Result<()> {
        self.tx(|s| s.upsert_job(meta, status))
    }

    pub fn record_analysis_output(&mut self, meta: &JobMeta, data: &Value) -> Result<()> {
        self.tx(|s| {
            s.upsert_job(meta, JobStatus::Analyzing)?;
            s.append_artifact(&meta.job_id, ArtifactKind::Analysis, None, None, data)
        })
    }

    pub fn record_refactor_output(&mut self, meta: &JobMeta, data: &Value) -> Result<()> {
        self.tx(|s| {
            s.upsert_job(meta, JobStatus::Refactoring)?;
            s.append_artifact(&meta.job_id, ArtifactKind::Refactor, None, None, data)
        })
    }

    pub fn record_planner_output(&mut self, meta: &JobMeta, data: &Value) -> Result<()> {
        self.tx(|s| {
            s.upsert_job(meta, JobStatus::Planning)?;
            s.append_artifact(&meta.job_id, ArtifactKind::Plan, None, None, data)
        })
    }

    pub fn record_merge_start(&mut self, meta: &JobMeta, data: &Value) -> Result<()> {
        self.tx(|s| {
            s.upsert_job(meta, JobStatus::Merging)?;
            s.append_artifact(&meta.job_id, ArtifactKind::MergeInput, None, None, data)
        })
    }

    pub fn record_merge_result(&mut self, meta: &JobMeta, result: &MergeResult) -> Result<()> {
        let status = match result.status {
            MergeStatus::Ok => JobStatus::Done,
            MergeStatus::NeedsManualReview => JobStatus::NeedsManualReview,
        };
        let data = serde_json::to_value(result).context("Failed to serialise merge result")?;
        self.tx(|s| {
            s.upsert_job(meta, status)?;
            s.append_artifact(&meta.job_id, ArtifactKind::MergeResult, None, None, &data)
        })
    }

    pub fn record_merge_failure(&mut self, meta: &JobMeta, error: &str) -> Result<()> {
        let data = serde_json::json!({ "error": error });
        self.tx(|s| {
            s.upsert_job(meta, JobStatus::Failed)?;
            s.append_artifact(&meta.job_id, ArtifactKind::MergeError, None, None, &data)
        })
    }

    /// Append a short progress artifact for live streaming.
    pub fn record_progress(
        &mut self,
        meta: &JobMeta,
        kind: ArtifactKind,
        subtask_id: Option<&str>,
        lines: &str,
    ) -> Result<()> {
        let stage_status = match kind {
            ArtifactKind::AnalysisProgress => JobStatus::Analyzing,
            ArtifactKind::RefactorProgress => JobStatus::Refactoring,
            ArtifactKind::PlanProgress => JobStatus::Planning,
            ArtifactKind::MergeProgress => JobStatus::Merging,
            _ => JobStatus::Running,
        };
        let data = serde_json::json!({ "lines": lines });
        self.tx(|s| {
            s.upsert_job(meta, stage_status)?;
            s.append_artifact(&meta.job_id, kind, None, subtask_id, &data)
        })
    }

    // ── Subtask writes ────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn record_subtask_start(
        &mut self,
        meta: &JobMeta,
        subtask_id: &str,
        title: &str,
        description: &str,
        parallel_group: Option<&str>,
        worktree: &str,
        branch: &str,
    ) -> Result<()> {
        self.tx(|s| {
            s.upsert_job(meta, JobStatus::Running)?;
            let ts = now();
            s.conn
                .execute(
                    "INSERT INTO subtasks (job_id, subtask_id, title, description, parallel_group, worktree, branch, status, started_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'running', ?8, ?8)
                     ON CONFLICT(job_id, subtask_id) DO UPDATE SET
                        title = excluded.title,
                        description = excluded.description,
                        parallel_group = excluded.parallel_group,
                        worktree = excluded.worktree,
                        branch = excluded.branch,
                        status = 'running',
                        started_at = COALESCE(subtasks.started_at, excluded.started_at),
                        updated_at = excluded.updated_at",
                    params![
                        meta.job_id,
                        subtask_id,
                        title,
                        description,
                        parallel_group,
                        worktree,
                        branch,
                        ts,
                    ],
                )
                .context("Failed to upsert subtask start")?;
            Ok(())
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_subtask_result(
        &mut self,
        meta: &JobMeta,
        subtask_id: &str,
        ok: bool,
        summary: &str,
        important_files: &[String],
        error: Option<&str>,
    ) -> Result<()> {
        let job_status = if ok { JobStatus::Running } else { JobStatus::Failed };
        let subtask_status = if ok {
            SubtaskStatus::Completed
        } else {
            SubtaskStatus::Failed
        };
        let files_json =
            serde_json::to_string(important_files).context("Failed to serialise file list")?;
        let data = serde_json::json!({
            "subtaskId": subtask_id,
            "status": if ok { "ok" } else { "failed" },
            "summary": summary,
            "importantFiles": important_files,
            "error": error,
        });
        self.tx(|s| {
            s.upsert_job(meta, job_status)?;
            let ts = now();
            s.conn
                .execute(
                    "INSERT INTO subtasks (job_id, subtask_id, summary, important_files, error, status, started_at, finished_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?7)
                     ON CONFLICT(job_id, subtask_id) DO UPDATE SET
                        summary = excluded.summary,
                        important_files = excluded.important_files,
                        error = excluded.error,
                        status = excluded.status,
                        finished_at = excluded.finished_at,
                        updated_at = excluded.updated_at",
                    params![
                        meta.job_id,
                        subtask_id,
                        summary,
                        files_json,
                        error,
                        subtask_status.as_str(),
                        ts,
                    ],
                )
                .context("Failed to upsert subtask result")?;
            s.append_artifact(
                &meta.job_id,
                ArtifactKind::SubtaskResult,
                None,
                Some(subtask_id),
                &data,
            )
        })
    }

    pub fn record_subtask_reasoning(
        &mut self,
        job_id: &str,
        subtask_id: &str,
        reasoning: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE subtasks SET last_reasoning = ?3, updated_at = ?4
                 WHERE job_id = ?1 AND subtask_id = ?2",
                params![job_id, subtask_id, reasoning, now()],
            )
            .context("Failed to update subtask reasoning")?;
        Ok(())
    }

    /// Promote a live job to `fallback` if it never reached a terminal
    /// state. No-op for terminal or unknown jobs.
    pub fn ensure_terminal_job_status(&mut self, job_id: &str, fallback: JobStatus) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let Some(current) = existing else {
            return Ok(());
        };
        let current = JobStatus::from_str(&current).map_err(|e| anyhow::anyhow!(e))?;
        if current.is_terminal() {
            return Ok(());
        }
        self.conn
            .execute(
                "UPDATE jobs SET status = ?2, updated_at = ?3 WHERE job_id = ?1",
                params![job_id, fallback.as_str(), now()],
            )
            .context("Failed to finalise job status")?;
        Ok(())
    }

    // ── Reads ─────────────────────────────────────────────────────────

    fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
        let status: String = row.get(6)?;
        Ok(Job {
            job_id: row.get(0)?,
            repo_root: row.get(1)?,
            base_branch: row.get(2)?,
            task: row.get(3)?,
            user_task: row.get(4)?,
            push_result: row.get::<_, i64>(5)? != 0,
            status: JobStatus::from_str(&status).unwrap_or(JobStatus::Failed),
            started_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    const JOB_COLUMNS: &'static str =
        "job_id, repo_root, base_branch, task, user_task, push_result, status, started_at, updated_at";

    fn subtasks_for(&self, job_id: &str) -> Result<Vec<Subtask>> {
        let mut stmt = self.conn.prepare(
            "SELECT job_id, subtask_id, title, description, parallel_group, worktree, branch,
                    summary, important_files, error, last_reasoning, status, started_at, finished_at, updated_at
             FROM subtasks WHERE job_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![job_id], |row| {
            let files: String = row.get(8)?;
            let status: String = row.get(11)?;
            Ok(Subtask {
                job_id: row.get(0)?,
                subtask_id: row.get(1)?,
                title: row.get(2)?,
                description: row.get(3)?,
                parallel_group: row.get(4)?,
                worktree: row.get(5)?,
                branch: row.get(6)?,
                summary: row.get(7)?,
                important_files: serde_json::from_str(&files).unwrap_or_default(),
                error: row.get(9)?,
                last_reasoning: row.get(10)?,
                status: SubtaskStatus::from_str(&status).unwrap_or(SubtaskStatus::Pending),
                started_at: row.get(12)?,
                finished_at: row.get(13)?,
                updated_at: row.get(14)?,
            })
        })?;
        let mut subtasks = Vec::new();
        for row in rows {
            subtasks.push(row.context("Failed to read subtask row")?);
        }
        Ok(subtasks)
    }

    /// Artifacts newest first; ties on timestamp break by insertion order.
    fn artifacts_for(&self, job_id: &str) -> Result<Vec<Artifact>> {
        let mut stmt = self.conn.prepare(
            "SELECT artifact_id, job_id, kind, label, subtask_id, created_at, data
             FROM artifacts WHERE job_id = ?1 ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![job_id], |row| {
            let kind: String = row.get(2)?;
            let data: String = row.get(6)?;
            Ok(Artifact {
                id: row.get(0)?,
                job_id: row.get(1)?,
                kind: ArtifactKind::from_str(&kind).unwrap_or(ArtifactKind::Plan),
                label: row.get(3)?,
                subtask_id: row.get(4)?,
                created_at: row.get(5)?,
                data: serde_json::from_str(&data).unwrap_or(Value::Null),
            })
        })?;
        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(row.context("Failed to read artifact row")?);
        }
        Ok(artifacts)
    }

    fn snapshot_for(&self, job: Job) -> Result<JobSnapshot> {
        let subtasks = self.subtasks_for(&job.job_id)?;
        let artifacts = self.artifacts_for(&job.job_id)?;
        // Artifacts are newest-first, so the first match is the latest.
        let plan = artifacts
            .iter()
            .find(|a| a.kind == ArtifactKind::Plan)
            .and_then(|a| serde_json::from_value(a.data.clone()).ok());
        let merge_result = artifacts
            .iter()
            .find(|a| a.kind == ArtifactKind::MergeResult)
            .and_then(|a| serde_json::from_value(a.data.clone()).ok());
        Ok(JobSnapshot {
            job,
            subtasks,
            artifacts,
            plan,
            merge_result,
        })
    }

    /// Everything, newest job first.
    pub fn read_dashboard_data(&self) -> Result<DashboardData> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM jobs ORDER BY started_at DESC, rowid DESC",
            Self::JOB_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::job_from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            let job = row.context("Failed to read job row")?;
            jobs.push(self.snapshot_for(job)?);
        }
        Ok(DashboardData { jobs })
    }

    /// The most recent job that has not reached a terminal state.
    pub fn read_active_job(&self) -> Result<Option<JobSnapshot>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM jobs
             WHERE status NOT IN ('done', 'failed', 'needs_manual_review')
             ORDER BY started_at DESC, rowid DESC LIMIT 1",
            Self::JOB_COLUMNS
        ))?;
        let mut rows = stmt.query_map([], Self::job_from_row)?;
        match rows.next() {
            Some(row) => {
                let job = row.context("Failed to read job row")?;
                Ok(Some(self.snapshot_for(job)?))
            }
            None => Ok(None),
        }
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE job_id = ?1",
            Self::JOB_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![job_id], Self::job_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read job row")?)),
            None => Ok(None),
        }
    }
}

// ── Async facade ──────────────────────────────────────────────────────

/// Clone-able async handle. All access goes through `spawn_blocking` so
/// synchronous SQLite I/O never ties up async worker threads. Recorder
/// methods swallow their own errors (diagnosed on stderr); reads return
/// `Result`.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<Mutex<Store>>,
}

impl StoreHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))?;
            f(&mut guard)
        })
        .await
        .context("Store task panicked")?
    }

    async fn record<F>(&self, what: &'static str, f: F)
    where
        F: FnOnce(&mut Store) -> Result<()> + Send + 'static,
    {
        if let Err(e) = self.call(f).await {
            eprintln!("[store] Failed to record {}: {:#}", what, e);
        }
    }

    pub async fn mark_job_status(&self, meta: JobMeta, status: JobStatus) {
        self.record("job status", move |s| s.mark_job_status(&meta, status))
            .await;
    }

    pub async fn record_analysis_output(&self, meta: JobMeta, data: Value) {
        self.record("analysis output", move |s| {
            s.record_analysis_output(&meta, &data)
        })
        .await;
    }

    pub async fn record_refactor_output(&self, meta: JobMeta, data: Value) {
        self.record("refactor output", move |s| {
            s.record_refactor_output(&meta, &data)
        })
        .await;
    }

    pub async fn record_planner_output(&self, meta: JobMeta, data: Value) {
        self.record("planner output", move |s| {
            s.record_planner_output(&meta, &data)
        })
        .await;
    }

    pub async fn record_merge_start(&self, meta: JobMeta, data: Value) {
        self.record("merge start", move |s| s.record_merge_start(&meta, &data))
            .await;
    }

    pub async fn record_merge_result(&self, meta: JobMeta, result: MergeResult) {
        self.record("merge result", move |s| {
            s.record_merge_result(&meta, &result)
        })
        .await;
    }

    pub async fn record_merge_failure(&self, meta: JobMeta, error: String) {
        self.record("merge failure", move |s| {
            s.record_merge_failure(&meta, &error)
        })
        .await;
    }

    pub async fn record_progress(
        &self,
        meta: JobMeta,
        kind: ArtifactKind,
        subtask_id: Option<String>,
        lines: String,
    ) {
        self.record("progress", move |s| {
            s.record_progress(&meta, kind, subtask_id.as_deref(), &lines)
        })
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_subtask_start(
        &self,
        meta: JobMeta,
        subtask_id: String,
        title: String,
        description: String,
        parallel_group: Option<String>,
        worktree: String,
        branch: String,
    ) {
        self.record("subtask start", move |s| {
            s.record_subtask_start(
                &meta,
                &subtask_id,
                &title,
                &description,
                parallel_group.as_deref(),
                &worktree,
                &branch,
            )
        })
        .await;
    }

    pub async fn record_subtask_result(
        &self,
        meta: JobMeta,
        subtask_id: String,
        ok: bool,
        summary: String,
        important_files: Vec<String>,
        error: Option<String>,
    ) {
        self.record("subtask result", move |s| {
            s.record_subtask_result(
                &meta,
                &subtask_id,
                ok,
                &summary,
                &important_files,
                error.as_deref(),
            )
        })
        .await;
    }

    pub async fn record_subtask_reasoning(
        &self,
        job_id: String,
        subtask_id: String,
        reasoning: String,
    ) {
        self.record("subtask reasoning", move |s| {
            s.record_subtask_reasoning(&job_id, &subtask_id, &reasoning)
        })
        .await;
    }

    pub async fn ensure_terminal_job_status(&self, job_id: String, fallback: JobStatus) {
        self.record("terminal status", move |s| {
            s.ensure_terminal_job_status(&job_id, fallback)
        })
        .await;
    }

    pub async fn read_dashboard_data(&self) -> Result<DashboardData> {
        self.call(|s| s.read_dashboard_data()).await
    }

    pub async fn read_active_job(&self) -> Result<Option<JobSnapshot>> {
        self.call(|s| s.read_active_job()).await
    }
}
