//! Persisted entities and their wire shapes.
//!
//! Everything here serialises camelCase because these structs *are* the
//! dashboard API payload — the snapshot endpoint and the WebSocket stream
//! both emit them directly.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Job status ────────────────────────────────────────────────────────

/// Lifecycle status of a job. Transitions are monotonic in priority
/// order; terminal states freeze.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Analyzing,
    Refactoring,
    Planning,
    Running,
    Merging,
    Done,
    NeedsManualReview,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyzing => "analyzing",
            Self::Refactoring => "refactoring",
            Self::Planning => "planning",
            Self::Running => "running",
            Self::Merging => "merging",
            Self::Done => "done",
            Self::NeedsManualReview => "needs_manual_review",
            Self::Failed => "failed",
        }
    }

    /// Position in the one-way ladder. A write that would lower the
    /// priority is ignored by the store.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Analyzing => 0,
            Self::Refactoring => 1,
            Self::Planning => 2,
            Self::Running => 3,
            Self::Merging => 4,
            Self::Done => 5,
            Self::NeedsManualReview => 6,
            Self::Failed => 7,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::NeedsManualReview | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyzing" => Ok(Self::Analyzing),
            "refactoring" => Ok(Self::Refactoring),
            "planning" => Ok(Self::Planning),
            "running" => Ok(Self::Running),
            "merging" => Ok(Self::Merging),
            "done" => Ok(Self::Done),
            "needs_manual_review" => Ok(Self::NeedsManualReview),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

// ── Subtask status ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SubtaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubtaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid subtask status: {}", s)),
        }
    }
}

// ── Artifact kinds ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Plan,
    PlanProgress,
    Analysis,
    AnalysisProgress,
    Refactor,
    RefactorProgress,
    MergeInput,
    MergeResult,
    MergeError,
    MergeProgress,
    SubtaskResult,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::PlanProgress => "plan_progress",
            Self::Analysis => "analysis",
            Self::AnalysisProgress => "analysis_progress",
            Self::Refactor => "refactor",
            Self::RefactorProgress => "refactor_progress",
            Self::MergeInput => "merge_input",
            Self::MergeResult => "merge_result",
            Self::MergeError => "merge_error",
            Self::MergeProgress => "merge_progress",
            Self::SubtaskResult => "subtask_result",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "plan_progress" => Ok(Self::PlanProgress),
            "analysis" => Ok(Self::Analysis),
            "analysis_progress" => Ok(Self::AnalysisProgress),
            "refactor" => Ok(Self::Refactor),
            "refactor_progress" => Ok(Self::RefactorProgress),
            "merge_input" => Ok(Self::MergeInput),
            "merge_result" => Ok(Self::MergeResult),
            "merge_error" => Ok(Self::MergeError),
            "merge_progress" => Ok(Self::MergeProgress),
            "subtask_result" => Ok(Self::SubtaskResult),
            _ => Err(format!("Invalid artifact kind: {}", s)),
        }
    }
}

// ── Rows ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub repo_root: Option<String>,
    pub base_branch: Option<String>,
    pub task: Option<String>,
    pub user_task: Option<String>,
    pub push_result: bool,
    pub status: JobStatus,
    pub started_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    pub job_id: String,
    pub subtask_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub parallel_group: Option<String>,
    pub worktree: Option<String>,
    pub branch: Option<String>,
    pub summary: Option<String>,
    pub important_files: Vec<String>,
    pub error: Option<String>,
    pub last_reasoning: Option<String>,
    pub status: SubtaskStatus,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub job_id: String,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    pub label: Option<String>,
    pub subtask_id: Option<String>,
    pub created_at: String,
    pub data: serde_json::Value,
}

// ── Embedded payload shapes ───────────────────────────────────────────

/// The plan artifact payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(default)]
    pub can_parallelize: bool,
    #[serde(default)]
    pub subtasks: Vec<PlanSubtask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSubtask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Final outcome of the merge stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub status: MergeStatus,
    pub notes: String,
    #[serde(default)]
    pub touched_files: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Ok,
    NeedsManualReview,
}

// ── Read API views ────────────────────────────────────────────────────

/// One job with everything the dashboard needs to render it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    #[serde(flatten)]
    pub job: Job,
    pub subtasks: Vec<Subtask>,
    pub artifacts: Vec<Artifact>,
    /// Payload of the latest `plan` artifact, if any.
    pub plan: Option<Plan>,
    /// Payload of the latest `merge_result` artifact, if any.
    pub merge_result: Option<MergeResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardData {
    pub jobs: Vec<JobSnapshot>,
}
