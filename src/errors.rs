//! Typed error hierarchy for the orchestrator.
//!
//! Three enums cover the three failure domains:
//! - `ProcessError` — worker subprocess spawning and exit failures
//! - `GitError` — git subcommand failures
//! - `StageError` — stage-level failures (bad roots, unparseable output,
//!   merge safety violations)
//!
//! Public APIs return `anyhow::Result`; these types ride along as sources
//! so callers can `downcast_ref` where the failure kind matters (the merge
//! flow branches on `GitError::Failed`, stages salvage output from
//! `ProcessError::Exit`).

use std::path::PathBuf;

use thiserror::Error;

/// How much captured child output is kept in error messages.
pub const ERROR_OUTPUT_CAP: usize = 2_000;

/// Truncate captured output for inclusion in an error message, keeping the
/// tail (where the final JSON and last diagnostics live).
pub fn cap_output(s: &str) -> String {
    if s.len() <= ERROR_OUTPUT_CAP {
        return s.to_string();
    }
    let mut idx = s.len() - ERROR_OUTPUT_CAP;
    while !s.is_char_boundary(idx) {
        idx += 1;
    }
    format!("...{}", &s[idx..])
}

/// Errors from running child processes.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{label} exited with code {code:?} (signal {signal:?})")]
    Exit {
        label: String,
        code: Option<i32>,
        signal: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

/// Errors from git subcommands.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {args} failed with exit code {exit_code:?}: {stderr}")]
    Failed {
        args: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

/// Errors from stage execution.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Stage root does not exist: {0}")]
    InvalidRoot(PathBuf),

    #[error("No JSON object found in worker output")]
    NoJsonFound,

    #[error("{stage} output could not be parsed: {message}\nstdout: {stdout}\nstderr: {stderr}")]
    ParseFailed {
        stage: String,
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("Merge of {branch} left unresolved conflicts: {files:?}")]
    MergeUnresolved { branch: String, files: Vec<String> },

    #[error("Worktree .git pointer was modified during conflict resolution of {branch}")]
    MergePointerTampered { branch: String },
}
