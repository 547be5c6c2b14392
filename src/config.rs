//! Environment and override resolution.
//!
//! Every knob has the same precedence: explicit caller value, then the
//! environment, then a default. The resolution helpers live here so the
//! cascades are written (and tested) exactly once.

use std::path::PathBuf;

/// Environment variable names.
pub const ENV_BASE_DIR: &str = "ORCHESTRATOR_BASE_DIR";
pub const ENV_JOB_ID: &str = "ORCHESTRATOR_JOB_ID";
pub const ENV_BASE_BRANCH: &str = "ORCHESTRATOR_BASE_BRANCH";
pub const ENV_DB_PATH: &str = "ORCHESTRATOR_DB_PATH";
pub const ENV_TEE: &str = "ORCHESTRATOR_TEE_CODEX";
pub const ENV_WORKER_CMD: &str = "ORCHESTRATOR_WORKER_CMD";
pub const ENV_DASHBOARD_PORT: &str = "DASHBOARD_PORT";

/// Fallback base branch when detection fails entirely.
pub const DEFAULT_BASE_BRANCH: &str = "main";

/// Default dashboard port.
pub const DEFAULT_DASHBOARD_PORT: u16 = 4179;

fn env_nonempty(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// The worker CLI binary. Overridable so deployments (and tests) can
/// substitute the executable.
pub fn worker_command() -> String {
    env_nonempty(ENV_WORKER_CMD).unwrap_or_else(|| "worker-cli".to_string())
}

/// State-store file path: env override, else `orchestrator.db` in the
/// current directory.
pub fn db_path() -> PathBuf {
    env_nonempty(ENV_DB_PATH)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("orchestrator.db"))
}

/// Default repo root when the caller supplies none.
pub fn base_dir() -> Option<PathBuf> {
    env_nonempty(ENV_BASE_DIR).map(PathBuf::from)
}

pub fn env_job_id() -> Option<String> {
    env_nonempty(ENV_JOB_ID)
}

pub fn env_base_branch() -> Option<String> {
    env_nonempty(ENV_BASE_BRANCH)
}

pub fn dashboard_port() -> u16 {
    env_nonempty(ENV_DASHBOARD_PORT)
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_DASHBOARD_PORT)
}

/// Parse a boolean-ish env value: `1/0/yes/no/true/false/on/off`.
pub fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Some(true),
        "0" | "no" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// Terminal tee policy. With a job log active the tee defaults off (the
/// log already has everything); the env override wins either way, and the
/// verbose flag turns it on when no override is present.
pub fn tee_enabled(verbose: bool) -> bool {
    if let Some(forced) = env_nonempty(ENV_TEE).and_then(|v| parse_switch(&v)) {
        return forced;
    }
    verbose
}
