//! Typed wrappers over the system `git` binary.
//!
//! The engine never links a git library; every operation is a subprocess in
//! an explicit working directory, which is what makes concurrent worktrees
//! safe — no two operations share a CWD. Wrappers either check the exit
//! status (`run_checked`) or hand it back as a value (`run`) so callers can
//! branch on conflict states instead of catching errors.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use chrono::Local;
use tokio::process::Command;

use crate::errors::GitError;

/// Author identity stamped on every orchestrator-made commit so they are
/// distinguishable from human commits in the history.
pub const COMMIT_AUTHOR: &str = "conductor";
pub const COMMIT_EMAIL: &str = "conductor@localhost";

/// Captured result of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Git operations bound to one working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Run git and return the outcome as a value, whatever the exit code.
    pub async fn run(&self, args: &[&str]) -> Result<GitOutput> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
        Ok(GitOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run git and fail on non-zero exit.
    pub async fn run_checked(&self, args: &[&str]) -> Result<GitOutput> {
        let out = self.run(args).await?;
        if !out.success() {
            return Err(GitError::Failed {
                args: args.join(" "),
                exit_code: out.exit_code,
                stdout: out.stdout,
                stderr: out.stderr,
            }
            .into());
        }
        Ok(out)
    }

    /// Current branch name, or None on a detached HEAD.
    pub async fn current_branch(&self) -> Result<Option<String>> {
        let out = self
            .run_checked(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        let name = out.stdout.trim().to_string();
        if name == "HEAD" {
            return Ok(None);
        }
        Ok(Some(name))
    }

    pub async fn rev_parse(&self, reference: &str) -> Result<String> {
        let out = self.run_checked(&["rev-parse", reference]).await?;
        Ok(out.stdout.trim().to_string())
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{}", branch);
        let out = self
            .run(&["rev-parse", "--verify", "--quiet", &refname])
            .await?;
        Ok(out.success())
    }

    /// Create `branch` pointing at `base` unless it already exists.
    pub async fn ensure_branch_from(&self, branch: &str, base: &str) -> Result<()> {
        if self.branch_exists(branch).await? {
            return Ok(());
        }
        self.run_checked(&["branch", branch, base]).await?;
        Ok(())
    }

    /// Create a worktree at `path`. With `create_branch`, also creates the
    /// branch (`-b`) pointing at `base`; otherwise checks out the existing
    /// branch.
    pub async fn worktree_add(
        &self,
        path: &Path,
        branch: &str,
        base: Option<&str>,
    ) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;
        match base {
            Some(base) => {
                self.run_checked(&["worktree", "add", "-b", branch, path_str, base])
                    .await?;
            }
            None => {
                self.run_checked(&["worktree", "add", path_str, branch])
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;
        self.run_checked(&["worktree", "remove", "--force", path_str])
            .await?;
        Ok(())
    }

    /// Attempt a merge, leaving the index and working tree in the merged
    /// state without committing. Conflicts surface as a non-zero exit in
    /// the returned value, never as an error.
    pub async fn merge_no_commit(&self, branch: &str) -> Result<GitOutput> {
        self.run(&["merge", "--no-commit", "--no-ff", branch]).await
    }

    /// Paths still in conflict after a merge attempt.
    pub async fn unmerged_files(&self) -> Result<Vec<String>> {
        let out = self
            .run_checked(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    pub async fn status_porcelain(&self) -> Result<String> {
        let out = self.run_checked(&["status", "--porcelain"]).await?;
        Ok(out.stdout)
    }

    pub async fn is_dirty(&self) -> Result<bool> {
        Ok(!self.status_porcelain().await?.trim().is_empty())
    }

    pub async fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"]).await?;
        Ok(())
    }

    /// Commit with the orchestrator author identity forced per invocation,
    /// so no repo or global config leaks into the result.
    pub async fn commit(&self, message: &str) -> Result<()> {
        let author = format!("user.name={}", COMMIT_AUTHOR);
        let email = format!("user.email={}", COMMIT_EMAIL);
        self.run_checked(&["-c", &author, "-c", &email, "commit", "-m", message])
            .await?;
        Ok(())
    }

    /// File names changed in the given range (e.g. `base...HEAD`).
    pub async fn diff_names(&self, range: &str) -> Result<Vec<String>> {
        let out = self.run_checked(&["diff", "--name-only", range]).await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    pub async fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["push", remote, branch]).await?;
        Ok(())
    }
}

/// Sanitise a branch name: any run of characters outside `[A-Za-z0-9._/-]`
/// becomes a single `-`; leading/trailing `-` and `.` are trimmed; an empty
/// result falls back to a timestamped name.
pub fn sanitize_branch(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '/' || c == '-' {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    let trimmed = out.trim_matches(|c| c == '-' || c == '.').to_string();
    if trimmed.is_empty() {
        return format!("branch-{}", Local::now().format("%Y%m%d-%H%M%S"));
    }
    trimmed
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn current_branch_and_rev_parse() {
        let (git, _dir) = test_repo::init().await;
        assert_eq!(git.current_branch().await.unwrap().unwrap(), "main");
        let sha = git.rev_parse("HEAD").await.unwrap();
        assert_eq!(sha.len(), 40);
    }

    #[tokio::test]
    async fn ensure_branch_from_is_idempotent() {
        let (git, _dir) = test_repo::init().await;
        git.ensure_branch_from("feature", "main").await.unwrap();
        git.ensure_branch_from("feature", "main").await.unwrap();
        assert!(git.branch_exists("feature").await.unwrap());
        assert!(!git.branch_exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn worktree_add_creates_branch_and_checkout() {
        let (git, dir) = test_repo::init().await;
        let wt = dir.path().join("wt").join("task-a");
        git.worktree_add(&wt, "task-a-job1", Some("main"))
            .await
            .unwrap();
        assert!(wt.join("README.md").exists());
        let wt_git = Git::new(&wt);
        assert_eq!(
            wt_git.current_branch().await.unwrap().unwrap(),
            "task-a-job1"
        );
        // The worktree's .git is a pointer file, not a directory.
        assert!(wt.join(".git").is_file());
    }

    #[tokio::test]
    async fn dirty_commit_flow() {
        let (git, dir) = test_repo::init().await;
        assert!(!git.is_dirty().await.unwrap());
        std::fs::write(dir.path().join("new.txt"), "data\n").unwrap();
        assert!(git.is_dirty().await.unwrap());
        git.add_all().await.unwrap();
        git.commit("job j1: refactor").await.unwrap();
        assert!(!git.is_dirty().await.unwrap());

        let log = git
            .run_checked(&["log", "-1", "--format=%an <%ae>"])
            .await
            .unwrap();
        assert_eq!(log.stdout.trim(), "conductor <conductor@localhost>");
    }

    #[tokio::test]
    async fn merge_conflict_is_a_value_not_an_error() {
        let (git, dir) = test_repo::init().await;
        std::fs::write(dir.path().join("conflict.txt"), "base\n").unwrap();
        git.add_all().await.unwrap();
        git.commit("add conflict file").await.unwrap();

        git.run_checked(&["checkout", "-b", "feature"]).await.unwrap();
        std::fs::write(dir.path().join("conflict.txt"), "feature\n").unwrap();
        git.add_all().await.unwrap();
        git.commit("feature edit").await.unwrap();

        git.run_checked(&["checkout", "main"]).await.unwrap();
        std::fs::write(dir.path().join("conflict.txt"), "main\n").unwrap();
        git.add_all().await.unwrap();
        git.commit("main edit").await.unwrap();

        let out = git.merge_no_commit("feature").await.unwrap();
        assert!(!out.success());
        let unmerged = git.unmerged_files().await.unwrap();
        assert_eq!(unmerged, vec!["conflict.txt"]);
    }

    #[tokio::test]
    async fn merge_clean_leaves_staged_state() {
        let (git, dir) = test_repo::init().await;
        git.run_checked(&["checkout", "-b", "feature"]).await.unwrap();
        std::fs::write(dir.path().join("feature.txt"), "new\n").unwrap();
        git.add_all().await.unwrap();
        git.commit("feature file").await.unwrap();
        git.run_checked(&["checkout", "main"]).await.unwrap();

        let out = git.merge_no_commit("feature").await.unwrap();
        assert!(out.success());
        assert!(git.unmerged_files().await.unwrap().is_empty());
        assert!(git.is_dirty().await.unwrap());
        git.commit("Merge branch feature").await.unwrap();
        assert!(dir.path().join("feature.txt").exists());
    }

    #[tokio::test]
    async fn diff_names_against_base() {
        let (git, dir) = test_repo::init().await;
        git.run_checked(&["checkout", "-b", "work"]).await.unwrap();
        std::fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b\n").unwrap();
        git.add_all().await.unwrap();
        git.commit("two files").await.unwrap();

        let mut names = git.diff_names("main...HEAD").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn sanitize_branch_replaces_runs_and_trims() {
        assert_eq!(sanitize_branch("task <1>"), "task-1");
        assert_eq!(sanitize_branch("Add API!!endpoint"), "Add-API-endpoint");
        assert_eq!(sanitize_branch("--weird--"), "weird");
        assert_eq!(sanitize_branch(".hidden."), "hidden");
        assert_eq!(sanitize_branch("feature/sub_part.v2"), "feature/sub_part.v2");
    }

    #[test]
    fn sanitize_branch_empty_falls_back_to_timestamp() {
        let name = sanitize_branch("!!!");
        assert!(name.starts_with("branch-"));
        assert!(name.len() > "branch-".len());
    }

    #[test]
    fn sanitize_branch_output_is_always_legal() {
        for input in ["héllo wörld", "a b c", "x", "----", "ok/path", "tab\tsep"] {
            let s = sanitize_branch(input);
            assert!(
                s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || "._/-".contains(c)),
                "illegal char in {:?}",
                s
            );
            assert!(!s.starts_with('-') && !s.ends_with('-'));
            assert!(!s.starts_with('.') && !s.ends_with('.'));
        }
    }
}
