//! Child process supervision for worker and git invocations.
//!
//! The runner spawns a child with stdin closed, streams stdout and stderr
//! line by line into the configured sinks (job log, terminal tee, progress
//! callbacks), and keeps tail-bounded copies of both streams in memory.
//! The bound discards the *oldest* bytes, so the final JSON object — which
//! always appears near the end of worker output — survives arbitrarily
//! verbose runs.
//!
//! `ProcessRunner` is a seam: the engine and every stage take it as a
//! shared handle, and tests substitute a scripted implementation. No
//! module-level mutable state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::errors::ProcessError;
use crate::logsink::{LineSink, SinkSet};

/// Default cap on retained stdout/stderr (2 MiB each).
pub const DEFAULT_CAPTURE_LIMIT: usize = 2 * 1024 * 1024;

/// Callback invoked with each completed output line.
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// One child invocation.
#[derive(Clone)]
pub struct RunRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Short label used in log prefixes, e.g. `worker:plan` or `git`.
    pub label: String,
    pub capture_limit: usize,
    pub sinks: SinkSet,
    pub on_stdout_line: Option<LineCallback>,
    pub on_stderr_line: Option<LineCallback>,
}

impl RunRequest {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            label: "child".to_string(),
            capture_limit: DEFAULT_CAPTURE_LIMIT,
            sinks: SinkSet::new(),
            on_stdout_line: None,
            on_stderr_line: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn sinks(mut self, sinks: SinkSet) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn on_stdout(mut self, cb: LineCallback) -> Self {
        self.on_stdout_line = Some(cb);
        self
    }

    pub fn on_stderr(mut self, cb: LineCallback) -> Self {
        self.on_stderr_line = Some(cb);
        self
    }
}

/// Captured result of a successful (exit 0) child run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Bytes discarded from the front of each stream, if any.
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

/// Seam for spawning children. The production impl shells out; tests
/// substitute canned outputs.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, req: RunRequest) -> Result<RunOutput>;

    /// Terminate every child this runner is currently supervising.
    async fn kill_all(&self);
}

/// Tail-bounded line accumulator.
struct TailBuffer {
    buf: String,
    limit: usize,
    truncated: usize,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
            truncated: 0,
        }
    }

    fn push_line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
        if self.buf.len() > self.limit {
            let mut cut = self.buf.len() - self.limit;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.truncated += cut;
            self.buf.drain(..cut);
        }
    }
}

/// The real runner. Tracks its live children so shutdown can terminate
/// them; each child is removed from the map before it is reaped.
pub struct SystemProcessRunner {
    running: Arc<Mutex<HashMap<u64, tokio::process::Child>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl SystemProcessRunner {
    pub fn new() -> Self {
        Self {
            running: Arc::new(Mutex::new(HashMap::new())),
            next_id: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl Default for SystemProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

async fn drain_stream<R>(
    stream: R,
    label: String,
    sinks: SinkSet,
    callback: Option<LineCallback>,
    limit: usize,
) -> TailBuffer
where
    R: AsyncRead + Unpin,
{
    let mut tail = TailBuffer::new(limit);
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        sinks.line(&label, &line);
        if let Some(cb) = &callback {
            cb(&line);
        }
        tail.push_line(&line);
    }
    tail
}

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(&self, req: RunRequest) -> Result<RunOutput> {
        let mut cmd = Command::new(&req.command);
        cmd.args(&req.args)
            .current_dir(&req.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
            command: req.command.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .context("Failed to capture child stdout")?;
        let stderr = child
            .stderr
            .take()
            .context("Failed to capture child stderr")?;

        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        {
            let mut running = self.running.lock().await;
            running.insert(id, child);
        }

        let stdout_task = tokio::spawn(drain_stream(
            stdout,
            req.label.clone(),
            req.sinks.clone(),
            req.on_stdout_line.clone(),
            req.capture_limit,
        ));
        let stderr_task = tokio::spawn(drain_stream(
            stderr,
            req.label.clone(),
            req.sinks.clone(),
            req.on_stderr_line.clone(),
            req.capture_limit,
        ));

        let stdout_tail = stdout_task.await.context("stdout reader panicked")?;
        let stderr_tail = stderr_task.await.context("stderr reader panicked")?;

        // Reap the child. It may already have been killed via kill_all, in
        // which case the map entry is gone and the kill path owns the wait.
        let child = {
            let mut running = self.running.lock().await;
            running.remove(&id)
        };
        let status = match child {
            Some(mut child) => child
                .wait()
                .await
                .with_context(|| format!("Failed to wait for {}", req.command))?,
            None => {
                return Err(ProcessError::Exit {
                    label: req.label,
                    code: None,
                    signal: None,
                    stdout: stdout_tail.buf,
                    stderr: stderr_tail.buf,
                }
                .into());
            }
        };

        if status.success() {
            Ok(RunOutput {
                stdout: stdout_tail.buf,
                stderr: stderr_tail.buf,
                exit_code: 0,
                stdout_truncated: stdout_tail.truncated,
                stderr_truncated: stderr_tail.truncated,
            })
        } else {
            #[cfg(unix)]
            let signal = std::os::unix::process::ExitStatusExt::signal(&status);
            #[cfg(not(unix))]
            let signal = None;
            Err(ProcessError::Exit {
                label: req.label,
                code: status.code(),
                signal,
                stdout: stdout_tail.buf,
                stderr: stderr_tail.buf,
            }
            .into())
        }
    }

    async fn kill_all(&self) {
        let mut running = self.running.lock().await;
        for (id, child) in running.iter_mut() {
            if let Err(e) = child.start_kill() {
                eprintln!("[process] Failed to kill child {}: {}", id, e);
            }
        }
        for (_, mut child) in running.drain() {
            let _ = child.wait().await;
        }
    }
}

/// Pull the captured streams out of a failed run, if the failure carried
/// them. Stages use this to honour parseable JSON on failure paths.
pub fn salvage_output(err: &anyhow::Error) -> Option<(String, String)> {
    match err.downcast_ref::<ProcessError>() {
        Some(ProcessError::Exit { stdout, stderr, .. }) => {
            Some((stdout.clone(), stderr.clone()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sh(script: &str) -> RunRequest {
        RunRequest::new("sh", std::env::temp_dir())
            .arg("-c")
            .arg(script)
            .label("test")
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr_separately() {
        let runner = SystemProcessRunner::new();
        let out = runner
            .run(sh("echo out; echo err >&2"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout_truncated, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_captured_output() {
        let runner = SystemProcessRunner::new();
        let err = runner
            .run(sh("echo partial; echo oops >&2; exit 3"))
            .await
            .unwrap_err();
        let (stdout, stderr) = salvage_output(&err).expect("output should be salvageable");
        assert_eq!(stdout, "partial\n");
        assert_eq!(stderr, "oops\n");
        match err.downcast_ref::<ProcessError>() {
            Some(ProcessError::Exit { code, .. }) => assert_eq!(*code, Some(3)),
            other => panic!("Expected Exit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_failure() {
        let runner = SystemProcessRunner::new();
        let err = runner
            .run(RunRequest::new("definitely-not-a-real-binary-xyz", "/tmp"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProcessError>(),
            Some(ProcessError::SpawnFailed { .. })
        ));
        assert!(salvage_output(&err).is_none());
    }

    #[tokio::test]
    async fn capture_is_tail_preserving() {
        let runner = SystemProcessRunner::new();
        // 200 numbered lines, limit small enough to force truncation.
        let mut req = sh("i=0; while [ $i -lt 200 ]; do echo line-$i; i=$((i+1)); done; echo '{\"done\":true}'");
        req.capture_limit = 256;
        let out = runner.run(req).await.unwrap();
        assert!(out.stdout.len() <= 256);
        assert!(out.stdout_truncated > 0);
        assert!(!out.stdout.contains("line-0\n"));
        assert!(out.stdout.ends_with("{\"done\":true}\n"));
    }

    #[tokio::test]
    async fn line_callbacks_see_every_line() {
        let runner = SystemProcessRunner::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let req = sh("echo a; echo b; echo c").on_stdout(Arc::new(move |_line| {
            seen_cb.fetch_add(1, Ordering::SeqCst);
        }));
        runner.run(req).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn sinks_receive_lines_from_both_streams() {
        use crate::logsink::JobLog;
        let dir = tempfile::TempDir::new().unwrap();
        let log = Arc::new(JobLog::create(&dir.path().join("orchestrator.log")).unwrap());
        let sinks = SinkSet::new().with(log.clone() as Arc<dyn LineSink>);

        let runner = SystemProcessRunner::new();
        runner
            .run(sh("echo from-stdout; echo from-stderr >&2").sinks(sinks))
            .await
            .unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("[test] from-stdout"));
        assert!(content.contains("[test] from-stderr"));
    }

    #[tokio::test]
    async fn kill_all_terminates_children() {
        let runner = Arc::new(SystemProcessRunner::new());
        let r = runner.clone();
        let handle = tokio::spawn(async move { r.run(sh("sleep 30")).await });

        // Let the child get registered.
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
            if !runner.running.lock().await.is_empty() {
                break;
            }
        }
        runner.kill_all().await;

        let result = tokio::time::timeout(tokio::time::Duration::from_secs(5), handle)
            .await
            .expect("run should return promptly after kill")
            .unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn tail_buffer_drains_at_char_boundaries() {
        let mut tail = TailBuffer::new(8);
        tail.push_line("éééééééé");
        assert!(tail.buf.len() <= 8);
        assert!(tail.truncated > 0);
        // Still valid UTF-8 (would have panicked on a bad drain).
        let _ = tail.buf.chars().count();
    }
}
