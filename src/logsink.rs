//! Line sinks for worker output.
//!
//! The process runner writes each completed output line exactly once into a
//! fan-out of sinks; the job log file, the terminal tee, and any progress
//! harvester are all just sinks, so adding a consumer never touches the
//! runner. File appends are line-atomic: one locked `write_all` per line,
//! newline included.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Local;

/// Timestamp prefix shared by the job log and the terminal tee.
fn stamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// A consumer of completed output lines.
pub trait LineSink: Send + Sync {
    fn line(&self, label: &str, line: &str);
}

/// Append-only job log file. Every line is written as
/// `YYYY-MM-DD HH:MM:SS [label] <line>\n` under a mutex so lines from
/// concurrent subtasks interleave but never tear.
pub struct JobLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JobLog {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open job log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LineSink for JobLog {
    fn line(&self, label: &str, line: &str) {
        let entry = format!("{} [{}] {}\n", stamp(), label, line);
        if let Ok(mut file) = self.file.lock() {
            if let Err(e) = file.write_all(entry.as_bytes()) {
                eprintln!("[log] Failed to append to {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Best-effort tee to the controlling terminal.
pub struct TerminalTee;

impl LineSink for TerminalTee {
    fn line(&self, label: &str, line: &str) {
        eprintln!("{} [{}] {}", stamp(), label, line);
    }
}

/// Fan-out over a set of sinks. The runner holds one of these and writes
/// each line once.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn LineSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn LineSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn push(&mut self, sink: Arc<dyn LineSink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl LineSink for SinkSet {
    fn line(&self, label: &str, line: &str) {
        for sink in &self.sinks {
            sink.line(label, line);
        }
    }
}
