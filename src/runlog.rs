//! Structured execution log — one JSON object per line.
//!
//! An append-only JSONL file behind a `Mutex<BufWriter<File>>`, one line
//! per event, so the log is easy to grep and stream while a run is still
//! in progress.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: u64,
    #[serde(flatten)]
    pub event: LogEvent,
}

/// Run-log event kinds (spec §7's "single log record" per failed task,
/// plus the graph/quiescence bookkeeping a real run needs).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    GraphRebuilt { task_count: usize },
    TaskStarted { task_id: String, description: String },
    TaskFinished { task_id: String, description: String },
    TaskFailedRecord {
        task_id: String,
        description: String,
        command: Vec<String>,
        reason: String,
    },
    CascadedSkip {
        task_id: String,
        originating_task: String,
    },
    Quiescent { done: usize, skipped: usize, failed: usize },
}

pub struct RunLog {
    writer: Mutex<BufWriter<File>>,
}

impl RunLog {
    pub fn new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open run log at {}", path.display()))?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: now_unix_secs(),
            event,
        };
        let line = serde_json::to_string(&entry).context("failed to serialize log entry")?;
        let mut writer = self.writer.lock().expect("run log mutex poisoned");
        writeln!(writer, "{line}").context("failed to write log entry")?;
        writer.flush().context("failed to flush run log")?;
        Ok(())
    }
}
