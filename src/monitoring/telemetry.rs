//! Telemetry Sink
//!
//! Append-only structured records of runs and step attempts, kept apart
//! from diagnostic logging. The file sink writes JSON Lines:
//!
//! - `workflow_runs.jsonl`: one [`RunEvent`] per finished run
//! - `workflow_steps.jsonl`: one [`StepEvent`] per step attempt
//!
//! Each record is serialized, then written with a single call and flushed,
//! so a crash loses at most the record being written.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TelemetryError;
use crate::execution::RunResult;
use crate::workflow::StepStatus;

/// File name of the run log.
pub const RUNS_LOG: &str = "workflow_runs.jsonl";

/// File name of the step log.
pub const STEPS_LOG: &str = "workflow_steps.jsonl";

/// One step attempt, or one step skipped on resume.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepEvent {
    pub timestamp: DateTime<Utc>,
    pub workflow_id: String,
    pub run_id: String,
    pub step_id: String,
    pub title: String,
    pub status: StepStatus,
    /// 1-based attempt number; 0 for skipped steps
    pub attempt: u32,
    /// Attempts consumed by the step so far in this run
    #[serde(default)]
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    /// Delay before the next attempt, when one follows
    #[serde(default)]
    pub backoff_ms: Option<u64>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

/// Summary of one finished run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    pub workflow_id: String,
    pub run_id: String,
    pub mode: String,
    pub result: RunResult,
    pub success: bool,
    pub steps_total: usize,
    pub steps_succeeded: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Destination for telemetry records.
///
/// Callers treat errors as non-fatal.
pub trait TelemetrySink: Send + Sync {
    fn record_run(&self, event: &RunEvent) -> Result<(), TelemetryError>;
    fn record_step(&self, event: &StepEvent) -> Result<(), TelemetryError>;
}

/// Appends records to JSON Lines files in a logs directory.
#[derive(Debug)]
pub struct JsonlTelemetry {
    runs_path: PathBuf,
    steps_path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlTelemetry {
    pub fn new(logs_dir: impl AsRef<Path>) -> Self {
        let logs_dir = logs_dir.as_ref();
        Self {
            runs_path: logs_dir.join(RUNS_LOG),
            steps_path: logs_dir.join(STEPS_LOG),
            write_lock: Mutex::new(()),
        }
    }

    pub fn runs_path(&self) -> &Path {
        &self.runs_path
    }

    pub fn steps_path(&self) -> &Path {
        &self.steps_path
    }

    fn append<T: Serialize>(&self, path: &Path, record: &T) -> Result<(), TelemetryError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let io_err = |source| TelemetryError::Io {
            path: path.to_path_buf(),
            source,
        };

        // A poisoned lock only means another writer panicked mid-record.
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)
    }
}

impl TelemetrySink for JsonlTelemetry {
    fn record_run(&self, event: &RunEvent) -> Result<(), TelemetryError> {
        self.append(&self.runs_path, event)
    }

    fn record_step(&self, event: &StepEvent) -> Result<(), TelemetryError> {
        self.append(&self.steps_path, event)
    }
}

/// Keeps records in memory; useful in tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    runs: Mutex<Vec<RunEvent>>,
    steps: Mutex<Vec<StepEvent>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<RunEvent> {
        self.runs
            .lock()
            .map(|runs| runs.clone())
            .unwrap_or_default()
    }

    pub fn steps(&self) -> Vec<StepEvent> {
        self.steps
            .lock()
            .map(|steps| steps.clone())
            .unwrap_or_default()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn record_run(&self, event: &RunEvent) -> Result<(), TelemetryError> {
        if let Ok(mut runs) = self.runs.lock() {
            runs.push(event.clone());
        }
        Ok(())
    }

    fn record_step(&self, event: &StepEvent) -> Result<(), TelemetryError> {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push(event.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn step_event(attempt: u32, status: StepStatus) -> StepEvent {
        StepEvent {
            timestamp: Utc::now(),
            workflow_id: "wrap-session".to_string(),
            run_id: "20260101T000000Z-abcdef".to_string(),
            step_id: "sync_tasks".to_string(),
            title: "Sync tasks".to_string(),
            status,
            attempt,
            attempts: attempt,
            duration_ms: 12,
            exit_code: Some(1),
            error: Some("boom".to_string()),
            backoff_ms: Some(1000),
            metrics: Map::new(),
        }
    }

    fn run_event() -> RunEvent {
        let now = Utc::now();
        RunEvent {
            timestamp: now,
            workflow_id: "wrap-session".to_string(),
            run_id: "20260101T000000Z-abcdef".to_string(),
            mode: "run".to_string(),
            result: RunResult::Succeeded,
            success: true,
            steps_total: 2,
            steps_succeeded: 2,
            steps_failed: 0,
            steps_skipped: 0,
            duration_ms: 40,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_jsonl_appends_one_line_per_record() {
        let dir = tempdir().unwrap();
        let sink = JsonlTelemetry::new(dir.path().join("logs"));

        sink.record_step(&step_event(1, StepStatus::Failed)).unwrap();
        sink.record_step(&step_event(2, StepStatus::Succeeded)).unwrap();
        sink.record_run(&run_event()).unwrap();

        let steps = fs::read_to_string(sink.steps_path()).unwrap();
        let lines: Vec<&str> = steps.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["status"], "failed");
        assert_eq!(first["attempt"], 1);
        assert_eq!(first["attempts"], 1);
        assert_eq!(first["workflow_id"], "wrap-session");

        let runs = fs::read_to_string(sink.runs_path()).unwrap();
        let run: RunEvent = serde_json::from_str(runs.trim()).unwrap();
        assert_eq!(run.result, RunResult::Succeeded);
    }

    #[test]
    fn test_jsonl_reports_unwritable_path() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("logs");
        fs::write(&blocker, "not a directory").unwrap();

        let sink = JsonlTelemetry::new(&blocker);
        let err = sink.record_run(&run_event()).unwrap_err();
        assert!(matches!(err, TelemetryError::Io { .. }));
    }

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemoryTelemetry::new();
        sink.record_step(&step_event(1, StepStatus::TimedOut)).unwrap();
        sink.record_step(&step_event(2, StepStatus::Succeeded)).unwrap();

        let statuses: Vec<StepStatus> = sink.steps().iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![StepStatus::TimedOut, StepStatus::Succeeded]);
        assert!(sink.runs().is_empty());
    }
}
