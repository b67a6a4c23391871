//! Workflow State Persistence
//!
//! Provides durable run progress so an interrupted workflow can be resumed
//! without repeating steps that already succeeded.
//!
//! One [`RunState`] is kept per workflow id. The file-backed store writes it
//! to `<state_dir>/<workflow_id>.json` after every step transition, through a
//! temporary file that is renamed into place, so a crash never leaves a
//! half-written record behind.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use uuid::Uuid;

use super::model::Workflow;
use crate::error::StateStoreError;

/// Version of the persisted [`RunState`] layout.
pub const STATE_VERSION: u32 = 1;

/// Status of a step, both in flight and as persisted.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not attempted yet
    #[default]
    Pending,
    /// An attempt has been dispatched
    Running,
    /// Finished successfully
    Succeeded,
    /// Retries exhausted
    Failed,
    /// Waiting out a backoff delay before the next attempt
    Retrying,
    /// Attempt exceeded its time budget
    TimedOut,
    /// Not executed: already succeeded on a previous run, or nothing to run
    Skipped,
}

impl StepStatus {
    /// Returns true for statuses a step ends a run in.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Skipped
        )
    }

    /// Returns true if the step ended in failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::TimedOut => "timed_out",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted outcome of one step within a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct StepRecord {
    pub status: StepStatus,

    /// Attempts consumed by the latest execution of the step
    #[serde(default)]
    pub attempts: u32,

    /// Wall-clock time across all attempts, including backoff
    #[serde(default)]
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Metrics reported through the output contract
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metrics: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Persistent progress of one run of a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunState {
    pub version: u32,
    pub workflow_id: String,
    pub run_id: String,

    /// Index of the next step to attempt
    pub cursor: usize,

    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Step id to outcome, in workflow order
    pub step_statuses: IndexMap<String, StepRecord>,
}

impl RunState {
    /// Creates a fresh state with every step pending.
    pub fn new(workflow: &Workflow, run_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            workflow_id: workflow.id.clone(),
            run_id: run_id.into(),
            cursor: 0,
            started_at: now,
            updated_at: now,
            step_statuses: workflow
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepRecord::default()))
                .collect(),
        }
    }

    /// Aligns the step map with the current parse of the workflow.
    ///
    /// Steps added since the state was saved become pending; records for
    /// steps that no longer exist are dropped.
    pub fn reconcile(&mut self, workflow: &Workflow) {
        let mut previous = std::mem::take(&mut self.step_statuses);
        for step in &workflow.steps {
            let record = previous.shift_remove(&step.id).unwrap_or_default();
            self.step_statuses.insert(step.id.clone(), record);
        }
        for stale in previous.keys() {
            debug!("Dropping state for removed step '{}'", stale);
        }
        self.cursor = self.cursor.min(workflow.steps.len());
    }

    pub fn record(&self, step_id: &str) -> Option<&StepRecord> {
        self.step_statuses.get(step_id)
    }

    /// Returns the record for a step, creating a pending one if absent.
    pub fn record_mut(&mut self, step_id: &str) -> &mut StepRecord {
        self.updated_at = Utc::now();
        self.step_statuses.entry(step_id.to_string()).or_default()
    }

    /// Returns true if the step succeeded in this run.
    pub fn is_succeeded(&self, step_id: &str) -> bool {
        self.record(step_id)
            .map(|r| r.status == StepStatus::Succeeded)
            .unwrap_or(false)
    }
}

/// Generates a run id: UTC start time plus a short random suffix.
pub fn new_run_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"), &suffix[..6])
}

/// Exclusive hold on a workflow id's state, released on drop.
#[derive(Debug)]
pub struct StateLock {
    path: Option<PathBuf>,
}

impl StateLock {
    /// A lock that guards nothing, for stores without cross-process writers.
    pub fn unguarded() -> Self {
        Self { path: None }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to release state lock {}: {}", path.display(), e);
            }
        }
    }
}

/// Storage for [`RunState`], keyed by workflow id.
///
/// At most one state is retained per id; saving replaces it.
pub trait StateStore: Send + Sync {
    /// Loads the state for a workflow, or `None` if none was ever saved.
    fn load(&self, workflow_id: &str) -> Result<Option<RunState>, StateStoreError>;

    /// Atomically replaces the state for `state.workflow_id`.
    fn save(&self, state: &RunState) -> Result<(), StateStoreError>;

    /// Takes the exclusive writer lock for a workflow id.
    fn lock(&self, workflow_id: &str) -> Result<StateLock, StateStoreError>;
}

/// JSON files in a directory, one per workflow id.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the state file path for a workflow id.
    pub fn state_path(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", workflow_id))
    }

    fn lock_path(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", workflow_id))
    }

    fn ensure_dir(&self) -> Result<(), StateStoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StateStoreError::Io {
            path: self.dir.clone(),
            source,
        })
    }
}

impl StateStore for FileStateStore {
    fn load(&self, workflow_id: &str) -> Result<Option<RunState>, StateStoreError> {
        let path = self.state_path(workflow_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StateStoreError::Io { path, source }),
        };

        let corrupt = |source| StateStoreError::Corrupt {
            workflow_id: workflow_id.to_string(),
            path: path.clone(),
            source,
        };

        let value: Value = serde_json::from_str(&content).map_err(corrupt)?;
        if let Some(found) = value.get("version").and_then(Value::as_u64) {
            if found != u64::from(STATE_VERSION) {
                return Err(StateStoreError::UnsupportedVersion {
                    workflow_id: workflow_id.to_string(),
                    found: u32::try_from(found).unwrap_or(u32::MAX),
                    expected: STATE_VERSION,
                });
            }
        }
        let state: RunState = serde_json::from_value(value).map_err(corrupt)?;

        info!("Loaded workflow state from {}", path.display());
        Ok(Some(state))
    }

    fn save(&self, state: &RunState) -> Result<(), StateStoreError> {
        self.ensure_dir()?;

        let path = self.state_path(&state.workflow_id);
        let json = serde_json::to_string_pretty(state).map_err(|source| {
            StateStoreError::Serialize {
                workflow_id: state.workflow_id.clone(),
                source,
            }
        })?;

        let io_err = |source| StateStoreError::Io {
            path: path.clone(),
            source,
        };

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;

        debug!("Saved workflow state to {}", path.display());
        Ok(())
    }

    fn lock(&self, workflow_id: &str) -> Result<StateLock, StateStoreError> {
        self.ensure_dir()?;
        let path = self.lock_path(workflow_id);

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id()).map_err(|source| {
                        StateStoreError::Io {
                            path: path.clone(),
                            source,
                        }
                    })?;
                    return Ok(StateLock { path: Some(path) });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());

                    match holder {
                        Some(pid) if process_alive(pid) => {
                            return Err(StateStoreError::Locked {
                                workflow_id: workflow_id.to_string(),
                                pid,
                                path,
                            });
                        }
                        _ => {
                            warn!("Reclaiming stale state lock {}", path.display());
                            if let Err(source) = fs::remove_file(&path) {
                                if source.kind() != ErrorKind::NotFound {
                                    return Err(StateStoreError::Io { path, source });
                                }
                            }
                        }
                    }
                }
                Err(source) => return Err(StateStoreError::Io { path, source }),
            }
        }

        Err(StateStoreError::Locked {
            workflow_id: workflow_id.to_string(),
            pid: 0,
            path,
        })
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// In-process store, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, RunState>>,
    saves: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the stored state for a workflow.
    pub fn snapshot(&self, workflow_id: &str) -> Option<RunState> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(workflow_id)
            .cloned()
    }

    /// Number of times [`StateStore::save`] has been called.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, workflow_id: &str) -> Result<Option<RunState>, StateStoreError> {
        Ok(self.snapshot(workflow_id))
    }

    fn save(&self, state: &RunState) -> Result<(), StateStoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(state.workflow_id.clone(), state.clone());
        Ok(())
    }

    fn lock(&self, _workflow_id: &str) -> Result<StateLock, StateStoreError> {
        Ok(StateLock::unguarded())
    }
}
