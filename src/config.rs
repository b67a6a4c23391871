//! Filesystem layout of the agent directory.
//!
//! Everything the runner reads or writes lives under `<root>/.agent/`:
//!
//! ```text
//! .agent/
//! ├── workflows/            <name>.md workflow documents
//! ├── state/workflow_runs/  <workflow_id>.json persisted run state
//! └── logs/                 workflow_runs.jsonl, workflow_steps.jsonl
//! ```

use std::path::{Path, PathBuf};

use log::debug;

/// Name of the agent directory.
pub const AGENT_DIR: &str = ".agent";

/// Resolved locations of workflows, state and telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerPaths {
    pub root: PathBuf,
    pub workflows_dir: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl RunnerPaths {
    /// Lays out the paths under an explicit root.
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let agent = root.join(AGENT_DIR);
        Self {
            workflows_dir: agent.join("workflows"),
            state_dir: agent.join("state").join("workflow_runs"),
            logs_dir: agent.join("logs"),
            root,
        }
    }

    /// Uses the nearest ancestor of `start` (inclusive) that contains an
    /// agent directory, falling back to `start` itself.
    pub fn discover(start: &Path) -> Self {
        let root = start
            .ancestors()
            .find(|dir| dir.join(AGENT_DIR).is_dir())
            .unwrap_or(start);
        debug!("Using agent root {}", root.display());
        Self::from_root(root)
    }

    /// Path of the run log.
    pub fn runs_log(&self) -> PathBuf {
        self.logs_dir.join(crate::monitoring::telemetry::RUNS_LOG)
    }
}
