//! Error Types
//!
//! Failures that abort a run before or at its start. Step-level failures
//! (spawn, runtime, timeout) are not errors here: the engine absorbs them
//! into retry policy as [`AttemptOutcome`](crate::execution::AttemptOutcome)s.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A problem with a single step found while interpreting a workflow document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepIssue {
    /// Title of the offending step as written in the document
    pub step: String,
    /// 1-based line number of the step heading
    pub line: usize,
    /// What is wrong with it
    pub message: String,
}

impl fmt::Display for StepIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step '{}' (line {}): {}", self.step, self.line, self.message)
    }
}

/// Errors raised while locating or parsing a workflow document.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("workflow not found: '{0}'")]
    NotFound(String),

    #[error("failed to read workflow file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid workflow id '{0}': ids may only contain letters, digits, '.', '_' and '-'")]
    InvalidId(String),

    #[error("workflow '{0}' has no steps (expected '### ' headings under a '## Steps' section)")]
    NoSteps(String),

    #[error("workflow '{workflow}' has {} invalid step(s):\n{}", issues.len(), format_issues(issues))]
    Invalid {
        workflow: String,
        issues: Vec<StepIssue>,
    },
}

fn format_issues(issues: &[StepIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("  - {}", issue))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Errors raised by a [`StateStore`](crate::workflow::state::StateStore).
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("state store I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "persisted state for workflow '{workflow_id}' is corrupt ({source}); \
         inspect or remove '{}' before resuming",
        path.display()
    )]
    Corrupt {
        workflow_id: String,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize state for workflow '{workflow_id}': {source}")]
    Serialize {
        workflow_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("persisted state for workflow '{workflow_id}' has unsupported version {found} (expected {expected})")]
    UnsupportedVersion {
        workflow_id: String,
        found: u32,
        expected: u32,
    },

    #[error(
        "workflow '{workflow_id}' is already being run by process {pid}; \
         remove '{}' if that process is gone",
        path.display()
    )]
    Locked {
        workflow_id: String,
        pid: u32,
        path: PathBuf,
    },
}

/// Errors raised by a [`TelemetrySink`](crate::monitoring::TelemetrySink).
///
/// Never fatal to a run; the engine logs them and carries on.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to write telemetry to '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize telemetry record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors that stop the engine from running a workflow at all.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    State(#[from] StateStoreError),

    #[error("unknown step '{selector}' in workflow '{workflow_id}'")]
    UnknownStep {
        workflow_id: String,
        selector: String,
    },
}
