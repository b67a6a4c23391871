//! Workflow Data Model
//!
//! Core data structures for a parsed workflow: an ordered list of steps,
//! each with its executable blocks and retry/timeout/failure policy.
//!
//! A [`Workflow`] is rebuilt from its markdown source on every invocation
//! and never mutated afterwards; persisted progress lives in
//! [`RunState`](super::state::RunState), keyed by [`Workflow::id`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Interpreter used for a fenced executable block.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Bash,
    Sh,
    PowerShell,
    Pwsh,
}

impl ShellKind {
    /// Maps a code fence info string (` ```bash `) to a shell.
    ///
    /// Returns `None` for fences that are documentation rather than
    /// something to execute.
    pub fn from_fence(info: &str) -> Option<Self> {
        let lang = info.split_whitespace().next().unwrap_or("").to_lowercase();
        match lang.as_str() {
            "bash" | "shell" => Some(Self::Bash),
            "sh" => Some(Self::Sh),
            "powershell" | "ps1" => Some(Self::PowerShell),
            "pwsh" => Some(Self::Pwsh),
            _ => None,
        }
    }

    /// Program and leading arguments; the script text is appended last.
    pub fn invocation(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Self::Bash => ("bash", &["-c"]),
            Self::Sh => ("sh", &["-c"]),
            Self::PowerShell => (
                "powershell",
                &["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command"],
            ),
            Self::Pwsh => ("pwsh", &["-NoProfile", "-Command"]),
        }
    }
}

impl fmt::Display for ShellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bash => "bash",
            Self::Sh => "sh",
            Self::PowerShell => "powershell",
            Self::Pwsh => "pwsh",
        };
        f.write_str(name)
    }
}

/// One fenced executable block of a step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommandBlock {
    pub shell: ShellKind,
    pub script: String,
}

/// What the engine does once a step has exhausted its retries.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnFail {
    /// Halt the run; later steps are never attempted
    #[default]
    Stop,
    /// Record the failure and move on to the next step
    Continue,
}

impl FromStr for OnFail {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stop" => Ok(Self::Stop),
            "continue" => Ok(Self::Continue),
            other => Err(format!("on_fail must be 'stop' or 'continue', got '{}'", other)),
        }
    }
}

impl fmt::Display for OnFail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stop => "stop",
            Self::Continue => "continue",
        })
    }
}

/// Whether a step must end its stdout with a structured result line.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContractMode {
    /// Exit code decides when no result line is present
    #[default]
    Lenient,
    /// A missing or unparsable result line fails the attempt
    Strict,
}

impl FromStr for ContractMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lenient" => Ok(Self::Lenient),
            "strict" => Ok(Self::Strict),
            other => Err(format!("contract must be 'lenient' or 'strict', got '{}'", other)),
        }
    }
}

impl fmt::Display for ContractMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lenient => "lenient",
            Self::Strict => "strict",
        })
    }
}

/// A single step of a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Unique identifier within the workflow (directive `id` or title slug)
    pub id: String,

    /// Heading text as written in the document
    pub title: String,

    /// Executable blocks, in document order
    #[serde(default)]
    pub commands: Vec<CommandBlock>,

    /// Additional attempts allowed after the first failure
    #[serde(default)]
    pub retries: u32,

    /// Wall-clock budget for one attempt, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,

    #[serde(default)]
    pub on_fail: OnFail,

    #[serde(default)]
    pub contract: ContractMode,
}

impl Step {
    /// Creates a step with default policy and no commands.
    ///
    /// # Example
    ///
    /// ```
    /// use workflow_runner::workflow::{OnFail, Step};
    ///
    /// let step = Step::new("sync_tasks", "Sync tasks")
    ///     .with_bash("./sync.sh")
    ///     .with_retries(2)
    ///     .with_timeout_s(120)
    ///     .with_on_fail(OnFail::Stop);
    /// assert_eq!(step.effective_retries(None), 2);
    /// ```
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            title: title.into().trim().to_string(),
            commands: Vec::new(),
            retries: 0,
            timeout_s: None,
            on_fail: OnFail::Stop,
            contract: ContractMode::Lenient,
        }
    }

    /// Appends an executable block.
    pub fn with_command(mut self, shell: ShellKind, script: impl Into<String>) -> Self {
        self.commands.push(CommandBlock {
            shell,
            script: script.into(),
        });
        self
    }

    /// Appends a bash block.
    pub fn with_bash(self, script: impl Into<String>) -> Self {
        self.with_command(ShellKind::Bash, script)
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout_s(mut self, timeout_s: u64) -> Self {
        self.timeout_s = Some(timeout_s);
        self
    }

    pub fn with_on_fail(mut self, on_fail: OnFail) -> Self {
        self.on_fail = on_fail;
        self
    }

    pub fn with_contract(mut self, contract: ContractMode) -> Self {
        self.contract = contract;
        self
    }

    /// All executable blocks joined for display.
    pub fn command(&self) -> String {
        self.commands
            .iter()
            .map(|block| block.script.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Returns true if the step has anything to execute.
    pub fn is_executable(&self) -> bool {
        !self.commands.is_empty()
    }

    /// Retries after applying a global cap. The cap never raises the
    /// step's own value.
    pub fn effective_retries(&self, cap: Option<u32>) -> u32 {
        match cap {
            Some(cap) => self.retries.min(cap),
            None => self.retries,
        }
    }

    /// Returns true if `selector` names this step by id or title.
    ///
    /// Matching is case-insensitive and ignores surrounding whitespace.
    pub fn matches(&self, selector: &str) -> bool {
        let selector = selector.trim().to_lowercase();
        self.id.to_lowercase() == selector || self.title.to_lowercase() == selector
    }
}

/// A parsed workflow: identity plus an ordered list of steps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
    /// Stable identity, used as the state-store key
    pub id: String,

    /// Free-text description from the front matter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Document the workflow was parsed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,

    /// Steps in execution order
    pub steps: Vec<Step>,
}

impl Workflow {
    /// Creates a workflow from a list of steps.
    pub fn new(id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            description: None,
            source: None,
            steps,
        }
    }

    /// Finds the position of the step named by id or title.
    pub fn find_step(&self, selector: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.id == selector)
            .or_else(|| self.steps.iter().position(|s| s.matches(selector)))
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
