//! Workflow Definition Module
//!
//! Turns markdown workflow documents into typed steps and keeps the
//! durable progress of their runs.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Step, Workflow)
//! - [`parser`]: Markdown parsing and workflow lookup
//! - [`directives`]: Per-step runner directives
//! - [`state`]: Persisted run state and its stores

pub mod directives;
pub mod model;
pub mod parser;
pub mod state;

pub use model::{CommandBlock, ContractMode, OnFail, ShellKind, Step, Workflow};
pub use parser::{list_workflows, load_workflow, locate_workflow, parse_workflow, slugify};
pub use state::{
    new_run_id, FileStateStore, MemoryStateStore, RunState, StateLock, StateStore, StepRecord,
    StepStatus,
};
