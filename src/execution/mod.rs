//! Workflow Execution Module
//!
//! Provides the execution engine that runs workflow steps in order,
//! applying retry, timeout and failure policy.
//!
//! # Architecture
//!
//! - [`engine`]: Main execution engine orchestrating workflow runs
//! - [`step`]: One attempt of a step as child processes
//! - [`contract`]: Judging a step's output
//! - [`plan`]: Dry-run plan rendering

pub mod contract;
pub mod engine;
pub mod plan;
pub mod step;

pub use engine::{Engine, RunMode, RunReport, RunResult, StepReport};
pub use step::{AttemptOutcome, ProcessContext};
