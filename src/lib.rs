//! Workflow Runner - Markdown Workflow Execution Engine
//!
//! Executes operational workflows written as markdown documents. Each
//! `###` heading under `## Steps` is a step; its fenced shell blocks are
//! what runs. Steps execute one at a time with retries, timeouts and a
//! failure policy, and every run leaves durable state for `--resume` plus
//! JSON Lines telemetry.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`workflow`]: Document parsing, step model and persisted run state
//! - [`execution`]: Sequential engine, step processes and output contract
//! - [`monitoring`]: Telemetry records and run history
//! - [`config`]: Location of workflows, state and logs
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use workflow_runner::config::RunnerPaths;
//! use workflow_runner::execution::Engine;
//! use workflow_runner::monitoring::JsonlTelemetry;
//! use workflow_runner::workflow::{load_workflow, locate_workflow, FileStateStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let paths = RunnerPaths::discover(&std::env::current_dir()?);
//!
//!     // Load a workflow from .agent/workflows/wrap-session.md
//!     let path = locate_workflow("wrap-session", &paths.workflows_dir)?;
//!     let workflow = load_workflow(&path)?;
//!
//!     let engine = Engine::new(
//!         workflow,
//!         Arc::new(FileStateStore::new(&paths.state_dir)),
//!         Arc::new(JsonlTelemetry::new(&paths.logs_dir)),
//!     );
//!
//!     let report = engine.run().await?;
//!     println!("{}", report.result);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use error::{EngineError, ParseError, StateStoreError, TelemetryError};
pub use execution::engine::{Engine, RunMode, RunReport, RunResult};
pub use workflow::model::{Step, Workflow};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Workflow Runner";
