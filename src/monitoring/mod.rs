//! Run Monitoring Module
//!
//! Structured records of what runs did, and summaries over them.
//!
//! # Components
//!
//! - [`TelemetrySink`]: append-only run and step records
//! - [`RunStats`]: success rate and duration over recent runs

pub mod stats;
pub mod telemetry;

pub use stats::{run_stats, RunStats};
pub use telemetry::{JsonlTelemetry, MemoryTelemetry, RunEvent, StepEvent, TelemetrySink};
