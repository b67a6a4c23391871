//! Workflow Execution Engine
//!
//! Orchestrates the run of a parsed workflow:
//! - Steps run strictly one at a time, in document order
//! - Each step gets `1 + retries` attempts with exponential backoff
//! - State is persisted before each attempt and after each outcome
//! - One telemetry record per attempt, one per finished run
//!
//! # Failure policy
//!
//! A step that exhausts its attempts with `on_fail: stop` ends the run as
//! failed, leaving later steps pending for `--resume`. With
//! `on_fail: continue` the run goes on and ends as partial.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use tokio_util::sync::CancellationToken;

use super::plan;
use super::step::{execute_attempt, AttemptOutcome, Interrupted, ProcessContext};
use crate::error::EngineError;
use crate::monitoring::{RunEvent, StepEvent, TelemetrySink};
use crate::workflow::{
    new_run_id, OnFail, RunState, StateStore, Step, StepRecord, StepStatus, Workflow,
};

/// Default base unit of the retry backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Default time between `SIGTERM` and `SIGKILL`.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// What a call to [`Engine::run`] does.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Fresh run from the first step
    #[default]
    Run,
    /// Print the plan; execute nothing, persist nothing
    DryRun,
    /// Continue the persisted run, skipping steps that already succeeded
    Resume,
    /// Run one step, selected by id or title
    SingleStep(String),
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::DryRun => "dry_run",
            Self::Resume => "resume",
            Self::SingleStep(_) => "single_step",
        }
    }
}

/// Overall outcome of a run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Succeeded,
    Failed,
    /// At least one step failed under `on_fail: continue`
    Partial,
    /// Cancelled by the operator
    Interrupted,
}

impl RunResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Partial => "partial",
            Self::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one step within a run.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub id: String,
    pub title: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    /// Succeeded with the partial-success exit code
    pub partial: bool,
}

impl StepReport {
    fn with_status(step: &Step, status: StepStatus) -> Self {
        Self {
            id: step.id.clone(),
            title: step.title.clone(),
            status,
            attempts: 0,
            duration_ms: 0,
            exit_code: None,
            error: None,
            partial: false,
        }
    }

    fn from_record(step: &Step, record: &StepRecord, partial: bool) -> Self {
        Self {
            id: step.id.clone(),
            title: step.title.clone(),
            status: record.status,
            attempts: record.attempts,
            duration_ms: record.duration_ms,
            exit_code: record.exit_code,
            error: record.last_error.clone(),
            partial,
        }
    }
}

/// Summary returned by [`Engine::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub workflow_id: String,
    /// `None` for dry runs
    pub run_id: Option<String>,
    pub mode: RunMode,
    pub result: RunResult,
    /// Every step of the workflow (one entry in single-step mode)
    pub steps: Vec<StepReport>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| s.status.is_failure())
    }
}

enum StepExecution {
    Finished(StepReport),
    Interrupted(StepReport),
}

/// Sequential workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use workflow_runner::execution::{Engine, RunMode};
/// use workflow_runner::monitoring::JsonlTelemetry;
/// use workflow_runner::workflow::{load_workflow, FileStateStore};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let workflow = load_workflow(".agent/workflows/wrap-session.md".as_ref())?;
/// let store = Arc::new(FileStateStore::new(".agent/state/workflow_runs"));
/// let telemetry = Arc::new(JsonlTelemetry::new(".agent/logs"));
///
/// let mut engine = Engine::new(workflow, store, telemetry);
/// engine.set_mode(RunMode::Resume);
/// engine.set_max_retries(Some(1));
///
/// let report = engine.run().await?;
/// println!("{}", report.result);
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    workflow: Workflow,
    store: Arc<dyn StateStore>,
    telemetry: Arc<dyn TelemetrySink>,
    mode: RunMode,
    max_retries: Option<u32>,
    backoff_base: Duration,
    process: ProcessContext,
}

impl Engine {
    /// Creates an engine for a parsed workflow.
    pub fn new(
        workflow: Workflow,
        store: Arc<dyn StateStore>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let process = ProcessContext::new(CancellationToken::new());

        Self {
            workflow,
            store,
            telemetry,
            mode: RunMode::Run,
            max_retries: None,
            backoff_base: DEFAULT_BACKOFF_BASE,
            process,
        }
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn set_mode(&mut self, mode: RunMode) {
        self.mode = mode;
    }

    /// Caps every step's retries. The cap never raises a step's own value.
    pub fn set_max_retries(&mut self, max: Option<u32>) {
        self.max_retries = max;
    }

    /// Sets the backoff unit: the delay before retry `n` is `base * 2^(n-1)`.
    pub fn set_backoff_base(&mut self, base: Duration) {
        self.backoff_base = base;
    }

    pub fn set_grace_period(&mut self, grace: Duration) {
        self.process.grace_period = grace;
    }

    /// Sets the working directory for step processes.
    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.process.working_dir = Some(dir.into());
    }

    /// Replaces the token that interrupts the run when cancelled.
    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.process.cancel = token;
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.process.cancel.clone()
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 1u32
            .checked_shl(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }

    /// Executes the workflow according to the configured mode.
    ///
    /// Step failures are reported through [`RunReport::result`]; an `Err`
    /// means the run could not proceed at all (state store failure, unknown
    /// step selector).
    pub async fn run(&self) -> Result<RunReport, EngineError> {
        if self.mode == RunMode::DryRun {
            return Ok(self.dry_run());
        }

        let single = match &self.mode {
            RunMode::SingleStep(selector) => Some(self.workflow.find_step(selector).ok_or_else(
                || EngineError::UnknownStep {
                    workflow_id: self.workflow.id.clone(),
                    selector: selector.clone(),
                },
            )?),
            _ => None,
        };

        let _lock = self.store.lock(&self.workflow.id)?;
        let mut state = self.initial_state()?;

        let started = Instant::now();
        let started_at = Utc::now();
        info!(
            "Starting workflow '{}' ({} steps, run {}, mode {})",
            self.workflow.id,
            self.workflow.len(),
            state.run_id,
            self.mode.as_str()
        );

        let (result, steps) = match single {
            Some(index) => self.run_single(index, &mut state).await?,
            None => self.run_sequence(&mut state).await?,
        };

        let report = RunReport {
            workflow_id: self.workflow.id.clone(),
            run_id: Some(state.run_id.clone()),
            mode: self.mode.clone(),
            result,
            steps,
            duration_ms: millis(started.elapsed()),
            started_at,
            finished_at: Utc::now(),
        };
        self.emit_run(&report, &state.run_id);

        info!(
            "Workflow '{}' {} in {:.2?}",
            self.workflow.id,
            report.result,
            started.elapsed()
        );
        Ok(report)
    }

    fn dry_run(&self) -> RunReport {
        let now = Utc::now();
        println!();
        println!("[DRY RUN]");
        println!("{}", plan::render(&self.workflow, self.max_retries));

        RunReport {
            workflow_id: self.workflow.id.clone(),
            run_id: None,
            mode: RunMode::DryRun,
            result: RunResult::Succeeded,
            steps: self
                .workflow
                .steps
                .iter()
                .map(|s| StepReport::with_status(s, StepStatus::Pending))
                .collect(),
            duration_ms: 0,
            started_at: now,
            finished_at: now,
        }
    }

    /// Loads or creates the state for this run and persists it.
    fn initial_state(&self) -> Result<RunState, EngineError> {
        let saved = match self.mode {
            RunMode::Run | RunMode::DryRun => None,
            RunMode::Resume | RunMode::SingleStep(_) => self.store.load(&self.workflow.id)?,
        };

        let state = match saved {
            Some(mut state) => {
                state.reconcile(&self.workflow);
                if self.mode == RunMode::Resume {
                    info!(
                        "Resuming run {} ({} of {} steps already succeeded)",
                        state.run_id,
                        self.workflow
                            .steps
                            .iter()
                            .filter(|s| state.is_succeeded(&s.id))
                            .count(),
                        self.workflow.len()
                    );
                }
                state
            }
            None => {
                if self.mode == RunMode::Resume {
                    warn!(
                        "No saved state for workflow '{}'; starting a fresh run",
                        self.workflow.id
                    );
                }
                RunState::new(&self.workflow, new_run_id())
            }
        };

        self.store.save(&state)?;
        Ok(state)
    }

    async fn run_sequence(
        &self,
        state: &mut RunState,
    ) -> Result<(RunResult, Vec<StepReport>), EngineError> {
        let mut reports = Vec::with_capacity(self.workflow.len());
        let mut halted: Option<RunResult> = None;
        let mut any_failed = false;

        for (index, step) in self.workflow.steps.iter().enumerate() {
            if halted.is_none() && self.process.cancel.is_cancelled() {
                warn!("Run interrupted before step '{}'", step.id);
                halted = Some(RunResult::Interrupted);
            }
            if halted.is_some() {
                reports.push(StepReport::with_status(step, StepStatus::Pending));
                continue;
            }

            if self.mode == RunMode::Resume && state.is_succeeded(&step.id) {
                info!("Skipping step '{}' (succeeded in a previous attempt of this run)", step.id);
                self.emit_step(&self.skipped_event(&state.run_id, step));
                state.cursor = index + 1;
                state.updated_at = Utc::now();
                self.store.save(state)?;
                reports.push(StepReport::with_status(step, StepStatus::Skipped));
                continue;
            }

            match self.execute_step(step, state).await? {
                StepExecution::Interrupted(report) => {
                    halted = Some(RunResult::Interrupted);
                    reports.push(report);
                }
                StepExecution::Finished(report) => {
                    let failed = report.status.is_failure();
                    if !failed || step.on_fail == OnFail::Continue {
                        state.cursor = index + 1;
                        self.store.save(state)?;
                    }
                    if failed {
                        any_failed = true;
                        match step.on_fail {
                            OnFail::Stop => {
                                error!("Stopping workflow: step '{}' failed", step.id);
                                halted = Some(RunResult::Failed);
                            }
                            OnFail::Continue => {
                                warn!("Step '{}' failed; continuing (on_fail: continue)", step.id)
                            }
                        }
                    }
                    reports.push(report);
                }
            }
        }

        let result = halted.unwrap_or(if any_failed {
            RunResult::Partial
        } else {
            RunResult::Succeeded
        });
        Ok((result, reports))
    }

    /// Runs one step without moving the state cursor.
    async fn run_single(
        &self,
        index: usize,
        state: &mut RunState,
    ) -> Result<(RunResult, Vec<StepReport>), EngineError> {
        let step = &self.workflow.steps[index];
        info!("Running single step '{}'", step.id);

        Ok(match self.execute_step(step, state).await? {
            StepExecution::Interrupted(report) => (RunResult::Interrupted, vec![report]),
            StepExecution::Finished(report) if report.status.is_failure() => {
                (RunResult::Failed, vec![report])
            }
            StepExecution::Finished(report) => (RunResult::Succeeded, vec![report]),
        })
    }

    /// Runs every attempt of one step, persisting each transition.
    async fn execute_step(
        &self,
        step: &Step,
        state: &mut RunState,
    ) -> Result<StepExecution, EngineError> {
        let step_started = Instant::now();
        *state.record_mut(&step.id) = StepRecord {
            started_at: Some(Utc::now()),
            ..StepRecord::default()
        };

        if !step.is_executable() {
            info!("Step '{}' has no executable block; skipping", step.id);
            let record = state.record_mut(&step.id);
            record.status = StepStatus::Skipped;
            record.finished_at = Some(Utc::now());
            self.store.save(state)?;
            self.emit_step(&self.skipped_event(&state.run_id, step));
            return Ok(StepExecution::Finished(StepReport::with_status(
                step,
                StepStatus::Skipped,
            )));
        }

        let max_attempts = step.effective_retries(self.max_retries) + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            state.record_mut(&step.id).status = StepStatus::Running;
            self.store.save(state)?;

            info!(
                "Starting step '{}' (attempt {}/{})",
                step.id, attempt, max_attempts
            );
            let attempt_started = Instant::now();

            let outcome = match execute_attempt(step, &self.process).await {
                Ok(outcome) => outcome,
                Err(Interrupted) => {
                    return self.interrupt_step(step, state, step_started);
                }
            };

            let attempt_ms = millis(attempt_started.elapsed());
            let success = outcome.is_success();
            let exhausted = attempt >= max_attempts;
            let backoff = (!success && !exhausted).then(|| self.backoff_delay(attempt));

            let record = state.record_mut(&step.id);
            record.attempts = attempt;
            record.exit_code = outcome.exit_code();
            record.last_error = outcome.error().map(String::from);
            record.metrics = outcome.metrics();
            record.duration_ms = millis(step_started.elapsed());
            record.status = if backoff.is_some() {
                StepStatus::Retrying
            } else {
                outcome.status()
            };
            if record.status.is_terminal() {
                record.finished_at = Some(Utc::now());
            }

            self.emit_step(&StepEvent {
                timestamp: Utc::now(),
                workflow_id: self.workflow.id.clone(),
                run_id: state.run_id.clone(),
                step_id: step.id.clone(),
                title: step.title.clone(),
                status: outcome.status(),
                attempt,
                attempts: attempt,
                duration_ms: attempt_ms,
                exit_code: outcome.exit_code(),
                error: outcome.error().map(String::from),
                backoff_ms: backoff.map(millis),
                metrics: outcome.metrics(),
            });
            self.store.save(state)?;

            let partial = matches!(outcome, AttemptOutcome::Succeeded { partial: true, .. });
            let report = || {
                state
                    .record(&step.id)
                    .map(|r| StepReport::from_record(step, r, partial))
                    .unwrap_or_else(|| StepReport::with_status(step, outcome.status()))
            };

            if success {
                if partial {
                    info!("Step '{}' completed with partial success", step.id);
                } else {
                    info!(
                        "Step '{}' completed in {:.2?}",
                        step.id,
                        step_started.elapsed()
                    );
                }
                return Ok(StepExecution::Finished(report()));
            }

            let reason = outcome.error().unwrap_or("unknown error");
            let Some(delay) = backoff else {
                error!(
                    "Step '{}' failed after {} attempt(s): {}",
                    step.id, attempt, reason
                );
                return Ok(StepExecution::Finished(report()));
            };

            warn!(
                "Step '{}' attempt {}/{} failed: {}; retrying in {:?}",
                step.id, attempt, max_attempts, reason, delay
            );

            let cancelled = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = self.process.cancel.cancelled() => true,
            };
            if cancelled {
                return self.interrupt_step(step, state, step_started);
            }
        }
    }

    /// Records an interrupted step as not finished so a resume reruns it.
    fn interrupt_step(
        &self,
        step: &Step,
        state: &mut RunState,
        step_started: Instant,
    ) -> Result<StepExecution, EngineError> {
        warn!("Step '{}' interrupted", step.id);

        let record = state.record_mut(&step.id);
        record.status = StepStatus::Pending;
        record.duration_ms = millis(step_started.elapsed());
        let mut report = StepReport::from_record(step, record, false);
        report.error = Some("interrupted".to_string());

        self.store.save(state)?;
        Ok(StepExecution::Interrupted(report))
    }

    fn skipped_event(&self, run_id: &str, step: &Step) -> StepEvent {
        StepEvent {
            timestamp: Utc::now(),
            workflow_id: self.workflow.id.clone(),
            run_id: run_id.to_string(),
            step_id: step.id.clone(),
            title: step.title.clone(),
            status: StepStatus::Skipped,
            attempt: 0,
            attempts: 0,
            duration_ms: 0,
            exit_code: None,
            error: None,
            backoff_ms: None,
            metrics: Map::new(),
        }
    }

    fn emit_step(&self, event: &StepEvent) {
        if let Err(e) = self.telemetry.record_step(event) {
            error!("Failed to record telemetry for step '{}': {}", event.step_id, e);
        }
    }

    fn emit_run(&self, report: &RunReport, run_id: &str) {
        let event = RunEvent {
            timestamp: Utc::now(),
            workflow_id: report.workflow_id.clone(),
            run_id: run_id.to_string(),
            mode: report.mode.as_str().to_string(),
            result: report.result,
            success: report.result == RunResult::Succeeded,
            steps_total: self.workflow.len(),
            steps_succeeded: report.count(StepStatus::Succeeded),
            steps_failed: report.failed_steps().count(),
            steps_skipped: report.count(StepStatus::Skipped),
            duration_ms: report.duration_ms,
            started_at: report.started_at,
            finished_at: report.finished_at,
        };
        if let Err(e) = self.telemetry.record_run(&event) {
            error!("Failed to record run telemetry: {}", e);
        } else {
            debug!("Recorded run {} ({})", run_id, report.result);
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
