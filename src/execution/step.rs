//! Step Attempt Execution
//!
//! Runs one attempt of a step: each executable block is spawned as its own
//! process, in document order, under a single wall-clock deadline. The
//! attempt stops at the first failing block.
//!
//! On unix every block leads its own process group, so a timeout or an
//! operator interrupt reaches anything the script started. Termination
//! sends `SIGTERM` to the group, waits out the grace period, then sends
//! `SIGKILL`. The child is always reaped.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::contract::{self, ContractReport};
use super::engine::DEFAULT_GRACE_PERIOD;
use crate::workflow::{CommandBlock, ContractMode, Step, StepStatus};

/// How long to wait for output pipes to close once a process has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Process settings shared by every attempt of a run.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    pub working_dir: Option<PathBuf>,
    /// Time between `SIGTERM` and `SIGKILL`
    pub grace_period: Duration,
    pub cancel: CancellationToken,
}

impl ProcessContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            working_dir: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            cancel,
        }
    }
}

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded {
        exit_code: Option<i32>,
        /// The last block exited with the partial-success code
        partial: bool,
        report: Option<ContractReport>,
    },
    /// The process could not be started
    SpawnError { error: String },
    /// Non-zero exit, signal death or a failed contract report
    RuntimeFailure {
        exit_code: Option<i32>,
        error: String,
        report: Option<ContractReport>,
    },
    /// The deadline passed and the process was terminated
    TimeoutFailure { error: String },
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Status recorded for this attempt.
    pub fn status(&self) -> StepStatus {
        match self {
            Self::Succeeded { .. } => StepStatus::Succeeded,
            Self::TimeoutFailure { .. } => StepStatus::TimedOut,
            Self::SpawnError { .. } | Self::RuntimeFailure { .. } => StepStatus::Failed,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Succeeded { exit_code, .. } | Self::RuntimeFailure { exit_code, .. } => {
                *exit_code
            }
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Succeeded { .. } => None,
            Self::SpawnError { error }
            | Self::RuntimeFailure { error, .. }
            | Self::TimeoutFailure { error } => Some(error),
        }
    }

    /// Metrics from the contract report, if the step emitted one.
    pub fn metrics(&self) -> Map<String, Value> {
        match self {
            Self::Succeeded {
                report: Some(report),
                ..
            }
            | Self::RuntimeFailure {
                report: Some(report),
                ..
            } => report.metrics.clone(),
            _ => Map::new(),
        }
    }
}

/// The attempt was abandoned because the run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

/// How a single block process ended.
#[derive(Debug)]
enum BlockExit {
    /// `None` when killed by a signal
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
    SpawnFailed(String),
}

#[derive(Debug)]
struct BlockResult {
    exit: BlockExit,
    stdout: String,
    stderr: String,
}

/// Runs one attempt of `step`.
///
/// Returns `Err(Interrupted)` if cancellation fired while a block was
/// running; the in-flight process has been terminated by then.
pub async fn execute_attempt(
    step: &Step,
    ctx: &ProcessContext,
) -> Result<AttemptOutcome, Interrupted> {
    // A timeout too large to represent as an instant never expires.
    let deadline = step
        .timeout_s
        .and_then(|secs| Instant::now().checked_add(Duration::from_secs(secs)));
    let last = step.commands.len().saturating_sub(1);

    for (index, block) in step.commands.iter().enumerate() {
        debug!(
            "Step '{}' block {}/{} ({}):\n{}",
            step.id,
            index + 1,
            step.commands.len(),
            block.shell,
            block.script
        );

        let result = run_block(block, ctx, deadline).await;
        if !result.stdout.is_empty() {
            debug!("Step '{}' stdout:\n{}", step.id, result.stdout.trim_end());
        }
        if !result.stderr.is_empty() {
            debug!("Step '{}' stderr:\n{}", step.id, result.stderr.trim_end());
        }

        let exit_code = match result.exit {
            BlockExit::Cancelled => return Err(Interrupted),
            BlockExit::SpawnFailed(error) => return Ok(AttemptOutcome::SpawnError { error }),
            BlockExit::TimedOut => {
                let error = format!(
                    "timed out after {}s",
                    step.timeout_s.unwrap_or_default()
                );
                return Ok(AttemptOutcome::TimeoutFailure { error });
            }
            BlockExit::Exited(code) => code,
        };

        // Only the final block's stdout carries the step's contract report.
        let mode = if index == last {
            step.contract
        } else {
            ContractMode::Lenient
        };
        let verdict = contract::evaluate(exit_code, &result.stdout, &result.stderr, mode);

        if !verdict.success {
            return Ok(AttemptOutcome::RuntimeFailure {
                exit_code,
                error: verdict.error.unwrap_or_default(),
                report: verdict.report,
            });
        }

        if index == last {
            return Ok(AttemptOutcome::Succeeded {
                exit_code,
                partial: verdict.partial,
                report: verdict.report,
            });
        }
    }

    // No blocks: nothing failed.
    Ok(AttemptOutcome::Succeeded {
        exit_code: None,
        partial: false,
        report: None,
    })
}

async fn run_block(
    block: &CommandBlock,
    ctx: &ProcessContext,
    deadline: Option<Instant>,
) -> BlockResult {
    let (program, args) = block.shell.invocation();

    let mut command = Command::new(program);
    command
        .args(args)
        .arg(&block.script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &ctx.working_dir {
        command.current_dir(dir);
    }
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return BlockResult {
                exit: BlockExit::SpawnFailed(format!("failed to start {}: {}", program, e)),
                stdout: String::new(),
                stderr: String::new(),
            }
        }
    };

    let pid = child.id();
    let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    enum Wake {
        Exited(std::io::Result<std::process::ExitStatus>),
        Deadline,
        Cancelled,
    }

    let wake = tokio::select! {
        biased;
        status = child.wait() => Wake::Exited(status),
        _ = ctx.cancel.cancelled() => Wake::Cancelled,
        _ = wait_for(deadline) => Wake::Deadline,
    };

    let exit = match wake {
        Wake::Exited(Ok(status)) => BlockExit::Exited(status.code()),
        Wake::Exited(Err(e)) => {
            warn!("Failed to wait for {}: {}", program, e);
            BlockExit::Exited(None)
        }
        Wake::Deadline => {
            terminate(&mut child, pid, ctx.grace_period).await;
            BlockExit::TimedOut
        }
        Wake::Cancelled => {
            terminate(&mut child, pid, ctx.grace_period).await;
            BlockExit::Cancelled
        }
    };

    BlockResult {
        exit,
        stdout: collect_output(stdout_task).await,
        stderr: collect_output(stderr_task).await,
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        if let Err(e) = stream.read_to_end(&mut buf).await {
            debug!("Output stream closed with error: {}", e);
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect_output(task: JoinHandle<String>) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!("Output reader failed: {}", e);
            String::new()
        }
        Err(_) => {
            warn!("Output pipe still held open by a background process; discarding output");
            abort.abort();
            String::new()
        }
    }
}

/// Stops a running block: `SIGTERM` to its group, then `SIGKILL` after
/// `grace`. Always reaps the child.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            signal_group(pid, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            warn!("Process did not exit within {:?}; killing it", grace);
        }
        // Reaches stragglers that ignored SIGTERM or outlived the leader.
        if let Some(pid) = pid {
            signal_group(pid, libc::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, grace);
    }

    if let Err(e) = child.kill().await {
        debug!("Kill after termination: {}", e);
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the group was created for this child.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 {
        debug!(
            "killpg({}, {}) failed: {}",
            pgid,
            signal,
            std::io::Error::last_os_error()
        );
    }
}
