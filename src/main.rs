//! Workflow Runner CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow by name (.agent/workflows/wrap-session.md) or path
//! workflow-runner --workflow wrap-session
//!
//! # Preview the plan without executing anything
//! workflow-runner --workflow wrap-session --dry-run
//!
//! # Continue the last run, skipping steps that already succeeded
//! workflow-runner --workflow wrap-session --resume
//!
//! # Run one step by id or title
//! workflow-runner --workflow wrap-session --step sync_tasks
//!
//! # List workflows, or show run history for the last 30 days
//! workflow-runner --list
//! workflow-runner --stats --workflow wrap-session --days 30
//! ```
//!
//! # Exit codes
//!
//! `0` success (or partial), `1` failure (or partial with
//! `--fail-on-partial`), `2` parse, configuration or state error,
//! `128 + signal` when stopped by `SIGINT` (130), `SIGTERM` (143) or
//! `SIGHUP` (129).

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use log::{info, warn};

use workflow_runner::config::RunnerPaths;
use workflow_runner::execution::{Engine, RunMode, RunReport, RunResult};
use workflow_runner::monitoring::{run_stats, JsonlTelemetry};
use workflow_runner::workflow::{list_workflows, load_workflow, locate_workflow, FileStateStore};
use workflow_runner::{APP_NAME, VERSION};

const EXIT_FAILED: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;
const EXIT_TERMINATED: u8 = 143;
const EXIT_HANGUP: u8 = 129;

/// Signal that stopped the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    Interrupt,
    Terminate,
    Hangup,
}

impl Shutdown {
    fn name(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Hangup => "SIGHUP",
        }
    }

    fn exit_code(self) -> u8 {
        match self {
            Self::Interrupt => EXIT_INTERRUPTED,
            Self::Terminate => EXIT_TERMINATED,
            Self::Hangup => EXIT_HANGUP,
        }
    }

    fn from_exit_code(code: u8) -> Option<Self> {
        [Self::Interrupt, Self::Terminate, Self::Hangup]
            .into_iter()
            .find(|signal| signal.exit_code() == code)
    }
}

/// Waits for the first stop signal. Returns `None` if none can be received.
#[cfg(unix)]
async fn shutdown_signal() -> Option<Shutdown> {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut terminate, mut hangup) =
        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(terminate), Ok(hangup)) => (terminate, hangup),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Cannot listen for SIGTERM/SIGHUP: {}", e);
                return tokio::signal::ctrl_c().await.ok().map(|_| Shutdown::Interrupt);
            }
        };

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.ok().map(|_| Shutdown::Interrupt),
        _ = terminate.recv() => Some(Shutdown::Terminate),
        _ = hangup.recv() => Some(Shutdown::Hangup),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Option<Shutdown> {
    tokio::signal::ctrl_c().await.ok().map(|_| Shutdown::Interrupt)
}

/// Command-line configuration parsed from arguments.
#[derive(Parser, Debug)]
#[command(name = "workflow-runner", version, about = "Runs markdown-authored workflows")]
struct Cli {
    /// Workflow file, or a name under .agent/workflows/
    #[arg(short, long, required_unless_present_any = ["list", "stats"])]
    workflow: Option<String>,

    /// Print the planned steps without executing anything
    #[arg(long, conflicts_with_all = ["resume", "step"])]
    dry_run: bool,

    /// Resume the last run, skipping steps that already succeeded
    #[arg(long, conflicts_with = "step")]
    resume: bool,

    /// Run a single step, selected by id or title
    #[arg(long, value_name = "ID_OR_TITLE")]
    step: Option<String>,

    /// Cap on retries for every step
    #[arg(long, value_name = "N")]
    max_retries: Option<u32>,

    /// Directory containing .agent/ (default: nearest ancestor that has one)
    #[arg(long, env = "WORKFLOW_RUNNER_ROOT", value_name = "DIR")]
    root: Option<PathBuf>,

    /// Exit non-zero when the run ends partial
    #[arg(long)]
    fail_on_partial: bool,

    /// List available workflows
    #[arg(long, conflicts_with_all = ["dry_run", "resume", "step", "stats"])]
    list: bool,

    /// Show run history instead of running
    #[arg(long, conflicts_with_all = ["dry_run", "resume", "step"])]
    stats: bool,

    /// Window for --stats, in days
    #[arg(long, default_value_t = 7, value_name = "N")]
    days: u32,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn mode(&self) -> RunMode {
        if self.dry_run {
            RunMode::DryRun
        } else if self.resume {
            RunMode::Resume
        } else if let Some(step) = &self.step {
            RunMode::SingleStep(step.clone())
        } else {
            RunMode::Run
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Markdown Workflow Execution Engine");
    println!();
}

fn resolve_paths(root: Option<PathBuf>) -> Result<RunnerPaths, Box<dyn std::error::Error>> {
    match root {
        Some(root) => {
            if !root.is_dir() {
                return Err(format!("Root is not a directory: {}", root.display()).into());
            }
            Ok(RunnerPaths::from_root(root))
        }
        None => Ok(RunnerPaths::discover(&env::current_dir()?)),
    }
}

fn print_workflow_list(paths: &RunnerPaths) {
    let entries = list_workflows(&paths.workflows_dir);
    if entries.is_empty() {
        println!("No workflows found in {}", paths.workflows_dir.display());
        return;
    }

    println!("Workflows in {}:", paths.workflows_dir.display());
    for (path, parsed) in entries {
        match parsed {
            Ok(workflow) => println!(
                "  {:<24} {:>3} steps  {}",
                workflow.id.bold(),
                workflow.len(),
                workflow.description.as_deref().unwrap_or("")
            ),
            Err(e) => println!(
                "  {:<24} {}",
                path.display().to_string().yellow(),
                format!("unparsable: {}", e).red()
            ),
        }
    }
}

/// Prints the final run summary, with detail for each failed step.
fn print_summary(report: &RunReport) {
    let result = match report.result {
        RunResult::Succeeded => report.result.to_string().green().bold(),
        RunResult::Partial => report.result.to_string().yellow().bold(),
        RunResult::Failed | RunResult::Interrupted => report.result.to_string().red().bold(),
    };

    println!();
    println!("Workflow '{}' {}", report.workflow_id, result);
    if let Some(run_id) = &report.run_id {
        println!("Run id: {}", run_id);
    }
    println!(
        "Total execution time: {:.2}s",
        report.duration_ms as f64 / 1000.0
    );
    println!();

    for step in &report.steps {
        let status = step.status.as_str();
        let status = if step.status.is_failure() {
            status.red()
        } else if step.partial {
            "partial".yellow()
        } else {
            status.normal()
        };
        println!(
            "  {:<12} {} [{}] attempts: {}",
            status, step.title, step.id, step.attempts
        );
        if let Some(error) = &step.error {
            println!("               {}", error.dimmed());
        }
    }
    println!();
}

fn exit_status(result: RunResult, fail_on_partial: bool, signal: Option<Shutdown>) -> u8 {
    match result {
        RunResult::Succeeded => 0,
        RunResult::Partial if !fail_on_partial => 0,
        RunResult::Partial | RunResult::Failed => EXIT_FAILED,
        RunResult::Interrupted => signal.unwrap_or(Shutdown::Interrupt).exit_code(),
    }
}

/// Main application entry point.
async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let paths = resolve_paths(cli.root.clone())?;
    info!("Agent root: {}", paths.root.display());

    if cli.list {
        print_workflow_list(&paths);
        return Ok(ExitCode::SUCCESS);
    }

    if cli.stats {
        let workflow_id = match &cli.workflow {
            Some(name) => Some(load_workflow(&locate_workflow(name, &paths.workflows_dir)?)?.id),
            None => None,
        };
        let stats = run_stats(&paths.runs_log(), workflow_id.as_deref(), cli.days)?;
        println!("{}", stats.summary());
        return Ok(ExitCode::SUCCESS);
    }

    let name = cli.workflow.as_deref().unwrap_or_default();
    let path = locate_workflow(name, &paths.workflows_dir)?;
    info!("Loading workflow: {}", path.display());
    let workflow = load_workflow(&path)?;
    info!("Workflow loaded: '{}' with {} steps", workflow.id, workflow.len());

    let mode = cli.mode();
    if mode == RunMode::DryRun {
        info!("Mode: DRY RUN (commands will not execute)");
    }

    let mut engine = Engine::new(
        workflow,
        Arc::new(FileStateStore::new(&paths.state_dir)),
        Arc::new(JsonlTelemetry::new(&paths.logs_dir)),
    );
    engine.set_mode(mode);
    engine.set_max_retries(cli.max_retries);

    let token = engine.cancellation_token();
    let received = Arc::new(AtomicU8::new(0));
    let signalled = Arc::clone(&received);
    tokio::spawn(async move {
        if let Some(signal) = shutdown_signal().await {
            warn!("{} received; stopping the current step", signal.name());
            signalled.store(signal.exit_code(), Ordering::SeqCst);
            token.cancel();
        }
    });

    let report = engine.run().await?;
    if report.mode != RunMode::DryRun {
        print_summary(&report);
    }

    let signal = Shutdown::from_exit_code(received.load(Ordering::SeqCst));
    Ok(ExitCode::from(exit_status(report.result, cli.fail_on_partial, signal)))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    print_banner();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::from(EXIT_USAGE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_for_results() {
        assert_eq!(exit_status(RunResult::Succeeded, false, None), 0);
        assert_eq!(exit_status(RunResult::Partial, false, None), 0);
        assert_eq!(exit_status(RunResult::Partial, true, None), EXIT_FAILED);
        assert_eq!(exit_status(RunResult::Failed, false, None), EXIT_FAILED);
    }

    #[test]
    fn test_exit_status_follows_stop_signal() {
        assert_eq!(exit_status(RunResult::Interrupted, false, None), 130);
        assert_eq!(
            exit_status(RunResult::Interrupted, false, Some(Shutdown::Interrupt)),
            130
        );
        assert_eq!(
            exit_status(RunResult::Interrupted, false, Some(Shutdown::Terminate)),
            143
        );
        assert_eq!(
            exit_status(RunResult::Interrupted, false, Some(Shutdown::Hangup)),
            129
        );
        // A signal that lands after the run finished does not change the outcome.
        assert_eq!(
            exit_status(RunResult::Succeeded, false, Some(Shutdown::Terminate)),
            0
        );
    }

    #[test]
    fn test_shutdown_round_trips_through_exit_code() {
        for signal in [Shutdown::Interrupt, Shutdown::Terminate, Shutdown::Hangup] {
            assert_eq!(Shutdown::from_exit_code(signal.exit_code()), Some(signal));
        }
        assert_eq!(Shutdown::from_exit_code(0), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_is_a_stop_signal() {
        use tokio::signal::unix::{signal, SignalKind};

        // Keeps SIGTERM handled for the whole test process.
        let _handled = signal(SignalKind::terminate()).unwrap();
        let waiter = tokio::spawn(shutdown_signal());
        // Give the task time to install its handlers before signalling.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        // SAFETY: signals this test process, whose SIGTERM handler is installed above.
        unsafe {
            libc::kill(libc::getpid(), libc::SIGTERM);
        }

        let signal = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal, Some(Shutdown::Terminate));
    }
}
