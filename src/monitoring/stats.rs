//! Run history summary over the run log.

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use log::debug;

use super::telemetry::RunEvent;
use crate::execution::RunResult;

/// Aggregate over the runs of one workflow in a time window.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStats {
    pub workflow_id: Option<String>,
    pub days: u32,
    pub total_runs: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub partial: usize,
    pub interrupted: usize,
    /// Fraction of runs that succeeded, `0.0` when there were none
    pub success_rate: f64,
    pub avg_duration_ms: u64,
    pub last: Option<RunEvent>,
}

impl RunStats {
    /// Human-readable multi-line summary.
    pub fn summary(&self) -> String {
        let scope = self.workflow_id.as_deref().unwrap_or("all workflows");
        let mut lines = vec![
            format!("Run history for {} (last {} days)", scope, self.days),
            format!("  Total runs:    {}", self.total_runs),
            format!(
                "  Success rate:  {:.1}% ({} succeeded, {} partial, {} failed, {} interrupted)",
                self.success_rate * 100.0,
                self.succeeded,
                self.partial,
                self.failed,
                self.interrupted
            ),
            format!("  Avg duration:  {:.2}s", self.avg_duration_ms as f64 / 1000.0),
        ];
        if let Some(last) = &self.last {
            lines.push(format!(
                "  Last run:      {} {} at {}",
                last.run_id,
                last.result,
                last.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
            ));
        }
        lines.join("\n")
    }
}

/// Summarizes the run log for `workflow_id` (or every workflow) over the
/// last `days` days. A missing log yields empty stats; unparsable lines are
/// skipped.
pub fn run_stats(runs_log: &Path, workflow_id: Option<&str>, days: u32) -> io::Result<RunStats> {
    let content = match fs::read_to_string(runs_log) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };
    Ok(summarize(&content, workflow_id, days, Utc::now()))
}

fn summarize(content: &str, workflow_id: Option<&str>, days: u32, now: DateTime<Utc>) -> RunStats {
    let since = now - Duration::days(i64::from(days));

    let runs: Vec<RunEvent> = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<RunEvent>(line) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!("Skipping unparsable run record: {}", e);
                None
            }
        })
        .filter(|event| workflow_id.map_or(true, |id| event.workflow_id == id))
        .filter(|event| event.timestamp >= since)
        .collect();

    let count = |result: RunResult| runs.iter().filter(|r| r.result == result).count();
    let total_runs = runs.len();
    let succeeded = count(RunResult::Succeeded);
    let total_ms: u64 = runs.iter().map(|r| r.duration_ms).sum();

    RunStats {
        workflow_id: workflow_id.map(String::from),
        days,
        total_runs,
        succeeded,
        failed: count(RunResult::Failed),
        partial: count(RunResult::Partial),
        interrupted: count(RunResult::Interrupted),
        success_rate: if total_runs == 0 {
            0.0
        } else {
            succeeded as f64 / total_runs as f64
        },
        avg_duration_ms: if total_runs == 0 {
            0
        } else {
            total_ms / total_runs as u64
        },
        last: runs.into_iter().max_by_key(|r| r.timestamp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn line(workflow: &str, result: RunResult, duration_ms: u64, at: DateTime<Utc>) -> String {
        let event = RunEvent {
            timestamp: at,
            workflow_id: workflow.to_string(),
            run_id: format!("{}-run", at.format("%Y%m%dT%H%M%SZ")),
            mode: "run".to_string(),
            result,
            success: result != RunResult::Failed,
            steps_total: 1,
            steps_succeeded: 1,
            steps_failed: 0,
            steps_skipped: 0,
            duration_ms,
            started_at: at,
            finished_at: at,
        };
        serde_json::to_string(&event).unwrap()
    }

    #[test]
    fn test_summarize_filters_workflow_and_window() {
        let now = Utc::now();
        let content = [
            line("wrap-session", RunResult::Succeeded, 1000, now - Duration::hours(1)),
            line("wrap-session", RunResult::Failed, 3000, now - Duration::hours(2)),
            line("wrap-session", RunResult::Succeeded, 500, now - Duration::days(30)),
            line("other", RunResult::Succeeded, 100, now),
            "not json".to_string(),
        ]
        .join("\n");

        let stats = summarize(&content, Some("wrap-session"), 7, now);

        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.avg_duration_ms, 2000);
        assert_eq!(stats.last.unwrap().result, RunResult::Succeeded);
    }

    #[test]
    fn test_summarize_all_workflows() {
        let now = Utc::now();
        let content = [
            line("a", RunResult::Partial, 10, now),
            line("b", RunResult::Interrupted, 30, now),
        ]
        .join("\n");

        let stats = summarize(&content, None, 7, now);
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.partial, 1);
        assert_eq!(stats.interrupted, 1);
        assert_eq!(stats.success_rate, 0.0);
        assert!(stats.summary().contains("all workflows"));
    }

    #[test]
    fn test_missing_log_is_empty() {
        let dir = tempdir().unwrap();
        let stats = run_stats(&dir.path().join("workflow_runs.jsonl"), Some("x"), 7).unwrap();

        assert_eq!(stats.total_runs, 0);
        assert_eq!(stats.avg_duration_ms, 0);
        assert!(stats.last.is_none());
    }
}
