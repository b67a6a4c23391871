//! Output Contract
//!
//! Steps may end their standard output with one JSON line describing the
//! result:
//!
//! ```json
//! {"skill": "session_wrapper", "success": true, "duration_ms": 812, "error": null, "metrics": {"notes": 3}}
//! ```
//!
//! The line refines the exit code rather than replacing it: `success: false`
//! fails a step that exited `0`, and a missing line falls back to the exit
//! code alone unless the step asked for a strict contract.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::workflow::ContractMode;

/// Exit code for success.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for failure.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for partial success; counts as success for retry purposes.
pub const EXIT_PARTIAL: i32 = 2;

/// The structured result line emitted by a step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ContractReport {
    #[serde(default)]
    pub skill: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    #[serde(default)]
    pub artifacts: Map<String, Value>,
}

/// How an attempt's output was judged.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub success: bool,
    /// Exited with [`EXIT_PARTIAL`]
    pub partial: bool,
    /// Why the attempt failed; `None` on success
    pub error: Option<String>,
    pub report: Option<ContractReport>,
}

/// Parses the last non-empty stdout line as a [`ContractReport`].
///
/// Any JSON object with a boolean `success` counts. The other fields are
/// best effort: a value of the wrong type is dropped, never the report.
pub fn parse_report(stdout: &str) -> Option<ContractReport> {
    let last = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    if !last.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(last).ok()?;
    let fields = value.as_object()?;
    let success = fields.get("success")?.as_bool()?;

    Some(ContractReport {
        skill: fields.get("skill").and_then(Value::as_str).map(str::to_string),
        success,
        duration_ms: fields.get("duration_ms").and_then(as_millis),
        error: fields.get("error").and_then(as_message),
        metrics: object_field(fields, "metrics"),
        artifacts: object_field(fields, "artifacts"),
    })
}

fn as_millis(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .map(|ms| ms.round() as u64)
    })
}

fn as_message(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn object_field(fields: &Map<String, Value>, key: &str) -> Map<String, Value> {
    fields
        .get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Judges a finished process. `exit_code` is `None` when the process was
/// killed by a signal.
pub fn evaluate(exit_code: Option<i32>, stdout: &str, stderr: &str, mode: ContractMode) -> Verdict {
    let report = parse_report(stdout);
    let exit_ok = matches!(exit_code, Some(EXIT_SUCCESS) | Some(EXIT_PARTIAL));
    let partial = exit_code == Some(EXIT_PARTIAL);

    let failure = match &report {
        Some(r) if !r.success => Some(
            r.error
                .clone()
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| "step reported success: false".to_string()),
        ),
        None if mode == ContractMode::Strict => {
            Some("no structured result line found (strict contract)".to_string())
        }
        _ if !exit_ok => Some(describe_exit(exit_code, stderr)),
        _ => None,
    };

    Verdict {
        success: failure.is_none(),
        partial,
        error: failure,
        report,
    }
}

fn describe_exit(exit_code: Option<i32>, stderr: &str) -> String {
    let last_stderr = stderr.lines().rev().map(str::trim).find(|l| !l.is_empty());
    match (last_stderr, exit_code) {
        (Some(line), _) => line.to_string(),
        (None, Some(code)) => format!("exited with code {}", code),
        (None, None) => "terminated by a signal".to_string(),
    }
}
