//! Runner Directives
//!
//! Steps carry their policy in a comment block inside the step body, so the
//! document still renders as plain prose. Two spellings are recognised:
//!
//! ```text
//! // runner
//! // id: sync_tasks
//! // retries: 2
//! // timeout_s: 120
//! // on_fail: stop
//! ```
//!
//! ```text
//! <!-- runner
//! retries: 2
//! on_fail: continue
//! -->
//! ```
//!
//! Unknown keys are ignored so older runners can read newer documents.

use log::debug;

use super::model::{ContractMode, OnFail};
use super::parser::slugify;

const LINE_MARKER: &str = "// runner";
const HTML_MARKER: &str = "<!-- runner";
const HTML_CLOSE: &str = "-->";

/// Typed directive values; `None` means "not given, use the default".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    pub id: Option<String>,
    pub retries: Option<u32>,
    /// `Some(None)` is an explicit `timeout_s: none`
    pub timeout_s: Option<Option<u64>>,
    pub on_fail: Option<OnFail>,
    pub contract: Option<ContractMode>,
}

/// Finds the first directive block in a run of lines and returns its
/// `key: value` payload lines.
pub fn find_block<S: AsRef<str>>(lines: &[S]) -> Option<Vec<String>> {
    let mut iter = lines.iter().map(|l| l.as_ref().trim());

    while let Some(line) = iter.next() {
        if line == LINE_MARKER {
            let payload = iter
                .by_ref()
                .take_while(|l| l.starts_with("//"))
                .map(|l| l.trim_start_matches('/').trim().to_string())
                .collect();
            return Some(payload);
        }

        if let Some(rest) = line.strip_prefix(HTML_MARKER) {
            let mut payload = Vec::new();
            if let Some(inline) = rest.strip_suffix(HTML_CLOSE) {
                payload.push(inline.trim().to_string());
                return Some(payload);
            }
            payload.push(rest.trim().to_string());
            for inner in iter.by_ref() {
                if let Some(end) = inner.find(HTML_CLOSE) {
                    payload.push(inner[..end].trim().to_string());
                    break;
                }
                payload.push(inner.to_string());
            }
            return Some(payload);
        }
    }

    None
}

/// Interprets payload lines into typed directives.
///
/// Every malformed value is reported, not just the first.
pub fn interpret(payload: &[String]) -> Result<Directives, Vec<String>> {
    let mut directives = Directives::default();
    let mut errors = Vec::new();

    for entry in payload.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
        let Some((key, value)) = entry.split_once(':') else {
            debug!("Ignoring directive line without a key: '{}'", entry);
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();

        match key.as_str() {
            "id" => {
                if value.is_empty() {
                    errors.push("id must not be empty".to_string());
                } else {
                    directives.id = Some(slugify(value));
                }
            }
            "retries" => match value.parse::<u32>() {
                Ok(n) => directives.retries = Some(n),
                Err(_) => errors.push(format!(
                    "retries must be a non-negative integer, got '{}'",
                    value
                )),
            },
            "timeout_s" => match parse_timeout(value) {
                Ok(timeout) => directives.timeout_s = Some(timeout),
                Err(e) => errors.push(e),
            },
            "on_fail" => match value.parse::<OnFail>() {
                Ok(policy) => directives.on_fail = Some(policy),
                Err(e) => errors.push(e),
            },
            "contract" => match value.parse::<ContractMode>() {
                Ok(mode) => directives.contract = Some(mode),
                Err(e) => errors.push(e),
            },
            other => debug!("Ignoring unknown runner directive '{}'", other),
        }
    }

    if errors.is_empty() {
        Ok(directives)
    } else {
        Err(errors)
    }
}

fn parse_timeout(value: &str) -> Result<Option<u64>, String> {
    if value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    match value.parse::<u64>() {
        Ok(0) | Err(_) => Err(format!(
            "timeout_s must be a positive integer or 'none', got '{}'",
            value
        )),
        Ok(n) => Ok(Some(n)),
    }
}
