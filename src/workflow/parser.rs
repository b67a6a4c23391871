//! Workflow Parser
//!
//! Loads workflow definitions from markdown documents:
//!
//! ````markdown
//! ---
//! id: wrap-session
//! description: End-of-day wrap up
//! ---
//!
//! ## Steps
//!
//! ### Sync tasks
//! // runner
//! // id: sync_tasks
//! // retries: 2
//! // timeout_s: 120
//!
//! ```bash
//! ./scripts/sync.sh
//! ```
//!
//! ### Publish
//! ```bash
//! ./scripts/publish.sh
//! ```
//! ````
//!
//! Parsing runs in two passes. The first splits the document into front
//! matter and heading-delimited step sections with their fenced blocks. The
//! second interprets each section into a typed [`Step`], collecting every
//! malformed step before failing so an author sees all problems at once.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use super::directives;
use super::model::{CommandBlock, ShellKind, Step, Workflow};
use crate::error::{ParseError, StepIssue};

static SLUG_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9_]+").expect("slug pattern is valid"));

static WORKFLOW_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("id pattern is valid"));

const STEPS_HEADING: &str = "steps";

/// Turns heading text into a step id: lowercase, runs of anything other
/// than letters, digits and `_` collapsed to `-`.
pub fn slugify(text: &str) -> String {
    let lowered = text.to_lowercase();
    let slug = SLUG_SEPARATORS.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "step".to_string()
    } else {
        slug.to_string()
    }
}

/// Resolves `--workflow` to a document path.
///
/// An existing file path wins; otherwise the name is looked up as
/// `<workflows_dir>/<name>.md`.
pub fn locate_workflow(name_or_path: &str, workflows_dir: &Path) -> Result<PathBuf, ParseError> {
    let candidate = Path::new(name_or_path);
    if candidate.is_file() {
        return Ok(candidate.to_path_buf());
    }

    let file_name = if name_or_path.ends_with(".md") {
        name_or_path.to_string()
    } else {
        format!("{}.md", name_or_path)
    };
    let named = workflows_dir.join(file_name);
    if named.is_file() {
        return Ok(named);
    }

    Err(ParseError::NotFound(name_or_path.to_string()))
}

/// Loads a workflow from a markdown file.
///
/// # Example
///
/// ```rust,no_run
/// use std::path::Path;
/// use workflow_runner::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow(Path::new(".agent/workflows/wrap-session.md"))?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: &Path) -> Result<Workflow, ParseError> {
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| ParseError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    debug!("Markdown content loaded ({} bytes)", content.len());

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("workflow");

    let mut workflow = parse_workflow(&content, &slugify(stem))?;
    workflow.source = Some(path.to_path_buf());

    info!(
        "Parsed workflow '{}' with {} steps",
        workflow.id,
        workflow.steps.len()
    );
    Ok(workflow)
}

/// Parses every `*.md` document in a directory, sorted by path.
///
/// Documents that fail to parse are returned with their error rather than
/// aborting the listing.
pub fn list_workflows(dir: &Path) -> Vec<(PathBuf, Result<Workflow, ParseError>)> {
    let Ok(entries) = fs::read_dir(dir) else {
        warn!("Workflow directory not readable: {}", dir.display());
        return Vec::new();
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let parsed = load_workflow(&path);
            (path, parsed)
        })
        .collect()
}

/// Parses workflow markdown. `fallback_id` is used when the front matter
/// has no `id`.
pub fn parse_workflow(content: &str, fallback_id: &str) -> Result<Workflow, ParseError> {
    let document = split_document(content);

    let front = document
        .front_matter
        .as_deref()
        .map(parse_front_matter)
        .unwrap_or_default();

    let id = front
        .id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| fallback_id.to_string());

    if !WORKFLOW_ID.is_match(&id) {
        return Err(ParseError::InvalidId(id));
    }

    if document.sections.is_empty() {
        return Err(ParseError::NoSteps(id));
    }

    let mut steps: Vec<Step> = Vec::with_capacity(document.sections.len());
    let mut issues = Vec::new();

    for section in &document.sections {
        match build_step(section) {
            Ok(step) => {
                if let Some(existing) = steps.iter().find(|s| s.id == step.id) {
                    issues.push(StepIssue {
                        step: section.title.clone(),
                        line: section.line,
                        message: format!(
                            "duplicate step id '{}' (already used by '{}')",
                            step.id, existing.title
                        ),
                    });
                    continue;
                }
                steps.push(step);
            }
            Err(messages) => {
                issues.extend(messages.into_iter().map(|message| StepIssue {
                    step: section.title.clone(),
                    line: section.line,
                    message,
                }));
            }
        }
    }

    if !issues.is_empty() {
        return Err(ParseError::Invalid {
            workflow: id,
            issues,
        });
    }

    Ok(Workflow {
        id,
        description: front.description.filter(|d| !d.trim().is_empty()),
        source: None,
        steps,
    })
}

// -- pass one: structure ----------------------------------------------------

/// A contiguous part of a step body.
#[derive(Debug)]
enum Segment {
    Text(Vec<String>),
    Fence { info: String, lines: Vec<String> },
}

/// A `### ` section under `## Steps`, not yet interpreted.
#[derive(Debug)]
struct RawStep {
    title: String,
    line: usize,
    segments: Vec<Segment>,
}

impl RawStep {
    fn push_text(&mut self, line: &str) {
        match self.segments.last_mut() {
            Some(Segment::Text(lines)) => lines.push(line.to_string()),
            _ => self.segments.push(Segment::Text(vec![line.to_string()])),
        }
    }
}

#[derive(Debug, Default)]
struct Document {
    front_matter: Option<String>,
    sections: Vec<RawStep>,
}

fn fence_marker(line: &str) -> Option<&'static str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with("```") {
        Some("```")
    } else if trimmed.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

fn heading_level(line: &str) -> Option<(usize, &str)> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if rest.is_empty() || rest.starts_with(' ') || rest.starts_with('\t') {
        Some((hashes, rest.trim()))
    } else {
        None
    }
}

fn split_document(content: &str) -> Document {
    let lines: Vec<&str> = content.lines().collect();
    let mut document = Document::default();
    let mut start = 0;

    if lines.first().map(|l| l.trim()) == Some("---") {
        if let Some(end) = lines.iter().skip(1).position(|l| l.trim() == "---") {
            document.front_matter = Some(lines[1..=end].join("\n"));
            start = end + 2;
        }
    }

    let mut in_steps = false;
    let mut open_fence: Option<(&'static str, String, Vec<String>)> = None;

    for (offset, line) in lines[start..].iter().enumerate() {
        let line_number = start + offset + 1;

        if let Some((marker, info, body)) = open_fence.as_mut() {
            if line.trim_start().starts_with(*marker) {
                let segment = Segment::Fence {
                    info: std::mem::take(info),
                    lines: std::mem::take(body),
                };
                if let Some(step) = document.sections.last_mut().filter(|_| in_steps) {
                    step.segments.push(segment);
                }
                open_fence = None;
            } else {
                body.push(line.to_string());
            }
            continue;
        }

        if let Some(marker) = fence_marker(line) {
            let info = line.trim_start().trim_start_matches(marker).trim().to_string();
            open_fence = Some((marker, info, Vec::new()));
            continue;
        }

        if let Some((level, text)) = heading_level(line) {
            if level <= 2 {
                in_steps = level == 2 && text.eq_ignore_ascii_case(STEPS_HEADING);
                continue;
            }
            if level == 3 && in_steps {
                document.sections.push(RawStep {
                    title: text.to_string(),
                    line: line_number,
                    segments: Vec::new(),
                });
                continue;
            }
        }

        if in_steps {
            if let Some(step) = document.sections.last_mut() {
                step.push_text(line);
            }
        }
    }

    if let Some((_, info, body)) = open_fence {
        if in_steps {
            if let Some(step) = document.sections.last_mut() {
                warn!("Unterminated code fence in step '{}'", step.title);
                step.segments.push(Segment::Fence { info, lines: body });
            }
        }
    }

    document
}

// -- pass two: interpretation -----------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct FrontMatter {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

fn parse_front_matter(text: &str) -> FrontMatter {
    match serde_yaml::from_str::<FrontMatter>(text) {
        Ok(front) => front,
        Err(e) => {
            debug!("Front matter is not valid YAML ({}); reading key/value lines", e);
            let mut front = FrontMatter::default();
            for line in text.lines() {
                if let Some((key, value)) = line.split_once(':') {
                    let value = value.trim().trim_matches('"').to_string();
                    match key.trim() {
                        "id" => front.id = Some(value),
                        "description" => front.description = Some(value),
                        _ => {}
                    }
                }
            }
            front
        }
    }
}

fn build_step(raw: &RawStep) -> Result<Step, Vec<String>> {
    let mut step = Step::new(slugify(&raw.title), raw.title.clone());
    let mut payload: Option<Vec<String>> = None;

    for segment in &raw.segments {
        let candidate = match segment {
            Segment::Fence { info, lines } => {
                if let Some(shell) = ShellKind::from_fence(info) {
                    let script = lines.join("\n").trim().to_string();
                    if script.is_empty() {
                        warn!("Step '{}' has an empty {} block", raw.title, shell);
                    } else {
                        step.commands.push(CommandBlock { shell, script });
                    }
                    continue;
                }
                directives::find_block(lines)
            }
            Segment::Text(lines) => directives::find_block(lines),
        };

        match (candidate, payload.is_some()) {
            (Some(found), false) => payload = Some(found),
            (Some(_), true) => warn!(
                "Step '{}' has more than one runner block; only the first is used",
                raw.title
            ),
            (None, _) => {}
        }
    }

    let directives = match payload {
        Some(lines) => directives::interpret(&lines)?,
        None => directives::Directives::default(),
    };

    if let Some(id) = directives.id {
        step.id = id;
    }
    if let Some(retries) = directives.retries {
        step.retries = retries;
    }
    if let Some(timeout_s) = directives.timeout_s {
        step.timeout_s = timeout_s;
    }
    if let Some(on_fail) = directives.on_fail {
        step.on_fail = on_fail;
    }
    if let Some(contract) = directives.contract {
        step.contract = contract;
    }

    debug!(
        "Step '{}': {} block(s), retries={}, timeout_s={:?}, on_fail={}",
        step.id,
        step.commands.len(),
        step.retries,
        step.timeout_s,
        step.on_fail
    );
    Ok(step)
}
