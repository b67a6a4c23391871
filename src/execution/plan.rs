//! Dry-run plan rendering.

use std::fmt;

use crate::workflow::{Step, Workflow};

/// The ordered step sequence with resolved policy and commands.
///
/// `max_retries` is the global cap; effective retries are shown next to the
/// declared value when the cap lowers them.
#[derive(Debug, Clone, Copy)]
pub struct Plan<'a> {
    workflow: &'a Workflow,
    max_retries: Option<u32>,
}

impl<'a> Plan<'a> {
    pub fn new(workflow: &'a Workflow, max_retries: Option<u32>) -> Self {
        Self {
            workflow,
            max_retries,
        }
    }
}

impl fmt::Display for Plan<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let workflow = self.workflow;
        writeln!(f, "Workflow: {} ({} steps)", workflow.id, workflow.len())?;
        if let Some(description) = &workflow.description {
            writeln!(f, "Description: {}", description)?;
        }
        if let Some(source) = &workflow.source {
            writeln!(f, "Source: {}", source.display())?;
        }

        for (index, step) in workflow.steps.iter().enumerate() {
            writeln!(f)?;
            writeln!(f, "{:>3}. {} [{}]", index + 1, step.title, step.id)?;
            writeln!(f, "     {}", policy_line(step, self.max_retries))?;

            if !step.is_executable() {
                writeln!(f, "     (no executable block; will be skipped)")?;
                continue;
            }
            for block in &step.commands {
                writeln!(f, "     {}:", block.shell)?;
                for line in block.script.lines() {
                    writeln!(f, "       {}", line)?;
                }
            }
        }
        Ok(())
    }
}

/// Renders the dry-run plan of `workflow`.
pub fn render(workflow: &Workflow, max_retries: Option<u32>) -> String {
    Plan::new(workflow, max_retries).to_string()
}

fn policy_line(step: &Step, max_retries: Option<u32>) -> String {
    let effective = step.effective_retries(max_retries);
    let retries = if effective == step.retries {
        step.retries.to_string()
    } else {
        format!("{} (capped to {})", step.retries, effective)
    };
    let timeout = step
        .timeout_s
        .map(|t| format!("{}s", t))
        .unwrap_or_else(|| "none".to_string());

    format!(
        "retries: {}  timeout: {}  on_fail: {}  contract: {}",
        retries,
        timeout,
        step.on_fail,
        step.contract
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::OnFail;

    fn sample() -> Workflow {
        let mut workflow = Workflow::new(
            "wrap-session",
            vec![
                Step::new("sync_tasks", "Sync tasks")
                    .with_bash("./sync.sh\necho done")
                    .with_retries(2)
                    .with_timeout_s(120),
                Step::new("notes", "Notes").with_on_fail(OnFail::Continue),
            ],
        );
        workflow.description = Some("End of session".to_string());
        workflow
    }

    #[test]
    fn test_plan_lists_steps_in_order() {
        let plan = render(&sample(), None);

        let first = plan.find("Sync tasks").unwrap();
        let second = plan.find("Notes").unwrap();
        assert!(first < second);
        assert!(plan.contains("Workflow: wrap-session (2 steps)"));
        assert!(plan.contains("Description: End of session"));
        assert!(plan.contains("retries: 2  timeout: 120s  on_fail: stop  contract: lenient"));
        assert!(plan.contains("       ./sync.sh\n       echo done"));
        assert!(plan.contains("will be skipped"));
    }

    #[test]
    fn test_plan_writes_into_any_formatter() {
        use std::fmt::Write;

        let workflow = sample();
        let mut out = String::from("[DRY RUN]\n");
        write!(out, "{}", Plan::new(&workflow, None)).unwrap();

        assert!(out.starts_with("[DRY RUN]\nWorkflow: wrap-session (2 steps)\n"));
        assert!(out.ends_with(&render(&workflow, None)));
        assert!(out.ends_with("(no executable block; will be skipped)\n"));
    }

    #[test]
    fn test_plan_shows_retry_cap() {
        let plan = render(&sample(), Some(1));
        assert!(plan.contains("retries: 2 (capped to 1)"));
    }
}
