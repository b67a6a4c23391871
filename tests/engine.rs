//! End-to-end runs: markdown on disk, real bash steps, the file-backed
//! state store and JSON Lines telemetry.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

use workflow_runner::config::RunnerPaths;
use workflow_runner::execution::{Engine, RunMode, RunResult};
use workflow_runner::monitoring::{JsonlTelemetry, RunEvent, StepEvent};
use workflow_runner::workflow::{load_workflow, FileStateStore, StateStore, StepStatus, Workflow};
use workflow_runner::{EngineError, StateStoreError};

struct Harness {
    dir: TempDir,
    paths: RunnerPaths,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let paths = RunnerPaths::from_root(dir.path());
        fs::create_dir_all(&paths.workflows_dir).unwrap();
        Self { dir, paths }
    }

    fn workflow(&self, name: &str, content: &str) -> Workflow {
        let path = self.paths.workflows_dir.join(format!("{}.md", name));
        fs::write(&path, content).unwrap();
        load_workflow(&path).unwrap()
    }

    fn store(&self) -> FileStateStore {
        FileStateStore::new(&self.paths.state_dir)
    }

    fn engine(&self, workflow: Workflow, mode: RunMode) -> Engine {
        let mut engine = Engine::new(
            workflow,
            Arc::new(self.store()),
            Arc::new(JsonlTelemetry::new(&self.paths.logs_dir)),
        );
        engine.set_mode(mode);
        engine.set_backoff_base(Duration::from_millis(10));
        engine.set_grace_period(Duration::from_millis(200));
        engine.set_working_dir(self.dir.path());
        engine
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn read(&self, name: &str) -> String {
        fs::read_to_string(self.file(name)).unwrap_or_default()
    }

    fn step_events(&self) -> Vec<StepEvent> {
        read_jsonl(self.paths.logs_dir.join("workflow_steps.jsonl"))
    }

    fn run_events(&self) -> Vec<RunEvent> {
        read_jsonl(self.paths.runs_log())
    }
}

fn read_jsonl<T: serde::de::DeserializeOwned>(path: PathBuf) -> Vec<T> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

const ORDERED: &str = r#"---
id: ordered
---

## Steps

### One
```bash
echo one >> trace.txt
```

### Two
```bash
echo two >> trace.txt
```

### Three
```bash
echo three >> trace.txt
```
"#;

#[tokio::test]
async fn test_steps_run_in_document_order() {
    let h = Harness::new();
    let workflow = h.workflow("ordered", ORDERED);

    let report = h.engine(workflow, RunMode::Run).run().await.unwrap();

    assert_eq!(report.result, RunResult::Succeeded);
    assert_eq!(h.read("trace.txt"), "one\ntwo\nthree\n");

    let state = h.store().load("ordered").unwrap().unwrap();
    assert_eq!(state.cursor, 3);
    let ids: Vec<&str> = state.step_statuses.keys().map(String::as_str).collect();
    assert_eq!(ids, vec!["one", "two", "three"]);

    let runs = h.run_events();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].mode, "run");
    assert!(runs[0].success);
    assert_eq!(runs[0].steps_total, 3);
    assert_eq!(runs[0].steps_succeeded, 3);
    assert_eq!(h.step_events().len(), 3);
}

const FAILING_MIDDLE: &str = r#"---
id: failing
---

## Steps

### Prepare
```bash
echo prepare >> trace.txt
```

### Break
// runner
// on_fail: ON_FAIL

```bash
echo 'cannot reach server' >&2
exit 3
```

### Finish
```bash
echo finish >> trace.txt
```
"#;

#[tokio::test]
async fn test_stop_policy_halts_run() {
    let h = Harness::new();
    let workflow = h.workflow("failing", &FAILING_MIDDLE.replace("ON_FAIL", "stop"));

    let report = h.engine(workflow, RunMode::Run).run().await.unwrap();

    assert_eq!(report.result, RunResult::Failed);
    assert_eq!(h.read("trace.txt"), "prepare\n");

    let failed: Vec<_> = report.failed_steps().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, "break");
    assert_eq!(failed[0].exit_code, Some(3));
    assert_eq!(failed[0].error.as_deref(), Some("cannot reach server"));

    let state = h.store().load("failing").unwrap().unwrap();
    assert_eq!(state.cursor, 1);
    assert_eq!(state.record("break").unwrap().status, StepStatus::Failed);
    assert_eq!(state.record("finish").unwrap().status, StepStatus::Pending);

    let run = &h.run_events()[0];
    assert_eq!(run.result, RunResult::Failed);
    assert!(!run.success);
    assert_eq!(run.steps_failed, 1);
}

#[tokio::test]
async fn test_continue_policy_yields_partial() {
    let h = Harness::new();
    let workflow = h.workflow("failing", &FAILING_MIDDLE.replace("ON_FAIL", "continue"));

    let report = h.engine(workflow, RunMode::Run).run().await.unwrap();

    assert_eq!(report.result, RunResult::Partial);
    assert_eq!(h.read("trace.txt"), "prepare\nfinish\n");

    let state = h.store().load("failing").unwrap().unwrap();
    assert_eq!(state.cursor, 3);
    assert_eq!(state.record("finish").unwrap().status, StepStatus::Succeeded);
    assert_eq!(h.run_events()[0].result, RunResult::Partial);
}

const FLAKY: &str = r#"---
id: flaky
---

## Steps

### Always fails
// runner
// retries: 2

```bash
echo attempt >> attempts.txt
exit 1
```
"#;

#[tokio::test]
async fn test_retries_with_exponential_backoff() {
    let h = Harness::new();
    let workflow = h.workflow("flaky", FLAKY);

    let report = h.engine(workflow, RunMode::Run).run().await.unwrap();

    assert_eq!(report.result, RunResult::Failed);
    assert_eq!(report.steps[0].attempts, 3);
    assert_eq!(h.read("attempts.txt").lines().count(), 3);

    let events = h.step_events();
    let attempts: Vec<u32> = events.iter().map(|e| e.attempt).collect();
    let consumed: Vec<u32> = events.iter().map(|e| e.attempts).collect();
    let backoff: Vec<Option<u64>> = events.iter().map(|e| e.backoff_ms).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(consumed, vec![1, 2, 3]);
    assert_eq!(backoff, vec![Some(10), Some(20), None]);
    assert!(events.iter().all(|e| e.status == StepStatus::Failed));
    assert!(events.iter().all(|e| e.exit_code == Some(1)));
}

#[tokio::test]
async fn test_max_retries_caps_attempts() {
    let h = Harness::new();
    let workflow = h.workflow("flaky", FLAKY);

    let mut engine = h.engine(workflow, RunMode::Run);
    engine.set_max_retries(Some(0));
    let report = engine.run().await.unwrap();

    assert_eq!(report.steps[0].attempts, 1);
    assert_eq!(h.step_events().len(), 1);
}

const UNSTARTABLE: &str = r#"---
id: unstartable
---

## Steps

### Needs a directory
// runner
// retries: 1

```bash
echo never
```
"#;

#[tokio::test]
async fn test_spawn_failure_is_retried() {
    let h = Harness::new();
    let workflow = h.workflow("unstartable", UNSTARTABLE);

    let mut engine = h.engine(workflow, RunMode::Run);
    engine.set_working_dir(h.file("missing-dir"));
    let report = engine.run().await.unwrap();

    assert_eq!(report.result, RunResult::Failed);
    assert_eq!(report.steps[0].status, StepStatus::Failed);
    assert_eq!(report.steps[0].attempts, 2);
    assert!(report.steps[0]
        .error
        .as_deref()
        .unwrap()
        .contains("failed to start"));

    let events = h.step_events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].backoff_ms, Some(10));
    assert!(events.iter().all(|e| e.status == StepStatus::Failed));
}

const RESUMABLE: &str = r#"---
id: resumable
---

## Steps

### Count
```bash
echo ran >> count.txt
```

### Gate
```bash
test -f gate-open || { echo 'gate closed' >&2; exit 1; }
echo passed >> gate.txt
```

### After
```bash
echo after >> after.txt
```
"#;

#[tokio::test]
async fn test_resume_skips_succeeded_steps() {
    let h = Harness::new();
    let workflow = h.workflow("resumable", RESUMABLE);

    let first = h.engine(workflow.clone(), RunMode::Run).run().await.unwrap();
    assert_eq!(first.result, RunResult::Failed);
    assert_eq!(h.read("after.txt"), "");

    fs::write(h.file("gate-open"), "").unwrap();
    let second = h.engine(workflow, RunMode::Resume).run().await.unwrap();

    assert_eq!(second.result, RunResult::Succeeded);
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.steps[0].status, StepStatus::Skipped);
    assert_eq!(h.read("count.txt"), "ran\n");
    assert_eq!(h.read("gate.txt"), "passed\n");
    assert_eq!(h.read("after.txt"), "after\n");

    let state = h.store().load("resumable").unwrap().unwrap();
    assert_eq!(state.cursor, 3);
    assert!(state.is_succeeded("count"));

    let skipped: Vec<StepEvent> = h
        .step_events()
        .into_iter()
        .filter(|e| e.status == StepStatus::Skipped)
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].step_id, "count");
    assert_eq!(skipped[0].attempts, 0);

    let runs = h.run_events();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].mode, "resume");
    assert_eq!(runs[1].steps_skipped, 1);
}

#[tokio::test]
async fn test_resume_without_state_starts_fresh() {
    let h = Harness::new();
    let workflow = h.workflow("ordered", ORDERED);

    let report = h.engine(workflow, RunMode::Resume).run().await.unwrap();

    assert_eq!(report.result, RunResult::Succeeded);
    assert_eq!(h.read("trace.txt"), "one\ntwo\nthree\n");
}

#[tokio::test]
async fn test_resume_with_corrupt_state_runs_nothing() {
    let h = Harness::new();
    let workflow = h.workflow("ordered", ORDERED);
    fs::create_dir_all(&h.paths.state_dir).unwrap();
    fs::write(h.store().state_path("ordered"), "{ truncated").unwrap();

    let err = h.engine(workflow, RunMode::Resume).run().await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::State(StateStoreError::Corrupt { .. })
    ));
    assert!(!h.file("trace.txt").exists());
    assert!(h.step_events().is_empty());
    assert_eq!(
        fs::read_to_string(h.store().state_path("ordered")).unwrap(),
        "{ truncated"
    );
}

const CONTRACT: &str = r#"---
id: contract
---

## Steps

### Lies about success
// runner
// on_fail: continue

```bash
echo 'working'
echo '{"skill": "publisher", "success": false, "error": "token expired"}'
exit 0
```

### Partial
```bash
echo 'some items skipped'
exit 2
```

### Reports metrics
```bash
echo '{"skill": "notes", "success": true, "metrics": {"notes": 4}}'
```
"#;

#[tokio::test]
async fn test_output_contract_refines_exit_code() {
    let h = Harness::new();
    let workflow = h.workflow("contract", CONTRACT);

    let report = h.engine(workflow, RunMode::Run).run().await.unwrap();

    assert_eq!(report.result, RunResult::Partial);
    assert_eq!(report.steps[0].status, StepStatus::Failed);
    assert_eq!(report.steps[0].error.as_deref(), Some("token expired"));
    assert_eq!(report.steps[1].status, StepStatus::Succeeded);
    assert!(report.steps[1].partial);
    assert_eq!(report.steps[1].exit_code, Some(2));

    let state = h.store().load("contract").unwrap().unwrap();
    let metrics = &state.record("reports-metrics").unwrap().metrics;
    assert_eq!(metrics.get("notes"), Some(&serde_json::Value::from(4)));
}

#[tokio::test]
async fn test_dry_run_touches_nothing() {
    let h = Harness::new();
    let workflow = h.workflow("ordered", ORDERED);

    let report = h.engine(workflow, RunMode::DryRun).run().await.unwrap();

    assert_eq!(report.result, RunResult::Succeeded);
    assert_eq!(report.run_id, None);
    assert!(!h.file("trace.txt").exists());
    assert!(!h.paths.state_dir.exists());
    assert!(!h.paths.logs_dir.exists());
}

#[tokio::test]
async fn test_single_step_does_not_move_cursor() {
    let h = Harness::new();
    let workflow = h.workflow("ordered", ORDERED);

    let report = h
        .engine(workflow, RunMode::SingleStep("Two".to_string()))
        .run()
        .await
        .unwrap();

    assert_eq!(report.result, RunResult::Succeeded);
    assert_eq!(h.read("trace.txt"), "two\n");

    let state = h.store().load("ordered").unwrap().unwrap();
    assert_eq!(state.cursor, 0);
    assert!(state.is_succeeded("two"));
    assert_eq!(state.record("one").unwrap().status, StepStatus::Pending);
    assert_eq!(h.run_events()[0].mode, "single_step");
}

#[tokio::test]
async fn test_locked_state_is_an_error() {
    let h = Harness::new();
    let workflow = h.workflow("ordered", ORDERED);

    let _held = h.store().lock("ordered").unwrap();
    let err = h.engine(workflow, RunMode::Run).run().await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::State(StateStoreError::Locked { .. })
    ));
    assert!(!h.file("trace.txt").exists());
}

const WRAP_SESSION: &str = r#"---
id: wrap-session
description: Close out the working session
---

# Wrap session

## Steps

### Sync tasks
// runner
// id: sync_tasks
// retries: 2
// timeout_s: 1
// on_fail: stop

```bash
n=$(cat counter 2>/dev/null || echo 0)
n=$((n + 1))
echo "$n" > counter
if [ "$n" -lt 3 ]; then
  sleep 5
fi
echo synced >> trace.txt
```

### Write notes
```bash
echo notes >> trace.txt
```
"#;

#[tokio::test]
async fn test_timeouts_then_success() {
    let h = Harness::new();
    let workflow = h.workflow("wrap-session", WRAP_SESSION);

    let report = h.engine(workflow, RunMode::Run).run().await.unwrap();

    assert_eq!(report.result, RunResult::Succeeded);
    assert_eq!(report.steps[0].id, "sync_tasks");
    assert_eq!(report.steps[0].attempts, 3);
    assert_eq!(h.read("counter").trim(), "3");
    assert_eq!(h.read("trace.txt"), "synced\nnotes\n");

    let statuses: Vec<StepStatus> = h
        .step_events()
        .into_iter()
        .filter(|e| e.step_id == "sync_tasks")
        .map(|e| e.status)
        .collect();
    assert_eq!(
        statuses,
        vec![StepStatus::TimedOut, StepStatus::TimedOut, StepStatus::Succeeded]
    );

    let state = h.store().load("wrap-session").unwrap().unwrap();
    let record = state.record("sync_tasks").unwrap();
    assert_eq!(record.status, StepStatus::Succeeded);
    assert_eq!(record.attempts, 3);
    assert!(record.last_error.is_none());
}

#[tokio::test]
async fn test_timeout_exhausted_fails_run() {
    let h = Harness::new();
    let workflow = h.workflow("wrap-session", WRAP_SESSION);

    let mut engine = h.engine(workflow, RunMode::Run);
    engine.set_max_retries(Some(0));
    let report = engine.run().await.unwrap();

    assert_eq!(report.result, RunResult::Failed);
    assert_eq!(report.steps[0].status, StepStatus::TimedOut);
    assert_eq!(report.steps[0].error.as_deref(), Some("timed out after 1s"));
    assert_eq!(report.steps[1].status, StepStatus::Pending);
    assert_eq!(h.read("trace.txt"), "");
}

#[tokio::test]
async fn test_interrupt_stops_running_step() {
    let h = Harness::new();
    let workflow = h.workflow("wrap-session", WRAP_SESSION);

    let engine = h.engine(workflow, RunMode::Run);
    let token = engine.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
    });

    let report = engine.run().await.unwrap();

    assert_eq!(report.result, RunResult::Interrupted);
    assert!(h.step_events().is_empty());
    assert_eq!(h.run_events()[0].result, RunResult::Interrupted);

    let state = h.store().load("wrap-session").unwrap().unwrap();
    assert_eq!(state.cursor, 0);
    assert_eq!(state.record("sync_tasks").unwrap().status, StepStatus::Pending);
    assert_eq!(state.record("sync_tasks").unwrap().attempts, 0);
}
