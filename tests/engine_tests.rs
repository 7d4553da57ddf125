// ABOUTME: Integration tests for the workflow execution engine
// ABOUTME: Tests scheduling, branching, loops, retries, error handlers and run control

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

use agentflow::engine::{
    CompileError, ErrorKind, ExecutionSnapshot, ExecutionStore, FileStore, RuntimeConfig,
    RuntimeError, StepStatus, StoreError, WorkflowRuntime, WorkflowStatus,
};
use agentflow::parser::{RecoveryAction, WorkflowSettings};
use agentflow::steps::{ExecutorRegistry, StepExecutionError, StepExecutor, StepInvocation};

mod common;
use common::{ConcurrencyGauge, GatedExecutor, Reply, ScriptedExecutor, TestWorkflowBuilder};

fn runtime(executor: Arc<dyn StepExecutor>) -> WorkflowRuntime {
    WorkflowRuntime::new(executor, RuntimeConfig::default())
}

async fn wait_for_status(
    runtime: &WorkflowRuntime,
    run_id: &str,
    status: WorkflowStatus,
) -> ExecutionSnapshot {
    for _ in 0..200 {
        let snapshot = runtime.get_state(run_id).await.unwrap();
        if snapshot.status == status {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {} never reached {}", run_id, status);
}

#[tokio::test]
async fn test_echo_workflow_end_to_end() {
    let workflow = TestWorkflowBuilder::new("echo")
        .with_variable("greeting", json!("Hello"))
        .start()
        .agent("agent", &["start"])
        .map("prompt", "{{ $context.greeting }}, {{ $json.name }}!")
        .map("missing", "{{ $json.nope }}")
        .action("action", &["agent"])
        .map("length", "{{ $node.agent.prompt.length }}")
        .end(&["action"])
        .map("result", "{{ $node.action.length * 2 }}")
        .build();

    let snapshot = runtime(Arc::new(ExecutorRegistry::with_builtins()))
        .execute(&workflow, json!({"name": "Ada"}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert_eq!(
        snapshot.output("agent"),
        Some(&json!({"prompt": "Hello, Ada!", "missing": null}))
    );
    assert_eq!(snapshot.output("action"), Some(&json!({"length": 11})));
    assert_eq!(snapshot.output("end"), Some(&json!({"result": 22})));
    assert_eq!(snapshot.completed.len(), 4);
    assert!(snapshot.error.is_none());
}

#[tokio::test]
async fn test_only_taken_branch_runs() {
    let executor = Arc::new(ScriptedExecutor::new());
    let workflow = TestWorkflowBuilder::new("branching")
        .start()
        .condition("check", &["start"], "{{ $json.score >= 50 }}", "pass", "fail")
        .action("pass", &[])
        .action("fail", &[])
        .action("after_fail", &["fail"])
        .end(&["pass", "after_fail"])
        .build();

    let snapshot = runtime(executor.clone())
        .execute(&workflow, json!({"score": 20}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert_eq!(snapshot.step_status("pass"), Some(StepStatus::Skipped));
    assert_eq!(snapshot.step_status("fail"), Some(StepStatus::Completed));
    assert_eq!(snapshot.step_status("after_fail"), Some(StepStatus::Completed));
    assert_eq!(snapshot.step_status("end"), Some(StepStatus::Completed));
    assert!(executor.calls_for("pass").is_empty());
    assert_eq!(executor.calls_for("fail").len(), 1);
}

#[tokio::test]
async fn test_skip_propagates_and_diamond_reconverges() {
    let workflow = TestWorkflowBuilder::new("diamond")
        .start()
        .condition("check", &["start"], "$json.fast", "quick", "slow")
        .action("quick", &[])
        .action("slow", &[])
        .action("slow_followup", &["slow"])
        .action("join", &["quick", "slow_followup"])
        .end(&["join"])
        .build();

    let snapshot = runtime(Arc::new(ScriptedExecutor::new()))
        .execute(&workflow, json!({"fast": true}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert_eq!(snapshot.step_status("slow"), Some(StepStatus::Skipped));
    assert_eq!(snapshot.step_status("slow_followup"), Some(StepStatus::Skipped));
    assert_eq!(snapshot.step_status("join"), Some(StepStatus::Completed));
    assert_eq!(snapshot.summary().skipped_steps, 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_with_exponential_backoff() {
    let executor = Arc::new(ScriptedExecutor::new().script(
        "flaky",
        vec![
            Reply::Fail("connection refused".to_string()),
            Reply::Fail("connection refused".to_string()),
            Reply::Fail("connection refused".to_string()),
            Reply::Output(json!({"ok": true})),
        ],
    ));
    let workflow = TestWorkflowBuilder::new("retry")
        .start()
        .action("flaky", &["start"])
        .retries(3)
        .end(&["flaky"])
        .build();

    let snapshot = runtime(executor.clone())
        .execute(&workflow, json!({}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    let flaky = snapshot.step("flaky").unwrap();
    assert_eq!(flaky.status, StepStatus::Completed);
    assert_eq!(flaky.attempt, 4);
    assert_eq!(
        flaky.retry_delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
    assert_eq!(flaky.output, Some(json!({"ok": true})));
    assert_eq!(executor.calls_for("flaky").len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_the_workflow() {
    let executor = Arc::new(ScriptedExecutor::new().fail_always("broken", "upstream exploded"));
    let workflow = TestWorkflowBuilder::new("exhausted")
        .start()
        .action("broken", &["start"])
        .retries(2)
        .end(&["broken"])
        .build();

    let snapshot = runtime(executor.clone())
        .execute(&workflow, json!({}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert_eq!(snapshot.failed, vec!["broken"]);
    assert_eq!(snapshot.step("broken").unwrap().attempt, 3);
    assert_eq!(snapshot.step_status("end"), Some(StepStatus::Pending));

    let error = snapshot.error.unwrap();
    assert_eq!(error.step_id.as_deref(), Some("broken"));
    assert!(error.message.contains("upstream exploded"));
}

#[tokio::test]
async fn test_loop_runs_body_per_item() {
    let workflow = TestWorkflowBuilder::new("looping")
        .start()
        .loop_over("each", &["start"], "{{ $json.items }}", "double")
        .action("double", &[])
        .map("value", "{{ $json * 2 }}")
        .map("index", "{{ $execution.iteration }}")
        .end(&["each"])
        .map("total", "{{ $node.each.count }}")
        .build();

    let snapshot = runtime(Arc::new(ScriptedExecutor::new()))
        .execute(&workflow, json!({"items": [1, 2, 3]}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert_eq!(
        snapshot.output("each"),
        Some(&json!({
            "count": 3,
            "results": [
                {"double": {"value": 2, "index": 0}},
                {"double": {"value": 4, "index": 1}},
                {"double": {"value": 6, "index": 2}}
            ]
        }))
    );

    let each = snapshot.step("each").unwrap();
    assert_eq!(each.iterations.len(), 3);
    assert_eq!(each.iterations[1].item, json!(2));
    assert_eq!(snapshot.output("end"), Some(&json!({"total": 3})));
}

#[tokio::test]
async fn test_empty_and_invalid_loop_collections() {
    let workflow = TestWorkflowBuilder::new("looping")
        .start()
        .loop_over("each", &["start"], "{{ $json.items }}", "body")
        .action("body", &[])
        .end(&["each"])
        .build();
    let runtime = runtime(Arc::new(ScriptedExecutor::new()));

    let empty = runtime
        .execute(&workflow, json!({"items": []}))
        .await
        .unwrap();
    assert_eq!(empty.status, WorkflowStatus::Completed);
    assert_eq!(empty.output("each"), Some(&json!({"count": 0, "results": []})));

    let invalid = runtime
        .execute(&workflow, json!({"items": "nope"}))
        .await
        .unwrap();
    assert_eq!(invalid.status, WorkflowStatus::Failed);
    let error = invalid.step("each").unwrap().error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::Evaluation);
}

#[tokio::test]
async fn test_failing_loop_body_fails_the_loop() {
    let executor = Arc::new(ScriptedExecutor::new().script(
        "body",
        vec![
            Reply::Output(json!({"ok": 1})),
            Reply::Fail("bad item".to_string()),
        ],
    ));
    let workflow = TestWorkflowBuilder::new("looping")
        .start()
        .loop_over("each", &["start"], "{{ $json.items }}", "body")
        .action("body", &[])
        .end(&["each"])
        .build();

    let snapshot = runtime(executor)
        .execute(&workflow, json!({"items": ["a", "b", "c"]}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    let error = snapshot.error.unwrap();
    assert_eq!(error.step_id.as_deref(), Some("each"));
    assert!(error.message.contains("iteration 1"));
    assert!(error.message.contains("bad item"));
}

#[tokio::test]
async fn test_condition_errors_are_not_retried() {
    let workflow = TestWorkflowBuilder::new("bad_condition")
        .start()
        .condition("check", &["start"], "{{ $json.items }}", "yes", "no")
        .retries(3)
        .action("yes", &[])
        .action("no", &[])
        .end(&["yes", "no"])
        .build();

    let snapshot = runtime(Arc::new(ScriptedExecutor::new()))
        .execute(&workflow, json!({"items": [1]}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    let check = snapshot.step("check").unwrap();
    assert_eq!(check.attempt, 1);
    assert_eq!(check.error.as_ref().unwrap().kind, ErrorKind::Evaluation);
}

#[tokio::test]
async fn test_handler_continue_skips_failed_step() {
    let executor = Arc::new(ScriptedExecutor::new().fail_always("risky", "boom"));
    let workflow = TestWorkflowBuilder::new("continue")
        .start()
        .action("risky", &["start"])
        .action("after_risky", &["risky"])
        .handler("handler", &["risky"], RecoveryAction::Continue, None)
        .end(&["after_risky", "handler"])
        .build();

    let snapshot = runtime(executor.clone())
        .execute(&workflow, json!({}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert_eq!(snapshot.step_status("risky"), Some(StepStatus::Skipped));
    assert_eq!(snapshot.step_status("after_risky"), Some(StepStatus::Skipped));
    assert_eq!(snapshot.step_status("handler"), Some(StepStatus::Completed));
    assert_eq!(
        snapshot.step("risky").unwrap().recovered_by.as_deref(),
        Some("handler")
    );

    let handler_input = &executor.calls_for("handler")[0];
    assert_eq!(handler_input.get("failedStep"), Some(&json!("risky")));
    assert_eq!(handler_input.get("errorType"), Some(&json!("execution")));
    assert!(handler_input
        .get("error")
        .and_then(|e| e.as_str())
        .unwrap()
        .contains("boom"));
}

#[tokio::test]
async fn test_handler_fallback_synthesizes_output() {
    let executor = Arc::new(ScriptedExecutor::new().fail_always("risky", "boom"));
    let workflow = TestWorkflowBuilder::new("fallback")
        .start()
        .action("risky", &["start"])
        .handler(
            "handler",
            &["risky"],
            RecoveryAction::Fallback,
            Some(json!({"answer": 42})),
        )
        .end(&["risky"])
        .map("answer", "{{ $node.risky.answer }}")
        .build();

    let snapshot = runtime(executor)
        .execute(&workflow, json!({}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert_eq!(snapshot.step_status("risky"), Some(StepStatus::Completed));
    assert_eq!(snapshot.output("risky"), Some(&json!({"answer": 42})));
    assert_eq!(snapshot.output("end"), Some(&json!({"answer": 42})));
    assert!(snapshot.failed.is_empty());
}

#[tokio::test]
async fn test_handler_retry_reruns_failed_step() {
    let executor = Arc::new(ScriptedExecutor::new().script(
        "risky",
        vec![
            Reply::Fail("boom".to_string()),
            Reply::Output(json!({"ok": true})),
        ],
    ));
    let workflow = TestWorkflowBuilder::new("handler_retry")
        .start()
        .action("risky", &["start"])
        .handler("handler", &["risky"], RecoveryAction::Retry, None)
        .end(&["risky"])
        .build();

    let snapshot = runtime(executor)
        .execute(&workflow, json!({}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    let risky = snapshot.step("risky").unwrap();
    assert_eq!(risky.status, StepStatus::Completed);
    assert_eq!(risky.attempt, 1);
    assert_eq!(risky.recovered_by.as_deref(), Some("handler"));
    assert_eq!(risky.output, Some(json!({"ok": true})));
}

#[tokio::test]
async fn test_handler_stop_fails_workflow() {
    let executor = Arc::new(ScriptedExecutor::new().fail_always("risky", "boom"));
    let workflow = TestWorkflowBuilder::new("handler_stop")
        .start()
        .action("risky", &["start"])
        .handler("handler", &["risky"], RecoveryAction::Stop, None)
        .end(&["risky"])
        .build();

    let snapshot = runtime(executor)
        .execute(&workflow, json!({}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    let error = snapshot.error.unwrap();
    assert_eq!(error.step_id.as_deref(), Some("risky"));
    assert!(error.message.contains("stopped by error handler 'handler'"));
}

#[tokio::test]
async fn test_handler_filter_mismatch_fails_workflow() {
    let executor = Arc::new(ScriptedExecutor::new().fail_always("risky", "boom"));
    let workflow = TestWorkflowBuilder::new("filter")
        .start()
        .action("risky", &["start"])
        .handler("handler", &["risky"], RecoveryAction::Continue, None)
        .with_last(|step| {
            if let Some(config) = step.error_config.as_mut() {
                config.error_type_filter = vec!["timeout".to_string()];
            }
        })
        .end(&["risky"])
        .build();

    let snapshot = runtime(executor.clone())
        .execute(&workflow, json!({}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert!(executor.calls_for("handler").is_empty());
}

#[tokio::test]
async fn test_unused_handler_is_skipped() {
    let workflow = TestWorkflowBuilder::new("no_failure")
        .start()
        .action("risky", &["start"])
        .handler("handler", &["risky"], RecoveryAction::Continue, None)
        .end(&["risky", "handler"])
        .build();

    let snapshot = runtime(Arc::new(ScriptedExecutor::new()))
        .execute(&workflow, json!({}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert_eq!(snapshot.step_status("handler"), Some(StepStatus::Skipped));
    assert_eq!(snapshot.step_status("end"), Some(StepStatus::Completed));
}

#[tokio::test(start_paused = true)]
async fn test_step_timeout_is_a_failure() {
    let executor = Arc::new(ScriptedExecutor::new().script(
        "slow",
        vec![Reply::Sleep(
            Duration::from_secs(10),
            Box::new(Reply::Output(json!({}))),
        )],
    ));
    let workflow = TestWorkflowBuilder::new("timeout")
        .start()
        .agent("slow", &["start"])
        .timeout(Duration::from_secs(1))
        .end(&["slow"])
        .build();

    let snapshot = runtime(executor)
        .execute(&workflow, json!({}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    let error = snapshot.step("slow").unwrap().error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_step_is_retried() {
    let executor = Arc::new(ScriptedExecutor::new().script(
        "slow",
        vec![
            Reply::Sleep(Duration::from_secs(10), Box::new(Reply::Output(json!({})))),
            Reply::Output(json!({"fast": true})),
        ],
    ));
    let workflow = TestWorkflowBuilder::new("timeout_retry")
        .start()
        .agent("slow", &["start"])
        .timeout(Duration::from_secs(1))
        .retries(1)
        .end(&["slow"])
        .build();

    let snapshot = runtime(executor)
        .execute(&workflow, json!({}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    let slow = snapshot.step("slow").unwrap();
    assert_eq!(slow.attempt, 2);
    assert_eq!(slow.retry_delays, vec![Duration::from_secs(1)]);
    assert_eq!(slow.output, Some(json!({"fast": true})));
}

#[tokio::test]
async fn test_pause_and_resume() {
    let executor = Arc::new(GatedExecutor::new());
    let workflow = TestWorkflowBuilder::new("pausing")
        .start()
        .action("first", &["start"])
        .action("second", &["first"])
        .end(&["second"])
        .build();
    let runtime = runtime(executor.clone());

    let run_id = runtime.submit(&workflow, json!({})).await.unwrap();
    executor.started.notified().await;

    runtime.pause(&run_id).await.unwrap();
    wait_for_status(&runtime, &run_id, WorkflowStatus::Paused).await;

    // the in-flight step finishes, but nothing new is dispatched
    executor.gate.notify_one();
    for _ in 0..200 {
        let snapshot = runtime.get_state(&run_id).await.unwrap();
        if snapshot.step_status("first") == Some(StepStatus::Completed) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    let paused = runtime.get_state(&run_id).await.unwrap();
    assert_eq!(paused.status, WorkflowStatus::Paused);
    assert_eq!(paused.step_status("first"), Some(StepStatus::Completed));
    assert_eq!(paused.step_status("second"), Some(StepStatus::Ready));

    runtime.resume(&run_id).await.unwrap();
    executor.started.notified().await;
    executor.gate.notify_one();

    let snapshot = runtime.wait(&run_id).await.unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_stop_discards_in_flight_work() {
    let executor = Arc::new(GatedExecutor::new());
    let workflow = TestWorkflowBuilder::new("stopping")
        .start()
        .action("blocked", &["start"])
        .end(&["blocked"])
        .build();
    let runtime = runtime(executor.clone());

    let run_id = runtime.submit(&workflow, json!({})).await.unwrap();
    executor.started.notified().await;

    runtime.stop(&run_id).await.unwrap();
    let snapshot = runtime.wait(&run_id).await.unwrap();
    executor.gate.notify_one();

    assert_eq!(snapshot.status, WorkflowStatus::Stopped);
    assert_eq!(snapshot.step_status("blocked"), Some(StepStatus::Running));
    assert!(snapshot.output("blocked").is_none());
    assert!(matches!(
        runtime.resume(&run_id).await,
        Err(RuntimeError::RunFinished { .. })
    ));
}

#[tokio::test]
async fn test_concurrency_is_capped() {
    let gauge = Arc::new(ConcurrencyGauge::default());
    let mut workflow = TestWorkflowBuilder::new("parallel")
        .start()
        .action("a", &["start"])
        .action("b", &["start"])
        .action("c", &["start"])
        .action("d", &["start"])
        .end(&["a", "b", "c", "d"])
        .build();
    workflow.settings = Some(WorkflowSettings {
        max_concurrent_steps: Some(2),
        step_timeout: None,
    });

    let snapshot = runtime(gauge.clone())
        .execute(&workflow, json!({}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert_eq!(*gauge.peak.lock().unwrap(), 2);
}

#[tokio::test]
async fn test_submit_rejects_invalid_graph() {
    let workflow = TestWorkflowBuilder::new("cyclic")
        .start()
        .action("a", &["start", "b"])
        .action("b", &["a"])
        .end(&["b"])
        .build();
    let runtime = runtime(Arc::new(ScriptedExecutor::new()));

    let err = runtime.submit(&workflow, json!({})).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Compile(CompileError::Cycle { .. })
    ));
    assert!(runtime.list_runs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_snapshots_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let workflow = TestWorkflowBuilder::new("persisted")
        .start()
        .end(&["start"])
        .build();

    let snapshot = runtime(Arc::new(ScriptedExecutor::new()))
        .with_store(Arc::new(FileStore::new(dir.path())))
        .execute(&workflow, json!({"x": 1}))
        .await
        .unwrap();

    let reloaded = runtime(Arc::new(ScriptedExecutor::new()))
        .with_store(Arc::new(FileStore::new(dir.path())))
        .get_state(&snapshot.run_id)
        .await
        .unwrap();
    assert_eq!(reloaded.status, WorkflowStatus::Completed);
    assert_eq!(reloaded.output("start"), Some(&json!({"x": 1})));
}

#[tokio::test(start_paused = true)]
async fn test_loop_body_retry_budget_is_per_iteration() {
    let executor = Arc::new(ScriptedExecutor::new().script(
        "work",
        vec![
            Reply::Fail("flaky".to_string()),
            Reply::Output(json!({"n": 1})),
            Reply::Fail("flaky".to_string()),
            Reply::Output(json!({"n": 2})),
        ],
    ));
    let workflow = TestWorkflowBuilder::new("flaky_loop")
        .start()
        .loop_over("each", &["start"], "{{ $json.items }}", "work")
        .action("work", &[])
        .retries(1)
        .end(&["each"])
        .build();

    let snapshot = runtime(executor.clone())
        .execute(&workflow, json!({"items": [1, 2]}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Completed, "{:?}", snapshot.error);
    assert_eq!(
        snapshot.output("each"),
        Some(&json!({
            "count": 2,
            "results": [{"work": {"n": 1}}, {"work": {"n": 2}}]
        }))
    );
    assert_eq!(executor.calls_for("work").len(), 4);
    assert_eq!(snapshot.step("work").unwrap().attempt, 2);
}

#[tokio::test]
async fn test_invalid_date_format_fails_the_step() {
    let workflow = TestWorkflowBuilder::new("bad_format")
        .start()
        .agent("agent", &["start"])
        .map("day", "{{ Date.format('2024-01-01', '%Q') }}")
        .end(&["agent"])
        .build();
    let executor = Arc::new(ScriptedExecutor::new());

    let snapshot = runtime(executor.clone())
        .execute(&workflow, json!({}))
        .await
        .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    let error = snapshot.error.unwrap();
    assert_eq!(error.step_id.as_deref(), Some("agent"));
    assert!(error.message.contains("not a valid date format"), "{}", error.message);
    assert!(executor.calls_for("agent").is_empty());
}

struct PanickingExecutor;

#[async_trait]
impl StepExecutor for PanickingExecutor {
    async fn execute(
        &self,
        invocation: StepInvocation,
    ) -> Result<Map<String, Value>, StepExecutionError> {
        if invocation.step_id == "agent" {
            panic!("executor bug");
        }
        Ok(invocation.input)
    }
}

#[tokio::test]
async fn test_panicking_executor_fails_its_step() {
    let workflow = TestWorkflowBuilder::new("panicky")
        .start()
        .agent("agent", &["start"])
        .end(&["agent"])
        .build();

    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        runtime(Arc::new(PanickingExecutor)).execute(&workflow, json!({})),
    )
    .await
    .expect("run hung after the executor panicked")
    .unwrap();

    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    let error = snapshot.error.unwrap();
    assert_eq!(error.step_id.as_deref(), Some("agent"));
    assert!(error.message.contains("panicked"));
}

struct PanickingStore;

#[async_trait]
impl ExecutionStore for PanickingStore {
    async fn save(&self, _snapshot: &ExecutionSnapshot) -> Result<(), StoreError> {
        panic!("store bug");
    }

    async fn load(&self, _run_id: &str) -> Result<Option<ExecutionSnapshot>, StoreError> {
        Ok(None)
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_wait_reports_a_lost_scheduler() {
    let workflow = TestWorkflowBuilder::new("lost")
        .start()
        .end(&["start"])
        .build();

    let result = runtime(Arc::new(ScriptedExecutor::new()))
        .with_store(Arc::new(PanickingStore))
        .execute(&workflow, json!({}))
        .await;

    assert!(matches!(
        result,
        Err(RuntimeError::SchedulerLost {
            status: WorkflowStatus::Running,
            ..
        })
    ));
}

#[tokio::test]
async fn test_finished_run_is_served_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let workflow = TestWorkflowBuilder::new("evicted")
        .start()
        .end(&["start"])
        .build();
    let runtime = runtime(Arc::new(ScriptedExecutor::new())).with_store(store.clone());

    let snapshot = runtime.execute(&workflow, json!({})).await.unwrap();
    let run_id = snapshot.run_id.clone();

    // once evicted from memory, edits to the stored copy become visible
    let mut archived = snapshot.clone();
    archived.workflow_name = "archived".to_string();
    let mut served_from_store = false;
    for _ in 0..200 {
        store.save(&archived).await.unwrap();
        if runtime.get_state(&run_id).await.unwrap().workflow_name == "archived" {
            served_from_store = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(served_from_store);

    assert_eq!(runtime.list_runs().await.unwrap(), vec![run_id.clone()]);
    assert_eq!(
        runtime.wait(&run_id).await.unwrap().status,
        WorkflowStatus::Completed
    );
    assert!(matches!(
        runtime.stop(&run_id).await,
        Err(RuntimeError::RunFinished {
            status: WorkflowStatus::Completed,
            ..
        })
    ));
}
