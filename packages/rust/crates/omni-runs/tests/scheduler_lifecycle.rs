#![allow(missing_docs)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use omni_runs::{
    Completion, JobStore, MemoryJobStore, MessageRole, NewMessage, NewRun, NewToolContract, Run,
    RunError, RunResult, RunStatus, SchedulerConfig, StaleRunPolicy, ToolCall,
};
use serde_json::json;
use tokio::task::{JoinHandle, JoinSet};

use support::{FlakyStore, Harness, ScriptedBackend, config, harness, harness_with_store};

fn sentiment_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": { "label": { "enum": ["positive", "negative", "neutral"] } },
        "required": ["label"]
    })
}

#[tokio::test]
async fn invoke_on_draft_enqueues_and_resolves_with_success() {
    let h = harness(ScriptedBackend::echo(Duration::from_millis(5)), config(2)).await;
    let run = h.prompt_run("hello").await;
    assert_eq!(run.status, RunStatus::Draft);

    let finished = tokio::time::timeout(Duration::from_secs(2), h.scheduler.invoke(&run.id))
        .await
        .expect("invoke should not time out")
        .expect("run should succeed");
    assert_eq!(finished.status, RunStatus::Success);
    assert!(finished.start_time.is_some());
    assert!(finished.end_time >= finished.start_time);

    let transcript = h
        .scheduler
        .transcript(&run.id)
        .await
        .expect("transcript should load");
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[1].role, MessageRole::Assistant);
    assert_eq!(transcript[1].content, "echo: hello");
    assert_eq!(finished.response.as_deref(), Some(transcript[1].id.as_str()));
}

#[tokio::test]
async fn many_waiters_share_one_execution() {
    let h = harness(ScriptedBackend::echo(Duration::from_millis(30)), config(2)).await;
    let run = h.prompt_run("shared").await;

    let mut waiters = JoinSet::new();
    for _ in 0..3 {
        let scheduler = Arc::clone(&h.scheduler);
        let run_id = run.id.clone();
        waiters.spawn(async move { scheduler.invoke(&run_id).await });
    }
    let mut resolved = Vec::new();
    while let Some(result) = tokio::time::timeout(Duration::from_secs(2), waiters.join_next())
        .await
        .expect("waiters should resolve")
    {
        resolved.push(result.expect("waiter task should not panic").expect("run should succeed"));
    }
    assert_eq!(resolved.len(), 3);
    assert!(resolved.iter().all(|r| r == &resolved[0]));
    assert_eq!(h.stats.invocations(), 1);
}

#[tokio::test]
async fn terminal_runs_resolve_immediately_without_rerun() {
    let backend = ScriptedBackend::new(Duration::from_millis(5), |prompt, _| {
        if prompt == "bad" {
            return Err(anyhow!("provider rejected prompt"));
        }
        Ok(Completion::Text("ok".to_string()))
    });
    let h = harness(backend, config(2)).await;
    let good = h.prompt_run("good").await;
    let bad = h.prompt_run("bad").await;

    assert!(h.scheduler.invoke(&good.id).await.is_ok());
    assert!(h.scheduler.invoke(&bad.id).await.is_err());
    assert_eq!(h.stats.invocations(), 2);

    let again = h.scheduler.invoke(&good.id).await.expect("success stays success");
    assert_eq!(again.status, RunStatus::Success);
    match h.scheduler.invoke(&bad.id).await {
        Err(RunError::Execution { run_id, error }) => {
            assert_eq!(run_id, bad.id);
            assert!(error.contains("provider rejected prompt"), "{error}");
        }
        other => panic!("expected execution error, got {other:?}"),
    }
    assert_eq!(h.stats.invocations(), 2);
}

#[tokio::test]
async fn backend_failure_is_isolated_to_its_run() {
    let backend = ScriptedBackend::new(Duration::from_millis(10), |prompt, _| {
        if prompt.starts_with("fail") {
            return Err(anyhow!("HTTP 503 from provider"));
        }
        Ok(Completion::Text(prompt.to_uppercase()))
    });
    let h = harness(backend, config(2)).await;
    let runs = [
        h.prompt_run("one").await,
        h.prompt_run("fail-two").await,
        h.prompt_run("three").await,
    ];

    let mut waiters = JoinSet::new();
    for run in &runs {
        let scheduler = Arc::clone(&h.scheduler);
        let run_id = run.id.clone();
        waiters.spawn(async move { scheduler.invoke(&run_id).await });
    }
    while tokio::time::timeout(Duration::from_secs(2), waiters.join_next())
        .await
        .expect("waiters should resolve")
        .is_some()
    {}

    assert_eq!(h.status(&runs[0].id).await, RunStatus::Success);
    assert_eq!(h.status(&runs[2].id).await, RunStatus::Success);
    let failed = h.scheduler.get_run(&runs[1].id).await.expect("run exists");
    assert_eq!(failed.status, RunStatus::Error);
    assert!(failed.response.is_none());
    assert!(
        failed
            .error
            .as_deref()
            .is_some_and(|error| error.contains("HTTP 503")),
        "{failed:?}"
    );
    assert_eq!(h.scheduler.active_slots(), 0);
}

#[tokio::test]
async fn tooled_run_records_matching_call() {
    let backend = ScriptedBackend::new(Duration::from_millis(5), |_, request| {
        let contract = request.contract.ok_or_else(|| anyhow!("contract expected"))?;
        Ok(Completion::ToolCalls(vec![ToolCall {
            id: "call_1".to_string(),
            name: contract.name.clone(),
            arguments: json!({ "label": "positive" }),
        }]))
    });
    let h = harness(backend, config(1)).await;
    let tool = h
        .scheduler
        .create_tool(NewToolContract::new("sentiment", sentiment_schema()))
        .await
        .expect("tool should be created");
    let run = h
        .prompt_run_with(
            NewRun::new("classify", &h.model.id).with_tool(&tool.id),
            "I love it",
        )
        .await;

    let finished = h.scheduler.invoke(&run.id).await.expect("run should succeed");
    let response = h
        .scheduler
        .response_message(&finished)
        .await
        .expect("lookup should succeed")
        .expect("response should exist");
    assert_eq!(response.role, MessageRole::Assistant);
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].name, "sentiment");
    assert_eq!(response.tool_calls[0].arguments, json!({ "label": "positive" }));
}

#[tokio::test]
async fn tooled_run_rejects_nonconforming_output() {
    let backend = ScriptedBackend::new(Duration::from_millis(5), |prompt, request| {
        let name = request
            .contract
            .map(|contract| contract.name.clone())
            .unwrap_or_default();
        match prompt {
            "text" => Ok(Completion::Text("positive".to_string())),
            "none" => Ok(Completion::ToolCalls(Vec::new())),
            _ => Ok(Completion::ToolCalls(vec![ToolCall {
                id: "call_1".to_string(),
                name,
                arguments: json!({ "label": "ecstatic" }),
            }])),
        }
    });
    let h = harness(backend, config(3)).await;
    let tool = h
        .scheduler
        .create_tool(NewToolContract::new("sentiment", sentiment_schema()))
        .await
        .expect("tool should be created");

    for prompt in ["text", "none", "invalid"] {
        let run = h
            .prompt_run_with(NewRun::new(prompt, &h.model.id).with_tool(&tool.id), prompt)
            .await;
        match h.scheduler.invoke(&run.id).await {
            Err(RunError::Execution { error, .. }) => {
                assert!(error.starts_with("contract violation"), "{prompt}: {error}");
            }
            other => panic!("{prompt}: expected contract violation, got {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn slow_backend_times_out_and_frees_slot() {
    let h = harness(
        ScriptedBackend::echo(Duration::from_secs(30)),
        SchedulerConfig {
            run_timeout_secs: 1,
            ..config(1)
        },
    )
    .await;
    let slow = h.prompt_run("slow").await;

    match h.scheduler.invoke(&slow.id).await {
        Err(RunError::Execution { error, .. }) => assert_eq!(error, "timed out after 1s"),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(h.scheduler.active_slots(), 0);
    assert_eq!(h.stats.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_running_run_drops_execution() {
    let h = harness(ScriptedBackend::echo(Duration::from_secs(60)), config(1)).await;
    let run = h.prompt_run("long").await;
    let queued = h.prompt_run("next").await;

    h.scheduler.enqueue(&run.id).await.expect("enqueue long");
    h.scheduler.enqueue(&queued.id).await.expect("enqueue next");
    let waiter = {
        let scheduler = Arc::clone(&h.scheduler);
        let run_id = run.id.clone();
        tokio::spawn(async move { scheduler.invoke(&run_id).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.status(&run.id).await, RunStatus::Running);
    assert_eq!(h.status(&queued.id).await, RunStatus::Pending);

    let cancelled = h.scheduler.cancel(&run.id).await.expect("cancel should succeed");
    assert_eq!(cancelled.status, RunStatus::Error);
    assert_eq!(cancelled.error.as_deref(), Some("cancelled"));

    match waiter.await.expect("waiter task should not panic") {
        Err(RunError::Execution { error, .. }) => assert_eq!(error, "cancelled"),
        other => panic!("expected cancelled execution, got {other:?}"),
    }
    // The freed slot goes to the next pending run.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.status(&queued.id).await, RunStatus::Running);
    assert_eq!(h.stats.in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_pending_run_prevents_admission() {
    let h = harness(ScriptedBackend::echo(Duration::from_millis(100)), config(1)).await;
    let first = h.prompt_run("first").await;
    let second = h.prompt_run("second").await;
    h.scheduler.enqueue(&first.id).await.expect("enqueue first");
    h.scheduler.enqueue(&second.id).await.expect("enqueue second");

    let cancelled = h.scheduler.cancel(&second.id).await.expect("cancel pending");
    assert_eq!(cancelled.status, RunStatus::Error);
    assert!(cancelled.has_consistent_outcome());

    assert!(h.scheduler.invoke(&first.id).await.is_ok());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.stats.started(), vec!["first"]);

    let err = h.scheduler.cancel(&first.id).await.expect_err("terminal cancel");
    assert!(matches!(err, RunError::InvalidState { .. }), "{err:?}");
}

#[tokio::test]
async fn requeue_starts_a_fresh_cycle() {
    let h = harness(ScriptedBackend::echo(Duration::from_millis(5)), config(1)).await;
    let run = h.prompt_run("again").await;
    let first = h.scheduler.invoke(&run.id).await.expect("first cycle");
    let first_response = first.response.clone();

    h.scheduler
        .append_message(&run.id, NewMessage::user("again"))
        .await
        .expect("append after terminal should succeed");
    let requeued = h.scheduler.enqueue(&run.id).await.expect("requeue");
    assert_ne!(requeued.status, RunStatus::Success);
    assert!(requeued.error.is_none());

    let second = h.scheduler.invoke(&run.id).await.expect("second cycle");
    assert_eq!(second.status, RunStatus::Success);
    assert_ne!(second.response, first_response);
    assert_eq!(h.stats.invocations(), 2);
    let transcript = h.scheduler.transcript(&run.id).await.expect("transcript");
    assert_eq!(transcript.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn running_run_rejects_append_and_enqueue() {
    let h = harness(ScriptedBackend::echo(Duration::from_secs(5)), config(1)).await;
    let run = h.prompt_run("busy").await;
    h.scheduler.enqueue(&run.id).await.expect("enqueue");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.status(&run.id).await, RunStatus::Running);

    let append = h
        .scheduler
        .append_message(&run.id, NewMessage::user("late"))
        .await;
    assert!(matches!(append, Err(RunError::InvalidState { .. })), "{append:?}");
    let enqueue = h.scheduler.enqueue(&run.id).await;
    assert!(matches!(enqueue, Err(RunError::InvalidState { .. })), "{enqueue:?}");

    // Pending enqueue is a no-op.
    let other = h.prompt_run("other").await;
    h.scheduler.enqueue(&other.id).await.expect("enqueue other");
    let again = h.scheduler.enqueue(&other.id).await.expect("enqueue other again");
    assert_eq!(again.status, RunStatus::Pending);
}

#[tokio::test]
async fn request_errors_surface_synchronously() {
    let h = harness(ScriptedBackend::echo(Duration::from_millis(5)), config(1)).await;

    let missing = h.scheduler.invoke("missing").await;
    assert_eq!(missing, Err(RunError::RunNotFound("missing".to_string())));

    let no_model = h.scheduler.create_run(NewRun::new("x", "nope")).await;
    assert_eq!(no_model, Err(RunError::ModelNotFound("nope".to_string())));

    let no_tool = h
        .scheduler
        .create_run(NewRun::new("x", &h.model.id).with_tool("nope"))
        .await;
    assert_eq!(no_tool, Err(RunError::ToolNotFound("nope".to_string())));

    let run = h.prompt_run("shape").await;
    let bad_shape = h
        .scheduler
        .append_message(
            &run.id,
            NewMessage::user("hi").with_tool_calls(vec![ToolCall {
                id: "c".to_string(),
                name: "t".to_string(),
                arguments: json!({}),
            }]),
        )
        .await;
    assert!(matches!(bad_shape, Err(RunError::InvalidRequest(_))));

    let bad_schema = h
        .scheduler
        .create_tool(NewToolContract::new("broken", json!({ "type": 12 })))
        .await;
    assert!(matches!(bad_schema, Err(RunError::InvalidRequest(_))));
}

async fn seed_stale_run(store: &Arc<dyn JobStore>, model_id: &str) -> String {
    let mut run = store
        .create_run(NewRun::new("stale", model_id))
        .await
        .expect("seed run");
    store
        .append_message(&run.id, NewMessage::user("resume me"))
        .await
        .expect("seed prompt");
    run.status = RunStatus::Running;
    run.start_time = Some(Utc::now());
    store.save_run(&run).await.expect("seed running");
    run.id
}

#[tokio::test]
async fn startup_requeues_stale_running_runs() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let model = store
        .create_model(omni_runs::NewModel::new(omni_runs::Provider::OpenAi, "gpt-4o-mini"))
        .await
        .expect("seed model");
    let stale = seed_stale_run(&store, &model.id).await;

    let h = harness_with_store(
        ScriptedBackend::echo(Duration::from_millis(5)),
        config(1),
        Arc::clone(&store),
        true,
    )
    .await;

    let finished = tokio::time::timeout(Duration::from_secs(5), h.scheduler.invoke(&stale))
        .await
        .expect("recovered run should finish")
        .expect("recovered run should succeed");
    assert_eq!(finished.status, RunStatus::Success);
    assert_eq!(h.stats.started(), vec!["resume me"]);
}

#[tokio::test]
async fn startup_fails_stale_running_runs_under_fail_policy() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let model = store
        .create_model(omni_runs::NewModel::new(omni_runs::Provider::OpenAi, "gpt-4o-mini"))
        .await
        .expect("seed model");
    let stale = seed_stale_run(&store, &model.id).await;

    let h = harness_with_store(
        ScriptedBackend::echo(Duration::from_millis(5)),
        SchedulerConfig {
            stale_run_policy: StaleRunPolicy::Fail,
            ..config(1)
        },
        Arc::clone(&store),
        true,
    )
    .await;
    let run = h.scheduler.get_run(&stale).await.expect("run exists");
    assert_eq!(run.status, RunStatus::Error);
    assert!(run.error.as_deref().is_some_and(|e| e.starts_with("interrupted")));
    assert!(run.has_consistent_outcome());
    assert_eq!(h.stats.invocations(), 0);
}

fn spawn_invoke(h: &Harness, run_id: &str) -> JoinHandle<(RunResult<Run>, Option<Run>)> {
    let scheduler = Arc::clone(&h.scheduler);
    let store = Arc::clone(&h.store);
    let run_id = run_id.to_string();
    tokio::spawn(async move {
        let returned = scheduler.invoke(&run_id).await;
        let stored = store.get_run(&run_id).await.expect("load run");
        (returned, stored)
    })
}

#[tokio::test(start_paused = true)]
async fn invoke_joining_a_running_run_sees_the_persisted_outcome() {
    let h = harness(ScriptedBackend::echo(Duration::from_millis(100)), config(1)).await;
    let run = h.prompt_run("late joiner").await;

    let first = spawn_invoke(&h, &run.id);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.status(&run.id).await, RunStatus::Running);

    let second = spawn_invoke(&h, &run.id);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!second.is_finished(), "second caller must wait for the run");

    let (first_returned, first_stored) = first.await.expect("first caller should not panic");
    let (second_returned, second_stored) = second.await.expect("second caller should not panic");
    let first_returned = first_returned.expect("first caller should succeed");
    let second_returned = second_returned.expect("second caller should succeed");

    assert_eq!(first_returned.status, RunStatus::Success);
    assert_eq!(first_returned, second_returned);
    assert_eq!(first_stored.as_ref(), Some(&first_returned));
    assert_eq!(second_stored.as_ref(), Some(&first_returned));
    assert_eq!(h.stats.invocations(), 1);
}

#[tokio::test]
async fn unsaved_terminal_state_still_releases_callers_and_slot() {
    let flaky = Arc::new(FlakyStore::default());
    flaky.fail_terminal_saves(usize::MAX);
    let store: Arc<dyn JobStore> = flaky;
    let h = harness_with_store(
        ScriptedBackend::echo(Duration::from_millis(5)),
        config(1),
        store,
        false,
    )
    .await;
    let run = h.prompt_run("unsaved").await;

    let outcome = tokio::time::timeout(Duration::from_secs(2), h.scheduler.invoke(&run.id))
        .await
        .expect("caller must be released when the store rejects the outcome");
    match outcome {
        Err(RunError::Execution { run_id, error }) => {
            assert_eq!(run_id, run.id);
            assert!(error.starts_with("store error"), "{error}");
        }
        other => panic!("expected execution error, got {other:?}"),
    }
    assert_eq!(h.scheduler.active_slots(), 0);
    assert_eq!(h.stats.invocations(), 1);

    let metrics = h.scheduler.metrics().await.expect("metrics");
    assert_eq!(metrics.waiting_callers, 0);
}

#[tokio::test]
async fn failed_success_save_is_recorded_as_store_error() {
    let flaky = Arc::new(FlakyStore::default());
    flaky.fail_terminal_saves(1);
    let store: Arc<dyn JobStore> = flaky;
    let h = harness_with_store(
        ScriptedBackend::echo(Duration::from_millis(5)),
        config(1),
        store,
        false,
    )
    .await;
    let run = h.prompt_run("retried").await;

    match h.scheduler.invoke(&run.id).await {
        Err(RunError::Execution { error, .. }) => {
            assert!(error.contains("connection reset"), "{error}");
        }
        other => panic!("expected execution error, got {other:?}"),
    }

    let stored = h
        .store
        .get_run(&run.id)
        .await
        .expect("load run")
        .expect("run exists");
    assert_eq!(stored.status, RunStatus::Error);
    assert!(stored.response.is_none());
    assert!(stored.lease_expires_at.is_none());
    assert!(
        stored.error.as_deref().is_some_and(|error| error.starts_with("store error")),
        "{stored:?}"
    );
    assert!(stored.has_consistent_outcome());
}

#[tokio::test]
async fn failed_enqueue_releases_the_registered_caller() {
    let flaky = Arc::new(FlakyStore::default());
    flaky.fail_pending_saves(1);
    let store: Arc<dyn JobStore> = flaky;
    let h = harness_with_store(
        ScriptedBackend::echo(Duration::from_millis(5)),
        config(1),
        store,
        false,
    )
    .await;
    let run = h.prompt_run("unqueued").await;

    let outcome = h.scheduler.invoke(&run.id).await;
    assert!(matches!(outcome, Err(RunError::Store(_))), "{outcome:?}");
    assert_eq!(h.status(&run.id).await, RunStatus::Draft);
    let metrics = h.scheduler.metrics().await.expect("metrics");
    assert_eq!(metrics.waiting_callers, 0);

    let retried = h.scheduler.invoke(&run.id).await.expect("retry should succeed");
    assert_eq!(retried.status, RunStatus::Success);
}
