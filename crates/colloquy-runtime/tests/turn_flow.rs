//! End-to-end turn flows through the assembled runtime.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use colloquy_core::config::RuntimeConfig;
use colloquy_core::events::{EventEnvelope, EventPayload, StepResultEvent};
use colloquy_core::memory::{
    FailingSink, InMemoryContextStore, InMemoryMemory, MockProvider, MockResponse,
    MockToolHandler, RecordingSink,
};
use colloquy_core::message::{Message, Role};
use colloquy_core::personality::{PersonalityConfig, ToolSpec};
use colloquy_core::plan::{StepError, StepResult, StepStatus};
use colloquy_core::registry::{PersonalityRegistry, ProviderRegistry};
use colloquy_core::traits::{ContextStore, EventSink, Memory};
use colloquy_core::turn::{Turn, TurnStatus};
use colloquy_runtime::{EventBus, PlanGenerator, Runtime, TurnManager, TurnRequest, WorkerPool};

struct TestBed {
    runtime: Runtime,
    provider: Arc<MockProvider>,
    memory: Arc<InMemoryMemory>,
    context: Arc<InMemoryContextStore>,
    tool: Arc<MockToolHandler>,
}

fn personality() -> PersonalityConfig {
    PersonalityConfig::new("helper", "Helper")
        .with_system_prompt("You are a careful assistant.")
        .with_tool(ToolSpec::new("search_memory", "Search stored documents"))
        .with_tool(ToolSpec::new("lookup", "External lookup"))
}

fn test_bed(responses: Vec<MockResponse>, workers: (usize, usize, usize)) -> TestBed {
    let provider = Arc::new(
        MockProvider::new()
            .with_default_model("mock-model")
            .with_responses(responses),
    );
    let memory = Arc::new(InMemoryMemory::new());
    let context = Arc::new(InMemoryContextStore::new());
    let tool = Arc::new(MockToolHandler::new(json!({"handler": "ran"})));

    let config = RuntimeConfig::new()
        .with_default_provider("mock")
        .with_default_personality("helper")
        .with_queue_capacity(64)
        .with_workers(workers.0, workers.1, workers.2)
        .with_drain_timeout(Duration::from_secs(1));
    let providers = Arc::new(ProviderRegistry::new().register("mock", provider.clone()));
    let personalities = Arc::new(
        PersonalityRegistry::new()
            .with_default_personality("helper")
            .register_personality(personality())
            .register_tool("search_memory", tool.clone())
            .register_tool("lookup", tool.clone()),
    );

    let runtime = Runtime::new(
        config,
        providers,
        personalities,
        memory.clone(),
        context.clone(),
    );
    TestBed {
        runtime,
        provider,
        memory,
        context,
        tool,
    }
}

async fn wait_for_status(
    context: &InMemoryContextStore,
    turn_id: &str,
    status: TurnStatus,
) -> Turn {
    for _ in 0..300 {
        if let Ok(Some(turn)) = context.get_turn(turn_id).await {
            if turn.status == status {
                return turn;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("turn {turn_id} never reached {status}");
}

fn result_envelope(turn: &Turn, step_index: usize, result: StepResult) -> EventEnvelope {
    let plan = turn.plan.as_ref().expect("turn has a plan");
    EventEnvelope::step_result(
        turn.trace_id.clone(),
        None,
        StepResultEvent {
            turn_id: turn.turn_id.clone(),
            plan_id: plan.plan_id.clone(),
            result: StepResult {
                step_id: plan.steps[step_index].step_id.clone(),
                ..result
            },
        },
    )
}

// ----------------------------------------------------------------------
// Happy path
// ----------------------------------------------------------------------

#[tokio::test]
async fn two_step_turn_succeeds_with_the_last_output() {
    let plan = json!({
        "steps": [
            {"step_type": "generate_text", "instructions": "draft", "inputs": {"prompt": "draft it"}},
            {"step_type": "generate_text", "instructions": "polish", "inputs": {"prompt": "polish it"}}
        ]
    })
    .to_string();
    // Single step worker keeps the scripted responses aligned with the
    // plan order.
    let mut bed = test_bed(
        vec![
            MockResponse::text(plan),
            MockResponse::text("rough draft"),
            MockResponse::text_with_usage("polished answer", 9, 4),
        ],
        (1, 1, 1),
    );
    let mut terminal = bed.runtime.take_terminal_receiver().unwrap();
    bed.runtime.start();

    let turn = bed
        .runtime
        .start_turn(TurnRequest::new(Message::user("write me a poem")).with_session("session_9"))
        .await
        .unwrap();
    assert_eq!(turn.status, TurnStatus::Processing);

    let done = wait_for_status(&bed.context, &turn.turn_id, TurnStatus::Succeeded).await;
    assert_eq!(done.output.as_ref().unwrap()["content"], "polished answer");
    assert!(done.error.is_none());

    let steps = done.steps();
    assert_eq!(
        steps[0].result.as_ref().unwrap().output.as_ref().unwrap()["content"],
        "rough draft"
    );
    let second = steps[1].result.as_ref().unwrap();
    assert_eq!(second.status, StepStatus::Succeeded);
    let metrics = second.metrics.as_ref().unwrap();
    assert_eq!(metrics.prompt_tokens, Some(9));
    assert_eq!(metrics.completion_tokens, Some(4));
    assert!(metrics.latency_ms.is_some());

    // Terminal event carries the turn's trace and the final output.
    let envelope = tokio::time::timeout(Duration::from_secs(2), terminal.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.event_type(), "turn_completed");
    assert_eq!(envelope.trace_id, done.trace_id);
    match envelope.payload {
        EventPayload::TurnCompleted(event) => {
            assert_eq!(event.turn_id, done.turn_id);
            assert_eq!(event.final_output.unwrap()["content"], "polished answer");
        }
        other => panic!("unexpected payload: {}", other.event_type()),
    }

    // Step generation calls carried the personality's system prompt.
    let calls = bed.provider.generate_calls().await;
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[1].messages[0].role, Role::System);

    bed.runtime.shutdown().await;
}

// ----------------------------------------------------------------------
// Planning failures
// ----------------------------------------------------------------------

#[tokio::test]
async fn malformed_plan_fails_the_turn_without_dispatch_or_terminal_event() {
    let bed = test_bed(
        vec![MockResponse::text("Sure! Here is what I would do: ...")],
        (1, 1, 1),
    );
    let mut terminal = bed.runtime.take_terminal_receiver().unwrap();

    let turn = bed
        .runtime
        .start_turn(TurnRequest::new(Message::user("hi")))
        .await
        .unwrap();
    assert_eq!(turn.status, TurnStatus::Failed);
    let error = turn.error.as_ref().unwrap();
    assert_eq!(error.detail, "Empty plan generated");

    let stored = bed.context.get_turn(&turn.turn_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TurnStatus::Failed);
    assert!(stored.plan.is_none());

    // Only the planning call reached the provider, and nothing was
    // published for this turn.
    assert_eq!(bed.provider.call_count().await, 1);
    assert!(terminal.try_recv().is_err());
}

#[tokio::test]
async fn planning_provider_error_surfaces_to_the_caller() {
    let bed = test_bed(
        vec![MockResponse::RateLimited("slow down".to_string())],
        (1, 1, 1),
    );
    let err = bed
        .runtime
        .start_turn(TurnRequest::new(Message::user("hi")))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("slow down"));
}

// ----------------------------------------------------------------------
// Tool steps
// ----------------------------------------------------------------------

#[tokio::test]
async fn builtin_search_memory_step_returns_hits_and_skips_registered_handlers() {
    let plan = json!({
        "steps": [
            {
                "step_type": "tool_call",
                "instructions": "find prior notes",
                "parameters": {"tool_name": "search_memory", "args": {"query": "alpha", "top_k": 2}}
            }
        ]
    })
    .to_string();
    let mut bed = test_bed(vec![MockResponse::text(plan)], (1, 2, 2));
    bed.memory
        .write("note_a", json!("alpha notes"), None, None)
        .await
        .unwrap();
    bed.memory
        .write("note_b", json!("alpha and beta"), None, None)
        .await
        .unwrap();
    bed.memory
        .write("note_c", json!("unrelated"), None, None)
        .await
        .unwrap();
    bed.runtime.start();

    let turn = bed
        .runtime
        .start_turn(TurnRequest::new(Message::user("what do we know about alpha?")))
        .await
        .unwrap();
    let done = wait_for_status(&bed.context, &turn.turn_id, TurnStatus::Succeeded).await;

    let hits = done.output.as_ref().unwrap().as_array().unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0]["key"], "note_a");
    assert_eq!(hits[1]["key"], "note_b");

    // The built-in implementation answered; the handler registered under
    // the same name was never called.
    assert!(bed.tool.calls().await.is_empty());

    bed.runtime.shutdown().await;
}

#[tokio::test]
async fn failing_tool_step_fails_the_whole_turn() {
    let plan = json!({
        "steps": [
            {
                "step_type": "tool_call",
                "instructions": "call something that does not exist",
                "parameters": {"tool_name": "teleport", "args": {}}
            },
            {"step_type": "generate_text", "instructions": "never matters", "inputs": {"prompt": "x"}}
        ]
    })
    .to_string();
    let mut bed = test_bed(
        vec![MockResponse::text(plan), MockResponse::text("step two ran")],
        (1, 1, 1),
    );
    let mut terminal = bed.runtime.take_terminal_receiver().unwrap();
    bed.runtime.start();

    let turn = bed
        .runtime
        .start_turn(TurnRequest::new(Message::user("go")))
        .await
        .unwrap();
    let done = wait_for_status(&bed.context, &turn.turn_id, TurnStatus::Failed).await;

    // Both steps ran to a terminal result; the earliest failure decides
    // the turn error.
    assert!(done.plan.as_ref().unwrap().is_complete());
    let error = done.error.as_ref().unwrap();
    assert_eq!(error.kind, "tool_not_found");
    assert!(error.detail.contains("teleport"));

    let envelope = tokio::time::timeout(Duration::from_secs(2), terminal.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.event_type(), "turn_failed");

    bed.runtime.shutdown().await;
}

// ----------------------------------------------------------------------
// Memory persists across turns
// ----------------------------------------------------------------------

#[tokio::test]
async fn memory_written_in_one_turn_is_searchable_in_the_next() {
    let write_plan = json!({
        "steps": [
            {
                "step_type": "memory_op",
                "instructions": "remember the launch date",
                "parameters": {"operation": "write", "doc_id": "launch", "text": "colloquy launched in march"}
            }
        ]
    })
    .to_string();
    let search_plan = json!({
        "steps": [
            {
                "step_type": "tool_call",
                "instructions": "recall the launch",
                "parameters": {"tool_name": "search_memory", "args": {"query": "colloquy"}}
            }
        ]
    })
    .to_string();
    let mut bed = test_bed(
        vec![MockResponse::text(write_plan), MockResponse::text(search_plan)],
        (1, 2, 2),
    );
    bed.runtime.start();

    let first = bed
        .runtime
        .start_turn(TurnRequest::new(Message::user("remember the launch")))
        .await
        .unwrap();
    wait_for_status(&bed.context, &first.turn_id, TurnStatus::Succeeded).await;

    let second = bed
        .runtime
        .start_turn(TurnRequest::new(Message::user("when did colloquy launch?")))
        .await
        .unwrap();
    let done = wait_for_status(&bed.context, &second.turn_id, TurnStatus::Succeeded).await;

    let hits = done.output.as_ref().unwrap().as_array().unwrap();
    assert_eq!(hits[0]["key"], "launch");
    assert_eq!(hits[0]["text"], "colloquy launched in march");

    bed.runtime.shutdown().await;
}

// ----------------------------------------------------------------------
// Result delivery: duplicates and ordering through the bus
// ----------------------------------------------------------------------

struct ManualBed {
    bus: Arc<EventBus>,
    manager: Arc<TurnManager>,
    context: Arc<InMemoryContextStore>,
}

/// Manager wired to a real bus, with no step workers: steps pile up
/// unexecuted so tests deliver hand-crafted results instead.
fn manual_bed(responses: Vec<MockResponse>) -> ManualBed {
    let provider = Arc::new(
        MockProvider::new()
            .with_default_model("mock-model")
            .with_responses(responses),
    );
    let config = Arc::new(
        RuntimeConfig::new()
            .with_default_provider("mock")
            .with_default_personality("helper")
            .with_queue_capacity(64),
    );
    let providers = Arc::new(ProviderRegistry::new().register("mock", provider));
    let personalities = Arc::new(
        PersonalityRegistry::new()
            .with_default_personality("helper")
            .register_personality(personality()),
    );
    let bus = Arc::new(EventBus::new(64));
    let events: Arc<dyn EventSink> = bus.clone();
    let planner = Arc::new(PlanGenerator::new(
        config.clone(),
        providers,
        Arc::new(InMemoryMemory::new()),
    ));
    let context = Arc::new(InMemoryContextStore::new());
    let manager = Arc::new(TurnManager::new(
        config,
        personalities,
        planner,
        context.clone(),
        events,
    ));
    ManualBed {
        bus,
        manager,
        context,
    }
}

#[tokio::test]
async fn duplicate_and_reordered_results_resolve_to_one_completion() {
    let plan = json!({
        "steps": [
            {"step_type": "generate_text", "instructions": "one", "inputs": {"prompt": "a"}},
            {"step_type": "generate_text", "instructions": "two", "inputs": {"prompt": "b"}}
        ]
    })
    .to_string();
    let bed = manual_bed(vec![MockResponse::text(plan)]);
    let mut terminal = bed.bus.take_terminal_receiver().unwrap();

    // One result worker keeps delivery order deterministic.
    let pool = WorkerPool::start(
        "results",
        1,
        bed.bus.step_result_receiver(),
        bed.manager.clone(),
        Duration::from_secs(1),
    );

    let turn = bed
        .manager
        .start_turn(TurnRequest::new(Message::user("go")))
        .await
        .unwrap();

    // Second step's result lands first, then a conflicting duplicate for
    // it, then the first step's result.
    bed.bus
        .publish(result_envelope(
            &turn,
            1,
            StepResult::succeeded("", Some(json!("the real final"))),
        ))
        .await
        .unwrap();
    bed.bus
        .publish(result_envelope(
            &turn,
            1,
            StepResult::failed("", StepError::new("provider_call", "late retry")),
        ))
        .await
        .unwrap();
    bed.bus
        .publish(result_envelope(
            &turn,
            0,
            StepResult::succeeded("", Some(json!("intermediate"))),
        ))
        .await
        .unwrap();

    let done = wait_for_status(&bed.context, &turn.turn_id, TurnStatus::Succeeded).await;
    assert_eq!(done.output, Some(json!("the real final")));
    let step_one = &done.plan.as_ref().unwrap().steps[1];
    assert_eq!(
        step_one.result.as_ref().map(|r| r.status),
        Some(StepStatus::Succeeded)
    );

    // Exactly one terminal event despite the duplicate delivery.
    let envelope = tokio::time::timeout(Duration::from_secs(2), terminal.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.event_type(), "turn_completed");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(terminal.try_recv().is_err());

    pool.shutdown().await;
}

#[tokio::test]
async fn reversed_failure_order_still_reports_the_earliest_failed_step() {
    let plan = json!({
        "steps": [
            {"step_type": "generate_text", "instructions": "one", "inputs": {"prompt": "a"}},
            {"step_type": "generate_text", "instructions": "two", "inputs": {"prompt": "b"}}
        ]
    })
    .to_string();
    let bed = manual_bed(vec![MockResponse::text(plan)]);
    let mut terminal = bed.bus.take_terminal_receiver().unwrap();
    let pool = WorkerPool::start(
        "results",
        1,
        bed.bus.step_result_receiver(),
        bed.manager.clone(),
        Duration::from_secs(1),
    );

    let turn = bed
        .manager
        .start_turn(TurnRequest::new(Message::user("go")))
        .await
        .unwrap();

    bed.bus
        .publish(result_envelope(
            &turn,
            1,
            StepResult::succeeded("", Some(json!("fine"))),
        ))
        .await
        .unwrap();
    bed.bus
        .publish(result_envelope(
            &turn,
            0,
            StepResult::failed("", StepError::new("provider_auth", "rejected key")),
        ))
        .await
        .unwrap();

    let done = wait_for_status(&bed.context, &turn.turn_id, TurnStatus::Failed).await;
    assert_eq!(done.error.as_ref().map(|e| e.kind.as_str()), Some("provider_auth"));

    let envelope = tokio::time::timeout(Duration::from_secs(2), terminal.recv())
        .await
        .unwrap()
        .unwrap();
    match envelope.payload {
        EventPayload::TurnFailed(event) => {
            assert_eq!(event.error.unwrap().detail, "rejected key");
        }
        other => panic!("unexpected payload: {}", other.event_type()),
    }

    pool.shutdown().await;
}

// ----------------------------------------------------------------------
// Saturation
// ----------------------------------------------------------------------

#[tokio::test]
async fn dropped_step_event_stalls_the_turn_without_a_terminal_event() {
    let plan = json!({
        "steps": [
            {"step_type": "generate_text", "instructions": "one", "inputs": {"prompt": "a"}},
            {"step_type": "generate_text", "instructions": "two", "inputs": {"prompt": "b"}},
            {"step_type": "generate_text", "instructions": "three", "inputs": {"prompt": "c"}}
        ]
    })
    .to_string();
    let provider = Arc::new(
        MockProvider::new()
            .with_default_model("mock-model")
            .with_response(MockResponse::text(plan)),
    );
    let config = Arc::new(
        RuntimeConfig::new()
            .with_default_provider("mock")
            .with_default_personality("helper"),
    );
    let providers = Arc::new(ProviderRegistry::new().register("mock", provider));
    let personalities = Arc::new(
        PersonalityRegistry::new()
            .with_default_personality("helper")
            .register_personality(personality()),
    );
    let planner = Arc::new(PlanGenerator::new(
        config.clone(),
        providers,
        Arc::new(InMemoryMemory::new()),
    ));
    let context = Arc::new(InMemoryContextStore::new());
    let recorder = Arc::new(RecordingSink::new());
    // The middle step's publish is rejected as if its queue were full.
    let sink = Arc::new(FailingSink::rejecting_steps(
        recorder.clone(),
        vec!["_1".to_string()],
    ));
    let manager = TurnManager::new(config, personalities, planner, context.clone(), sink);

    let turn = manager
        .start_turn(TurnRequest::new(Message::user("go")))
        .await
        .unwrap();
    assert_eq!(turn.status, TurnStatus::Processing);

    // Steps 0 and 2 went out; step 1 was dropped.
    let dispatched = recorder.of_type("step").await;
    assert_eq!(dispatched.len(), 2);
    let dispatched_ids: Vec<String> = dispatched
        .iter()
        .map(|e| match &e.payload {
            EventPayload::Step(event) => event.step.step_id.clone(),
            other => panic!("unexpected payload: {}", other.event_type()),
        })
        .collect();
    assert!(dispatched_ids[0].ends_with("_0"));
    assert!(dispatched_ids[1].ends_with("_2"));

    // Results for the dispatched steps arrive; the turn can never
    // complete because step 1 will never report.
    for index in [0usize, 2] {
        let envelope = result_envelope(&turn, index, StepResult::succeeded("", None));
        if let EventPayload::StepResult(event) = &envelope.payload {
            manager.handle_step_result_event(event).await.unwrap();
        }
    }

    let stalled = context.get_turn(&turn.turn_id).await.unwrap().unwrap();
    assert_eq!(stalled.status, TurnStatus::Processing);
    assert!(recorder.of_type("turn_completed").await.is_empty());
    assert!(recorder.of_type("turn_failed").await.is_empty());
}
