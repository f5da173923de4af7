// Echo Turn - one conversational turn through the full runtime
//
// A scripted provider plans a single generate_text step and answers it;
// the runtime fans the step out to workers and aggregates the result.
// Run with: cargo run --example echo_turn

use std::sync::Arc;
use std::time::Duration;

use colloquy_core::config::RuntimeConfig;
use colloquy_core::events::{EventEnvelope, EventPayload, TurnEvent};
use colloquy_core::memory::{InMemoryContextStore, InMemoryMemory, MockProvider, MockResponse};
use colloquy_core::message::Message;
use colloquy_core::personality::PersonalityConfig;
use colloquy_core::registry::{PersonalityRegistry, ProviderRegistry};
use colloquy_core::traits::EventSink;
use colloquy_runtime::Runtime;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("=== Echo Turn: event-driven turn lifecycle ===\n");

    // Scripted provider: first call returns the plan, second call
    // answers the step.
    let plan = serde_json::json!({
        "steps": [
            {
                "step_type": "generate_text",
                "instructions": "Echo the user's message back politely",
                "inputs": {"prompt": "Echo this: hello runtime"}
            }
        ]
    })
    .to_string();
    let provider = Arc::new(
        MockProvider::new()
            .with_default_model("echo-model")
            .with_response(MockResponse::text(plan))
            .with_response(MockResponse::text_with_usage("hello runtime", 12, 3)),
    );

    let personality = PersonalityConfig::new("echo", "Echo")
        .with_system_prompt("You repeat what you are told, politely.");

    let config = RuntimeConfig::new()
        .with_default_provider("mock")
        .with_default_personality("echo")
        .with_workers(1, 2, 2);
    let providers = Arc::new(ProviderRegistry::new().register("mock", provider));
    let personalities = Arc::new(
        PersonalityRegistry::new()
            .with_default_personality("echo")
            .register_personality(personality),
    );

    let mut runtime = Runtime::new(
        config,
        providers,
        personalities,
        Arc::new(InMemoryMemory::new()),
        Arc::new(InMemoryContextStore::new()),
    );

    // Grab the terminal queue before starting; it can only be taken once.
    let mut terminal = runtime.take_terminal_receiver().unwrap();
    runtime.start();

    // Feed the turn in through the bus, the way a transport would.
    println!("User: Echo this: hello runtime");
    let sink = runtime.event_sink();
    sink.publish(EventEnvelope::turn(
        "example-trace",
        Some("example-session".to_string()),
        TurnEvent::new(Message::user("Echo this: hello runtime")),
    ))
    .await
    .unwrap();

    // The embedding application owns the terminal queue.
    let outcome = tokio::time::timeout(Duration::from_secs(5), terminal.recv())
        .await
        .expect("turn did not finish in time")
        .expect("terminal queue closed");

    match outcome.payload {
        EventPayload::TurnCompleted(event) => {
            let output = event.final_output.unwrap_or_default();
            println!("Assistant: {}", output["content"]);
            println!("\nturn {} completed", event.turn_id);
        }
        EventPayload::TurnFailed(event) => {
            println!("turn {} failed: {:?}", event.turn_id, event.error);
        }
        other => println!("unexpected terminal event: {}", other.event_type()),
    }

    println!("\nShutting down...");
    runtime.shutdown().await;
    println!("Done!");
}
