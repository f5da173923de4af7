//! The assembled runtime: bus, pools, and orchestration components.
//!
//! Construction wires the manager and executor onto one shared bus;
//! `start` spawns the worker pools and `shutdown` drains them. All
//! collaborators are injected, so two runtimes in one process never
//! share state unless they are given the same collaborators.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use colloquy_core::config::RuntimeConfig;
use colloquy_core::error::Result;
use colloquy_core::events::EventEnvelope;
use colloquy_core::registry::{PersonalityRegistry, ProviderRegistry};
use colloquy_core::traits::{ContextStore, EventSink, Memory};
use colloquy_core::turn::Turn;

use crate::bus::EventBus;
use crate::executor::StepExecutor;
use crate::manager::{TurnManager, TurnRequest};
use crate::planner::PlanGenerator;
use crate::workers::WorkerPool;

/// A fully wired turn orchestrator.
pub struct Runtime {
    config: Arc<RuntimeConfig>,
    bus: Arc<EventBus>,
    manager: Arc<TurnManager>,
    executor: Arc<StepExecutor>,
    pools: Vec<WorkerPool>,
}

impl Runtime {
    pub fn new(
        config: RuntimeConfig,
        providers: Arc<ProviderRegistry>,
        personalities: Arc<PersonalityRegistry>,
        memory: Arc<dyn Memory>,
        context: Arc<dyn ContextStore>,
    ) -> Self {
        let config = Arc::new(config);
        let bus = Arc::new(EventBus::new(config.queue_capacity));
        let events: Arc<dyn EventSink> = bus.clone();

        let planner = Arc::new(PlanGenerator::new(
            config.clone(),
            providers.clone(),
            memory.clone(),
        ));
        let manager = Arc::new(TurnManager::new(
            config.clone(),
            personalities.clone(),
            planner,
            context,
            events.clone(),
        ));
        let executor = Arc::new(StepExecutor::new(
            config.clone(),
            providers,
            personalities,
            memory,
            events,
        ));

        Self {
            config,
            bus,
            manager,
            executor,
            pools: Vec::new(),
        }
    }

    /// Spawn the worker pools. Calling this twice is a no-op.
    pub fn start(&mut self) {
        if !self.pools.is_empty() {
            return;
        }
        let drain = self.config.drain_timeout;
        self.pools.push(WorkerPool::start(
            "turn-events",
            self.config.turn_event_workers,
            self.bus.turn_receiver(),
            self.manager.clone(),
            drain,
        ));
        self.pools.push(WorkerPool::start(
            "step-events",
            self.config.step_event_workers,
            self.bus.step_receiver(),
            self.executor.clone(),
            drain,
        ));
        self.pools.push(WorkerPool::start(
            "step-result-events",
            self.config.step_result_event_workers,
            self.bus.step_result_receiver(),
            self.manager.clone(),
            drain,
        ));
        info!("runtime started");
    }

    /// Drain and stop every worker pool.
    pub async fn shutdown(&mut self) {
        for pool in self.pools.drain(..) {
            pool.shutdown().await;
        }
        info!("runtime stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.pools.is_empty()
    }

    /// Start a turn directly, bypassing the turn-event queue.
    pub async fn start_turn(&self, request: TurnRequest) -> Result<Turn> {
        self.manager.start_turn(request).await
    }

    pub fn manager(&self) -> Arc<TurnManager> {
        self.manager.clone()
    }

    /// Sink for publishing events onto the bus from outside, e.g. turn
    /// requests arriving over a transport.
    pub fn event_sink(&self) -> Arc<dyn EventSink> {
        self.bus.clone()
    }

    /// Terminal turn events (completed/failed) for the embedding
    /// application to consume. Yields `Some` only on the first call.
    pub fn take_terminal_receiver(&self) -> Option<mpsc::Receiver<EventEnvelope>> {
        self.bus.take_terminal_receiver()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::events::{EventPayload, TurnEvent};
    use colloquy_core::memory::{InMemoryContextStore, InMemoryMemory, MockProvider, MockResponse};
    use colloquy_core::message::Message;
    use colloquy_core::personality::PersonalityConfig;
    use serde_json::json;
    use std::time::Duration;

    fn runtime_with(responses: Vec<MockResponse>) -> Runtime {
        let provider = Arc::new(
            MockProvider::new()
                .with_default_model("mock-model")
                .with_responses(responses),
        );
        let config = RuntimeConfig::new()
            .with_default_provider("mock")
            .with_default_personality("helper")
            .with_queue_capacity(32)
            .with_drain_timeout(Duration::from_secs(1));
        let providers = Arc::new(ProviderRegistry::new().register("mock", provider));
        let personalities = Arc::new(
            PersonalityRegistry::new()
                .with_default_personality("helper")
                .register_personality(
                    PersonalityConfig::new("helper", "Helper")
                        .with_system_prompt("You are helpful."),
                ),
        );
        Runtime::new(
            config,
            providers,
            personalities,
            Arc::new(InMemoryMemory::new()),
            Arc::new(InMemoryContextStore::new()),
        )
    }

    #[tokio::test]
    async fn start_is_idempotent_and_shutdown_stops_the_pools() {
        let mut runtime = runtime_with(vec![]);
        assert!(!runtime.is_running());
        runtime.start();
        assert!(runtime.is_running());
        runtime.start();
        runtime.shutdown().await;
        assert!(!runtime.is_running());
    }

    #[tokio::test]
    async fn a_turn_event_flows_through_to_a_terminal_event() {
        let plan = json!({
            "steps": [
                {"step_type": "generate_text", "instructions": "answer", "inputs": {"prompt": "hi"}}
            ]
        })
        .to_string();
        let mut runtime = runtime_with(vec![
            MockResponse::text(plan),
            MockResponse::text("hello back"),
        ]);
        let mut terminal = runtime.take_terminal_receiver().unwrap();
        runtime.start();

        runtime
            .event_sink()
            .publish(EventEnvelope::turn(
                "trace_e2e",
                None,
                TurnEvent::new(Message::user("hi")),
            ))
            .await
            .unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(5), terminal.recv())
            .await
            .expect("terminal event within deadline")
            .expect("terminal channel open");
        assert_eq!(envelope.event_type(), "turn_completed");
        match envelope.payload {
            EventPayload::TurnCompleted(event) => {
                let output = event.final_output.unwrap();
                assert_eq!(output["content"], "hello back");
            }
            other => panic!("unexpected payload: {}", other.event_type()),
        }

        runtime.shutdown().await;
    }
}
