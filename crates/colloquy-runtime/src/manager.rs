//! Turn lifecycle management.
//!
//! The manager owns every turn state transition: it starts turns, fans
//! their steps out onto the bus, folds step results back in, and decides
//! when a turn is done. Result aggregation is serialized through one
//! mutex so concurrent result workers cannot interleave read-modify-write
//! cycles on the same turn.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use colloquy_core::config::RuntimeConfig;
use colloquy_core::error::{CoreError, Result};
use colloquy_core::events::{
    EventEnvelope, EventPayload, StepEvent, StepResultEvent, TurnCompletedEvent, TurnFailedEvent,
};
use colloquy_core::message::Message;
use colloquy_core::plan::StepError;
use colloquy_core::registry::PersonalityRegistry;
use colloquy_core::traits::{ContextStore, EventSink};
use colloquy_core::turn::{Turn, TurnStatus};

use crate::planner::PlanGenerator;
use crate::workers::EnvelopeHandler;

/// Everything needed to start one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub user_message: Message,
    pub personality_id: Option<String>,
    pub session_id: Option<String>,
    pub metadata: Option<Value>,
    pub conversation_history: Vec<Message>,
    pub trace_id: Option<String>,
}

impl TurnRequest {
    pub fn new(user_message: Message) -> Self {
        Self {
            user_message,
            personality_id: None,
            session_id: None,
            metadata: None,
            conversation_history: Vec::new(),
            trace_id: None,
        }
    }

    pub fn with_personality(mut self, personality_id: impl Into<String>) -> Self {
        self.personality_id = Some(personality_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.conversation_history = history;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Drives turns from request to terminal state.
pub struct TurnManager {
    config: Arc<RuntimeConfig>,
    personalities: Arc<PersonalityRegistry>,
    planner: Arc<PlanGenerator>,
    context: Arc<dyn ContextStore>,
    events: Arc<dyn EventSink>,
    aggregation: Mutex<()>,
}

impl TurnManager {
    pub fn new(
        config: Arc<RuntimeConfig>,
        personalities: Arc<PersonalityRegistry>,
        planner: Arc<PlanGenerator>,
        context: Arc<dyn ContextStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            personalities,
            planner,
            context,
            events,
            aggregation: Mutex::new(()),
        }
    }

    /// Create a turn, plan it, and fan its steps out.
    ///
    /// Returns the turn in PROCESSING when steps were dispatched, or in
    /// FAILED when the plan came back empty. Configuration problems,
    /// provider failures during planning, and a failed initial save all
    /// abort with an error instead.
    pub async fn start_turn(&self, request: TurnRequest) -> Result<Turn> {
        let requested_id = request
            .personality_id
            .clone()
            .or_else(|| self.config.default_personality_id.clone())
            .ok_or_else(|| {
                CoreError::configuration("No personality requested and no default configured")
            })?;
        let personality = self
            .personalities
            .get_personality(&requested_id)
            .ok_or_else(|| {
                CoreError::configuration(format!("Personality '{requested_id}' not found"))
            })?
            .clone();

        let mut turn = Turn::new(request.user_message, personality.id.clone())
            .with_history(request.conversation_history);
        if let Some(trace_id) = request.trace_id {
            turn = turn.with_trace_id(trace_id);
        }
        if let Some(session_id) = request.session_id {
            turn = turn.with_session_id(session_id);
        }
        if let Some(metadata) = request.metadata {
            turn = turn.with_metadata(metadata);
        }
        turn.begin_planning();
        info!(
            turn_id = %turn.turn_id,
            personality_id = %personality.id,
            trace_id = %turn.trace_id,
            "turn started"
        );
        self.context.save_turn(&turn).await?;

        match self.planner.generate_plan(&turn, &personality).await {
            Ok(Some(plan)) if !plan.is_empty() => {
                turn.begin_processing(plan);
            }
            Ok(_) => {
                warn!(turn_id = %turn.turn_id, "empty plan generated, failing turn");
                turn.fail(StepError::new("plan_parse", "Empty plan generated"));
                self.context.save_turn(&turn).await?;
                return Ok(turn);
            }
            Err(planning_error) => {
                error!(
                    turn_id = %turn.turn_id,
                    error = %planning_error,
                    "plan generation failed"
                );
                turn.fail(StepError::new(
                    planning_error.kind(),
                    format!("Plan generation error: {planning_error}"),
                ));
                self.context.save_turn(&turn).await?;
                return Err(planning_error);
            }
        }

        if let Err(save_error) = self.context.save_turn(&turn).await {
            error!(
                turn_id = %turn.turn_id,
                error = %save_error,
                "failed to persist planned turn"
            );
            return Err(save_error);
        }

        // Fan out. A publish failure loses that step (the turn will stall
        // in PROCESSING); the remaining steps still go out.
        for step in turn.steps().to_vec() {
            let step_id = step.step_id.clone();
            let envelope = EventEnvelope::step(
                turn.trace_id.clone(),
                turn.session_id.clone(),
                StepEvent {
                    turn_id: turn.turn_id.clone(),
                    personality_id: personality.id.clone(),
                    step,
                },
            );
            if let Err(publish_error) = self.events.publish(envelope).await {
                error!(
                    turn_id = %turn.turn_id,
                    step_id = %step_id,
                    error = %publish_error,
                    "failed to publish step event"
                );
            }
        }
        Ok(turn)
    }

    /// Fold one step result into its turn and complete the turn when every
    /// step is terminal.
    pub async fn handle_step_result_event(&self, event: &StepResultEvent) -> Result<()> {
        let _serialized = self.aggregation.lock().await;

        let mut turn = match self.context.get_turn(&event.turn_id).await {
            Ok(Some(turn)) => turn,
            Ok(None) => {
                warn!(turn_id = %event.turn_id, "step result for unknown turn, discarding");
                return Ok(());
            }
            Err(load_error) => {
                error!(
                    turn_id = %event.turn_id,
                    error = %load_error,
                    "failed to load turn for step result, discarding"
                );
                return Ok(());
            }
        };

        let current_plan_id = match turn.plan.as_ref() {
            Some(plan) => plan.plan_id.clone(),
            None => {
                warn!(turn_id = %turn.turn_id, "step result for unplanned turn, discarding");
                return Ok(());
            }
        };
        if current_plan_id != event.plan_id {
            warn!(
                turn_id = %turn.turn_id,
                expected_plan = %current_plan_id,
                received_plan = %event.plan_id,
                "step result for a stale plan, discarding"
            );
            return Ok(());
        }

        match turn.step_mut(&event.result.step_id) {
            Some(step) => {
                if !step.attach_result(event.result.clone()) {
                    warn!(
                        turn_id = %turn.turn_id,
                        step_id = %event.result.step_id,
                        "step already has a terminal result, discarding"
                    );
                    return Ok(());
                }
            }
            None => {
                warn!(
                    turn_id = %turn.turn_id,
                    step_id = %event.result.step_id,
                    "step result for unknown step, discarding"
                );
                return Ok(());
            }
        }
        turn.touch();

        let (is_complete, any_failed, final_output, first_error) = match turn.plan.as_ref() {
            Some(plan) => (
                plan.is_complete(),
                plan.any_failed(),
                plan.final_output(),
                plan.first_error(),
            ),
            None => return Ok(()),
        };

        if !is_complete {
            debug!(
                turn_id = %turn.turn_id,
                step_id = %event.result.step_id,
                "step result recorded, turn still in flight"
            );
            if let Err(save_error) = self.context.save_turn(&turn).await {
                warn!(
                    turn_id = %turn.turn_id,
                    error = %save_error,
                    "failed to persist turn progress"
                );
            }
            return Ok(());
        }

        if any_failed {
            turn.fail(first_error.clone());
        } else {
            turn.succeed(final_output.clone());
        }
        info!(turn_id = %turn.turn_id, status = %turn.status, "turn completed");

        if let Err(save_error) = self.context.save_turn(&turn).await {
            // The terminal event still goes out so consumers learn the
            // outcome even while persistence lags.
            error!(
                turn_id = %turn.turn_id,
                error = %save_error,
                "failed to persist completed turn"
            );
        }

        let envelope = if turn.status == TurnStatus::Succeeded {
            EventEnvelope::turn_completed(
                turn.trace_id.clone(),
                turn.session_id.clone(),
                TurnCompletedEvent {
                    turn_id: turn.turn_id.clone(),
                    final_output,
                },
            )
        } else {
            EventEnvelope::turn_failed(
                turn.trace_id.clone(),
                turn.session_id.clone(),
                TurnFailedEvent {
                    turn_id: turn.turn_id.clone(),
                    error: Some(first_error),
                },
            )
        };
        if let Err(publish_error) = self.events.publish(envelope).await {
            error!(
                turn_id = %turn.turn_id,
                error = %publish_error,
                "failed to publish terminal turn event"
            );
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EnvelopeHandler for TurnManager {
    async fn handle(&self, envelope: EventEnvelope) -> Result<()> {
        match &envelope.payload {
            EventPayload::Turn(event) => {
                let request = TurnRequest {
                    user_message: event.user_message.clone(),
                    personality_id: event.personality_id.clone(),
                    session_id: event
                        .session_id
                        .clone()
                        .or_else(|| envelope.session_id.clone()),
                    metadata: event.metadata.clone(),
                    conversation_history: event.conversation_history.clone(),
                    trace_id: Some(envelope.trace_id.clone()),
                };
                self.start_turn(request).await.map(|_| ())
            }
            EventPayload::StepResult(event) => self.handle_step_result_event(event).await,
            other => {
                warn!(
                    event_type = %other.event_type(),
                    "turn manager received an unexpected event"
                );
                Ok(())
            }
        }
    }
}
