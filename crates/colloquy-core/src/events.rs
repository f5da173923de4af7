//! Event envelopes flowing through the bus.
//!
//! Every event shares one envelope carrying identity and tracing fields;
//! the payload enum is what the bus routes on and what workers match on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::message::Message;
use crate::plan::{Step, StepError, StepResult};

/// Envelope schema version stamped on every event.
pub const SPEC_VERSION: &str = "1.0.0";

// ============================================================================
// Payloads
// ============================================================================

/// Request to run a new turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnEvent {
    pub user_message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conversation_history: Vec<Message>,
}

impl TurnEvent {
    pub fn new(user_message: Message) -> Self {
        Self {
            user_message,
            personality_id: None,
            session_id: None,
            metadata: None,
            conversation_history: Vec::new(),
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
}

/// One step handed to the executor pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub turn_id: String,
    pub personality_id: String,
    pub step: Step,
}

/// Terminal report for one step, headed back to the turn manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResultEvent {
    pub turn_id: String,
    pub plan_id: String,
    pub result: StepResult,
}

/// A turn finished successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnCompletedEvent {
    pub turn_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<Value>,
}

/// A turn failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnFailedEvent {
    pub turn_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

/// Everything the bus can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    Turn(TurnEvent),
    Step(StepEvent),
    StepResult(StepResultEvent),
    TurnCompleted(TurnCompletedEvent),
    TurnFailed(TurnFailedEvent),
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::Turn(_) => "turn",
            EventPayload::Step(_) => "step",
            EventPayload::StepResult(_) => "step_result",
            EventPayload::TurnCompleted(_) => "turn_completed",
            EventPayload::TurnFailed(_) => "turn_failed",
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Common wrapper around every payload on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub spec_version: String,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl EventEnvelope {
    fn wrap(trace_id: impl Into<String>, session_id: Option<String>, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            spec_version: SPEC_VERSION.to_string(),
            trace_id: trace_id.into(),
            session_id,
            occurred_at: Utc::now(),
            payload,
        }
    }

    pub fn turn(trace_id: impl Into<String>, session_id: Option<String>, event: TurnEvent) -> Self {
        Self::wrap(trace_id, session_id, EventPayload::Turn(event))
    }

    pub fn step(trace_id: impl Into<String>, session_id: Option<String>, event: StepEvent) -> Self {
        Self::wrap(trace_id, session_id, EventPayload::Step(event))
    }

    pub fn step_result(
        trace_id: impl Into<String>,
        session_id: Option<String>,
        event: StepResultEvent,
    ) -> Self {
        Self::wrap(trace_id, session_id, EventPayload::StepResult(event))
    }

    pub fn turn_completed(
        trace_id: impl Into<String>,
        session_id: Option<String>,
        event: TurnCompletedEvent,
    ) -> Self {
        Self::wrap(trace_id, session_id, EventPayload::TurnCompleted(event))
    }

    pub fn turn_failed(
        trace_id: impl Into<String>,
        session_id: Option<String>,
        event: TurnFailedEvent,
    ) -> Self {
        Self::wrap(trace_id, session_id, EventPayload::TurnFailed(event))
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    /// The turn this payload concerns, when it names one.
    pub fn turn_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Turn(_) => None,
            EventPayload::Step(e) => Some(&e.turn_id),
            EventPayload::StepResult(e) => Some(&e.turn_id),
            EventPayload::TurnCompleted(e) => Some(&e.turn_id),
            EventPayload::TurnFailed(e) => Some(&e.turn_id),
        }
    }

    /// True for turn_completed and turn_failed events.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::TurnCompleted(_) | EventPayload::TurnFailed(_)
        )
    }
}
