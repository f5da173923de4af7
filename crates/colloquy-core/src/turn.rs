//! The turn record and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::message::Message;
use crate::plan::{Plan, Step, StepError};

/// Lifecycle states of a turn.
///
/// A turn moves strictly forward: PENDING -> PLANNING -> PROCESSING and
/// then into exactly one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnStatus {
    Pending,
    Planning,
    Processing,
    Succeeded,
    Failed,
}

impl TurnStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnStatus::Succeeded | TurnStatus::Failed)
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnStatus::Pending => write!(f, "PENDING"),
            TurnStatus::Planning => write!(f, "PLANNING"),
            TurnStatus::Processing => write!(f, "PROCESSING"),
            TurnStatus::Succeeded => write!(f, "SUCCEEDED"),
            TurnStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// One user request and everything the orchestrator derives from it.
///
/// The turn owns its plan, the plan owns its steps, and each step owns at
/// most one result. There are no cross-references between turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: String,
    pub user_message: Message,
    pub personality_id: String,
    pub status: TurnStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    /// Final answer of a succeeded turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// What sank a failed turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conversation_history: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(user_message: Message, personality_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            turn_id: format!("turn_{}", Uuid::now_v7()),
            user_message,
            personality_id: personality_id.into(),
            status: TurnStatus::Pending,
            plan: None,
            output: None,
            error: None,
            conversation_history: Vec::new(),
            metadata: None,
            session_id: None,
            trace_id: Uuid::now_v7().to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
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

    // ------------------------------------------------------------------
    // Lifecycle transitions
    // ------------------------------------------------------------------

    pub fn begin_planning(&mut self) {
        self.status = TurnStatus::Planning;
        self.touch();
    }

    /// Attach the generated plan and move into PROCESSING.
    pub fn begin_processing(&mut self, plan: Plan) {
        self.plan = Some(plan);
        self.status = TurnStatus::Processing;
        self.touch();
    }

    pub fn succeed(&mut self, output: Option<Value>) {
        self.status = TurnStatus::Succeeded;
        self.output = output;
        self.touch();
    }

    pub fn fail(&mut self, error: StepError) {
        self.status = TurnStatus::Failed;
        self.error = Some(error);
        self.touch();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    // ------------------------------------------------------------------
    // Plan access
    // ------------------------------------------------------------------

    pub fn steps(&self) -> &[Step] {
        self.plan.as_ref().map(|p| p.steps.as_slice()).unwrap_or(&[])
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.plan.as_mut().and_then(|p| p.step_mut(step_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{StepKind, StepResult};

    #[test]
    fn new_turn_is_pending_with_derived_ids() {
        let turn = Turn::new(Message::user("hello"), "helper");
        assert_eq!(turn.status, TurnStatus::Pending);
        assert!(turn.turn_id.starts_with("turn_"));
        assert!(turn.plan.is_none());
        assert!(!turn.is_terminal());
    }

    #[test]
    fn lifecycle_walk() {
        let mut turn = Turn::new(Message::user("hello"), "helper");
        turn.begin_planning();
        assert_eq!(turn.status, TurnStatus::Planning);

        let plan = Plan::new(turn.turn_id.clone())
            .with_steps(vec![Step::new("plan_x", 0, StepKind::GenerateText)]);
        turn.begin_processing(plan);
        assert_eq!(turn.status, TurnStatus::Processing);
        assert_eq!(turn.steps().len(), 1);

        turn.succeed(Some(serde_json::json!({"content": "hi"})));
        assert!(turn.is_terminal());
        assert!(turn.error.is_none());
    }

    #[test]
    fn failed_turn_carries_error() {
        let mut turn = Turn::new(Message::user("hello"), "helper");
        turn.begin_planning();
        turn.fail(StepError::new("plan_parse", "Empty plan generated"));
        assert_eq!(turn.status, TurnStatus::Failed);
        assert_eq!(turn.error.as_ref().map(|e| e.kind.as_str()), Some("plan_parse"));
    }

    #[test]
    fn step_mut_finds_steps_through_the_plan() {
        let mut turn = Turn::new(Message::user("hello"), "helper");
        let plan_id = Plan::id_for_turn(&turn.turn_id);
        let step = Step::new(plan_id.clone(), 0, StepKind::ToolCall);
        let step_id = step.step_id.clone();
        turn.begin_processing(Plan::new(turn.turn_id.clone()).with_steps(vec![step]));

        let found = turn.step_mut(&step_id).unwrap();
        assert!(found.attach_result(StepResult::succeeded(step_id, None)));
        assert!(turn.step_mut("step_missing").is_none());
    }

    #[test]
    fn status_serializes_upper_case() {
        let json = serde_json::to_string(&TurnStatus::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");
    }
}
