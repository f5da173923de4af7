//! Plans, steps, and step results.
//!
//! A plan is an ordered list of steps produced by the planner. Steps are
//! executed independently and report back through step result events; the
//! completion laws that decide a turn's fate live here so they can be
//! tested without any runtime plumbing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Step kinds
// ============================================================================

/// What a step asks the executor to do.
///
/// Unknown tags are preserved rather than rejected: a plan containing an
/// unrecognized step type still parses, and the step fails at execution
/// time without taking its siblings down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepKind {
    GenerateText,
    GenerateEmbedding,
    ToolCall,
    MemoryOp,
    Unknown(String),
}

impl StepKind {
    pub fn as_str(&self) -> &str {
        match self {
            StepKind::GenerateText => "generate_text",
            StepKind::GenerateEmbedding => "generate_embedding",
            StepKind::ToolCall => "tool_call",
            StepKind::MemoryOp => "memory_op",
            StepKind::Unknown(tag) => tag,
        }
    }
}

impl From<String> for StepKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "generate_text" => StepKind::GenerateText,
            "generate_embedding" => StepKind::GenerateEmbedding,
            "tool_call" => StepKind::ToolCall,
            "memory_op" => StepKind::MemoryOp,
            _ => StepKind::Unknown(s),
        }
    }
}

impl From<StepKind> for String {
    fn from(kind: StepKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Step results
// ============================================================================

/// Outcome of a single step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Retrying,
    Cancelled,
}

impl StepStatus {
    /// Only terminal results may be attached to a step.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Failed)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Succeeded => write!(f, "SUCCEEDED"),
            StepStatus::Failed => write!(f, "FAILED"),
            StepStatus::Retrying => write!(f, "RETRYING"),
            StepStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Structured error carried by a failed step (and by a failed turn).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: String,
    pub detail: String,
}

impl StepError {
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: detail.into(),
        }
    }
}

/// Execution measurements reported alongside a step result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl StepMetrics {
    pub fn with_latency(latency_ms: f64) -> Self {
        Self {
            latency_ms: Some(latency_ms),
            ..Default::default()
        }
    }
}

/// Terminal report for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StepMetrics>,
}

impl StepResult {
    pub fn succeeded(step_id: impl Into<String>, output: Option<Value>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Succeeded,
            output,
            error: None,
            metrics: None,
        }
    }

    pub fn failed(step_id: impl Into<String>, error: StepError) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            output: None,
            error: Some(error),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: StepMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ============================================================================
// Steps
// ============================================================================

/// One unit of work inside a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub plan_id: String,
    pub step_index: usize,
    pub step_type: StepKind,
    /// Human-readable statement of what this step is for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Step-kind specific arguments (tool name and args, memory operation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    /// Provider and model overrides for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    /// Payload the step operates on (messages, prompt, texts to embed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
}

impl Step {
    pub fn new(plan_id: impl Into<String>, step_index: usize, step_type: StepKind) -> Self {
        let plan_id = plan_id.into();
        Self {
            step_id: format!("step_{plan_id}_{step_index}"),
            plan_id,
            step_index,
            step_type,
            instructions: None,
            parameters: None,
            config: None,
            inputs: None,
            result: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = Some(inputs);
        self
    }

    /// Whether this step already holds a terminal result.
    pub fn has_terminal_result(&self) -> bool {
        self.result.as_ref().is_some_and(StepResult::is_terminal)
    }

    /// Attach a terminal result exactly once.
    ///
    /// Returns false without modifying the step when a terminal result is
    /// already present; duplicate and late deliveries are dropped here.
    pub fn attach_result(&mut self, result: StepResult) -> bool {
        if self.has_terminal_result() {
            return false;
        }
        self.result = Some(result);
        true
    }
}

// ============================================================================
// Plans
// ============================================================================

/// Ordered list of steps for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub turn_id: String,
    pub steps: Vec<Step>,
}

impl Plan {
    /// Derive the canonical plan id for a turn.
    pub fn id_for_turn(turn_id: &str) -> String {
        format!("plan_{turn_id}")
    }

    pub fn new(turn_id: impl Into<String>) -> Self {
        let turn_id = turn_id.into();
        Self {
            plan_id: Self::id_for_turn(&turn_id),
            turn_id,
            steps: Vec::new(),
        }
    }

    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn push_step(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Every step holds a terminal result.
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(Step::has_terminal_result)
    }

    pub fn any_failed(&self) -> bool {
        self.steps.iter().any(|s| {
            s.result
                .as_ref()
                .is_some_and(|r| r.status == StepStatus::Failed)
        })
    }

    /// Output of the last succeeded step in plan order, regardless of
    /// the order results arrived in.
    pub fn final_output(&self) -> Option<Value> {
        self.steps
            .iter()
            .rev()
            .find_map(|s| match &s.result {
                Some(r) if r.status == StepStatus::Succeeded => Some(r.output.clone()),
                _ => None,
            })
            .flatten()
    }

    /// Error of the first failed step in plan order, with fallbacks for
    /// steps that failed without details.
    pub fn first_error(&self) -> StepError {
        for step in &self.steps {
            let failed = step
                .result
                .as_ref()
                .is_some_and(|r| r.status == StepStatus::Failed);
            if failed {
                if let Some(error) = step.result.as_ref().and_then(|r| r.error.clone()) {
                    return error;
                }
                return StepError::new(
                    "UnknownStepError",
                    format!("Step {} failed without details.", step.step_id),
                );
            }
        }
        StepError::new(
            "UnknownTurnError",
            "Turn failed, but no specific step error found.",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan_with_results(results: Vec<Option<StepResult>>) -> Plan {
        let mut plan = Plan::new("turn_1");
        for (i, result) in results.into_iter().enumerate() {
            let mut step = Step::new(plan.plan_id.clone(), i, StepKind::GenerateText);
            step.result = result;
            plan.push_step(step);
        }
        plan
    }

    #[test]
    fn step_kind_roundtrips_and_preserves_unknown_tags() {
        let kind: StepKind = serde_json::from_str("\"tool_call\"").unwrap();
        assert_eq!(kind, StepKind::ToolCall);

        let unknown: StepKind = serde_json::from_str("\"teleport\"").unwrap();
        assert_eq!(unknown, StepKind::Unknown("teleport".to_string()));
        assert_eq!(serde_json::to_string(&unknown).unwrap(), "\"teleport\"");
    }

    #[test]
    fn step_ids_are_derived_from_plan_id() {
        let step = Step::new("plan_turn_9", 2, StepKind::MemoryOp);
        assert_eq!(step.step_id, "step_plan_turn_9_2");
        assert_eq!(step.plan_id, "plan_turn_9");
    }

    #[test]
    fn attach_result_is_idempotent() {
        let mut step = Step::new("plan_t", 0, StepKind::GenerateText);
        let first = StepResult::succeeded(step.step_id.clone(), Some(json!({"a": 1})));
        let second = StepResult::failed(
            step.step_id.clone(),
            StepError::new("provider_call", "late failure"),
        );

        assert!(step.attach_result(first.clone()));
        assert!(!step.attach_result(second));
        assert_eq!(step.result, Some(first));
    }

    #[test]
    fn retrying_result_does_not_block_a_later_terminal_one() {
        let mut step = Step::new("plan_t", 0, StepKind::GenerateText);
        let transient = StepResult {
            step_id: step.step_id.clone(),
            status: StepStatus::Retrying,
            output: None,
            error: None,
            metrics: None,
        };
        assert!(step.attach_result(transient));
        assert!(!step.has_terminal_result());

        let terminal = StepResult::succeeded(step.step_id.clone(), None);
        assert!(step.attach_result(terminal));
        assert!(step.has_terminal_result());
    }

    #[test]
    fn completion_requires_every_step_terminal() {
        let plan = plan_with_results(vec![
            Some(StepResult::succeeded("s0", None)),
            None,
        ]);
        assert!(!plan.is_complete());

        let plan = plan_with_results(vec![
            Some(StepResult::succeeded("s0", None)),
            Some(StepResult::failed("s1", StepError::new("x", "y"))),
        ]);
        assert!(plan.is_complete());
        assert!(plan.any_failed());
    }

    #[test]
    fn final_output_is_last_succeeded_in_plan_order() {
        let plan = plan_with_results(vec![
            Some(StepResult::succeeded("s0", Some(json!("first")))),
            Some(StepResult::succeeded("s1", Some(json!("second")))),
            Some(StepResult::succeeded("s2", None)),
        ]);
        // Last succeeded step produced no output; earlier outputs do not
        // leak through.
        assert_eq!(plan.final_output(), None);

        let plan = plan_with_results(vec![
            Some(StepResult::succeeded("s0", Some(json!("first")))),
            Some(StepResult::succeeded("s1", Some(json!("second")))),
        ]);
        assert_eq!(plan.final_output(), Some(json!("second")));
    }

    #[test]
    fn first_error_prefers_earliest_failed_step() {
        let plan = plan_with_results(vec![
            Some(StepResult::failed("s0", StepError::new("tool_not_found", "no such tool"))),
            Some(StepResult::failed("s1", StepError::new("provider_call", "timeout"))),
        ]);
        assert_eq!(plan.first_error().kind, "tool_not_found");
    }

    #[test]
    fn first_error_falls_back_when_details_are_missing() {
        let mut plan = plan_with_results(vec![None]);
        plan.steps[0].result = Some(StepResult {
            step_id: plan.steps[0].step_id.clone(),
            status: StepStatus::Failed,
            output: None,
            error: None,
            metrics: None,
        });
        let error = plan.first_error();
        assert_eq!(error.kind, "UnknownStepError");
        assert!(error.detail.contains(&plan.steps[0].step_id));

        let empty = plan_with_results(vec![Some(StepResult::succeeded("s0", None))]);
        assert_eq!(empty.first_error().kind, "UnknownTurnError");
    }
}
