//! Plan generation.
//!
//! The planner renders a prompt from a template, asks a provider for a
//! JSON plan, and parses it defensively. A response the model botched is
//! not an error: it comes back as `Ok(None)` and the caller fails the
//! turn gracefully. Configuration problems and provider failures are
//! real errors and propagate.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use colloquy_core::config::RuntimeConfig;
use colloquy_core::error::{CoreError, Result};
use colloquy_core::message::Message;
use colloquy_core::personality::PersonalityConfig;
use colloquy_core::plan::{Plan, Step, StepKind};
use colloquy_core::registry::ProviderRegistry;
use colloquy_core::traits::Memory;
use colloquy_core::turn::Turn;

/// Template used when a personality does not bring its own.
pub const DEFAULT_PLANNING_TEMPLATE: &str = "\
You are an expert planning agent. Break the user's request into an ordered \
list of discrete steps, using the conversation so far and the tools \
available to you.

Available tools:
{tool_list}

Conversation so far:
{history}

User request: {user_request}

Respond ONLY with a JSON object holding a \"steps\" array. Each step needs a \
\"step_type\" of generate_text, generate_embedding, tool_call or memory_op, \
an \"instructions\" string, and may carry \"parameters\", \"config\" and \
\"inputs\" objects. For tool_call steps put \"tool_name\" and \"args\" inside \
\"parameters\". Do not add prose around the JSON.";

const PLACEHOLDERS: [&str; 3] = ["tool_list", "history", "user_request"];

/// How many characters of each memory hit make it into the prompt.
const MEMORY_SNIPPET_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
struct RawPlan {
    steps: Vec<RawPlanStep>,
}

#[derive(Debug, Deserialize)]
struct RawPlanStep {
    step_type: StepKind,
    #[serde(default, alias = "description")]
    instructions: Option<String>,
    #[serde(default)]
    parameters: Option<Value>,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default)]
    inputs: Option<Value>,
}

/// Turns a user request into an executable plan.
pub struct PlanGenerator {
    config: Arc<RuntimeConfig>,
    providers: Arc<ProviderRegistry>,
    memory: Arc<dyn Memory>,
}

impl PlanGenerator {
    pub fn new(
        config: Arc<RuntimeConfig>,
        providers: Arc<ProviderRegistry>,
        memory: Arc<dyn Memory>,
    ) -> Self {
        Self {
            config,
            providers,
            memory,
        }
    }

    /// Generate a plan for the turn.
    ///
    /// `Ok(None)` means the model's answer could not be turned into a
    /// plan; `Err` means planning itself could not run.
    pub async fn generate_plan(
        &self,
        turn: &Turn,
        personality: &PersonalityConfig,
    ) -> Result<Option<Plan>> {
        let template = personality
            .planning
            .as_ref()
            .and_then(|p| p.template.as_deref())
            .unwrap_or(DEFAULT_PLANNING_TEMPLATE);
        if template.trim().is_empty() {
            return Err(CoreError::configuration("Planning prompt template is missing"));
        }

        let history = turn
            .conversation_history
            .iter()
            .chain(std::iter::once(&turn.user_message))
            .map(Message::prompt_line)
            .collect::<Vec<_>>()
            .join("\n");
        let mut prompt = render_template(
            template,
            &personality.tool_list(),
            &history,
            &turn.user_message.content,
        )?;

        // Memory context goes in front of the rendered template. Search
        // failures degrade to planning without it.
        match self
            .memory
            .search(
                &turn.user_message.content,
                self.config.memory_search_top_k,
                None,
            )
            .await
        {
            Ok(hits) if !hits.is_empty() => {
                let mut block = String::from("\nRelevant context from memory:\n");
                let lines: Vec<String> = hits
                    .iter()
                    .enumerate()
                    .map(|(i, hit)| {
                        let snippet: String =
                            hit.text.chars().take(MEMORY_SNIPPET_CHARS).collect();
                        format!("  {}. {snippet}...", i + 1)
                    })
                    .collect();
                block.push_str(&lines.join("\n"));
                prompt = format!("{block}\n\n{prompt}");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    turn_id = %turn.turn_id,
                    error = %err,
                    "memory search failed, planning without memory context"
                );
            }
        }

        let provider_id = personality
            .planning
            .as_ref()
            .and_then(|p| p.provider_id.as_deref())
            .unwrap_or(&self.config.default_provider_id);
        let provider = self.providers.get(provider_id).ok_or_else(|| {
            CoreError::configuration(format!(
                "Planning provider '{provider_id}' is not registered"
            ))
        })?;
        let model = personality
            .planning
            .as_ref()
            .and_then(|p| p.model.clone())
            .or_else(|| provider.default_model())
            .ok_or_else(|| {
                CoreError::configuration(format!(
                    "No planning model configured for provider '{provider_id}'"
                ))
            })?;

        let generation = provider
            .generate(vec![Message::user(prompt)], &model, false, None)
            .await?;

        let cleaned = strip_code_fences(&generation.message.content);
        let value: Value = match serde_json::from_str(cleaned) {
            Ok(value) => value,
            Err(err) => {
                warn!(turn_id = %turn.turn_id, error = %err, "plan response is not valid JSON");
                return Ok(None);
            }
        };
        let mut raw: RawPlan = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    turn_id = %turn.turn_id,
                    error = %err,
                    "plan response does not match the plan schema"
                );
                return Ok(None);
            }
        };

        if raw.steps.len() > self.config.max_steps_per_plan {
            warn!(
                turn_id = %turn.turn_id,
                steps = raw.steps.len(),
                max = self.config.max_steps_per_plan,
                "plan exceeds the step limit, truncating"
            );
            raw.steps.truncate(self.config.max_steps_per_plan);
        }

        let mut plan = Plan::new(turn.turn_id.clone());
        for (index, raw_step) in raw.steps.into_iter().enumerate() {
            let mut step = Step::new(plan.plan_id.clone(), index, raw_step.step_type);
            step.instructions = raw_step.instructions;
            step.parameters = raw_step.parameters;
            step.config = raw_step.config;
            step.inputs = raw_step.inputs;
            plan.push_step(step);
        }
        debug!(turn_id = %turn.turn_id, steps = plan.steps.len(), "plan generated");
        Ok(Some(plan))
    }
}

/// Substitute the known placeholders after rejecting unknown ones.
///
/// Only `{word}` sequences count as placeholders; braces inside rendered
/// values are never re-scanned.
fn render_template(
    template: &str,
    tool_list: &str,
    history: &str,
    user_request: &str,
) -> Result<String> {
    if let Some(name) = unknown_placeholder(template) {
        return Err(CoreError::configuration(format!(
            "Invalid planning prompt template: unknown placeholder '{{{name}}}'"
        )));
    }
    Ok(template
        .replace("{tool_list}", tool_list)
        .replace("{history}", history)
        .replace("{user_request}", user_request))
}

fn unknown_placeholder(template: &str) -> Option<String> {
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len()
                && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
            {
                end += 1;
            }
            if end > start && end < bytes.len() && bytes[end] == b'}' {
                let name = &template[start..end];
                if !PLACEHOLDERS.contains(&name) {
                    return Some(name.to_string());
                }
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
    None
}

/// Drop a ```json fence (or a bare ``` fence) wrapped around the response.
fn strip_code_fences(text: &str) -> &str {
    let mut trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        trimmed = rest;
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        trimmed = rest;
    }
    if let Some(rest) = trimmed.strip_suffix("```") {
        trimmed = rest;
    }
    trimmed.trim()
}
