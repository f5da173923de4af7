//! Step execution.
//!
//! The executor consumes step events, runs the step against the right
//! collaborator, and publishes exactly one terminal step result. Inside
//! it works with plain `Result`s; whatever goes wrong is folded into a
//! FAILED result at the boundary so the turn manager only ever sees
//! result events.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use colloquy_core::config::RuntimeConfig;
use colloquy_core::error::{CoreError, Result};
use colloquy_core::events::{EventEnvelope, EventPayload, StepEvent, StepResultEvent};
use colloquy_core::message::{Message, Role};
use colloquy_core::personality::PersonalityConfig;
use colloquy_core::plan::{Step, StepError, StepKind, StepMetrics, StepResult};
use colloquy_core::registry::{PersonalityRegistry, ProviderRegistry};
use colloquy_core::traits::{EventSink, Memory, Provider};

use crate::workers::EnvelopeHandler;

/// Step-config keys that override generation parameters one by one.
const GENERATION_PARAMETER_KEYS: [&str; 5] = [
    "temperature",
    "max_tokens",
    "top_p",
    "frequency_penalty",
    "presence_penalty",
];

/// Executes steps and reports results back onto the bus.
pub struct StepExecutor {
    config: Arc<RuntimeConfig>,
    providers: Arc<ProviderRegistry>,
    personalities: Arc<PersonalityRegistry>,
    memory: Arc<dyn Memory>,
    events: Arc<dyn EventSink>,
}

impl StepExecutor {
    pub fn new(
        config: Arc<RuntimeConfig>,
        providers: Arc<ProviderRegistry>,
        personalities: Arc<PersonalityRegistry>,
        memory: Arc<dyn Memory>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            providers,
            personalities,
            memory,
            events,
        }
    }

    /// Run one step and publish its result.
    ///
    /// Execution failures become FAILED results; only a failed publish of
    /// the result itself surfaces as an error.
    pub async fn handle_step_event(
        &self,
        trace_id: &str,
        session_id: Option<String>,
        event: &StepEvent,
    ) -> Result<()> {
        let started = Instant::now();
        let outcome = self.execute_step(event).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let result = match outcome {
            Ok((output, mut metrics)) => {
                metrics.latency_ms = Some(latency_ms);
                StepResult::succeeded(event.step.step_id.clone(), output).with_metrics(metrics)
            }
            Err(error) => {
                warn!(
                    step_id = %event.step.step_id,
                    step_type = %event.step.step_type,
                    error = %error,
                    "step execution failed"
                );
                StepResult::failed(
                    event.step.step_id.clone(),
                    StepError::new(error.kind(), error.to_string()),
                )
                .with_metrics(StepMetrics::with_latency(latency_ms))
            }
        };

        info!(
            step_id = %event.step.step_id,
            step_type = %event.step.step_type,
            status = %result.status,
            latency_ms = latency_ms as u64,
            "step executed"
        );

        self.events
            .publish(EventEnvelope::step_result(
                trace_id,
                session_id,
                StepResultEvent {
                    turn_id: event.turn_id.clone(),
                    plan_id: event.step.plan_id.clone(),
                    result,
                },
            ))
            .await
    }

    async fn execute_step(&self, event: &StepEvent) -> Result<(Option<Value>, StepMetrics)> {
        let personality = self
            .personalities
            .get_personality(&event.personality_id)
            .ok_or_else(|| {
                CoreError::configuration(format!(
                    "Personality '{}' not found",
                    event.personality_id
                ))
            })?
            .clone();

        let step = &event.step;
        match &step.step_type {
            StepKind::GenerateText => self.run_generate_text(&personality, step).await,
            StepKind::GenerateEmbedding => self.run_generate_embedding(&personality, step).await,
            StepKind::ToolCall => self.run_tool_call(&personality, step).await,
            StepKind::MemoryOp => self.run_memory_op(step).await,
            StepKind::Unknown(tag) => Err(CoreError::configuration(format!(
                "Unsupported step type '{tag}'"
            ))),
        }
    }

    // ------------------------------------------------------------------
    // generate_text
    // ------------------------------------------------------------------

    async fn run_generate_text(
        &self,
        personality: &PersonalityConfig,
        step: &Step,
    ) -> Result<(Option<Value>, StepMetrics)> {
        let (provider, model, parameters, stream) =
            self.resolve_generation_settings(personality, step.config.as_ref())?;

        let mut messages = Vec::new();
        if !personality.system_prompt.is_empty() {
            messages.push(Message::system(personality.system_prompt.clone()));
        }

        let inputs = step.inputs.as_ref();
        let items = field(inputs, "messages")
            .and_then(Value::as_array)
            .filter(|items| !items.is_empty());
        if let Some(items) = items {
            for item in items {
                let role = item.get("role").and_then(Value::as_str);
                let content = item.get("content").and_then(Value::as_str);
                match (role, content) {
                    (Some(role), Some(content)) => {
                        messages.push(Message::new(Role::from(role), content));
                    }
                    _ => warn!(
                        step_id = %step.step_id,
                        "skipping malformed message in step inputs"
                    ),
                }
            }
        } else if let Some(prompt) = str_field(inputs, "prompt") {
            messages.push(Message::user(prompt));
        } else {
            return Err(CoreError::configuration(
                "generate_text step requires 'messages' (list of role/content objects) or 'prompt' (string) in inputs",
            ));
        }
        if !messages.iter().any(|m| m.role == Role::User) {
            warn!(step_id = %step.step_id, "generate_text step has no user message");
        }

        let generation = provider
            .generate(messages, &model, stream, parameters.as_ref())
            .await?;

        let mut metrics = StepMetrics::default();
        if let Some(usage) = generation.usage {
            metrics.prompt_tokens = Some(usage.prompt_tokens);
            metrics.completion_tokens = Some(usage.completion_tokens);
        }
        let output = serde_json::to_value(&generation.message).map_err(anyhow::Error::from)?;
        Ok((Some(output), metrics))
    }

    /// Overlay generation settings: system defaults for the provider,
    /// then the personality, then the step config. Later layers win.
    fn resolve_generation_settings(
        &self,
        personality: &PersonalityConfig,
        step_config: Option<&Value>,
    ) -> Result<(Arc<dyn Provider>, String, Option<Value>, bool)> {
        let provider_id = str_field(step_config, "provider_id")
            .or(personality.provider_id.as_deref())
            .unwrap_or(&self.config.default_provider_id)
            .to_string();
        let provider = self.providers.get(&provider_id).ok_or_else(|| {
            CoreError::configuration(format!("Provider '{provider_id}' is not registered"))
        })?;

        let defaults = self
            .config
            .provider_defaults(&provider_id)
            .and_then(|d| d.llm.as_ref());
        let mut model = defaults.and_then(|d| d.model.clone());
        let mut parameters = Map::new();
        merge_parameters(&mut parameters, defaults.and_then(|d| d.parameters.as_ref()));

        if let Some(personality_model) = &personality.llm.model {
            model = Some(personality_model.clone());
        }
        merge_parameters(&mut parameters, personality.llm.parameters.as_ref());
        let mut stream = personality.llm.stream;

        if let Some(step_model) = str_field(step_config, "model_name") {
            model = Some(step_model.to_string());
        }
        for key in GENERATION_PARAMETER_KEYS {
            if let Some(value) = field(step_config, key) {
                parameters.insert(key.to_string(), value.clone());
            }
        }
        if let Some(step_stream) = field(step_config, "stream").and_then(Value::as_bool) {
            stream = step_stream;
        }

        let model = model.or_else(|| provider.default_model()).ok_or_else(|| {
            CoreError::configuration(format!("No model configured for provider '{provider_id}'"))
        })?;
        let parameters = if parameters.is_empty() {
            None
        } else {
            Some(Value::Object(parameters))
        };
        Ok((provider, model, parameters, stream))
    }

    // ------------------------------------------------------------------
    // generate_embedding
    // ------------------------------------------------------------------

    async fn run_generate_embedding(
        &self,
        personality: &PersonalityConfig,
        step: &Step,
    ) -> Result<(Option<Value>, StepMetrics)> {
        let inputs = step.inputs.as_ref();
        let texts = match field(inputs, "texts_to_embed") {
            Some(Value::Array(items)) => {
                let mut texts = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(text) => texts.push(text.to_string()),
                        None => {
                            return Err(CoreError::configuration(
                                "all items in 'texts_to_embed' must be strings",
                            ))
                        }
                    }
                }
                texts
            }
            _ => Vec::new(),
        };
        if texts.is_empty() {
            return Err(CoreError::configuration(
                "generate_embedding step requires a non-empty 'texts_to_embed' (list of strings) in inputs",
            ));
        }

        let step_config = step.config.as_ref();
        let embedding = personality.embedding.as_ref();
        let provider_id = str_field(step_config, "provider_id")
            .map(str::to_string)
            .or_else(|| embedding.and_then(|e| e.provider_id.clone()))
            .or_else(|| personality.provider_id.clone())
            .or_else(|| self.config.default_embedding_provider_id.clone())
            .ok_or_else(|| CoreError::configuration("No embedding provider configured"))?;
        let provider = self.providers.get(&provider_id).ok_or_else(|| {
            CoreError::configuration(format!("Provider '{provider_id}' is not registered"))
        })?;

        let defaults = self
            .config
            .provider_defaults(&provider_id)
            .and_then(|d| d.embedding.as_ref());
        let mut model = defaults.and_then(|d| d.model.clone());
        let mut parameters = Map::new();
        merge_parameters(&mut parameters, defaults.and_then(|d| d.parameters.as_ref()));

        if let Some(embedding) = embedding {
            if let Some(embedding_model) = &embedding.model {
                model = Some(embedding_model.clone());
            }
            merge_parameters(&mut parameters, embedding.parameters.as_ref());
        }
        if let Some(step_model) = str_field(step_config, "embedding_model_name") {
            model = Some(step_model.to_string());
        }
        merge_parameters(&mut parameters, field(step_config, "embedding_parameters"));

        let model = model.or_else(|| provider.default_model()).ok_or_else(|| {
            CoreError::configuration(format!(
                "No embedding model configured for provider '{provider_id}'"
            ))
        })?;
        let parameters = if parameters.is_empty() {
            None
        } else {
            Some(Value::Object(parameters))
        };

        let vectors = provider.embed(texts, &model, parameters.as_ref()).await?;
        Ok((Some(json!({ "embeddings": vectors })), StepMetrics::default()))
    }

    // ------------------------------------------------------------------
    // tool_call
    // ------------------------------------------------------------------

    async fn run_tool_call(
        &self,
        personality: &PersonalityConfig,
        step: &Step,
    ) -> Result<(Option<Value>, StepMetrics)> {
        let parameters = step.parameters.as_ref();
        let tool_name = str_field(parameters, "tool_name")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                CoreError::configuration("tool_call step requires 'tool_name' in parameters")
            })?;
        let args = match field(parameters, "args") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(value @ Value::Object(_)) => value.clone(),
            Some(_) => {
                return Err(CoreError::configuration("'args' must be an object"));
            }
        };

        // Built-in memory tools short-circuit; anything else goes through
        // the personality's tool grants.
        let output = match tool_name {
            "search_memory" => self.builtin_search_memory(&args).await?,
            "retrieve_from_memory" => self.builtin_retrieve_from_memory(&args).await?,
            "add_to_memory" => self.builtin_add_to_memory(&args).await?,
            "delete_from_memory" => self.builtin_delete_from_memory(&args).await?,
            _ => {
                self.personalities
                    .execute_tool(&personality.id, tool_name, &args)
                    .await?
            }
        };
        Ok((Some(output), StepMetrics::default()))
    }

    async fn builtin_search_memory(&self, args: &Value) -> Result<Value> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| {
                CoreError::configuration("search_memory requires a non-empty 'query' (string) in args")
            })?;
        let top_k = match args.get("top_k") {
            None | Some(Value::Null) => 5,
            Some(value) => value.as_u64().ok_or_else(|| {
                CoreError::configuration("'top_k' must be a non-negative integer")
            })? as usize,
        };
        let filters = match args.get("filters") {
            None | Some(Value::Null) => None,
            Some(value @ Value::Object(_)) => Some(value),
            Some(_) => {
                return Err(CoreError::configuration("'filters' must be an object"));
            }
        };

        let hits = self.memory.search(query, top_k, filters).await?;
        Ok(serde_json::to_value(hits).map_err(anyhow::Error::from)?)
    }

    async fn builtin_retrieve_from_memory(&self, args: &Value) -> Result<Value> {
        let doc_id = require_str(args, "doc_id", "retrieve_from_memory requires 'doc_id' (string) in args")?;
        // A missing document is a null output, not a failure.
        let value = self.memory.read(doc_id).await?;
        Ok(value.unwrap_or(Value::Null))
    }

    async fn builtin_add_to_memory(&self, args: &Value) -> Result<Value> {
        let message = "add_to_memory requires 'doc_id' (string) and 'text' (string) in args";
        let doc_id = require_str(args, "doc_id", message)?;
        let text = require_str(args, "text", message)?;
        let metadata = match args.get("metadata") {
            None | Some(Value::Null) => None,
            Some(value @ Value::Object(_)) => Some(value.clone()),
            Some(_) => {
                return Err(CoreError::configuration("'metadata' must be an object"));
            }
        };
        self.memory
            .write(doc_id, Value::String(text.to_string()), metadata, None)
            .await?;
        Ok(json!({ "status": "write successful", "doc_id": doc_id }))
    }

    async fn builtin_delete_from_memory(&self, args: &Value) -> Result<Value> {
        let doc_id = require_str(args, "doc_id", "delete_from_memory requires 'doc_id' (string) in args")?;
        self.memory.delete(doc_id).await?;
        Ok(json!({ "status": "delete successful", "doc_id": doc_id }))
    }

    // ------------------------------------------------------------------
    // memory_op
    // ------------------------------------------------------------------

    async fn run_memory_op(&self, step: &Step) -> Result<(Option<Value>, StepMetrics)> {
        let parameters = step.parameters.as_ref();
        let operation = str_field(parameters, "operation").ok_or_else(|| {
            CoreError::configuration("memory_op step requires 'operation' in parameters")
        })?;

        let output = match operation {
            "write" => {
                let message = "memory_op write requires 'doc_id' (string) and 'text' (string) in parameters";
                let doc_id = str_field(parameters, "doc_id")
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| CoreError::configuration(message))?;
                let text = str_field(parameters, "text")
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| CoreError::configuration(message))?;
                let metadata = match field(parameters, "metadata") {
                    None | Some(Value::Null) => None,
                    Some(value @ Value::Object(_)) => Some(value.clone()),
                    Some(_) => {
                        return Err(CoreError::configuration("'metadata' must be an object"));
                    }
                };
                self.memory
                    .write(doc_id, Value::String(text.to_string()), metadata, None)
                    .await?;
                json!({ "status": "write successful", "doc_id": doc_id })
            }
            "delete" => {
                let doc_id = str_field(parameters, "doc_id")
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        CoreError::configuration(
                            "memory_op delete requires 'doc_id' (string) in parameters",
                        )
                    })?;
                self.memory.delete(doc_id).await?;
                json!({ "status": "delete successful", "doc_id": doc_id })
            }
            other => {
                return Err(CoreError::configuration(format!(
                    "Unsupported memory_op operation '{other}'"
                )));
            }
        };
        Ok((Some(output), StepMetrics::default()))
    }
}

#[async_trait]
impl EnvelopeHandler for StepExecutor {
    async fn handle(&self, envelope: EventEnvelope) -> Result<()> {
        match &envelope.payload {
            EventPayload::Step(event) => {
                self.handle_step_event(&envelope.trace_id, envelope.session_id.clone(), event)
                    .await
            }
            other => {
                warn!(
                    event_type = %other.event_type(),
                    "step executor received an unexpected event"
                );
                Ok(())
            }
        }
    }
}

fn field<'a>(source: Option<&'a Value>, key: &str) -> Option<&'a Value> {
    source.and_then(|value| value.get(key))
}

fn str_field<'a>(source: Option<&'a Value>, key: &str) -> Option<&'a str> {
    field(source, key).and_then(Value::as_str)
}

fn require_str<'a>(args: &'a Value, key: &str, message: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoreError::configuration(message))
}

fn merge_parameters(base: &mut Map<String, Value>, overlay: Option<&Value>) {
    if let Some(Value::Object(map)) = overlay {
        for (key, value) in map {
            base.insert(key.clone(), value.clone());
        }
    }
}
