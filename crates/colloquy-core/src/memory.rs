//! In-memory collaborator implementations.
//!
//! These back small deployments and every test in the workspace. The
//! memory store does naive term-overlap scoring instead of vector
//! search; swap in a real backend through the `Memory` trait when that
//! matters.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{CoreError, Result};
use crate::events::{EventEnvelope, EventPayload};
use crate::message::Message;
use crate::traits::{ContextStore, EventSink, Generation, Memory, MemoryHit, Provider, ToolHandler};
use crate::turn::Turn;

// ============================================================================
// Memory
// ============================================================================

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Value,
    metadata: Option<Value>,
}

/// Process-local key-value memory with overlap-scored search.
#[derive(Default)]
pub struct InMemoryMemory {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Text rendering used for scoring: prefer an object's "text" field,
    /// then plain strings, then raw JSON.
    fn entry_text(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            Value::Object(map) => match map.get("text") {
                Some(Value::String(s)) => s.clone(),
                _ => value.to_string(),
            },
            other => other.to_string(),
        }
    }

    fn matches_filters(metadata: Option<&Value>, filters: Option<&Value>) -> bool {
        let Some(Value::Object(wanted)) = filters else {
            return true;
        };
        let Some(Value::Object(present)) = metadata else {
            return wanted.is_empty();
        };
        wanted.iter().all(|(k, v)| present.get(k) == Some(v))
    }
}

#[async_trait]
impl Memory for InMemoryMemory {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&Value>,
    ) -> Result<Vec<MemoryHit>> {
        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if terms.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let entries = self.entries.read().await;
        let mut hits: Vec<MemoryHit> = Vec::new();
        for (key, entry) in entries.iter() {
            if !Self::matches_filters(entry.metadata.as_ref(), filters) {
                continue;
            }
            let text = Self::entry_text(&entry.value);
            let haystack = text.to_lowercase();
            let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
            if matched == 0 {
                continue;
            }
            hits.push(MemoryHit {
                key: key.clone(),
                text,
                score: Some(matched as f32 / terms.len() as f32),
                metadata: entry.metadata.clone(),
            });
        }

        hits.sort_by(|a, b| {
            let by_score = b
                .score
                .unwrap_or(0.0)
                .total_cmp(&a.score.unwrap_or(0.0));
            by_score.then_with(|| a.key.cmp(&b.key))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn read(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).map(|e| e.value.clone()))
    }

    async fn write(
        &self,
        key: &str,
        value: Value,
        metadata: Option<Value>,
        _ttl_seconds: Option<u64>,
    ) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), MemoryEntry { value, metadata });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Memory that fails every call, for exercising soft-fail paths.
pub struct FailingMemory {
    message: String,
}

impl FailingMemory {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Memory for FailingMemory {
    async fn search(&self, _: &str, _: usize, _: Option<&Value>) -> Result<Vec<MemoryHit>> {
        Err(CoreError::memory(self.message.clone()))
    }

    async fn read(&self, _: &str) -> Result<Option<Value>> {
        Err(CoreError::memory(self.message.clone()))
    }

    async fn write(&self, _: &str, _: Value, _: Option<Value>, _: Option<u64>) -> Result<()> {
        Err(CoreError::memory(self.message.clone()))
    }

    async fn delete(&self, _: &str) -> Result<()> {
        Err(CoreError::memory(self.message.clone()))
    }
}

// ============================================================================
// Turn persistence
// ============================================================================

/// Process-local turn store.
#[derive(Default)]
pub struct InMemoryContextStore {
    turns: RwLock<HashMap<String, Turn>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn turn_count(&self) -> usize {
        self.turns.read().await.len()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn save_turn(&self, turn: &Turn) -> Result<()> {
        self.turns
            .write()
            .await
            .insert(turn.turn_id.clone(), turn.clone());
        Ok(())
    }

    async fn get_turn(&self, turn_id: &str) -> Result<Option<Turn>> {
        Ok(self.turns.read().await.get(turn_id).cloned())
    }
}

/// Context store whose saves always fail.
pub struct FailingContextStore {
    message: String,
}

impl FailingContextStore {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl ContextStore for FailingContextStore {
    async fn save_turn(&self, _turn: &Turn) -> Result<()> {
        Err(CoreError::context(self.message.clone()))
    }

    async fn get_turn(&self, _turn_id: &str) -> Result<Option<Turn>> {
        Ok(None)
    }
}

// ============================================================================
// Mock provider
// ============================================================================

/// One scripted provider response.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Reply(Generation),
    AuthError(String),
    RateLimited(String),
    CallError(String),
}

impl MockResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Reply(Generation::new(Message::assistant(content)))
    }

    pub fn text_with_usage(
        content: impl Into<String>,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> Self {
        Self::Reply(
            Generation::new(Message::assistant(content)).with_usage(prompt_tokens, completion_tokens),
        )
    }

    fn into_result(self) -> Result<Generation> {
        match self {
            Self::Reply(generation) => Ok(generation),
            Self::AuthError(msg) => Err(CoreError::provider_auth(msg)),
            Self::RateLimited(msg) => Err(CoreError::provider_rate_limited(msg)),
            Self::CallError(msg) => Err(CoreError::provider_call(msg)),
        }
    }
}

/// Arguments of one recorded `generate` call.
#[derive(Debug, Clone)]
pub struct GenerateCall {
    pub messages: Vec<Message>,
    pub model: String,
    pub stream: bool,
    pub parameters: Option<Value>,
}

/// Arguments of one recorded `embed` call.
#[derive(Debug, Clone)]
pub struct EmbedCall {
    pub texts: Vec<String>,
    pub model: String,
    pub parameters: Option<Value>,
}

/// Provider that replays scripted responses and records every call.
#[derive(Default)]
pub struct MockProvider {
    responses: RwLock<VecDeque<MockResponse>>,
    generate_calls: RwLock<Vec<GenerateCall>>,
    embed_calls: RwLock<Vec<EmbedCall>>,
    embeddings: RwLock<Option<Vec<Vec<f32>>>>,
    default_model: Option<String>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_response(mut self, response: MockResponse) -> Self {
        self.responses.get_mut().push_back(response);
        self
    }

    pub fn with_responses(mut self, responses: Vec<MockResponse>) -> Self {
        self.responses.get_mut().extend(responses);
        self
    }

    pub fn with_embeddings(mut self, embeddings: Vec<Vec<f32>>) -> Self {
        *self.embeddings.get_mut() = Some(embeddings);
        self
    }

    /// Queue another response after construction.
    pub async fn queue_response(&self, response: MockResponse) {
        self.responses.write().await.push_back(response);
    }

    pub async fn generate_calls(&self) -> Vec<GenerateCall> {
        self.generate_calls.read().await.clone()
    }

    pub async fn embed_calls(&self) -> Vec<EmbedCall> {
        self.embed_calls.read().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.generate_calls.read().await.len() + self.embed_calls.read().await.len()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn generate(
        &self,
        messages: Vec<Message>,
        model: &str,
        stream: bool,
        parameters: Option<&Value>,
    ) -> Result<Generation> {
        self.generate_calls.write().await.push(GenerateCall {
            messages,
            model: model.to_string(),
            stream,
            parameters: parameters.cloned(),
        });
        match self.responses.write().await.pop_front() {
            Some(response) => response.into_result(),
            None => Ok(Generation::new(Message::assistant("(no scripted response)"))),
        }
    }

    async fn embed(
        &self,
        texts: Vec<String>,
        model: &str,
        parameters: Option<&Value>,
    ) -> Result<Vec<Vec<f32>>> {
        let count = texts.len();
        self.embed_calls.write().await.push(EmbedCall {
            texts,
            model: model.to_string(),
            parameters: parameters.cloned(),
        });
        match self.embeddings.read().await.clone() {
            Some(embeddings) => Ok(embeddings),
            None => Ok(vec![vec![0.0; 3]; count]),
        }
    }

    fn default_model(&self) -> Option<String> {
        self.default_model.clone()
    }
}

// ============================================================================
// Tool handlers
// ============================================================================

/// Handler that returns a fixed output and records its arguments.
pub struct MockToolHandler {
    output: Value,
    calls: RwLock<Vec<Value>>,
}

impl MockToolHandler {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            calls: RwLock::new(Vec::new()),
        }
    }

    pub async fn calls(&self) -> Vec<Value> {
        self.calls.read().await.clone()
    }
}

#[async_trait]
impl ToolHandler for MockToolHandler {
    async fn execute(&self, args: &Value) -> Result<Value> {
        self.calls.write().await.push(args.clone());
        Ok(self.output.clone())
    }
}

/// Handler that always fails.
pub struct FailingToolHandler {
    message: String,
}

impl FailingToolHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl ToolHandler for FailingToolHandler {
    async fn execute(&self, _args: &Value) -> Result<Value> {
        Err(CoreError::tool_execution(self.message.clone()))
    }
}

// ============================================================================
// Event sinks
// ============================================================================

/// Sink that appends every envelope to a list.
#[derive(Default)]
pub struct RecordingSink {
    events: RwLock<Vec<EventEnvelope>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<EventEnvelope> {
        self.events.read().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn of_type(&self, event_type: &str) -> Vec<EventEnvelope> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, envelope: EventEnvelope) -> Result<()> {
        self.events.write().await.push(envelope);
        Ok(())
    }
}

/// Sink that rejects selected publishes, for saturation scenarios.
///
/// With no inner sink every publish fails. With one, step events whose
/// step id ends with one of the listed suffixes fail and everything else
/// is forwarded; suffixes like "_1" target a step by index even though
/// full step ids are only known once the turn exists.
pub struct FailingSink {
    inner: Option<Arc<dyn EventSink>>,
    rejected_step_suffixes: Vec<String>,
}

impl FailingSink {
    pub fn new() -> Self {
        Self {
            inner: None,
            rejected_step_suffixes: Vec::new(),
        }
    }

    pub fn rejecting_steps(
        inner: Arc<dyn EventSink>,
        step_id_suffixes: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            inner: Some(inner),
            rejected_step_suffixes: step_id_suffixes.into_iter().collect(),
        }
    }
}

impl Default for FailingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for FailingSink {
    async fn publish(&self, envelope: EventEnvelope) -> Result<()> {
        let Some(inner) = &self.inner else {
            return Err(CoreError::queue_full("event sink rejected publish"));
        };
        if let EventPayload::Step(event) = &envelope.payload {
            let rejected = self
                .rejected_step_suffixes
                .iter()
                .any(|suffix| event.step.step_id.ends_with(suffix.as_str()));
            if rejected {
                return Err(CoreError::queue_full(format!(
                    "step queue full, dropping {}",
                    event.step.step_id
                )));
            }
        }
        inner.publish(envelope).await
    }
}
