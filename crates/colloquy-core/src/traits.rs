//! Collaborator traits the runtime is wired with.
//!
//! Everything the orchestrator touches on the outside — model providers,
//! tools, memory, turn persistence, the event bus — sits behind one of
//! these seams so that tests and embedders can substitute their own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::events::EventEnvelope;
use crate::message::Message;
use crate::turn::Turn;

// ============================================================================
// Model providers
// ============================================================================

/// Token accounting for one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// What a provider returns for a text generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Generation {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            usage: None,
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        self.usage = Some(Usage {
            prompt_tokens,
            completion_tokens,
        });
        self
    }
}

/// A model provider capable of text generation and, optionally, embeddings.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate a reply for the given messages.
    async fn generate(
        &self,
        messages: Vec<Message>,
        model: &str,
        stream: bool,
        parameters: Option<&Value>,
    ) -> Result<Generation>;

    /// Embed a batch of texts. Providers without embedding support keep
    /// the default.
    async fn embed(
        &self,
        _texts: Vec<String>,
        _model: &str,
        _parameters: Option<&Value>,
    ) -> Result<Vec<Vec<f32>>> {
        Err(crate::error::CoreError::configuration(
            "provider does not support embeddings",
        ))
    }

    /// Model used when no layer of configuration names one.
    fn default_model(&self) -> Option<String> {
        None
    }
}

// ============================================================================
// Tools
// ============================================================================

/// A callable capability granted to personalities.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, args: &Value) -> Result<Value>;
}

// ============================================================================
// Memory
// ============================================================================

/// One search hit from the memory backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    pub key: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Key-value memory with text search.
#[async_trait]
pub trait Memory: Send + Sync {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&Value>,
    ) -> Result<Vec<MemoryHit>>;

    async fn read(&self, key: &str) -> Result<Option<Value>>;

    async fn write(
        &self,
        key: &str,
        value: Value,
        metadata: Option<Value>,
        ttl_seconds: Option<u64>,
    ) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

// ============================================================================
// Turn persistence
// ============================================================================

/// Durable storage for turn records.
///
/// `save_turn` overwrites the whole record; the manager is the only
/// writer, so last-write-wins is safe here.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn save_turn(&self, turn: &Turn) -> Result<()>;

    async fn get_turn(&self, turn_id: &str) -> Result<Option<Turn>>;
}

// ============================================================================
// Event publishing
// ============================================================================

/// Where the orchestrator publishes envelopes.
///
/// Publishing must not block: implementations reject rather than wait
/// when they are saturated.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, envelope: EventEnvelope) -> Result<()>;
}
