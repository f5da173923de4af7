//! Provider and personality registries.
//!
//! Both registries are assembled once at startup and shared immutably
//! behind `Arc` afterwards; there is no runtime registration.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::personality::PersonalityConfig;
use crate::traits::{Provider, ToolHandler};

/// Model providers keyed by id.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, provider_id: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(provider_id.into(), provider);
        self
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(provider_id).cloned()
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.providers.contains_key(provider_id)
    }
}

/// Personalities and the tool handlers they may call.
///
/// Tool dispatch is a static map from tool name to handler; a personality
/// can only reach handlers for tools it declares.
#[derive(Default)]
pub struct PersonalityRegistry {
    personalities: HashMap<String, PersonalityConfig>,
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    default_personality_id: Option<String>,
}

impl PersonalityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_personality(mut self, personality_id: impl Into<String>) -> Self {
        self.default_personality_id = Some(personality_id.into());
        self
    }

    pub fn register_personality(mut self, personality: PersonalityConfig) -> Self {
        self.personalities.insert(personality.id.clone(), personality);
        self
    }

    pub fn register_tool(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        self.tools.insert(name.into(), handler);
        self
    }

    /// Look up a personality, falling back to the configured default when
    /// the requested one is unknown.
    pub fn get_personality(&self, personality_id: &str) -> Option<&PersonalityConfig> {
        if let Some(personality) = self.personalities.get(personality_id) {
            return Some(personality);
        }
        match &self.default_personality_id {
            Some(default_id) if default_id != personality_id => {
                warn!(
                    personality_id = %personality_id,
                    default_id = %default_id,
                    "personality not found, falling back to default"
                );
                self.personalities.get(default_id)
            }
            _ => None,
        }
    }

    pub fn list_personalities(&self) -> Vec<&PersonalityConfig> {
        let mut all: Vec<_> = self.personalities.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Run a tool on behalf of a personality.
    ///
    /// The personality must exist and declare the tool, and a handler must
    /// be registered under the tool's name.
    pub async fn execute_tool(
        &self,
        personality_id: &str,
        tool_name: &str,
        args: &Value,
    ) -> Result<Value> {
        let personality = self.get_personality(personality_id).ok_or_else(|| {
            CoreError::tool_execution(format!(
                "Personality '{personality_id}' not found for tool execution."
            ))
        })?;

        if !personality.declares_tool(tool_name) {
            return Err(CoreError::tool_not_found(format!(
                "Tool '{tool_name}' not available for personality '{}'",
                personality.id
            )));
        }

        let handler = self.tools.get(tool_name).ok_or_else(|| {
            CoreError::tool_not_found(format!("Tool '{tool_name}' has no registered handler"))
        })?;

        match handler.execute(args).await {
            Ok(output) => Ok(output),
            Err(error @ (CoreError::ToolNotFound(_) | CoreError::ToolExecution(_))) => Err(error),
            Err(error) => Err(CoreError::tool_execution(format!(
                "Tool '{tool_name}' failed: {error}"
            ))),
        }
    }
}
