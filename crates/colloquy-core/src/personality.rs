//! Personality definitions.
//!
//! A personality bundles a system prompt, provider and model preferences,
//! and the set of tools the orchestrator may call on its behalf. It is
//! static configuration; the runtime never mutates one mid-turn.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool exposed to the planner on behalf of a personality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Text-generation overrides layered on top of the system defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub stream: bool,
}

/// Embedding overrides layered on top of the system defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Plan-generation overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanningSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Custom prompt template; must reference {tool_list}, {history}
    /// and {user_request}.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// A named behavior profile for the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalityConfig {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub system_prompt: String,
    /// Preferred provider for text generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<EmbeddingSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planning: Option<PlanningSettings>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
}

impl PersonalityConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            system_prompt: String::new(),
            provider_id: None,
            llm: LlmSettings::default(),
            embedding: None,
            planning: None,
            tools: Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.llm.model = Some(model.into());
        self
    }

    pub fn with_llm_parameters(mut self, parameters: Value) -> Self {
        self.llm.parameters = Some(parameters);
        self
    }

    pub fn with_embedding(mut self, embedding: EmbeddingSettings) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_planning(mut self, planning: PlanningSettings) -> Self {
        self.planning = Some(planning);
        self
    }

    pub fn with_planning_template(mut self, template: impl Into<String>) -> Self {
        self.planning
            .get_or_insert_with(PlanningSettings::default)
            .template = Some(template.into());
        self
    }

    pub fn with_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    /// Whether this personality is allowed to call the named tool.
    pub fn declares_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    /// "- name: description" lines for the planning prompt.
    pub fn tool_list(&self) -> String {
        if self.tools.is_empty() {
            return "No tools available.".to_string();
        }
        self.tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
