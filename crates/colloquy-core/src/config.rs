//! Runtime configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// System-level defaults for one capability of a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl ModelDefaults {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            parameters: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

/// Per-provider system defaults, the lowest layer of parameter overlay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<ModelDefaults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<ModelDefaults>,
}

impl ProviderDefaults {
    pub fn llm(defaults: ModelDefaults) -> Self {
        Self {
            llm: Some(defaults),
            embedding: None,
        }
    }

    pub fn with_llm(mut self, defaults: ModelDefaults) -> Self {
        self.llm = Some(defaults);
        self
    }

    pub fn with_embedding(mut self, defaults: ModelDefaults) -> Self {
        self.embedding = Some(defaults);
        self
    }
}

/// Everything the runtime needs to know at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Provider used when neither step nor personality names one.
    #[serde(default = "default_provider_id")]
    pub default_provider_id: String,
    /// Fallback provider for embedding steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_embedding_provider_id: Option<String>,
    /// Personality used when a turn request names none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_personality_id: Option<String>,
    /// System defaults per provider id.
    #[serde(default)]
    pub providers: HashMap<String, ProviderDefaults>,
    /// Plans longer than this are truncated, not rejected.
    #[serde(default = "default_max_steps_per_plan")]
    pub max_steps_per_plan: usize,
    /// Declared turn deadline. Not enforced yet.
    #[serde(default = "default_max_turn_duration_seconds")]
    pub max_turn_duration_seconds: u64,
    /// Declared retry limit for plan generation. Not enforced yet.
    #[serde(default = "default_max_plan_generation_retries")]
    pub max_plan_generation_retries: u32,
    /// Declared retry limit for step execution. Not enforced yet.
    #[serde(default = "default_max_step_execution_retries")]
    pub max_step_execution_retries: u32,
    /// How many memory hits the planner folds into its prompt.
    #[serde(default = "default_memory_search_top_k")]
    pub memory_search_top_k: usize,
    /// Capacity of each bounded event queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_turn_event_workers")]
    pub turn_event_workers: usize,
    #[serde(default = "default_step_event_workers")]
    pub step_event_workers: usize,
    #[serde(default = "default_step_result_event_workers")]
    pub step_result_event_workers: usize,
    /// How long shutdown waits for workers to drain in-flight events.
    #[serde(with = "duration_millis", default = "default_drain_timeout")]
    pub drain_timeout: Duration,
}

fn default_provider_id() -> String {
    "default".to_string()
}

fn default_max_steps_per_plan() -> usize {
    25
}

fn default_max_turn_duration_seconds() -> u64 {
    120
}

fn default_max_plan_generation_retries() -> u32 {
    2
}

fn default_max_step_execution_retries() -> u32 {
    3
}

fn default_memory_search_top_k() -> usize {
    3
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_turn_event_workers() -> usize {
    1
}

fn default_step_event_workers() -> usize {
    2
}

fn default_step_result_event_workers() -> usize {
    2
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_provider_id: default_provider_id(),
            default_embedding_provider_id: None,
            default_personality_id: None,
            providers: HashMap::new(),
            max_steps_per_plan: default_max_steps_per_plan(),
            max_turn_duration_seconds: default_max_turn_duration_seconds(),
            max_plan_generation_retries: default_max_plan_generation_retries(),
            max_step_execution_retries: default_max_step_execution_retries(),
            memory_search_top_k: default_memory_search_top_k(),
            queue_capacity: default_queue_capacity(),
            turn_event_workers: default_turn_event_workers(),
            step_event_workers: default_step_event_workers(),
            step_result_event_workers: default_step_result_event_workers(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.default_provider_id = provider_id.into();
        self
    }

    pub fn with_default_embedding_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.default_embedding_provider_id = Some(provider_id.into());
        self
    }

    pub fn with_default_personality(mut self, personality_id: impl Into<String>) -> Self {
        self.default_personality_id = Some(personality_id.into());
        self
    }

    pub fn with_provider_defaults(
        mut self,
        provider_id: impl Into<String>,
        defaults: ProviderDefaults,
    ) -> Self {
        self.providers.insert(provider_id.into(), defaults);
        self
    }

    pub fn with_max_steps_per_plan(mut self, max: usize) -> Self {
        self.max_steps_per_plan = max;
        self
    }

    pub fn with_memory_search_top_k(mut self, top_k: usize) -> Self {
        self.memory_search_top_k = top_k;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_workers(mut self, turn: usize, step: usize, step_result: usize) -> Self {
        self.turn_event_workers = turn;
        self.step_event_workers = step;
        self.step_result_event_workers = step_result;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// System defaults for a provider, if any were configured.
    pub fn provider_defaults(&self, provider_id: &str) -> Option<&ProviderDefaults> {
        self.providers.get(provider_id)
    }
}

mod duration_millis {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = RuntimeConfig::default();
        assert_eq!(config.default_provider_id, "default");
        assert_eq!(config.max_steps_per_plan, 25);
        assert_eq!(config.memory_search_top_k, 3);
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.turn_event_workers, 1);
        assert_eq!(config.step_event_workers, 2);
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = RuntimeConfig::new()
            .with_default_provider("mock")
            .with_provider_defaults(
                "mock",
                ProviderDefaults::llm(ModelDefaults::new("mock-model")),
            )
            .with_queue_capacity(8)
            .with_workers(1, 4, 2);

        assert_eq!(config.default_provider_id, "mock");
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.step_event_workers, 4);
        let defaults = config.provider_defaults("mock").unwrap();
        assert_eq!(
            defaults.llm.as_ref().and_then(|m| m.model.as_deref()),
            Some("mock-model")
        );
    }

    #[test]
    fn config_deserializes_with_defaults_filled_in() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{"default_provider_id": "openai_chat", "queue_capacity": 50}"#,
        )
        .unwrap();
        assert_eq!(config.default_provider_id, "openai_chat");
        assert_eq!(config.queue_capacity, 50);
        assert_eq!(config.max_steps_per_plan, 25);
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
    }

    #[test]
    fn drain_timeout_serializes_as_millis() {
        let config = RuntimeConfig::new().with_drain_timeout(Duration::from_millis(1500));
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["drain_timeout"], 1500);
    }
}
