//! Error types shared across the orchestrator.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Unified error type for turn orchestration.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing or inconsistent configuration (provider defaults, model
    /// resolution, malformed step inputs).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Provider rejected our credentials.
    #[error("provider authentication failed: {0}")]
    ProviderAuth(String),

    /// Provider throttled the request.
    #[error("provider rate limited: {0}")]
    ProviderRateLimited(String),

    /// Provider call failed for any other reason.
    #[error("provider call failed: {0}")]
    ProviderCall(String),

    /// Tool is not registered or not granted to the personality.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Tool was found but its handler failed.
    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    /// Plan text could not be parsed into a valid plan.
    #[error("plan parse error: {0}")]
    PlanParse(String),

    /// A bounded event queue rejected a publish.
    #[error("queue full: {0}")]
    QueueFull(String),

    /// Memory backend failure.
    #[error("memory error: {0}")]
    Memory(String),

    /// Context store failure.
    #[error("context store error: {0}")]
    Context(String),

    /// Anything else.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn provider_auth(msg: impl Into<String>) -> Self {
        Self::ProviderAuth(msg.into())
    }

    pub fn provider_rate_limited(msg: impl Into<String>) -> Self {
        Self::ProviderRateLimited(msg.into())
    }

    pub fn provider_call(msg: impl Into<String>) -> Self {
        Self::ProviderCall(msg.into())
    }

    pub fn tool_not_found(msg: impl Into<String>) -> Self {
        Self::ToolNotFound(msg.into())
    }

    pub fn tool_execution(msg: impl Into<String>) -> Self {
        Self::ToolExecution(msg.into())
    }

    pub fn plan_parse(msg: impl Into<String>) -> Self {
        Self::PlanParse(msg.into())
    }

    pub fn queue_full(msg: impl Into<String>) -> Self {
        Self::QueueFull(msg.into())
    }

    pub fn memory(msg: impl Into<String>) -> Self {
        Self::Memory(msg.into())
    }

    pub fn context(msg: impl Into<String>) -> Self {
        Self::Context(msg.into())
    }

    /// Stable machine-readable tag, used when an error is folded into a
    /// step's error record.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::ProviderAuth(_) => "provider_auth",
            Self::ProviderRateLimited(_) => "provider_rate_limited",
            Self::ProviderCall(_) => "provider_call",
            Self::ToolNotFound(_) => "tool_not_found",
            Self::ToolExecution(_) => "tool_execution",
            Self::PlanParse(_) => "plan_parse",
            Self::QueueFull(_) => "queue_full",
            Self::Memory(_) => "memory",
            Self::Context(_) => "context",
            Self::Internal(_) => "internal",
        }
    }

    /// True for errors originating in a model provider call.
    pub fn is_provider_error(&self) -> bool {
        matches!(
            self,
            Self::ProviderAuth(_) | Self::ProviderRateLimited(_) | Self::ProviderCall(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let err = CoreError::configuration("missing provider 'openai'");
        assert_eq!(
            err.to_string(),
            "configuration error: missing provider 'openai'"
        );
    }

    #[test]
    fn kind_is_stable() {
        assert_eq!(CoreError::queue_full("step queue").kind(), "queue_full");
        assert_eq!(CoreError::tool_not_found("x").kind(), "tool_not_found");
        let internal: CoreError = anyhow::anyhow!("boom").into();
        assert_eq!(internal.kind(), "internal");
    }

    #[test]
    fn provider_errors_are_grouped() {
        assert!(CoreError::provider_rate_limited("slow down").is_provider_error());
        assert!(!CoreError::configuration("nope").is_provider_error());
    }
}
