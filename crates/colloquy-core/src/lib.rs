//! Domain types and collaborator traits for the colloquy turn orchestrator.
//!
//! Decisions:
//! - Flat ownership: a turn owns its plan, the plan owns its steps, each
//!   step owns at most one result; nothing is shared between turns
//! - Step results attach exactly once; every duplicate or late delivery
//!   is dropped at the step, which is the only ordering defense we need
//! - Unknown step kinds survive parsing and fail at execution, so one
//!   bad step never sinks its siblings before they run
//! - All collaborators (providers, tools, memory, persistence, event
//!   publishing) are async trait seams with in-memory reference
//!   implementations that double as test doubles

pub mod config;
pub mod error;
pub mod events;
pub mod memory;
pub mod message;
pub mod personality;
pub mod plan;
pub mod registry;
pub mod traits;
pub mod turn;

pub use config::{ModelDefaults, ProviderDefaults, RuntimeConfig};
pub use error::{CoreError, Result};
pub use events::{
    EventEnvelope, EventPayload, StepEvent, StepResultEvent, TurnCompletedEvent, TurnEvent,
    TurnFailedEvent, SPEC_VERSION,
};
pub use memory::{
    EmbedCall, FailingContextStore, FailingMemory, FailingSink, FailingToolHandler, GenerateCall,
    InMemoryContextStore, InMemoryMemory, MockProvider, MockResponse, MockToolHandler,
    RecordingSink,
};
pub use message::{Message, Role};
pub use personality::{
    EmbeddingSettings, LlmSettings, PersonalityConfig, PlanningSettings, ToolSpec,
};
pub use plan::{Plan, Step, StepError, StepKind, StepMetrics, StepResult, StepStatus};
pub use registry::{PersonalityRegistry, ProviderRegistry};
pub use traits::{ContextStore, EventSink, Generation, Memory, MemoryHit, Provider, ToolHandler, Usage};
pub use turn::{Turn, TurnStatus};
