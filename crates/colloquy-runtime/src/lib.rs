//! Turn orchestration over an in-process event bus.
//!
//! Decisions:
//! - The bus is plain bounded mpsc queues routed by payload type; there
//!   is no global instance, every runtime owns its own
//! - Turn and step-result events are both handled by the turn manager;
//!   step events are handled by the executor; terminal events are left
//!   for the embedding application to drain
//! - Publishing never blocks: a saturated queue is an error the
//!   publishing side has to own
//! - Result aggregation is serialized per manager, so arrival order and
//!   duplicate deliveries reduce to the step-level attach-once rule

pub mod bus;
pub mod executor;
pub mod manager;
pub mod planner;
pub mod runtime;
pub mod workers;

pub use bus::{EventBus, SharedReceiver};
pub use executor::StepExecutor;
pub use manager::{TurnManager, TurnRequest};
pub use planner::{PlanGenerator, DEFAULT_PLANNING_TEMPLATE};
pub use runtime::Runtime;
pub use workers::{EnvelopeHandler, WorkerPool};
