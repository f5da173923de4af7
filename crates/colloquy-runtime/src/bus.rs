//! The in-process event bus.
//!
//! Four bounded queues, one per event family. Publishing uses `try_send`
//! and never waits: when a queue is saturated the publish fails with
//! `QueueFull` and the caller decides what that means for its turn.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use colloquy_core::error::{CoreError, Result};
use colloquy_core::events::{EventEnvelope, EventPayload};
use colloquy_core::traits::EventSink;

/// Receiver end shared by every worker of a pool.
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<EventEnvelope>>>;

/// Bounded router for event envelopes.
pub struct EventBus {
    turn_tx: mpsc::Sender<EventEnvelope>,
    step_tx: mpsc::Sender<EventEnvelope>,
    step_result_tx: mpsc::Sender<EventEnvelope>,
    terminal_tx: mpsc::Sender<EventEnvelope>,
    turn_rx: SharedReceiver,
    step_rx: SharedReceiver,
    step_result_rx: SharedReceiver,
    terminal_rx: std::sync::Mutex<Option<mpsc::Receiver<EventEnvelope>>>,
}

impl EventBus {
    /// Build a bus whose queues each hold up to `capacity` envelopes.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (turn_tx, turn_rx) = mpsc::channel(capacity);
        let (step_tx, step_rx) = mpsc::channel(capacity);
        let (step_result_tx, step_result_rx) = mpsc::channel(capacity);
        let (terminal_tx, terminal_rx) = mpsc::channel(capacity);
        Self {
            turn_tx,
            step_tx,
            step_result_tx,
            terminal_tx,
            turn_rx: Arc::new(Mutex::new(turn_rx)),
            step_rx: Arc::new(Mutex::new(step_rx)),
            step_result_rx: Arc::new(Mutex::new(step_result_rx)),
            terminal_rx: std::sync::Mutex::new(Some(terminal_rx)),
        }
    }

    fn try_publish(&self, envelope: EventEnvelope) -> Result<()> {
        let (queue, label) = match &envelope.payload {
            EventPayload::Turn(_) => (&self.turn_tx, "turn"),
            EventPayload::Step(_) => (&self.step_tx, "step"),
            EventPayload::StepResult(_) => (&self.step_result_tx, "step_result"),
            EventPayload::TurnCompleted(_) | EventPayload::TurnFailed(_) => {
                (&self.terminal_tx, "terminal")
            }
        };
        match queue.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(CoreError::queue_full(format!("{label} queue is full")))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(anyhow::anyhow!("{label} queue is closed").into())
            }
        }
    }

    pub fn turn_receiver(&self) -> SharedReceiver {
        self.turn_rx.clone()
    }

    pub fn step_receiver(&self) -> SharedReceiver {
        self.step_rx.clone()
    }

    pub fn step_result_receiver(&self) -> SharedReceiver {
        self.step_result_rx.clone()
    }

    /// Take the terminal-event receiver. The embedding application drains
    /// this directly; there is no worker pool for it.
    pub fn take_terminal_receiver(&self) -> Option<mpsc::Receiver<EventEnvelope>> {
        self.terminal_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
    }
}

#[async_trait]
impl EventSink for EventBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<()> {
        self.try_publish(envelope)
    }
}
