//! Worker pools draining bus queues.
//!
//! Each pool owns N tasks that compete for envelopes on one shared
//! receiver. Dequeue is serialized through the receiver mutex; handling
//! runs concurrently across workers. A handler error fails that envelope
//! only, never the worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use colloquy_core::error::Result;
use colloquy_core::events::EventEnvelope;

use crate::bus::SharedReceiver;

/// Something that consumes envelopes off a queue.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: EventEnvelope) -> Result<()>;
}

/// A named set of workers bound to one queue and one handler.
pub struct WorkerPool {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    drain_timeout: Duration,
}

impl WorkerPool {
    /// Spawn `workers` tasks draining `queue` through `handler`.
    pub fn start(
        name: impl Into<String>,
        workers: usize,
        queue: SharedReceiver,
        handler: Arc<dyn EnvelopeHandler>,
        drain_timeout: Duration,
    ) -> Self {
        let name = name.into();
        let (shutdown_tx, _) = watch::channel(false);
        let workers = workers.max(1);

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let worker_name = format!("{name}-{index}");
            let queue = queue.clone();
            let handler = handler.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();

            handles.push(tokio::spawn(async move {
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    let envelope = tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                            continue;
                        }
                        received = async { queue.lock().await.recv().await } => {
                            match received {
                                Some(envelope) => envelope,
                                // Queue closed, nothing left to do.
                                None => break,
                            }
                        }
                    };
                    let event_type = envelope.event_type();
                    if let Err(err) = handler.handle(envelope).await {
                        error!(
                            worker = %worker_name,
                            event_type = %event_type,
                            error = %err,
                            "event handler failed"
                        );
                    }
                }
                debug!(worker = %worker_name, "worker stopped");
            }));
        }

        info!(pool = %name, workers = workers, "worker pool started");
        Self {
            name,
            shutdown_tx,
            handles,
            drain_timeout,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Signal shutdown and wait up to the drain timeout for workers to
    /// finish their in-flight envelopes.
    pub async fn shutdown(mut self) {
        info!(pool = %self.name, "stopping worker pool");
        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut self.handles);
        let drained = futures::future::join_all(handles);
        match tokio::time::timeout(self.drain_timeout, drained).await {
            Ok(_) => info!(pool = %self.name, "worker pool stopped"),
            Err(_) => warn!(
                pool = %self.name,
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "worker pool drain timed out"
            ),
        }
    }
}
