//! Delivery pipeline: forwards inbound chat messages to the core with one
//! retry, then escalates by either queueing until the core recovers or
//! answering through a fallback agent. One escalation policy per deployment.

pub mod fallback;
mod queue;
pub mod transport;

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use shared_types::{CoreReply, IncomingMessage};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;

pub use fallback::{FallbackPath, FALLBACK_APOLOGY};
use queue::{DeliveryQueue, QueuedMessage};
pub use transport::{CoreTransport, HttpCoreTransport, TransportError};

/// Sent to `on_status` before the single retry.
pub const RETRY_NOTICE: &str = "Still working on it, retrying…";

/// Optional progress callback for `send`. May borrow from the caller.
pub type StatusCallback<'a> = dyn Fn(&str) + Send + Sync + 'a;

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Wait between the first attempt and the retry
    pub retry_delay: Duration,
    /// Period of the queue drain task
    pub drain_interval: Duration,
    /// Queued messages older than this are rejected
    pub max_retry_window: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(3),
            drain_interval: Duration::from_secs(2),
            max_retry_window: Duration::from_secs(60),
        }
    }
}

/// What happens after the retry also fails.
pub enum Escalation {
    QueueAndDrain,
    ImmediateFallback(FallbackPath),
}

impl Escalation {
    pub fn name(&self) -> &'static str {
        match self {
            Escalation::QueueAndDrain => "queue",
            Escalation::ImmediateFallback(_) => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Primary,
    RetryPending,
    Queued,
    FallbackInvoked,
    Expired,
    Delivered,
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeliveryState::Primary => "primary",
            DeliveryState::RetryPending => "retry_pending",
            DeliveryState::Queued => "queued",
            DeliveryState::FallbackInvoked => "fallback_invoked",
            DeliveryState::Expired => "expired",
            DeliveryState::Delivered => "delivered",
        };
        f.write_str(s)
    }
}

/// Settled result of `send`. `state` is `Delivered` or `FallbackInvoked`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub reply: CoreReply,
    pub state: DeliveryState,
    /// Attempts made against the core
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("core did not recover within {}s", waited.as_secs())]
    QueueExpired { waited: Duration },
    #[error("delivery pipeline is shutting down")]
    ShuttingDown,
}

pub struct DeliveryPipeline {
    transport: Arc<dyn CoreTransport>,
    clock: Arc<dyn Clock>,
    config: DeliveryConfig,
    escalation: Escalation,
    queue: Mutex<DeliveryQueue>,
    shutdown: CancellationToken,
}

impl DeliveryPipeline {
    pub fn new(
        transport: Arc<dyn CoreTransport>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
        escalation: Escalation,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            clock,
            config,
            escalation,
            queue: Mutex::new(DeliveryQueue::default()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn policy(&self) -> &'static str {
        self.escalation.name()
    }

    pub fn queue_depth(&self) -> usize {
        self.lock_queue().len()
    }

    /// Best-effort liveness of the core. Never consulted by `send`.
    pub async fn is_healthy(&self) -> bool {
        self.transport.health().await
    }

    /// Deliver `message` to the core.
    ///
    /// Resolves once the message is delivered, answered by the fallback
    /// agent, or rejected from the queue. Transport errors never reach the
    /// caller.
    pub async fn send(
        self: &Arc<Self>,
        message: IncomingMessage,
        on_status: Option<&StatusCallback<'_>>,
    ) -> Result<Delivery, DeliveryError> {
        if self.shutdown.is_cancelled() {
            return Err(DeliveryError::ShuttingDown);
        }

        if matches!(self.escalation, Escalation::QueueAndDrain) && self.queue_depth() > 0 {
            debug!(message_id = %message.id, "backlog present; queueing behind it");
            return self.enqueue(message, 0).await;
        }

        debug!(message_id = %message.id, state = %DeliveryState::Primary, "delivering to core");
        match self.transport.deliver(&message).await {
            Ok(reply) => return Ok(delivered(reply, 1)),
            Err(e) => {
                warn!(message_id = %message.id, error = %e, state = %DeliveryState::RetryPending, "core delivery failed")
            }
        }

        if let Some(notify) = on_status {
            notify(RETRY_NOTICE);
        }
        self.clock.sleep(self.config.retry_delay).await;

        match self.transport.deliver(&message).await {
            Ok(reply) => return Ok(delivered(reply, 2)),
            Err(e) => warn!(message_id = %message.id, error = %e, "core delivery retry failed"),
        }

        match &self.escalation {
            Escalation::QueueAndDrain => self.enqueue(message, 2).await,
            Escalation::ImmediateFallback(fallback) => {
                info!(message_id = %message.id, state = %DeliveryState::FallbackInvoked, "escalating to fallback agent");
                Ok(Delivery {
                    reply: fallback.respond(&message).await,
                    state: DeliveryState::FallbackInvoked,
                    attempts: 2,
                })
            }
        }
    }

    /// Stop the drain task and reject everything still queued.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut queue = self.lock_queue();
        if let Some(task) = queue.drain_task.take() {
            task.abort();
        }
        queue.draining = false;
        queue.reject_all(|| DeliveryError::ShuttingDown);
    }

    fn lock_queue(&self) -> MutexGuard<'_, DeliveryQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enqueue(
        self: &Arc<Self>,
        message: IncomingMessage,
        attempts: u32,
    ) -> Result<Delivery, DeliveryError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.lock_queue();
            if self.shutdown.is_cancelled() {
                return Err(DeliveryError::ShuttingDown);
            }
            let message_id = message.id.clone();
            queue.push_back(QueuedMessage::new(
                message,
                self.clock.now(),
                self.config.max_retry_window,
                attempts,
                tx,
            ));
            info!(
                message_id = %message_id,
                queue_depth = queue.len(),
                state = %DeliveryState::Queued,
                "core unavailable; message queued"
            );

            if !queue.draining {
                queue.draining = true;
                let pipeline = Arc::clone(self);
                queue.drain_task = Some(tokio::spawn(pipeline.drain_loop()));
            }
        }

        rx.await.unwrap_or(Err(DeliveryError::ShuttingDown))
    }

    /// Single consumer of the queue. Exits once the queue is empty; the next
    /// enqueue starts a fresh one.
    async fn drain_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = self.clock.sleep(self.config.drain_interval) => {}
            }
            if !self.drain_tick().await {
                return;
            }
        }
    }

    /// Deliver from the head until an attempt fails. Returns `false` when the
    /// queue is empty and the task should end.
    async fn drain_tick(&self) -> bool {
        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }

            let (entry_id, message, remaining) = {
                let mut queue = self.lock_queue();
                match queue.next_live(self.clock.now()) {
                    Some(head) => head,
                    None => {
                        queue.draining = false;
                        queue.drain_task = None;
                        return false;
                    }
                }
            };

            // A hung core must not keep the head alive past its deadline.
            let attempt = tokio::select! {
                result = self.transport.deliver(&message) => Some(result),
                _ = self.clock.sleep(remaining) => None,
            };

            match attempt {
                None => {
                    debug!(message_id = %message.id, "core still busy at queue deadline");
                    self.lock_queue().expire_front_if(entry_id, self.clock.now());
                }
                Some(Ok(reply)) => {
                    let Some(entry) = self.lock_queue().pop_front_if(entry_id) else {
                        // Rejected by shutdown while the attempt was in flight.
                        return false;
                    };
                    let attempts = entry.attempts + 1;
                    info!(
                        message_id = %message.id,
                        attempts,
                        waited_secs = entry.age(self.clock.now()).as_secs(),
                        "queued message delivered"
                    );
                    entry.resolve(Ok(delivered(reply, attempts)));
                }
                Some(Err(e)) => {
                    debug!(message_id = %message.id, error = %e, "queued delivery failed; waiting for next tick");
                    self.lock_queue().record_failed_attempt(entry_id);
                    return true;
                }
            }
        }
    }
}

fn delivered(reply: CoreReply, attempts: u32) -> Delivery {
    Delivery {
        reply,
        state: DeliveryState::Delivered,
        attempts,
    }
}
