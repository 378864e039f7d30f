use std::{collections::VecDeque, time::Duration};

use shared_types::IncomingMessage;
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tracing::{info, warn};
use ulid::Ulid;

use super::{Delivery, DeliveryError};

pub(crate) type Completion = oneshot::Sender<Result<Delivery, DeliveryError>>;

/// A message waiting for the core to come back, plus the handle that
/// resolves its original caller.
pub(crate) struct QueuedMessage {
    pub id: Ulid,
    pub message: IncomingMessage,
    pub enqueued_at: Instant,
    pub ttl: Duration,
    pub attempts: u32,
    completion: Completion,
}

impl QueuedMessage {
    pub fn new(
        message: IncomingMessage,
        enqueued_at: Instant,
        ttl: Duration,
        attempts: u32,
        completion: Completion,
    ) -> Self {
        Self {
            id: Ulid::new(),
            message,
            enqueued_at,
            ttl,
            attempts,
            completion,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.age(now) >= self.ttl
    }

    /// The caller stopped waiting (request dropped).
    pub fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }

    pub fn resolve(self, result: Result<Delivery, DeliveryError>) {
        // Receiver may be gone; nothing else to tell.
        let _ = self.completion.send(result);
    }
}

/// FIFO of undelivered messages. Only the drain task removes from the head.
#[derive(Default)]
pub(crate) struct DeliveryQueue {
    pub entries: VecDeque<QueuedMessage>,
    /// A drain task is running (or about to).
    pub draining: bool,
    pub drain_task: Option<JoinHandle<()>>,
}

impl DeliveryQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn push_back(&mut self, entry: QueuedMessage) {
        self.entries.push_back(entry);
    }

    /// Settle expired and abandoned entries at the head, then return the id,
    /// payload and remaining lifetime of the first entry still worth
    /// delivering.
    pub fn next_live(&mut self, now: Instant) -> Option<(Ulid, IncomingMessage, Duration)> {
        loop {
            let head = self.entries.front()?;
            if head.is_abandoned() {
                if let Some(entry) = self.entries.pop_front() {
                    warn!(message_id = %entry.message.id, "caller gave up; dropping queued message");
                }
                continue;
            }
            if head.is_expired(now) {
                let id = head.id;
                self.expire_front_if(id, now);
                continue;
            }
            let remaining = head.ttl.saturating_sub(head.age(now));
            return Some((head.id, head.message.clone(), remaining));
        }
    }

    /// Reject the head with `QueueExpired` if it is still `id`.
    pub fn expire_front_if(&mut self, id: Ulid, now: Instant) {
        if let Some(entry) = self.pop_front_if(id) {
            let waited = entry.age(now);
            warn!(
                message_id = %entry.message.id,
                waited_secs = waited.as_secs(),
                attempts = entry.attempts,
                "queued message expired"
            );
            entry.resolve(Err(DeliveryError::QueueExpired { waited }));
        }
    }

    pub fn pop_front_if(&mut self, id: Ulid) -> Option<QueuedMessage> {
        if self.entries.front().is_some_and(|head| head.id == id) {
            self.entries.pop_front()
        } else {
            None
        }
    }

    pub fn record_failed_attempt(&mut self, id: Ulid) {
        if let Some(head) = self.entries.front_mut().filter(|head| head.id == id) {
            head.attempts += 1;
        }
    }

    /// Reject everything still waiting.
    pub fn reject_all(&mut self, error: impl Fn() -> DeliveryError) {
        let pending = self.entries.len();
        for entry in self.entries.drain(..) {
            entry.resolve(Err(error()));
        }
        if pending > 0 {
            info!(pending, "rejected queued messages");
        }
    }
}
