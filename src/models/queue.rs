use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::event::WebhookEvent;

/// Opaque handle proving that a worker currently owns a dequeued entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DequeueToken(String);

impl DequeueToken {
    pub(crate) fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub event: WebhookEvent,
    pub attempt_count: u32,
    pub enqueued_at: DateTime<Utc>,

    #[serde(skip)]
    pub dequeue_token: Option<DequeueToken>,
}

impl QueueEntry {
    pub fn new(event: WebhookEvent) -> Self {
        let order_sn = event.order_sn().unwrap_or_else(|| "unknown".to_string());
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!(
            "wh_{}_{}_{}",
            event.received_at.timestamp(),
            order_sn,
            &suffix[..8]
        );

        Self {
            id,
            event,
            attempt_count: 0,
            enqueued_at: Utc::now(),
            dequeue_token: None,
        }
    }

    /// The copy that goes back to the tail after a failed attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            id: self.id.clone(),
            event: self.event.clone(),
            attempt_count: self.attempt_count + 1,
            enqueued_at: Utc::now(),
            dequeue_token: None,
        }
    }

    pub(crate) fn with_token(mut self, token: DequeueToken) -> Self {
        self.dequeue_token = Some(token);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub entry: QueueEntry,
    pub failure_reason: String,
    pub dead_lettered_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,
}

impl DeadLetterEntry {
    pub fn new(entry: QueueEntry, failure_reason: String, worker_id: Option<usize>) -> Self {
        Self {
            entry,
            failure_reason,
            dead_lettered_at: Utc::now(),
            worker_id,
        }
    }
}
