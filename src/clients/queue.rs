use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::QueueError,
    models::queue::{DeadLetterEntry, DequeueToken, QueueEntry},
};

/// Persistent FIFO of webhook entries with a terminal dead-letter list.
///
/// An entry is always in exactly one place: the main list, owned by one worker
/// (between `pop_blocking` and `ack`/`requeue`/`push_dead_letter`), the
/// dead-letter list, or gone.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Appends to the tail. The entry is durable once this returns `Ok`.
    async fn push(&self, entry: &QueueEntry) -> Result<(), QueueError>;

    /// Removes the head entry and hands ownership to the caller, or returns
    /// `None` once `timeout` elapses with the queue empty.
    async fn pop_blocking(&self, timeout: Duration) -> Result<Option<QueueEntry>, QueueError>;

    /// Drops an owned entry for good.
    ///
    /// This and the two release operations below return `Ok(false)` and change
    /// nothing when `token` no longer owns its entry, i.e. the visibility window
    /// elapsed and the entry was reclaimed for another delivery.
    async fn ack(&self, token: &DequeueToken) -> Result<bool, QueueError>;

    /// Releases an owned entry and appends `entry` (its next attempt) to the tail.
    async fn requeue(&self, token: &DequeueToken, entry: &QueueEntry)
    -> Result<bool, QueueError>;

    /// Releases an owned entry into the dead-letter list.
    async fn push_dead_letter(
        &self,
        token: &DequeueToken,
        entry: &DeadLetterEntry,
    ) -> Result<bool, QueueError>;

    /// Returns owned entries whose visibility window elapsed to the tail of the
    /// main list. Returns how many were reclaimed.
    async fn reclaim_expired(&self) -> Result<usize, QueueError>;

    async fn depth(&self) -> Result<u64, QueueError>;

    async fn dead_letter_depth(&self) -> Result<u64, QueueError>;

    /// Most recent dead letters, newest last.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

/// High-water mark of the last successful order reconciliation, kept next to
/// the queue so a restart resumes from it.
#[async_trait]
pub trait SyncCheckpoint: Send + Sync {
    async fn last_sync(&self) -> Result<Option<DateTime<Utc>>, QueueError>;

    async fn record_sync(&self, at: DateTime<Utc>) -> Result<(), QueueError>;
}
