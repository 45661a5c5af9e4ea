use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{
    sync::{Mutex, Notify},
    time::{Instant, timeout_at},
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    clients::queue::{DurableQueue, SyncCheckpoint},
    error::QueueError,
    models::queue::{DeadLetterEntry, DequeueToken, QueueEntry},
};

#[derive(Default)]
struct MemoryState {
    main: VecDeque<QueueEntry>,
    in_flight: HashMap<DequeueToken, (QueueEntry, Instant)>,
    dead_letters: Vec<DeadLetterEntry>,
    last_sync: Option<DateTime<Utc>>,
}

/// Process-local queue. Same ownership rules as the Redis queue, no durability
/// across restarts.
pub struct InMemoryQueue {
    state: Mutex<MemoryState>,
    available: Notify,
    visibility_timeout: Duration,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        info!("In-memory queue initialized (entries do not survive restarts)");

        Self {
            state: Mutex::new(MemoryState::default()),
            available: Notify::new(),
            visibility_timeout,
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    fn release(state: &mut MemoryState, token: &DequeueToken) -> bool {
        let owned = state.in_flight.remove(token).is_some();
        if !owned {
            warn!("Token no longer owns its entry (visibility window elapsed), release ignored");
        }
        owned
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn push(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let mut entry = entry.clone();
        entry.dequeue_token = None;
        self.state.lock().await.main.push_back(entry);
        self.available.notify_one();
        Ok(())
    }

    async fn pop_blocking(&self, timeout: Duration) -> Result<Option<QueueEntry>, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.available.notified();

            {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.main.pop_front() {
                    let token = DequeueToken::new(Uuid::new_v4().to_string());
                    state
                        .in_flight
                        .insert(token.clone(), (entry.clone(), Instant::now() + self.visibility_timeout));
                    if !state.main.is_empty() {
                        self.available.notify_one();
                    }
                    return Ok(Some(entry.with_token(token)));
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, token: &DequeueToken) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        Ok(Self::release(&mut state, token))
    }

    async fn requeue(
        &self,
        token: &DequeueToken,
        entry: &QueueEntry,
    ) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if !Self::release(&mut state, token) {
            return Ok(false);
        }

        let mut entry = entry.clone();
        entry.dequeue_token = None;
        state.main.push_back(entry);
        self.available.notify_one();
        Ok(true)
    }

    async fn push_dead_letter(
        &self,
        token: &DequeueToken,
        entry: &DeadLetterEntry,
    ) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if !Self::release(&mut state, token) {
            return Ok(false);
        }

        state.dead_letters.push(entry.clone());
        Ok(true)
    }

    async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let expired: Vec<DequeueToken> = state
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(token, _)| token.clone())
            .collect();

        for token in &expired {
            if let Some((mut entry, _)) = state.in_flight.remove(token) {
                entry.dequeue_token = None;
                state.main.push_back(entry);
                self.available.notify_one();
            }
        }

        Ok(expired.len())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().await.main.len() as u64)
    }

    async fn dead_letter_depth(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().await.dead_letters.len() as u64)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let state = self.state.lock().await;
        let skip = state.dead_letters.len().saturating_sub(limit);
        Ok(state.dead_letters.iter().skip(skip).cloned().collect())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[async_trait]
impl SyncCheckpoint for InMemoryQueue {
    async fn last_sync(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        Ok(self.state.lock().await.last_sync)
    }

    async fn record_sync(&self, at: DateTime<Utc>) -> Result<(), QueueError> {
        self.state.lock().await.last_sync = Some(at);
        Ok(())
    }
}
