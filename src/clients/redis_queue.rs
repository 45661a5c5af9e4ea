use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{
    AsyncCommands, AsyncConnectionConfig, Client, Direction, Script,
    aio::{ConnectionManager, ConnectionManagerConfig, MultiplexedConnection},
};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clients::queue::{DurableQueue, SyncCheckpoint},
    error::QueueError,
    models::queue::{DeadLetterEntry, DequeueToken, QueueEntry},
};

const CONNECT_RETRIES: usize = 2;

/// Swaps the bare entry that `BLMOVE` parked in the processing list for a
/// delivery-scoped token and starts its lease. Returns 0 when the entry was
/// reclaimed in between.
const CLAIM_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
    return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('RPUSH', KEYS[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
return 1
"#;

/// Drops `ARGV[1]` from the processing list and its lease, then appends
/// `ARGV[2]` to `KEYS[3]` when given. Nothing moves unless the member was
/// still there.
const RELEASE_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
    return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
if KEYS[3] then
    redis.call('RPUSH', KEYS[3], ARGV[2])
end
return 1
"#;

#[derive(Debug, Clone)]
struct QueueKeys {
    main: String,
    processing: String,
    leases: String,
    dead_letter: String,
    last_sync: String,
}

impl QueueKeys {
    fn new(prefix: &str) -> Self {
        Self {
            main: format!("{}:main", prefix),
            processing: format!("{}:processing", prefix),
            leases: format!("{}:leases", prefix),
            dead_letter: format!("{}:dead_letter", prefix),
            last_sync: format!("{}:reconciliation:last_sync", prefix),
        }
    }
}

/// Processing-list members are `<delivery id>|<entry json>` once claimed, or
/// the bare entry json between `BLMOVE` and the claim.
fn entry_payload(member: &str) -> &str {
    if member.starts_with('{') {
        return member;
    }
    member.split_once('|').map_or(member, |(_, raw)| raw)
}

fn delivery_token(raw: &str) -> String {
    format!("{}|{}", Uuid::new_v4().simple(), raw)
}

struct BlockingConnection {
    window: Duration,
    connection: MultiplexedConnection,
}

/// Redis-backed queue.
///
/// Entries are JSON strings on `<prefix>:main`. `pop_blocking` moves the head
/// into `<prefix>:processing` with `BLMOVE`, then rewrites it as a token unique
/// to this delivery and records the lease deadline in `<prefix>:leases`.
///
/// Nothing touches the network until the first command, and the shared
/// connection re-establishes itself after a broker restart.
pub struct RedisQueue {
    client: Client,
    manager: OnceCell<ConnectionManager>,
    blocking_connections: Mutex<Vec<BlockingConnection>>,
    keys: QueueKeys,
    visibility_timeout: Duration,
    response_timeout: Duration,
    claim: Script,
    release: Script,
}

impl RedisQueue {
    pub fn new(
        redis_url: &str,
        prefix: &str,
        visibility_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = Client::open(redis_url)
            .map_err(|e| QueueError::QueueUnavailable(format!("invalid redis url: {}", e)))?;

        info!(prefix, "Redis queue configured; connecting on first use");

        Ok(Self {
            client,
            manager: OnceCell::new(),
            blocking_connections: Mutex::new(Vec::new()),
            keys: QueueKeys::new(prefix),
            visibility_timeout,
            response_timeout,
            claim: Script::new(CLAIM_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, QueueError> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                let config = ConnectionManagerConfig::new()
                    .set_connection_timeout(self.response_timeout)
                    .set_response_timeout(self.response_timeout)
                    .set_number_of_retries(CONNECT_RETRIES);

                let manager =
                    ConnectionManager::new_with_config(self.client.clone(), config).await?;
                info!("Redis queue connection established");
                Ok::<_, redis::RedisError>(manager)
            })
            .await?;

        Ok(manager.clone())
    }

    fn lease_deadline_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.visibility_timeout.as_millis() as i64
    }

    /// A blocking pop holds its connection for the whole wait, so each
    /// concurrent pop gets a connection of its own whose response timeout
    /// covers the wait.
    async fn blocking_connection(&self, wait: Duration) -> Result<BlockingConnection, QueueError> {
        let window = wait + self.response_timeout;

        {
            let mut pool = self.blocking_connections.lock().await;
            if let Some(index) = pool.iter().position(|c| c.window >= window) {
                return Ok(pool.swap_remove(index));
            }
        }

        debug!(?window, "Opening dedicated connection for blocking pops");
        let config = AsyncConnectionConfig::new()
            .set_connection_timeout(self.response_timeout)
            .set_response_timeout(window);
        let connection = self
            .client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        Ok(BlockingConnection { window, connection })
    }

    async fn release_member(
        &self,
        member: &str,
        destination: Option<(&str, &str)>,
    ) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;

        let mut invocation = self.release.prepare_invoke();
        invocation
            .key(&self.keys.processing)
            .key(&self.keys.leases)
            .arg(member);
        if let Some((list, payload)) = destination {
            invocation.key(list).arg(payload);
        }

        let removed: i64 = invocation.invoke_async(&mut conn).await?;
        if removed == 0 {
            warn!("Token no longer owns its entry (visibility window elapsed), release ignored");
        }
        Ok(removed > 0)
    }
}

#[async_trait]
impl DurableQueue for RedisQueue {
    async fn push(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let payload = serde_json::to_string(entry)?;
        let mut conn = self.connection().await?;

        conn.rpush::<_, _, ()>(&self.keys.main, payload).await?;

        debug!(entry_id = %entry.id, queue = %self.keys.main, "Entry pushed");
        Ok(())
    }

    async fn pop_blocking(&self, timeout: Duration) -> Result<Option<QueueEntry>, QueueError> {
        let mut blocking = self.blocking_connection(timeout).await?;

        // A connection that errored is dropped rather than pooled.
        let raw: Option<String> = blocking
            .connection
            .blmove(
                &self.keys.main,
                &self.keys.processing,
                Direction::Left,
                Direction::Right,
                timeout.as_secs_f64(),
            )
            .await?;

        self.blocking_connections.lock().await.push(blocking);

        let Some(raw) = raw else {
            return Ok(None);
        };

        let entry = match serde_json::from_str::<QueueEntry>(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                error!(error = %e, "Undecodable queue entry moved to dead letter list");
                self.release_member(&raw, Some((&self.keys.dead_letter, &raw)))
                    .await?;
                return Ok(None);
            }
        };

        let token = delivery_token(&raw);
        let mut conn = self.connection().await?;
        let claimed: i64 = self
            .claim
            .key(&self.keys.processing)
            .key(&self.keys.leases)
            .arg(&raw)
            .arg(&token)
            .arg(self.lease_deadline_ms())
            .invoke_async(&mut conn)
            .await?;

        if claimed == 0 {
            warn!(entry_id = %entry.id, "Entry was reclaimed before its lease was written");
            return Ok(None);
        }

        Ok(Some(entry.with_token(DequeueToken::new(token))))
    }

    async fn ack(&self, token: &DequeueToken) -> Result<bool, QueueError> {
        self.release_member(token.as_str(), None).await
    }

    async fn requeue(
        &self,
        token: &DequeueToken,
        entry: &QueueEntry,
    ) -> Result<bool, QueueError> {
        let payload = serde_json::to_string(entry)?;
        self.release_member(token.as_str(), Some((&self.keys.main, &payload)))
            .await
    }

    async fn push_dead_letter(
        &self,
        token: &DequeueToken,
        entry: &DeadLetterEntry,
    ) -> Result<bool, QueueError> {
        let payload = serde_json::to_string(entry)?;
        self.release_member(token.as_str(), Some((&self.keys.dead_letter, &payload)))
            .await
    }

    async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let now_ms = Utc::now().timestamp_millis() as f64;
        let owned: Vec<String> = conn.lrange(&self.keys.processing, 0, -1).await?;

        let mut reclaimed = 0;
        for member in owned {
            let deadline: Option<f64> = conn.zscore(&self.keys.leases, &member).await?;

            match deadline {
                // Moved by BLMOVE but never claimed; start its window now.
                None => {
                    redis::cmd("ZADD")
                        .arg(&self.keys.leases)
                        .arg("NX")
                        .arg(self.lease_deadline_ms())
                        .arg(&member)
                        .query_async::<()>(&mut conn)
                        .await?;
                }
                Some(deadline) if deadline <= now_ms => {
                    let payload = entry_payload(&member);
                    if self
                        .release_member(&member, Some((&self.keys.main, payload)))
                        .await?
                    {
                        reclaimed += 1;
                    }
                }
                Some(_) => {}
            }
        }

        if reclaimed > 0 {
            warn!(reclaimed, "Reclaimed entries whose visibility window elapsed");
        }
        Ok(reclaimed)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        Ok(conn.llen(&self.keys.main).await?)
    }

    async fn dead_letter_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        Ok(conn.llen(&self.keys.dead_letter).await?)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;
        let start = -(limit as isize);
        let values: Vec<String> = conn.lrange(&self.keys.dead_letter, start, -1).await?;

        Ok(values
            .into_iter()
            .filter_map(|v| serde_json::from_str::<DeadLetterEntry>(&v).ok())
            .collect())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl SyncCheckpoint for RedisQueue {
    async fn last_sync(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        let mut conn = self.connection().await?;
        let stored: Option<i64> = conn.get(&self.keys.last_sync).await?;
        Ok(stored.and_then(|secs| DateTime::from_timestamp(secs, 0)))
    }

    async fn record_sync(&self, at: DateTime<Utc>) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.set::<_, _, ()>(&self.keys.last_sync, at.timestamp())
            .await?;
        Ok(())
    }
}
