use std::{collections::HashMap, time::Duration};

use dotenvy::dotenv;
use serde::Deserialize;

use crate::{
    error::ConfigError,
    models::{circuit_breaker::CircuitBreakerConfig, retry::RetryConfig},
};

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Redis,
    Memory,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    #[serde(default = "default_queue_backend")]
    pub queue_backend: QueueBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,
    #[serde(default = "default_pop_timeout_seconds")]
    pub pop_timeout_seconds: u64,
    #[serde(default = "default_visibility_timeout_seconds")]
    pub visibility_timeout_seconds: u64,
    #[serde(default = "default_redis_response_timeout_ms")]
    pub redis_response_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub signature_validation_enabled: bool,
    pub partner_id: Option<i64>,
    pub partner_key: Option<String>,
    pub webhook_partner_key: Option<String>,
    pub shop_id: Option<i64>,
    pub access_token: Option<String>,
    #[serde(default = "default_shopee_host_api")]
    pub shopee_host_api: String,

    pub database_url: Option<String>,

    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    #[serde(default = "default_telegram_api_url")]
    pub telegram_api_url: String,
    /// Forum topic per event code, as `code:thread_id` pairs, e.g. `3:12,4:15`.
    pub telegram_topics: Option<String>,

    pub sheets_sync_url: Option<String>,

    #[serde(default = "default_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_circuit_timeout_seconds")]
    pub circuit_breaker_timeout_seconds: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_processing_timeout_seconds")]
    pub processing_timeout_seconds: u64,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_shutdown_drain_seconds")]
    pub shutdown_drain_seconds: u64,

    #[serde(default = "default_true")]
    pub reconciliation_enabled: bool,
    #[serde(default = "default_reconciliation_interval_minutes")]
    pub reconciliation_interval_minutes: u64,
    #[serde(default = "default_reconciliation_overlap_minutes")]
    pub reconciliation_overlap_minutes: u64,
    #[serde(default = "default_reconciliation_full_sync_hours")]
    pub reconciliation_full_sync_hours: u64,
    #[serde(default = "default_reconciliation_history_days")]
    pub reconciliation_history_days: u64,
    #[serde(default = "default_reconciliation_call_delay_ms")]
    pub reconciliation_call_delay_ms: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Guards the operator routes; unset means they answer 503.
    pub dashboard_api_key: Option<String>,
}

fn default_queue_backend() -> QueueBackend {
    QueueBackend::Redis
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_queue_prefix() -> String {
    "shopee:webhooks".to_string()
}
fn default_pop_timeout_seconds() -> u64 {
    5
}
fn default_visibility_timeout_seconds() -> u64 {
    300
}
fn default_redis_response_timeout_ms() -> u64 {
    2000
}
fn default_true() -> bool {
    true
}
fn default_shopee_host_api() -> String {
    "https://partner.shopeemobile.com".to_string()
}
fn default_telegram_api_url() -> String {
    "https://api.telegram.org".to_string()
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_circuit_timeout_seconds() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_retry_delay_ms() -> u64 {
    1000
}
fn default_max_retry_delay_ms() -> u64 {
    8000
}
fn default_backoff_multiplier() -> u64 {
    2
}
fn default_worker_concurrency() -> usize {
    3
}
fn default_processing_timeout_seconds() -> u64 {
    60
}
fn default_request_timeout_seconds() -> u64 {
    15
}
fn default_shutdown_drain_seconds() -> u64 {
    30
}
fn default_reconciliation_interval_minutes() -> u64 {
    60
}
fn default_reconciliation_overlap_minutes() -> u64 {
    120
}
fn default_reconciliation_full_sync_hours() -> u64 {
    24
}
fn default_reconciliation_history_days() -> u64 {
    7
}
fn default_reconciliation_call_delay_ms() -> u64 {
    200
}
fn default_server_port() -> u16 {
    8000
}

/// Shopee partner credentials after validation.
#[derive(Clone, Debug)]
pub struct PartnerCredentials {
    pub partner_id: i64,
    pub partner_key: String,
    pub shop_id: i64,
    pub access_token: String,
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub workers: usize,
    pub max_retries: u32,
    pub pop_timeout: Duration,
    pub processing_timeout: Duration,
    pub visibility_timeout: Duration,
    pub retry: RetryConfig,
}

#[derive(Clone, Debug)]
pub struct ReconciliationConfig {
    pub interval: Duration,
    pub overlap: Duration,
    pub full_sync_every: Duration,
    pub history: Duration,
    pub call_delay: Duration,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        dotenv().ok();

        let config = envy::from_env::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the process must not serve traffic with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signature_validation_enabled
            && self.partner_key.is_none()
            && self.webhook_partner_key.is_none()
        {
            return Err(ConfigError::MissingCredential(
                "PARTNER_KEY or WEBHOOK_PARTNER_KEY",
            ));
        }

        self.partner_credentials()?;

        if self.database_url.is_none() {
            return Err(ConfigError::MissingCredential("DATABASE_URL"));
        }

        if self.telegram_bot_token.is_some() && self.telegram_chat_id.is_none() {
            return Err(ConfigError::MissingCredential("TELEGRAM_CHAT_ID"));
        }

        if self.worker_concurrency == 0 {
            return Err(ConfigError::Invalid {
                name: "WORKER_CONCURRENCY",
                reason: "must be at least 1".to_string(),
            });
        }

        if self.circuit_breaker_failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                name: "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                reason: "must be at least 1".to_string(),
            });
        }

        let hold = self.worst_case_hold();
        if Duration::from_secs(self.visibility_timeout_seconds) <= hold {
            return Err(ConfigError::Invalid {
                name: "VISIBILITY_TIMEOUT_SECONDS",
                reason: format!(
                    "must exceed {}s, the longest one worker can hold an entry",
                    hold.as_secs_f64().ceil() as u64
                ),
            });
        }

        if self.reconciliation_enabled && self.reconciliation_interval_minutes == 0 {
            return Err(ConfigError::Invalid {
                name: "RECONCILIATION_INTERVAL_MINUTES",
                reason: "must be at least 1".to_string(),
            });
        }

        self.telegram_topics()?;

        Ok(())
    }

    /// Longest a worker can own one entry: the processing timeout, the backoff
    /// before a re-push, then every bookkeeping attempt against the queue.
    pub fn worst_case_hold(&self) -> Duration {
        let backoff = Duration::from_millis(self.max_retry_delay_ms + self.max_retry_delay_ms / 10);
        let bookkeeping =
            (backoff + self.redis_response_timeout()) * self.retry_config().max_attempts;
        Duration::from_secs(self.processing_timeout_seconds) + backoff + bookkeeping
    }

    pub fn redis_response_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_response_timeout_ms)
    }

    pub fn telegram_topics(&self) -> Result<HashMap<i64, i64>, ConfigError> {
        let Some(raw) = self.telegram_topics.as_deref() else {
            return Ok(HashMap::new());
        };

        raw.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let parsed = pair
                    .split_once(':')
                    .and_then(|(code, thread)| {
                        Some((code.trim().parse().ok()?, thread.trim().parse().ok()?))
                    });
                parsed.ok_or_else(|| ConfigError::Invalid {
                    name: "TELEGRAM_TOPICS",
                    reason: format!("expected code:thread_id, got {:?}", pair),
                })
            })
            .collect()
    }

    pub fn reconciliation_config(&self) -> ReconciliationConfig {
        ReconciliationConfig {
            interval: Duration::from_secs(self.reconciliation_interval_minutes.max(1) * 60),
            overlap: Duration::from_secs(self.reconciliation_overlap_minutes * 60),
            full_sync_every: Duration::from_secs(self.reconciliation_full_sync_hours.max(1) * 3600),
            history: Duration::from_secs(self.reconciliation_history_days * 86_400),
            call_delay: Duration::from_millis(self.reconciliation_call_delay_ms),
        }
    }

    pub fn partner_credentials(&self) -> Result<PartnerCredentials, ConfigError> {
        Ok(PartnerCredentials {
            partner_id: self
                .partner_id
                .ok_or(ConfigError::MissingCredential("PARTNER_ID"))?,
            partner_key: self
                .partner_key
                .clone()
                .ok_or(ConfigError::MissingCredential("PARTNER_KEY"))?,
            shop_id: self.shop_id.ok_or(ConfigError::MissingCredential("SHOP_ID"))?,
            access_token: self
                .access_token
                .clone()
                .ok_or(ConfigError::MissingCredential("ACCESS_TOKEN"))?,
        })
    }

    /// Backoff for queue bookkeeping calls and the delay before a failed entry is re-pushed.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retries.max(1),
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            cool_down: Duration::from_secs(self.circuit_breaker_timeout_seconds),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.worker_concurrency,
            max_retries: self.max_retries,
            pop_timeout: Duration::from_secs(self.pop_timeout_seconds.max(1)),
            processing_timeout: Duration::from_secs(self.processing_timeout_seconds),
            visibility_timeout: Duration::from_secs(self.visibility_timeout_seconds),
            retry: self.retry_config(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}
