use thiserror::Error;

/// Rejection of an inbound webhook by the signature validator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("webhook signature mismatch")]
    SignatureMismatch,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("queue entry could not be encoded: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::QueueUnavailable(err.to_string())
    }
}

/// Outcome of a publish attempt that did not reach the queue successfully.
#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit breaker is open")]
    Open,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("order {0} not found")]
    NotFound(String),

    #[error("partner API rejected credentials")]
    Unauthorized,

    #[error("partner API request timed out")]
    Timeout,

    #[error("partner API error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Other(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("sink request timed out")]
    Timeout,

    #[error("sink rejected request: {0}")]
    Rejected(String),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SinkError::Timeout
        } else {
            SinkError::Unavailable(err.to_string())
        }
    }
}

impl From<tokio_postgres::Error> for SinkError {
    fn from(err: tokio_postgres::Error) -> Self {
        SinkError::Unavailable(err.to_string())
    }
}

/// Failure of an event as a whole. Retried by the worker pool, then dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    #[error("event payload is not a push envelope: {0}")]
    Malformed(String),

    #[error("order event carries no order identifier")]
    MissingOrderId,

    #[error("order fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("required sinks failed: {0}")]
    Sinks(String),

    #[error("processing timed out after {0}s")]
    Timeout(u64),
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("malformed webhook payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}

/// Fatal configuration problems. The process refuses to serve traffic.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid or missing environment variable: {0}")]
    Environment(#[from] envy::Error),

    #[error("missing required credential: {0}")]
    MissingCredential(&'static str),

    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}
