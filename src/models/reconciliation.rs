use chrono::{DateTime, Utc};
use serde::Serialize;

/// What triggered a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Startup,
    Scheduled,
    Full,
    Manual,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub kind: SyncKind,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub time_from: DateTime<Utc>,
    pub time_to: DateTime<Utc>,
    pub orders_fetched: usize,
    pub orders_processed: usize,
    pub orders_skipped: usize,
    pub errors: Vec<String>,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub last_sync: Option<DateTime<Utc>>,
    pub sync_in_progress: bool,
    /// Newest first.
    pub history: Vec<SyncResult>,
}
