use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Busy,
    Stopped,
}

impl WorkerState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Busy,
            2 => WorkerState::Stopped,
            _ => WorkerState::Idle,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            WorkerState::Idle => 0,
            WorkerState::Busy => 1,
            WorkerState::Stopped => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatsSnapshot {
    pub worker_id: usize,
    pub state: WorkerState,
    pub processed_count: u64,
    pub failed_count: u64,
    pub retried_count: u64,
    pub avg_processing_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_entry: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineTotals {
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub fallback_dispatched: u64,
    pub fallback_failed: u64,
    pub signature_rejected: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub totals: PipelineTotals,
    pub workers: Vec<WorkerStatsSnapshot>,
}
