use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::models::stats::{PipelineTotals, StatsSnapshot, WorkerState, WorkerStatsSnapshot};

/// Counters owned by one worker. Other tasks only read them.
#[derive(Debug)]
pub struct WorkerStats {
    worker_id: usize,
    state: AtomicU8,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    runs: AtomicU64,
    total_processing_ms: AtomicU64,
    last_activity_ms: AtomicI64,
    current_entry: Mutex<Option<String>>,
}

impl WorkerStats {
    fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            state: AtomicU8::new(WorkerState::Idle.as_u8()),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            runs: AtomicU64::new(0),
            total_processing_ms: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(0),
            current_entry: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn set_current(&self, entry_id: Option<String>) {
        let mut current = self
            .current_entry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = entry_id;
    }

    pub fn begin(&self, entry_id: &str) {
        self.state.store(WorkerState::Busy.as_u8(), Ordering::Relaxed);
        self.set_current(Some(entry_id.to_string()));
        self.touch();
    }

    /// Marks the end of one processing run, successful or not.
    pub fn finish(&self, elapsed: Duration) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.total_processing_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.set_current(None);
        self.state.store(WorkerState::Idle.as_u8(), Ordering::Relaxed);
        self.touch();
    }

    pub fn stopped(&self) {
        self.state.store(WorkerState::Stopped.as_u8(), Ordering::Relaxed);
        self.set_current(None);
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        let runs = self.runs.load(Ordering::Relaxed);
        let total_ms = self.total_processing_ms.load(Ordering::Relaxed);
        let last_activity_ms = self.last_activity_ms.load(Ordering::Relaxed);

        WorkerStatsSnapshot {
            worker_id: self.worker_id,
            state: self.state(),
            processed_count: self.processed.load(Ordering::Relaxed),
            failed_count: self.failed.load(Ordering::Relaxed),
            retried_count: self.retried.load(Ordering::Relaxed),
            avg_processing_ms: if runs == 0 { 0 } else { total_ms / runs },
            last_activity_at: (last_activity_ms > 0)
                .then(|| DateTime::from_timestamp_millis(last_activity_ms))
                .flatten(),
            current_entry: self
                .current_entry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }
}

/// Process-wide counters shared by the producer and every worker.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    enqueued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    fallback_dispatched: AtomicU64,
    fallback_failed: AtomicU64,
    signature_rejected: AtomicU64,
    workers: Mutex<Vec<Arc<WorkerStats>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_worker(&self, worker_id: usize) -> Arc<WorkerStats> {
        let stats = Arc::new(WorkerStats::new(worker_id));
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(stats.clone());
        stats
    }

    pub fn record_processed(&self, worker: &WorkerStats) {
        worker.processed.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// A terminal failure: the entry went to the dead-letter list.
    pub fn record_failed(&self, worker: &WorkerStats) {
        worker.failed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self, worker: &WorkerStats) {
        worker.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signature_rejected(&self) {
        self.signature_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self, succeeded: bool) {
        self.fallback_dispatched.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fallback_failed.fetch_add(1, Ordering::Relaxed);
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn totals(&self) -> PipelineTotals {
        PipelineTotals {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            fallback_dispatched: self.fallback_dispatched.load(Ordering::Relaxed),
            fallback_failed: self.fallback_failed.load(Ordering::Relaxed),
            signature_rejected: self.signature_rejected.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut workers: Vec<WorkerStatsSnapshot> = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|w| w.snapshot())
            .collect();
        workers.sort_by_key(|w| w.worker_id);

        StatsSnapshot {
            totals: self.totals(),
            workers,
        }
    }
}
