use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::{
    sync::{Mutex as AsyncMutex, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{debug, error, info, warn};

use crate::{
    clients::queue::SyncCheckpoint,
    config::ReconciliationConfig,
    models::reconciliation::{SyncKind, SyncResult, SyncStatus},
    services::{
        processor::{EventProcessor, IGNORE_STATUSES},
        sinks::OrderLister,
    },
};

const HISTORY_LEN: usize = 10;
const HISTORY_ERRORS: usize = 5;
const MANUAL_MAX_LOOKBACK: TimeDelta = TimeDelta::days(30);

/// Recorded as the only error of a pass refused because another is running.
pub const SYNC_IN_PROGRESS: &str = "sync already in progress";

fn before(now: DateTime<Utc>, duration: std::time::Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Catches up on orders whose pushes never arrived by listing recently
/// updated orders and running each through the normal delivery path.
pub struct Reconciler {
    lister: Arc<dyn OrderLister>,
    processor: Arc<EventProcessor>,
    checkpoint: Arc<dyn SyncCheckpoint>,
    config: ReconciliationConfig,
    running: AsyncMutex<()>,
    history: Mutex<VecDeque<SyncResult>>,
}

impl Reconciler {
    pub fn new(
        lister: Arc<dyn OrderLister>,
        processor: Arc<EventProcessor>,
        checkpoint: Arc<dyn SyncCheckpoint>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            lister,
            processor,
            checkpoint,
            config,
            running: AsyncMutex::new(()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
        }
    }

    /// From the last successful sync, or the full history window on first run.
    pub async fn startup_catchup(&self) -> SyncResult {
        let now = Utc::now();
        let from = match self.checkpoint.last_sync().await {
            Ok(Some(last)) => {
                info!(last_sync = %last, "Catching up since last reconciliation");
                last
            }
            Ok(None) => {
                info!("No previous reconciliation recorded, syncing full history window");
                before(now, self.config.history)
            }
            Err(e) => {
                warn!(error = %e, "Could not read reconciliation checkpoint, syncing full history window");
                before(now, self.config.history)
            }
        };

        self.sync_range(SyncKind::Startup, from, now).await
    }

    pub async fn scheduled_sync(&self) -> SyncResult {
        let now = Utc::now();
        self.sync_range(SyncKind::Scheduled, before(now, self.config.overlap), now)
            .await
    }

    pub async fn full_sync(&self) -> SyncResult {
        let now = Utc::now();
        self.sync_range(SyncKind::Full, before(now, self.config.history), now)
            .await
    }

    /// Operator-chosen window, clamped to the last 30 days and to now.
    pub async fn manual_sync(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> SyncResult {
        let now = Utc::now();
        let to = to.min(now);
        let from = from.max(now - MANUAL_MAX_LOOKBACK);

        self.sync_range(SyncKind::Manual, from, to).await
    }

    async fn periodic(&self, kind: SyncKind) -> SyncResult {
        match kind {
            SyncKind::Full => self.full_sync().await,
            _ => self.scheduled_sync().await,
        }
    }

    pub async fn status(&self) -> SyncStatus {
        let last_sync = self.checkpoint.last_sync().await.unwrap_or_else(|e| {
            warn!(error = %e, "Could not read reconciliation checkpoint");
            None
        });

        SyncStatus {
            last_sync,
            sync_in_progress: self.running.try_lock().is_err(),
            history: self.history_snapshot().into(),
        }
    }

    fn history_snapshot(&self) -> VecDeque<SyncResult> {
        match self.history.lock() {
            Ok(history) => history.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn sync_range(
        &self,
        kind: SyncKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SyncResult {
        let started_at = Utc::now();
        let mut result = SyncResult {
            kind,
            started_at,
            completed_at: started_at,
            time_from: from,
            time_to: to,
            orders_fetched: 0,
            orders_processed: 0,
            orders_skipped: 0,
            errors: Vec::new(),
            success: false,
        };

        let Ok(_running) = self.running.try_lock() else {
            warn!(?kind, "Reconciliation already in progress, skipping");
            result.errors.push(SYNC_IN_PROGRESS.to_string());
            return result;
        };

        info!(?kind, from = %from, to = %to, "Reconciliation started");

        match self.lister.list_updated_orders(from, to).await {
            Ok(orders) => {
                result.orders_fetched = orders.len();
                let mut first_fetch = true;

                for summary in &orders {
                    if IGNORE_STATUSES.contains(&summary.order_status.as_str()) {
                        debug!(order_sn = %summary.order_sn, status = %summary.order_status, "Skipping ignored status");
                        result.orders_skipped += 1;
                        continue;
                    }

                    if !first_fetch && !self.config.call_delay.is_zero() {
                        tokio::time::sleep(self.config.call_delay).await;
                    }
                    first_fetch = false;

                    match self.processor.reconcile_order(&summary.order_sn).await {
                        Ok(_) => result.orders_processed += 1,
                        Err(e) => {
                            warn!(order_sn = %summary.order_sn, error = %e, "Reconciling order failed");
                            result.errors.push(format!("{}: {}", summary.order_sn, e));
                        }
                    }
                }

                result.success = result.errors.is_empty() || result.orders_processed > 0;
            }
            Err(e) => {
                error!(?kind, error = %e, "Listing updated orders failed");
                result.errors.push(format!("order list failed: {}", e));
            }
        }

        result.completed_at = Utc::now();
        self.record(&result).await;

        info!(
            ?kind,
            fetched = result.orders_fetched,
            processed = result.orders_processed,
            skipped = result.orders_skipped,
            errors = result.errors.len(),
            "Reconciliation finished"
        );
        result
    }

    async fn record(&self, result: &SyncResult) {
        if result.success {
            if let Err(e) = self.checkpoint.record_sync(result.time_to).await {
                warn!(error = %e, "Could not store reconciliation checkpoint");
            }
        }

        let mut entry = result.clone();
        entry.errors.truncate(HISTORY_ERRORS);

        let mut history = match self.history.lock() {
            Ok(history) => history,
            Err(poisoned) => poisoned.into_inner(),
        };
        history.push_front(entry);
        history.truncate(HISTORY_LEN);
    }
}

/// Runs the startup catch-up, then scheduled and full syncs until stopped.
pub struct ReconciliationScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ReconciliationScheduler {
    pub fn start(reconciler: Arc<Reconciler>) -> Self {
        let (shutdown, receiver) = watch::channel(false);

        info!(
            interval_minutes = reconciler.config.interval.as_secs() / 60,
            full_sync_hours = reconciler.config.full_sync_every.as_secs() / 3600,
            "Reconciliation scheduler started"
        );

        let handle = tokio::spawn(schedule_loop(reconciler, receiver));
        Self { shutdown, handle }
    }

    /// Cancels any sync in flight; upserts it already made stay.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Reconciliation scheduler ended abnormally");
        }
        info!("Reconciliation scheduler stopped");
    }
}

async fn schedule_loop(reconciler: Arc<Reconciler>, mut shutdown: watch::Receiver<bool>) {
    tokio::select! {
        biased;
        _ = shutdown.changed() => return,
        result = reconciler.startup_catchup() => log_outcome(&result),
    }

    let interval = reconciler.config.interval;
    let full_every = reconciler.config.full_sync_every;

    let mut scheduled = interval_at(Instant::now() + interval, interval);
    scheduled.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut full = interval_at(Instant::now() + full_every, full_every);
    full.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let kind = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = full.tick() => SyncKind::Full,
            _ = scheduled.tick() => SyncKind::Scheduled,
        };

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = reconciler.periodic(kind) => log_outcome(&result),
        }
    }
}

fn log_outcome(result: &SyncResult) {
    if result.success {
        info!(kind = ?result.kind, processed = result.orders_processed, "Reconciliation pass completed");
    } else {
        warn!(kind = ?result.kind, errors = ?result.errors, "Reconciliation pass had issues");
    }
}
