use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};

use crate::{
    clients::queue::DurableQueue,
    config::PoolConfig,
    error::ProcessingError,
    models::queue::{DeadLetterEntry, DequeueToken, QueueEntry},
    services::{
        processor::EventProcessor,
        stats::{StatsRegistry, WorkerStats},
    },
    utils::{jittered, retry_with_backoff},
};

/// Pause after the queue itself errors on pop, so a dead broker is not hammered.
const POP_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct WorkerContext {
    queue: Arc<dyn DurableQueue>,
    processor: Arc<EventProcessor>,
    stats: Arc<StatsRegistry>,
    config: PoolConfig,
}

/// Fixed set of queue consumers plus the visibility reaper.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    reaper: JoinHandle<()>,
}

impl WorkerPool {
    pub fn start(
        queue: Arc<dyn DurableQueue>,
        processor: Arc<EventProcessor>,
        stats: Arc<StatsRegistry>,
        config: PoolConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let ctx = WorkerContext {
            queue,
            processor,
            stats,
            config,
        };

        info!(
            workers = ctx.config.workers,
            max_retries = ctx.config.max_retries,
            "Starting worker pool"
        );

        let workers = (1..=ctx.config.workers)
            .map(|worker_id| {
                let worker_stats = ctx.stats.register_worker(worker_id);
                tokio::spawn(worker_loop(
                    worker_id,
                    ctx.clone(),
                    worker_stats,
                    shutdown.subscribe(),
                ))
            })
            .collect();

        let reaper = tokio::spawn(reaper_loop(ctx.clone(), shutdown.subscribe()));

        Self {
            shutdown,
            workers,
            reaper,
        }
    }

    /// Stops popping, lets in-flight entries finish, and waits up to `drain`.
    /// Returns `false` if some worker was still busy when the window closed.
    pub async fn shutdown(self, drain: Duration) -> bool {
        info!(drain_seconds = drain.as_secs(), "Worker pool shutting down");
        let _ = self.shutdown.send(true);

        let joined = tokio::time::timeout(drain, async {
            for result in join_all(self.workers).await {
                if let Err(e) = result {
                    error!(error = %e, "Worker task ended abnormally");
                }
            }
        })
        .await;

        self.reaper.abort();

        match joined {
            Ok(()) => {
                info!("Worker pool drained");
                true
            }
            Err(_) => {
                warn!("Drain window elapsed with entries still in flight; they will be redelivered");
                false
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    ctx: WorkerContext,
    worker_stats: Arc<WorkerStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(worker_id, "Worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let popped = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            popped = ctx.queue.pop_blocking(ctx.config.pop_timeout) => popped,
        };

        match popped {
            Ok(Some(entry)) => {
                handle_entry(worker_id, &ctx, &worker_stats, entry, &mut shutdown).await;
            }
            Ok(None) => continue,
            Err(e) => {
                error!(worker_id, error = %e, "Queue pop failed");
                tokio::select! {
                    _ = tokio::time::sleep(POP_ERROR_BACKOFF) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    worker_stats.stopped();
    info!(worker_id, "Worker stopped");
}

async fn handle_entry(
    worker_id: usize,
    ctx: &WorkerContext,
    worker_stats: &WorkerStats,
    entry: QueueEntry,
    shutdown: &mut watch::Receiver<bool>,
) {
    let Some(token) = entry.dequeue_token.clone() else {
        error!(worker_id, entry_id = %entry.id, "Dequeued entry carries no ownership token");
        return;
    };

    debug!(
        worker_id,
        entry_id = %entry.id,
        attempt = entry.attempt_count,
        "Processing entry"
    );

    worker_stats.begin(&entry.id);
    let started = Instant::now();
    let result = ctx
        .processor
        .process_with_timeout(&entry.event, ctx.config.processing_timeout)
        .await;
    worker_stats.finish(started.elapsed());

    match result {
        Ok(_) => {
            match retry_with_backoff(&ctx.config.retry, || ctx.queue.ack(&token)).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(worker_id, entry_id = %entry.id, "Entry was reclaimed before ack; another delivery owns it");
                }
                Err(e) => {
                    error!(worker_id, entry_id = %entry.id, error = %e, "Ack failed; entry will be redelivered");
                }
            }
            ctx.stats.record_processed(worker_stats);
            info!(
                worker_id,
                entry_id = %entry.id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Entry processed"
            );
        }
        Err(e) => fail_entry(worker_id, ctx, worker_stats, entry, token, e, shutdown).await,
    }
}

async fn fail_entry(
    worker_id: usize,
    ctx: &WorkerContext,
    worker_stats: &WorkerStats,
    entry: QueueEntry,
    token: DequeueToken,
    cause: ProcessingError,
    shutdown: &mut watch::Receiver<bool>,
) {
    let next = entry.next_attempt();

    if next.attempt_count <= ctx.config.max_retries {
        let delay = jittered(ctx.config.retry.delay_for(next.attempt_count));
        warn!(
            worker_id,
            entry_id = %entry.id,
            attempt = next.attempt_count,
            max_retries = ctx.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %cause,
            "Processing failed, requeueing"
        );

        // Shutdown cuts the backoff short; the entry is requeued either way.
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }

        match retry_with_backoff(&ctx.config.retry, || ctx.queue.requeue(&token, &next)).await {
            Ok(true) => ctx.stats.record_retried(worker_stats),
            Ok(false) => {
                warn!(worker_id, entry_id = %entry.id, "Entry was reclaimed before requeue; another delivery owns it");
            }
            Err(e) => {
                error!(worker_id, entry_id = %entry.id, error = %e, "Requeue failed; entry will be redelivered");
            }
        }
        return;
    }

    error!(
        worker_id,
        entry_id = %entry.id,
        attempts = next.attempt_count,
        error = %cause,
        "Retries exhausted, dead-lettering entry"
    );

    let dead = DeadLetterEntry::new(next, cause.to_string(), Some(worker_id));
    match retry_with_backoff(&ctx.config.retry, || ctx.queue.push_dead_letter(&token, &dead)).await {
        Ok(true) => ctx.stats.record_failed(worker_stats),
        Ok(false) => {
            warn!(worker_id, entry_id = %entry.id, "Entry was reclaimed before dead-lettering; another delivery owns it");
        }
        Err(e) => {
            error!(worker_id, entry_id = %entry.id, error = %e, "Dead-lettering failed; entry will be redelivered");
        }
    }
}

async fn reaper_loop(ctx: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    let period = ctx.config.visibility_timeout.max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        match ctx.queue.reclaim_expired().await {
            Ok(0) => {}
            Ok(reclaimed) => info!(reclaimed, "Reclaimed expired entries"),
            Err(e) => warn!(error = %e, "Visibility reaper failed"),
        }
    }

    debug!("Visibility reaper stopped");
}
