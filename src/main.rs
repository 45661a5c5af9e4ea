use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use webhook_pipeline::{
    api::{AppState, run_api_server},
    clients::{
        circuit_breaker::CircuitBreaker, database::PostgresOrderStore, health::HealthChecker,
        memory_queue::InMemoryQueue,
        queue::{DurableQueue, SyncCheckpoint},
        redis_queue::RedisQueue,
        sheets::SheetSyncClient, shopee::ShopeeClient, telegram::TelegramNotifier,
    },
    config::{Config, QueueBackend},
    error::ConfigError,
    models::validation::SignatureValidator,
    services::{
        processor::EventProcessor,
        producer::Producer,
        reconciliation::{ReconciliationScheduler, Reconciler},
        sinks::OrderStore,
        stats::StatsRegistry,
        worker::WorkerPool,
    },
};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_target(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();

    let config = Config::load().inspect_err(|e| {
        error!(error = %e, "Fatal configuration error, refusing to start");
    })?;
    let pool_config = config.pool_config();

    let (queue, checkpoint): (Arc<dyn DurableQueue>, Arc<dyn SyncCheckpoint>) =
        match config.queue_backend {
            QueueBackend::Redis => {
                let redis = Arc::new(RedisQueue::new(
                    &config.redis_url,
                    &config.queue_prefix,
                    pool_config.visibility_timeout,
                    config.redis_response_timeout(),
                )?);
                if let Err(e) = redis.ping().await {
                    warn!(error = %e, "Redis not reachable yet; webhooks are shed until it is");
                }
                (redis.clone(), redis)
            }
            QueueBackend::Memory => {
                warn!("Using in-memory queue; queued webhooks are lost on restart");
                let memory = Arc::new(InMemoryQueue::new(pool_config.visibility_timeout));
                (memory.clone(), memory)
            }
        };

    let shopee = Arc::new(ShopeeClient::new(
        &config.shopee_host_api,
        config.partner_credentials()?,
        config.request_timeout(),
    )?);

    let database_url = config
        .database_url
        .as_deref()
        .ok_or(ConfigError::MissingCredential("DATABASE_URL"))?;
    let store = Arc::new(PostgresOrderStore::new(database_url));
    if let Err(e) = store.health_check().await {
        warn!(error = %e, "PostgreSQL not reachable yet; will reconnect on first use");
    }

    let mut processor = EventProcessor::new(shopee.clone(), store.clone());

    match (&config.telegram_bot_token, &config.telegram_chat_id) {
        (Some(token), Some(chat_id)) => {
            processor = processor.with_notifier(Arc::new(TelegramNotifier::new(
                &config.telegram_api_url,
                token.clone(),
                chat_id.clone(),
                config.request_timeout(),
                config.retry_config(),
            )?
            .with_topics(config.telegram_topics()?)));
        }
        _ => info!("Telegram notifications disabled (no credentials)"),
    }

    match &config.sheets_sync_url {
        Some(url) => {
            processor = processor.with_sheet_sync(Arc::new(SheetSyncClient::new(
                url,
                config.request_timeout(),
                config.retry_config(),
            )?));
        }
        None => info!("Spreadsheet sync disabled (no SHEETS_SYNC_URL)"),
    }

    let processor = Arc::new(processor);
    let stats = Arc::new(StatsRegistry::new());
    let breaker = Arc::new(CircuitBreaker::new("queue", config.circuit_breaker_config()));

    let mut validator = SignatureValidator::new(config.signature_validation_enabled);
    if let Some(key) = &config.partner_key {
        validator = validator.with_secret("partner_key", key);
    }
    if let Some(key) = &config.webhook_partner_key {
        validator = validator.with_secret("webhook_partner_key", key);
    }

    let reconciler = config.reconciliation_enabled.then(|| {
        Arc::new(Reconciler::new(
            shopee.clone(),
            processor.clone(),
            checkpoint,
            config.reconciliation_config(),
        ))
    });
    if reconciler.is_none() {
        info!("Order reconciliation disabled");
    }
    let scheduler = reconciler.clone().map(ReconciliationScheduler::start);

    let pool = WorkerPool::start(
        queue.clone(),
        processor.clone(),
        stats.clone(),
        pool_config.clone(),
    );

    let state = Arc::new(AppState {
        producer: Producer::new(
            validator,
            breaker.clone(),
            queue.clone(),
            processor,
            stats.clone(),
            pool_config.processing_timeout,
        ),
        queue: queue.clone(),
        breaker: breaker.clone(),
        stats,
        health_checker: HealthChecker::new(queue, store, breaker),
        api_key: config.dashboard_api_key.clone(),
        reconciler,
    });
    if state.api_key.is_none() {
        warn!("DASHBOARD_API_KEY unset; operator routes answer 503");
    }

    let served = run_api_server(state, config.server_port, shutdown_signal()).await;

    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }

    pool.shutdown(Duration::from_secs(config.shutdown_drain_seconds))
        .await;

    served?;
    info!("Shutdown complete");
    Ok(())
}
