use std::{sync::Arc, time::Duration};

use anyhow::Result;
use webhook_pipeline::{
    clients::{circuit_breaker::CircuitBreaker, memory_queue::InMemoryQueue, queue::DurableQueue},
    error::ProcessingError,
    models::{
        circuit_breaker::CircuitBreakerConfig,
        event::{ORDER_STATUS_UPDATE, ORDER_TRACKING_UPDATE, WebhookEvent},
        report::{SinkKind, SinkOutcome},
        validation::SignatureValidator,
    },
    services::{
        producer::{DispatchOutcome, Producer},
        stats::StatsRegistry,
        worker::WorkerPool,
    },
};

use crate::common::{
    MockFetcher, SECRET, Sinks, fast_pool_config, sample_order, sign, wait_until, webhook_body,
};

/// Test: A code-3 webhook flows from the producer through a worker to every sink,
/// and delivering it again leaves the stored state unchanged
#[tokio::test]
async fn test_order_status_event_end_to_end_with_repeat() -> Result<()> {
    let queue = Arc::new(InMemoryQueue::default());
    let sinks = Sinks::new(
        MockFetcher::default().with_order(sample_order("2601033YS140TT", "READY_TO_SHIP")),
    );
    let stats = Arc::new(StatsRegistry::new());
    let processor = sinks.processor();

    let producer = Producer::new(
        SignatureValidator::new(true).with_secret("partner_key", SECRET),
        Arc::new(CircuitBreaker::new("queue", CircuitBreakerConfig::default())),
        queue.clone(),
        processor.clone(),
        stats.clone(),
        Duration::from_secs(5),
    );
    let pool = WorkerPool::start(queue.clone(), processor, stats.clone(), fast_pool_config(2, 3));

    let body = webhook_body(ORDER_STATUS_UPDATE, "2601033YS140TT", "READY_TO_SHIP");
    let signature = sign(&body);

    for expected in 1..=2u64 {
        let outcome = producer.handle(&body, Some(&signature)).await?;
        assert!(matches!(outcome, DispatchOutcome::Enqueued { .. }));

        let done = wait_until(Duration::from_secs(5), || {
            let stats = stats.clone();
            async move { stats.totals().processed == expected }
        })
        .await;
        assert!(done, "delivery {expected} was not processed");

        assert_eq!(sinks.store.row_count(), 2);
        assert_eq!(sinks.sheet.row_count(), 2);
    }

    pool.shutdown(Duration::from_secs(5)).await;

    let rows = sinks.store.rows.lock().unwrap();
    let mug = &rows[&("2601033YS140TT".to_string(), "MUG-BLUE".to_string())];
    assert_eq!(mug.quantity, 2);
    assert_eq!(mug.total_sale, 20.0);
    assert_eq!(mug.status, "READY_TO_SHIP");
    assert!(rows.contains_key(&("2601033YS140TT".to_string(), "NO_SKU_Coaster".to_string())));
    drop(rows);

    assert_eq!(sinks.store.upserts.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_eq!(sinks.notifier.count(), 2, "duplicate notifications are tolerated");
    assert_eq!(sinks.fetcher.calls_for("2601033YS140TT"), 2);
    assert_eq!(queue.depth().await?, 0);
    assert_eq!(queue.dead_letter_depth().await?, 0);

    Ok(())
}

/// Test: Orders in an ignored status are stored but not mirrored to the sheet
#[tokio::test]
async fn test_unpaid_order_skips_spreadsheet() -> Result<()> {
    let sinks = Sinks::new(MockFetcher::default().with_order(sample_order("UNPAID1", "UNPAID")));
    let event = WebhookEvent::from_raw(&webhook_body(ORDER_STATUS_UPDATE, "UNPAID1", "UNPAID"), vec![])?;

    let report = sinks.processor().process(&event).await?;

    assert_eq!(report.category, "order");
    assert_eq!(report.outcome(SinkKind::Storage), Some(&SinkOutcome::Applied));
    assert!(matches!(
        report.outcome(SinkKind::Spreadsheet),
        Some(SinkOutcome::Skipped(_))
    ));
    assert_eq!(sinks.sheet.row_count(), 0);
    assert_eq!(sinks.store.row_count(), 2);

    Ok(())
}

/// Test: Storage failure fails an order event even when the other sinks succeed
#[tokio::test]
async fn test_storage_failure_fails_the_event() -> Result<()> {
    let sinks = Sinks::new(MockFetcher::default().answering_everything("SHIPPED"));
    sinks
        .store
        .failing
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let event = WebhookEvent::from_raw(&webhook_body(ORDER_TRACKING_UPDATE, "T1", "SHIPPED"), vec![])?;

    let result = sinks.processor().process(&event).await;

    let Err(ProcessingError::Sinks(reason)) = result else {
        panic!("expected a sink failure");
    };
    assert!(reason.contains("storage"));
    assert_eq!(sinks.sheet.row_count(), 2, "independent sinks still ran");
    assert_eq!(sinks.notifier.count(), 1);

    Ok(())
}

/// Test: An order event without an order number cannot be processed
#[tokio::test]
async fn test_order_event_without_order_number_fails() -> Result<()> {
    let sinks = Sinks::new(MockFetcher::default().answering_everything("SHIPPED"));
    let event = WebhookEvent::from_raw(
        br#"{"code":3,"shop_id":1,"data":{"status":"SHIPPED"}}"#,
        vec![],
    )?;

    let result = sinks.processor().process(&event).await;

    assert_eq!(result.unwrap_err(), ProcessingError::MissingOrderId);
    assert_eq!(sinks.fetcher.total_calls(), 0);

    Ok(())
}

/// Test: Codes without a configured handler only notify
#[tokio::test]
async fn test_unconfigured_code_uses_basic_handler() -> Result<()> {
    let sinks = Sinks::new(MockFetcher::default());
    let event = WebhookEvent::from_raw(
        br#"{"code":8,"shop_id":1,"data":{"item_id":100,"variation_id":2}}"#,
        vec![],
    )?;

    let report = sinks.processor().process(&event).await?;

    assert_eq!(report.category, "basic");
    assert_eq!(report.outcome(SinkKind::Notifier), Some(&SinkOutcome::Applied));
    assert!(report.outcome(SinkKind::Storage).is_none());
    assert_eq!(sinks.fetcher.total_calls(), 0);
    assert_eq!(sinks.notifier.sent.lock().unwrap()[0], (8, None));

    Ok(())
}
