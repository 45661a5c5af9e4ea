#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{Instant, sleep};
use webhook_pipeline::{
    clients::{memory_queue::InMemoryQueue, queue::DurableQueue},
    config::PoolConfig,
    error::{FetchError, QueueError, SinkError},
    models::{
        event::WebhookEvent,
        order::{Order, OrderItem, OrderSummary, SheetRow},
        queue::{DeadLetterEntry, DequeueToken, QueueEntry},
        retry::RetryConfig,
        validation::compute_signature,
    },
    services::{
        processor::EventProcessor,
        sinks::{Notifier, OrderFetcher, OrderLister, OrderStore, SheetSync},
    },
};

pub const SECRET: &str = "test-partner-key";

pub fn webhook_body(code: i64, order_sn: &str, status: &str) -> Vec<u8> {
    format!(
        r#"{{"code":{code},"shop_id":443972786,"timestamp":1704337899,"data":{{"ordersn":"{order_sn}","status":"{status}","update_time":1704337899}}}}"#
    )
    .into_bytes()
}

pub fn sign(body: &[u8]) -> String {
    hex::encode(compute_signature(body, SECRET.as_bytes()).expect("hmac accepts any key"))
}

pub fn entry(code: i64, order_sn: &str) -> QueueEntry {
    let body = webhook_body(code, order_sn, "READY_TO_SHIP");
    QueueEntry::new(WebhookEvent::from_raw(&body, vec![]).expect("valid envelope"))
}

pub fn sample_order(order_sn: &str, status: &str) -> Order {
    Order {
        order_sn: order_sn.to_string(),
        order_status: status.to_string(),
        create_time: 1_704_337_899,
        shop_id: Some(443_972_786),
        buyer_username: Some("buyer01".to_string()),
        update_time: Some(1_704_337_999),
        total_amount: Some(30.0),
        currency: Some("SGD".to_string()),
        item_list: vec![
            OrderItem {
                item_name: Some("Ceramic Mug".to_string()),
                item_sku: Some("MUG".to_string()),
                model_name: Some("Blue".to_string()),
                model_sku: Some("MUG-BLUE".to_string()),
                model_quantity_purchased: 2,
                model_discounted_price: 10.0,
            },
            OrderItem {
                item_name: Some("Coaster".to_string()),
                item_sku: None,
                model_name: None,
                model_sku: None,
                model_quantity_purchased: 1,
                model_discounted_price: 10.0,
            },
        ],
    }
}

pub fn fast_pool_config(workers: usize, max_retries: u32) -> PoolConfig {
    PoolConfig {
        workers,
        max_retries,
        pop_timeout: Duration::from_millis(50),
        processing_timeout: Duration::from_secs(5),
        visibility_timeout: Duration::from_secs(300),
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2,
        },
    }
}

/// Polls `condition` every few milliseconds until it holds or `limit` elapses.
pub async fn wait_until<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Order source backed by a map. Unknown order numbers fail as `NotFound`;
/// numbers listed in `failing` always fail.
#[derive(Default)]
pub struct MockFetcher {
    orders: Mutex<HashMap<String, Order>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<String, u32>>,
    default_status: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
    listed: Mutex<Vec<OrderSummary>>,
    list_calls: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
    list_failing: AtomicBool,
}

impl MockFetcher {
    pub fn with_order(self, order: Order) -> Self {
        self.orders
            .lock()
            .unwrap()
            .insert(order.order_sn.clone(), order);
        self
    }

    /// Any order number not explicitly registered resolves to a sample order.
    pub fn answering_everything(self, status: &str) -> Self {
        *self.default_status.lock().unwrap() = Some(status.to_string());
        self
    }

    pub fn failing_for(self, order_sn: &str) -> Self {
        self.failing.lock().unwrap().insert(order_sn.to_string());
        self
    }

    /// Every fetch sleeps this long before answering.
    pub fn slowed_by(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    /// Summaries returned by every order listing.
    pub fn listing(self, orders: Vec<OrderSummary>) -> Self {
        *self.listed.lock().unwrap() = orders;
        self
    }

    pub fn fail_listing(&self, failing: bool) {
        self.list_failing.store(failing, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        self.list_calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, order_sn: &str) -> u32 {
        self.calls.lock().unwrap().get(order_sn).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl OrderFetcher for MockFetcher {
    async fn fetch_order(&self, order_sn: &str) -> Result<Order, FetchError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(order_sn.to_string())
            .or_default() += 1;

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            sleep(delay).await;
        }

        if self.failing.lock().unwrap().contains(order_sn) {
            return Err(FetchError::Timeout);
        }
        if let Some(order) = self.orders.lock().unwrap().get(order_sn) {
            return Ok(order.clone());
        }
        match self.default_status.lock().unwrap().as_deref() {
            Some(status) => Ok(sample_order(order_sn, status)),
            None => Err(FetchError::NotFound(order_sn.to_string())),
        }
    }
}

#[async_trait]
impl OrderLister for MockFetcher {
    async fn list_updated_orders(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OrderSummary>, FetchError> {
        self.list_calls.lock().unwrap().push((from, to));
        if self.list_failing.load(Ordering::SeqCst) {
            return Err(FetchError::Unauthorized);
        }
        Ok(self.listed.lock().unwrap().clone())
    }
}

pub fn summary(order_sn: &str, status: &str) -> OrderSummary {
    OrderSummary {
        order_sn: order_sn.to_string(),
        order_status: status.to_string(),
    }
}

/// Upserting store keyed by `(order_id, sku)`.
#[derive(Default)]
pub struct MemoryStore {
    pub rows: Mutex<HashMap<(String, String), SheetRow>>,
    pub upserts: AtomicU32,
    pub failing: AtomicBool,
}

impl MemoryStore {
    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn upsert_order(&self, order: &Order) -> Result<(), SinkError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("database down".to_string()));
        }
        let mut rows = self.rows.lock().unwrap();
        for row in order.rows() {
            rows.insert((row.order_id.clone(), row.sku.clone()), row);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(SinkError::Unavailable("database down".to_string()))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
pub struct MemorySheet {
    pub rows: Mutex<HashMap<(String, String), SheetRow>>,
    pub calls: AtomicU32,
}

impl MemorySheet {
    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl SheetSync for MemorySheet {
    async fn upsert_rows(&self, rows: &[SheetRow]) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut stored = self.rows.lock().unwrap();
        for row in rows {
            stored.insert((row.order_id.clone(), row.sku.clone()), row.clone());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(i64, Option<String>)>>,
    pub failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &WebhookEvent, order: Option<&Order>) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("telegram down".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((event.event_code, order.map(|o| o.order_sn.clone())));
        Ok(())
    }
}

/// In-memory queue whose `push` can be switched off to simulate a broker outage.
pub struct FlakyQueue {
    pub inner: InMemoryQueue,
    pub available: AtomicBool,
    pub push_calls: AtomicU32,
}

impl Default for FlakyQueue {
    fn default() -> Self {
        Self {
            inner: InMemoryQueue::default(),
            available: AtomicBool::new(true),
            push_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl DurableQueue for FlakyQueue {
    async fn push(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(QueueError::QueueUnavailable("connection refused".to_string()));
        }
        self.inner.push(entry).await
    }

    async fn pop_blocking(&self, timeout: Duration) -> Result<Option<QueueEntry>, QueueError> {
        self.inner.pop_blocking(timeout).await
    }

    async fn ack(&self, token: &DequeueToken) -> Result<bool, QueueError> {
        self.inner.ack(token).await
    }

    async fn requeue(&self, token: &DequeueToken, entry: &QueueEntry) -> Result<bool, QueueError> {
        self.inner.requeue(token, entry).await
    }

    async fn push_dead_letter(
        &self,
        token: &DequeueToken,
        entry: &DeadLetterEntry,
    ) -> Result<bool, QueueError> {
        self.inner.push_dead_letter(token, entry).await
    }

    async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        self.inner.reclaim_expired().await
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        self.inner.depth().await
    }

    async fn dead_letter_depth(&self) -> Result<u64, QueueError> {
        self.inner.dead_letter_depth().await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        self.inner.dead_letters(limit).await
    }

    async fn ping(&self) -> Result<(), QueueError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::QueueUnavailable("connection refused".to_string()))
        }
    }
}

/// Sinks wired into a processor, kept around so tests can inspect them.
pub struct Sinks {
    pub fetcher: Arc<MockFetcher>,
    pub store: Arc<MemoryStore>,
    pub sheet: Arc<MemorySheet>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Sinks {
    pub fn new(fetcher: MockFetcher) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            store: Arc::new(MemoryStore::default()),
            sheet: Arc::new(MemorySheet::default()),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    pub fn processor(&self) -> Arc<EventProcessor> {
        Arc::new(
            EventProcessor::new(self.fetcher.clone(), self.store.clone())
                .with_notifier(self.notifier.clone())
                .with_sheet_sync(self.sheet.clone()),
        )
    }
}
