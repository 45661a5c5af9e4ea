use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::{FetchError, SinkError},
    models::{
        event::WebhookEvent,
        order::{Order, OrderSummary, SheetRow},
    },
};

/// Source of truth for order details.
#[async_trait]
pub trait OrderFetcher: Send + Sync {
    async fn fetch_order(&self, order_sn: &str) -> Result<Order, FetchError>;
}

/// Orders touched within a time window, for reconciliation.
#[async_trait]
pub trait OrderLister: Send + Sync {
    /// Orders whose `update_time` falls within `[from, to]`.
    async fn list_updated_orders(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OrderSummary>, FetchError>;
}

/// Persistent order storage. Writes are upserts keyed by `(order_sn, sku)`.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn upsert_order(&self, order: &Order) -> Result<(), SinkError>;

    async fn health_check(&self) -> Result<(), SinkError>;
}

/// Operator notification. Delivering the same event twice is acceptable.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &WebhookEvent, order: Option<&Order>) -> Result<(), SinkError>;
}

/// Spreadsheet mirror of order rows, upserted by `(order_id, sku)`.
#[async_trait]
pub trait SheetSync: Send + Sync {
    async fn upsert_rows(&self, rows: &[SheetRow]) -> Result<(), SinkError>;
}
