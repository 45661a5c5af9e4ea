use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, warn};

use crate::{error::SinkError, models::order::Order, services::sinks::OrderStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS order_items (
    id BIGSERIAL PRIMARY KEY,
    order_id VARCHAR(50) NOT NULL,
    date_time TIMESTAMPTZ,
    buyer VARCHAR(255),
    platform VARCHAR(50) NOT NULL DEFAULT 'Shopee',
    product_name VARCHAR(500),
    item_type VARCHAR(255),
    parent_sku VARCHAR(100),
    sku VARCHAR(100) NOT NULL,
    quantity INTEGER NOT NULL DEFAULT 1,
    total_sale DOUBLE PRECISION,
    shopee_status VARCHAR(50),
    status VARCHAR(100) NOT NULL DEFAULT '',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (order_id, sku)
);
CREATE INDEX IF NOT EXISTS order_items_order_id_idx ON order_items (order_id);
"#;

const UPSERT_ITEM: &str = r#"
INSERT INTO order_items (
    order_id, date_time, buyer, platform, product_name, item_type,
    parent_sku, sku, quantity, total_sale, shopee_status, status
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
ON CONFLICT (order_id, sku) DO UPDATE SET
    date_time = EXCLUDED.date_time,
    buyer = EXCLUDED.buyer,
    product_name = EXCLUDED.product_name,
    item_type = EXCLUDED.item_type,
    parent_sku = EXCLUDED.parent_sku,
    quantity = EXCLUDED.quantity,
    total_sale = EXCLUDED.total_sale,
    shopee_status = EXCLUDED.shopee_status,
    status = EXCLUDED.status,
    updated_at = NOW()
"#;

/// Order items in PostgreSQL, one row per `(order_id, sku)`.
///
/// Holds a single client and opens a new one whenever the current connection
/// has closed, so a database restart costs the in-flight calls only.
pub struct PostgresOrderStore {
    database_url: String,
    client: Mutex<Option<Arc<Client>>>,
}

impl PostgresOrderStore {
    /// Does not connect; the first call does.
    pub fn new(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<Arc<Client>, SinkError> {
        let mut current = self.client.lock().await;

        if let Some(client) = current.as_ref().filter(|c| !c.is_closed()) {
            return Ok(client.clone());
        }

        if current.take().is_some() {
            warn!("PostgreSQL connection lost, reconnecting");
        } else {
            info!("Connecting to PostgreSQL database");
        }

        let (client, connection) = tokio_postgres::connect(&self.database_url, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection closed with error");
            }
        });

        client.batch_execute(SCHEMA).await?;

        info!("PostgreSQL connection established");

        let client = Arc::new(client);
        *current = Some(client.clone());
        Ok(client)
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn upsert_order(&self, order: &Order) -> Result<(), SinkError> {
        let client = self.client().await?;
        let created_at = order.created_at();
        let statement = client.prepare(UPSERT_ITEM).await?;

        for row in order.rows() {
            let quantity = row.quantity as i32;
            client
                .execute(
                    &statement,
                    &[
                        &row.order_id,
                        &created_at,
                        &row.buyer,
                        &row.platform,
                        &row.product_name,
                        &row.item_type,
                        &row.parent_sku,
                        &row.sku,
                        &quantity,
                        &row.total_sale,
                        &row.shopee_status,
                        &row.status,
                    ],
                )
                .await
                .map_err(|e| {
                    error!(
                        error = %e,
                        order_sn = %row.order_id,
                        sku = %row.sku,
                        "Failed to upsert order item"
                    );
                    SinkError::from(e)
                })?;
        }

        debug!(
            order_sn = %order.order_sn,
            items = order.item_list.len(),
            "Order items upserted"
        );

        Ok(())
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        self.client().await?.query_one("SELECT 1", &[]).await?;
        Ok(())
    }
}
