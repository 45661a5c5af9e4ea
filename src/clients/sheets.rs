use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    error::SinkError,
    models::{order::SheetRow, retry::RetryConfig},
    services::sinks::SheetSync,
    utils::retry_with_backoff,
};

#[derive(Debug, Serialize)]
struct UpsertRowsRequest<'a> {
    key_columns: [&'static str; 2],
    rows: &'a [SheetRow],
}

/// Posts order rows to a spreadsheet sync endpoint, which upserts them by
/// `(order_id, sku)`.
pub struct SheetSyncClient {
    http_client: Client,
    sync_url: String,
    retry_config: RetryConfig,
}

impl SheetSyncClient {
    pub fn new(
        sync_url: &str,
        request_timeout: Duration,
        retry_config: RetryConfig,
    ) -> Result<Self, SinkError> {
        let http_client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SinkError::Unavailable(format!("failed to create HTTP client: {}", e)))?;

        info!(sync_url, "Sheet sync client initialized");

        Ok(Self {
            http_client,
            sync_url: sync_url.to_string(),
            retry_config,
        })
    }

    async fn post_once(&self, request: &UpsertRowsRequest<'_>) -> Result<(), SinkError> {
        let response = self
            .http_client
            .post(&self.sync_url)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status.as_u16() == 429 {
            Err(SinkError::Unavailable(format!("sheet sync returned {}: {}", status, body)))
        } else {
            Err(SinkError::Rejected(format!("sheet sync returned {}: {}", status, body)))
        }
    }
}

#[async_trait]
impl SheetSync for SheetSyncClient {
    async fn upsert_rows(&self, rows: &[SheetRow]) -> Result<(), SinkError> {
        if rows.is_empty() {
            return Ok(());
        }

        let request = UpsertRowsRequest {
            key_columns: ["order_id", "sku"],
            rows,
        };

        retry_with_backoff(&self.retry_config, || self.post_once(&request)).await?;

        debug!(
            order_sn = %rows[0].order_id,
            rows = rows.len(),
            "Sheet rows synced"
        );
        Ok(())
    }
}
