use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, de::DeserializeOwned};
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    config::PartnerCredentials,
    error::FetchError,
    models::order::{Order, OrderSummary},
    services::sinks::{OrderFetcher, OrderLister},
};

pub const GET_ORDER_DETAIL: &str = "/api/v2/order/get_order_detail";
pub const GET_ORDER_LIST: &str = "/api/v2/order/get_order_list";

const RESPONSE_OPTIONAL_FIELDS: &str =
    "buyer_username,item_list,total_amount,order_status,order_income,create_time";

/// Widest `time_from..time_to` span the order list endpoint accepts.
const MAX_LIST_WINDOW: TimeDelta = TimeDelta::days(15);
const LIST_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
struct ApiEnvelope<R> {
    #[serde(default)]
    error: String,

    #[serde(default)]
    message: String,

    response: Option<R>,
}

#[derive(Debug, Deserialize)]
struct OrderDetailResponse {
    #[serde(default)]
    order_list: Vec<Order>,
}

#[derive(Debug, Deserialize)]
struct OrderListResponse {
    #[serde(default)]
    more: bool,

    #[serde(default)]
    next_cursor: String,

    #[serde(default)]
    order_list: Vec<OrderSummary>,
}

/// Signs `partner_id + path + timestamp + access_token + shop_id` with the partner key.
pub fn sign_request(
    partner_key: &str,
    partner_id: i64,
    path: &str,
    timestamp: i64,
    access_token: &str,
    shop_id: i64,
) -> Result<String, FetchError> {
    let base = format!("{partner_id}{path}{timestamp}{access_token}{shop_id}");

    let mut mac = Hmac::<Sha256>::new_from_slice(partner_key.as_bytes())
        .map_err(|e| FetchError::Other(format!("invalid partner key: {}", e)))?;
    mac.update(base.as_bytes());

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Shopee Open Platform client for order details and order listings.
///
/// The access token is owned here behind a lock; `refresh` swaps it for all
/// subsequent requests.
pub struct ShopeeClient {
    http_client: Client,
    host_api: String,
    partner_id: i64,
    partner_key: String,
    shop_id: i64,
    access_token: RwLock<String>,
}

impl ShopeeClient {
    pub fn new(
        host_api: &str,
        credentials: PartnerCredentials,
        request_timeout: Duration,
    ) -> Result<Self, FetchError> {
        let http_client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| FetchError::Other(format!("failed to create HTTP client: {}", e)))?;

        info!(
            host_api,
            partner_id = credentials.partner_id,
            shop_id = credentials.shop_id,
            "Shopee API client initialized"
        );

        Ok(Self {
            http_client,
            host_api: host_api.trim_end_matches('/').to_string(),
            partner_id: credentials.partner_id,
            partner_key: credentials.partner_key,
            shop_id: credentials.shop_id,
            access_token: RwLock::new(credentials.access_token),
        })
    }

    pub async fn refresh(&self, access_token: String) {
        *self.access_token.write().await = access_token;
        info!(shop_id = self.shop_id, "Shopee access token replaced");
    }

    pub async fn access_token(&self) -> String {
        self.access_token.read().await.clone()
    }

    /// Signed GET against a shop-level endpoint. Returns the `response` object,
    /// which Shopee omits when there is nothing to report.
    async fn get<R: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Option<R>, FetchError> {
        let access_token = self.access_token().await;
        let timestamp = Utc::now().timestamp();
        let sign = sign_request(
            &self.partner_key,
            self.partner_id,
            path,
            timestamp,
            &access_token,
            self.shop_id,
        )?;

        let response = self
            .http_client
            .get(format!("{}{}", self.host_api, path))
            .query(&[
                ("partner_id", self.partner_id.to_string()),
                ("timestamp", timestamp.to_string()),
                ("access_token", access_token),
                ("shop_id", self.shop_id.to_string()),
                ("sign", sign),
            ])
            .query(params)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(path, %status, "Shopee API rejected credentials");
            return Err(FetchError::Unauthorized);
        }
        if !status.is_success() {
            return Err(FetchError::Other(format!("Shopee API returned status {}", status)));
        }

        let envelope: ApiEnvelope<R> = response.json().await?;

        if !envelope.error.is_empty() {
            if envelope.error.contains("auth") || envelope.error.contains("access_token") {
                warn!(path, error = %envelope.error, "Shopee API rejected access token");
                return Err(FetchError::Unauthorized);
            }
            return Err(FetchError::Other(format!(
                "{}: {}",
                envelope.error, envelope.message
            )));
        }

        Ok(envelope.response)
    }
}

#[async_trait]
impl OrderFetcher for ShopeeClient {
    async fn fetch_order(&self, order_sn: &str) -> Result<Order, FetchError> {
        debug!(order_sn, "Fetching order detail");

        let response: Option<OrderDetailResponse> = self
            .get(
                GET_ORDER_DETAIL,
                &[
                    ("order_sn_list", order_sn.to_string()),
                    ("response_optional_fields", RESPONSE_OPTIONAL_FIELDS.to_string()),
                ],
            )
            .await?;

        response
            .and_then(|r| r.order_list.into_iter().next())
            .ok_or_else(|| FetchError::NotFound(order_sn.to_string()))
    }
}

#[async_trait]
impl OrderLister for ShopeeClient {
    async fn list_updated_orders(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OrderSummary>, FetchError> {
        let mut orders = Vec::new();
        let mut window_start = from;

        while window_start < to {
            let window_end = (window_start + MAX_LIST_WINDOW).min(to);
            let mut cursor = String::new();

            loop {
                let page: Option<OrderListResponse> = self
                    .get(
                        GET_ORDER_LIST,
                        &[
                            ("time_range_field", "update_time".to_string()),
                            ("time_from", window_start.timestamp().to_string()),
                            ("time_to", window_end.timestamp().to_string()),
                            ("page_size", LIST_PAGE_SIZE.to_string()),
                            ("cursor", cursor.clone()),
                        ],
                    )
                    .await?;

                let Some(page) = page else { break };
                orders.extend(page.order_list);

                if !page.more || page.next_cursor.is_empty() {
                    break;
                }
                cursor = page.next_cursor;
            }

            window_start = window_end;
        }

        debug!(
            count = orders.len(),
            from = %from,
            to = %to,
            "Listed updated orders"
        );
        Ok(orders)
    }
}
