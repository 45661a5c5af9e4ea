use std::{collections::HashMap, fmt::Write as _, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    error::SinkError,
    models::{event::WebhookEvent, order::Order, retry::RetryConfig},
    services::sinks::Notifier,
    utils::retry_with_backoff,
};

/// Telegram rejects messages over 4096 characters.
pub const MAX_MESSAGE_LENGTH: usize = 4000;

#[derive(Debug, Clone, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_thread_id: Option<i64>,
}

fn event_name(code: i64) -> String {
    match code {
        3 => "Order Status Update".to_string(),
        4 => "Order Tracking Number".to_string(),
        8 => "Reserved Stock Change".to_string(),
        other => format!("Event {}", other),
    }
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Renders the event, and the fetched order when there is one, as Telegram HTML.
pub fn format_message(event: &WebhookEvent, order: Option<&Order>) -> String {
    let mut message = String::new();

    let _ = writeln!(message, "📩 <b>SHOPEE WEBHOOK EVENT</b>");
    let _ = writeln!(
        message,
        "<b>Code:</b> {} ({})",
        event.event_code,
        event_name(event.event_code)
    );
    let _ = writeln!(message, "<b>Shop ID:</b> <code>{}</code>", event.shop_id);
    let _ = writeln!(
        message,
        "<b>Received:</b> {}",
        event.received_at.format("%Y-%m-%d %H:%M:%S")
    );

    if let Some(data) = event
        .envelope()
        .ok()
        .and_then(|envelope| envelope.data.as_object().cloned())
    {
        if !data.is_empty() {
            let _ = writeln!(message, "\n<b>Event Data:</b>");
            for (key, value) in &data {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if value.len() < 50 {
                    let _ = writeln!(
                        message,
                        "  • {}: <code>{}</code>",
                        escape_html(key),
                        escape_html(&value)
                    );
                }
            }
        }
    }

    if let Some(order) = order {
        let _ = writeln!(message, "\n📦 <b>ORDER DETAILS</b>");
        let _ = writeln!(
            message,
            "  Order ID: <code>{}</code>",
            escape_html(&order.order_sn)
        );
        let _ = writeln!(
            message,
            "  Status: <code>{}</code>",
            escape_html(&order.order_status)
        );
        if let Some(created) = order.created_at() {
            let _ = writeln!(message, "  Created: {}", created.format("%Y-%m-%d %H:%M:%S"));
        }
        if let Some(buyer) = &order.buyer_username {
            let _ = writeln!(message, "  Buyer: {}", escape_html(buyer));
        }
        if let Some(amount) = order.total_amount {
            let _ = writeln!(
                message,
                "  Total Amount: <code>{} {}</code>",
                amount,
                order.currency.as_deref().unwrap_or("SGD")
            );
        }

        if !order.item_list.is_empty() {
            let _ = writeln!(message, "\n<b>📋 Items ({})</b>", order.item_list.len());
            for (idx, item) in order.item_list.iter().enumerate() {
                let _ = writeln!(
                    message,
                    "  <b>{}. {}</b>",
                    idx + 1,
                    escape_html(item.item_name.as_deref().unwrap_or("N/A"))
                );
                let _ = writeln!(message, "     SKU: <code>{}</code>", escape_html(&item.sku()));
                if let Some(variation) = &item.model_name {
                    let _ = writeln!(message, "     Variation: {}", escape_html(variation));
                }
                let _ = writeln!(message, "     Qty: {}", item.model_quantity_purchased);
            }
        }
    }

    message
}

/// Splits on line boundaries so no chunk exceeds `max_length` characters.
pub fn split_message(message: &str, max_length: usize) -> Vec<String> {
    if message.chars().count() <= max_length {
        return vec![message.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in message.lines() {
        let line: String = line.chars().take(max_length).collect();
        if current.chars().count() + line.chars().count() + 1 > max_length && !current.is_empty() {
            chunks.push(current.trim_end().to_string());
            current.clear();
        }
        current.push_str(&line);
        current.push('\n');
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim_end().to_string());
    }

    chunks
}

pub struct TelegramNotifier {
    http_client: Client,
    api_url: String,
    bot_token: String,
    chat_id: String,
    /// Event code to forum topic (message thread) id.
    topics: HashMap<i64, i64>,
    retry_config: RetryConfig,
}

impl TelegramNotifier {
    pub fn new(
        api_url: &str,
        bot_token: String,
        chat_id: String,
        request_timeout: Duration,
        retry_config: RetryConfig,
    ) -> Result<Self, SinkError> {
        let http_client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SinkError::Unavailable(format!("failed to create HTTP client: {}", e)))?;

        info!(chat_id = %chat_id, "Telegram notifier initialized");

        Ok(Self {
            http_client,
            api_url: api_url.trim_end_matches('/').to_string(),
            bot_token,
            chat_id,
            topics: HashMap::new(),
            retry_config,
        })
    }

    /// Routes each event code into its own topic of a forum chat.
    pub fn with_topics(mut self, topics: HashMap<i64, i64>) -> Self {
        if !topics.is_empty() {
            info!(topics = topics.len(), "Telegram topic routing enabled");
        }
        self.topics = topics;
        self
    }

    fn thread_for(&self, event_code: i64) -> Option<i64> {
        self.topics.get(&event_code).copied()
    }

    async fn send_once(
        &self,
        url: &str,
        text: &str,
        message_thread_id: Option<i64>,
    ) -> Result<(), SinkError> {
        let request = SendMessageRequest {
            chat_id: &self.chat_id,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
            message_thread_id,
        };

        let response = self.http_client.post(url).json(&request).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() && status.as_u16() != 429 {
            Err(SinkError::Rejected(format!("Telegram returned {}: {}", status, body)))
        } else {
            Err(SinkError::Unavailable(format!("Telegram returned {}: {}", status, body)))
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, event: &WebhookEvent, order: Option<&Order>) -> Result<(), SinkError> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.bot_token);
        let chunks = split_message(&format_message(event, order), MAX_MESSAGE_LENGTH);
        let total = chunks.len();
        let thread = self.thread_for(event.event_code);

        for (idx, chunk) in chunks.iter().enumerate() {
            let text = if total > 1 {
                format!("{}\n\n<i>Part {}/{}</i>", chunk, idx + 1, total)
            } else {
                chunk.clone()
            };

            retry_with_backoff(&self.retry_config, || self.send_once(&url, &text, thread)).await?;
        }

        debug!(event_code = event.event_code, parts = total, thread = ?thread, "Telegram notification sent");
        Ok(())
    }
}
