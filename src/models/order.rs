use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const PLATFORM: &str = "Shopee";

/// One row of `get_order_list`: just enough to decide whether to fetch details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub order_sn: String,

    #[serde(default)]
    pub order_status: String,
}

/// Order record as returned by `get_order_detail`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_sn: String,
    pub order_status: String,
    pub create_time: i64,

    #[serde(default)]
    pub shop_id: Option<i64>,

    #[serde(default)]
    pub buyer_username: Option<String>,

    #[serde(default)]
    pub update_time: Option<i64>,

    #[serde(default)]
    pub total_amount: Option<f64>,

    #[serde(default)]
    pub currency: Option<String>,

    #[serde(default)]
    pub item_list: Vec<OrderItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    #[serde(default)]
    pub item_name: Option<String>,

    #[serde(default)]
    pub item_sku: Option<String>,

    #[serde(default)]
    pub model_name: Option<String>,

    #[serde(default)]
    pub model_sku: Option<String>,

    #[serde(default = "default_quantity")]
    pub model_quantity_purchased: u32,

    #[serde(default)]
    pub model_discounted_price: f64,
}

fn default_quantity() -> u32 {
    1
}

impl OrderItem {
    /// Row key within an order: model SKU, then item SKU, then a name-derived fallback.
    pub fn sku(&self) -> String {
        let sku = self
            .model_sku
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| self.item_sku.as_deref().map(str::trim).filter(|s| !s.is_empty()));

        match sku {
            Some(sku) => sku.to_string(),
            None => format!(
                "NO_SKU_{}",
                self.item_name.as_deref().unwrap_or("UNKNOWN_ITEM").trim()
            ),
        }
    }

    pub fn line_total(&self) -> f64 {
        let total = self.model_discounted_price * f64::from(self.model_quantity_purchased.max(1));
        (total * 100.0).round() / 100.0
    }
}

/// One spreadsheet row per order item, keyed by `(order_id, sku)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetRow {
    pub order_id: String,
    pub date_time: String,
    pub buyer: String,
    pub platform: String,
    pub product_name: String,
    pub item_type: String,
    pub parent_sku: String,
    pub sku: String,
    pub quantity: u32,
    pub total_sale: f64,
    pub shopee_status: String,
    pub status: String,
}

impl Order {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.create_time, 0)
    }

    pub fn rows(&self) -> Vec<SheetRow> {
        let date_time = self
            .created_at()
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
            .unwrap_or_default();

        self.item_list
            .iter()
            .map(|item| SheetRow {
                order_id: self.order_sn.clone(),
                date_time: date_time.clone(),
                buyer: self.buyer_username.clone().unwrap_or_default(),
                platform: PLATFORM.to_string(),
                product_name: item.item_name.clone().unwrap_or_default(),
                item_type: item.model_name.clone().unwrap_or_default(),
                parent_sku: item.item_sku.clone().unwrap_or_default(),
                sku: item.sku(),
                quantity: item.model_quantity_purchased.max(1),
                total_sale: item.line_total(),
                shopee_status: self.order_status.clone(),
                status: self.order_status.clone(),
            })
            .collect()
    }
}
