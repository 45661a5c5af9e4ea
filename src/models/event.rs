use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Event code for an order status update push.
pub const ORDER_STATUS_UPDATE: i64 = 3;
/// Event code for an order tracking number push.
pub const ORDER_TRACKING_UPDATE: i64 = 4;

/// Body of a Shopee push call. Decoded only after the signature has been verified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub code: i64,
    pub shop_id: i64,

    #[serde(default)]
    pub timestamp: Option<i64>,

    #[serde(default)]
    pub data: JsonValue,
}

impl PushEnvelope {
    pub fn order_sn(&self) -> Option<&str> {
        self.data
            .get("ordersn")
            .or_else(|| self.data.get("order_sn"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    pub fn status(&self) -> Option<&str> {
        self.data.get("status").and_then(|v| v.as_str())
    }
}

/// An inbound webhook exactly as it was received. Never mutated after ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_code: i64,
    pub shop_id: i64,
    pub received_at: DateTime<Utc>,

    #[serde(with = "hex::serde")]
    pub raw_payload: Vec<u8>,

    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

impl WebhookEvent {
    /// Builds the event from the raw request body. The body is kept byte-for-byte;
    /// only `code` and `shop_id` are read out of it.
    pub fn from_raw(raw_payload: &[u8], signature: Vec<u8>) -> Result<Self, serde_json::Error> {
        let envelope: PushEnvelope = serde_json::from_slice(raw_payload)?;

        Ok(Self {
            event_code: envelope.code,
            shop_id: envelope.shop_id,
            received_at: Utc::now(),
            raw_payload: raw_payload.to_vec(),
            signature,
        })
    }

    pub fn envelope(&self) -> Result<PushEnvelope, serde_json::Error> {
        serde_json::from_slice(&self.raw_payload)
    }

    pub fn order_sn(&self) -> Option<String> {
        self.envelope()
            .ok()
            .and_then(|envelope| envelope.order_sn().map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_order_identifier_from_either_field() {
        let a = WebhookEvent::from_raw(
            br#"{"code":3,"shop_id":1,"data":{"ordersn":"A1","status":"READY_TO_SHIP"}}"#,
            vec![],
        )
        .unwrap();
        let b = WebhookEvent::from_raw(br#"{"code":4,"shop_id":1,"data":{"order_sn":"B2"}}"#, vec![])
            .unwrap();

        assert_eq!(a.order_sn().as_deref(), Some("A1"));
        assert_eq!(a.envelope().unwrap().status(), Some("READY_TO_SHIP"));
        assert_eq!(b.order_sn().as_deref(), Some("B2"));
        assert_eq!(b.event_code, ORDER_TRACKING_UPDATE);
    }

    #[test]
    fn raw_payload_survives_serialization_untouched() {
        let body = b"{ \"code\" : 3, \"shop_id\": 7,  \"data\": {} }";
        let event = WebhookEvent::from_raw(body, vec![0xde, 0xad]).unwrap();

        let json = serde_json::to_string(&event).unwrap();
        let decoded: WebhookEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.raw_payload, body.to_vec());
        assert_eq!(decoded, event);
    }

    #[test]
    fn rejects_body_without_envelope_fields() {
        assert!(WebhookEvent::from_raw(br#"{"data":{}}"#, vec![]).is_err());
        assert!(WebhookEvent::from_raw(b"not json", vec![]).is_err());
    }
}
