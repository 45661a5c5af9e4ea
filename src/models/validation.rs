//! Shopee push signature verification.
//!
//! Shopee signs each push with HMAC-SHA256 over the raw request body and sends
//! the lowercase hex digest in the `Authorization` header. Verification runs on
//! the exact bytes received, before the body is deserialized.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::SignatureError;

type HmacSha256 = Hmac<Sha256>;

/// Prefix Shopee puts on partner keys in the console. Not part of the key material.
const KEY_PREFIX: &str = "shpk";

pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Result<Vec<u8>, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::SignatureMismatch)?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Checks `signature` (raw digest bytes) against `payload` in constant time.
pub fn verify_signature(payload: &[u8], secret: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::SignatureMismatch)?;
    mac.update(payload);
    mac.verify_slice(signature)
        .map_err(|_| SignatureError::SignatureMismatch)
}

#[derive(Debug, Clone)]
pub struct SignatureValidator {
    secrets: Vec<(&'static str, Vec<u8>)>,
    enabled: bool,
}

impl SignatureValidator {
    pub fn new(enabled: bool) -> Self {
        if !enabled {
            warn!("Webhook signature validation is DISABLED, running degraded");
        }

        Self {
            secrets: Vec::new(),
            enabled,
        }
    }

    pub fn with_secret(mut self, source: &'static str, key: &str) -> Self {
        let key = key.strip_prefix(KEY_PREFIX).unwrap_or(key);
        self.secrets.push((source, key.as_bytes().to_vec()));
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Validates a push against every configured secret and returns the
    /// decoded digest.
    ///
    /// `signature_header` is the hex digest from the `Authorization` header.
    /// With validation disabled the digest is whatever decodes, possibly empty.
    pub fn validate(
        &self,
        body: &[u8],
        signature_header: Option<&str>,
    ) -> Result<Vec<u8>, SignatureError> {
        let header = signature_header.map(str::trim).filter(|h| !h.is_empty());

        if !self.enabled {
            debug!("Signature validation skipped (disabled by configuration)");
            return Ok(header
                .and_then(|h| hex::decode(h).ok())
                .unwrap_or_default());
        }

        let Some(header) = header else {
            warn!("Webhook received without signature header");
            return Err(SignatureError::SignatureMismatch);
        };

        if body.is_empty() {
            warn!("Webhook received with empty body");
            return Err(SignatureError::SignatureMismatch);
        }

        let Ok(signature) = hex::decode(header) else {
            warn!("Webhook signature header is not valid hex");
            return Err(SignatureError::SignatureMismatch);
        };

        for (source, secret) in &self.secrets {
            if verify_signature(body, secret, &signature).is_ok() {
                debug!(key_source = source, "Webhook signature verified");
                return Ok(signature);
            }
        }

        let prefix: String = header.chars().take(16).collect();
        warn!(signature_prefix = %prefix, "Invalid webhook signature");
        Err(SignatureError::SignatureMismatch)
    }
}
