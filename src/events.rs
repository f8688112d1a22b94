//! Merchant-facing domain events.
//!
//! A [`PaymentEvent`] or [`RefundEvent`] is minted once at settlement time,
//! serialized, and written to the persistent webhook queue. The `event_id`
//! (`evt_` plus 24 hex characters) is the consumer-side idempotency key:
//! preparation assigns it exactly once, so every delivery attempt of the same
//! event carries the same id and timestamp.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fmt::Display;

use crate::types::{PaymentMethod, PaymentTransaction};

/// A server-generated event identifier, `evt_` followed by 24 lowercase hex
/// characters. Unique per domain event and preserved across delivery retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventId(String);

static EVENT_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^evt_[0-9a-f]{24}$").expect("invalid event id regex"));

impl EventId {
    /// Mint a fresh id from 96 bits of OS randomness.
    pub fn mint() -> Self {
        let bytes: [u8; 12] = rand::rng().random();
        EventId(format!("evt_{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if EVENT_ID_REGEX.is_match(&s) {
            Ok(EventId(s))
        } else {
            Err(DeError::custom(
                "invalid event id: expected evt_ followed by 24 hex chars",
            ))
        }
    }
}

/// Event delivered to the merchant when a payment settles.
///
/// Rail-specific amount fields are populated according to `method`: card
/// payments carry `fiat_amount_cents`/`fiat_currency`, crypto payments carry
/// `crypto_atomic_amount`/`crypto_token`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_timestamp: Option<DateTime<Utc>>,
    pub resource: String,
    pub method: PaymentMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fiat_amount_cents: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fiat_currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_atomic_amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<String>,
    pub proof_signature: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
}

impl PaymentEvent {
    /// Build an event from a recorded settlement. Identity fields stay unset
    /// until [`PaymentEvent::prepare`] runs at enqueue time.
    pub fn from_transaction(tx: &PaymentTransaction) -> Self {
        let (fiat_amount_cents, fiat_currency, crypto_atomic_amount, crypto_token) = match tx.method
        {
            PaymentMethod::Fiat => (
                Some(tx.amount.atomic),
                Some(tx.amount.asset.code.clone()),
                None,
                None,
            ),
            PaymentMethod::Crypto => (
                None,
                None,
                Some(tx.amount.atomic),
                Some(tx.amount.asset.code.clone()),
            ),
        };
        PaymentEvent {
            event_id: None,
            event_type: None,
            event_timestamp: None,
            resource: tx.resource_id.clone(),
            method: tx.method,
            fiat_amount_cents,
            fiat_currency,
            crypto_atomic_amount,
            crypto_token,
            wallet: Some(tx.wallet.clone()),
            proof_signature: tx.signature.clone(),
            metadata: tx.metadata.clone(),
            paid_at: Some(tx.created_at),
        }
    }

    /// Fill identity fields that are still unset.
    ///
    /// Idempotent: a prepared event passes through unchanged, so the event id
    /// and timestamps survive re-preparation on retry paths.
    pub fn prepare(&mut self, now: DateTime<Utc>) {
        if self.event_id.is_none() {
            self.event_id = Some(EventId::mint());
        }
        if self.event_type.is_none() {
            self.event_type = Some("payment.succeeded".to_string());
        }
        if self.event_timestamp.is_none() {
            self.event_timestamp = Some(now);
        }
        if self.paid_at.is_none() {
            self.paid_at = Some(now);
        }
    }
}

/// Event delivered to the merchant when a payment is refunded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_timestamp: Option<DateTime<Utc>>,
    pub resource: String,
    pub method: PaymentMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fiat_amount_cents: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fiat_currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_atomic_amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<String>,
    /// Signature of the original settlement being refunded.
    pub proof_signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refunded_at: Option<DateTime<Utc>>,
}

impl RefundEvent {
    /// Fill identity fields that are still unset; idempotent like
    /// [`PaymentEvent::prepare`].
    pub fn prepare(&mut self, now: DateTime<Utc>) {
        if self.event_id.is_none() {
            self.event_id = Some(EventId::mint());
        }
        if self.event_type.is_none() {
            self.event_type = Some("refund.succeeded".to_string());
        }
        if self.event_timestamp.is_none() {
            self.event_timestamp = Some(now);
        }
        if self.refunded_at.is_none() {
            self.refunded_at = Some(now);
        }
    }
}
