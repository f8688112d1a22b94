//! Storage contract for the gateway core.
//!
//! The core depends only on these traits; backends (relational, document,
//! in-memory) implement them behind whatever schema mapping they need. The
//! [`memory`] module provides the reference in-memory backend used by tests
//! and single-process deployments.
//!
//! Two operations carry the load-bearing atomicity guarantees:
//!
//! - [`Store::record_payment`] is an atomic unique-insert on the payment
//!   signature. Exactly one concurrent caller wins; the rest observe
//!   [`StoreError::Conflict`].
//! - [`Store::dequeue_webhooks`] atomically claims due `pending` rows into
//!   `processing` under a lease, so no two workers observe the same row in a
//!   claim cycle.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{
    Coupon, NewWebhook, PaymentTransaction, PendingWebhook, Product, Quote, SubscriberRef,
    Subscription, WebhookStatus,
};

/// Failures reported by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique constraint was violated. `key` names the conflicting value.
    #[error("unique constraint violated: {key}")]
    Conflict { key: String },
    /// The referenced row does not exist.
    #[error("row not found: {0}")]
    NotFound(String),
    /// Backend failure (connection loss, serialization, timeout).
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Catalog portion of the storage contract: products and coupons.
///
/// Split out so the caching decorator can wrap exactly the repositories it
/// decorates, and so tests can count underlying reads without standing up the
/// full store.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn product(&self, id: &str) -> Result<Option<Product>, StoreError>;
    async fn list_products(&self) -> Result<Vec<Product>, StoreError>;
    async fn upsert_product(&self, product: &Product) -> Result<(), StoreError>;

    async fn coupon(&self, code: &str) -> Result<Option<Coupon>, StoreError>;
    async fn list_coupons(&self) -> Result<Vec<Coupon>, StoreError>;
    async fn upsert_coupon(&self, coupon: &Coupon) -> Result<(), StoreError>;
    /// Bump the usage counter of a coupon by one.
    async fn increment_coupon_usage(&self, code: &str) -> Result<(), StoreError>;
}

/// Full storage contract: payments, quotes, webhook queue, subscriptions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Atomic unique-insert keyed on `tx.signature`.
    ///
    /// Returns [`StoreError::Conflict`] when a payment with the same
    /// signature was already recorded; this is the admission decision.
    async fn record_payment(&self, tx: &PaymentTransaction) -> Result<(), StoreError>;
    async fn has_payment(&self, signature: &str) -> Result<bool, StoreError>;
    async fn payment(&self, signature: &str) -> Result<Option<PaymentTransaction>, StoreError>;
    /// Whether any recorded payment covers `(resource_id, wallet)`.
    async fn has_payment_for(&self, resource_id: &str, wallet: &str) -> Result<bool, StoreError>;

    async fn save_quote(&self, quote: &Quote) -> Result<(), StoreError>;
    async fn load_quote(&self, id: &Uuid) -> Result<Option<Quote>, StoreError>;
    /// Atomically flip the quote's single-use marker. Returns `true` for the
    /// one caller that consumed it, `false` on replay or unknown id.
    async fn consume_quote(&self, id: &Uuid) -> Result<bool, StoreError>;

    /// Append a row to the delivery queue with `status = pending`.
    async fn enqueue_webhook(&self, webhook: NewWebhook) -> Result<u64, StoreError>;
    /// Claim up to `limit` rows that are `pending` with `next_attempt_at <=
    /// now`, transitioning them to `processing` under a lease stamped `now`.
    async fn dequeue_webhooks(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingWebhook>, StoreError>;
    /// Idempotent lease renewal for a claimed row.
    async fn mark_webhook_processing(&self, id: u64, now: DateTime<Utc>)
    -> Result<(), StoreError>;
    async fn mark_webhook_success(&self, id: u64) -> Result<(), StoreError>;
    /// Record a failed attempt. Increments `attempts`; moves the row to `dlq`
    /// once `attempts` reaches `max_attempts`, otherwise back to `pending`
    /// with the supplied `next_attempt_at`. Returns the resulting status.
    async fn mark_webhook_failed(
        &self,
        id: u64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<WebhookStatus, StoreError>;
    /// Hand orphaned `processing` rows whose lease predates `older_than` back
    /// to `pending`. Returns how many rows were reclaimed.
    async fn reclaim_stale_leases(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError>;
    async fn list_dlq(&self, limit: usize) -> Result<Vec<PendingWebhook>, StoreError>;
    /// Re-enqueue a dead-lettered row with attempts reset. Returns `false`
    /// when the row is not in `dlq`.
    async fn replay_dlq(&self, id: u64, now: DateTime<Utc>) -> Result<bool, StoreError>;
    /// Number of rows still awaiting delivery (`pending` or `processing`).
    async fn queue_depth(&self) -> Result<usize, StoreError>;

    async fn subscription(&self, id: &str) -> Result<Option<Subscription>, StoreError>;
    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<(), StoreError>;
    /// Exact-match lookup by product and subscriber identity.
    async fn find_subscription(
        &self,
        product_id: &str,
        subscriber: &SubscriberRef,
    ) -> Result<Option<Subscription>, StoreError>;
}
