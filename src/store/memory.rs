//! Reference in-memory storage backend.
//!
//! All state lives behind a single `tokio::sync::Mutex`, which makes the
//! unique-insert on payment signatures and the claim step of
//! [`Store::dequeue_webhooks`] trivially linearizable. Suitable for tests and
//! single-process deployments; multi-process deployments need a backend with
//! real row-level leases.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{CatalogStore, Store, StoreError};
use crate::types::{
    Coupon, NewWebhook, PaymentTransaction, PendingWebhook, Product, Quote, SubscriberRef,
    Subscription, WebhookStatus,
};

#[derive(Default)]
struct Inner {
    payments: HashMap<String, PaymentTransaction>,
    quotes: HashMap<Uuid, Quote>,
    webhooks: BTreeMap<u64, PendingWebhook>,
    next_webhook_id: u64,
    products: HashMap<String, Product>,
    coupons: HashMap<String, Coupon>,
    subscriptions: HashMap<String, Subscription>,
}

/// In-memory [`Store`] and [`CatalogStore`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn product(&self, id: &str) -> Result<Option<Product>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.products.get(id).cloned())
    }

    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.products.values().cloned().collect())
    }

    async fn upsert_product(&self, product: &Product) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .products
            .insert(product.id.clone(), product.clone());
        Ok(())
    }

    async fn coupon(&self, code: &str) -> Result<Option<Coupon>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.coupons.get(code).cloned())
    }

    async fn list_coupons(&self) -> Result<Vec<Coupon>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.coupons.values().cloned().collect())
    }

    async fn upsert_coupon(&self, coupon: &Coupon) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.coupons.insert(coupon.code.clone(), coupon.clone());
        Ok(())
    }

    async fn increment_coupon_usage(&self, code: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let coupon = inner
            .coupons
            .get_mut(code)
            .ok_or_else(|| StoreError::NotFound(format!("coupon {code}")))?;
        coupon.usage_count += 1;
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn record_payment(&self, tx: &PaymentTransaction) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.payments.contains_key(&tx.signature) {
            return Err(StoreError::Conflict {
                key: tx.signature.clone(),
            });
        }
        inner.payments.insert(tx.signature.clone(), tx.clone());
        Ok(())
    }

    async fn has_payment(&self, signature: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.payments.contains_key(signature))
    }

    async fn payment(&self, signature: &str) -> Result<Option<PaymentTransaction>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.payments.get(signature).cloned())
    }

    async fn has_payment_for(&self, resource_id: &str, wallet: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .payments
            .values()
            .any(|tx| tx.resource_id == resource_id && tx.wallet == wallet))
    }

    async fn save_quote(&self, quote: &Quote) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.quotes.insert(quote.quote_id, quote.clone());
        Ok(())
    }

    async fn load_quote(&self, id: &Uuid) -> Result<Option<Quote>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.quotes.get(id).cloned())
    }

    async fn consume_quote(&self, id: &Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.quotes.get_mut(id) {
            Some(quote) if !quote.consumed => {
                quote.consumed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn enqueue_webhook(&self, webhook: NewWebhook) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_webhook_id += 1;
        let id = inner.next_webhook_id;
        inner.webhooks.insert(
            id,
            PendingWebhook {
                id,
                url: webhook.url,
                payload: webhook.payload,
                headers: webhook.headers,
                event_type: webhook.event_type,
                status: WebhookStatus::Pending,
                attempts: 0,
                max_attempts: webhook.max_attempts,
                next_attempt_at: webhook.next_attempt_at,
                last_error: None,
                lease_at: None,
                created_at: webhook.created_at,
            },
        );
        Ok(id)
    }

    async fn dequeue_webhooks(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingWebhook>, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut claimed = Vec::new();
        for row in inner.webhooks.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if row.status == WebhookStatus::Pending && row.next_attempt_at <= now {
                row.status = WebhookStatus::Processing;
                row.lease_at = Some(now);
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_webhook_processing(
        &self,
        id: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .webhooks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("webhook {id}")))?;
        row.status = WebhookStatus::Processing;
        row.lease_at = Some(now);
        Ok(())
    }

    async fn mark_webhook_success(&self, id: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .webhooks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("webhook {id}")))?;
        row.status = WebhookStatus::Delivered;
        row.lease_at = None;
        Ok(())
    }

    async fn mark_webhook_failed(
        &self,
        id: u64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<WebhookStatus, StoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .webhooks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("webhook {id}")))?;
        row.attempts += 1;
        row.last_error = Some(error.to_string());
        row.lease_at = None;
        if row.attempts >= row.max_attempts {
            row.status = WebhookStatus::Dlq;
        } else {
            row.status = WebhookStatus::Pending;
            row.next_attempt_at = next_attempt_at;
        }
        Ok(row.status)
    }

    async fn reclaim_stale_leases(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut reclaimed = 0;
        for row in inner.webhooks.values_mut() {
            let stale = row.status == WebhookStatus::Processing
                && row.lease_at.is_some_and(|lease| lease < older_than);
            if stale {
                row.status = WebhookStatus::Pending;
                row.lease_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn list_dlq(&self, limit: usize) -> Result<Vec<PendingWebhook>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .webhooks
            .values()
            .filter(|row| row.status == WebhookStatus::Dlq)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn replay_dlq(&self, id: u64, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(row) = inner.webhooks.get_mut(&id) else {
            return Ok(false);
        };
        if row.status != WebhookStatus::Dlq {
            return Ok(false);
        }
        row.status = WebhookStatus::Pending;
        row.attempts = 0;
        row.next_attempt_at = now;
        row.lease_at = None;
        Ok(true)
    }

    async fn queue_depth(&self) -> Result<usize, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .webhooks
            .values()
            .filter(|row| {
                matches!(
                    row.status,
                    WebhookStatus::Pending | WebhookStatus::Processing
                )
            })
            .count())
    }

    async fn subscription(&self, id: &str) -> Result<Option<Subscription>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.subscriptions.get(id).cloned())
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    async fn find_subscription(
        &self,
        product_id: &str,
        subscriber: &SubscriberRef,
    ) -> Result<Option<Subscription>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .subscriptions
            .values()
            .find(|sub| sub.product_id == product_id && &sub.subscriber == subscriber)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Money, PaymentMethod};
    use std::sync::Arc;

    fn sample_tx(signature: &str) -> PaymentTransaction {
        PaymentTransaction {
            signature: signature.to_string(),
            resource_id: "article-1".to_string(),
            wallet: "wallet-1".to_string(),
            amount: Money::new(1_000_000, "USDC", 6),
            method: PaymentMethod::Crypto,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    fn sample_webhook(now: DateTime<Utc>, max_attempts: u32) -> NewWebhook {
        NewWebhook {
            url: "https://merchant.example/webhook".parse().expect("url"),
            payload: br#"{"eventType":"payment.succeeded"}"#.to_vec(),
            headers: HashMap::new(),
            event_type: "payment".to_string(),
            max_attempts,
            next_attempt_at: now,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn concurrent_record_payment_admits_exactly_one() {
        let store = Arc::new(MemoryStore::new());
        let tx = sample_tx("sig_X");

        let a = {
            let store = store.clone();
            let tx = tx.clone();
            tokio::spawn(async move { store.record_payment(&tx).await })
        };
        let b = {
            let store = store.clone();
            let tx = tx.clone();
            tokio::spawn(async move { store.record_payment(&tx).await })
        };

        let (a, b) = (a.await.expect("join"), b.await.expect("join"));
        let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
        let conflicts = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(StoreError::Conflict { .. })))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(conflicts, 1);
        assert!(store.has_payment("sig_X").await.expect("probe"));
    }

    #[tokio::test]
    async fn consume_quote_is_single_use() {
        let store = MemoryStore::new();
        let quote = Quote {
            quote_id: Uuid::new_v4(),
            resource_id: "article-1".to_string(),
            payer: None,
            method: PaymentMethod::Crypto,
            amount: 1_000_000,
            asset_code: "USDC".to_string(),
            coupon_code: None,
            applied_coupons: Vec::new(),
            original_amount: None,
            discount_amount: None,
            expires_at: Utc::now() + chrono::Duration::minutes(5),
            nonce: "00ff00ff00ff00ff00ff00ff".to_string(),
            memo: "pay:article-1".to_string(),
            consumed: false,
        };
        store.save_quote(&quote).await.expect("save");

        assert!(store.consume_quote(&quote.quote_id).await.expect("first"));
        assert!(!store.consume_quote(&quote.quote_id).await.expect("replay"));
        assert!(!store.consume_quote(&Uuid::new_v4()).await.expect("unknown"));
    }

    #[tokio::test]
    async fn dequeue_claims_rows_exclusively() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        for _ in 0..10 {
            store
                .enqueue_webhook(sample_webhook(now, 3))
                .await
                .expect("enqueue");
        }

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.dequeue_webhooks(10, now).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.dequeue_webhooks(10, now).await })
        };

        let mut ids: Vec<u64> = a
            .await
            .expect("join")
            .expect("dequeue")
            .into_iter()
            .chain(b.await.expect("join").expect("dequeue"))
            .map(|w| w.id)
            .collect();
        ids.sort_unstable();
        let before = ids.len();
        ids.dedup();
        assert_eq!(before, ids.len(), "a row was claimed twice");
        assert_eq!(ids.len(), 10);
    }

    #[tokio::test]
    async fn dequeue_skips_rows_scheduled_for_later() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut due = sample_webhook(now, 3);
        due.next_attempt_at = now - chrono::Duration::seconds(1);
        let mut later = sample_webhook(now, 3);
        later.next_attempt_at = now + chrono::Duration::seconds(30);

        let due_id = store.enqueue_webhook(due).await.expect("enqueue");
        store.enqueue_webhook(later).await.expect("enqueue");

        let claimed = store.dequeue_webhooks(10, now).await.expect("dequeue");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due_id);
        assert_eq!(claimed[0].status, WebhookStatus::Processing);
    }

    #[tokio::test]
    async fn failures_exhaust_into_dlq() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = store
            .enqueue_webhook(sample_webhook(now, 3))
            .await
            .expect("enqueue");

        for attempt in 1..=2u32 {
            let status = store
                .mark_webhook_failed(id, "connection refused", now)
                .await
                .expect("fail");
            assert_eq!(status, WebhookStatus::Pending, "attempt {attempt}");
        }
        let status = store
            .mark_webhook_failed(id, "connection refused", now)
            .await
            .expect("fail");
        assert_eq!(status, WebhookStatus::Dlq);

        let dlq = store.list_dlq(10).await.expect("dlq");
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].attempts, 3);
        assert_eq!(dlq[0].max_attempts, 3);
    }

    #[tokio::test]
    async fn replay_resets_dead_lettered_row() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = store
            .enqueue_webhook(sample_webhook(now, 1))
            .await
            .expect("enqueue");
        store
            .mark_webhook_failed(id, "boom", now)
            .await
            .expect("fail");

        assert!(store.replay_dlq(id, now).await.expect("replay"));
        let claimed = store.dequeue_webhooks(10, now).await.expect("dequeue");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 0);

        // Only dlq rows are replayable
        assert!(!store.replay_dlq(id, now).await.expect("replay"));
    }

    #[tokio::test]
    async fn stale_leases_are_reclaimed() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .enqueue_webhook(sample_webhook(now, 3))
            .await
            .expect("enqueue");

        let claimed = store.dequeue_webhooks(10, now).await.expect("dequeue");
        assert_eq!(claimed.len(), 1);

        // Lease still fresh: nothing to reclaim
        let reclaimed = store
            .reclaim_stale_leases(now - chrono::Duration::seconds(10))
            .await
            .expect("reclaim");
        assert_eq!(reclaimed, 0);

        let reclaimed = store
            .reclaim_stale_leases(now + chrono::Duration::seconds(10))
            .await
            .expect("reclaim");
        assert_eq!(reclaimed, 1);

        let claimed = store.dequeue_webhooks(10, now).await.expect("dequeue");
        assert_eq!(claimed.len(), 1, "reclaimed row is claimable again");
    }

    #[tokio::test]
    async fn payment_lookup_by_resource_and_wallet() {
        let store = MemoryStore::new();
        store
            .record_payment(&sample_tx("sig_A"))
            .await
            .expect("record");
        assert!(
            store
                .has_payment_for("article-1", "wallet-1")
                .await
                .expect("probe")
        );
        assert!(
            !store
                .has_payment_for("article-1", "wallet-2")
                .await
                .expect("probe")
        );
        assert!(
            !store
                .has_payment_for("article-2", "wallet-1")
                .await
                .expect("probe")
        );
    }
}
