//! Settlement admission control.
//!
//! [`SettlementRecorder`] is the single writer of payment records. Admission
//! is the store's atomic unique-insert on the proof signature: exactly one
//! concurrent caller for a given signature observes success, every other
//! caller observes [`GatewayError::SignatureAlreadyUsed`], which upstream
//! layers treat as a benign duplicate.
//!
//! On admission the recorder synchronously hands a [`PaymentEvent`] to the
//! webhook enqueuer. An enqueue failure is logged and reported through the
//! storage hook but does not roll back the settlement; the payment stays
//! counted.

use std::sync::Arc;

use crate::error::GatewayError;
use crate::events::PaymentEvent;
use crate::hooks::HookRegistry;
use crate::store::{Store, StoreError};
use crate::types::PaymentTransaction;
use crate::webhook::WebhookEnqueuer;

/// Atomically records payments and fans the outcome into the webhook queue.
pub struct SettlementRecorder {
    store: Arc<dyn Store>,
    enqueuer: Arc<WebhookEnqueuer>,
    hooks: Arc<HookRegistry>,
}

impl SettlementRecorder {
    pub fn new(
        store: Arc<dyn Store>,
        enqueuer: Arc<WebhookEnqueuer>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            store,
            enqueuer,
            hooks,
        }
    }

    /// Admit or reject the settlement for `tx.signature`.
    pub async fn record_payment(&self, tx: &PaymentTransaction) -> Result<(), GatewayError> {
        match self.store.record_payment(tx).await {
            Ok(()) => {
                self.hooks.payment_recorded(tx);
                let event = PaymentEvent::from_transaction(tx);
                if let Err(err) = self.enqueuer.enqueue_payment(event).await {
                    // The settlement is already durable; losing the webhook is
                    // recoverable from the payment record, losing the payment
                    // is not.
                    tracing::error!(
                        signature = %tx.signature,
                        error = %err,
                        "settled payment but failed to enqueue webhook"
                    );
                    self.hooks
                        .storage_error("enqueue_webhook", &err.to_string());
                }
                Ok(())
            }
            Err(StoreError::Conflict { key }) => {
                self.hooks.duplicate_payment(&key);
                Err(GatewayError::SignatureAlreadyUsed(key))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Existence probe for a recorded settlement.
    pub async fn has_payment(&self, signature: &str) -> Result<bool, GatewayError> {
        Ok(self.store.has_payment(signature).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::types::{Money, PaymentMethod};
    use crate::webhook::DeliveryConfig;
    use std::collections::HashMap;

    fn recorder() -> (Arc<MemoryStore>, Arc<SettlementRecorder>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        let hooks = Arc::new(HookRegistry::new());
        let cfg = DeliveryConfig {
            payment_url: Some("https://merchant.example/webhooks".parse().expect("url")),
            ..DeliveryConfig::default()
        };
        let enqueuer = Arc::new(WebhookEnqueuer::new(
            store.clone(),
            cfg,
            clock,
            hooks.clone(),
        ));
        let recorder = Arc::new(SettlementRecorder::new(store.clone(), enqueuer, hooks));
        (store, recorder)
    }

    fn tx(signature: &str) -> PaymentTransaction {
        PaymentTransaction {
            signature: signature.to_string(),
            resource_id: "article-1".to_string(),
            wallet: "wallet-1".to_string(),
            amount: Money::new(1_000_000, "USDC", 6),
            method: PaymentMethod::Crypto,
            created_at: chrono::Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn admission_enqueues_exactly_one_webhook() {
        let (store, recorder) = recorder();
        recorder.record_payment(&tx("sig_X")).await.expect("admit");
        assert_eq!(store.queue_depth().await.expect("depth"), 1);
        assert!(recorder.has_payment("sig_X").await.expect("probe"));
    }

    #[tokio::test]
    async fn duplicate_is_rejected_as_benign() {
        let (store, recorder) = recorder();
        recorder.record_payment(&tx("sig_X")).await.expect("admit");

        let err = recorder
            .record_payment(&tx("sig_X"))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, GatewayError::SignatureAlreadyUsed(sig) if sig == "sig_X"));

        // The duplicate produced no second webhook.
        assert_eq!(store.queue_depth().await.expect("depth"), 1);
    }

    #[tokio::test]
    async fn concurrent_settlements_admit_exactly_one() {
        let (store, recorder) = recorder();

        let a = {
            let recorder = recorder.clone();
            tokio::spawn(async move { recorder.record_payment(&tx("sig_X")).await })
        };
        let b = {
            let recorder = recorder.clone();
            tokio::spawn(async move { recorder.record_payment(&tx("sig_X")).await })
        };

        let results = [a.await.expect("join"), b.await.expect("join")];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let duplicates = results
            .iter()
            .filter(|r| matches!(r, Err(GatewayError::SignatureAlreadyUsed(_))))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(duplicates, 1);
        assert!(store.has_payment("sig_X").await.expect("probe"));
        assert_eq!(store.queue_depth().await.expect("depth"), 1);
    }

    #[tokio::test]
    async fn distinct_signatures_settle_independently() {
        let (store, recorder) = recorder();
        recorder.record_payment(&tx("sig_A")).await.expect("admit");
        recorder.record_payment(&tx("sig_B")).await.expect("admit");
        assert_eq!(store.queue_depth().await.expect("depth"), 2);
    }
}
