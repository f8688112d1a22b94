//! Subscription reconciliation.
//!
//! The billing rail owns subscription truth; this module mirrors its
//! lifecycle events into local [`Subscription`] records so access checks
//! never call out of process. Events arrive through the subscription webhook
//! route and are applied by [`SubscriptionReconciler::apply`].
//!
//! Local records are keyed by the external subscription id, so repeated
//! events for the same subscription upsert rather than duplicate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::GatewayError;
use crate::store::Store;
use crate::types::{
    BillingPeriod, PaymentMethod, SubscriberRef, Subscription, SubscriptionStatus,
};
use crate::verifier::VerifierError;

/// Canonical period bounds fetched from the billing rail.
#[derive(Debug, Clone)]
pub struct ExternalPeriod {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub status: Option<String>,
}

/// Source of canonical subscription state, consulted on `invoice.paid` to
/// extend the local period from the rail's record rather than trusting the
/// invoice payload alone. Deployments without rail access use
/// [`NullSubscriptionSource`] and fall back to the event payload.
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    async fn fetch(&self, external_id: &str) -> Result<Option<ExternalPeriod>, VerifierError>;
}

/// Source that never resolves; period bounds come from the event payload.
pub struct NullSubscriptionSource;

#[async_trait]
impl SubscriptionSource for NullSubscriptionSource {
    async fn fetch(&self, _external_id: &str) -> Result<Option<ExternalPeriod>, VerifierError> {
        Ok(None)
    }
}

/// A subscription lifecycle event as posted to the subscription webhook.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEvent {
    /// Processor event name, e.g. `customer.subscription.updated`.
    pub event_type: String,
    pub subscription_id: String,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub period_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trial_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_at_period_end: Option<bool>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub wallet: Option<String>,
    #[serde(default)]
    pub customer_ref: Option<String>,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
    #[serde(default)]
    pub billing_period: Option<BillingPeriod>,
    #[serde(default)]
    pub billing_interval: Option<u32>,
}

/// Recognized lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Created,
    Updated,
    Deleted,
    InvoicePaid,
    InvoicePaymentFailed,
    Unrecognized,
}

fn parse_kind(event_type: &str) -> EventKind {
    match event_type {
        "customer.subscription.created" | "checkout.session.completed" => EventKind::Created,
        "customer.subscription.updated" => EventKind::Updated,
        "customer.subscription.deleted" => EventKind::Deleted,
        "invoice.paid" => EventKind::InvoicePaid,
        "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
        _ => EventKind::Unrecognized,
    }
}

/// Map the processor's status vocabulary onto the local enumeration.
/// Unknown statuses land on `Expired`, denying access rather than granting
/// it.
fn map_external_status(status: &str) -> SubscriptionStatus {
    match status {
        "active" => SubscriptionStatus::Active,
        "trialing" => SubscriptionStatus::Trialing,
        "past_due" => SubscriptionStatus::PastDue,
        "canceled" | "cancelled" => SubscriptionStatus::Cancelled,
        _ => SubscriptionStatus::Expired,
    }
}

/// Applies external lifecycle events to local subscription records.
pub struct SubscriptionReconciler {
    store: Arc<dyn Store>,
    source: Arc<dyn SubscriptionSource>,
    clock: Arc<dyn Clock>,
}

impl SubscriptionReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn SubscriptionSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            source,
            clock,
        }
    }

    /// Apply one lifecycle event. Unrecognized event types are acknowledged
    /// and dropped so the processor does not retry them forever.
    pub async fn apply(&self, event: &SubscriptionEvent) -> Result<(), GatewayError> {
        match parse_kind(&event.event_type) {
            EventKind::Created => self.upsert_from_event(event).await,
            EventKind::Updated => self.overwrite_from_event(event).await,
            EventKind::Deleted => self.mark_cancelled(event).await,
            EventKind::InvoicePaid => self.extend_period(event).await,
            EventKind::InvoicePaymentFailed => {
                self.set_status(event, SubscriptionStatus::PastDue).await
            }
            EventKind::Unrecognized => {
                tracing::debug!(event_type = %event.event_type, "ignoring subscription event");
                Ok(())
            }
        }
    }

    fn subscriber_for(&self, event: &SubscriptionEvent) -> SubscriberRef {
        if let Some(wallet) = &event.wallet {
            SubscriberRef::Wallet(wallet.clone())
        } else if let Some(customer) = &event.customer_ref {
            SubscriberRef::CustomerRef(customer.clone())
        } else {
            SubscriberRef::ExternalSubId(event.subscription_id.clone())
        }
    }

    async fn upsert_from_event(&self, event: &SubscriptionEvent) -> Result<(), GatewayError> {
        let now = self.clock.now();
        let existing = self.store.subscription(&event.subscription_id).await?;
        let status = event
            .status
            .as_deref()
            .map(map_external_status)
            .unwrap_or(SubscriptionStatus::Active);

        let subscription = Subscription {
            id: event.subscription_id.clone(),
            product_id: event
                .product_id
                .clone()
                .or_else(|| existing.as_ref().map(|s| s.product_id.clone()))
                .unwrap_or_default(),
            subscriber: self.subscriber_for(event),
            payment_method: event.payment_method.unwrap_or(PaymentMethod::Fiat),
            billing_period: event.billing_period.unwrap_or(BillingPeriod::Month),
            billing_interval: event.billing_interval.unwrap_or(1),
            status,
            current_period_start: event.period_start.unwrap_or(now),
            current_period_end: event
                .period_end
                .unwrap_or(now + chrono::Duration::days(30)),
            trial_end: event.trial_end,
            cancelled_at: None,
            cancel_at_period_end: event.cancel_at_period_end.unwrap_or(false),
            metadata: existing.map(|s| s.metadata).unwrap_or_default(),
        };
        self.store.upsert_subscription(&subscription).await?;
        Ok(())
    }

    async fn overwrite_from_event(&self, event: &SubscriptionEvent) -> Result<(), GatewayError> {
        let Some(mut subscription) = self.store.subscription(&event.subscription_id).await? else {
            // An update for a subscription we never saw: treat as creation.
            return self.upsert_from_event(event).await;
        };

        if let Some(status) = event.status.as_deref() {
            subscription.status = map_external_status(status);
        }
        if let Some(start) = event.period_start {
            subscription.current_period_start = start;
        }
        if let Some(end) = event.period_end {
            subscription.current_period_end = end;
        }
        if let Some(flag) = event.cancel_at_period_end {
            subscription.cancel_at_period_end = flag;
        }
        if event.cancelled_at.is_some() {
            subscription.cancelled_at = event.cancelled_at;
        }
        if let Some(product_id) = &event.product_id {
            if *product_id != subscription.product_id {
                let previous = std::mem::replace(&mut subscription.product_id, product_id.clone());
                subscription.metadata.insert(
                    "previousProductId".to_string(),
                    serde_json::Value::String(previous),
                );
            }
        }
        self.store.upsert_subscription(&subscription).await?;
        Ok(())
    }

    async fn mark_cancelled(&self, event: &SubscriptionEvent) -> Result<(), GatewayError> {
        let Some(mut subscription) = self.store.subscription(&event.subscription_id).await? else {
            tracing::warn!(
                subscription_id = %event.subscription_id,
                "delete event for unknown subscription"
            );
            return Ok(());
        };
        subscription.status = SubscriptionStatus::Cancelled;
        if subscription.cancelled_at.is_none() {
            subscription.cancelled_at = Some(event.cancelled_at.unwrap_or_else(|| self.clock.now()));
        }
        self.store.upsert_subscription(&subscription).await?;
        Ok(())
    }

    async fn extend_period(&self, event: &SubscriptionEvent) -> Result<(), GatewayError> {
        let Some(mut subscription) = self.store.subscription(&event.subscription_id).await? else {
            tracing::warn!(
                subscription_id = %event.subscription_id,
                "invoice event for unknown subscription"
            );
            return Ok(());
        };

        // Prefer the canonical record; the invoice payload is the fallback.
        let canonical = self
            .source
            .fetch(&event.subscription_id)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(
                    subscription_id = %event.subscription_id,
                    error = %err,
                    "canonical subscription fetch failed, using invoice bounds"
                );
                None
            });

        match canonical {
            Some(period) => {
                subscription.current_period_start = period.period_start;
                subscription.current_period_end = period.period_end;
                subscription.status = period
                    .status
                    .as_deref()
                    .map(map_external_status)
                    .unwrap_or(SubscriptionStatus::Active);
            }
            None => {
                if let Some(start) = event.period_start {
                    subscription.current_period_start = start;
                }
                if let Some(end) = event.period_end {
                    subscription.current_period_end = end;
                }
                subscription.status = SubscriptionStatus::Active;
            }
        }
        self.store.upsert_subscription(&subscription).await?;
        Ok(())
    }

    async fn set_status(
        &self,
        event: &SubscriptionEvent,
        status: SubscriptionStatus,
    ) -> Result<(), GatewayError> {
        let Some(mut subscription) = self.store.subscription(&event.subscription_id).await? else {
            tracing::warn!(
                subscription_id = %event.subscription_id,
                "status event for unknown subscription"
            );
            return Ok(());
        };
        subscription.status = status;
        self.store.upsert_subscription(&subscription).await?;
        Ok(())
    }
}
