//! Control-plane facade.
//!
//! [`PaywallGateway`] presents the core as one coherent API to the HTTP
//! layer: access checks and quote minting, payment-proof submission, cart
//! checkout, card-processor webhook ingestion, subscription reconciliation,
//! and the administrative queries. Construction is leaves-first dependency
//! injection; no component holds a reference back to the facade.
//!
//! Card-processor webhooks are authenticated here with an HMAC-SHA256
//! signature over `"{timestamp}.{body}"`, carried in a `t=...,v1=...` header
//! with a five-minute timestamp tolerance.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::CatalogCache;
use crate::circuit_breaker::{BreakerError, BreakerRegistry};
use crate::clock::Clock;
use crate::error::GatewayError;
use crate::events::RefundEvent;
use crate::hooks::{CheckoutCreated, HookRegistry};
use crate::idempotency::IdempotencyStore;
use crate::quote::QuoteEngine;
use crate::settlement::SettlementRecorder;
use crate::store::Store;
use crate::subscription::{SubscriptionEvent, SubscriptionReconciler};
use crate::types::{
    Coupon, Money, PaymentMethod, PaymentTransaction, PendingWebhook, Quote, SubscriberRef,
};
use crate::verifier::{
    CardRail, CartLine, CheckoutSession, PaymentProof, PricedCart, PricedLine,
};
use crate::webhook::WebhookEnqueuer;

/// Timestamp tolerance for card webhook signatures.
const CARD_SIGNATURE_TOLERANCE_SECS: i64 = 300;

const CARD_API: &str = "card_api";

/// Outcome of an access check on a paywalled resource.
#[derive(Debug, Clone)]
pub enum AccessDecision {
    /// The caller already paid or holds an active subscription.
    Granted,
    /// Payment required: a freshly minted quote.
    PaymentRequired(Box<Quote>),
}

/// Health snapshot for the discovery endpoint.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub queue_depth: usize,
    pub breakers: HashMap<String, String>,
}

/// A card-processor webhook event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct CardEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: CardEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardEventData {
    pub object: serde_json::Value,
}

/// The facade over the payment core.
pub struct PaywallGateway {
    catalog: Arc<CatalogCache>,
    store: Arc<dyn Store>,
    quotes: Arc<QuoteEngine>,
    settlement: Arc<SettlementRecorder>,
    enqueuer: Arc<WebhookEnqueuer>,
    reconciler: Arc<SubscriptionReconciler>,
    card_rail: Arc<dyn CardRail>,
    breakers: Arc<BreakerRegistry>,
    idempotency: Arc<IdempotencyStore>,
    hooks: Arc<HookRegistry>,
    clock: Arc<dyn Clock>,
    card_webhook_secret: Option<String>,
}

impl PaywallGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<CatalogCache>,
        store: Arc<dyn Store>,
        quotes: Arc<QuoteEngine>,
        settlement: Arc<SettlementRecorder>,
        enqueuer: Arc<WebhookEnqueuer>,
        reconciler: Arc<SubscriptionReconciler>,
        card_rail: Arc<dyn CardRail>,
        breakers: Arc<BreakerRegistry>,
        idempotency: Arc<IdempotencyStore>,
        hooks: Arc<HookRegistry>,
        clock: Arc<dyn Clock>,
        card_webhook_secret: Option<String>,
    ) -> Self {
        Self {
            catalog,
            store,
            quotes,
            settlement,
            enqueuer,
            reconciler,
            card_rail,
            breakers,
            idempotency,
            hooks,
            clock,
            card_webhook_secret,
        }
    }

    /// Access check for `GET /api/paywall/{resource}`: grant when the wallet
    /// already paid or subscribes, otherwise mint a quote.
    pub async fn quote_or_grant(
        &self,
        resource_id: &str,
        method: Option<PaymentMethod>,
        coupon_code: Option<&str>,
        wallet: Option<&str>,
    ) -> Result<AccessDecision, GatewayError> {
        if let Some(wallet) = wallet {
            let subscriber = SubscriberRef::Wallet(wallet.to_string());
            let subscribed = self
                .store
                .find_subscription(resource_id, &subscriber)
                .await?
                .is_some_and(|sub| sub.is_active_at(self.clock.now()));
            if subscribed || self.store.has_payment_for(resource_id, wallet).await? {
                return Ok(AccessDecision::Granted);
            }
        }

        let method = match method {
            Some(method) => method,
            None => self.default_method(resource_id).await?,
        };
        let quote = self
            .quotes
            .create_quote(resource_id, method, coupon_code, wallet)
            .await?;
        Ok(AccessDecision::PaymentRequired(Box::new(quote)))
    }

    /// Prefer the crypto rail when the product is priced on it, otherwise
    /// fall back to fiat.
    async fn default_method(&self, resource_id: &str) -> Result<PaymentMethod, GatewayError> {
        let product = self
            .catalog
            .product(resource_id)
            .await?
            .filter(|p| p.active)
            .ok_or_else(|| GatewayError::ProductNotFound(resource_id.to_string()))?;
        Ok(if product.crypto_price.is_some() {
            PaymentMethod::Crypto
        } else {
            PaymentMethod::Fiat
        })
    }

    /// Settle a submitted payment proof. A duplicate settlement is mapped to
    /// the recorded transaction, making proof submission idempotent.
    pub async fn submit_payment(
        &self,
        resource_id: &str,
        proof: &PaymentProof,
    ) -> Result<PaymentTransaction, GatewayError> {
        let quote = self
            .store
            .load_quote(&proof.quote_id)
            .await?
            .ok_or(GatewayError::QuoteNotFound(proof.quote_id))?;
        if quote.resource_id != resource_id {
            return Err(GatewayError::Validation(format!(
                "quote {} does not cover resource {resource_id}",
                proof.quote_id
            )));
        }
        match self.quotes.consume_quote(&proof.quote_id, proof).await {
            Ok(tx) => Ok(tx),
            Err(GatewayError::SignatureAlreadyUsed(signature)) => self
                .store
                .payment(&signature)
                .await?
                .ok_or_else(|| GatewayError::SignatureAlreadyUsed(signature)),
            Err(err) => Err(err),
        }
    }

    /// Price a cart and open a hosted card checkout session.
    pub async fn checkout_cart(
        &self,
        lines: &[CartLine],
        coupon_code: Option<&str>,
    ) -> Result<CheckoutSession, GatewayError> {
        if lines.is_empty() {
            return Err(GatewayError::Validation("cart is empty".to_string()));
        }
        let now = self.clock.now();
        let mut priced = Vec::with_capacity(lines.len());
        let mut total: i64 = 0;
        let mut asset_code: Option<String> = None;

        for line in lines {
            if line.quantity == 0 {
                return Err(GatewayError::Validation(format!(
                    "zero quantity for product {}",
                    line.product_id
                )));
            }
            let product = self
                .catalog
                .product(&line.product_id)
                .await?
                .filter(|p| p.active)
                .ok_or_else(|| GatewayError::ProductNotFound(line.product_id.clone()))?;
            let unit = product.fiat_price.clone();
            if unit.is_none() && product.stripe_price_id.is_none() {
                return Err(GatewayError::PricingUnavailable {
                    product_id: product.id.clone(),
                    method: PaymentMethod::Fiat,
                });
            }
            if let Some(unit) = &unit {
                if let Some(code) = &asset_code {
                    if *code != unit.asset.code {
                        return Err(GatewayError::Validation(format!(
                            "mixed currencies in cart: {code} and {}",
                            unit.asset.code
                        )));
                    }
                } else {
                    asset_code = Some(unit.asset.code.clone());
                }
                total += unit.atomic * i64::from(line.quantity);
            }
            priced.push(PricedLine {
                product_id: product.id.clone(),
                quantity: line.quantity,
                unit_amount: unit.map(|m| m.atomic),
                price_id: product.stripe_price_id.clone(),
            });
        }

        let mut coupon_codes = Vec::new();
        if let Some(code) = coupon_code {
            let coupon =
                self.catalog
                    .coupon(code)
                    .await?
                    .ok_or_else(|| GatewayError::CouponNotApplicable {
                        code: code.to_string(),
                        reason: "unknown coupon".to_string(),
                    })?;
            if !coupon.is_valid_at(now) || !coupon.applies_to_method(PaymentMethod::Fiat) {
                return Err(GatewayError::CouponNotApplicable {
                    code: code.to_string(),
                    reason: "coupon is not redeemable at checkout".to_string(),
                });
            }
            total = coupon.apply_discount(total);
            coupon_codes.push(coupon.code);
        }
        if let Some(auto) = self.checkout_auto_coupon(now, coupon_code).await? {
            total = auto.apply_discount(total);
            coupon_codes.push(auto.code);
        }

        let cart = PricedCart {
            lines: priced,
            total_atomic: total,
            asset_code: asset_code.unwrap_or_else(|| "USD".to_string()),
            coupon_codes,
        };
        let session = self
            .breakers
            .execute(CARD_API, || self.card_rail.create_checkout_session(&cart))
            .await
            .map_err(|err| match err {
                BreakerError::Open { service } => GatewayError::CircuitOpen { service },
                BreakerError::Inner(inner) => inner.into_gateway(CARD_API),
            })?;
        self.hooks.checkout_created(&CheckoutCreated {
            session_id: session.id.clone(),
            line_items: cart.lines.len(),
            amount_atomic: cart.total_atomic,
            asset_code: cart.asset_code.clone(),
        });
        Ok(session)
    }

    async fn checkout_auto_coupon(
        &self,
        now: DateTime<Utc>,
        explicit: Option<&str>,
    ) -> Result<Option<Coupon>, GatewayError> {
        let mut candidates: Vec<Coupon> = self
            .catalog
            .list_coupons()
            .await?
            .into_iter()
            .filter(|c| {
                c.auto_apply
                    && c.applies_at == Some(crate::types::AppliesAt::Checkout)
                    && Some(c.code.as_str()) != explicit
                    && c.is_valid_at(now)
                    && c.applies_to_method(PaymentMethod::Fiat)
            })
            .collect();
        candidates.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(candidates.into_iter().next())
    }

    /// Ingest a card-processor webhook: authenticate, deduplicate on the
    /// processor event id, then dispatch by event type.
    pub async fn ingest_card_event(
        &self,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> Result<(), GatewayError> {
        if let Some(secret) = &self.card_webhook_secret {
            let header = signature_header.ok_or_else(|| {
                GatewayError::Validation("missing card webhook signature header".to_string())
            })?;
            verify_card_signature(body, header, secret, self.clock.now())?;
        }

        let event: CardEvent = serde_json::from_slice(body)
            .map_err(|err| GatewayError::Validation(format!("malformed card event: {err}")))?;

        // Processor-side retries reuse the event id; replay them as no-ops.
        let dedup_key = format!("card-event:{}", event.id);
        if self.idempotency.get(&dedup_key).is_some() {
            tracing::debug!(event_id = %event.id, "card event already processed");
            return Ok(());
        }

        let result = self.dispatch_card_event(&event).await;
        if result.is_ok() {
            self.idempotency.put(&dedup_key, 200, Vec::new());
        }
        result
    }

    async fn dispatch_card_event(&self, event: &CardEvent) -> Result<(), GatewayError> {
        match event.event_type.as_str() {
            "checkout.session.completed" => self.settle_card_session(&event.data.object).await,
            "charge.refunded" => self.enqueue_card_refund(&event.data.object).await,
            "customer.subscription.created"
            | "customer.subscription.updated"
            | "customer.subscription.deleted"
            | "invoice.paid"
            | "invoice.payment_failed" => {
                let Some(subscription_event) =
                    subscription_event_from_card(&event.event_type, &event.data.object)
                else {
                    tracing::warn!(
                        event_type = %event.event_type,
                        "card event without subscription reference"
                    );
                    return Ok(());
                };
                self.reconciler.apply(&subscription_event).await
            }
            other => {
                tracing::debug!(event_type = %other, "ignoring card event");
                Ok(())
            }
        }
    }

    async fn settle_card_session(&self, object: &serde_json::Value) -> Result<(), GatewayError> {
        let session_id = object
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::Validation("checkout session without id".to_string()))?;
        let metadata = object.get("metadata").cloned().unwrap_or_default();
        let resource_id = metadata
            .get("resourceId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let wallet = metadata
            .get("wallet")
            .and_then(|v| v.as_str())
            .or_else(|| object.get("customer").and_then(|v| v.as_str()))
            .unwrap_or_default()
            .to_string();
        let amount = object
            .get("amountTotal")
            .or_else(|| object.get("amount_total"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let currency = object
            .get("currency")
            .and_then(|v| v.as_str())
            .unwrap_or("USD")
            .to_uppercase();

        let mut tx_metadata = HashMap::new();
        tx_metadata.insert(
            "checkoutSession".to_string(),
            serde_json::Value::String(session_id.to_string()),
        );
        let tx = PaymentTransaction {
            signature: session_id.to_string(),
            resource_id,
            wallet,
            amount: Money::new(amount, currency, 2),
            method: PaymentMethod::Fiat,
            created_at: self.clock.now(),
            metadata: tx_metadata,
        };
        match self.settlement.record_payment(&tx).await {
            // A redelivered completion event is a benign duplicate.
            Err(GatewayError::SignatureAlreadyUsed(_)) => Ok(()),
            other => other,
        }
    }

    async fn enqueue_card_refund(&self, object: &serde_json::Value) -> Result<(), GatewayError> {
        let signature = object
            .get("paymentIntent")
            .or_else(|| object.get("payment_intent"))
            .or_else(|| object.get("id"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let resource = self
            .store
            .payment(&signature)
            .await?
            .map(|tx| tx.resource_id)
            .unwrap_or_default();
        let amount = object
            .get("amountRefunded")
            .or_else(|| object.get("amount_refunded"))
            .and_then(|v| v.as_i64());
        let currency = object
            .get("currency")
            .and_then(|v| v.as_str())
            .map(str::to_uppercase);

        let event = RefundEvent {
            event_id: None,
            event_type: None,
            event_timestamp: None,
            resource,
            method: PaymentMethod::Fiat,
            fiat_amount_cents: amount,
            fiat_currency: currency,
            crypto_atomic_amount: None,
            crypto_token: None,
            wallet: None,
            proof_signature: signature,
            reason: object
                .get("reason")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            metadata: HashMap::new(),
            refunded_at: None,
        };
        self.enqueuer.enqueue_refund(event).await?;
        Ok(())
    }

    /// Apply a subscription lifecycle event from the subscription webhook.
    pub async fn reconcile_subscription(
        &self,
        event: &SubscriptionEvent,
    ) -> Result<(), GatewayError> {
        self.reconciler.apply(event).await
    }

    /// Administrative lookup of a recorded payment.
    pub async fn payment(
        &self,
        signature: &str,
    ) -> Result<Option<PaymentTransaction>, GatewayError> {
        Ok(self.store.payment(signature).await?)
    }

    /// Dead-letter inspection.
    pub async fn list_dlq(&self, limit: usize) -> Result<Vec<PendingWebhook>, GatewayError> {
        Ok(self.store.list_dlq(limit).await?)
    }

    /// Re-enqueue a dead-lettered webhook with a fresh attempt budget.
    pub async fn replay_dlq(&self, id: u64) -> Result<bool, GatewayError> {
        Ok(self.store.replay_dlq(id, self.clock.now()).await?)
    }

    pub async fn health(&self) -> Result<HealthReport, GatewayError> {
        Ok(HealthReport {
            queue_depth: self.store.queue_depth().await?,
            breakers: self
                .breakers
                .states()
                .into_iter()
                .map(|(service, state)| (service, state.to_string()))
                .collect(),
        })
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Verify a `t=<unix>,v1=<hex hmac>` signature header over
/// `"{timestamp}.{body}"`, rejecting stale timestamps.
pub fn verify_card_signature(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> Result<(), GatewayError> {
    let parts: HashMap<&str, &str> = signature_header
        .split(',')
        .filter_map(|part| {
            let mut split = part.trim().splitn(2, '=');
            Some((split.next()?, split.next()?))
        })
        .collect();

    let timestamp = parts
        .get("t")
        .ok_or_else(|| GatewayError::Validation("signature header missing timestamp".to_string()))?;
    let expected = parts
        .get("v1")
        .ok_or_else(|| GatewayError::Validation("signature header missing v1".to_string()))?;

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| GatewayError::Validation("invalid signature timestamp".to_string()))?;
    if (now.timestamp() - ts).abs() > CARD_SIGNATURE_TOLERANCE_SECS {
        return Err(GatewayError::Validation(
            "webhook timestamp outside tolerance".to_string(),
        ));
    }

    let expected_bytes = hex::decode(expected)
        .map_err(|_| GatewayError::Validation("signature is not valid hex".to_string()))?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| GatewayError::Internal("invalid webhook secret".to_string()))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac.verify_slice(&expected_bytes)
        .map_err(|_| GatewayError::Validation("webhook signature mismatch".to_string()))
}

/// Compute the signature header for a payload; used by tests and the
/// outbound-signing tooling.
pub fn sign_card_payload(payload: &[u8], secret: &str, now: DateTime<Utc>) -> String {
    let timestamp = now.timestamp().to_string();
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

/// Pull the subscription reference out of a card event object.
fn subscription_event_from_card(
    event_type: &str,
    object: &serde_json::Value,
) -> Option<SubscriptionEvent> {
    let subscription_id = object
        .get("subscription")
        .and_then(|v| v.as_str())
        .or_else(|| {
            event_type
                .starts_with("customer.subscription.")
                .then(|| object.get("id").and_then(|v| v.as_str()))
                .flatten()
        })?
        .to_string();

    let get_time = |keys: [&str; 2]| {
        keys.iter().find_map(|key| {
            object
                .get(*key)
                .and_then(|v| v.as_i64())
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
        })
    };

    Some(SubscriptionEvent {
        event_type: event_type.to_string(),
        subscription_id,
        product_id: object
            .get("metadata")
            .and_then(|m| m.get("productId"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        status: object
            .get("status")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        period_start: get_time(["currentPeriodStart", "current_period_start"]),
        period_end: get_time(["currentPeriodEnd", "current_period_end"]),
        trial_end: get_time(["trialEnd", "trial_end"]),
        cancel_at_period_end: object
            .get("cancelAtPeriodEnd")
            .or_else(|| object.get("cancel_at_period_end"))
            .and_then(|v| v.as_bool()),
        cancelled_at: get_time(["canceledAt", "canceled_at"]),
        wallet: object
            .get("metadata")
            .and_then(|m| m.get("wallet"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        customer_ref: object
            .get("customer")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        payment_method: Some(PaymentMethod::Fiat),
        billing_period: None,
        billing_interval: None,
    })
}
