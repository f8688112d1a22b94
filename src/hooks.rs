//! Observability bus.
//!
//! Domain events fan out synchronously to registered hook implementations at
//! every service boundary: quote minting, settlement admission, webhook
//! delivery outcomes, checkout creation, downstream retries, and ingress
//! rejections. Fan-out is best-effort; a panicking hook is caught and logged,
//! never propagated to the caller.
//!
//! The registry is assembled once at startup and shared immutably afterwards.
//! [`HookRegistry::standard`] wires the built-in sinks: structured logging
//! via `tracing` and counters/histograms via the `metrics` facade.

use chrono::{DateTime, Utc};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use crate::events::RefundEvent;
use crate::types::{PaymentTransaction, Quote};

/// Delivery outcome details for a successful webhook attempt.
#[derive(Debug, Clone)]
pub struct WebhookDelivered {
    pub id: u64,
    pub event_type: String,
    pub attempts: u32,
    pub duration: Duration,
}

/// Details of a failed attempt that will be retried.
#[derive(Debug, Clone)]
pub struct WebhookRetried {
    pub id: u64,
    pub event_type: String,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub backoff: Duration,
    pub error: String,
}

/// Details of a webhook whose attempts are exhausted.
#[derive(Debug, Clone)]
pub struct WebhookDeadLettered {
    pub id: u64,
    pub event_type: String,
    pub attempts: u32,
    pub error: String,
}

/// A card checkout session handed to the processor.
#[derive(Debug, Clone)]
pub struct CheckoutCreated {
    pub session_id: String,
    pub line_items: usize,
    pub amount_atomic: i64,
    pub asset_code: String,
}

/// Payment-lifecycle observer.
pub trait PaymentHook: Send + Sync {
    fn on_quote_created(&self, _quote: &Quote) {}
    fn on_payment_recorded(&self, _tx: &PaymentTransaction) {}
    fn on_duplicate_payment(&self, _signature: &str) {}
    /// A coupon usage counter failed to increment after settlement. Usage
    /// counts now under-report; reconciliation can replay from here.
    fn on_coupon_usage_drift(&self, _code: &str, _error: &str) {}
}

/// Webhook-queue observer.
pub trait WebhookHook: Send + Sync {
    fn on_enqueued(&self, _id: u64, _event_type: &str) {}
    fn on_delivered(&self, _event: &WebhookDelivered) {}
    fn on_retried(&self, _event: &WebhookRetried) {}
    fn on_dead_lettered(&self, _event: &WebhookDeadLettered) {}
}

/// Refund observer.
pub trait RefundHook: Send + Sync {
    fn on_refund_enqueued(&self, _event: &RefundEvent) {}
}

/// Checkout observer.
pub trait CartHook: Send + Sync {
    fn on_checkout_created(&self, _event: &CheckoutCreated) {}
}

/// Downstream-call and ingress-defense observer.
pub trait RpcHook: Send + Sync {
    fn on_retry(&self, _service: &str, _attempt: u32, _error: &str) {}
    fn on_circuit_transition(&self, _service: &str, _from: &str, _to: &str) {}
    fn on_rate_limit_hit(&self, _layer: &str, _identifier: &str) {}
}

/// Storage observer.
pub trait StorageHook: Send + Sync {
    fn on_storage_error(&self, _operation: &str, _detail: &str) {}
}

/// Registry of hook implementations, built once at startup.
#[derive(Default)]
pub struct HookRegistry {
    payment: Vec<Arc<dyn PaymentHook>>,
    webhook: Vec<Arc<dyn WebhookHook>>,
    refund: Vec<Arc<dyn RefundHook>>,
    cart: Vec<Arc<dyn CartHook>>,
    rpc: Vec<Arc<dyn RpcHook>>,
    storage: Vec<Arc<dyn StorageHook>>,
}

fn guard(family: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!(family, "observability hook panicked");
    }
}

impl HookRegistry {
    /// An empty registry: every emit is a no-op.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in logging and metrics sinks attached to every
    /// hook family.
    pub fn standard() -> Self {
        let log = Arc::new(LogHook);
        let meter = Arc::new(MetricsHook);
        let mut registry = Self::new();
        registry.register_payment(log.clone());
        registry.register_payment(meter.clone());
        registry.register_webhook(log.clone());
        registry.register_webhook(meter.clone());
        registry.register_refund(log.clone());
        registry.register_refund(meter.clone());
        registry.register_cart(log.clone());
        registry.register_cart(meter.clone());
        registry.register_rpc(log.clone());
        registry.register_rpc(meter.clone());
        registry.register_storage(log);
        registry.register_storage(meter);
        registry
    }

    pub fn register_payment(&mut self, hook: Arc<dyn PaymentHook>) {
        self.payment.push(hook);
    }
    pub fn register_webhook(&mut self, hook: Arc<dyn WebhookHook>) {
        self.webhook.push(hook);
    }
    pub fn register_refund(&mut self, hook: Arc<dyn RefundHook>) {
        self.refund.push(hook);
    }
    pub fn register_cart(&mut self, hook: Arc<dyn CartHook>) {
        self.cart.push(hook);
    }
    pub fn register_rpc(&mut self, hook: Arc<dyn RpcHook>) {
        self.rpc.push(hook);
    }
    pub fn register_storage(&mut self, hook: Arc<dyn StorageHook>) {
        self.storage.push(hook);
    }

    pub fn quote_created(&self, quote: &Quote) {
        for hook in &self.payment {
            guard("payment", || hook.on_quote_created(quote));
        }
    }

    pub fn payment_recorded(&self, tx: &PaymentTransaction) {
        for hook in &self.payment {
            guard("payment", || hook.on_payment_recorded(tx));
        }
    }

    pub fn duplicate_payment(&self, signature: &str) {
        for hook in &self.payment {
            guard("payment", || hook.on_duplicate_payment(signature));
        }
    }

    pub fn coupon_usage_drift(&self, code: &str, error: &str) {
        for hook in &self.payment {
            guard("payment", || hook.on_coupon_usage_drift(code, error));
        }
    }

    pub fn webhook_enqueued(&self, id: u64, event_type: &str) {
        for hook in &self.webhook {
            guard("webhook", || hook.on_enqueued(id, event_type));
        }
    }

    pub fn webhook_delivered(&self, event: &WebhookDelivered) {
        for hook in &self.webhook {
            guard("webhook", || hook.on_delivered(event));
        }
    }

    pub fn webhook_retried(&self, event: &WebhookRetried) {
        for hook in &self.webhook {
            guard("webhook", || hook.on_retried(event));
        }
    }

    pub fn webhook_dead_lettered(&self, event: &WebhookDeadLettered) {
        for hook in &self.webhook {
            guard("webhook", || hook.on_dead_lettered(event));
        }
    }

    pub fn refund_enqueued(&self, event: &RefundEvent) {
        for hook in &self.refund {
            guard("refund", || hook.on_refund_enqueued(event));
        }
    }

    pub fn checkout_created(&self, event: &CheckoutCreated) {
        for hook in &self.cart {
            guard("cart", || hook.on_checkout_created(event));
        }
    }

    pub fn rpc_retry(&self, service: &str, attempt: u32, error: &str) {
        for hook in &self.rpc {
            guard("rpc", || hook.on_retry(service, attempt, error));
        }
    }

    pub fn circuit_transition(&self, service: &str, from: &str, to: &str) {
        for hook in &self.rpc {
            guard("rpc", || hook.on_circuit_transition(service, from, to));
        }
    }

    pub fn rate_limit_hit(&self, layer: &str, identifier: &str) {
        for hook in &self.rpc {
            guard("rpc", || hook.on_rate_limit_hit(layer, identifier));
        }
    }

    pub fn storage_error(&self, operation: &str, detail: &str) {
        for hook in &self.storage {
            guard("storage", || hook.on_storage_error(operation, detail));
        }
    }
}

/// Built-in structured-logging sink.
pub struct LogHook;

impl PaymentHook for LogHook {
    fn on_quote_created(&self, quote: &Quote) {
        tracing::info!(
            quote_id = %quote.quote_id,
            resource = %quote.resource_id,
            method = %quote.method,
            amount = quote.amount,
            asset = %quote.asset_code,
            "quote.created"
        );
    }

    fn on_payment_recorded(&self, tx: &PaymentTransaction) {
        tracing::info!(
            signature = %tx.signature,
            resource = %tx.resource_id,
            wallet = %tx.wallet,
            amount = tx.amount.atomic,
            asset = %tx.amount.asset.code,
            "payment.recorded"
        );
    }

    fn on_duplicate_payment(&self, signature: &str) {
        tracing::info!(signature, "payment.duplicate");
    }

    fn on_coupon_usage_drift(&self, code: &str, error: &str) {
        tracing::warn!(code, error, "coupon.usage_drift");
    }
}

impl WebhookHook for LogHook {
    fn on_enqueued(&self, id: u64, event_type: &str) {
        tracing::info!(id, event_type, "webhook.enqueued");
    }

    fn on_delivered(&self, event: &WebhookDelivered) {
        tracing::info!(
            id = event.id,
            event_type = %event.event_type,
            attempts = event.attempts,
            duration_ms = event.duration.as_millis() as u64,
            "webhook.delivered"
        );
    }

    fn on_retried(&self, event: &WebhookRetried) {
        tracing::warn!(
            id = event.id,
            event_type = %event.event_type,
            attempts = event.attempts,
            next_attempt_at = %event.next_attempt_at,
            backoff_ms = event.backoff.as_millis() as u64,
            error = %event.error,
            "webhook.retried"
        );
    }

    fn on_dead_lettered(&self, event: &WebhookDeadLettered) {
        tracing::error!(
            id = event.id,
            event_type = %event.event_type,
            attempts = event.attempts,
            error = %event.error,
            "webhook.dlq"
        );
    }
}

impl RefundHook for LogHook {
    fn on_refund_enqueued(&self, event: &RefundEvent) {
        tracing::info!(
            resource = %event.resource,
            signature = %event.proof_signature,
            "refund.enqueued"
        );
    }
}

impl CartHook for LogHook {
    fn on_checkout_created(&self, event: &CheckoutCreated) {
        tracing::info!(
            session_id = %event.session_id,
            line_items = event.line_items,
            amount = event.amount_atomic,
            asset = %event.asset_code,
            "checkout.created"
        );
    }
}

impl RpcHook for LogHook {
    fn on_retry(&self, service: &str, attempt: u32, error: &str) {
        tracing::warn!(service, attempt, error, "rpc.retry");
    }

    fn on_circuit_transition(&self, service: &str, from: &str, to: &str) {
        tracing::warn!(service, from, to, "circuit.transition");
    }

    fn on_rate_limit_hit(&self, layer: &str, identifier: &str) {
        tracing::warn!(layer, identifier, "rate_limit.hit");
    }
}

impl StorageHook for LogHook {
    fn on_storage_error(&self, operation: &str, detail: &str) {
        tracing::error!(operation, detail, "storage.error");
    }
}

/// Built-in metrics sink on the `metrics` facade.
pub struct MetricsHook;

impl PaymentHook for MetricsHook {
    fn on_quote_created(&self, quote: &Quote) {
        metrics::counter!("paygate_quotes_created_total", "method" => quote.method.to_string())
            .increment(1);
    }

    fn on_payment_recorded(&self, tx: &PaymentTransaction) {
        metrics::counter!("paygate_payments_settled_total", "method" => tx.method.to_string())
            .increment(1);
    }

    fn on_duplicate_payment(&self, _signature: &str) {
        metrics::counter!("paygate_payments_duplicate_total").increment(1);
    }

    fn on_coupon_usage_drift(&self, _code: &str, _error: &str) {
        metrics::counter!("paygate_coupon_usage_drift_total").increment(1);
    }
}

impl WebhookHook for MetricsHook {
    fn on_delivered(&self, event: &WebhookDelivered) {
        metrics::counter!(
            "paygate_webhook_delivered_total",
            "event_type" => event.event_type.clone()
        )
        .increment(1);
        metrics::histogram!("paygate_webhook_delivery_seconds")
            .record(event.duration.as_secs_f64());
    }

    fn on_retried(&self, event: &WebhookRetried) {
        metrics::counter!(
            "paygate_webhook_retried_total",
            "event_type" => event.event_type.clone()
        )
        .increment(1);
    }

    fn on_dead_lettered(&self, event: &WebhookDeadLettered) {
        metrics::counter!(
            "paygate_webhook_dlq_total",
            "event_type" => event.event_type.clone()
        )
        .increment(1);
    }
}

impl RefundHook for MetricsHook {
    fn on_refund_enqueued(&self, _event: &RefundEvent) {
        metrics::counter!("paygate_refunds_enqueued_total").increment(1);
    }
}

impl CartHook for MetricsHook {
    fn on_checkout_created(&self, _event: &CheckoutCreated) {
        metrics::counter!("paygate_checkouts_created_total").increment(1);
    }
}

impl RpcHook for MetricsHook {
    fn on_retry(&self, service: &str, _attempt: u32, _error: &str) {
        metrics::counter!("paygate_rpc_retries_total", "service" => service.to_string())
            .increment(1);
    }

    fn on_circuit_transition(&self, service: &str, _from: &str, to: &str) {
        if to == "open" {
            metrics::counter!("paygate_circuit_open_total", "service" => service.to_string())
                .increment(1);
        }
    }

    fn on_rate_limit_hit(&self, layer: &str, _identifier: &str) {
        metrics::counter!("paygate_rate_limit_hits_total", "layer" => layer.to_string())
            .increment(1);
    }
}

impl StorageHook for MetricsHook {
    fn on_storage_error(&self, operation: &str, _detail: &str) {
        metrics::counter!("paygate_storage_errors_total", "operation" => operation.to_string())
            .increment(1);
    }
}
