//! Error taxonomy for the gateway core.
//!
//! [`GatewayError`] covers every failure a core operation can surface. Each
//! variant carries a stable machine-readable code, a retryability flag, and an
//! HTTP status; the axum mapping lives with the HTTP handlers.
//!
//! Three propagation classes exist:
//! - recoverable within the current attempt: retried locally by
//!   [`crate::retry::with_retry`] (bounded);
//! - recoverable across attempts: handed to the webhook queue back-off or the
//!   circuit breaker;
//! - terminal: surfaced to the caller with the mapping below.

use crate::store::StoreError;
use crate::types::InvariantError;
use uuid::Uuid;

/// Everything that can go wrong inside the gateway core.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("product not found: {0}")]
    ProductNotFound(String),
    #[error("quote not found: {0}")]
    QuoteNotFound(Uuid),
    #[error("quote {quote_id} expired at {expires_at}")]
    QuoteExpired {
        quote_id: Uuid,
        expires_at: chrono::DateTime<chrono::Utc>,
    },
    /// Benign duplicate: the settlement for this signature was already
    /// counted. The facade maps this to success.
    #[error("payment signature already used: {0}")]
    SignatureAlreadyUsed(String),
    #[error("no {method} price configured for product {product_id}")]
    PricingUnavailable {
        product_id: String,
        method: crate::types::PaymentMethod,
    },
    #[error("coupon {code} not applicable: {reason}")]
    CouponNotApplicable { code: String, reason: String },
    #[error("coupon {0} expired")]
    CouponExpired(String),
    #[error("coupon {0} reached its usage limit")]
    CouponUsageLimitReached(String),
    #[error("unsupported asset: {0} is not an approved stablecoin")]
    UnsupportedAsset(String),
    #[error("rate limit exceeded on {layer} layer")]
    RateLimited {
        layer: &'static str,
        retry_after_seconds: u64,
    },
    #[error("circuit open for {service}")]
    CircuitOpen { service: String },
    #[error("timeout calling {service}")]
    DownstreamTimeout { service: String },
    #[error("transient failure from {service}: {detail}")]
    DownstreamTransient { service: String, detail: String },
    #[error("permanent failure from {service}: {detail}")]
    DownstreamPermanent { service: String, detail: String },
    #[error("storage conflict on {0}")]
    StorageConflict(String),
    #[error("validation failed: {0}")]
    Validation(String),
    /// The submitted payment proof did not verify.
    #[error("payment proof rejected: {0}")]
    ProofInvalid(String),
    /// The payment proof is not yet confirmed by the rail.
    #[error("payment proof still pending confirmation")]
    ProofPending,
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code for the error body.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::ProductNotFound(_) => "product_not_found",
            GatewayError::QuoteNotFound(_) => "quote_not_found",
            GatewayError::QuoteExpired { .. } => "quote_expired",
            GatewayError::SignatureAlreadyUsed(_) => "signature_already_used",
            GatewayError::PricingUnavailable { .. } => "pricing_unavailable",
            GatewayError::CouponNotApplicable { .. } => "coupon_not_applicable",
            GatewayError::CouponExpired(_) => "coupon_expired",
            GatewayError::CouponUsageLimitReached(_) => "coupon_usage_limit_reached",
            GatewayError::UnsupportedAsset(_) => "unsupported_asset",
            GatewayError::RateLimited { .. } => "rate_limit_exceeded",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::DownstreamTimeout { .. } => "downstream_timeout",
            GatewayError::DownstreamTransient { .. } => "downstream_transient",
            GatewayError::DownstreamPermanent { .. } => "downstream_permanent",
            GatewayError::StorageConflict(_) => "storage_conflict",
            GatewayError::Validation(_) => "validation_error",
            GatewayError::ProofInvalid(_) => "payment_proof_invalid",
            GatewayError::ProofPending => "payment_proof_pending",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Whether a caller may retry the same request and reasonably expect a
    /// different outcome.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited { .. }
                | GatewayError::CircuitOpen { .. }
                | GatewayError::DownstreamTimeout { .. }
                | GatewayError::DownstreamTransient { .. }
                | GatewayError::ProofPending
        )
    }

    /// HTTP status the facade maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::ProductNotFound(_) | GatewayError::QuoteNotFound(_) => 404,
            GatewayError::QuoteExpired { .. } => 410,
            // Mapped to success at the facade before this is ever rendered;
            // kept here for completeness of the table.
            GatewayError::SignatureAlreadyUsed(_) => 200,
            GatewayError::PricingUnavailable { .. }
            | GatewayError::CouponNotApplicable { .. }
            | GatewayError::CouponExpired(_)
            | GatewayError::CouponUsageLimitReached(_)
            | GatewayError::UnsupportedAsset(_)
            | GatewayError::Validation(_) => 400,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::CircuitOpen { .. } => 503,
            GatewayError::DownstreamTimeout { .. } | GatewayError::DownstreamTransient { .. } => {
                502
            }
            GatewayError::DownstreamPermanent { .. } => 502,
            GatewayError::StorageConflict(_) => 409,
            GatewayError::ProofInvalid(_) | GatewayError::ProofPending => 402,
            GatewayError::Internal(_) => 500,
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { key } => GatewayError::StorageConflict(key),
            // Domain-level lookups surface their own not-found errors before
            // reaching the store, so a store-level miss is an internal bug.
            StoreError::NotFound(key) => GatewayError::Internal(format!("missing row: {key}")),
            StoreError::Backend(detail) => GatewayError::Internal(detail),
        }
    }
}

impl From<InvariantError> for GatewayError {
    fn from(err: InvariantError) -> Self {
        GatewayError::Validation(err.to_string())
    }
}
