//! Domain model for the paywall gateway.
//!
//! These are the entities shared by the quote engine, settlement recorder,
//! webhook queue, and subscription reconciler: products and coupons (the
//! catalog), short-lived purchase [`Quote`]s, recorded [`PaymentTransaction`]s
//! keyed by proof signature, persistent [`PendingWebhook`] queue rows, and
//! merchant [`Subscription`] records.
//!
//! Monetary amounts are always atomic integer minor units plus an [`Asset`]
//! descriptor. There is no floating-point money anywhere in the crate.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;
use url::Url;
use uuid::Uuid;

/// Payment rail selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Fiat,
    Crypto,
}

impl Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentMethod::Fiat => "fiat",
            PaymentMethod::Crypto => "crypto",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fiat" => Ok(PaymentMethod::Fiat),
            "crypto" => Ok(PaymentMethod::Crypto),
            other => Err(format!("unknown payment method: {other}")),
        }
    }
}

/// Currency or token descriptor: ISO code or token symbol plus the number of
/// decimal places one whole unit carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub code: String,
    pub decimals: u8,
}

impl Asset {
    pub fn new(code: impl Into<String>, decimals: u8) -> Self {
        Self {
            code: code.into(),
            decimals,
        }
    }
}

/// An amount of money in atomic minor units of an [`Asset`].
///
/// `Money { atomic: 1000, asset: USD(2) }` is $10.00.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub atomic: i64,
    pub asset: Asset,
}

impl Money {
    pub fn new(atomic: i64, code: impl Into<String>, decimals: u8) -> Self {
        Self {
            atomic,
            asset: Asset::new(code, decimals),
        }
    }
}

impl Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}(atomic)", self.atomic, self.asset.code)
    }
}

/// A violated data-model invariant, reported at validation boundaries.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvariantError {
    #[error("active product {0} has no fiat price, crypto price, or card price id")]
    ProductWithoutPrice(String),
    #[error("coupon {0}: catalog coupons require specific scope with product ids")]
    CatalogCouponScope(String),
    #[error("coupon {0}: checkout coupons require scope=all")]
    CheckoutCouponScope(String),
    #[error("coupon {0}: auto-apply requires an application stage")]
    AutoApplyWithoutStage(String),
}

/// A sellable resource with optional prices on each rail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fiat_price: Option<Money>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_price: Option<Money>,
    /// Price id on the card processor, for processor-hosted pricing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_price_id: Option<String>,
    /// Receiving account for crypto settlement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_account: Option<String>,
    /// Template for on-chain transfer memos. Supports `{resource}` and `{nonce}`.
    #[serde(default)]
    pub memo_template: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// Check the pricing invariant: an active product must be purchasable on
    /// at least one rail.
    pub fn validate(&self) -> Result<(), InvariantError> {
        if self.active
            && self.fiat_price.is_none()
            && self.crypto_price.is_none()
            && self.stripe_price_id.is_none()
        {
            return Err(InvariantError::ProductWithoutPrice(self.id.clone()));
        }
        Ok(())
    }

    /// Locally priced amount for the given rail, if any.
    ///
    /// A product carrying only a processor-hosted price id has no local fiat
    /// amount; such products are priced by the card rail at checkout.
    pub fn price_for(&self, method: PaymentMethod) -> Option<&Money> {
        match method {
            PaymentMethod::Fiat => self.fiat_price.as_ref(),
            PaymentMethod::Crypto => self.crypto_price.as_ref(),
        }
    }
}

/// How a coupon's `discount_value` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    /// `discount_value` percent off the amount.
    Percentage,
    /// `discount_value` atomic units off the amount, clamped at zero.
    Fixed,
}

/// Which products a coupon covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CouponScope {
    All,
    Specific,
}

/// Which payment rails a coupon covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodFilter {
    Any,
    Fiat,
    Crypto,
}

impl MethodFilter {
    pub fn matches(&self, method: PaymentMethod) -> bool {
        match self {
            MethodFilter::Any => true,
            MethodFilter::Fiat => method == PaymentMethod::Fiat,
            MethodFilter::Crypto => method == PaymentMethod::Crypto,
        }
    }
}

/// Stage at which a coupon is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppliesAt {
    /// Discount is visible on the catalog price of specific products.
    Catalog,
    /// Discount applies to the checkout total across the whole catalog.
    Checkout,
}

/// A discount code with validity window, usage accounting, and scoping rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coupon {
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub scope: CouponScope,
    #[serde(default)]
    pub product_ids: Vec<String>,
    #[serde(default = "MethodFilter::any")]
    pub payment_method: MethodFilter,
    #[serde(default)]
    pub auto_apply: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applies_at: Option<AppliesAt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_limit: Option<u64>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MethodFilter {
    fn any() -> Self {
        MethodFilter::Any
    }
}

impl Coupon {
    /// Check the structural invariants on scope and application stage.
    pub fn validate(&self) -> Result<(), InvariantError> {
        match self.applies_at {
            Some(AppliesAt::Catalog) => {
                if self.scope != CouponScope::Specific || self.product_ids.is_empty() {
                    return Err(InvariantError::CatalogCouponScope(self.code.clone()));
                }
            }
            Some(AppliesAt::Checkout) => {
                if self.scope != CouponScope::All {
                    return Err(InvariantError::CheckoutCouponScope(self.code.clone()));
                }
            }
            None => {
                if self.auto_apply {
                    return Err(InvariantError::AutoApplyWithoutStage(self.code.clone()));
                }
            }
        }
        Ok(())
    }

    /// Whether the coupon is redeemable at `now`: active, inside its validity
    /// window, and below its usage limit.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if !self.active {
            return false;
        }
        if let Some(starts_at) = self.starts_at {
            if starts_at > now {
                return false;
            }
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at <= now {
                return false;
            }
        }
        match self.usage_limit {
            Some(limit) => self.usage_count < limit,
            None => true,
        }
    }

    pub fn applies_to_product(&self, product_id: &str) -> bool {
        match self.scope {
            CouponScope::All => true,
            CouponScope::Specific => self.product_ids.iter().any(|id| id == product_id),
        }
    }

    pub fn applies_to_method(&self, method: PaymentMethod) -> bool {
        self.payment_method.matches(method)
    }

    /// Amount of discount, in atomic units, this coupon takes off `amount`.
    ///
    /// Percentage discounts round half-up to whole atomic units. The result
    /// never exceeds `amount`.
    pub fn discount_amount(&self, amount: i64) -> i64 {
        let discount = match self.discount_type {
            DiscountType::Percentage => {
                let raw = Decimal::from(amount) * self.discount_value / Decimal::from(100);
                raw.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
                    .to_i64()
                    .unwrap_or(0)
            }
            DiscountType::Fixed => self
                .discount_value
                .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
                .to_i64()
                .unwrap_or(0),
        };
        discount.clamp(0, amount)
    }

    /// `amount` after this coupon, clamped at zero.
    pub fn apply_discount(&self, amount: i64) -> i64 {
        amount - self.discount_amount(amount)
    }
}

/// A short-lived, single-use priced intent to purchase a resource.
///
/// Minted by the quote engine, persisted, and consumed exactly once when a
/// payment proof arrives. `nonce` feeds the transfer memo so on-chain payments
/// can be matched back to the quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub quote_id: Uuid,
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    pub method: PaymentMethod,
    /// Final amount after discounts, atomic units of `asset_code`.
    pub amount: i64,
    pub asset_code: String,
    /// Explicitly supplied coupon, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coupon_code: Option<String>,
    /// All coupons that contributed to the price (explicit plus auto-apply),
    /// tracked for usage accounting at consumption time.
    #[serde(default)]
    pub applied_coupons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_amount: Option<i64>,
    pub expires_at: DateTime<Utc>,
    /// 96-bit random value, hex encoded.
    pub nonce: String,
    pub memo: String,
    /// Single-use marker, flipped atomically by the store.
    #[serde(default)]
    pub consumed: bool,
}

/// A recorded settlement. `signature` is the system-wide unique key: the
/// transaction hash for crypto payments, the checkout session id for card
/// payments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTransaction {
    pub signature: String,
    pub resource_id: String,
    pub wallet: String,
    pub amount: Money,
    pub method: PaymentMethod,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Delivery state of a queued webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
    Dlq,
}

impl Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WebhookStatus::Pending => "pending",
            WebhookStatus::Processing => "processing",
            WebhookStatus::Delivered => "delivered",
            WebhookStatus::Failed => "failed",
            WebhookStatus::Dlq => "dlq",
        };
        write!(f, "{s}")
    }
}

/// Insert form of a queue row; the store assigns the id and initial status.
#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub url: Url,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub event_type: String,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A persistent webhook queue row.
///
/// Rows in `processing` carry a lease timestamp; a row whose lease outlives
/// the reclaim window is handed back to `pending` on worker startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWebhook {
    pub id: u64,
    pub url: Url,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub event_type: String,
    pub status: WebhookStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Billing cadence unit for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    Day,
    Week,
    Month,
    Year,
}

/// Lifecycle state of a subscription as mirrored from the billing rail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Cancelled,
    Expired,
}

/// Identity of a subscriber, whichever rail it arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriberRef {
    Wallet(String),
    CustomerRef(String),
    ExternalSubId(String),
}

/// A local mirror of a subscription managed by an external billing rail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub product_id: String,
    pub subscriber: SubscriberRef,
    pub payment_method: PaymentMethod,
    pub billing_period: BillingPeriod,
    pub billing_interval: u32,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Subscription {
    /// Access predicate: grants access while the status is serviceable and
    /// `t` falls inside the current billing period.
    pub fn is_active_at(&self, t: DateTime<Utc>) -> bool {
        let serviceable = matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        );
        serviceable && self.current_period_start <= t && t < self.current_period_end
    }
}

/// A cached response for a caller-supplied idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub key: String,
    pub response: Vec<u8>,
    pub status_code: u16,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn base_coupon(code: &str) -> Coupon {
        Coupon {
            code: code.to_string(),
            discount_type: DiscountType::Percentage,
            discount_value: Decimal::from(20),
            scope: CouponScope::All,
            product_ids: Vec::new(),
            payment_method: MethodFilter::Any,
            auto_apply: false,
            applies_at: None,
            usage_limit: None,
            usage_count: 0,
            starts_at: None,
            expires_at: None,
            active: true,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn percentage_discount() {
        let coupon = base_coupon("SAVE20");
        assert_eq!(coupon.apply_discount(100), 80);
    }

    #[test]
    fn fixed_discount_clamps_at_zero() {
        let mut coupon = base_coupon("FIXED150");
        coupon.discount_type = DiscountType::Fixed;
        coupon.discount_value = Decimal::from(150);
        assert_eq!(coupon.apply_discount(100), 0);
    }

    #[test]
    fn percentage_rounds_half_up() {
        let mut coupon = base_coupon("SAVE25");
        coupon.discount_value = Decimal::from(25);
        // 25% of 101 = 25.25 -> 25 off
        assert_eq!(coupon.apply_discount(101), 76);
        // 25% of 102 = 25.5 -> 26 off
        assert_eq!(coupon.apply_discount(102), 76);
    }

    #[test]
    fn validity_window() {
        let now = Utc::now();
        let mut coupon = base_coupon("WINDOW");
        coupon.starts_at = Some(now - Duration::hours(1));
        coupon.expires_at = Some(now + Duration::hours(1));
        assert!(coupon.is_valid_at(now));
        assert!(!coupon.is_valid_at(now - Duration::hours(2)));
        assert!(!coupon.is_valid_at(now + Duration::hours(2)));
        // Expiry boundary is exclusive
        assert!(!coupon.is_valid_at(now + Duration::hours(1)));
    }

    #[test]
    fn usage_limit_exhaustion() {
        let now = Utc::now();
        let mut coupon = base_coupon("LIMITED");
        coupon.usage_limit = Some(2);
        coupon.usage_count = 1;
        assert!(coupon.is_valid_at(now));
        coupon.usage_count = 2;
        assert!(!coupon.is_valid_at(now));
    }

    #[test]
    fn catalog_coupon_requires_specific_products() {
        let mut coupon = base_coupon("CATALOG");
        coupon.applies_at = Some(AppliesAt::Catalog);
        assert!(coupon.validate().is_err());

        coupon.scope = CouponScope::Specific;
        coupon.product_ids = vec!["article-1".to_string()];
        assert!(coupon.validate().is_ok());
    }

    #[test]
    fn checkout_coupon_requires_scope_all() {
        let mut coupon = base_coupon("CHECKOUT");
        coupon.applies_at = Some(AppliesAt::Checkout);
        assert!(coupon.validate().is_ok());

        coupon.scope = CouponScope::Specific;
        assert!(coupon.validate().is_err());
    }

    #[test]
    fn auto_apply_requires_stage() {
        let mut coupon = base_coupon("AUTO");
        coupon.auto_apply = true;
        assert!(coupon.validate().is_err());

        coupon.applies_at = Some(AppliesAt::Checkout);
        assert!(coupon.validate().is_ok());
    }

    #[test]
    fn method_filter_matching() {
        assert!(MethodFilter::Any.matches(PaymentMethod::Fiat));
        assert!(MethodFilter::Fiat.matches(PaymentMethod::Fiat));
        assert!(!MethodFilter::Fiat.matches(PaymentMethod::Crypto));
        assert!(MethodFilter::Crypto.matches(PaymentMethod::Crypto));
    }

    #[test]
    fn active_product_needs_a_price() {
        let now = Utc::now();
        let mut product = Product {
            id: "article-1".to_string(),
            description: "An article".to_string(),
            fiat_price: None,
            crypto_price: None,
            stripe_price_id: None,
            crypto_account: None,
            memo_template: String::new(),
            metadata: HashMap::new(),
            active: true,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(
            product.validate(),
            Err(InvariantError::ProductWithoutPrice("article-1".to_string()))
        );

        product.fiat_price = Some(Money::new(1000, "USD", 2));
        assert!(product.validate().is_ok());

        product.fiat_price = None;
        product.active = false;
        assert!(product.validate().is_ok());
    }

    #[test]
    fn subscription_access_window() {
        let now = Utc::now();
        let mut sub = Subscription {
            id: "sub_1".to_string(),
            product_id: "article-1".to_string(),
            subscriber: SubscriberRef::Wallet("wallet-1".to_string()),
            payment_method: PaymentMethod::Fiat,
            billing_period: BillingPeriod::Month,
            billing_interval: 1,
            status: SubscriptionStatus::Active,
            current_period_start: now - Duration::days(1),
            current_period_end: now + Duration::days(29),
            trial_end: None,
            cancelled_at: None,
            cancel_at_period_end: false,
            metadata: HashMap::new(),
        };
        assert!(sub.is_active_at(now));

        sub.status = SubscriptionStatus::PastDue;
        assert!(sub.is_active_at(now));

        sub.status = SubscriptionStatus::Cancelled;
        assert!(!sub.is_active_at(now));

        sub.status = SubscriptionStatus::Active;
        assert!(!sub.is_active_at(now + Duration::days(30)));
    }
}
