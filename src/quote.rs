//! Quote engine: pricing, coupons, and the quote lifecycle.
//!
//! [`QuoteEngine::create_quote`] resolves a resource to a product price on
//! the requested rail, applies at most one explicit and one auto-apply
//! coupon, enforces the approved-stablecoin invariant for crypto pricing, and
//! mints a short-lived single-use [`Quote`].
//!
//! [`QuoteEngine::consume_quote`] is the settlement path: it dispatches the
//! submitted proof to the rail's verifier, flips the quote's single-use
//! marker, and hands the canonical signature to the settlement recorder,
//! which is where duplicate payments are rejected.

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::CatalogCache;
use crate::clock::Clock;
use crate::error::GatewayError;
use crate::hooks::HookRegistry;
use crate::settlement::SettlementRecorder;
use crate::store::Store;
use crate::types::{Coupon, DiscountType, Money, PaymentMethod, PaymentTransaction, Quote};
use crate::util::render_memo;
use crate::verifier::{PaymentProof, ProofVerifier, VerificationOutcome};

/// Engine-level configuration.
#[derive(Debug, Clone)]
pub struct QuoteConfig {
    /// Validity window of a minted quote.
    pub quote_ttl: Duration,
    /// Asset codes accepted for crypto pricing.
    pub approved_assets: HashSet<String>,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            quote_ttl: Duration::from_secs(300),
            approved_assets: ["USDC", "USDT", "EURC", "DAI"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Mints and consumes purchase quotes.
pub struct QuoteEngine {
    catalog: Arc<CatalogCache>,
    store: Arc<dyn Store>,
    settlement: Arc<SettlementRecorder>,
    verifiers: HashMap<PaymentMethod, Arc<dyn ProofVerifier>>,
    clock: Arc<dyn Clock>,
    hooks: Arc<HookRegistry>,
    cfg: QuoteConfig,
}

fn verifier_service(method: PaymentMethod) -> &'static str {
    match method {
        PaymentMethod::Crypto => "chain_rpc",
        PaymentMethod::Fiat => "card_api",
    }
}

impl QuoteEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<CatalogCache>,
        store: Arc<dyn Store>,
        settlement: Arc<SettlementRecorder>,
        verifiers: HashMap<PaymentMethod, Arc<dyn ProofVerifier>>,
        clock: Arc<dyn Clock>,
        hooks: Arc<HookRegistry>,
        cfg: QuoteConfig,
    ) -> Self {
        Self {
            catalog,
            store,
            settlement,
            verifiers,
            clock,
            hooks,
            cfg,
        }
    }

    /// Mint a priced quote for `resource_id` on `method`.
    pub async fn create_quote(
        &self,
        resource_id: &str,
        method: PaymentMethod,
        coupon_code: Option<&str>,
        wallet: Option<&str>,
    ) -> Result<Quote, GatewayError> {
        let now = self.clock.now();
        let product = self
            .catalog
            .product(resource_id)
            .await?
            .filter(|p| p.active)
            .ok_or_else(|| GatewayError::ProductNotFound(resource_id.to_string()))?;

        let price = product
            .price_for(method)
            .ok_or_else(|| GatewayError::PricingUnavailable {
                product_id: product.id.clone(),
                method,
            })?
            .clone();

        if method == PaymentMethod::Crypto && !self.cfg.approved_assets.contains(&price.asset.code)
        {
            return Err(GatewayError::UnsupportedAsset(price.asset.code.clone()));
        }

        let list_price = price.atomic;
        let mut amount = list_price;
        let mut applied_coupons = Vec::new();

        // Explicit coupon first; its failure is a hard error.
        if let Some(code) = coupon_code {
            let coupon = self.catalog.coupon(code).await?.ok_or_else(|| {
                GatewayError::CouponNotApplicable {
                    code: code.to_string(),
                    reason: "unknown coupon".to_string(),
                }
            })?;
            self.assert_coupon_applies(&coupon, &product.id, method, now)?;
            amount = coupon.apply_discount(amount);
            applied_coupons.push(coupon.code.clone());
        }

        // Then at most one auto-apply coupon, stacked on the discounted
        // amount. Auto candidates that fail validity are silently skipped.
        let auto_candidates: Vec<Coupon> = self
            .catalog
            .list_coupons()
            .await?
            .into_iter()
            .filter(|c| {
                c.auto_apply
                    && Some(c.code.as_str()) != coupon_code
                    && c.is_valid_at(now)
                    && c.applies_to_product(&product.id)
                    && c.applies_to_method(method)
            })
            .collect();
        if let Some(winner) = pick_auto_coupon(auto_candidates, amount) {
            amount = winner.apply_discount(amount);
            applied_coupons.push(winner.code);
        }

        let nonce_bytes: [u8; 12] = rand::rng().random();
        let nonce = hex::encode(nonce_bytes);
        let template = if product.memo_template.is_empty() {
            "{resource}:{nonce}"
        } else {
            product.memo_template.as_str()
        };
        let discounted = amount < list_price;
        let quote = Quote {
            quote_id: Uuid::new_v4(),
            resource_id: product.id.clone(),
            payer: wallet.map(str::to_string),
            method,
            amount,
            asset_code: price.asset.code.clone(),
            coupon_code: coupon_code.map(str::to_string),
            applied_coupons,
            original_amount: discounted.then_some(list_price),
            discount_amount: discounted.then_some(list_price - amount),
            expires_at: now
                + chrono::Duration::from_std(self.cfg.quote_ttl)
                    .unwrap_or_else(|_| chrono::Duration::minutes(5)),
            nonce: nonce.clone(),
            memo: render_memo(template, &product.id, &nonce),
            consumed: false,
        };

        self.store.save_quote(&quote).await?;
        self.hooks.quote_created(&quote);
        Ok(quote)
    }

    /// Verify a payment proof against a quote and settle it.
    pub async fn consume_quote(
        &self,
        quote_id: &Uuid,
        proof: &PaymentProof,
    ) -> Result<PaymentTransaction, GatewayError> {
        let quote = self
            .store
            .load_quote(quote_id)
            .await?
            .ok_or(GatewayError::QuoteNotFound(*quote_id))?;

        let now = self.clock.now();
        if now >= quote.expires_at {
            return Err(GatewayError::QuoteExpired {
                quote_id: *quote_id,
                expires_at: quote.expires_at,
            });
        }

        let verifier = self.verifiers.get(&quote.method).ok_or_else(|| {
            GatewayError::Internal(format!("no verifier configured for {}", quote.method))
        })?;
        let outcome = verifier
            .verify(&quote, proof)
            .await
            .map_err(|err| err.into_gateway(verifier_service(quote.method)))?;

        let (signature, payer) = match outcome {
            VerificationOutcome::Valid { signature, payer } => (signature, payer),
            VerificationOutcome::Invalid { reason } => {
                return Err(GatewayError::ProofInvalid(reason));
            }
            VerificationOutcome::Pending => return Err(GatewayError::ProofPending),
        };

        // Single-use gate. A consumed quote whose payment is on record is a
        // benign replay; a consumed quote without one means the caller must
        // re-quote.
        if !self.store.consume_quote(quote_id).await? {
            if self.store.has_payment(&signature).await? {
                return Err(GatewayError::SignatureAlreadyUsed(signature));
            }
            return Err(GatewayError::Validation(format!(
                "quote {quote_id} was already consumed"
            )));
        }

        let wallet = [
            Some(payer).filter(|p| !p.is_empty()),
            proof.wallet.clone(),
            quote.payer.clone(),
        ]
        .into_iter()
        .flatten()
        .next()
        .unwrap_or_default();

        let mut metadata = HashMap::new();
        metadata.insert(
            "quoteId".to_string(),
            serde_json::Value::String(quote.quote_id.to_string()),
        );
        metadata.insert(
            "memo".to_string(),
            serde_json::Value::String(quote.memo.clone()),
        );
        let tx = PaymentTransaction {
            signature,
            resource_id: quote.resource_id.clone(),
            wallet,
            amount: Money {
                atomic: quote.amount,
                asset: self.quote_asset(&quote).await,
            },
            method: quote.method,
            created_at: now,
            metadata,
        };

        self.settlement.record_payment(&tx).await?;

        // Usage accounting is best-effort: a failed increment is logged and
        // reported, never surfaced to the payer.
        for code in &quote.applied_coupons {
            if let Err(err) = self.catalog.increment_coupon_usage(code).await {
                tracing::warn!(code = %code, error = %err, "coupon usage increment failed");
                self.hooks.coupon_usage_drift(code, &err.to_string());
            }
        }

        Ok(tx)
    }

    /// Recover the asset descriptor for a quote from the product catalog,
    /// falling back to rail conventions when the product has vanished.
    async fn quote_asset(&self, quote: &Quote) -> crate::types::Asset {
        if let Ok(Some(product)) = self.catalog.product(&quote.resource_id).await {
            if let Some(price) = product.price_for(quote.method) {
                if price.asset.code == quote.asset_code {
                    return price.asset.clone();
                }
            }
        }
        let decimals = match quote.method {
            PaymentMethod::Fiat => 2,
            PaymentMethod::Crypto => 6,
        };
        crate::types::Asset::new(quote.asset_code.clone(), decimals)
    }

    fn assert_coupon_applies(
        &self,
        coupon: &Coupon,
        product_id: &str,
        method: PaymentMethod,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), GatewayError> {
        if !coupon.active {
            return Err(GatewayError::CouponNotApplicable {
                code: coupon.code.clone(),
                reason: "coupon is inactive".to_string(),
            });
        }
        if coupon.starts_at.is_some_and(|starts| starts > now) {
            return Err(GatewayError::CouponNotApplicable {
                code: coupon.code.clone(),
                reason: "coupon is not yet active".to_string(),
            });
        }
        if coupon.expires_at.is_some_and(|expires| expires <= now) {
            return Err(GatewayError::CouponExpired(coupon.code.clone()));
        }
        if coupon
            .usage_limit
            .is_some_and(|limit| coupon.usage_count >= limit)
        {
            return Err(GatewayError::CouponUsageLimitReached(coupon.code.clone()));
        }
        if !coupon.applies_to_product(product_id) {
            return Err(GatewayError::CouponNotApplicable {
                code: coupon.code.clone(),
                reason: "coupon does not apply to this product".to_string(),
            });
        }
        if !coupon.applies_to_method(method) {
            return Err(GatewayError::CouponNotApplicable {
                code: coupon.code.clone(),
                reason: "coupon does not apply to this payment method".to_string(),
            });
        }
        Ok(())
    }
}

/// Choose the winning auto-apply coupon: largest absolute discount on the
/// current amount, ties broken by fixed-over-percentage, then value, then
/// code, so the choice is deterministic.
fn pick_auto_coupon(mut candidates: Vec<Coupon>, amount: i64) -> Option<Coupon> {
    candidates.sort_by(|a, b| {
        b.discount_amount(amount)
            .cmp(&a.discount_amount(amount))
            .then_with(|| type_rank(a.discount_type).cmp(&type_rank(b.discount_type)))
            .then_with(|| b.discount_value.cmp(&a.discount_value))
            .then_with(|| a.code.cmp(&b.code))
    });
    candidates.into_iter().next()
}

fn type_rank(discount_type: DiscountType) -> u8 {
    match discount_type {
        DiscountType::Fixed => 0,
        DiscountType::Percentage => 1,
    }
}
