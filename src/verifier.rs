//! Collaborator interfaces for the two payment rails.
//!
//! The core never talks to a blockchain or a card processor directly. It
//! consumes:
//!
//! - [`ProofVerifier`]: given a quote and a submitted payment proof, decide
//!   `{valid, invalid, pending}` and produce the canonical settlement
//!   signature. [`FacilitatorVerifier`] implements this against a remote
//!   verification service over HTTP, wrapped in the `chain_rpc` circuit
//!   breaker and the bounded retry helper.
//! - [`CardRail`]: create hosted checkout sessions and look up their payment
//!   state. [`CardSessionVerifier`] adapts a [`CardRail`] into a
//!   [`ProofVerifier`] for the fiat rail, treating the checkout session id as
//!   the settlement signature.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::circuit_breaker::{BreakerError, BreakerRegistry};
use crate::error::GatewayError;
use crate::hooks::HookRegistry;
use crate::retry::{RetryClass, RetryPolicy, classify_message, classify_reqwest, with_retry};
use crate::types::Quote;

/// A payment proof submitted by a buyer, decoded from the base64 JSON
/// `X-PAYMENT` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProof {
    pub quote_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<String>,
    /// Rail-specific proof material: a transaction hash and signer for
    /// crypto, a checkout session id for cards.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Verdict from a rail verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// Proof checks out. `signature` is the canonical settlement key.
    Valid { signature: String, payer: String },
    Invalid {
        reason: String,
    },
    /// Not yet confirmed by the rail; the buyer should resubmit later.
    Pending,
}

/// Failures while talking to a rail verifier.
#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("verifier timed out")]
    Timeout,
    #[error("verifier transport failure: {0}")]
    Transport(String),
    #[error("verifier returned status {0}")]
    Status(u16),
    #[error("circuit open for {service}")]
    CircuitOpen { service: String },
    #[error("malformed verifier response: {0}")]
    Protocol(String),
    #[error("rail not configured: {0}")]
    NotConfigured(&'static str),
}

impl VerifierError {
    /// Map into the gateway taxonomy, attributing the failure to `service`.
    pub fn into_gateway(self, service: &str) -> GatewayError {
        match self {
            VerifierError::Timeout => GatewayError::DownstreamTimeout {
                service: service.to_string(),
            },
            VerifierError::Transport(detail) => GatewayError::DownstreamTransient {
                service: service.to_string(),
                detail,
            },
            VerifierError::Status(code) if code == 429 || code >= 500 => {
                GatewayError::DownstreamTransient {
                    service: service.to_string(),
                    detail: format!("status {code}"),
                }
            }
            VerifierError::Status(code) => GatewayError::DownstreamPermanent {
                service: service.to_string(),
                detail: format!("status {code}"),
            },
            VerifierError::CircuitOpen { service } => GatewayError::CircuitOpen { service },
            VerifierError::Protocol(detail) => GatewayError::DownstreamPermanent {
                service: service.to_string(),
                detail,
            },
            VerifierError::NotConfigured(rail) => GatewayError::DownstreamPermanent {
                service: service.to_string(),
                detail: format!("{rail} rail not configured"),
            },
        }
    }
}

/// Retry classification for verifier failures. Prefers the typed variants;
/// opaque transport strings fall back to substring matching.
pub fn classify_verifier_error(err: &VerifierError) -> RetryClass {
    match err {
        VerifierError::Timeout => RetryClass::Timeout,
        VerifierError::Transport(message) => match classify_message(message) {
            // Unknown transport errors default to one more try.
            RetryClass::Permanent => RetryClass::Transient,
            class => class,
        },
        VerifierError::Status(429) => RetryClass::RateLimited,
        VerifierError::Status(code) if *code >= 500 => RetryClass::Transient,
        VerifierError::Status(_) => RetryClass::Permanent,
        // Retrying locally while the breaker is open only burns the budget.
        VerifierError::CircuitOpen { .. } => RetryClass::Permanent,
        VerifierError::Protocol(_) => RetryClass::Permanent,
        VerifierError::NotConfigured(_) => RetryClass::Permanent,
    }
}

/// Verifies payment proofs for one rail.
#[async_trait]
pub trait ProofVerifier: Send + Sync {
    async fn verify(
        &self,
        quote: &Quote,
        proof: &PaymentProof,
    ) -> Result<VerificationOutcome, VerifierError>;
}

/// One cart line as submitted by the buyer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub product_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

/// A cart after pricing: resolved line amounts plus the applied coupons.
#[derive(Debug, Clone)]
pub struct PricedCart {
    pub lines: Vec<PricedLine>,
    pub total_atomic: i64,
    pub asset_code: String,
    pub coupon_codes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PricedLine {
    pub product_id: String,
    pub quantity: u32,
    /// Locally priced unit amount; absent for processor-hosted prices.
    pub unit_amount: Option<i64>,
    pub price_id: Option<String>,
}

/// A hosted checkout session minted by the card processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub id: String,
    pub url: Url,
}

/// Payment state of a checkout session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardSessionState {
    pub paid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,
}

/// Card-processor surface the core depends on. SDK wrappers implement this.
#[async_trait]
pub trait CardRail: Send + Sync {
    async fn create_checkout_session(
        &self,
        cart: &PricedCart,
    ) -> Result<CheckoutSession, VerifierError>;
    async fn lookup_session(
        &self,
        session_id: &str,
    ) -> Result<Option<CardSessionState>, VerifierError>;
}

/// Placeholder rail for deployments without card support.
pub struct DisabledCardRail;

#[async_trait]
impl CardRail for DisabledCardRail {
    async fn create_checkout_session(
        &self,
        _cart: &PricedCart,
    ) -> Result<CheckoutSession, VerifierError> {
        Err(VerifierError::NotConfigured("card"))
    }

    async fn lookup_session(
        &self,
        _session_id: &str,
    ) -> Result<Option<CardSessionState>, VerifierError> {
        Err(VerifierError::NotConfigured("card"))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RemoteVerifyRequest<'a> {
    quote: &'a Quote,
    proof: &'a PaymentProof,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteVerifyResponse {
    status: RemoteVerifyStatus,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    payer: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RemoteVerifyStatus {
    Valid,
    Invalid,
    Pending,
}

/// [`ProofVerifier`] backed by a remote on-chain verification service.
///
/// Every attempt flows through the `chain_rpc` circuit breaker; transient
/// failures are retried per the policy, and an open breaker short-circuits
/// the remaining budget.
pub struct FacilitatorVerifier {
    http: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
    policy: RetryPolicy,
    breakers: Arc<BreakerRegistry>,
    hooks: Arc<HookRegistry>,
}

const CHAIN_RPC: &str = "chain_rpc";

impl FacilitatorVerifier {
    pub fn new(
        endpoint: Url,
        timeout: Duration,
        policy: RetryPolicy,
        breakers: Arc<BreakerRegistry>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            timeout,
            policy,
            breakers,
            hooks,
        }
    }

    async fn post_verify(
        &self,
        request: &RemoteVerifyRequest<'_>,
    ) -> Result<RemoteVerifyResponse, VerifierError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|err| match classify_reqwest(&err) {
                RetryClass::Timeout => VerifierError::Timeout,
                _ => VerifierError::Transport(err.to_string()),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(VerifierError::Status(status.as_u16()));
        }
        response
            .json::<RemoteVerifyResponse>()
            .await
            .map_err(|err| VerifierError::Protocol(err.to_string()))
    }
}

#[async_trait]
impl ProofVerifier for FacilitatorVerifier {
    async fn verify(
        &self,
        quote: &Quote,
        proof: &PaymentProof,
    ) -> Result<VerificationOutcome, VerifierError> {
        let request = RemoteVerifyRequest { quote, proof };
        let request = &request;
        let this = self;
        let response = with_retry(
            CHAIN_RPC,
            &self.policy,
            &self.hooks,
            classify_verifier_error,
            move || async move {
                this.breakers
                    .execute(CHAIN_RPC, || this.post_verify(request))
                    .await
                    .map_err(|err| match err {
                        BreakerError::Open { service } => VerifierError::CircuitOpen { service },
                        BreakerError::Inner(inner) => inner,
                    })
            },
        )
        .await?;

        Ok(match response.status {
            RemoteVerifyStatus::Valid => {
                let signature = response.signature.ok_or_else(|| {
                    VerifierError::Protocol("valid response without signature".to_string())
                })?;
                let payer = response
                    .payer
                    .or_else(|| proof.wallet.clone())
                    .unwrap_or_default();
                VerificationOutcome::Valid { signature, payer }
            }
            RemoteVerifyStatus::Invalid => VerificationOutcome::Invalid {
                reason: response
                    .reason
                    .unwrap_or_else(|| "rejected by verifier".to_string()),
            },
            RemoteVerifyStatus::Pending => VerificationOutcome::Pending,
        })
    }
}

/// Adapts the card rail into a [`ProofVerifier`] for fiat proofs.
///
/// The proof payload must carry `{"sessionId": "..."}`; a paid session
/// verifies with the session id as settlement signature. Card API failures
/// are surfaced rather than retried.
pub struct CardSessionVerifier {
    rail: Arc<dyn CardRail>,
    breakers: Arc<BreakerRegistry>,
}

const CARD_API: &str = "card_api";

impl CardSessionVerifier {
    pub fn new(rail: Arc<dyn CardRail>, breakers: Arc<BreakerRegistry>) -> Self {
        Self { rail, breakers }
    }
}

#[async_trait]
impl ProofVerifier for CardSessionVerifier {
    async fn verify(
        &self,
        _quote: &Quote,
        proof: &PaymentProof,
    ) -> Result<VerificationOutcome, VerifierError> {
        let Some(session_id) = proof
            .payload
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
        else {
            return Ok(VerificationOutcome::Invalid {
                reason: "missing sessionId in payment proof".to_string(),
            });
        };

        let state = self
            .breakers
            .execute(CARD_API, || self.rail.lookup_session(&session_id))
            .await
            .map_err(|err| match err {
                BreakerError::Open { service } => VerifierError::CircuitOpen { service },
                BreakerError::Inner(inner) => inner,
            })?;

        Ok(match state {
            None => VerificationOutcome::Invalid {
                reason: format!("unknown checkout session {session_id}"),
            },
            Some(state) if state.paid => VerificationOutcome::Valid {
                payer: state
                    .customer
                    .or_else(|| proof.wallet.clone())
                    .unwrap_or_default(),
                signature: session_id,
            },
            Some(_) => VerificationOutcome::Pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerSettings;
    use crate::clock::SystemClock;
    use crate::types::PaymentMethod;
    use std::collections::HashMap;

    struct FakeRail {
        sessions: HashMap<String, CardSessionState>,
    }

    #[async_trait]
    impl CardRail for FakeRail {
        async fn create_checkout_session(
            &self,
            _cart: &PricedCart,
        ) -> Result<CheckoutSession, VerifierError> {
            Ok(CheckoutSession {
                id: "cs_test_1".to_string(),
                url: "https://checkout.example/s/cs_test_1".parse().expect("url"),
            })
        }

        async fn lookup_session(
            &self,
            session_id: &str,
        ) -> Result<Option<CardSessionState>, VerifierError> {
            Ok(self.sessions.get(session_id).cloned())
        }
    }

    fn sample_quote() -> Quote {
        Quote {
            quote_id: Uuid::new_v4(),
            resource_id: "article-1".to_string(),
            payer: None,
            method: PaymentMethod::Fiat,
            amount: 1000,
            asset_code: "USD".to_string(),
            coupon_code: None,
            applied_coupons: Vec::new(),
            original_amount: None,
            discount_amount: None,
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(5),
            nonce: "00ff00ff00ff00ff00ff00ff".to_string(),
            memo: String::new(),
            consumed: false,
        }
    }

    fn proof(payload: serde_json::Value) -> PaymentProof {
        PaymentProof {
            quote_id: Uuid::new_v4(),
            wallet: None,
            payload,
        }
    }

    fn verifier(sessions: HashMap<String, CardSessionState>) -> CardSessionVerifier {
        let breakers = Arc::new(BreakerRegistry::new(
            true,
            BreakerSettings::default(),
            Arc::new(SystemClock),
            Arc::new(HookRegistry::new()),
        ));
        CardSessionVerifier::new(Arc::new(FakeRail { sessions }), breakers)
    }

    #[tokio::test]
    async fn paid_session_verifies_with_session_signature() {
        let mut sessions = HashMap::new();
        sessions.insert(
            "cs_test_1".to_string(),
            CardSessionState {
                paid: true,
                amount: Some(1000),
                currency: Some("USD".to_string()),
                customer: Some("cus_42".to_string()),
            },
        );
        let verifier = verifier(sessions);

        let outcome = verifier
            .verify(
                &sample_quote(),
                &proof(serde_json::json!({"sessionId": "cs_test_1"})),
            )
            .await
            .expect("verify");
        assert_eq!(
            outcome,
            VerificationOutcome::Valid {
                signature: "cs_test_1".to_string(),
                payer: "cus_42".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn unpaid_session_is_pending() {
        let mut sessions = HashMap::new();
        sessions.insert(
            "cs_test_1".to_string(),
            CardSessionState {
                paid: false,
                amount: None,
                currency: None,
                customer: None,
            },
        );
        let verifier = verifier(sessions);

        let outcome = verifier
            .verify(
                &sample_quote(),
                &proof(serde_json::json!({"sessionId": "cs_test_1"})),
            )
            .await
            .expect("verify");
        assert_eq!(outcome, VerificationOutcome::Pending);
    }

    #[tokio::test]
    async fn unknown_session_and_malformed_proof_are_invalid() {
        let verifier = verifier(HashMap::new());

        let outcome = verifier
            .verify(
                &sample_quote(),
                &proof(serde_json::json!({"sessionId": "cs_missing"})),
            )
            .await
            .expect("verify");
        assert!(matches!(outcome, VerificationOutcome::Invalid { .. }));

        let outcome = verifier
            .verify(&sample_quote(), &proof(serde_json::json!({})))
            .await
            .expect("verify");
        assert!(matches!(outcome, VerificationOutcome::Invalid { .. }));
    }

    #[test]
    fn verifier_error_classification() {
        assert_eq!(
            classify_verifier_error(&VerifierError::Timeout),
            RetryClass::Timeout
        );
        assert_eq!(
            classify_verifier_error(&VerifierError::Status(503)),
            RetryClass::Transient
        );
        assert_eq!(
            classify_verifier_error(&VerifierError::Status(429)),
            RetryClass::RateLimited
        );
        assert_eq!(
            classify_verifier_error(&VerifierError::Status(400)),
            RetryClass::Permanent
        );
        assert_eq!(
            classify_verifier_error(&VerifierError::CircuitOpen {
                service: "chain_rpc".to_string()
            }),
            RetryClass::Permanent
        );
        assert_eq!(
            classify_verifier_error(&VerifierError::Transport(
                "tcp connection refused".to_string()
            )),
            RetryClass::Transient
        );
    }

    #[test]
    fn payment_proof_decodes_from_x_payment_header_shape() {
        let json = serde_json::json!({
            "quoteId": "8c7e29a4-3c5e-4f2e-9b6a-2f1f2a3b4c5d",
            "wallet": "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin",
            "payload": {"txHash": "5VfYt3qQ"}
        });
        let proof: PaymentProof = serde_json::from_value(json).expect("decodes");
        assert_eq!(
            proof.wallet.as_deref(),
            Some("9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin")
        );
        assert_eq!(proof.payload["txHash"], "5VfYt3qQ");
    }
}
