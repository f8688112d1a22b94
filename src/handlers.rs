//! HTTP surface of the gateway.
//!
//! Routes:
//! - `GET  /api/paywall/{resource_id}` – access check; `402` with a quote body
//!   when payment is required
//! - `POST /api/paywall/{resource_id}` – payment proof in the `X-PAYMENT`
//!   header (base64 JSON)
//! - `POST /api/checkout/cart` – multi-item card checkout, returns the hosted
//!   session URL
//! - `POST /api/webhooks/card` – card-processor events, HMAC-authenticated
//! - `POST /api/webhooks/subscription` – subscription lifecycle events
//! - `GET  /metrics` – Prometheus exposition, optionally API-key protected
//! - `GET  /health`, `GET /` – discovery
//! - `/api/admin/...` – payment lookup and DLQ inspection/replay
//!
//! The paywall and checkout routes run behind two middleware layers: the
//! three-tier rate limiter, and idempotency replay keyed on the
//! `Idempotency-Key` header (scoped by sanitized `X-Tenant-Id`).

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;

use crate::error::GatewayError;
use crate::gateway::{AccessDecision, PaywallGateway};
use crate::idempotency::IdempotencyStore;
use crate::rate_limit::{ApiKeyTier, RateLimiter, RequestScope};
use crate::subscription::SubscriptionEvent;
use crate::types::{IdempotencyRecord, PaymentMethod};
use crate::util::b64::Base64Bytes;
use crate::util::sanitize_tenant_id;
use crate::verifier::{CartLine, PaymentProof};

/// Cap on buffered response bodies for idempotency capture.
const IDEMPOTENT_BODY_LIMIT: usize = 1024 * 1024;

/// Shared state behind every handler.
pub struct AppState {
    pub gateway: Arc<PaywallGateway>,
    pub limiter: Arc<RateLimiter>,
    pub idempotency: Arc<IdempotencyStore>,
    pub metrics: Option<PrometheusHandle>,
    pub metrics_api_key: Option<String>,
    pub api_keys: HashMap<String, ApiKeyTier>,
}

/// Assemble the full router.
pub fn routes(state: Arc<AppState>) -> Router {
    let guarded = Router::new()
        .route(
            "/api/paywall/{resource_id}",
            get(get_paywall).post(post_paywall),
        )
        .route("/api/checkout/cart", post(post_checkout_cart))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            idempotency_layer,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_layer));

    Router::new()
        .merge(guarded)
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/api/webhooks/card", post(post_card_webhook))
        .route("/api/webhooks/subscription", post(post_subscription_webhook))
        .route("/metrics", get(get_metrics))
        .route("/api/admin/payments/{signature}", get(get_admin_payment))
        .route("/api/admin/dlq", get(get_admin_dlq))
        .route("/api/admin/dlq/{id}/replay", post(post_admin_replay))
        .with_state(state)
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match &self {
            GatewayError::RateLimited {
                retry_after_seconds,
                ..
            } => {
                let retry_after = *retry_after_seconds;
                let body = json!({
                    "error": "rate_limit_exceeded",
                    "message": self.to_string(),
                    "retry_after_seconds": retry_after,
                });
                let mut response =
                    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                if let Ok(value) = retry_after.to_string().parse() {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            // The duplicate-settlement path is idempotent success.
            GatewayError::SignatureAlreadyUsed(signature) => (
                StatusCode::OK,
                Json(json!({"granted": true, "duplicate": true, "signature": signature})),
            )
                .into_response(),
            _ => {
                let status = StatusCode::from_u16(self.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    tracing::error!(code = self.code(), error = %self, "request failed");
                }
                let body = json!({
                    "error": {
                        "code": self.code(),
                        "message": self.to_string(),
                        "retryable": self.retryable(),
                        "details": {},
                    }
                });
                (status, Json(body)).into_response()
            }
        }
    }
}

/// Rate-limit middleware: extracts the request scope and rejects with `429`
/// before the request body is touched.
async fn rate_limit_layer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let scope = extract_scope(&state, &request);
    if let Err(err) = state.limiter.check(&scope) {
        return err.into_response();
    }
    next.run(request).await
}

fn extract_scope(state: &AppState, request: &Request) -> RequestScope {
    let headers = request.headers();
    let header_str =
        |name: &str| -> Option<String> { headers.get(name)?.to_str().ok().map(str::to_string) };

    let tier = header_str("x-api-key").and_then(|key| state.api_keys.get(&key).copied());

    // Wallet extraction precedence: X-Wallet, X-Signer, `wallet` query param.
    let wallet = header_str("x-wallet")
        .or_else(|| header_str("x-signer"))
        .or_else(|| {
            request.uri().query().and_then(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .find(|(key, _)| key == "wallet")
                    .map(|(_, value)| value.into_owned())
            })
        });

    let ip = header_str("x-forwarded-for")
        .and_then(|forwarded| forwarded.split(',').next().map(|ip| ip.trim().to_string()))
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        });

    RequestScope { tier, wallet, ip }
}

/// Idempotency middleware for mutating calls: a duplicate `Idempotency-Key`
/// replays the cached response verbatim instead of re-entering the core.
async fn idempotency_layer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::POST {
        return next.run(request).await;
    }
    let Some(raw_key) = request
        .headers()
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return next.run(request).await;
    };
    let tenant = request
        .headers()
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .map(sanitize_tenant_id)
        .unwrap_or_default();
    let key = format!("{tenant}:{raw_key}");

    if let Some(record) = state.idempotency.get(&key) {
        return replay_response(&record);
    }

    let response = next.run(request).await;
    let (parts, body) = response.into_parts();
    match axum::body::to_bytes(body, IDEMPOTENT_BODY_LIMIT).await {
        Ok(bytes) => {
            // Server errors stay uncached so a transient failure is not
            // replayed for the key's whole lifetime.
            if !parts.status.is_server_error() {
                state
                    .idempotency
                    .put(&key, parts.status.as_u16(), bytes.to_vec());
            }
            Response::from_parts(parts, Body::from(bytes))
        }
        Err(err) => GatewayError::Internal(format!("response buffering failed: {err}"))
            .into_response(),
    }
}

fn replay_response(record: &IdempotencyRecord) -> Response {
    let status =
        StatusCode::from_u16(record.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::from(record.response.clone()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
        .headers_mut()
        .insert("idempotency-replayed", header::HeaderValue::from_static("true"));
    response
}

/// `GET /`: greeting for liveness probes and the curious.
#[instrument(skip_all)]
async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

/// `GET /health`: queue depth and breaker states.
#[instrument(skip_all)]
async fn get_health(State(state): State<Arc<AppState>>) -> Response {
    match state.gateway.health().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct PaywallQuery {
    method: Option<String>,
    coupon: Option<String>,
    wallet: Option<String>,
}

/// `GET /api/paywall/{resource_id}`: grant access or quote the price.
#[instrument(skip_all, fields(resource_id = %resource_id))]
async fn get_paywall(
    State(state): State<Arc<AppState>>,
    Path(resource_id): Path<String>,
    Query(query): Query<PaywallQuery>,
) -> Response {
    let method = match query.method.as_deref().map(PaymentMethod::from_str) {
        None => None,
        Some(Ok(method)) => Some(method),
        Some(Err(err)) => return GatewayError::Validation(err).into_response(),
    };
    match state
        .gateway
        .quote_or_grant(
            &resource_id,
            method,
            query.coupon.as_deref(),
            query.wallet.as_deref(),
        )
        .await
    {
        Ok(AccessDecision::Granted) => {
            (StatusCode::OK, Json(json!({"granted": true}))).into_response()
        }
        Ok(AccessDecision::PaymentRequired(quote)) => (
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({"granted": false, "quote": quote})),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

/// `POST /api/paywall/{resource_id}`: submit a payment proof.
#[instrument(skip_all, fields(resource_id = %resource_id))]
async fn post_paywall(
    State(state): State<Arc<AppState>>,
    Path(resource_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(raw) = headers.get("x-payment").and_then(|v| v.to_str().ok()) else {
        return GatewayError::Validation("missing X-PAYMENT header".to_string()).into_response();
    };
    let proof: PaymentProof = match Base64Bytes::from(raw).decode_json() {
        Ok(proof) => proof,
        Err(err) => {
            return GatewayError::Validation(format!("invalid X-PAYMENT header: {err}"))
                .into_response();
        }
    };
    match state.gateway.submit_payment(&resource_id, &proof).await {
        Ok(tx) => (
            StatusCode::OK,
            Json(json!({
                "granted": true,
                "resource": tx.resource_id,
                "signature": tx.signature,
            })),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CartRequest {
    items: Vec<CartLine>,
    #[serde(default)]
    coupon_code: Option<String>,
}

/// `POST /api/checkout/cart`: open a hosted card checkout for a cart.
#[instrument(skip_all)]
async fn post_checkout_cart(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CartRequest>,
) -> Response {
    match state
        .gateway
        .checkout_cart(&request.items, request.coupon_code.as_deref())
        .await
    {
        Ok(session) => (
            StatusCode::OK,
            Json(json!({"url": session.url, "sessionId": session.id})),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

/// `POST /api/webhooks/card`: card-processor event ingestion.
#[instrument(skip_all)]
async fn post_card_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get("stripe-signature")
        .or_else(|| headers.get("x-card-signature"))
        .and_then(|v| v.to_str().ok());
    match state.gateway.ingest_card_event(signature, &body).await {
        Ok(()) => (StatusCode::OK, Json(json!({"received": true}))).into_response(),
        Err(err) => err.into_response(),
    }
}

/// `POST /api/webhooks/subscription`: subscription lifecycle ingestion.
#[instrument(skip_all)]
async fn post_subscription_webhook(
    State(state): State<Arc<AppState>>,
    Json(event): Json<SubscriptionEvent>,
) -> Response {
    match state.gateway.reconcile_subscription(&event).await {
        Ok(()) => (StatusCode::OK, Json(json!({"received": true}))).into_response(),
        Err(err) => err.into_response(),
    }
}

fn check_api_key(expected: &Option<String>, headers: &HeaderMap, query: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let from_header = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let from_query = query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(key, _)| key == "api_key")
            .map(|(_, value)| value.into_owned())
    });
    from_header.as_deref() == Some(expected) || from_query.as_deref() == Some(expected)
}

/// `GET /metrics`: Prometheus exposition.
#[instrument(skip_all)]
async fn get_metrics(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let Some(handle) = &state.metrics else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !check_api_key(&state.metrics_api_key, request.headers(), request.uri().query()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response()
}

/// `GET /api/admin/payments/{signature}`: look up a recorded settlement.
#[instrument(skip_all)]
async fn get_admin_payment(
    State(state): State<Arc<AppState>>,
    Path(signature): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !check_api_key(&state.metrics_api_key, &headers, None) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.gateway.payment(&signature).await {
        Ok(Some(tx)) => (StatusCode::OK, Json(tx)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct DlqQuery {
    #[serde(default = "default_dlq_limit")]
    limit: usize,
}

fn default_dlq_limit() -> usize {
    50
}

/// `GET /api/admin/dlq`: inspect dead-lettered webhooks.
#[instrument(skip_all)]
async fn get_admin_dlq(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DlqQuery>,
    headers: HeaderMap,
) -> Response {
    if !check_api_key(&state.metrics_api_key, &headers, None) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.gateway.list_dlq(query.limit).await {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(err) => err.into_response(),
    }
}

/// `POST /api/admin/dlq/{id}/replay`: re-enqueue a dead-lettered webhook.
#[instrument(skip_all)]
async fn post_admin_replay(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Response {
    if !check_api_key(&state.metrics_api_key, &headers, None) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.gateway.replay_dlq(id).await {
        Ok(replayed) => (StatusCode::OK, Json(json!({"replayed": replayed}))).into_response(),
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CatalogCache;
    use crate::circuit_breaker::{BreakerRegistry, BreakerSettings};
    use crate::clock::{Clock, ManualClock};
    use crate::gateway::sign_card_payload;
    use crate::hooks::HookRegistry;
    use crate::quote::{QuoteConfig, QuoteEngine};
    use crate::rate_limit::{LayerConfig, RateLimitConfig};
    use crate::settlement::SettlementRecorder;
    use crate::store::{CatalogStore, MemoryStore, Store};
    use crate::subscription::{NullSubscriptionSource, SubscriptionReconciler};
    use crate::types::{Money, Product, Quote};
    use crate::verifier::{
        CardRail, CardSessionState, CheckoutSession, PricedCart, ProofVerifier,
        VerificationOutcome, VerifierError,
    };
    use crate::webhook::{DeliveryConfig, WebhookEnqueuer};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    struct PassVerifier;

    #[async_trait]
    impl ProofVerifier for PassVerifier {
        async fn verify(
            &self,
            _quote: &Quote,
            proof: &PaymentProof,
        ) -> Result<VerificationOutcome, VerifierError> {
            let signature = proof
                .payload
                .get("txHash")
                .and_then(|v| v.as_str())
                .unwrap_or("sig_default")
                .to_string();
            Ok(VerificationOutcome::Valid {
                signature,
                payer: proof.wallet.clone().unwrap_or_default(),
            })
        }
    }

    #[derive(Default)]
    struct CountingRail {
        sessions_created: AtomicUsize,
    }

    #[async_trait]
    impl CardRail for CountingRail {
        async fn create_checkout_session(
            &self,
            _cart: &PricedCart,
        ) -> Result<CheckoutSession, VerifierError> {
            let n = self.sessions_created.fetch_add(1, Ordering::SeqCst);
            Ok(CheckoutSession {
                id: format!("cs_test_{n}"),
                url: "https://checkout.example/s/cs_test".parse().expect("url"),
            })
        }

        async fn lookup_session(
            &self,
            _session_id: &str,
        ) -> Result<Option<CardSessionState>, VerifierError> {
            Ok(None)
        }
    }

    struct Fixture {
        router: Router,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        rail: Arc<CountingRail>,
    }

    const CARD_SECRET: &str = "whsec_test";

    fn fixture_with_limits(global: LayerConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock: Arc<ManualClock> = Arc::new(ManualClock::at(Utc::now()));
        let hooks = Arc::new(HookRegistry::new());
        let catalog = Arc::new(CatalogCache::new(
            store.clone(),
            clock.clone(),
            Duration::from_secs(60),
        ));
        let breakers = Arc::new(BreakerRegistry::new(
            true,
            BreakerSettings::default(),
            clock.clone(),
            hooks.clone(),
        ));
        let enqueuer = Arc::new(WebhookEnqueuer::new(
            store.clone(),
            DeliveryConfig {
                payment_url: Some("https://merchant.example/webhooks".parse().expect("url")),
                ..DeliveryConfig::default()
            },
            clock.clone(),
            hooks.clone(),
        ));
        let settlement = Arc::new(SettlementRecorder::new(
            store.clone(),
            enqueuer.clone(),
            hooks.clone(),
        ));
        let verifier: Arc<dyn ProofVerifier> = Arc::new(PassVerifier);
        let verifiers: HashMap<PaymentMethod, Arc<dyn ProofVerifier>> = [
            (PaymentMethod::Crypto, verifier.clone()),
            (PaymentMethod::Fiat, verifier),
        ]
        .into_iter()
        .collect();
        let quotes = Arc::new(QuoteEngine::new(
            catalog.clone(),
            store.clone(),
            settlement.clone(),
            verifiers,
            clock.clone(),
            hooks.clone(),
            QuoteConfig::default(),
        ));
        let reconciler = Arc::new(SubscriptionReconciler::new(
            store.clone(),
            Arc::new(NullSubscriptionSource),
            clock.clone(),
        ));
        let rail = Arc::new(CountingRail::default());
        let idempotency = Arc::new(IdempotencyStore::new(
            clock.clone(),
            Duration::from_secs(86_400),
        ));
        let gateway = Arc::new(PaywallGateway::new(
            catalog,
            store.clone(),
            quotes,
            settlement,
            enqueuer,
            reconciler,
            rail.clone(),
            breakers,
            idempotency.clone(),
            hooks.clone(),
            clock.clone(),
            Some(CARD_SECRET.to_string()),
        ));
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig {
                global,
                wallet: LayerConfig::disabled(),
                ip: LayerConfig::disabled(),
            },
            clock.clone(),
            hooks,
        ));
        let state = Arc::new(AppState {
            gateway,
            limiter,
            idempotency,
            metrics: None,
            metrics_api_key: Some("admin_key".to_string()),
            api_keys: HashMap::from([("partner_key".to_string(), ApiKeyTier::Partner)]),
        });
        Fixture {
            router: routes(state),
            store,
            clock,
            rail,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_limits(LayerConfig::disabled())
    }

    async fn seed_product(store: &MemoryStore) {
        let now = Utc::now();
        store
            .upsert_product(&Product {
                id: "article-1".to_string(),
                description: "An article".to_string(),
                fiat_price: Some(Money::new(1000, "USD", 2)),
                crypto_price: Some(Money::new(1_000_000, "USDC", 6)),
                stripe_price_id: Some("price_123".to_string()),
                crypto_account: None,
                memo_template: String::new(),
                metadata: HashMap::new(),
                active: true,
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("seed");
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn get(uri: &str) -> Request {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn root_greets() {
        let f = fixture();
        let response = f.router.oneshot(get("/")).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn paywall_get_quotes_with_402() {
        let f = fixture();
        seed_product(&f.store).await;

        let response = f
            .router
            .oneshot(get("/api/paywall/article-1?method=fiat"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let body = body_json(response).await;
        assert_eq!(body["granted"], false);
        assert_eq!(body["quote"]["amount"], 1000);
        assert_eq!(body["quote"]["assetCode"], "USD");
    }

    #[tokio::test]
    async fn paywall_get_unknown_product_is_404() {
        let f = fixture();
        let response = f
            .router
            .oneshot(get("/api/paywall/ghost"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "product_not_found");
        assert_eq!(body["error"]["retryable"], false);
    }

    #[tokio::test]
    async fn paywall_get_grants_for_paid_wallet() {
        let f = fixture();
        seed_product(&f.store).await;
        f.store
            .record_payment(&crate::types::PaymentTransaction {
                signature: "sig_1".to_string(),
                resource_id: "article-1".to_string(),
                wallet: "wallet-1".to_string(),
                amount: Money::new(1000, "USD", 2),
                method: PaymentMethod::Fiat,
                created_at: Utc::now(),
                metadata: HashMap::new(),
            })
            .await
            .expect("seed payment");

        let response = f
            .router
            .oneshot(get("/api/paywall/article-1?wallet=wallet-1"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["granted"], true);
    }

    #[tokio::test]
    async fn paywall_post_settles_and_replays_idempotently() {
        let f = fixture();
        seed_product(&f.store).await;

        // Mint a quote first.
        let response = f
            .router
            .clone()
            .oneshot(get("/api/paywall/article-1?method=crypto"))
            .await
            .expect("response");
        let body = body_json(response).await;
        let quote_id = body["quote"]["quoteId"].as_str().expect("quote id");

        let proof = serde_json::json!({
            "quoteId": quote_id,
            "wallet": "wallet-1",
            "payload": {"txHash": "sig_tx_9"},
        });
        let header = Base64Bytes::encode_json(&proof).expect("encode").to_string();
        let request = |h: String| {
            Request::builder()
                .method(Method::POST)
                .uri("/api/paywall/article-1")
                .header("x-payment", h)
                .body(Body::empty())
                .expect("request")
        };

        let response = f
            .router
            .clone()
            .oneshot(request(header.clone()))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["granted"], true);
        assert_eq!(body["signature"], "sig_tx_9");

        // Same proof again: benign duplicate, still granted.
        let response = f.router.oneshot(request(header)).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["granted"], true);
        assert!(f.store.has_payment("sig_tx_9").await.expect("probe"));
    }

    #[tokio::test]
    async fn paywall_post_without_header_is_400() {
        let f = fixture();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/paywall/article-1")
            .body(Body::empty())
            .expect("request");
        let response = f.router.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rate_limit_rejects_with_retry_after() {
        let f = fixture_with_limits(LayerConfig {
            enabled: true,
            limit: 2,
            window: Duration::from_secs(1),
            burst: 0,
        });
        seed_product(&f.store).await;

        for _ in 0..2 {
            let response = f
                .router
                .clone()
                .oneshot(get("/api/paywall/article-1?method=fiat"))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        }
        let response = f
            .router
            .clone()
            .oneshot(get("/api/paywall/article-1?method=fiat"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
            Some("1")
        );
        let body = body_json(response).await;
        assert_eq!(body["error"], "rate_limit_exceeded");
        assert_eq!(body["retry_after_seconds"], 1);

        // Partner keys bypass every layer.
        let request = Request::builder()
            .uri("/api/paywall/article-1?method=fiat")
            .header("x-api-key", "partner_key")
            .body(Body::empty())
            .expect("request");
        let response = f.router.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn checkout_cart_returns_session_url() {
        let f = fixture();
        seed_product(&f.store).await;

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/checkout/cart")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({"items": [{"productId": "article-1", "quantity": 2}]})
                    .to_string(),
            ))
            .expect("request");
        let response = f.router.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["url"].as_str().expect("url").starts_with("https://"));
        assert_eq!(f.rail.sessions_created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idempotency_key_replays_checkout_response() {
        let f = fixture();
        seed_product(&f.store).await;

        let request = || {
            Request::builder()
                .method(Method::POST)
                .uri("/api/checkout/cart")
                .header(header::CONTENT_TYPE, "application/json")
                .header("idempotency-key", "order-77")
                .header("x-tenant-id", "Acme Corp")
                .body(Body::from(
                    serde_json::json!({"items": [{"productId": "article-1"}]}).to_string(),
                ))
                .expect("request")
        };

        let first = f.router.clone().oneshot(request()).await.expect("response");
        assert_eq!(first.status(), StatusCode::OK);
        assert!(first.headers().get("idempotency-replayed").is_none());
        let first_body = body_json(first).await;

        let second = f.router.oneshot(request()).await.expect("response");
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(
            second
                .headers()
                .get("idempotency-replayed")
                .and_then(|v| v.to_str().ok()),
            Some("true")
        );
        let second_body = body_json(second).await;
        assert_eq!(first_body, second_body);
        // The card rail was only asked once.
        assert_eq!(f.rail.sessions_created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn card_webhook_requires_valid_signature() {
        let f = fixture();
        let payload = serde_json::json!({
            "id": "evt_card_1",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_live_1",
                "customer": "cus_1",
                "amountTotal": 1000,
                "currency": "usd",
                "metadata": {"resourceId": "article-1", "wallet": "wallet-1"},
            }},
        })
        .to_string();

        // Missing signature
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/webhooks/card")
            .body(Body::from(payload.clone()))
            .expect("request");
        let response = f.router.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Valid signature settles the session.
        let header = sign_card_payload(payload.as_bytes(), CARD_SECRET, f.clock.now());
        let request = |payload: String, header: String| {
            Request::builder()
                .method(Method::POST)
                .uri("/api/webhooks/card")
                .header("stripe-signature", header)
                .body(Body::from(payload))
                .expect("request")
        };
        let response = f
            .router
            .clone()
            .oneshot(request(payload.clone(), header.clone()))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(f.store.has_payment("cs_live_1").await.expect("probe"));

        // Redelivery of the same event id is acknowledged without a second
        // settlement.
        let response = f
            .router
            .oneshot(request(payload, header))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(f.store.queue_depth().await.expect("depth"), 1);
    }

    #[tokio::test]
    async fn subscription_webhook_reconciles() {
        let f = fixture();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/webhooks/subscription")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({
                    "eventType": "customer.subscription.created",
                    "subscriptionId": "sub_1",
                    "productId": "article-1",
                    "status": "active",
                    "wallet": "wallet-1",
                })
                .to_string(),
            ))
            .expect("request");
        let response = f.router.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(f.store.subscription("sub_1").await.expect("load").is_some());
    }

    #[tokio::test]
    async fn metrics_endpoint_is_absent_without_recorder() {
        let f = fixture();
        let response = f.router.oneshot(get("/metrics")).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admin_routes_require_api_key() {
        let f = fixture();
        let response = f
            .router
            .clone()
            .oneshot(get("/api/admin/dlq"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/api/admin/dlq")
            .header("x-api-key", "admin_key")
            .body(Body::empty())
            .expect("request");
        let response = f.router.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
