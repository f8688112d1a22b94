//! Paywall gateway HTTP entrypoint.
//!
//! Launches the axum server with the paywall, checkout, and webhook routes,
//! plus the background webhook delivery worker and the idempotency sweeper.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control the bind address
//! - `RUST_LOG` controls log verbosity
//! - see `config` for the full key set (`QUOTE_TTL`, `WEBHOOK_*`,
//!   `RATE_LIMIT_*`, `CIRCUIT_*`, `TOKEN_MINT`, ...)

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use paygate_rs::cache::CatalogCache;
use paygate_rs::circuit_breaker::BreakerRegistry;
use paygate_rs::clock::{Clock, SystemClock};
use paygate_rs::config::Config;
use paygate_rs::gateway::PaywallGateway;
use paygate_rs::handlers::{self, AppState};
use paygate_rs::hooks::HookRegistry;
use paygate_rs::idempotency::IdempotencyStore;
use paygate_rs::quote::QuoteEngine;
use paygate_rs::rate_limit::RateLimiter;
use paygate_rs::retry::RetryPolicy;
use paygate_rs::settlement::SettlementRecorder;
use paygate_rs::sig_down::SigDown;
use paygate_rs::store::MemoryStore;
use paygate_rs::subscription::{NullSubscriptionSource, SubscriptionReconciler};
use paygate_rs::telemetry::Telemetry;
use paygate_rs::types::PaymentMethod;
use paygate_rs::verifier::{
    CardSessionVerifier, DisabledCardRail, FacilitatorVerifier, ProofVerifier,
};
use paygate_rs::webhook::{HttpNotifier, WebhookEnqueuer, WebhookWorker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let telemetry = Telemetry::init();
    let config = Config::from_env()?;

    // Leaves first: clock, hooks, storage, then the engines, then the facade.
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let hooks = Arc::new(HookRegistry::standard());
    let store = Arc::new(MemoryStore::new());
    let catalog = Arc::new(CatalogCache::new(
        store.clone(),
        clock.clone(),
        Duration::from_secs(60),
    ));
    let breakers = Arc::new(BreakerRegistry::new(
        config.circuit_enabled,
        config.circuit.clone(),
        clock.clone(),
        hooks.clone(),
    ));
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit.clone(),
        clock.clone(),
        hooks.clone(),
    ));
    let idempotency = Arc::new(IdempotencyStore::new(clock.clone(), config.idempotency_ttl));

    let enqueuer = Arc::new(WebhookEnqueuer::new(
        store.clone(),
        config.delivery.clone(),
        clock.clone(),
        hooks.clone(),
    ));
    let settlement = Arc::new(SettlementRecorder::new(
        store.clone(),
        enqueuer.clone(),
        hooks.clone(),
    ));

    let card_rail = Arc::new(DisabledCardRail);
    let mut verifiers: HashMap<PaymentMethod, Arc<dyn ProofVerifier>> = HashMap::new();
    match &config.verifier_url {
        Some(url) => {
            verifiers.insert(
                PaymentMethod::Crypto,
                Arc::new(FacilitatorVerifier::new(
                    url.clone(),
                    config.verifier_timeout,
                    RetryPolicy::default(),
                    breakers.clone(),
                    hooks.clone(),
                )),
            );
        }
        None => {
            tracing::warn!("VERIFIER_URL not set, crypto proofs will not verify");
        }
    }
    verifiers.insert(
        PaymentMethod::Fiat,
        Arc::new(CardSessionVerifier::new(card_rail.clone(), breakers.clone())),
    );

    let quotes = Arc::new(QuoteEngine::new(
        catalog.clone(),
        store.clone(),
        settlement.clone(),
        verifiers,
        clock.clone(),
        hooks.clone(),
        config.quote.clone(),
    ));
    let reconciler = Arc::new(SubscriptionReconciler::new(
        store.clone(),
        Arc::new(NullSubscriptionSource),
        clock.clone(),
    ));
    let gateway = Arc::new(PaywallGateway::new(
        catalog,
        store.clone(),
        quotes,
        settlement,
        enqueuer,
        reconciler,
        card_rail,
        breakers.clone(),
        idempotency.clone(),
        hooks.clone(),
        clock.clone(),
        config.card_webhook_secret.clone(),
    ));

    let sig_down = SigDown::try_new()?;
    let shutdown = sig_down.cancellation_token();

    let worker = WebhookWorker::new(
        store,
        Arc::new(HttpNotifier::new()),
        breakers,
        hooks,
        clock,
        config.delivery.clone(),
        shutdown.clone(),
    );
    let worker_handle = worker.spawn();
    let sweeper_handle = idempotency
        .clone()
        .spawn_sweeper(Duration::from_secs(60), shutdown.clone());

    let state = Arc::new(AppState {
        gateway,
        limiter,
        idempotency,
        metrics: telemetry.prometheus.clone(),
        metrics_api_key: config.metrics_api_key.clone(),
        api_keys: config.api_keys.clone(),
    });
    let http_endpoints = Router::new()
        .merge(handlers::routes(state))
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        tracing::error!("Failed to bind to {}: {}", addr, err);
        err
    })?;

    let axum_cancellation_token = shutdown.clone();
    let axum_graceful_shutdown = async move { axum_cancellation_token.cancelled().await };
    axum::serve(
        listener,
        http_endpoints.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(axum_graceful_shutdown)
    .await?;

    // The server is down; wind down the background tasks before exiting.
    shutdown.cancel();
    let _ = worker_handle.await;
    let _ = sweeper_handle.await;

    Ok(())
}
