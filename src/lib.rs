//! Payment-event processing core of a paywall gateway.
//!
//! This crate mediates two payment rails — a card-processor "fiat" rail and
//! a stablecoin "crypto" rail — and guarantees reliable delivery of
//! payment-outcome events to merchant webhook endpoints.
//!
//! # Architecture
//!
//! Ingress flows through defense-in-depth layers (rate limiting, idempotency
//! replay) into the control-plane facade, which drives the quote engine, the
//! rail verifiers, and the settlement recorder. Settled payments fan into a
//! persistent webhook queue drained by a long-running worker with
//! exponential backoff and a dead-letter tier. Observability hooks fire at
//! every boundary.
//!
//! # Modules
//!
//! - [`types`] — domain model: products, coupons, quotes, payments,
//!   subscriptions, queue rows.
//! - [`error`] — the error taxonomy with machine-readable codes and
//!   retryability.
//! - [`store`] — the storage contract and the in-memory reference backend.
//! - [`cache`] — read-through / write-through catalog cache with TTL and a
//!   card-price secondary index.
//! - [`rate_limit`] — three-tier token-bucket limiter with API-key tier
//!   bypass.
//! - [`circuit_breaker`] — named per-service breakers with half-open probes.
//! - [`idempotency`] — caller-keyed response replay.
//! - [`retry`] — bounded retry with transient-error classification.
//! - [`quote`] — quote minting, coupon stacking, and quote consumption.
//! - [`settlement`] — atomic payment admission keyed on proof signature.
//! - [`webhook`] — persistent delivery queue: enqueuer and worker.
//! - [`subscription`] — reconciliation of external subscription lifecycles.
//! - [`verifier`] — collaborator interfaces for the chain verifier and the
//!   card rail.
//! - [`gateway`] — the control-plane facade.
//! - [`handlers`] — the axum HTTP surface.
//! - [`events`] — merchant-facing payment/refund events and event ids.
//! - [`hooks`] — the observability bus.
//! - [`config`] — environment-driven configuration.
//! - [`clock`] — injectable time source.

pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod hooks;
pub mod idempotency;
pub mod quote;
pub mod rate_limit;
pub mod retry;
pub mod settlement;
pub mod sig_down;
pub mod store;
pub mod subscription;
pub mod telemetry;
pub mod types;
pub mod util;
pub mod verifier;
pub mod webhook;
