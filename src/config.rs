//! Environment-driven configuration.
//!
//! All settings come from environment variables (loaded from `.env` at
//! startup), with working defaults for local development. Startup fails fast
//! on malformed values and on a `TOKEN_MINT` outside the approved stablecoin
//! set, so an asset misconfiguration never reaches the pricing path.

use std::collections::{HashMap, HashSet};
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::circuit_breaker::BreakerSettings;
use crate::quote::QuoteConfig;
use crate::rate_limit::{ApiKeyTier, LayerConfig, RateLimitConfig};
use crate::retry::RetryPolicy;
use crate::webhook::DeliveryConfig;

const ENV_HOST: &str = "HOST";
const ENV_PORT: &str = "PORT";
const ENV_QUOTE_TTL: &str = "QUOTE_TTL";
const ENV_TOKEN_MINT: &str = "TOKEN_MINT";
const ENV_STABLECOIN_ASSETS: &str = "STABLECOIN_ASSETS";

const ENV_WEBHOOK_PAYMENT_URL: &str = "WEBHOOK_PAYMENT_URL";
const ENV_WEBHOOK_REFUND_URL: &str = "WEBHOOK_REFUND_URL";
const ENV_WEBHOOK_HEADERS: &str = "WEBHOOK_HEADERS";
const ENV_WEBHOOK_MAX_ATTEMPTS: &str = "WEBHOOK_MAX_ATTEMPTS";
const ENV_WEBHOOK_INITIAL_INTERVAL: &str = "WEBHOOK_INITIAL_INTERVAL";
const ENV_WEBHOOK_MAX_INTERVAL: &str = "WEBHOOK_MAX_INTERVAL";
const ENV_WEBHOOK_MULTIPLIER: &str = "WEBHOOK_MULTIPLIER";
const ENV_WEBHOOK_TIMEOUT: &str = "WEBHOOK_TIMEOUT";
const ENV_WEBHOOK_POLL_INTERVAL: &str = "WEBHOOK_POLL_INTERVAL";
const ENV_WEBHOOK_BATCH_SIZE: &str = "WEBHOOK_BATCH_SIZE";

const ENV_CIRCUIT_ENABLED: &str = "CIRCUIT_ENABLED";
const ENV_CIRCUIT_MAX_PROBE_REQUESTS: &str = "CIRCUIT_MAX_PROBE_REQUESTS";
const ENV_CIRCUIT_STATS_WINDOW: &str = "CIRCUIT_STATS_WINDOW";
const ENV_CIRCUIT_OPEN_TIMEOUT: &str = "CIRCUIT_OPEN_TIMEOUT";
const ENV_CIRCUIT_CONSECUTIVE_FAILURES: &str = "CIRCUIT_CONSECUTIVE_FAILURES";
const ENV_CIRCUIT_FAILURE_RATIO: &str = "CIRCUIT_FAILURE_RATIO";
const ENV_CIRCUIT_MIN_REQUESTS: &str = "CIRCUIT_MIN_REQUESTS";

const ENV_IDEMPOTENCY_TTL: &str = "IDEMPOTENCY_TTL";
const ENV_VERIFIER_URL: &str = "VERIFIER_URL";
const ENV_VERIFIER_TIMEOUT: &str = "VERIFIER_TIMEOUT";
const ENV_CARD_WEBHOOK_SECRET: &str = "CARD_WEBHOOK_SECRET";
const ENV_METRICS_API_KEY: &str = "METRICS_API_KEY";
const ENV_API_KEYS_ENTERPRISE: &str = "API_KEYS_ENTERPRISE";
const ENV_API_KEYS_PARTNER: &str = "API_KEYS_PARTNER";

/// Stablecoin mints the crypto rail may settle against. `TOKEN_MINT` must be
/// one of these.
const APPROVED_TOKEN_MINTS: &[&str] = &[
    // USDC on Solana mainnet
    "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
    // USDC on Base
    "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
    // USDC on Ethereum mainnet
    "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
    // USDT on Ethereum mainnet
    "0xdAC17F958D2ee523a2206206994597C13D831ec7",
];

/// Startup configuration failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {detail}")]
    Invalid { key: &'static str, detail: String },
    #[error("TOKEN_MINT {0} is not an approved stablecoin mint")]
    UnapprovedMint(String),
}

/// Fully resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub quote: QuoteConfig,
    pub delivery: DeliveryConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_enabled: bool,
    pub circuit: BreakerSettings,
    pub idempotency_ttl: Duration,
    pub verifier_url: Option<Url>,
    pub verifier_timeout: Duration,
    pub card_webhook_secret: Option<String>,
    pub metrics_api_key: Option<String>,
    pub api_keys: HashMap<String, ApiKeyTier>,
}

fn parse_env<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.is_empty() => raw.parse::<T>().map(Some).map_err(|err| {
            ConfigError::Invalid {
                key,
                detail: err.to_string(),
            }
        }),
        _ => Ok(None),
    }
}

fn parse_env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    Ok(parse_env(key)?.unwrap_or(default))
}

/// Durations are given in seconds; fractional values are accepted.
fn secs_env(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match parse_env::<f64>(key)? {
        Some(secs) if secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
        Some(_) => Err(ConfigError::Invalid {
            key,
            detail: "must be non-negative".to_string(),
        }),
        None => Ok(default),
    }
}

fn layer_env(
    enabled_key: &'static str,
    limit_key: &'static str,
    window_key: &'static str,
    burst_key: &'static str,
) -> Result<LayerConfig, ConfigError> {
    Ok(LayerConfig {
        enabled: parse_env_or(enabled_key, false)?,
        limit: parse_env_or(limit_key, 100)?,
        window: secs_env(window_key, Duration::from_secs(60))?,
        burst: parse_env_or(burst_key, 0)?,
    })
}

fn keys_env(key: &'static str, tier: ApiKeyTier, into: &mut HashMap<String, ApiKeyTier>) {
    if let Ok(raw) = env::var(key) {
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            into.insert(entry.to_string(), tier);
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = parse_env_or(ENV_HOST, IpAddr::V4(Ipv4Addr::UNSPECIFIED))?;
        let port = parse_env_or(ENV_PORT, 8080)?;

        let mut quote = QuoteConfig {
            quote_ttl: secs_env(ENV_QUOTE_TTL, Duration::from_secs(300))?,
            ..QuoteConfig::default()
        };
        if let Ok(raw) = env::var(ENV_STABLECOIN_ASSETS) {
            let assets: HashSet<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_uppercase)
                .collect();
            if !assets.is_empty() {
                quote.approved_assets = assets;
            }
        }
        if let Some(mint) = parse_env::<String>(ENV_TOKEN_MINT)? {
            if !APPROVED_TOKEN_MINTS.contains(&mint.as_str()) {
                return Err(ConfigError::UnapprovedMint(mint));
            }
        }

        let headers: HashMap<String, String> = match env::var(ENV_WEBHOOK_HEADERS) {
            Ok(raw) if !raw.is_empty() => {
                serde_json::from_str(&raw).map_err(|err| ConfigError::Invalid {
                    key: ENV_WEBHOOK_HEADERS,
                    detail: format!("expected a JSON object of strings: {err}"),
                })?
            }
            _ => HashMap::new(),
        };
        let delivery_defaults = DeliveryConfig::default();
        let delivery = DeliveryConfig {
            payment_url: parse_env(ENV_WEBHOOK_PAYMENT_URL)?,
            refund_url: parse_env(ENV_WEBHOOK_REFUND_URL)?,
            headers,
            retry: RetryPolicy {
                max_attempts: parse_env_or(
                    ENV_WEBHOOK_MAX_ATTEMPTS,
                    delivery_defaults.retry.max_attempts,
                )?,
                initial_interval: secs_env(
                    ENV_WEBHOOK_INITIAL_INTERVAL,
                    delivery_defaults.retry.initial_interval,
                )?,
                max_interval: secs_env(
                    ENV_WEBHOOK_MAX_INTERVAL,
                    delivery_defaults.retry.max_interval,
                )?,
                multiplier: parse_env_or(
                    ENV_WEBHOOK_MULTIPLIER,
                    delivery_defaults.retry.multiplier,
                )?,
            },
            timeout: secs_env(ENV_WEBHOOK_TIMEOUT, delivery_defaults.timeout)?,
            poll_interval: secs_env(ENV_WEBHOOK_POLL_INTERVAL, delivery_defaults.poll_interval)?,
            batch_size: parse_env_or(ENV_WEBHOOK_BATCH_SIZE, delivery_defaults.batch_size)?,
        };

        let rate_limit = RateLimitConfig {
            global: layer_env(
                "RATE_LIMIT_GLOBAL_ENABLED",
                "RATE_LIMIT_GLOBAL_LIMIT",
                "RATE_LIMIT_GLOBAL_WINDOW",
                "RATE_LIMIT_GLOBAL_BURST",
            )?,
            wallet: layer_env(
                "RATE_LIMIT_WALLET_ENABLED",
                "RATE_LIMIT_WALLET_LIMIT",
                "RATE_LIMIT_WALLET_WINDOW",
                "RATE_LIMIT_WALLET_BURST",
            )?,
            ip: layer_env(
                "RATE_LIMIT_IP_ENABLED",
                "RATE_LIMIT_IP_LIMIT",
                "RATE_LIMIT_IP_WINDOW",
                "RATE_LIMIT_IP_BURST",
            )?,
        };

        let circuit_defaults = BreakerSettings::default();
        let circuit = BreakerSettings {
            max_probe_requests: parse_env_or(
                ENV_CIRCUIT_MAX_PROBE_REQUESTS,
                circuit_defaults.max_probe_requests,
            )?,
            stats_window: secs_env(ENV_CIRCUIT_STATS_WINDOW, circuit_defaults.stats_window)?,
            open_timeout: secs_env(ENV_CIRCUIT_OPEN_TIMEOUT, circuit_defaults.open_timeout)?,
            consecutive_failures_to_trip: parse_env_or(
                ENV_CIRCUIT_CONSECUTIVE_FAILURES,
                circuit_defaults.consecutive_failures_to_trip,
            )?,
            failure_ratio_to_trip: parse_env_or(
                ENV_CIRCUIT_FAILURE_RATIO,
                circuit_defaults.failure_ratio_to_trip,
            )?,
            min_requests_before_ratio: parse_env_or(
                ENV_CIRCUIT_MIN_REQUESTS,
                circuit_defaults.min_requests_before_ratio,
            )?,
        };

        let mut api_keys = HashMap::new();
        keys_env(ENV_API_KEYS_ENTERPRISE, ApiKeyTier::Enterprise, &mut api_keys);
        keys_env(ENV_API_KEYS_PARTNER, ApiKeyTier::Partner, &mut api_keys);

        Ok(Config {
            host,
            port,
            quote,
            delivery,
            rate_limit,
            circuit_enabled: parse_env_or(ENV_CIRCUIT_ENABLED, true)?,
            circuit,
            idempotency_ttl: secs_env(ENV_IDEMPOTENCY_TTL, Duration::from_secs(86_400))?,
            verifier_url: parse_env(ENV_VERIFIER_URL)?,
            verifier_timeout: secs_env(ENV_VERIFIER_TIMEOUT, Duration::from_secs(10))?,
            card_webhook_secret: parse_env(ENV_CARD_WEBHOOK_SECRET)?,
            metrics_api_key: parse_env(ENV_METRICS_API_KEY)?,
            api_keys,
        })
    }
}
