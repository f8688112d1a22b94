//! Three-tier token-bucket rate limiting.
//!
//! Requests pass through up to three independent layers in order: **global**,
//! **per-wallet**, **per-ip**. Each layer has its own `{limit, window,
//! burst}` bucket configuration and can be disabled outright. Buckets live in
//! a [`DashMap`] keyed by layer identifier and refill continuously at
//! `limit / window`.
//!
//! API-key tiers short-circuit layers: `Enterprise` and `Partner` keys skip
//! the per-wallet and per-ip layers, and `Partner` keys additionally skip the
//! global layer. Requests without a wallet identity fall through to their IP
//! for the per-wallet layer.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::GatewayError;
use crate::hooks::HookRegistry;

/// API-key tier attached to an authenticated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKeyTier {
    Standard,
    Enterprise,
    Partner,
}

impl ApiKeyTier {
    fn bypasses_global(self) -> bool {
        matches!(self, ApiKeyTier::Partner)
    }

    fn bypasses_identity_layers(self) -> bool {
        matches!(self, ApiKeyTier::Partner | ApiKeyTier::Enterprise)
    }
}

/// Bucket parameters for a single layer.
#[derive(Debug, Clone)]
pub struct LayerConfig {
    pub enabled: bool,
    pub limit: u32,
    pub window: Duration,
    pub burst: u32,
}

impl LayerConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            limit: 0,
            window: Duration::from_secs(1),
            burst: 0,
        }
    }
}

/// Configuration for all three layers.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub global: LayerConfig,
    pub wallet: LayerConfig,
    pub ip: LayerConfig,
}

/// Identity of an inbound request, as extracted by the HTTP layer.
///
/// `wallet` follows the extraction precedence `X-Wallet` header, `X-Signer`
/// header, `wallet` query parameter; when all are absent the per-wallet layer
/// keys on the request IP instead.
#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    pub tier: Option<ApiKeyTier>,
    pub wallet: Option<String>,
    pub ip: Option<String>,
}

struct Bucket {
    tokens: f64,
    last_refill: chrono::DateTime<chrono::Utc>,
}

/// The three-tier limiter.
pub struct RateLimiter {
    cfg: RateLimitConfig,
    clock: Arc<dyn Clock>,
    hooks: Arc<HookRegistry>,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig, clock: Arc<dyn Clock>, hooks: Arc<HookRegistry>) -> Self {
        Self {
            cfg,
            clock,
            hooks,
            buckets: DashMap::new(),
        }
    }

    /// Run the request through every layer its tier does not bypass.
    ///
    /// Returns [`GatewayError::RateLimited`] from the first rejecting layer,
    /// carrying that layer's window as the retry-after hint.
    pub fn check(&self, scope: &RequestScope) -> Result<(), GatewayError> {
        let tier = scope.tier.unwrap_or(ApiKeyTier::Standard);

        if !tier.bypasses_global() {
            self.take("global", "global".to_string(), &self.cfg.global)?;
        }
        if tier.bypasses_identity_layers() {
            return Ok(());
        }

        let wallet_key = scope
            .wallet
            .as_deref()
            .or(scope.ip.as_deref())
            .map(|id| format!("wallet:{id}"));
        if let Some(key) = wallet_key {
            self.take("wallet", key, &self.cfg.wallet)?;
        }
        if let Some(ip) = scope.ip.as_deref() {
            self.take("ip", format!("ip:{ip}"), &self.cfg.ip)?;
        }
        Ok(())
    }

    fn take(
        &self,
        layer: &'static str,
        key: String,
        cfg: &LayerConfig,
    ) -> Result<(), GatewayError> {
        if !cfg.enabled || cfg.limit == 0 {
            return Ok(());
        }
        let now = self.clock.now();
        let capacity = f64::from(cfg.limit + cfg.burst);
        let window_secs = cfg.window.as_secs_f64().max(f64::EPSILON);
        let rate = f64::from(cfg.limit) / window_secs;

        let mut bucket = self.buckets.entry(key.clone()).or_insert_with(|| Bucket {
            tokens: capacity,
            last_refill: now,
        });
        let elapsed = (now - bucket.last_refill)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }
        drop(bucket);

        self.hooks.rate_limit_hit(layer, &key);
        Err(GatewayError::RateLimited {
            layer,
            retry_after_seconds: cfg.window.as_secs().max(1),
        })
    }

    /// Drop buckets that have not been touched within `idle`. Called
    /// periodically to bound memory under churning identities.
    pub fn purge_idle(&self, idle: Duration) -> usize {
        let cutoff = self.clock.now()
            - chrono::Duration::from_std(idle).unwrap_or_else(|_| chrono::Duration::seconds(300));
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.last_refill >= cutoff);
        before - self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn layer(limit: u32, window_secs: u64, burst: u32) -> LayerConfig {
        LayerConfig {
            enabled: true,
            limit,
            window: Duration::from_secs(window_secs),
            burst,
        }
    }

    fn limiter(cfg: RateLimitConfig) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::epoch());
        let limiter = RateLimiter::new(cfg, clock.clone(), Arc::new(HookRegistry::new()));
        (clock, limiter)
    }

    fn unkeyed(ip: &str) -> RequestScope {
        RequestScope {
            tier: None,
            wallet: None,
            ip: Some(ip.to_string()),
        }
    }

    #[test]
    fn global_layer_exhausts_and_recovers() {
        let cfg = RateLimitConfig {
            global: layer(5, 1, 0),
            wallet: LayerConfig::disabled(),
            ip: LayerConfig::disabled(),
        };
        let (clock, limiter) = limiter(cfg);
        let scope = unkeyed("10.0.0.1");

        for i in 0..5 {
            assert!(limiter.check(&scope).is_ok(), "request {i}");
        }
        match limiter.check(&scope) {
            Err(GatewayError::RateLimited {
                layer,
                retry_after_seconds,
            }) => {
                assert_eq!(layer, "global");
                assert_eq!(retry_after_seconds, 1);
            }
            other => panic!("expected rate limit rejection, got {other:?}"),
        }

        clock.advance(chrono::Duration::seconds(1));
        assert!(limiter.check(&scope).is_ok());
    }

    #[test]
    fn wallet_layer_keys_on_wallet_and_falls_through_to_ip() {
        let cfg = RateLimitConfig {
            global: LayerConfig::disabled(),
            wallet: layer(1, 60, 0),
            ip: LayerConfig::disabled(),
        };
        let (_clock, limiter) = limiter(cfg);

        let mut alice = unkeyed("10.0.0.1");
        alice.wallet = Some("wallet-alice".to_string());
        let mut bob = unkeyed("10.0.0.1");
        bob.wallet = Some("wallet-bob".to_string());

        assert!(limiter.check(&alice).is_ok());
        assert!(limiter.check(&alice).is_err(), "alice's bucket exhausted");
        assert!(limiter.check(&bob).is_ok(), "bob has his own bucket");

        // Unkeyed requests from distinct IPs get distinct fallthrough buckets
        assert!(limiter.check(&unkeyed("10.0.0.2")).is_ok());
        assert!(limiter.check(&unkeyed("10.0.0.2")).is_err());
        assert!(limiter.check(&unkeyed("10.0.0.3")).is_ok());
    }

    #[test]
    fn partner_bypasses_all_layers() {
        let cfg = RateLimitConfig {
            global: layer(1, 60, 0),
            wallet: layer(1, 60, 0),
            ip: layer(1, 60, 0),
        };
        let (_clock, limiter) = limiter(cfg);
        let mut scope = unkeyed("10.0.0.1");
        scope.wallet = Some("wallet-1".to_string());
        scope.tier = Some(ApiKeyTier::Partner);

        for _ in 0..20 {
            assert!(limiter.check(&scope).is_ok());
        }
    }

    #[test]
    fn enterprise_bypasses_identity_layers_but_not_global() {
        let cfg = RateLimitConfig {
            global: layer(2, 60, 0),
            wallet: layer(1, 60, 0),
            ip: layer(1, 60, 0),
        };
        let (_clock, limiter) = limiter(cfg);
        let mut scope = unkeyed("10.0.0.1");
        scope.wallet = Some("wallet-1".to_string());
        scope.tier = Some(ApiKeyTier::Enterprise);

        assert!(limiter.check(&scope).is_ok());
        assert!(limiter.check(&scope).is_ok());
        match limiter.check(&scope) {
            Err(GatewayError::RateLimited { layer, .. }) => assert_eq!(layer, "global"),
            other => panic!("expected global rejection, got {other:?}"),
        }
    }

    #[test]
    fn burst_extends_capacity() {
        let cfg = RateLimitConfig {
            global: layer(2, 60, 3),
            wallet: LayerConfig::disabled(),
            ip: LayerConfig::disabled(),
        };
        let (_clock, limiter) = limiter(cfg);
        let scope = unkeyed("10.0.0.1");

        for i in 0..5 {
            assert!(limiter.check(&scope).is_ok(), "request {i}");
        }
        assert!(limiter.check(&scope).is_err());
    }

    #[test]
    fn disabled_layer_is_pass_through() {
        let cfg = RateLimitConfig {
            global: LayerConfig::disabled(),
            wallet: LayerConfig::disabled(),
            ip: LayerConfig::disabled(),
        };
        let (_clock, limiter) = limiter(cfg);
        for _ in 0..100 {
            assert!(limiter.check(&unkeyed("10.0.0.1")).is_ok());
        }
    }

    #[test]
    fn idle_buckets_are_purged() {
        let cfg = RateLimitConfig {
            global: LayerConfig::disabled(),
            wallet: LayerConfig::disabled(),
            ip: layer(5, 1, 0),
        };
        let (clock, limiter) = limiter(cfg);
        limiter.check(&unkeyed("10.0.0.1")).expect("allowed");
        limiter.check(&unkeyed("10.0.0.2")).expect("allowed");

        clock.advance(chrono::Duration::seconds(600));
        limiter.check(&unkeyed("10.0.0.3")).expect("allowed");

        let purged = limiter.purge_idle(Duration::from_secs(300));
        assert_eq!(purged, 2);
    }
}
