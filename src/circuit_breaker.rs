//! Per-service circuit breakers.
//!
//! A [`BreakerRegistry`] lazily creates one named [`Breaker`] per downstream
//! service (`chain_rpc`, `card_api`, `webhook_out`). Each breaker is a
//! three-state machine:
//!
//! - **closed**: calls flow; failures are counted in a rolling stats window.
//!   Trips to open when consecutive failures reach the threshold, or when the
//!   window holds enough requests and the failure ratio crosses its
//!   threshold.
//! - **open**: calls fail fast with [`BreakerError::Open`] without invoking
//!   the downstream. After the open timeout the next call is admitted as a
//!   probe.
//! - **half-open**: probes flow; enough consecutive probe successes restore
//!   closed, any probe failure reopens.

use dashmap::DashMap;
use std::fmt;
use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::hooks::HookRegistry;

/// Tuning knobs shared by every breaker in a registry.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Consecutive probe successes required to close from half-open.
    pub max_probe_requests: u32,
    /// Length of the rolling stats window in the closed state.
    pub stats_window: Duration,
    /// How long the breaker stays open before admitting a probe.
    pub open_timeout: Duration,
    pub consecutive_failures_to_trip: u32,
    pub failure_ratio_to_trip: f64,
    /// Minimum requests in the window before the ratio rule applies.
    pub min_requests_before_ratio: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_probe_requests: 3,
            stats_window: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
            consecutive_failures_to_trip: 5,
            failure_ratio_to_trip: 0.5,
            min_requests_before_ratio: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// Wrapper distinguishing a fast-failed call from a real downstream error.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit open for {service}")]
    Open { service: String },
    #[error("{0}")]
    Inner(E),
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    window_requests: u32,
    window_failures: u32,
    window_started: chrono::DateTime<chrono::Utc>,
    opened_at: chrono::DateTime<chrono::Utc>,
    probe_successes: u32,
}

/// A single named breaker.
pub struct Breaker {
    name: String,
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    hooks: Arc<HookRegistry>,
    inner: Mutex<BreakerInner>,
}

impl Breaker {
    fn new(
        name: String,
        settings: BreakerSettings,
        clock: Arc<dyn Clock>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        let now = clock.now();
        Self {
            name,
            settings,
            clock,
            hooks,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                window_requests: 0,
                window_failures: 0,
                window_started: now,
                opened_at: now,
                probe_successes: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Admission check. In the open state this transitions to half-open once
    /// the open timeout elapsed, otherwise the call is rejected.
    fn admit(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let open_for = self.clock.now() - inner.opened_at;
                let timeout = chrono::Duration::from_std(self.settings.open_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
                if open_for >= timeout {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.probe_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => {
                self.roll_window(&mut inner);
                inner.window_requests += 1;
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.probe_successes += 1;
                if inner.probe_successes >= self.settings.max_probe_requests {
                    self.transition(&mut inner, BreakerState::Closed);
                    inner.consecutive_failures = 0;
                    inner.window_requests = 0;
                    inner.window_failures = 0;
                    inner.window_started = self.clock.now();
                }
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => {
                self.roll_window(&mut inner);
                inner.window_requests += 1;
                inner.window_failures += 1;
                inner.consecutive_failures += 1;

                let consecutive_trip =
                    inner.consecutive_failures >= self.settings.consecutive_failures_to_trip;
                let ratio_trip = inner.window_requests >= self.settings.min_requests_before_ratio
                    && f64::from(inner.window_failures) / f64::from(inner.window_requests)
                        >= self.settings.failure_ratio_to_trip;
                if consecutive_trip || ratio_trip {
                    self.transition(&mut inner, BreakerState::Open);
                    inner.opened_at = self.clock.now();
                }
            }
            BreakerState::HalfOpen => {
                self.transition(&mut inner, BreakerState::Open);
                inner.opened_at = self.clock.now();
                inner.probe_successes = 0;
            }
            BreakerState::Open => {}
        }
    }

    fn roll_window(&self, inner: &mut BreakerInner) {
        let window = chrono::Duration::from_std(self.settings.stats_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let now = self.clock.now();
        if now - inner.window_started >= window {
            inner.window_started = now;
            inner.window_requests = 0;
            inner.window_failures = 0;
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        if from != to {
            inner.state = to;
            self.hooks
                .circuit_transition(&self.name, &from.to_string(), &to.to_string());
        }
    }
}

/// Registry of named breakers sharing one settings block.
pub struct BreakerRegistry {
    enabled: bool,
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    hooks: Arc<HookRegistry>,
    breakers: DashMap<String, Arc<Breaker>>,
}

impl BreakerRegistry {
    pub fn new(
        enabled: bool,
        settings: BreakerSettings,
        clock: Arc<dyn Clock>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            enabled,
            settings,
            clock,
            hooks,
            breakers: DashMap::new(),
        }
    }

    /// The breaker for `service`, created on first use.
    pub fn breaker(&self, service: &str) -> Arc<Breaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(Breaker::new(
                    service.to_string(),
                    self.settings.clone(),
                    self.clock.clone(),
                    self.hooks.clone(),
                ))
            })
            .clone()
    }

    /// Current states of all known breakers, for health reporting.
    pub fn states(&self) -> Vec<(String, BreakerState)> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }

    /// Run `f` through the breaker for `service`.
    ///
    /// When the registry is disabled this is a pass-through. When the breaker
    /// is open the call fails fast without invoking `f`; otherwise `f`'s
    /// outcome is recorded and returned.
    pub async fn execute<T, E, F, Fut>(&self, service: &str, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.enabled {
            return f().await.map_err(BreakerError::Inner);
        }
        let breaker = self.breaker(service);
        if !breaker.admit() {
            return Err(BreakerError::Open {
                service: service.to_string(),
            });
        }
        match f().await {
            Ok(value) => {
                breaker.record_success();
                Ok(value)
            }
            Err(err) => {
                breaker.record_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }
}
