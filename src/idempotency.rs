//! Caller-keyed idempotent response replay.
//!
//! Mutating HTTP calls may carry an `Idempotency-Key` header. The facade
//! consults this store before entering the core and replays the cached
//! response verbatim on a duplicate key. Entries expire after a configured
//! TTL (24 hours by default); a background sweeper evicts expired entries so
//! the map stays bounded.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::types::IdempotencyRecord;

/// TTL'd map from caller-supplied idempotency key to cached response.
pub struct IdempotencyStore {
    entries: DashMap<String, IdempotencyRecord>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl IdempotencyStore {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24)),
        }
    }

    /// The cached response for `key`, if present and not expired.
    pub fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(record) if now - record.created_at < self.ttl => {
                return Some(record.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Cache a response for `key`. Last writer wins; callers racing on the
    /// same key produce equivalent responses by construction.
    pub fn put(&self, key: &str, status_code: u16, response: Vec<u8>) {
        self.entries.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                response,
                status_code,
                created_at: self.clock.now(),
            },
        );
    }

    /// Drop every expired entry. Returns how many were evicted.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries
            .retain(|_, record| now - record.created_at < self.ttl);
        before - self.entries.len()
    }

    /// Spawn the background eviction task. Runs until `shutdown` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        let evicted = store.purge_expired();
                        if evicted > 0 {
                            tracing::debug!(evicted, "idempotency sweeper evicted entries");
                        }
                    }
                }
            }
        })
    }
}
