//! Read-through / write-through cache over the catalog repositories.
//!
//! [`CatalogCache`] decorates a [`CatalogStore`] with per-key TTL entries for
//! products and coupons, a cached coupon list for auto-apply enumeration, and
//! a lazily rebuilt secondary index from card-processor price id to product
//! id.
//!
//! The read path uses double-checked locking: probe under the shared lock,
//! and on a miss re-probe under the exclusive lock before fetching, because
//! another caller may have refilled the entry in between. The re-probe takes
//! a fresh timestamp; reusing the first one could treat a just-refilled entry
//! as expired inside a tight TTL window, and the refill itself is stamped
//! with that same fresh timestamp.
//!
//! Write-through operations run the mutation first and invalidate only on
//! success, so a failed write leaves the cache untouched and coherent with
//! the store.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::store::{CatalogStore, StoreError};
use crate::types::{Coupon, Product};

struct Entry<T> {
    value: T,
    cached_at: DateTime<Utc>,
}

impl<T> Entry<T> {
    fn fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.cached_at < ttl
    }
}

#[derive(Default)]
struct CacheState {
    products: HashMap<String, Entry<Option<Product>>>,
    coupons: HashMap<String, Entry<Option<Coupon>>>,
    coupon_list: Option<Entry<Vec<Coupon>>>,
    /// Secondary index: card-processor price id -> product id.
    price_index: Option<Entry<HashMap<String, String>>>,
}

/// Caching decorator around the product and coupon repositories.
pub struct CatalogCache {
    store: Arc<dyn CatalogStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    state: RwLock<CacheState>,
}

impl CatalogCache {
    pub fn new(store: Arc<dyn CatalogStore>, clock: Arc<dyn Clock>, ttl: std::time::Duration) -> Self {
        Self {
            store,
            clock,
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(60)),
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Look up a product through the cache. Misses (including "no such
    /// product") are cached too, so hot 404s do not hammer the store.
    pub async fn product(&self, id: &str) -> Result<Option<Product>, StoreError> {
        let now = self.clock.now();
        {
            let state = self.state.read().await;
            if let Some(entry) = state.products.get(id) {
                if entry.fresh(now, self.ttl) {
                    return Ok(entry.value.clone());
                }
            }
        }

        let mut state = self.state.write().await;
        // Re-probe with a fresh timestamp: another caller may have refilled
        // the entry between the read unlock and the write lock.
        let now = self.clock.now();
        if let Some(entry) = state.products.get(id) {
            if entry.fresh(now, self.ttl) {
                return Ok(entry.value.clone());
            }
        }

        let fetched = self.store.product(id).await?;
        state.products.insert(
            id.to_string(),
            Entry {
                value: fetched.clone(),
                cached_at: now,
            },
        );
        Ok(fetched)
    }

    /// Look up a coupon through the cache, negative results included.
    pub async fn coupon(&self, code: &str) -> Result<Option<Coupon>, StoreError> {
        let now = self.clock.now();
        {
            let state = self.state.read().await;
            if let Some(entry) = state.coupons.get(code) {
                if entry.fresh(now, self.ttl) {
                    return Ok(entry.value.clone());
                }
            }
        }

        let mut state = self.state.write().await;
        let now = self.clock.now();
        if let Some(entry) = state.coupons.get(code) {
            if entry.fresh(now, self.ttl) {
                return Ok(entry.value.clone());
            }
        }

        let fetched = self.store.coupon(code).await?;
        state.coupons.insert(
            code.to_string(),
            Entry {
                value: fetched.clone(),
                cached_at: now,
            },
        );
        Ok(fetched)
    }

    /// The full coupon list, cached as one unit for auto-apply enumeration.
    pub async fn list_coupons(&self) -> Result<Vec<Coupon>, StoreError> {
        let now = self.clock.now();
        {
            let state = self.state.read().await;
            if let Some(entry) = &state.coupon_list {
                if entry.fresh(now, self.ttl) {
                    return Ok(entry.value.clone());
                }
            }
        }

        let mut state = self.state.write().await;
        let now = self.clock.now();
        if let Some(entry) = &state.coupon_list {
            if entry.fresh(now, self.ttl) {
                return Ok(entry.value.clone());
            }
        }

        let fetched = self.store.list_coupons().await?;
        state.coupon_list = Some(Entry {
            value: fetched.clone(),
            cached_at: now,
        });
        Ok(fetched)
    }

    /// Two-level lookup: resolve the price id through the secondary index,
    /// then the product through the primary cache.
    pub async fn product_by_price_id(
        &self,
        price_id: &str,
    ) -> Result<Option<Product>, StoreError> {
        let product_id = {
            let now = self.clock.now();
            let hit = {
                let state = self.state.read().await;
                state.price_index.as_ref().and_then(|entry| {
                    entry
                        .fresh(now, self.ttl)
                        .then(|| entry.value.get(price_id).cloned())
                })
            };
            match hit {
                Some(resolved) => resolved,
                None => {
                    let mut state = self.state.write().await;
                    let now = self.clock.now();
                    let rebuilt = match &state.price_index {
                        Some(entry) if entry.fresh(now, self.ttl) => None,
                        _ => {
                            let index: HashMap<String, String> = self
                                .store
                                .list_products()
                                .await?
                                .into_iter()
                                .filter_map(|p| {
                                    p.stripe_price_id.clone().map(|price| (price, p.id))
                                })
                                .collect();
                            Some(index)
                        }
                    };
                    if let Some(index) = rebuilt {
                        state.price_index = Some(Entry {
                            value: index,
                            cached_at: now,
                        });
                    }
                    state
                        .price_index
                        .as_ref()
                        .and_then(|entry| entry.value.get(price_id).cloned())
                }
            }
        };

        match product_id {
            Some(id) => self.product(&id).await,
            None => Ok(None),
        }
    }

    /// Write a product through to the store, then drop every cached entry.
    pub async fn upsert_product(&self, product: &Product) -> Result<(), StoreError> {
        self.store.upsert_product(product).await?;
        self.invalidate_all().await;
        Ok(())
    }

    /// Write a coupon through to the store, then drop every cached entry.
    pub async fn upsert_coupon(&self, coupon: &Coupon) -> Result<(), StoreError> {
        self.store.upsert_coupon(coupon).await?;
        self.invalidate_all().await;
        Ok(())
    }

    /// Bump a coupon's usage counter. Single-key mutation: only the touched
    /// coupon entry and the aggregate list are invalidated.
    pub async fn increment_coupon_usage(&self, code: &str) -> Result<(), StoreError> {
        self.store.increment_coupon_usage(code).await?;
        let mut state = self.state.write().await;
        state.coupons.remove(code);
        state.coupon_list = None;
        Ok(())
    }

    /// Drop every cached entry, forcing refills on next read.
    pub async fn invalidate_all(&self) {
        let mut state = self.state.write().await;
        state.products.clear();
        state.coupons.clear();
        state.coupon_list = None;
        state.price_index = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::types::{DiscountType, Money, MethodFilter, CouponScope};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Delegating catalog store that counts underlying reads.
    struct CountingStore {
        inner: MemoryStore,
        product_reads: AtomicUsize,
        coupon_reads: AtomicUsize,
        list_product_reads: AtomicUsize,
        list_coupon_reads: AtomicUsize,
    }

    impl CountingStore {
        fn new(inner: MemoryStore) -> Self {
            Self {
                inner,
                product_reads: AtomicUsize::new(0),
                coupon_reads: AtomicUsize::new(0),
                list_product_reads: AtomicUsize::new(0),
                list_coupon_reads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CatalogStore for CountingStore {
        async fn product(&self, id: &str) -> Result<Option<Product>, StoreError> {
            self.product_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.product(id).await
        }

        async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
            self.list_product_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.list_products().await
        }

        async fn upsert_product(&self, product: &Product) -> Result<(), StoreError> {
            self.inner.upsert_product(product).await
        }

        async fn coupon(&self, code: &str) -> Result<Option<Coupon>, StoreError> {
            self.coupon_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.coupon(code).await
        }

        async fn list_coupons(&self) -> Result<Vec<Coupon>, StoreError> {
            self.list_coupon_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.list_coupons().await
        }

        async fn upsert_coupon(&self, coupon: &Coupon) -> Result<(), StoreError> {
            self.inner.upsert_coupon(coupon).await
        }

        async fn increment_coupon_usage(&self, code: &str) -> Result<(), StoreError> {
            self.inner.increment_coupon_usage(code).await
        }
    }

    fn sample_product(id: &str, price_id: Option<&str>) -> Product {
        let now = Utc::now();
        Product {
            id: id.to_string(),
            description: format!("product {id}"),
            fiat_price: Some(Money::new(1000, "USD", 2)),
            crypto_price: Some(Money::new(1_000_000, "USDC", 6)),
            stripe_price_id: price_id.map(str::to_string),
            crypto_account: None,
            memo_template: String::new(),
            metadata: HashMap::new(),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_coupon(code: &str) -> Coupon {
        Coupon {
            code: code.to_string(),
            discount_type: DiscountType::Percentage,
            discount_value: Decimal::from(10),
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

    async fn fixture() -> (Arc<CountingStore>, Arc<ManualClock>, CatalogCache) {
        let store = MemoryStore::new();
        store
            .upsert_product(&sample_product("article-1", Some("price_123")))
            .await
            .expect("seed product");
        store
            .upsert_coupon(&sample_coupon("C"))
            .await
            .expect("seed coupon");
        let store = Arc::new(CountingStore::new(store));
        let clock = Arc::new(ManualClock::epoch());
        let cache = CatalogCache::new(
            store.clone(),
            clock.clone(),
            std::time::Duration::from_millis(100),
        );
        (store, clock, cache)
    }

    #[tokio::test]
    async fn read_through_serves_from_cache_until_ttl() {
        let (store, clock, cache) = fixture().await;

        assert!(cache.coupon("C").await.expect("read").is_some());
        assert_eq!(store.coupon_reads.load(Ordering::SeqCst), 1);

        // t+50ms: still fresh, underlying call count unchanged
        clock.advance(Duration::milliseconds(50));
        assert!(cache.coupon("C").await.expect("read").is_some());
        assert_eq!(store.coupon_reads.load(Ordering::SeqCst), 1);

        // t+150ms: expired, refetched
        clock.advance(Duration::milliseconds(100));
        assert!(cache.coupon("C").await.expect("read").is_some());
        assert_eq!(store.coupon_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn negative_results_are_cached() {
        let (store, _clock, cache) = fixture().await;

        assert!(cache.product("missing").await.expect("read").is_none());
        assert!(cache.product("missing").await.expect("read").is_none());
        assert_eq!(store.product_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_through_invalidates_on_success() {
        let (store, _clock, cache) = fixture().await;

        let before = cache.product("article-1").await.expect("read").expect("some");
        assert_eq!(before.fiat_price.as_ref().map(|m| m.atomic), Some(1000));

        let mut updated = sample_product("article-1", Some("price_123"));
        updated.fiat_price = Some(Money::new(2000, "USD", 2));
        cache.upsert_product(&updated).await.expect("write");

        // Next read goes back to the store and observes the new price.
        let after = cache.product("article-1").await.expect("read").expect("some");
        assert_eq!(after.fiat_price.as_ref().map(|m| m.atomic), Some(2000));
        assert_eq!(store.product_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn usage_increment_invalidates_only_touched_coupon() {
        let (store, _clock, cache) = fixture().await;
        store
            .inner
            .upsert_coupon(&sample_coupon("OTHER"))
            .await
            .expect("seed");

        cache.coupon("C").await.expect("read");
        cache.coupon("OTHER").await.expect("read");
        assert_eq!(store.coupon_reads.load(Ordering::SeqCst), 2);

        cache.increment_coupon_usage("C").await.expect("increment");

        let refreshed = cache.coupon("C").await.expect("read").expect("some");
        assert_eq!(refreshed.usage_count, 1);
        // OTHER stays cached
        cache.coupon("OTHER").await.expect("read");
        assert_eq!(store.coupon_reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_write_leaves_cache_untouched() {
        let (store, _clock, cache) = fixture().await;

        cache.coupon("C").await.expect("read");
        let result = cache.increment_coupon_usage("missing").await;
        assert!(result.is_err());

        // Cached entry for C survives a failed unrelated mutation.
        cache.coupon("C").await.expect("read");
        assert_eq!(store.coupon_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn price_index_resolves_in_two_levels() {
        let (store, clock, cache) = fixture().await;

        let product = cache
            .product_by_price_id("price_123")
            .await
            .expect("read")
            .expect("some");
        assert_eq!(product.id, "article-1");
        assert_eq!(store.list_product_reads.load(Ordering::SeqCst), 1);

        // Index cached: second lookup does not rebuild
        cache
            .product_by_price_id("price_123")
            .await
            .expect("read")
            .expect("some");
        assert_eq!(store.list_product_reads.load(Ordering::SeqCst), 1);

        // Index expires independently and is rebuilt lazily
        clock.advance(Duration::milliseconds(150));
        cache
            .product_by_price_id("price_123")
            .await
            .expect("read")
            .expect("some");
        assert_eq!(store.list_product_reads.load(Ordering::SeqCst), 2);

        assert!(
            cache
                .product_by_price_id("price_unknown")
                .await
                .expect("read")
                .is_none()
        );
    }

    #[tokio::test]
    async fn coupon_list_is_cached_as_one_unit() {
        let (store, _clock, cache) = fixture().await;

        assert_eq!(cache.list_coupons().await.expect("list").len(), 1);
        assert_eq!(cache.list_coupons().await.expect("list").len(), 1);
        assert_eq!(store.list_coupon_reads.load(Ordering::SeqCst), 1);
    }
}
