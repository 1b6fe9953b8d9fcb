//! Read-through cache of coupon records under `coupon:data:{code}`.
//!
//! Entries expire at the coupon's `valid_until`; expired coupons are never
//! cached. The entry is evicted once the coupon is marked used so a stale
//! `used = false` does not outlive the durable write. An unused record read
//! while the code is claimed expires with the claim, so a read racing the
//! usage commit cannot re-cache `used = false` past it.

use chrono::Utc;
use flashsale_core::keys;
use flashsale_core::store::{CounterStore, CouponRepository, KeyTtl};
use flashsale_core::types::CouponRecord;
use flashsale_core::FlashSaleResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct CouponMetadataCache {
    store: Arc<dyn CounterStore>,
    coupons: Arc<dyn CouponRepository>,
}

impl CouponMetadataCache {
    pub fn new(store: Arc<dyn CounterStore>, coupons: Arc<dyn CouponRepository>) -> Self {
        Self { store, coupons }
    }

    pub async fn get(&self, code: &str) -> FlashSaleResult<Option<CouponRecord>> {
        let key = keys::coupon_data(code);

        match self.store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<CouponRecord>(&raw) {
                Ok(coupon) => {
                    metrics::counter!("coupon.cache.hit").increment(1);
                    return Ok(Some(coupon));
                }
                Err(e) => {
                    warn!(code = %code, error = %e, "Corrupt coupon entry, evicting");
                    if let Err(e) = self.store.delete(&key).await {
                        warn!(code = %code, error = %e, "Failed to evict corrupt coupon entry");
                    }
                }
            },
            Ok(None) => {}
            Err(e) => warn!(code = %code, error = %e, "Coupon cache read failed"),
        }
        metrics::counter!("coupon.cache.miss").increment(1);

        let Some(coupon) = self.coupons.find_coupon(code).await? else {
            return Ok(None);
        };

        let ttl = (coupon.valid_until - Utc::now())
            .to_std()
            .ok()
            .filter(|ttl| !ttl.is_zero());
        let ttl = match ttl {
            Some(ttl) if !coupon.used => self.cap_at_claim(code, ttl).await,
            other => other,
        };
        if let Some(ttl) = ttl {
            let json = serde_json::to_string(&coupon)?;
            if let Err(e) = self.store.set(&key, &json, Some(ttl)).await {
                warn!(code = %code, error = %e, "Failed to cache coupon");
            } else {
                debug!(code = %code, ttl_secs = ttl.as_secs(), "Coupon cached");
            }
        }

        Ok(Some(coupon))
    }

    /// Shorten `ttl` to the remaining life of an outstanding claim on `code`.
    /// `None` means the entry must not be cached.
    async fn cap_at_claim(&self, code: &str, ttl: Duration) -> Option<Duration> {
        match self.store.ttl(&keys::coupon_claim(code)).await {
            Ok(KeyTtl::Missing) | Ok(KeyTtl::Persistent) => Some(ttl),
            Ok(KeyTtl::Expires(left)) => Some(ttl.min(left)).filter(|ttl| !ttl.is_zero()),
            Err(e) => {
                warn!(code = %code, error = %e, "Claim lookup failed, not caching coupon");
                None
            }
        }
    }

    /// Drop the cached record for `code`.
    pub async fn invalidate(&self, code: &str) {
        if let Err(e) = self.store.delete(&keys::coupon_data(code)).await {
            warn!(code = %code, error = %e, "Failed to evict coupon entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use flashsale_cache::InMemoryCounterStore;
    use flashsale_store::InMemoryDurableStore;
    use std::time::Duration;

    fn coupon(code: &str, valid_for: ChronoDuration) -> CouponRecord {
        CouponRecord {
            code: code.to_string(),
            discount: 15,
            valid_until: Utc::now() + valid_for,
            used: false,
        }
    }

    #[tokio::test]
    async fn test_caches_until_valid_until() {
        let counters = Arc::new(InMemoryCounterStore::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        durable.upsert_coupon(coupon("SAVE", ChronoDuration::hours(1)));
        let cache = CouponMetadataCache::new(counters.clone(), durable);

        assert_eq!(cache.get("SAVE").await.unwrap().unwrap().discount, 15);
        match counters.ttl(&keys::coupon_data("SAVE")).await.unwrap() {
            KeyTtl::Expires(left) => assert!(left <= Duration::from_secs(3600)),
            other => panic!("unexpected ttl {other:?}"),
        }

        cache.invalidate("SAVE").await;
        assert_eq!(counters.get(&keys::coupon_data("SAVE")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_coupon_is_not_cached() {
        let counters = Arc::new(InMemoryCounterStore::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        durable.upsert_coupon(coupon("OLD", -ChronoDuration::hours(1)));
        let cache = CouponMetadataCache::new(counters.clone(), durable);

        assert!(cache.get("OLD").await.unwrap().is_some());
        assert_eq!(counters.get(&keys::coupon_data("OLD")).await.unwrap(), None);
        assert!(cache.get("MISSING").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_unused_entry_dies_with_the_claim() {
        let counters = Arc::new(InMemoryCounterStore::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        durable.upsert_coupon(coupon("RACY", ChronoDuration::days(30)));
        let cache = CouponMetadataCache::new(counters.clone(), durable.clone());

        counters
            .set_if_absent(&keys::coupon_claim("RACY"), "7", Some(Duration::from_millis(100)))
            .await
            .unwrap();
        // A reader caches `used = false` after the commit already invalidated.
        assert!(!cache.get("RACY").await.unwrap().unwrap().used);
        durable.mark_used("RACY").await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.get("RACY").await.unwrap().unwrap().used);
    }

    #[tokio::test]
    async fn test_unused_entry_read_during_claim_expires_with_claim() {
        let counters = Arc::new(InMemoryCounterStore::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        durable.upsert_coupon(coupon("HOT", ChronoDuration::days(30)));
        let cache = CouponMetadataCache::new(counters.clone(), durable.clone());

        counters
            .set_if_absent(&keys::coupon_claim("HOT"), "7", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(!cache.get("HOT").await.unwrap().unwrap().used);
        match counters.ttl(&keys::coupon_data("HOT")).await.unwrap() {
            KeyTtl::Expires(left) => assert!(left <= Duration::from_secs(60)),
            other => panic!("unexpected ttl {other:?}"),
        }
    }
}
