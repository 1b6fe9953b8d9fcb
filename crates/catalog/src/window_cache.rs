//! TTL-bounded cache of flash-sale windows with a reverse product index.
//!
//! Every cached entry for a window expires at the window's `end_at`, so the
//! counter store never serves a window after it ended. Reads still re-check
//! the bounds because expiry in the store is not exact to the millisecond.
//!
//! Cache failures on the read path degrade to the durable store; they never
//! fail a lookup on their own.

use chrono::{DateTime, Utc};
use flashsale_core::keys;
use flashsale_core::store::{CounterStore, FlashSaleRepository};
use flashsale_core::types::{FlashSaleWindow, ProductId, WindowId};
use flashsale_core::FlashSaleResult;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest time an empty active-windows list is served from the cache.
pub const EMPTY_ACTIVE_TTL: Duration = Duration::from_secs(5);

/// Lifetime of the active-windows aggregate computed at `now`: until the
/// soonest active window ends or the soonest upcoming one starts, whichever
/// comes first. With nothing running it is capped at [`EMPTY_ACTIVE_TTL`].
fn aggregate_ttl(windows: &[FlashSaleWindow], now: DateTime<Utc>) -> Duration {
    let soonest_end = windows
        .iter()
        .filter(|w| w.is_active_at(now))
        .filter_map(|w| w.remaining_at(now))
        .min();
    let soonest_start = windows
        .iter()
        .filter(|w| w.start_at >= now && w.end_at > now)
        .filter_map(|w| (w.start_at - now).to_std().ok())
        .min();

    let cap = soonest_end.unwrap_or(EMPTY_ACTIVE_TTL);
    soonest_start
        .map_or(cap, |start| start.min(cap))
        .max(Duration::from_millis(1))
}

pub struct FlashSaleWindowCache {
    store: Arc<dyn CounterStore>,
    windows: Arc<dyn FlashSaleRepository>,
}

impl FlashSaleWindowCache {
    pub fn new(store: Arc<dyn CounterStore>, windows: Arc<dyn FlashSaleRepository>) -> Self {
        Self { store, windows }
    }

    /// Cache `window`, its product set and one reverse-index entry per
    /// product, all expiring at `end_at`, and drop the active-windows
    /// aggregate so the next read picks the window up. Returns `false` and
    /// writes nothing when the window has already ended.
    pub async fn cache_window(&self, window: &FlashSaleWindow) -> FlashSaleResult<bool> {
        if !self.cache_window_at(window, Utc::now()).await? {
            return Ok(false);
        }
        self.store.delete(keys::ACTIVE_WINDOWS).await?;
        Ok(true)
    }

    /// Write the per-window entries only; the aggregate is left alone.
    async fn cache_window_at(
        &self,
        window: &FlashSaleWindow,
        now: DateTime<Utc>,
    ) -> FlashSaleResult<bool> {
        let Some(ttl) = window.remaining_at(now) else {
            debug!(window_id = window.id, "Window already ended, not caching");
            return Ok(false);
        };

        let json = serde_json::to_string(window)?;
        self.store
            .set(&keys::window(window.id), &json, Some(ttl))
            .await?;

        let members: Vec<String> = window.product_ids.iter().map(|id| id.to_string()).collect();
        self.store
            .replace_set(&keys::window_products(window.id), &members, Some(ttl))
            .await?;

        let owner = window.id.to_string();
        for product_id in &window.product_ids {
            self.store
                .set(&keys::product_window(*product_id), &owner, Some(ttl))
                .await?;
        }

        metrics::counter!("flashsale.window.cached").increment(1);
        debug!(
            window_id = window.id,
            products = window.product_ids.len(),
            ttl_ms = ttl.as_millis() as u64,
            "Window cached"
        );
        Ok(true)
    }

    pub fn is_active(&self, window: &FlashSaleWindow) -> bool {
        window.is_active_at(Utc::now())
    }

    pub fn is_active_at(&self, window: &FlashSaleWindow, now: DateTime<Utc>) -> bool {
        window.is_active_at(now)
    }

    /// Windows running right now.
    pub async fn get_active_windows(&self) -> FlashSaleResult<Vec<FlashSaleWindow>> {
        let now = Utc::now();

        if let Some(cached) = self.cached_active(now).await {
            metrics::counter!("flashsale.active.hit").increment(1);
            return Ok(cached);
        }
        metrics::counter!("flashsale.active.miss").increment(1);

        let windows = self.windows.find_all_windows().await?;
        let ttl = aggregate_ttl(&windows, now);
        let active: Vec<FlashSaleWindow> = windows
            .into_iter()
            .filter(|w| w.is_active_at(now))
            .collect();

        match serde_json::to_string(&active) {
            Ok(json) => {
                if let Err(e) = self.store.set(keys::ACTIVE_WINDOWS, &json, Some(ttl)).await {
                    warn!(error = %e, "Failed to cache active windows");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize active windows"),
        }

        for window in &active {
            if let Err(e) = self.cache_window_at(window, now).await {
                warn!(window_id = window.id, error = %e, "Failed to cache window");
            }
        }

        Ok(active)
    }

    async fn cached_active(&self, now: DateTime<Utc>) -> Option<Vec<FlashSaleWindow>> {
        let raw = match self.store.get(keys::ACTIVE_WINDOWS).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "Active windows lookup failed, reading durable store");
                return None;
            }
        };

        match serde_json::from_str::<Vec<FlashSaleWindow>>(&raw) {
            Ok(windows) => Some(
                windows
                    .into_iter()
                    .filter(|w| w.is_active_at(now))
                    .collect(),
            ),
            Err(e) => {
                warn!(error = %e, "Corrupt active windows entry, evicting");
                if let Err(e) = self.store.delete(keys::ACTIVE_WINDOWS).await {
                    warn!(error = %e, "Failed to evict active windows entry");
                }
                None
            }
        }
    }

    /// The active window selling `product_id`, if any.
    ///
    /// Uses the reverse index first; a missing or stale entry falls back to
    /// scanning the active windows and re-indexes the window found.
    pub async fn get_window_for_product(
        &self,
        product_id: ProductId,
    ) -> FlashSaleResult<Option<FlashSaleWindow>> {
        let now = Utc::now();

        if let Some(window) = self.indexed_window(product_id, now).await {
            metrics::counter!("flashsale.index.hit").increment(1);
            return Ok(Some(window));
        }
        metrics::counter!("flashsale.index.miss").increment(1);

        let found = self
            .get_active_windows()
            .await?
            .into_iter()
            .find(|w| w.contains(product_id));

        if let Some(window) = &found {
            if let Err(e) = self.cache_window_at(window, now).await {
                warn!(window_id = window.id, error = %e, "Failed to repair window index");
            }
        }

        Ok(found)
    }

    async fn indexed_window(
        &self,
        product_id: ProductId,
        now: DateTime<Utc>,
    ) -> Option<FlashSaleWindow> {
        let window_id: WindowId = match self.store.get(&keys::product_window(product_id)).await {
            Ok(raw) => raw?.parse().ok()?,
            Err(e) => {
                warn!(product_id = product_id, error = %e, "Window index lookup failed");
                return None;
            }
        };

        let window = self.cached_window(window_id).await?;
        (window.is_active_at(now) && window.contains(product_id)).then_some(window)
    }

    async fn cached_window(&self, window_id: WindowId) -> Option<FlashSaleWindow> {
        let raw = self.store.get(&keys::window(window_id)).await.ok()??;
        serde_json::from_str(&raw).ok()
    }

    /// Read-through lookup of a single window. Ended windows are never
    /// returned from the cache.
    pub async fn get_window(&self, window_id: WindowId) -> FlashSaleResult<Option<FlashSaleWindow>> {
        let now = Utc::now();
        if let Some(window) = self.cached_window(window_id).await {
            if window.end_at > now {
                return Ok(Some(window));
            }
        }

        let window = self.windows.find_window(window_id).await?;
        if let Some(window) = &window {
            if let Err(e) = self.cache_window_at(window, now).await {
                warn!(window_id = window_id, error = %e, "Failed to cache window");
            }
        }
        Ok(window)
    }

    /// Evict a window after an administrative update or delete.
    ///
    /// Removes the window entry, its product set, the active aggregate and
    /// each reverse-index entry that still points at this window. Returns the
    /// number of index entries removed.
    pub async fn invalidate(&self, window_id: WindowId) -> FlashSaleResult<usize> {
        let products_key = keys::window_products(window_id);

        let mut product_ids: BTreeSet<ProductId> = self
            .store
            .set_members(&products_key)
            .await?
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        if let Some(window) = self.cached_window(window_id).await {
            product_ids.extend(window.product_ids);
        }

        let owner = window_id.to_string();
        let mut removed = 0;
        for product_id in product_ids {
            let key = keys::product_window(product_id);
            // A re-index by another window between this read and the delete
            // is lost until the next fallback scan repairs it.
            if self.store.get(&key).await?.as_deref() == Some(owner.as_str())
                && self.store.delete(&key).await?
            {
                removed += 1;
            }
        }

        self.store.delete(&keys::window(window_id)).await?;
        self.store.delete(&products_key).await?;
        self.store.delete(keys::ACTIVE_WINDOWS).await?;

        metrics::counter!("flashsale.window.invalidated").increment(1);
        info!(window_id = window_id, index_entries = removed, "Window invalidated");
        Ok(removed)
    }

    /// Write-through after an administrative save: drop the old projection
    /// and cache the new one.
    pub async fn refresh(&self, window: &FlashSaleWindow) -> FlashSaleResult<bool> {
        self.invalidate(window.id).await?;
        self.cache_window(window).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use flashsale_cache::InMemoryCounterStore;
    use flashsale_core::store::KeyTtl;
    use flashsale_store::InMemoryDurableStore;
    use std::time::Duration;

    fn window(id: WindowId, start: DateTime<Utc>, end: DateTime<Utc>, products: &[ProductId]) -> FlashSaleWindow {
        FlashSaleWindow {
            id,
            name: format!("window-{id}"),
            start_at: start,
            end_at: end,
            product_ids: products.iter().copied().collect(),
        }
    }

    fn setup() -> (Arc<InMemoryCounterStore>, Arc<InMemoryDurableStore>, FlashSaleWindowCache) {
        let counters = Arc::new(InMemoryCounterStore::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        let cache = FlashSaleWindowCache::new(counters.clone(), durable.clone());
        (counters, durable, cache)
    }

    #[tokio::test]
    async fn test_cache_window_writes_all_entries_with_ttl() {
        let (counters, _, cache) = setup();
        let now = Utc::now();
        let w = window(1, now - ChronoDuration::minutes(1), now + ChronoDuration::hours(1), &[10, 11]);

        assert!(cache.cache_window(&w).await.unwrap());

        for key in [keys::window(1), keys::window_products(1), keys::product_window(10)] {
            match counters.ttl(&key).await.unwrap() {
                KeyTtl::Expires(left) => assert!(left <= Duration::from_secs(3600), "{key}"),
                other => panic!("{key} has ttl {other:?}"),
            }
        }
        assert_eq!(counters.get(&keys::product_window(11)).await.unwrap().as_deref(), Some("1"));

        let mut members = counters.set_members(&keys::window_products(1)).await.unwrap();
        members.sort();
        assert_eq!(members, vec!["10".to_string(), "11".to_string()]);
    }

    #[tokio::test]
    async fn test_ended_window_is_not_cached() {
        let (counters, _, cache) = setup();
        let now = Utc::now();
        let w = window(1, now - ChronoDuration::hours(2), now - ChronoDuration::seconds(1), &[10]);

        assert!(!cache.cache_window(&w).await.unwrap());
        assert!(counters.is_empty());
    }

    #[tokio::test]
    async fn test_is_active_scenarios() {
        let (_, _, cache) = setup();
        let now = Utc::now();
        let hour = ChronoDuration::hours(1);

        assert!(cache.is_active(&window(1, now - hour, now + hour, &[])));
        assert!(!cache.is_active(&window(2, now + hour, now + hour * 2, &[])));
        assert!(!cache.is_active_at(&window(3, now, now + hour, &[]), now));
        assert!(!cache.is_active_at(&window(4, now - hour, now, &[]), now));
    }

    #[tokio::test]
    async fn test_active_windows_miss_uses_soonest_end_as_ttl() {
        let (counters, durable, cache) = setup();
        let now = Utc::now();
        durable.upsert_window(window(1, now - ChronoDuration::hours(1), now + ChronoDuration::minutes(10), &[10]));
        durable.upsert_window(window(2, now - ChronoDuration::hours(1), now + ChronoDuration::hours(5), &[20]));
        durable.upsert_window(window(3, now + ChronoDuration::hours(1), now + ChronoDuration::hours(2), &[30]));
        durable.upsert_window(window(4, now - ChronoDuration::hours(3), now - ChronoDuration::hours(1), &[40]));

        let mut ids: Vec<WindowId> = cache.get_active_windows().await.unwrap().iter().map(|w| w.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);

        match counters.ttl(keys::ACTIVE_WINDOWS).await.unwrap() {
            KeyTtl::Expires(left) => assert!(left <= Duration::from_secs(600)),
            other => panic!("aggregate ttl {other:?}"),
        }
        assert_eq!(counters.get(&keys::product_window(20)).await.unwrap().as_deref(), Some("2"));
        assert_eq!(counters.get(&keys::product_window(30)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_upcoming_window_becomes_visible_once_started() {
        let (_, durable, cache) = setup();
        let now = Utc::now();
        durable.upsert_window(window(1, now - ChronoDuration::hours(1), now + ChronoDuration::hours(1), &[10]));
        durable.upsert_window(window(2, now + ChronoDuration::milliseconds(200), now + ChronoDuration::hours(1), &[20]));

        let ids: Vec<WindowId> = cache.get_active_windows().await.unwrap().iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![1]);

        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut ids: Vec<WindowId> = cache.get_active_windows().await.unwrap().iter().map(|w| w.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_empty_active_list_is_cached_until_next_start() {
        let (counters, durable, cache) = setup();

        assert!(cache.get_active_windows().await.unwrap().is_empty());
        match counters.ttl(keys::ACTIVE_WINDOWS).await.unwrap() {
            KeyTtl::Expires(left) => assert!(left <= EMPTY_ACTIVE_TTL),
            other => panic!("empty aggregate ttl {other:?}"),
        }

        let now = Utc::now();
        durable.upsert_window(window(1, now + ChronoDuration::seconds(2), now + ChronoDuration::hours(1), &[10]));
        counters.delete(keys::ACTIVE_WINDOWS).await.unwrap();

        assert!(cache.get_active_windows().await.unwrap().is_empty());
        match counters.ttl(keys::ACTIVE_WINDOWS).await.unwrap() {
            KeyTtl::Expires(left) => assert!(left <= Duration::from_secs(2)),
            other => panic!("empty aggregate ttl {other:?}"),
        }
    }

    #[test]
    fn test_aggregate_ttl_is_capped_by_next_start() {
        let now = Utc::now();
        let windows = vec![
            window(1, now - ChronoDuration::hours(1), now + ChronoDuration::hours(2), &[10]),
            window(2, now + ChronoDuration::minutes(5), now + ChronoDuration::hours(1), &[20]),
            window(3, now - ChronoDuration::hours(3), now - ChronoDuration::hours(1), &[30]),
        ];
        assert_eq!(aggregate_ttl(&windows, now), Duration::from_secs(300));
        assert_eq!(aggregate_ttl(&windows[..1], now), Duration::from_secs(7200));
        assert_eq!(aggregate_ttl(&[], now), EMPTY_ACTIVE_TTL);
    }

    #[tokio::test]
    async fn test_cached_window_shows_up_in_active_list() {
        let (_, durable, cache) = setup();
        let now = Utc::now();
        let first = window(1, now - ChronoDuration::hours(1), now + ChronoDuration::hours(1), &[10]);
        durable.upsert_window(first.clone());
        assert_eq!(cache.get_active_windows().await.unwrap().len(), 1);

        let second = window(2, now - ChronoDuration::minutes(1), now + ChronoDuration::hours(1), &[20]);
        durable.upsert_window(second.clone());
        assert!(cache.cache_window(&second).await.unwrap());

        let mut ids: Vec<WindowId> = cache.get_active_windows().await.unwrap().iter().map(|w| w.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_active_windows_hit_drops_ended_windows() {
        let (counters, _, cache) = setup();
        let now = Utc::now();
        let stale = vec![
            window(1, now - ChronoDuration::hours(2), now - ChronoDuration::seconds(1), &[10]),
            window(2, now - ChronoDuration::hours(1), now + ChronoDuration::hours(1), &[20]),
        ];
        // Simulate an aggregate that outlived one of its members.
        counters
            .set(keys::ACTIVE_WINDOWS, &serde_json::to_string(&stale).unwrap(), None)
            .await
            .unwrap();

        let active = cache.get_active_windows().await.unwrap();
        assert_eq!(active.len(), 1);
        assert!(active.iter().all(|w| w.end_at > Utc::now()));
    }

    #[tokio::test]
    async fn test_corrupt_aggregate_is_recomputed() {
        let (counters, durable, cache) = setup();
        let now = Utc::now();
        durable.upsert_window(window(1, now - ChronoDuration::hours(1), now + ChronoDuration::hours(1), &[10]));
        counters.set(keys::ACTIVE_WINDOWS, "not json", None).await.unwrap();

        let active = cache.get_active_windows().await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_window_for_product_falls_back_and_repairs_index() {
        let (counters, durable, cache) = setup();
        let now = Utc::now();
        durable.upsert_window(window(7, now - ChronoDuration::hours(1), now + ChronoDuration::hours(1), &[10, 11]));

        let found = cache.get_window_for_product(10).await.unwrap().unwrap();
        assert_eq!(found.id, 7);

        counters.delete(&keys::product_window(11)).await.unwrap();
        let found = cache.get_window_for_product(11).await.unwrap().unwrap();
        assert_eq!(found.id, 7);
        assert_eq!(counters.get(&keys::product_window(11)).await.unwrap().as_deref(), Some("7"));

        assert!(cache.get_window_for_product(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_removes_only_owned_index_entries() {
        let (counters, durable, cache) = setup();
        let now = Utc::now();
        let first = window(1, now - ChronoDuration::hours(1), now + ChronoDuration::hours(1), &[10, 11]);
        let second = window(2, now - ChronoDuration::hours(1), now + ChronoDuration::hours(2), &[11]);
        durable.upsert_window(first.clone());
        durable.upsert_window(second.clone());

        cache.get_active_windows().await.unwrap();
        cache.cache_window(&first).await.unwrap();
        cache.cache_window(&second).await.unwrap();

        let removed = cache.invalidate(1).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(counters.get(&keys::window(1)).await.unwrap(), None);
        assert!(counters.set_members(&keys::window_products(1)).await.unwrap().is_empty());
        assert_eq!(counters.get(&keys::product_window(10)).await.unwrap(), None);
        assert_eq!(counters.get(&keys::product_window(11)).await.unwrap().as_deref(), Some("2"));
        assert_eq!(counters.get(keys::ACTIVE_WINDOWS).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refresh_replaces_product_set() {
        let (counters, durable, cache) = setup();
        let now = Utc::now();
        let mut w = window(3, now - ChronoDuration::hours(1), now + ChronoDuration::hours(1), &[10, 11]);
        durable.upsert_window(w.clone());
        cache.cache_window(&w).await.unwrap();

        w.product_ids = [12].into_iter().collect();
        durable.upsert_window(w.clone());
        assert!(cache.refresh(&w).await.unwrap());

        assert_eq!(counters.get(&keys::product_window(10)).await.unwrap(), None);
        assert_eq!(counters.get(&keys::product_window(12)).await.unwrap().as_deref(), Some("3"));
        assert_eq!(cache.get_window(3).await.unwrap().unwrap().product_ids.len(), 1);
    }
}
