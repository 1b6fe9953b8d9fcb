//! In-process counter store backed by DashMap.
//! Stands in for Redis in tests and single-node development runs. Every
//! operation works on one map entry under its shard lock, so the conditional
//! operations are atomic per key exactly like their Redis scripts.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use flashsale_core::store::{parse_counter, CounterStore, DecrementOutcome, KeyTtl};
use flashsale_core::{StoreError, StoreResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(BTreeSet<String>),
    Sorted(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Lock-free in-memory counter store with per-key expiry.
#[derive(Clone, Default)]
pub struct InMemoryCounterStore {
    store: Arc<DashMap<String, Entry>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired entries. Expired keys are already invisible to reads;
    /// this only reclaims memory.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.store.len();
        self.store.retain(|_, entry| !entry.is_expired(now));
        before - self.store.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn live_text(&self, key: &str) -> StoreResult<Option<String>> {
        let Some(entry) = self.store.get(key) else {
            return Ok(None);
        };
        if entry.is_expired(Instant::now()) {
            drop(entry);
            self.store.remove_if(key, |_, e| e.is_expired(Instant::now()));
            return Ok(None);
        }
        match &entry.value {
            Value::Text(text) => Ok(Some(text.clone())),
            _ => Err(wrong_type(key)),
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

/// Occupied entries that have expired are treated as vacant.
fn live_mut<'a>(
    entry: &'a mut MapEntry<'_, String, Entry>,
) -> Option<&'a mut Entry> {
    match entry {
        MapEntry::Occupied(occupied) if !occupied.get().is_expired(Instant::now()) => {
            Some(occupied.get_mut())
        }
        _ => None,
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.live_text(key)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.store
            .insert(key.to_string(), Entry::new(Value::Text(value.to_string()), ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut entry = self.store.entry(key.to_string());
        if live_mut(&mut entry).is_some() {
            return Ok(false);
        }
        entry.insert(Entry::new(Value::Text(value.to_string()), ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        Ok(self
            .store
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        let now = Instant::now();
        let Some(entry) = self.store.get(key) else {
            return Ok(KeyTtl::Missing);
        };
        Ok(match entry.expires_at {
            None => KeyTtl::Persistent,
            Some(at) if at <= now => KeyTtl::Missing,
            Some(at) => KeyTtl::Expires(at - now),
        })
    }

    async fn increment_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut entry = self.store.entry(key.to_string());
        if let Some(live) = live_mut(&mut entry) {
            let Value::Text(text) = &mut live.value else {
                return Err(wrong_type(key));
            };
            let next = parse_counter(key, text)? + delta;
            *text = next.to_string();
            return Ok(next);
        }
        entry.insert(Entry::new(Value::Text(delta.to_string()), None));
        Ok(delta)
    }

    async fn compare_and_set(&self, key: &str, expected: &str, new: &str) -> StoreResult<bool> {
        let mut entry = self.store.entry(key.to_string());
        let Some(live) = live_mut(&mut entry) else {
            return Ok(false);
        };
        let Value::Text(text) = &mut live.value else {
            return Err(wrong_type(key));
        };
        if text != expected {
            return Ok(false);
        }
        *text = new.to_string();
        Ok(true)
    }

    async fn decrement_if_sufficient(
        &self,
        key: &str,
        quantity: i64,
    ) -> StoreResult<DecrementOutcome> {
        let mut entry = self.store.entry(key.to_string());
        let Some(live) = live_mut(&mut entry) else {
            return Ok(DecrementOutcome::Missing);
        };
        let Value::Text(text) = &mut live.value else {
            return Err(wrong_type(key));
        };
        let available = parse_counter(key, text)?;
        if available < quantity {
            return Ok(DecrementOutcome::Insufficient { available });
        }
        let remaining = available - quantity;
        *text = remaining.to_string();
        Ok(DecrementOutcome::Committed { remaining })
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .store
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn replace_set(
        &self,
        key: &str,
        members: &[String],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        if members.is_empty() {
            self.store.remove(key);
            return Ok(());
        }
        let set = members.iter().cloned().collect();
        self.store
            .insert(key.to_string(), Entry::new(Value::Set(set), ttl));
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let Some(entry) = self.store.get(key) else {
            return Ok(Vec::new());
        };
        if entry.is_expired(now) {
            return Ok(Vec::new());
        }
        match &entry.value {
            Value::Set(members) => Ok(members.iter().cloned().collect()),
            _ => Err(wrong_type(key)),
        }
    }

    async fn increment_score(&self, key: &str, member: &str, delta: f64) -> StoreResult<f64> {
        let mut entry = self.store.entry(key.to_string());
        if let Some(live) = live_mut(&mut entry) {
            let Value::Sorted(scores) = &mut live.value else {
                return Err(wrong_type(key));
            };
            let score = scores.entry(member.to_string()).or_insert(0.0);
            *score += delta;
            return Ok(*score);
        }
        let scores = HashMap::from([(member.to_string(), delta)]);
        entry.insert(Entry::new(Value::Sorted(scores), None));
        Ok(delta)
    }

    async fn top_scores(&self, key: &str, limit: usize) -> StoreResult<Vec<(String, f64)>> {
        let now = Instant::now();
        let Some(entry) = self.store.get(key) else {
            return Ok(Vec::new());
        };
        if entry.is_expired(now) {
            return Ok(Vec::new());
        }
        let Value::Sorted(scores) = &entry.value else {
            return Err(wrong_type(key));
        };
        let mut ranked: Vec<(String, f64)> =
            scores.iter().map(|(m, s)| (m.clone(), *s)).collect();
        // Redis orders equal scores by member, descending for ZREVRANGE.
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        ranked.truncate(limit);
        Ok(ranked)
    }

    async fn remove_score(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut entry = self.store.entry(key.to_string());
        let Some(live) = live_mut(&mut entry) else {
            return Ok(false);
        };
        let Value::Sorted(scores) = &mut live.value else {
            return Err(wrong_type(key));
        };
        Ok(scores.remove(member).is_some())
    }

    async fn trim_scores(&self, key: &str, keep: usize) -> StoreResult<usize> {
        let mut entry = self.store.entry(key.to_string());
        let Some(live) = live_mut(&mut entry) else {
            return Ok(0);
        };
        let Value::Sorted(scores) = &mut live.value else {
            return Err(wrong_type(key));
        };
        if scores.len() <= keep {
            return Ok(0);
        }
        let mut ranked: Vec<(String, f64)> =
            scores.iter().map(|(m, s)| (m.clone(), *s)).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        let removed = ranked.len() - keep;
        for (member, _) in ranked.into_iter().skip(keep) {
            scores.remove(&member);
        }
        Ok(removed)
    }
}
