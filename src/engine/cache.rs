//! Bounded, time-expiring analysis cache
//!
//! Keys are `(fragment fingerprint, criteria fingerprint)`, so a criteria
//! change never observes decisions made under other criteria. Entries are
//! never returned past their TTL, and at capacity the oldest-inserted entry is
//! evicted.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::collaborators::Verdict;
use super::dataflow::DecisionSource;
use super::fingerprint::Fingerprint;
use super::matcher::CriteriaFingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub fingerprint: Fingerprint,
    pub criteria: CriteriaFingerprint,
}

impl CacheKey {
    pub fn new(fingerprint: Fingerprint, criteria: CriteriaFingerprint) -> Self {
        Self {
            fingerprint,
            criteria,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDecision {
    pub verdict: Verdict,
    pub reason: String,
    pub source: DecisionSource,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    generation: u64,
}

/// Insertion-ordered map with TTL expiry
#[derive(Debug)]
pub struct AnalysisCache<K = CacheKey, V = CachedDecision> {
    entries: HashMap<K, Entry<V>>,
    /// Insertion order; entries whose generation no longer matches are stale
    order: VecDeque<(K, u64)>,
    next_generation: u64,
    capacity: usize,
    ttl: Duration,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<K, V> AnalysisCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            next_generation: 0,
            capacity: capacity.max(1),
            ttl,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    fn is_expired(&self, inserted_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(inserted_at) > self.ttl
    }

    /// Look up `key` as of `now`; an expired entry is evicted on the way
    pub fn get_at(&mut self, key: &K, now: Instant) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) if !self.is_expired(entry.inserted_at, now) => {
                self.hits += 1;
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(key);
            self.expirations += 1;
        }
        self.misses += 1;
        None
    }

    /// Live value for `key` without touching stats or evicting
    pub fn peek_at(&self, key: &K, now: Instant) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|entry| !self.is_expired(entry.inserted_at, now))
            .map(|entry| &entry.value)
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    /// Insert or refresh `key` as of `now`
    pub fn put_at(&mut self, key: K, value: V, now: Instant) {
        self.next_generation += 1;
        let generation = self.next_generation;

        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.capacity {
                if !self.evict_oldest() {
                    break;
                }
            }
        }

        self.entries.insert(
            key.clone(),
            Entry {
                value,
                inserted_at: now,
                generation,
            },
        );
        self.order.push_back((key, generation));
        self.compact_order();
    }

    pub fn put(&mut self, key: K, value: V) {
        self.put_at(key, value, Instant::now())
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((key, generation)) = self.order.pop_front() {
            let live = self
                .entries
                .get(&key)
                .is_some_and(|entry| entry.generation == generation);
            if live {
                self.entries.remove(&key);
                self.evictions += 1;
                return true;
            }
        }
        false
    }

    fn compact_order(&mut self) {
        if self.order.len() > self.capacity * 2 {
            let entries = &self.entries;
            self.order.retain(|(key, generation)| {
                entries
                    .get(key)
                    .is_some_and(|entry| entry.generation == *generation)
            });
        }
    }

    /// Remove every expired entry; returns how many were dropped
    pub fn sweep_at(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.inserted_at) <= ttl);
        let removed = before - self.entries.len();
        self.expirations += removed as u64;

        let entries = &self.entries;
        self.order.retain(|(key, generation)| {
            entries
                .get(key)
                .is_some_and(|entry| entry.generation == *generation)
        });
        removed
    }

    pub fn sweep(&mut self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expirations: self.expirations,
        }
    }
}
