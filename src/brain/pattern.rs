//! Pattern memory: a TTL + LRU cache of fingerprints taken from allowed
//! events. An event close enough to a remembered fingerprint is allowed
//! without scoring.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::config::PipelineConfig;
use crate::kernel::event::{Outcome, TelemetryEvent};
use crate::kernel::time::{unix_now, Timestamp};

/// Share of the similarity carried by the lookup key (source and outcome).
const KEY_WEIGHT: f64 = 0.5;
const DURATION_WEIGHT: f64 = 0.3;
const ARGS_WEIGHT: f64 = 0.2;
/// Half-width of the remembered duration band.
const DURATION_BAND: f64 = 0.1;
/// Extra slack, for half credit, around the band.
const DURATION_SLACK: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PatternKey {
    source: String,
    outcome: String,
}

impl PatternKey {
    fn of(event: &TelemetryEvent) -> Self {
        let outcome = match &event.outcome {
            Outcome::Exception(ty) => format!("exception:{}", ty),
            other => other.tag().to_string(),
        };
        Self {
            source: event.source.clone(),
            outcome,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternFingerprint {
    pub duration_min: f64,
    pub duration_max: f64,
    pub args_summary: String,
    pub stored_at: Timestamp,
    pub hits: u64,
    recency: u64,
}

impl PatternFingerprint {
    fn from_event(event: &TelemetryEvent, now: Timestamp, recency: u64) -> Self {
        Self {
            duration_min: event.duration_ms * (1.0 - DURATION_BAND),
            duration_max: event.duration_ms * (1.0 + DURATION_BAND),
            args_summary: event.args_summary.clone(),
            stored_at: now,
            hits: 0,
            recency,
        }
    }

    /// Weighted similarity in [0, 1] for an event that already shares the key.
    pub fn similarity(&self, event: &TelemetryEvent) -> f64 {
        let mut score = KEY_WEIGHT;

        let d = event.duration_ms;
        if self.duration_min <= d && d <= self.duration_max {
            score += DURATION_WEIGHT;
        } else if self.duration_min * (1.0 - DURATION_SLACK) <= d && d <= self.duration_max * (1.0 + DURATION_SLACK) {
            score += DURATION_WEIGHT / 2.0;
        }

        if event.args_summary == self.args_summary {
            score += ARGS_WEIGHT;
        } else if event.args_summary.len() == self.args_summary.len() {
            score += ARGS_WEIGHT / 2.0;
        }
        score
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PatternCacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<PatternKey, PatternFingerprint>,
    /// recency tick -> key, oldest first
    lru: BTreeMap<u64, PatternKey>,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheState {
    fn touch(&mut self, key: &PatternKey) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(key) {
            self.lru.remove(&entry.recency);
            entry.recency = tick;
            self.lru.insert(tick, key.clone());
        }
    }

    fn remove(&mut self, key: &PatternKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.lru.remove(&entry.recency);
        }
    }
}

pub struct PatternCache {
    ttl_s: f64,
    capacity: usize,
    threshold: f64,
    state: Mutex<CacheState>,
}

impl PatternCache {
    pub fn new(ttl_s: u64, capacity: usize, threshold: f64) -> Self {
        Self {
            ttl_s: ttl_s as f64,
            capacity: capacity.max(1),
            threshold,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.pattern_cache_ttl_s,
            config.pattern_cache_capacity,
            config.pattern_match_threshold,
        )
    }

    pub fn matches(&self, event: &TelemetryEvent) -> bool {
        self.matches_at(event, unix_now())
    }

    /// True if a live fingerprint for the event's source and outcome is
    /// similar enough. Expired fingerprints are dropped on the way.
    pub fn matches_at(&self, event: &TelemetryEvent, now: Timestamp) -> bool {
        let key = PatternKey::of(event);
        let mut state = self.state.lock();

        let verdict = match state.entries.get(&key) {
            None => None,
            Some(entry) if now - entry.stored_at > self.ttl_s => Some(false),
            Some(entry) => Some(entry.similarity(event) >= self.threshold),
        };
        match verdict {
            Some(true) => {
                state.hits += 1;
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.hits += 1;
                }
                state.touch(&key);
                true
            }
            Some(false) => {
                if state.entries.get(&key).map_or(false, |e| now - e.stored_at > self.ttl_s) {
                    state.remove(&key);
                    state.expirations += 1;
                }
                state.misses += 1;
                false
            }
            None => {
                state.misses += 1;
                false
            }
        }
    }

    pub fn remember(&self, event: &TelemetryEvent) {
        self.remember_at(event, unix_now())
    }

    /// Record an allowed event. A known pattern only has its lifetime
    /// refreshed; its duration band stays as first learned.
    pub fn remember_at(&self, event: &TelemetryEvent, now: Timestamp) {
        let key = PatternKey::of(event);
        let mut state = self.state.lock();

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.stored_at = now;
            state.touch(&key);
            return;
        }

        if state.entries.len() >= self.capacity {
            if let Some((_, oldest)) = state.lru.pop_first() {
                state.entries.remove(&oldest);
                state.evictions += 1;
            }
        }
        state.tick += 1;
        let tick = state.tick;
        state.entries.insert(key.clone(), PatternFingerprint::from_event(event, now, tick));
        state.lru.insert(tick, key);
    }

    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(unix_now())
    }

    pub fn evict_expired_at(&self, now: Timestamp) -> usize {
        let mut state = self.state.lock();
        let expired: Vec<PatternKey> = state
            .entries
            .iter()
            .filter(|(_, e)| now - e.stored_at > self.ttl_s)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        state.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.lru.clear();
    }

    pub fn stats(&self) -> PatternCacheStats {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        PatternCacheStats {
            size: state.entries.len(),
            capacity: self.capacity,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups > 0 {
                state.hits as f64 / lookups as f64
            } else {
                0.0
            },
            evictions: state.evictions,
            expirations: state.expirations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(source: &str, duration_ms: f64, args: &str) -> TelemetryEvent {
        TelemetryEvent::new(source, 0.0, duration_ms, Outcome::Success, args, 0)
    }

    #[test]
    fn similarity_weights() {
        let fp = PatternFingerprint::from_event(&event("svc", 100.0, "id=<num>"), 0.0, 0);
        assert!((fp.similarity(&event("svc", 105.0, "id=<num>")) - 1.0).abs() < 1e-9);
        // Within the slack band, same args: 0.5 + 0.15 + 0.2
        assert!((fp.similarity(&event("svc", 125.0, "id=<num>")) - 0.85).abs() < 1e-9);
        // In band, different args of equal length: 0.5 + 0.3 + 0.1
        assert!((fp.similarity(&event("svc", 100.0, "ix=<num>")) - 0.9).abs() < 1e-9);
        assert!((fp.similarity(&event("svc", 400.0, "id=<num>")) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn least_recently_used_is_evicted_first() {
        let cache = PatternCache::new(60, 2, 0.85);
        cache.remember_at(&event("a", 10.0, ""), 0.0);
        cache.remember_at(&event("b", 10.0, ""), 0.0);
        assert!(cache.matches_at(&event("a", 10.0, ""), 1.0));
        cache.remember_at(&event("c", 10.0, ""), 2.0);

        assert!(cache.matches_at(&event("a", 10.0, ""), 3.0));
        assert!(!cache.matches_at(&event("b", 10.0, ""), 3.0));
        assert!(cache.matches_at(&event("c", 10.0, ""), 3.0));
        assert_eq!(cache.stats().evictions, 1);
    }
}
