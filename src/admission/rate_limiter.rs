use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::kernel::time::{unix_now, Timestamp};

/// Above this many tracked sources, idle per-source windows are dropped.
const SOURCE_PRUNE_THRESHOLD: usize = 4_096;

/// Ring of fixed sub-interval counters.
///
/// The ring holds `buckets + 1` slots: any rolling window of length
/// `buckets * bucket_len` overlaps at most that many slots, so the sum over the
/// ring is never smaller than the true count of that rolling window. Checking
/// the sum against the limit therefore never over-admits.
#[derive(Debug, Clone)]
struct BucketWindow {
    slots: Vec<u32>,
    head: u64,
    total: u32,
}

impl BucketWindow {
    fn new(buckets: usize) -> Self {
        Self {
            slots: vec![0; buckets + 1],
            head: 0,
            total: 0,
        }
    }

    /// Rotate forward so `index` is the current slot. At most `slots.len()`
    /// iterations, independent of how many events were recorded.
    fn advance(&mut self, index: u64) {
        if index <= self.head {
            // Same slot, or a clock step backwards: keep counting into head.
            return;
        }
        let len = self.slots.len() as u64;
        let steps = index - self.head;
        if steps >= len {
            self.slots.iter_mut().for_each(|s| *s = 0);
            self.total = 0;
        } else {
            for step in 1..=steps {
                let pos = ((self.head + step) % len) as usize;
                self.total -= self.slots[pos];
                self.slots[pos] = 0;
            }
        }
        self.head = index;
    }

    fn record(&mut self) {
        let pos = (self.head % self.slots.len() as u64) as usize;
        self.slots[pos] += 1;
        self.total += 1;
    }

    fn count(&self) -> u32 {
        self.total
    }
}

#[derive(Debug)]
struct LimiterState {
    global: BucketWindow,
    sources: HashMap<String, BucketWindow>,
    /// Source -> time of its last rejection.
    throttled: HashMap<String, Timestamp>,
    /// Bucket index of the last housekeeping pass.
    swept: u64,
    total_checks: u64,
    total_allowed: u64,
    total_throttled: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimiterStats {
    pub total_checks: u64,
    pub total_allowed: u64,
    pub total_throttled: u64,
    pub current_global_count: u32,
    pub global_limit: u32,
    pub per_source_limit: u32,
    pub throttled_sources: Vec<String>,
    pub throttling_active: bool,
    pub allow_rate: f64,
}

/// Sliding-window admission control, global and per source.
pub struct RateLimiter {
    global_limit: u32,
    per_source_limit: u32,
    bucket_len_s: f64,
    buckets: usize,
    window_s: f64,
    throttle_threshold: f64,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// `global_rate` and `per_source_rate` are events per second; the limit per
    /// window is scaled by the window length.
    pub fn new(global_rate: u32, per_source_rate: u32, window_ms: u64, buckets: u32) -> Self {
        let window_s = window_ms.max(1) as f64 / 1000.0;
        let buckets = buckets.max(1) as usize;
        let scale = |rate: u32| ((rate as f64) * window_s).floor().max(1.0) as u32;
        Self {
            global_limit: scale(global_rate),
            per_source_limit: scale(per_source_rate),
            bucket_len_s: window_s / buckets as f64,
            buckets,
            window_s,
            throttle_threshold: 0.8,
            state: Mutex::new(LimiterState {
                global: BucketWindow::new(buckets),
                sources: HashMap::new(),
                throttled: HashMap::new(),
                swept: 0,
                total_checks: 0,
                total_allowed: 0,
                total_throttled: 0,
            }),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut limiter = Self::new(
            config.global_rate_limit,
            config.per_function_rate_limit,
            config.rate_window_ms,
            config.rate_buckets,
        );
        limiter.throttle_threshold = config.throttle_threshold;
        limiter
    }

    pub fn admit(&self, source: &str) -> bool {
        self.admit_at(source, unix_now())
    }

    /// Admit only if both the global and the per-source window are under their
    /// limits; admission increments both.
    pub fn admit_at(&self, source: &str, now: Timestamp) -> bool {
        let index = self.bucket_index(now);
        let mut state = self.state.lock();
        state.total_checks += 1;

        state.global.advance(index);
        if index > state.swept {
            state.swept = index;
            self.housekeep(&mut state, index, now);
        }

        let global_full = state.global.count() >= self.global_limit;
        let buckets = self.buckets;
        let source_window = state
            .sources
            .entry(source.to_string())
            .or_insert_with(|| BucketWindow::new(buckets));
        source_window.advance(index);
        let source_full = source_window.count() >= self.per_source_limit;

        if global_full || source_full {
            state.total_throttled += 1;
            let first_in_window = state
                .throttled
                .insert(source.to_string(), now)
                .map_or(true, |last| now - last > self.window_s);
            if first_in_window {
                warn!(
                    "Rate limit hit for '{}' (global_full={}, source_full={})",
                    source, global_full, source_full
                );
            }
            return false;
        }

        if let Some(window) = state.sources.get_mut(source) {
            window.record();
        }
        state.global.record();
        state.total_allowed += 1;
        true
    }

    /// True once global utilisation reaches the throttle threshold.
    pub fn should_throttle(&self) -> bool {
        self.global_utilization_at(unix_now()) >= self.throttle_threshold
    }

    pub fn global_utilization_at(&self, now: Timestamp) -> f64 {
        let index = self.bucket_index(now);
        let mut state = self.state.lock();
        state.global.advance(index);
        state.global.count() as f64 / self.global_limit as f64
    }

    /// Producer-side sampling hint derived from global load.
    pub fn adjusted_sampling_rate(&self, base_rate: f64) -> f64 {
        self.adjusted_sampling_rate_at(base_rate, unix_now())
    }

    pub fn adjusted_sampling_rate_at(&self, base_rate: f64, now: Timestamp) -> f64 {
        let utilization = self.global_utilization_at(now);
        if utilization < self.throttle_threshold {
            base_rate
        } else if utilization >= 1.0 {
            base_rate * 0.1
        } else if utilization >= 0.9 {
            base_rate * 0.5
        } else {
            base_rate * 0.75
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        self.stats_at(unix_now())
    }

    pub fn stats_at(&self, now: Timestamp) -> RateLimiterStats {
        let index = self.bucket_index(now);
        let mut state = self.state.lock();
        state.global.advance(index);
        let window_s = self.window_s;
        state.throttled.retain(|_, last| now - *last <= window_s);

        let mut throttled_sources: Vec<String> = state.throttled.keys().cloned().collect();
        throttled_sources.sort();

        RateLimiterStats {
            total_checks: state.total_checks,
            total_allowed: state.total_allowed,
            total_throttled: state.total_throttled,
            current_global_count: state.global.count(),
            global_limit: self.global_limit,
            per_source_limit: self.per_source_limit,
            throttling_active: !throttled_sources.is_empty(),
            throttled_sources,
            allow_rate: if state.total_checks > 0 {
                state.total_allowed as f64 / state.total_checks as f64
            } else {
                1.0
            },
        }
    }

    /// Once per bucket: forget stale throttle marks and, past the threshold,
    /// idle source windows.
    fn housekeep(&self, state: &mut LimiterState, index: u64, now: Timestamp) {
        let window_s = self.window_s;
        state.throttled.retain(|_, last| now - *last <= window_s);
        if state.sources.len() > SOURCE_PRUNE_THRESHOLD {
            let before = state.sources.len();
            state.sources.retain(|_, w| {
                w.advance(index);
                w.count() > 0
            });
            debug!("Pruned {} idle rate windows", before - state.sources.len());
        }
    }

    fn bucket_index(&self, now: Timestamp) -> u64 {
        (now.max(0.0) / self.bucket_len_s).floor() as u64
    }
}
