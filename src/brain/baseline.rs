use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::kernel::event::TelemetryEvent;
use crate::kernel::time::Timestamp;

/// Welford running mean/variance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStat {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStat {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }

    /// Absolute deviation in standard deviations, with `floor` as the
    /// smallest spread considered (constant series would otherwise divide by 0).
    pub fn deviation(&self, x: f64, floor: f64) -> f64 {
        let spread = self.std_dev().max(floor).max(f64::EPSILON);
        (x - self.mean).abs() / spread
    }
}

/// Per-source profile of normal behaviour. Owned and mutated only by the
/// decision engine, and only with events it allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub source: String,
    pub duration_ms: RunningStat,
    pub args_len: RunningStat,
    pub outcomes: HashMap<String, u64>,
    pub version: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Baseline {
    pub fn new(source: impl Into<String>, now: Timestamp) -> Self {
        Self {
            source: source.into(),
            duration_ms: RunningStat::default(),
            args_len: RunningStat::default(),
            outcomes: HashMap::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn sample_count(&self) -> u64 {
        self.duration_ms.count()
    }

    pub fn is_sufficient(&self, min_samples: u64) -> bool {
        self.sample_count() >= min_samples
    }

    pub fn update(&mut self, event: &TelemetryEvent, now: Timestamp) {
        self.duration_ms.push(event.duration_ms);
        self.args_len.push(event.args_summary.chars().count() as f64);
        *self.outcomes.entry(event.outcome.tag().to_string()).or_insert(0) += 1;
        self.version += 1;
        self.updated_at = now;
    }

    /// Share of samples with this outcome tag, 0.0 for an empty baseline.
    pub fn outcome_frequency(&self, tag: &str) -> f64 {
        let total = self.sample_count();
        if total == 0 {
            return 0.0;
        }
        self.outcomes.get(tag).copied().unwrap_or(0) as f64 / total as f64
    }
}

/// Scoring strategy injected into the decision engine. Higher = more anomalous;
/// the engine expects scores in [0, 1].
pub trait AnomalyScorer: Send + Sync {
    fn score(&self, event: &TelemetryEvent, baseline: &Baseline) -> f64;
}

impl<F> AnomalyScorer for F
where
    F: Fn(&TelemetryEvent, &Baseline) -> f64 + Send + Sync,
{
    fn score(&self, event: &TelemetryEvent, baseline: &Baseline) -> f64 {
        self(event, baseline)
    }
}

/// Default scorer: noisy-OR over per-feature deviations, so a single
/// saturated feature is enough to reach 1.0.
///
/// * duration: standard deviations from the mean, saturating at `z_cap`
/// * args: same for the redacted argument summary length, scaled by `args_weight`
/// * outcome: how rare this outcome class has been for the source, scaled by
///   `outcome_weight`
///
/// `score = 1 - (1 - dur) * (1 - args_weight * args) * (1 - outcome_weight * rarity)`.
/// Deterministic and monotonic in each deviation.
#[derive(Debug, Clone)]
pub struct DeviationScorer {
    pub z_cap: f64,
    pub args_weight: f64,
    pub outcome_weight: f64,
}

impl Default for DeviationScorer {
    fn default() -> Self {
        Self {
            z_cap: 5.0,
            args_weight: 0.5,
            outcome_weight: 0.6,
        }
    }
}

impl AnomalyScorer for DeviationScorer {
    fn score(&self, event: &TelemetryEvent, baseline: &Baseline) -> f64 {
        let duration_floor = (baseline.duration_ms.mean().abs() * 0.05).max(0.5);
        let duration = (baseline.duration_ms.deviation(event.duration_ms, duration_floor) / self.z_cap).min(1.0);
        let args = (baseline
            .args_len
            .deviation(event.args_summary.chars().count() as f64, 1.0)
            / self.z_cap)
            .min(1.0);
        let rarity = 1.0 - baseline.outcome_frequency(event.outcome.tag());

        let normal = (1.0 - duration) * (1.0 - self.args_weight * args) * (1.0 - self.outcome_weight * rarity);
        (1.0 - normal).clamp(0.0, 1.0)
    }
}
