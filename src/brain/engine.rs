//! Decision side: validates, scores against per-source baselines, audits.
//!
//! Deciding is split in two. `assess` authenticates the event and reaches a
//! verdict without touching baselines, pattern memory or the audit trail;
//! `commit` applies it. A caller that abandons an assessment (a timed-out
//! delivery attempt) leaves no trace beyond the consumed nonce.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::audit::{AuditRecord, AuditTrail};
use super::baseline::{AnomalyScorer, Baseline, DeviationScorer};
use super::pattern::{PatternCache, PatternCacheStats};
use crate::config::PipelineConfig;
use crate::kernel::decision::Decision;
use crate::kernel::event::{SignedEvent, TelemetryEvent};
use crate::kernel::time::{unix_now, Timestamp};
use crate::recovery::{DegradedModeState, ErrorKind, ErrorRecovery};
use crate::transport::SecurityValidator;

/// Called synchronously for every security violation, before `process` returns.
pub type SecurityObserver = Arc<dyn Fn(&SignedEvent, &Decision) + Send + Sync>;

/// Highest effective threshold degraded-mode relaxation may produce.
const MAX_RELAXED_THRESHOLD: f64 = 0.95;

/// Blocking threshold after degraded-mode relaxation. Relaxation only ever
/// raises the bar for a block; security blocks are not affected.
pub fn effective_threshold(base: f64, state: DegradedModeState) -> f64 {
    let relaxed = match state {
        DegradedModeState::Normal => return base,
        DegradedModeState::Alert => base + 0.1,
        DegradedModeState::Degraded => base + 0.2,
    };
    relaxed.min(MAX_RELAXED_THRESHOLD).max(base)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    /// Security violation, already recorded by `assess`.
    Settled,
    /// Blocked, or allowed from pattern memory.
    AuditOnly,
    /// Training-mode allow.
    Train,
    /// Scored allow.
    TrainAndRemember,
}

/// A verdict not yet applied to engine state.
#[must_use]
#[derive(Debug)]
pub struct Assessment {
    event: TelemetryEvent,
    decision: Decision,
    threshold: f64,
    at: Timestamp,
    effect: Effect,
}

impl Assessment {
    pub fn decision(&self) -> &Decision {
        &self.decision
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub events_processed: u64,
    pub security_violations: u64,
    pub decisions_allowed: u64,
    pub decisions_blocked: u64,
    pub training_allows: u64,
    pub pattern_hits: u64,
    pub scorer_failures: u64,
    pub tracked_sources: usize,
    pub threshold: f64,
    pub effective_threshold: f64,
    pub audit_records: u64,
    pub pattern_cache: Option<PatternCacheStats>,
}

pub struct DecisionEngine {
    validator: SecurityValidator,
    recovery: Arc<ErrorRecovery>,
    audit: AuditTrail,
    scorer: Box<dyn AnomalyScorer>,
    baselines: Mutex<HashMap<String, Baseline>>,
    patterns: Option<PatternCache>,
    observers: RwLock<Vec<SecurityObserver>>,
    threshold: f64,
    min_samples: u64,
    stats: Mutex<EngineStats>,
}

impl DecisionEngine {
    pub fn new(
        validator: SecurityValidator,
        recovery: Arc<ErrorRecovery>,
        audit: AuditTrail,
        threshold: f64,
        min_samples: u64,
    ) -> Self {
        Self {
            validator,
            recovery,
            audit,
            scorer: Box::new(DeviationScorer::default()),
            baselines: Mutex::new(HashMap::new()),
            patterns: None,
            observers: RwLock::new(Vec::new()),
            threshold,
            min_samples,
            stats: Mutex::new(EngineStats::default()),
        }
    }

    pub fn from_config(
        validator: SecurityValidator,
        recovery: Arc<ErrorRecovery>,
        audit: AuditTrail,
        config: &PipelineConfig,
    ) -> Self {
        let engine = Self::new(
            validator,
            recovery,
            audit,
            config.anomaly_threshold,
            config.baseline_min_samples,
        );
        if config.pattern_cache_enabled {
            engine.with_pattern_cache(PatternCache::from_config(config))
        } else {
            engine
        }
    }

    pub fn with_scorer(self, scorer: impl AnomalyScorer + 'static) -> Self {
        self.with_boxed_scorer(Box::new(scorer))
    }

    pub fn with_boxed_scorer(mut self, scorer: Box<dyn AnomalyScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Allow events resembling previously allowed ones without scoring.
    pub fn with_pattern_cache(mut self, cache: PatternCache) -> Self {
        self.patterns = Some(cache);
        self
    }

    pub fn on_security_violation(&self, observer: impl Fn(&SignedEvent, &Decision) + Send + Sync + 'static) {
        self.observers.write().push(Arc::new(observer));
    }

    pub fn validator(&self) -> &SecurityValidator {
        &self.validator
    }

    pub fn audit_trail(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn pattern_cache(&self) -> Option<&PatternCache> {
        self.patterns.as_ref()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn process(&self, signed: &SignedEvent) -> Decision {
        self.process_at(signed, unix_now())
    }

    pub fn process_at(&self, signed: &SignedEvent, now: Timestamp) -> Decision {
        self.commit(self.assess_at(signed, now))
    }

    pub fn assess(&self, signed: &SignedEvent) -> Assessment {
        self.assess_at(signed, unix_now())
    }

    pub fn assess_at(&self, signed: &SignedEvent, now: Timestamp) -> Assessment {
        self.stats.lock().events_processed += 1;
        let event = &signed.event;

        // 1. Authenticate before anything reads the event
        let validation = self.validator.verify_at(signed, now);
        if !validation.valid {
            let decision = self.security_violation(signed, &validation.reason, now);
            return Assessment {
                event: event.clone(),
                decision,
                threshold: self.threshold,
                at: now,
                effect: Effect::Settled,
            };
        }

        let state = self.recovery.state_at(now);
        let threshold = effective_threshold(self.threshold, state);
        let verdict = |decision: Decision, effect: Effect| Assessment {
            event: event.clone(),
            decision,
            threshold,
            at: now,
            effect,
        };

        // 2. Training until the source has enough allowed samples
        let baseline = self.baselines.lock().get(&event.source).cloned();
        let samples = baseline.as_ref().map_or(0, Baseline::sample_count);
        if samples < self.min_samples {
            let reason = format!("training ({}/{} samples)", samples + 1, self.min_samples);
            return verdict(Decision::allow(signed.nonce.clone(), 0.0, reason), Effect::Train);
        }

        // 3. Pattern memory fast path
        if let Some(patterns) = &self.patterns {
            if patterns.matches_at(event, now) {
                let decision = Decision::allow(signed.nonce.clone(), 0.0, "known pattern");
                return verdict(decision, Effect::AuditOnly);
            }
        }

        // 4. Score against the source baseline
        let baseline = baseline.unwrap_or_else(|| Baseline::new(event.source.clone(), now));
        let score = self.score(event, &baseline);
        if score > threshold {
            debug!(
                "Blocking '{}' seq={} (score={:.3}, state={:?})",
                event.source, event.sequence, score, state
            );
            let reason = format!("anomaly score {:.3} above threshold {:.3}", score, threshold);
            verdict(Decision::block(signed.nonce.clone(), score, reason), Effect::AuditOnly)
        } else {
            verdict(
                Decision::allow(signed.nonce.clone(), score, "within baseline"),
                Effect::TrainAndRemember,
            )
        }
    }

    /// Apply an assessment: only allowed events teach the baseline and the
    /// pattern memory; every committed decision is audited.
    pub fn commit(&self, assessment: Assessment) -> Decision {
        let Assessment {
            event,
            decision,
            threshold,
            at,
            effect,
        } = assessment;
        if effect == Effect::Settled {
            return decision;
        }

        if matches!(effect, Effect::Train | Effect::TrainAndRemember) {
            self.baselines
                .lock()
                .entry(event.source.clone())
                .or_insert_with(|| Baseline::new(event.source.clone(), at))
                .update(&event, at);
        }
        if effect == Effect::TrainAndRemember {
            if let Some(patterns) = &self.patterns {
                patterns.remember_at(&event, at);
            }
        }

        {
            let mut stats = self.stats.lock();
            if decision.is_allow() {
                stats.decisions_allowed += 1;
            } else {
                stats.decisions_blocked += 1;
            }
            match effect {
                Effect::Train => stats.training_allows += 1,
                Effect::AuditOnly if decision.is_allow() => stats.pattern_hits += 1,
                _ => {}
            }
        }

        self.audit.append(AuditRecord::new(&event, &decision, threshold, at));
        decision
    }

    /// Purge expired nonces and patterns.
    pub fn maintain(&self) {
        let nonces = self.validator.sweep();
        let patterns = self.patterns.as_ref().map_or(0, |p| p.evict_expired());
        if nonces + patterns > 0 {
            debug!("Maintenance purged {} nonces and {} patterns", nonces, patterns);
        }
    }

    pub fn baseline(&self, source: &str) -> Option<Baseline> {
        self.baselines.lock().get(source).cloned()
    }

    pub fn stats(&self) -> EngineStats {
        let mut stats = self.stats.lock().clone();
        stats.tracked_sources = self.baselines.lock().len();
        stats.threshold = self.threshold;
        stats.effective_threshold = effective_threshold(self.threshold, self.recovery.state());
        stats.audit_records = self.audit.len();
        stats.pattern_cache = self.patterns.as_ref().map(PatternCache::stats);
        stats
    }

    fn score(&self, event: &TelemetryEvent, baseline: &Baseline) -> f64 {
        match panic::catch_unwind(AssertUnwindSafe(|| self.scorer.score(event, baseline))) {
            Ok(score) if score.is_finite() => score.clamp(0.0, 1.0),
            Ok(score) => {
                self.stats.lock().scorer_failures += 1;
                warn!("Scorer returned {} for '{}'; treating as maximal", score, event.source);
                1.0
            }
            Err(_) => {
                self.stats.lock().scorer_failures += 1;
                error!("Scorer panicked for '{}'; treating as maximal", event.source);
                1.0
            }
        }
    }

    /// Recorded immediately: an attack is reported even if nobody waits
    /// for the answer.
    fn security_violation(&self, signed: &SignedEvent, reason: &str, now: Timestamp) -> Decision {
        let decision = Decision::security_block(signed.nonce.clone(), format!("security_violation: {}", reason));
        {
            let mut stats = self.stats.lock();
            stats.security_violations += 1;
            stats.decisions_blocked += 1;
        }
        self.recovery.record_at(
            ErrorKind::Security,
            &format!("{} from '{}'", reason, signed.source()),
            now,
        );

        let observers = self.observers.read().clone();
        for observer in observers {
            if panic::catch_unwind(AssertUnwindSafe(|| observer(signed, &decision))).is_err() {
                error!("Security observer panicked");
            }
        }

        self.audit
            .append(AuditRecord::new(&signed.event, &decision, self.threshold, now));
        decision
    }
}
