use pic::brain::engine::effective_threshold;
use pic::brain::{AuditSink, AuditTrail, Baseline, ChainBreak, DecisionEngine, MemoryAuditSink, PatternCache};
use pic::kernel::decision::DecisionOrigin;
use pic::recovery::{DegradedModeState, ErrorKind, ErrorRecovery};
use pic::transport::{KeyProvider, KeyRing, SecureTransport, SecurityValidator};
use pic::{Outcome, SignedEvent, TelemetryEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const NOW: f64 = 1_700_000_000.0;

struct Harness {
    engine: DecisionEngine,
    signer: SecureTransport,
    recovery: Arc<ErrorRecovery>,
    audit: Arc<MemoryAuditSink>,
}

fn harness(min_samples: u64) -> Harness {
    let keys: Arc<dyn KeyProvider> = Arc::new(KeyRing::generate(300));
    let recovery = Arc::new(ErrorRecovery::new(10, 50, 60, 60));
    let audit = Arc::new(MemoryAuditSink::new());
    let sink: Arc<dyn AuditSink> = audit.clone();
    let validator = SecurityValidator::new(Arc::clone(&keys), 300, 100_000);
    let trail = AuditTrail::new(sink, keys.as_ref());
    let engine = DecisionEngine::new(validator, Arc::clone(&recovery), trail, 0.7, min_samples);
    Harness {
        engine,
        signer: SecureTransport::new(keys),
        recovery,
        audit,
    }
}

impl Harness {
    fn sign(&self, source: &str, duration_ms: f64, outcome: Outcome, seq: u64) -> SignedEvent {
        let event = TelemetryEvent::new(source, NOW, duration_ms, outcome, "order=<num>", seq);
        self.signer.sign_at(event, NOW).unwrap()
    }

    /// 30 calls around 10ms, all successful.
    fn train(&self, source: &str) {
        for i in 0..30 {
            let signed = self.sign(source, 10.0 + (i % 3) as f64, Outcome::Success, i);
            assert!(self.engine.process_at(&signed, NOW).is_allow());
        }
    }
}

#[test]
fn test_training_mode_allows_until_min_samples() {
    let h = harness(20);
    for i in 0..20 {
        // Wildly varying durations: nothing is anomalous without a baseline.
        let signed = h.sign("checkout", (i * 50) as f64, Outcome::Success, i);
        let decision = h.engine.process_at(&signed, NOW);
        assert!(decision.is_allow());
        assert_eq!(decision.score, 0.0);
        assert!(decision.reason.starts_with("training"));
    }
    assert_eq!(h.engine.baseline("checkout").unwrap().sample_count(), 20);
    assert_eq!(h.engine.stats().training_allows, 20);
}

#[test]
fn test_normal_call_allowed_anomaly_blocked() {
    let h = harness(20);
    h.train("checkout");

    let normal = h.engine.process_at(&h.sign("checkout", 11.0, Outcome::Success, 100), NOW);
    assert!(normal.is_allow(), "score {}", normal.score);
    assert!(normal.score < 0.7);

    let slow = h.engine.process_at(&h.sign("checkout", 400.0, Outcome::Success, 101), NOW);
    assert!(slow.is_block());
    assert!(slow.score > 0.7);
    assert_eq!(slow.origin, DecisionOrigin::Detection);
}

#[test]
fn test_blocked_events_do_not_teach_baseline() {
    let h = harness(20);
    h.train("checkout");
    let before = h.engine.baseline("checkout").unwrap();

    for i in 0..10 {
        let d = h.engine.process_at(&h.sign("checkout", 400.0, Outcome::Success, 200 + i), NOW);
        assert!(d.is_block(), "Repeated anomalies stay anomalous");
    }
    assert_eq!(h.engine.baseline("checkout").unwrap(), before);
}

#[test]
fn test_baselines_are_per_source() {
    let h = harness(20);
    h.train("checkout");
    let other = h.engine.process_at(&h.sign("search", 400.0, Outcome::Success, 1), NOW);
    assert!(other.is_allow());
    assert!(other.reason.starts_with("training"));
}

#[test]
fn test_security_violation_blocks_and_notifies() {
    let h = harness(20);
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    h.engine.on_security_violation(move |_signed, decision| {
        assert_eq!(decision.score, 1.0);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut forged = h.sign("checkout", 10.0, Outcome::Success, 1);
    forged.event.duration_ms = 1.0;
    let decision = h.engine.process_at(&forged, NOW);

    assert!(decision.is_block());
    assert_eq!(decision.origin, DecisionOrigin::Security);
    assert_eq!(decision.reason, "security_violation: invalid_signature");
    assert_eq!(seen.load(Ordering::SeqCst), 1, "Observer ran before process returned");
    assert_eq!(h.recovery.stats_at(NOW).security_errors, 1);
    assert!(h.engine.baseline("checkout").is_none(), "Rejected events never reach scoring");

    let stats = h.engine.stats();
    assert_eq!(stats.security_violations, 1);
    assert_eq!(stats.decisions_blocked, 1);
}

#[test]
fn test_replay_through_engine() {
    let h = harness(20);
    let signed = h.sign("checkout", 10.0, Outcome::Success, 1);
    assert!(h.engine.process_at(&signed, NOW).is_allow());
    let replay = h.engine.process_at(&signed, NOW + 5.0);
    assert!(replay.is_block());
    assert_eq!(replay.reason, "security_violation: replay_attack");
}

#[test]
fn test_every_decision_is_audited() {
    let h = harness(2);
    for i in 0..3 {
        h.engine.process_at(&h.sign("checkout", 10.0, Outcome::Success, i), NOW);
    }
    let mut forged = h.sign("checkout", 10.0, Outcome::Success, 9);
    forged.event.sequence = 10;
    h.engine.process_at(&forged, NOW);

    let records = h.audit.snapshot();
    assert_eq!(records.len(), 4);
    assert_eq!(records[3].origin, DecisionOrigin::Security);
    assert_eq!(records[3].sequence, 10);
    assert!(records.iter().all(|r| !r.reason.contains("order=")), "Audit carries no argument text");
}

#[test]
fn test_effective_threshold_relaxes_with_state() {
    assert_eq!(effective_threshold(0.7, DegradedModeState::Normal), 0.7);
    assert!((effective_threshold(0.7, DegradedModeState::Alert) - 0.8).abs() < 1e-9);
    assert!((effective_threshold(0.7, DegradedModeState::Degraded) - 0.9).abs() < 1e-9);
    assert_eq!(effective_threshold(0.9, DegradedModeState::Degraded), 0.95);
    assert_eq!(effective_threshold(0.99, DegradedModeState::Degraded), 0.99, "Never lowered");
}

#[test]
fn test_degraded_mode_biases_toward_allow() {
    let h = harness(0);
    let engine = h.engine.with_scorer(|_: &TelemetryEvent, _: &Baseline| 0.8);
    let signer = h.signer;

    let sign = |seq: u64| {
        let event = TelemetryEvent::new("checkout", NOW, 10.0, Outcome::Success, "", seq);
        signer.sign_at(event, NOW).unwrap()
    };

    // Normal: 0.8 > 0.7 blocks
    assert!(engine.process_at(&sign(1), NOW).is_block());

    for _ in 0..50 {
        h.recovery.record_at(ErrorKind::Communication, "timeout", NOW);
    }
    assert_eq!(h.recovery.state_at(NOW), DegradedModeState::Degraded);

    // Degraded: threshold 0.9, same score now allowed
    assert!(engine.process_at(&sign(2), NOW).is_allow());

    // Security checks are not relaxed
    let mut forged = sign(3);
    forged.signature = "00".repeat(32);
    assert!(engine.process_at(&forged, NOW).is_block());
}

#[test]
fn test_misbehaving_scorer_blocks() {
    let h = harness(0);
    let engine = h.engine.with_scorer(|_: &TelemetryEvent, _: &Baseline| f64::NAN);
    let event = TelemetryEvent::new("checkout", NOW, 10.0, Outcome::Success, "", 1);
    let decision = engine.process_at(&h.signer.sign_at(event, NOW).unwrap(), NOW);
    assert!(decision.is_block());
    assert_eq!(decision.score, 1.0);
    assert_eq!(engine.stats().scorer_failures, 1);
}

#[test]
fn test_assessment_without_commit_leaves_no_trace() {
    let h = harness(2);
    let signed = h.sign("checkout", 10.0, Outcome::Success, 1);

    let assessment = h.engine.assess_at(&signed, NOW);
    assert!(assessment.decision().is_allow());
    drop(assessment);

    assert!(h.engine.baseline("checkout").is_none());
    assert!(h.audit.is_empty());
    let stats = h.engine.stats();
    assert_eq!(stats.events_processed, 1);
    assert_eq!(stats.decisions_allowed, 0);

    // The nonce is spent all the same.
    let replay = h.engine.process_at(&signed, NOW);
    assert_eq!(replay.reason, "security_violation: replay_attack");
}

#[test]
fn test_pattern_memory_short_circuits_known_events() {
    let h = harness(20);
    let engine = h.engine.with_pattern_cache(PatternCache::new(1_800, 100, 0.85));
    let signer = h.signer;
    let sign = |duration_ms: f64, seq: u64| {
        let event = TelemetryEvent::new("checkout", NOW, duration_ms, Outcome::Success, "order=<num>", seq);
        signer.sign_at(event, NOW).unwrap()
    };

    for i in 0..20 {
        assert!(engine.process_at(&sign(10.0 + (i % 3) as f64, i), NOW).is_allow());
    }
    let cache = engine.pattern_cache().unwrap();
    assert!(cache.is_empty(), "Training allows are not remembered");

    let scored = engine.process_at(&sign(11.0, 20), NOW);
    assert_eq!(scored.reason, "within baseline");
    assert_eq!(cache.len(), 1);
    let samples = engine.baseline("checkout").unwrap().sample_count();

    let cached = engine.process_at(&sign(11.5, 21), NOW);
    assert!(cached.is_allow());
    assert_eq!(cached.reason, "known pattern");
    assert_eq!(engine.baseline("checkout").unwrap().sample_count(), samples);

    // Far outside the remembered band: scored, and blocked.
    let slow = engine.process_at(&sign(400.0, 22), NOW);
    assert!(slow.is_block());
    assert_eq!(cache.len(), 1, "Blocked events are never remembered");

    let stats = engine.stats();
    assert_eq!(stats.pattern_hits, 1);
    assert_eq!(stats.pattern_cache.unwrap().hits, 1);
}

#[test]
fn test_audit_trail_is_tamper_evident() {
    let h = harness(2);
    for i in 0..4 {
        h.engine.process_at(&h.sign("checkout", 10.0, Outcome::Success, i), NOW);
    }
    let records = h.audit.snapshot();
    let trail = h.engine.audit_trail();
    assert_eq!(trail.verify(&records), Ok(4));
    assert_eq!(records[0].prev_signature, "");
    assert_eq!(records[1].prev_signature, records[0].signature);
    assert_eq!(records[2].duration_ms, 10.0);
    assert_eq!(records[2].event_timestamp, NOW);

    let mut edited = records.clone();
    edited[1].verdict = pic::Verdict::Block;
    assert_eq!(trail.verify(&edited), Err(ChainBreak::BadSignature { index: 1 }));

    let mut dropped = records.clone();
    dropped.remove(2);
    assert_eq!(
        trail.verify(&dropped),
        Err(ChainBreak::Gap { index: 3, expected: 2 })
    );

    let mut swapped = records.clone();
    swapped.swap(1, 2);
    assert!(trail.verify(&swapped).is_err());
}
