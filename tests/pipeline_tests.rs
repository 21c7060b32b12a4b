use async_trait::async_trait;
use parking_lot::Mutex;
use pic::brain::{DecisionTransport, MemoryAuditSink};
use pic::kernel::decision::{Decision, DecisionOrigin, SignedDecision};
use pic::kernel::time::unix_now;
use pic::outputs::Effector;
use pic::transport::{KeyProvider, KeyRing, SecureTransport};
use pic::{
    FailMode, Outcome, PipelineConfig, PipelineContext, PipelineError, SignedEvent, TelemetryEvent, Verdict,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct RecordingEffector {
    seen: Mutex<Vec<(String, u64, Verdict)>>,
}

impl Effector for RecordingEffector {
    fn apply(&self, event: &TelemetryEvent, decision: &Decision) {
        self.seen
            .lock()
            .push((event.source.clone(), event.sequence, decision.verdict));
    }
}

struct SlowTransport;

#[async_trait]
impl DecisionTransport for SlowTransport {
    async fn send(&self, _signed: SignedEvent) -> Result<SignedDecision, PipelineError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Err(PipelineError::TransportUnavailable("slow".into()))
    }
}

/// Never answers for `stalled`; answers everyone else at once.
struct StallingTransport {
    stalled: &'static str,
    signer: SecureTransport,
}

#[async_trait]
impl DecisionTransport for StallingTransport {
    async fn send(&self, signed: SignedEvent) -> Result<SignedDecision, PipelineError> {
        if signed.source() == self.stalled {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.signer
            .sign_decision(Decision::allow(signed.nonce, 0.0, "within baseline"))
    }
}

/// When each source first had a decision enforced.
#[derive(Default)]
struct FirstSeen {
    at: Mutex<HashMap<String, Instant>>,
}

impl Effector for FirstSeen {
    fn apply(&self, event: &TelemetryEvent, _decision: &Decision) {
        self.at.lock().entry(event.source.clone()).or_insert_with(Instant::now);
    }
}

fn quiet_config() -> PipelineConfig {
    PipelineConfig {
        baseline_min_samples: 5,
        brain_timeout_ms: 1_000,
        ..PipelineConfig::default()
    }
}

fn event(source: &str, seq: u64) -> TelemetryEvent {
    TelemetryEvent::new(source, unix_now(), 2.0, Outcome::Success, "", seq)
}

#[tokio::test]
async fn test_measure_is_transparent() {
    let pipeline = PipelineContext::new(quiet_config()).unwrap();

    let ok: Result<u32, String> = pipeline.measure("math.add", || Ok(2 + 2));
    assert_eq!(ok, Ok(4));

    let err: Result<u32, String> = pipeline.measure("math.div", || Err("division by zero".to_string()));
    assert_eq!(err, Err("division by zero".to_string()));

    let value = pipeline.measure_call("math.neg", || -7);
    assert_eq!(value, -7);

    let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pipeline.measure_call("math.boom", || -> u32 { panic!("boom") })
    }));
    assert!(panicked.is_err(), "Panics propagate unchanged");

    // All four were observed; the panic was classified before re-raising.
    let mut outcomes = Vec::new();
    while let Some(e) = pipeline.queue().try_dequeue() {
        outcomes.push(e.outcome);
    }
    assert_eq!(
        outcomes,
        vec![
            Outcome::Success,
            Outcome::Error,
            Outcome::Success,
            Outcome::Exception("boom".into())
        ]
    );
}

#[tokio::test]
async fn test_end_to_end_preserves_per_source_order() {
    let effector = Arc::new(RecordingEffector::default());
    let pipeline = PipelineContext::builder(quiet_config())
        .effector(effector.clone())
        .build()
        .unwrap();
    pipeline.start().unwrap();

    for i in 0..50u64 {
        for source in ["checkout", "search", "login"] {
            let _: Result<u64, ()> = pipeline.measure(source, || Ok(i));
        }
    }

    let report = pipeline.shutdown().await;
    assert!(!report.timed_out);
    assert_eq!(report.discarded, 0);
    assert_eq!(pipeline.stats().workers.processed, 150);

    let seen = effector.seen.lock().clone();
    assert_eq!(seen.len(), 150);
    let mut last: HashMap<String, u64> = HashMap::new();
    for (source, seq, _) in seen {
        if let Some(prev) = last.insert(source.clone(), seq) {
            assert!(seq > prev, "{} went {} -> {}", source, prev, seq);
        }
    }
}

#[tokio::test]
async fn test_rate_limit_drops_silently() {
    let config = PipelineConfig {
        per_function_rate_limit: 5,
        ..quiet_config()
    };
    let pipeline = PipelineContext::new(config).unwrap();
    for i in 0..20 {
        let r: Result<i32, ()> = pipeline.measure("hot.path", || Ok(i));
        assert_eq!(r, Ok(i), "Callers never see admission decisions");
    }
    let stats = pipeline.stats();
    assert_eq!(stats.producer.admitted, 5);
    assert_eq!(stats.producer.rate_limited, 15);
    assert_eq!(pipeline.queue().size(), 5);
}

#[tokio::test]
async fn test_zero_sampling_observes_nothing() {
    let config = PipelineConfig {
        sampling_rate: 0.0,
        ..quiet_config()
    };
    let pipeline = PipelineContext::new(config).unwrap();
    for _ in 0..10 {
        pipeline.measure_call("svc", || ());
    }
    let stats = pipeline.stats().producer;
    assert_eq!(stats.calls, 10);
    assert_eq!(stats.sampled_out, 10);
    assert!(pipeline.queue().is_empty());
}

#[tokio::test]
async fn test_backpressure_lowers_sampling_rate() {
    let config = PipelineConfig {
        queue_capacity: 10,
        backpressure_threshold: 0.5,
        ..quiet_config()
    };
    // Not started: nothing drains the queue.
    let pipeline = PipelineContext::new(config).unwrap();
    for i in 0..6 {
        pipeline.submit(event("svc", i)).unwrap();
    }
    assert!(pipeline.sampling_rate() < 1.0);
    assert!(pipeline.stats().backpressure.active);

    pipeline.queue().clear();
    pipeline.submit(event("svc", 99)).unwrap();
    assert_eq!(pipeline.sampling_rate(), 1.0, "Rate restored once the queue drains");
}

#[tokio::test]
async fn test_redact_args_uses_configured_redactor() {
    let pipeline = PipelineContext::new(quiet_config()).unwrap();
    assert_eq!(
        pipeline.redact_args("user=alice@example.com id=4411"),
        "user=<email> id=<num>"
    );

    let custom = PipelineContext::builder(quiet_config())
        .redactor(|_: &str| -> String { "<hidden>".to_string() })
        .build()
        .unwrap();
    assert_eq!(custom.redact_args("token=abc"), "<hidden>");
}

#[tokio::test]
async fn test_internal_failures_never_reach_caller() {
    let pipeline = PipelineContext::builder(quiet_config())
        .redactor(|_: &str| -> String { panic!("redactor bug") })
        .build()
        .unwrap();

    let r: Result<&str, ()> = pipeline.measure_with_args("svc", "user=1", || Ok("done"));
    assert_eq!(r, Ok("done"));

    let stats = pipeline.stats();
    assert_eq!(stats.producer.internal_failures, 1);
    assert_eq!(stats.recovery.performance_errors, 1);
}

#[tokio::test]
async fn test_replayed_event_is_blocked() {
    let audit = Arc::new(MemoryAuditSink::new());
    let pipeline = PipelineContext::builder(quiet_config())
        .audit_sink(audit.clone())
        .build()
        .unwrap();
    let violations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&violations);
    pipeline.on_security_violation(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let signed = pipeline.sign(event("checkout", 1)).unwrap();
    let first = pipeline.deliver(signed.clone()).await;
    let second = pipeline.deliver(signed).await;

    assert!(first.is_allow());
    assert!(second.is_block());
    assert_eq!(second.origin, DecisionOrigin::Security);
    assert_eq!(second.reason, "security_violation: replay_attack");
    assert_eq!(violations.load(Ordering::SeqCst), 1);
    assert_eq!(audit.len(), 2);
}

#[tokio::test]
async fn test_fail_closed_when_decision_side_is_down() {
    let config = PipelineConfig {
        fail_mode: FailMode::Closed,
        brain_timeout_ms: 10,
        retry_attempts: 2,
        retry_backoff_ms: 1,
        ..quiet_config()
    };
    let pipeline = PipelineContext::builder(config)
        .transport(Arc::new(SlowTransport))
        .build()
        .unwrap();

    let decision = pipeline.evaluate(event("checkout", 1)).await.unwrap();
    assert!(decision.is_block());
    assert_eq!(decision.origin, DecisionOrigin::FailMode);
    assert_eq!(pipeline.stats().recovery.communication_errors, 2);
}

#[tokio::test]
async fn test_shutdown_discards_after_grace() {
    let config = PipelineConfig {
        brain_timeout_ms: 50,
        retry_attempts: 3,
        ..quiet_config()
    };
    let pipeline = PipelineContext::builder(config)
        .transport(Arc::new(SlowTransport))
        .build()
        .unwrap();
    pipeline.start().unwrap();

    for i in 0..20 {
        pipeline.submit(event("checkout", i)).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    let report = pipeline.shutdown_with_grace(Duration::from_millis(100)).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(report.timed_out);
    assert!(report.discarded > 0);
    assert_eq!(report.drained + report.discarded, 20);

    // Producers are turned away, not blocked.
    let r: Result<(), ()> = pipeline.measure("checkout", || Ok(()));
    assert_eq!(r, Ok(()));
    assert_eq!(pipeline.stats().producer.rejected_closed, 1);
    assert!(matches!(
        pipeline.submit(event("checkout", 99)),
        Err(PipelineError::AdmissionRejected(_))
    ));
}

#[tokio::test]
async fn test_shutdown_without_start() {
    let pipeline = PipelineContext::new(quiet_config()).unwrap();
    for i in 0..3 {
        pipeline.submit(event("svc", i)).unwrap();
    }
    let report = pipeline.shutdown().await;
    assert_eq!(report.discarded, 3);
    assert_eq!(report.drained, 0);
    assert!(pipeline.start().is_err(), "A stopped pipeline does not restart");
}

#[tokio::test]
async fn test_contexts_are_independent() {
    let a = PipelineContext::new(quiet_config()).unwrap();
    let b = PipelineContext::new(quiet_config()).unwrap();

    let signed_by_a = a.sign(event("checkout", 1)).unwrap();
    let decision = b.deliver(signed_by_a).await;
    assert!(decision.is_block());
    assert_eq!(decision.reason, "security_violation: invalid_signature");
    assert_eq!(a.stats().validator.total_validations, 0);
}

#[tokio::test]
async fn test_stats_serialize() {
    let pipeline = PipelineContext::new(quiet_config()).unwrap();
    pipeline.measure_call("svc", || ());
    let json = serde_json::to_value(pipeline.stats()).unwrap();
    for key in ["producer", "rate_limiter", "queue", "backpressure", "validator", "connector", "engine", "recovery"] {
        assert!(json.get(key).is_some(), "missing {}", key);
    }
    println!("{}", json);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stalled_source_does_not_delay_others() {
    let keys: Arc<dyn KeyProvider> = Arc::new(KeyRing::generate(300));
    let transport = StallingTransport {
        stalled: "reports.export",
        signer: SecureTransport::new(Arc::clone(&keys)),
    };
    let effector = Arc::new(FirstSeen::default());
    let config = PipelineConfig {
        brain_timeout_ms: 20_000,
        retry_attempts: 1,
        source_lane_capacity: 16,
        ..quiet_config()
    };
    let pipeline = PipelineContext::builder(config)
        .keys(keys)
        .transport(Arc::new(transport))
        .effector(effector.clone())
        .build()
        .unwrap();
    pipeline.start().unwrap();

    for i in 0..100 {
        pipeline.submit(event("reports.export", i)).unwrap();
    }
    let submitted = Instant::now();
    pipeline.submit(event("checkout", 100)).unwrap();

    let deadline = submitted + Duration::from_secs(5);
    let decided = loop {
        if let Some(at) = effector.at.lock().get("checkout").copied() {
            break at;
        }
        assert!(Instant::now() < deadline, "checkout was never decided");
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert!(
        decided - submitted < Duration::from_millis(500),
        "checkout waited {:?} behind a stalled source",
        decided - submitted
    );
    assert!(!effector.at.lock().contains_key("reports.export"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let workers = pipeline.stats().workers;
    assert_eq!(workers.processed, 1);
    assert!(workers.lane_overflows >= 83, "stalled lane sheds its own backlog");

    let report = pipeline.shutdown_with_grace(Duration::from_millis(50)).await;
    assert!(report.timed_out);
    assert!(report.discarded > 0);
}
