//! The pipeline as one explicitly constructed value.
//!
//! `PipelineContext` owns every component and is passed (usually behind an
//! `Arc`) to whatever code instruments calls. No global state: two contexts
//! in one process are fully independent.

use parking_lot::Mutex;
use rand::Rng;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::decision::Decision;
use super::event::{Outcome, SignedEvent, TelemetryEvent};
use super::redaction::{MaskingRedactor, Redactor};
use super::stats::{PipelineStats, ProducerStats};
use super::time::{as_millis_f64, unix_now, Timestamp};
use super::worker::{DecisionStage, ShutdownReport, WorkerCounters, WorkerPool};
use crate::admission::{BackpressureController, EnqueueResult, EventQueue, RateLimiter};
use crate::brain::{
    AnomalyScorer, AuditSink, AuditTrail, BrainConnector, DecisionEngine, DecisionTransport,
    InProcessTransport, TracingAuditSink,
};
use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError};
use crate::outputs::{Effector, LoggingEffector};
use crate::recovery::{ErrorKind, ErrorRecovery};
use crate::transport::{KeyProvider, KeyRing, SecureTransport, SecurityValidator, ValidationHook};

#[derive(Debug, Default)]
struct ProducerCounters {
    calls: AtomicU64,
    sampled_out: AtomicU64,
    submitted: AtomicU64,
    admitted: AtomicU64,
    rate_limited: AtomicU64,
    rejected_closed: AtomicU64,
    internal_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Collaborators default to: a freshly generated key ring, tracing audit,
/// logging effector, masking redactor, deviation scorer, in-process engine.
pub struct PipelineBuilder {
    config: PipelineConfig,
    keys: Option<Arc<dyn KeyProvider>>,
    audit: Option<Arc<dyn AuditSink>>,
    effector: Option<Arc<dyn Effector>>,
    redactor: Option<Arc<dyn Redactor>>,
    scorer: Option<Box<dyn AnomalyScorer>>,
    hooks: Vec<Box<dyn ValidationHook>>,
    transport: Option<Arc<dyn DecisionTransport>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            keys: None,
            audit: None,
            effector: None,
            redactor: None,
            scorer: None,
            hooks: Vec::new(),
            transport: None,
        }
    }

    pub fn keys(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn effector(mut self, effector: Arc<dyn Effector>) -> Self {
        self.effector = Some(effector);
        self
    }

    pub fn redactor(mut self, redactor: impl Redactor + 'static) -> Self {
        self.redactor = Some(Arc::new(redactor));
        self
    }

    pub fn scorer(mut self, scorer: impl AnomalyScorer + 'static) -> Self {
        self.scorer = Some(Box::new(scorer));
        self
    }

    pub fn validation_hook(mut self, hook: impl ValidationHook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    /// Replace the in-process decision path (e.g. with a remote one).
    pub fn transport(mut self, transport: Arc<dyn DecisionTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<PipelineContext, ConfigError> {
        let config = self.config;
        config.validate()?;

        let keys = self
            .keys
            .unwrap_or_else(|| Arc::new(KeyRing::generate(config.key_rotation_grace_s)));
        let recovery = Arc::new(ErrorRecovery::from_config(&config));
        let signer = SecureTransport::new(Arc::clone(&keys));

        // Decision side
        let mut validator = SecurityValidator::from_config(Arc::clone(&keys), &config);
        for hook in self.hooks {
            validator = validator.with_boxed_hook(hook);
        }
        let sink = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));
        let audit = AuditTrail::new(sink, keys.as_ref());
        let mut engine = DecisionEngine::from_config(validator, Arc::clone(&recovery), audit, &config);
        if let Some(scorer) = self.scorer {
            engine = engine.with_boxed_scorer(scorer);
        }
        let engine = Arc::new(engine);

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(InProcessTransport::new(Arc::clone(&engine), signer.clone())));
        let connector = BrainConnector::new(transport, signer.clone(), Arc::clone(&recovery), &config);

        let stage = Arc::new(DecisionStage {
            signer,
            connector,
            effector: self.effector.unwrap_or_else(|| Arc::new(LoggingEffector::new())),
            recovery: Arc::clone(&recovery),
            counters: WorkerCounters::default(),
        });

        info!(
            "Pipeline configured: sampling={} queue={} fail_mode={:?} lane_capacity={}",
            config.sampling_rate, config.queue_capacity, config.fail_mode, config.source_lane_capacity
        );

        Ok(PipelineContext {
            limiter: RateLimiter::from_config(&config),
            queue: Arc::new(EventQueue::new(config.queue_capacity)),
            backpressure: BackpressureController::from_config(&config),
            sampling_bits: AtomicU64::new(config.sampling_rate.to_bits()),
            redactor: self
                .redactor
                .unwrap_or_else(|| Arc::new(MaskingRedactor::default())),
            sequence: AtomicU64::new(0),
            producer: ProducerCounters::default(),
            workers: Mutex::new(None),
            keys,
            engine,
            recovery,
            stage,
            config,
        })
    }
}

pub struct PipelineContext {
    config: PipelineConfig,
    keys: Arc<dyn KeyProvider>,
    limiter: RateLimiter,
    queue: Arc<EventQueue>,
    backpressure: BackpressureController,
    engine: Arc<DecisionEngine>,
    recovery: Arc<ErrorRecovery>,
    stage: Arc<DecisionStage>,
    redactor: Arc<dyn Redactor>,
    sampling_bits: AtomicU64,
    sequence: AtomicU64,
    producer: ProducerCounters,
    workers: Mutex<Option<WorkerPool>>,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        PipelineBuilder::new(config).build()
    }

    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Spawn the dispatcher and maintenance tasks on the current Tokio
    /// runtime. Idempotent.
    pub fn start(&self) -> Result<(), PipelineError> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| PipelineError::InternalFailure(format!("no tokio runtime: {}", e)))?;
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return Ok(());
        }
        if self.queue.is_closed() {
            return Err(PipelineError::InternalFailure("pipeline already shut down".into()));
        }
        *workers = Some(WorkerPool::spawn(
            Arc::clone(&self.queue),
            Arc::clone(&self.stage),
            Arc::clone(&self.engine),
            self.config.source_lane_capacity,
        ));
        Ok(())
    }

    /// Run `invoke` and observe it. The result (or panic) is passed through
    /// unchanged; `Err` is classified as an error outcome.
    pub fn measure<T, E>(&self, source: &str, invoke: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        self.instrument(source, "", invoke, classify_result)
    }

    /// As `measure`, with raw arguments passed through the redactor.
    pub fn measure_with_args<T, E>(
        &self,
        source: &str,
        raw_args: &str,
        invoke: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        self.instrument(source, raw_args, invoke, classify_result)
    }

    /// Summary of raw arguments as it would be recorded on an event.
    pub fn redact_args(&self, raw_args: &str) -> String {
        self.redactor.redact(raw_args)
    }

    /// For calls without an error channel: success unless it panics.
    pub fn measure_call<T>(&self, source: &str, invoke: impl FnOnce() -> T) -> T {
        self.instrument(source, "", invoke, |_| Outcome::Success)
    }

    /// Admission path for an already built event: rate limit, enqueue, then
    /// refresh the sampling rate from backpressure.
    pub fn submit(&self, event: TelemetryEvent) -> Result<(), PipelineError> {
        bump(&self.producer.submitted);
        let source = event.source.clone();
        if !self.limiter.admit(&source) {
            bump(&self.producer.rate_limited);
            return Err(PipelineError::AdmissionRejected(source));
        }
        match self.queue.enqueue(event) {
            EnqueueResult::Queued | EnqueueResult::QueuedDroppedOldest => bump(&self.producer.admitted),
            EnqueueResult::Closed => {
                bump(&self.producer.rejected_closed);
                return Err(PipelineError::AdmissionRejected(source));
            }
        }

        let signal = self.backpressure.check_and_signal(&*self.queue);
        let rate = self.limiter.adjusted_sampling_rate(signal.recommended_rate);
        let previous = f64::from_bits(self.sampling_bits.swap(rate.to_bits(), Ordering::Relaxed));
        if (previous - rate).abs() > f64::EPSILON {
            debug!("Sampling rate {:.3} -> {:.3} ({})", previous, rate, signal.reason);
        }
        Ok(())
    }

    /// Decide one event immediately, bypassing the queue.
    pub async fn evaluate(&self, event: TelemetryEvent) -> Result<Decision, PipelineError> {
        self.stage.handle(event).await
    }

    /// Deliver an already signed event, e.g. one received from another process.
    pub async fn deliver(&self, signed: SignedEvent) -> Decision {
        self.stage.connector.deliver(signed).await
    }

    /// Build and sign an event exactly as the instrumentation boundary would.
    pub fn sign(&self, event: TelemetryEvent) -> Result<SignedEvent, PipelineError> {
        self.stage.signer.sign(event)
    }

    pub fn on_security_violation(&self, observer: impl Fn(&SignedEvent, &Decision) + Send + Sync + 'static) {
        self.engine.on_security_violation(observer);
    }

    pub fn sampling_rate(&self) -> f64 {
        f64::from_bits(self.sampling_bits.load(Ordering::Relaxed))
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn keys(&self) -> &Arc<dyn KeyProvider> {
        &self.keys
    }

    pub fn engine(&self) -> &Arc<DecisionEngine> {
        &self.engine
    }

    pub fn recovery(&self) -> &Arc<ErrorRecovery> {
        &self.recovery
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn connector(&self) -> &BrainConnector {
        &self.stage.connector
    }

    pub fn stats(&self) -> PipelineStats {
        let p = &self.producer;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineStats {
            producer: ProducerStats {
                calls: load(&p.calls),
                sampled_out: load(&p.sampled_out),
                submitted: load(&p.submitted),
                admitted: load(&p.admitted),
                rate_limited: load(&p.rate_limited),
                rejected_closed: load(&p.rejected_closed),
                internal_failures: load(&p.internal_failures),
                sampling_rate: self.sampling_rate(),
            },
            rate_limiter: self.limiter.stats(),
            queue: self.queue.stats(),
            backpressure: self.backpressure.stats(),
            validator: self.engine.validator().stats(),
            connector: self.stage.connector.stats(),
            engine: self.engine.stats(),
            recovery: self.recovery.stats(),
            workers: self.stage.counters.snapshot(),
            effector: self.stage.effector.stats(),
        }
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_with_grace(self.config.shutdown_grace()).await
    }

    /// Stop admitting, drain within `grace`, discard the rest. Safe to call
    /// more than once, and without `start`.
    pub async fn shutdown_with_grace(&self, grace: Duration) -> ShutdownReport {
        let pool = self.workers.lock().take();
        match pool {
            Some(pool) => pool.shutdown(&self.queue, &self.stage, grace).await,
            None => {
                self.queue.close();
                let discarded = self.queue.clear().len() as u64;
                ShutdownReport {
                    drained: 0,
                    discarded,
                    timed_out: false,
                }
            }
        }
    }

    fn should_sample(&self) -> bool {
        let rate = self.sampling_rate();
        if rate >= 1.0 {
            true
        } else if rate <= 0.0 {
            false
        } else {
            rand::thread_rng().gen::<f64>() < rate
        }
    }

    fn instrument<R>(
        &self,
        source: &str,
        raw_args: &str,
        invoke: impl FnOnce() -> R,
        classify: impl FnOnce(&R) -> Outcome,
    ) -> R {
        bump(&self.producer.calls);
        if !self.should_sample() {
            bump(&self.producer.sampled_out);
            return invoke();
        }

        let started_at = unix_now();
        let clock = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(invoke));
        let duration_ms = as_millis_f64(clock.elapsed());

        match result {
            Ok(value) => {
                let outcome = classify(&value);
                self.observe(source, started_at, duration_ms, outcome, raw_args);
                value
            }
            Err(payload) => {
                let outcome = Outcome::Exception(panic_message(payload.as_ref()));
                self.observe(source, started_at, duration_ms, outcome, raw_args);
                panic::resume_unwind(payload)
            }
        }
    }

    /// Nothing raised in here reaches the instrumented call.
    fn observe(&self, source: &str, started_at: Timestamp, duration_ms: f64, outcome: Outcome, raw_args: &str) {
        let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
            let args_summary = self.redactor.redact(raw_args);
            let event = TelemetryEvent::new(
                source,
                started_at,
                duration_ms,
                outcome,
                args_summary,
                self.next_sequence(),
            );
            self.submit(event)
        }));

        match attempt {
            Ok(Ok(())) | Ok(Err(PipelineError::AdmissionRejected(_))) => {}
            Ok(Err(e)) => self.internal_failure(source, &e.to_string()),
            Err(payload) => self.internal_failure(source, &panic_message(payload.as_ref())),
        }
    }

    fn internal_failure(&self, source: &str, detail: &str) {
        bump(&self.producer.internal_failures);
        warn!("Instrumentation of '{}' failed: {}", source, detail);
        self.recovery
            .record(ErrorKind::Performance, &format!("internal: instrumentation of '{}': {}", source, detail));
    }
}

fn classify_result<T, E>(result: &Result<T, E>) -> Outcome {
    match result {
        Ok(_) => Outcome::Success,
        Err(_) => Outcome::Error,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
