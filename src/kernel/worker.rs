//! Consumer side of the queue.
//!
//! One dispatcher drains the shared queue and hands each event to the lane
//! of its source. A lane is a bounded per-source buffer with one task, so
//! events from one source are signed, decided and enforced in enqueue order,
//! while a source whose deliveries stall only ever delays itself. The
//! dispatcher never waits on a lane: a lane that falls behind drops its own
//! oldest events. Idle lanes are reclaimed periodically.

use serde::Serialize;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::decision::Decision;
use super::event::TelemetryEvent;
use crate::admission::{EnqueueResult, EventQueue};
use crate::brain::{BrainConnector, DecisionEngine};
use crate::error::PipelineError;
use crate::outputs::Effector;
use crate::recovery::{ErrorKind, ErrorRecovery};
use crate::transport::SecureTransport;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const REAP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct WorkerCounters {
    processed: AtomicU64,
    discarded: AtomicU64,
    lane_overflows: AtomicU64,
    internal_failures: AtomicU64,
    active_lanes: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub discarded: u64,
    /// Events dropped because their source's lane was full.
    pub lane_overflows: u64,
    pub internal_failures: u64,
    pub active_lanes: u64,
}

impl WorkerCounters {
    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            lane_overflows: self.lane_overflows.load(Ordering::Relaxed),
            internal_failures: self.internal_failures.load(Ordering::Relaxed),
            active_lanes: self.active_lanes.load(Ordering::Relaxed),
        }
    }

    fn discard(&self, n: u64) {
        self.discarded.fetch_add(n, Ordering::Relaxed);
    }
}

/// Sign -> deliver -> enforce for one event.
pub struct DecisionStage {
    pub signer: SecureTransport,
    pub connector: BrainConnector,
    pub effector: Arc<dyn Effector>,
    pub recovery: Arc<ErrorRecovery>,
    pub counters: WorkerCounters,
}

impl DecisionStage {
    pub async fn handle(&self, event: TelemetryEvent) -> Result<Decision, PipelineError> {
        // 1. Sign
        let signed = match self.signer.sign(event.clone()) {
            Ok(signed) => signed,
            Err(e) => {
                self.internal_failure(&format!("signing '{}' failed: {}", event.source, e));
                return Err(e);
            }
        };

        // 2. Deliver (always yields a decision)
        let decision = self.connector.deliver(signed).await;

        // 3. Enforce
        if panic::catch_unwind(AssertUnwindSafe(|| self.effector.apply(&event, &decision))).is_err() {
            self.internal_failure(&format!("effector panicked on '{}'", event.source));
        }
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        Ok(decision)
    }

    pub fn internal_failure(&self, context: &str) {
        self.counters.internal_failures.fetch_add(1, Ordering::Relaxed);
        error!("Internal pipeline failure: {}", context);
        self.recovery.record(ErrorKind::Performance, &format!("internal: {}", context));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShutdownReport {
    /// Events decided after shutdown began.
    pub drained: u64,
    /// Events still pending when the grace period ran out.
    pub discarded: u64,
    pub timed_out: bool,
}

pub struct WorkerPool {
    dispatcher: JoinHandle<()>,
    maintenance: JoinHandle<()>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn spawn(
        queue: Arc<EventQueue>,
        stage: Arc<DecisionStage>,
        engine: Arc<DecisionEngine>,
        lane_capacity: usize,
    ) -> Self {
        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(run_dispatcher(queue, Arc::clone(&stage), lane_capacity, cancel.clone()));
        let maintenance = tokio::spawn(run_maintenance(engine, cancel.clone()));

        info!("Worker pool started (lane capacity {})", lane_capacity);
        Self {
            dispatcher,
            maintenance,
            cancel,
        }
    }

    /// Close the queue, drain for up to `grace`, then cancel and discard.
    pub async fn shutdown(self, queue: &EventQueue, stage: &DecisionStage, grace: Duration) -> ShutdownReport {
        let processed_before = stage.counters.processed.load(Ordering::Relaxed);
        let discarded_before = stage.counters.discarded.load(Ordering::Relaxed);
        queue.close();

        let WorkerPool {
            mut dispatcher,
            maintenance,
            cancel,
        } = self;

        let timed_out = tokio::time::timeout(grace, &mut dispatcher).await.is_err();
        cancel.cancel();
        if timed_out {
            warn!("Shutdown grace of {:?} elapsed; discarding remaining events", grace);
            let _ = dispatcher.await;
        }
        let _ = maintenance.await;

        let leftover = queue.clear().len() as u64;
        stage.counters.discard(leftover);

        let report = ShutdownReport {
            drained: stage.counters.processed.load(Ordering::Relaxed) - processed_before,
            discarded: stage.counters.discarded.load(Ordering::Relaxed) - discarded_before,
            timed_out,
        };
        info!(
            "Pipeline stopped: drained={} discarded={}",
            report.drained, report.discarded
        );
        report
    }
}

/// Buffer and task for one source.
struct SourceLane {
    queue: Arc<EventQueue>,
    /// Handed to the lane and not yet finished.
    pending: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl SourceLane {
    fn spawn(source: &str, capacity: usize, stage: &Arc<DecisionStage>, cancel: &CancellationToken) -> Self {
        let queue = Arc::new(EventQueue::new(capacity));
        let pending = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run_lane(
            source.to_string(),
            Arc::clone(&queue),
            Arc::clone(&pending),
            Arc::clone(stage),
            cancel.clone(),
        ));
        stage.counters.active_lanes.fetch_add(1, Ordering::Relaxed);
        Self { queue, pending, task }
    }

    /// Never waits: a full lane sheds its own oldest event.
    fn push(&self, event: TelemetryEvent, counters: &WorkerCounters) {
        let source = event.source.clone();
        self.pending.fetch_add(1, Ordering::AcqRel);
        match self.queue.enqueue(event) {
            EnqueueResult::Queued => {}
            EnqueueResult::QueuedDroppedOldest => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                let total = counters.lane_overflows.fetch_add(1, Ordering::Relaxed) + 1;
                if total.is_power_of_two() {
                    warn!("Lane for '{}' is full, dropped its oldest event ({} total)", source, total);
                }
            }
            EnqueueResult::Closed => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                counters.discard(1);
            }
        }
    }

    /// Only the dispatcher pushes, so a lane with nothing pending stays idle
    /// until it is closed here.
    fn is_idle(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
    }
}

async fn run_dispatcher(
    queue: Arc<EventQueue>,
    stage: Arc<DecisionStage>,
    lane_capacity: usize,
    cancel: CancellationToken,
) {
    let mut lanes: HashMap<String, SourceLane> = HashMap::new();
    let mut reap = tokio::time::interval(REAP_INTERVAL);
    reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = reap.tick() => {
                reap_idle(&mut lanes, &stage.counters);
                continue;
            }
            event = queue.dequeue() => event,
        };
        // Closed and empty
        let Some(event) = event else { break };

        let lane = lanes
            .entry(event.source.clone())
            .or_insert_with(|| SourceLane::spawn(&event.source, lane_capacity, &stage, &cancel));
        lane.push(event, &stage.counters);
    }

    // Lanes finish what they hold, or discard it once cancelled.
    let tasks: Vec<JoinHandle<()>> = lanes
        .drain()
        .map(|(_, lane)| {
            lane.queue.close();
            lane.task
        })
        .collect();
    for task in tasks {
        let _ = task.await;
    }
    stage.counters.active_lanes.store(0, Ordering::Relaxed);
    debug!("Dispatcher stopped");
}

fn reap_idle(lanes: &mut HashMap<String, SourceLane>, counters: &WorkerCounters) {
    let before = lanes.len();
    lanes.retain(|_, lane| {
        if lane.is_idle() {
            // The task sees a closed, empty queue and exits.
            lane.queue.close();
            false
        } else {
            true
        }
    });
    let reaped = before - lanes.len();
    if reaped > 0 {
        counters.active_lanes.fetch_sub(reaped as u64, Ordering::Relaxed);
        debug!("Reclaimed {} idle lanes ({} active)", reaped, lanes.len());
    }
}

async fn run_lane(
    source: String,
    queue: Arc<EventQueue>,
    pending: Arc<AtomicU64>,
    stage: Arc<DecisionStage>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = queue.dequeue() => event,
        };
        let Some(event) = event else { break };

        let cancelled = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                stage.counters.discard(1);
                true
            }
            // Errors are already counted and recorded by the stage.
            _ = stage.handle(event) => false,
        };
        pending.fetch_sub(1, Ordering::AcqRel);
        if cancelled {
            break;
        }
    }

    let dropped = queue.clear().len() as u64;
    if dropped > 0 {
        pending.fetch_sub(dropped, Ordering::AcqRel);
        stage.counters.discard(dropped);
    }
    debug!("Lane for '{}' stopped", source);
}

/// Periodic purge of expired nonces and cached patterns.
async fn run_maintenance(engine: Arc<DecisionEngine>, cancel: CancellationToken) {
    let mut cadence = tokio::time::interval(SWEEP_INTERVAL);
    cadence.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = cadence.tick() => {
                engine.maintain();
            }
        }
    }
}
