use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::kernel::decision::{Decision, DecisionOrigin, Verdict};
use crate::kernel::event::TelemetryEvent;

/// Consumer of verdicts. Enforcement is applied after the fact; the original
/// call has already returned by the time a decision exists.
pub trait Effector: Send + Sync {
    fn apply(&self, event: &TelemetryEvent, decision: &Decision);

    fn stats(&self) -> Option<EffectorStats> {
        None
    }
}

impl<F> Effector for F
where
    F: Fn(&TelemetryEvent, &Decision) + Send + Sync,
{
    fn apply(&self, event: &TelemetryEvent, decision: &Decision) {
        self(event, decision)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EffectorStats {
    pub total_actions: u64,
    pub allowed: u64,
    pub blocked: u64,
    pub security_blocks: u64,
    pub fail_mode_actions: u64,
    /// Blocks per source.
    pub blocked_sources: HashMap<String, u64>,
}

/// Logs every block, counts every action.
#[derive(Debug, Default)]
pub struct LoggingEffector {
    stats: Mutex<EffectorStats>,
}

impl LoggingEffector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> EffectorStats {
        self.stats.lock().clone()
    }
}

impl Effector for LoggingEffector {
    fn stats(&self) -> Option<EffectorStats> {
        Some(self.snapshot())
    }

    fn apply(&self, event: &TelemetryEvent, decision: &Decision) {
        let mut stats = self.stats.lock();
        stats.total_actions += 1;
        match decision.origin {
            DecisionOrigin::Security => stats.security_blocks += 1,
            DecisionOrigin::FailMode => stats.fail_mode_actions += 1,
            DecisionOrigin::Detection => {}
        }
        match decision.verdict {
            Verdict::Allow => stats.allowed += 1,
            Verdict::Block => {
                stats.blocked += 1;
                *stats.blocked_sources.entry(event.source.clone()).or_insert(0) += 1;
                drop(stats);
                warn!(
                    "BLOCK {} seq={} score={:.3}: {}",
                    event.source, event.sequence, decision.score, decision.reason
                );
                return;
            }
        }
        if decision.origin == DecisionOrigin::FailMode {
            info!("Fail-open allow for {} seq={}", event.source, event.sequence);
        }
    }
}
