//! Error accounting and the degraded-mode state machine.
//!
//! Escalation is driven by the number of errors inside a sliding window;
//! recovery only by quiet time. Successes feed the failure ratio but never
//! shorten a cool-down. The state is read by the connector (for its
//! statistics) and by the decision engine (to relax its threshold). Nothing
//! else mutates it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::kernel::time::{unix_now, Timestamp};

/// Upper bound on retained records, independent of the window length.
const MAX_HISTORY: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Communication,
    Security,
    Performance,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Communication => "communication",
            ErrorKind::Security => "security",
            ErrorKind::Performance => "performance",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub timestamp: Timestamp,
    pub context: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedModeState {
    Normal,
    Alert,
    Degraded,
}

impl Default for DegradedModeState {
    fn default() -> Self {
        Self::Normal
    }
}

impl DegradedModeState {
    /// Pure escalation rule: (current, errors in window) -> next.
    /// Never lowers the level.
    pub fn escalate(self, window_count: usize, error_threshold: usize, degraded_threshold: usize) -> Self {
        let target = if window_count >= degraded_threshold {
            DegradedModeState::Degraded
        } else if window_count >= error_threshold {
            DegradedModeState::Alert
        } else {
            DegradedModeState::Normal
        };
        self.max(target)
    }

    /// One level down; recovery never skips a level.
    pub fn step_down(self) -> Self {
        match self {
            DegradedModeState::Degraded => DegradedModeState::Alert,
            DegradedModeState::Alert | DegradedModeState::Normal => DegradedModeState::Normal,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryStats {
    pub state: DegradedModeState,
    pub total_errors: u64,
    pub communication_errors: u64,
    pub security_errors: u64,
    pub performance_errors: u64,
    pub recent_error_count: usize,
    pub error_rate: f64,
    pub successful_operations: u64,
    /// Communication errors over all delivery attempts.
    pub communication_failure_ratio: f64,
    pub transitions: u64,
    pub degraded_since: Option<Timestamp>,
}

#[derive(Debug, Default)]
struct RecoveryState {
    state: DegradedModeState,
    window: VecDeque<ErrorRecord>,
    per_kind: HashMap<ErrorKind, u64>,
    total: u64,
    successes: u64,
    last_error_at: Option<Timestamp>,
    /// Start of the current quiet period (last error or last step down).
    cooldown_anchor: Timestamp,
    transitions: u64,
    degraded_since: Option<Timestamp>,
}

pub struct ErrorRecovery {
    error_threshold: usize,
    degraded_threshold: usize,
    window_s: f64,
    cooldown_s: f64,
    inner: Mutex<RecoveryState>,
}

impl ErrorRecovery {
    pub fn new(error_threshold: usize, degraded_threshold: usize, window_s: u64, cooldown_s: u64) -> Self {
        Self {
            error_threshold: error_threshold.max(1),
            degraded_threshold: degraded_threshold.max(error_threshold.max(1)),
            window_s: window_s as f64,
            cooldown_s: cooldown_s.max(1) as f64,
            inner: Mutex::new(RecoveryState::default()),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.error_threshold,
            config.degraded_mode_threshold,
            config.time_window_seconds,
            config.recovery_cooldown_seconds,
        )
    }

    pub fn handle_communication_error(&self, context: &str) {
        self.record(ErrorKind::Communication, context);
    }

    pub fn handle_security_error(&self, context: &str) {
        self.record(ErrorKind::Security, context);
    }

    pub fn handle_performance_degradation(&self, metric: &str, value: f64, threshold: f64) {
        let context = format!("{} exceeded threshold: {} > {}", metric, value, threshold);
        self.record(ErrorKind::Performance, &context);
    }

    /// A delivery attempt that came back with an authentic decision.
    pub fn handle_success(&self) {
        self.inner.lock().successes += 1;
    }

    pub fn record(&self, kind: ErrorKind, context: &str) {
        self.record_at(kind, context, unix_now())
    }

    pub fn record_at(&self, kind: ErrorKind, context: &str, now: Timestamp) {
        let mut inner = self.inner.lock();
        // Let any finished cool-down apply before this error counts against it.
        self.apply_cooldown(&mut inner, now);

        inner.window.push_back(ErrorRecord {
            kind,
            timestamp: now,
            context: context.to_string(),
        });
        if inner.window.len() > MAX_HISTORY {
            inner.window.pop_front();
        }
        *inner.per_kind.entry(kind).or_insert(0) += 1;
        inner.total += 1;
        inner.last_error_at = Some(now);
        inner.cooldown_anchor = now;

        self.prune(&mut inner, now);
        let count = inner.window.len();
        let next = inner.state.escalate(count, self.error_threshold, self.degraded_threshold);
        if next != inner.state {
            self.transition(&mut inner, next, now, count);
        }
    }

    pub fn state(&self) -> DegradedModeState {
        self.state_at(unix_now())
    }

    pub fn state_at(&self, now: Timestamp) -> DegradedModeState {
        let mut inner = self.inner.lock();
        self.apply_cooldown(&mut inner, now);
        inner.state
    }

    pub fn is_degraded(&self) -> bool {
        self.state() == DegradedModeState::Degraded
    }

    pub fn is_degraded_at(&self, now: Timestamp) -> bool {
        self.state_at(now) == DegradedModeState::Degraded
    }

    pub fn recent_error_count_at(&self, now: Timestamp) -> usize {
        let mut inner = self.inner.lock();
        self.prune(&mut inner, now);
        inner.window.len()
    }

    /// Errors per second over the window.
    pub fn error_rate_at(&self, now: Timestamp) -> f64 {
        self.recent_error_count_at(now) as f64 / self.window_s.max(1.0)
    }

    pub fn error_rate(&self) -> f64 {
        self.error_rate_at(unix_now())
    }

    pub fn stats(&self) -> RecoveryStats {
        self.stats_at(unix_now())
    }

    pub fn stats_at(&self, now: Timestamp) -> RecoveryStats {
        let mut inner = self.inner.lock();
        self.apply_cooldown(&mut inner, now);
        self.prune(&mut inner, now);
        let kind = |k: ErrorKind| inner.per_kind.get(&k).copied().unwrap_or(0);
        let communication = kind(ErrorKind::Communication);
        let attempts = communication + inner.successes;
        RecoveryStats {
            state: inner.state,
            total_errors: inner.total,
            communication_errors: communication,
            security_errors: kind(ErrorKind::Security),
            performance_errors: kind(ErrorKind::Performance),
            recent_error_count: inner.window.len(),
            error_rate: inner.window.len() as f64 / self.window_s.max(1.0),
            successful_operations: inner.successes,
            communication_failure_ratio: if attempts > 0 {
                communication as f64 / attempts as f64
            } else {
                0.0
            },
            transitions: inner.transitions,
            degraded_since: inner.degraded_since,
        }
    }

    fn prune(&self, inner: &mut RecoveryState, now: Timestamp) {
        let cutoff = now - self.window_s;
        while inner.window.front().map_or(false, |r| r.timestamp <= cutoff) {
            inner.window.pop_front();
        }
    }

    /// Each full cool-down of quiet time lowers the state by exactly one level.
    fn apply_cooldown(&self, inner: &mut RecoveryState, now: Timestamp) {
        while inner.state != DegradedModeState::Normal && now - inner.cooldown_anchor >= self.cooldown_s {
            let at = inner.cooldown_anchor + self.cooldown_s;
            inner.cooldown_anchor = at;
            let next = inner.state.step_down();
            self.transition(inner, next, at, 0);
        }
    }

    fn transition(&self, inner: &mut RecoveryState, next: DegradedModeState, at: Timestamp, window_count: usize) {
        let prev = inner.state;
        inner.state = next;
        inner.transitions += 1;
        match next {
            DegradedModeState::Degraded => {
                inner.degraded_since = Some(at);
                error!(
                    "ENTERING DEGRADED MODE: {} errors within {}s (from {:?})",
                    window_count, self.window_s, prev
                );
            }
            DegradedModeState::Alert if prev < next => {
                warn!("Error rate alert: {} errors within {}s", window_count, self.window_s);
            }
            _ => {
                if prev == DegradedModeState::Degraded {
                    let duration = inner.degraded_since.map(|s| at - s).unwrap_or(0.0);
                    info!("Leaving degraded mode after {:.1}s", duration);
                    inner.degraded_since = None;
                }
                info!("Error recovery stepped down: {:?} -> {:?}", prev, next);
            }
        }
    }
}
