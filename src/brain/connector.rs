use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::engine::DecisionEngine;
use crate::config::{FailMode, PipelineConfig};
use crate::error::PipelineError;
use crate::kernel::decision::{Decision, DecisionOrigin, SignedDecision};
use crate::kernel::event::SignedEvent;
use crate::recovery::{DegradedModeState, ErrorRecovery};
use crate::transport::SecureTransport;

/// Channel to the decision side.
#[async_trait]
pub trait DecisionTransport: Send + Sync {
    async fn send(&self, signed: SignedEvent) -> Result<SignedDecision, PipelineError>;

    async fn is_available(&self) -> bool {
        true
    }
}

/// Runs the engine on the blocking pool so a slow or wedged engine cannot
/// stall the async workers and stays subject to the connector timeout.
///
/// Only the assessment runs on the pool. The commit happens after the
/// await, so an attempt dropped by the connector's timeout never updates
/// baselines or writes an audit record.
pub struct InProcessTransport {
    engine: Arc<DecisionEngine>,
    signer: SecureTransport,
}

impl InProcessTransport {
    pub fn new(engine: Arc<DecisionEngine>, signer: SecureTransport) -> Self {
        Self { engine, signer }
    }
}

#[async_trait]
impl DecisionTransport for InProcessTransport {
    async fn send(&self, signed: SignedEvent) -> Result<SignedDecision, PipelineError> {
        let engine = Arc::clone(&self.engine);
        let assessment = tokio::task::spawn_blocking(move || engine.assess(&signed))
            .await
            .map_err(|e| {
                if e.is_panic() {
                    PipelineError::InternalFailure("decision engine panicked".into())
                } else {
                    PipelineError::TransportUnavailable("decision task cancelled".into())
                }
            })?;
        // No await from here on.
        let decision = self.engine.commit(assessment);
        self.signer.sign_decision(decision)
    }
}

/// Pure backoff schedule: attempt `n` (1-based) waits `base * 2^(n-1)`,
/// never longer than `cap`.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub rejected_decisions: u64,
    pub fail_mode_decisions: u64,
    pub success_rate: f64,
    pub fail_mode: FailMode,
    pub degraded_state: DegradedModeState,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    retries: u64,
    timeouts: u64,
    rejected: u64,
    fail_mode: u64,
}

/// Delivers signed events to the decision side and always comes back with a
/// Decision: the engine's, a security block, or the fail-mode default.
pub struct BrainConnector {
    transport: Arc<dyn DecisionTransport>,
    security: SecureTransport,
    recovery: Arc<ErrorRecovery>,
    fail_mode: FailMode,
    timeout: Duration,
    attempts: u32,
    backoff: Duration,
    backoff_cap: Duration,
    counters: Mutex<Counters>,
}

impl BrainConnector {
    pub fn new(
        transport: Arc<dyn DecisionTransport>,
        security: SecureTransport,
        recovery: Arc<ErrorRecovery>,
        config: &PipelineConfig,
    ) -> Self {
        let timeout = config.brain_timeout();
        Self {
            transport,
            security,
            recovery,
            fail_mode: config.fail_mode,
            timeout,
            attempts: config.retry_attempts.max(1),
            backoff: config.retry_backoff(),
            // A single sleep never exceeds one attempt's budget.
            backoff_cap: config.retry_backoff_cap().min(timeout),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn fail_mode(&self) -> FailMode {
        self.fail_mode
    }

    pub async fn is_available(&self) -> bool {
        self.transport.is_available().await
    }

    pub async fn deliver(&self, signed: SignedEvent) -> Decision {
        self.counters.lock().total += 1;
        let nonce = signed.nonce.clone();
        let source = signed.source().to_string();

        for attempt in 1..=self.attempts {
            // A timed-out attempt may still reach the engine and burn its nonce,
            // so every retry goes out under a fresh one.
            let request = if attempt == 1 {
                Ok(signed.clone())
            } else {
                self.security.sign(signed.event.clone())
            };
            let result = match request {
                Ok(request) => {
                    let request_nonce = request.nonce.clone();
                    tokio::time::timeout(self.timeout, self.transport.send(request))
                        .await
                        .map(|answer| answer.map(|a| (a, request_nonce)))
                }
                Err(e) => Ok(Err(e)),
            };
            let err = match result {
                Ok(Ok((answer, request_nonce))) => return self.accept(answer, &request_nonce, &source),
                Ok(Err(e)) => e,
                Err(_) => {
                    self.counters.lock().timeouts += 1;
                    PipelineError::TransportTimeout(self.timeout.as_millis() as u64)
                }
            };

            warn!(
                "Decision request for '{}' failed (attempt {}/{}): {}",
                source, attempt, self.attempts, err
            );
            self.recovery
                .handle_communication_error(&format!("attempt {} for '{}': {}", attempt, source, err));

            if attempt < self.attempts {
                self.counters.lock().retries += 1;
                tokio::time::sleep(backoff_delay(self.backoff, self.backoff_cap, attempt)).await;
            }
        }

        {
            let mut counters = self.counters.lock();
            counters.failed += 1;
            counters.fail_mode += 1;
        }
        error!(
            "Decision engine unreachable after {} attempts for '{}', applying fail-{:?}",
            self.attempts, source, self.fail_mode
        );
        self.fail_mode_decision(nonce)
    }

    pub fn stats(&self) -> ConnectorStats {
        let c = self.counters.lock();
        ConnectorStats {
            total_requests: c.total,
            successful_requests: c.successful,
            failed_requests: c.failed,
            retries: c.retries,
            timeouts: c.timeouts,
            rejected_decisions: c.rejected,
            fail_mode_decisions: c.fail_mode,
            success_rate: if c.total > 0 {
                c.successful as f64 / c.total as f64
            } else {
                0.0
            },
            fail_mode: self.fail_mode,
            degraded_state: self.recovery.state(),
        }
    }

    /// An answer that fails authentication is treated as an attack, not as
    /// an outage: it blocks regardless of fail mode.
    fn accept(&self, answer: SignedDecision, nonce: &str, source: &str) -> Decision {
        let reason = if !self.security.verify_decision(&answer) {
            Some("invalid_decision_signature")
        } else if answer.decision.event_ref != nonce {
            Some("decision_mismatch")
        } else {
            None
        };

        match reason {
            None => {
                self.counters.lock().successful += 1;
                self.recovery.handle_success();
                debug!("Decision for '{}': {}", source, answer.decision.verdict);
                answer.decision
            }
            Some(reason) => {
                self.counters.lock().rejected += 1;
                self.recovery
                    .handle_security_error(&format!("{} on decision for '{}'", reason, source));
                warn!("Rejected decision for '{}': {}", source, reason);
                Decision::security_block(nonce, format!("security_violation: {}", reason))
            }
        }
    }

    fn fail_mode_decision(&self, nonce: String) -> Decision {
        let decision = match self.fail_mode {
            FailMode::Open => Decision::allow(nonce, 0.0, "fail-open: connector unavailable"),
            FailMode::Closed => Decision::block(nonce, 1.0, "fail-closed: connector unavailable"),
        };
        decision.with_origin(DecisionOrigin::FailMode)
    }
}
