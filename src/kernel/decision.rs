use serde::{Deserialize, Serialize};
use std::fmt;

use super::time::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Block,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow => f.write_str("allow"),
            Verdict::Block => f.write_str("block"),
        }
    }
}

/// What produced a verdict. Used by observers and statistics; not part of the
/// signed wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOrigin {
    /// Baseline comparison (includes training-mode allows).
    Detection,
    /// Signature, replay or freshness failure.
    Security,
    /// Connector gave up and applied the fail mode.
    FailMode,
}

/// Immutable verdict for one SignedEvent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub score: f64,
    pub reason: String,
    /// Nonce of the originating SignedEvent.
    pub event_ref: String,
    #[serde(default = "default_origin")]
    pub origin: DecisionOrigin,
}

impl DecisionOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOrigin::Detection => "detection",
            DecisionOrigin::Security => "security",
            DecisionOrigin::FailMode => "fail_mode",
        }
    }
}

fn default_origin() -> DecisionOrigin {
    DecisionOrigin::Detection
}

impl Decision {
    pub fn allow(event_ref: impl Into<String>, score: f64, reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Allow,
            score,
            reason: reason.into(),
            event_ref: event_ref.into(),
            origin: DecisionOrigin::Detection,
        }
    }

    pub fn block(event_ref: impl Into<String>, score: f64, reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Block,
            score,
            reason: reason.into(),
            event_ref: event_ref.into(),
            origin: DecisionOrigin::Detection,
        }
    }

    /// Security failures always block with the maximum score.
    pub fn security_block(event_ref: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            origin: DecisionOrigin::Security,
            ..Self::block(event_ref, 1.0, reason)
        }
    }

    pub fn with_origin(mut self, origin: DecisionOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn is_allow(&self) -> bool {
        self.verdict == Verdict::Allow
    }

    pub fn is_block(&self) -> bool {
        self.verdict == Verdict::Block
    }
}

/// Decision returned across the trust boundary, signed by the decision side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedDecision {
    pub decision: Decision,
    pub timestamp: Timestamp,
    pub signature: String,
}
