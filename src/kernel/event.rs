use serde::{Deserialize, Serialize};
use std::fmt;

use super::time::Timestamp;

/// How the instrumented call finished. The pipeline only classifies outcomes,
/// it never alters them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "type", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Error,
    /// A panic (or other unwinding failure); carries the panic payload type/message.
    Exception(String),
}

impl Outcome {
    /// Stable tag used by canonical encoding and baseline bucketing.
    pub fn tag(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
            Outcome::Exception(_) => "exception",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, Outcome::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Exception(ty) => write!(f, "exception({})", ty),
            other => f.write_str(other.tag()),
        }
    }
}

/// One observed call. Built once by the instrumentation boundary and never
/// edited afterwards; tampering is caught by the signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Function name of the instrumented call site.
    pub source: String,
    pub timestamp: Timestamp,
    pub duration_ms: f64,
    pub outcome: Outcome,
    /// Already redacted by a `Redactor`; opaque to the pipeline.
    pub args_summary: String,
    pub sequence: u64,
}

impl TelemetryEvent {
    pub fn new(
        source: impl Into<String>,
        timestamp: Timestamp,
        duration_ms: f64,
        outcome: Outcome,
        args_summary: impl Into<String>,
        sequence: u64,
    ) -> Self {
        Self {
            source: source.into(),
            timestamp,
            duration_ms,
            outcome,
            args_summary: args_summary.into(),
            sequence,
        }
    }
}

/// Wire shape crossing the trust boundary between the producer side and the
/// decision side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEvent {
    pub event: TelemetryEvent,
    /// 128-bit random value, lowercase hex.
    pub nonce: String,
    /// Signing time; may differ from `event.timestamp`.
    pub timestamp: Timestamp,
    /// Lowercase hex HMAC-SHA256 over the canonical bytes.
    pub signature: String,
}

impl SignedEvent {
    pub fn source(&self) -> &str {
        &self.event.source
    }
}
