use thiserror::Error;

/// Failure taxonomy of the pipeline.
///
/// `AdmissionRejected` is a control signal rather than a fault. The three
/// security variants always resolve to a block, whatever the fail mode.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("admission rejected for source '{0}'")]
    AdmissionRejected(String),

    #[error("decision engine did not answer within {0}ms")]
    TransportTimeout(u64),

    #[error("decision engine unavailable: {0}")]
    TransportUnavailable(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("replay detected for nonce {0}")]
    ReplayDetected(String),

    #[error("stale event (age {age_s:.1}s exceeds {window_s}s)")]
    StaleEvent { age_s: f64, window_s: u64 },

    #[error("internal pipeline failure: {0}")]
    InternalFailure(String),
}

impl PipelineError {
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidSignature
                | PipelineError::ReplayDetected(_)
                | PipelineError::StaleEvent { .. }
        )
    }

    /// Errors the connector retries and, once exhausted, hands to the fail mode.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PipelineError::TransportTimeout(_)
                | PipelineError::TransportUnavailable(_)
                | PipelineError::InternalFailure(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
