pub mod admission;
pub mod brain;
pub mod config;
pub mod error;
pub mod kernel;
pub mod outputs;
pub mod recovery;
pub mod transport;

// Re-export the types most call sites need
pub use config::{FailMode, PipelineConfig};
pub use error::{ConfigError, PipelineError};
pub use kernel::context::{PipelineBuilder, PipelineContext};
pub use kernel::decision::{Decision, DecisionOrigin, SignedDecision, Verdict};
pub use kernel::event::{Outcome, SignedEvent, TelemetryEvent};
pub use kernel::stats::PipelineStats;
pub use kernel::worker::ShutdownReport;
pub use recovery::{DegradedModeState, ErrorRecovery};
