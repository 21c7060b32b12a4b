//! The decision side of the trust boundary and the connector that reaches it.

pub mod audit;
pub mod baseline;
pub mod connector;
pub mod engine;
pub mod pattern;

pub use audit::{AuditRecord, AuditSink, AuditTrail, ChainBreak, MemoryAuditSink, TracingAuditSink};
pub use baseline::{AnomalyScorer, Baseline, DeviationScorer};
pub use connector::{BrainConnector, ConnectorStats, DecisionTransport, InProcessTransport};
pub use engine::{Assessment, DecisionEngine, EngineStats};
pub use pattern::{PatternCache, PatternCacheStats};
