use serde::Serialize;

use super::worker::WorkerStats;
use crate::admission::{BackpressureStats, QueueStats, RateLimiterStats};
use crate::brain::{ConnectorStats, EngineStats};
use crate::outputs::EffectorStats;
use crate::recovery::RecoveryStats;
use crate::transport::ValidatorStats;

/// Instrumentation-boundary counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProducerStats {
    pub calls: u64,
    pub sampled_out: u64,
    pub submitted: u64,
    pub admitted: u64,
    pub rate_limited: u64,
    pub rejected_closed: u64,
    pub internal_failures: u64,
    pub sampling_rate: f64,
}

/// Point-in-time view of every component. Serializes to one JSON document.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub producer: ProducerStats,
    pub rate_limiter: RateLimiterStats,
    pub queue: QueueStats,
    pub backpressure: BackpressureStats,
    pub validator: ValidatorStats,
    pub connector: ConnectorStats,
    pub engine: EngineStats,
    pub recovery: RecoveryStats,
    pub workers: WorkerStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effector: Option<EffectorStats>,
}
