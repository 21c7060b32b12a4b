//! Admission stage: rate limiting, the bounded event queue and the
//! backpressure signal derived from it.

pub mod backpressure;
pub mod queue;
pub mod rate_limiter;

pub use backpressure::{BackpressureController, BackpressureSignal, BackpressureStats};
pub use queue::{EnqueueResult, EventQueue, Occupancy, QueueStats};
pub use rate_limiter::{RateLimiter, RateLimiterStats};
