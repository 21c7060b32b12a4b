use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use super::queue::Occupancy;
use crate::config::PipelineConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackpressureSignal {
    pub active: bool,
    pub recommended_rate: f64,
    pub queue_utilization: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackpressureStats {
    pub active: bool,
    pub last_utilization: f64,
    pub total_checks: u64,
    pub activations: u64,
    pub sampling_rate: f64,
}

#[derive(Debug, Default)]
struct ControllerState {
    active: bool,
    last_utilization: f64,
    total_checks: u64,
    activations: u64,
}

/// Turns queue occupancy into an advisory sampling rate. It never changes
/// producer configuration itself.
pub struct BackpressureController {
    threshold: f64,
    floor_rate: f64,
    sampling_rate: f64,
    state: Mutex<ControllerState>,
}

impl BackpressureController {
    pub fn new(threshold: f64, sampling_rate: f64, floor_rate: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            floor_rate: floor_rate.max(0.0),
            sampling_rate: sampling_rate.clamp(0.0, 1.0),
            state: Mutex::new(ControllerState::default()),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.backpressure_threshold,
            config.sampling_rate,
            config.backpressure_floor_rate,
        )
    }

    pub fn check_and_signal(&self, queue: &impl Occupancy) -> BackpressureSignal {
        let utilization = queue.size() as f64 / queue.capacity().max(1) as f64;
        let active = utilization >= self.threshold;

        {
            let mut state = self.state.lock();
            state.total_checks += 1;
            state.last_utilization = utilization;
            if active && !state.active {
                state.activations += 1;
                warn!("Backpressure activated (utilization: {:.1}%)", utilization * 100.0);
            } else if !active && state.active {
                info!("Backpressure deactivated (utilization: {:.1}%)", utilization * 100.0);
            }
            state.active = active;
        }

        BackpressureSignal {
            active,
            recommended_rate: self.recommended_rate(utilization),
            queue_utilization: utilization,
            reason: if active {
                format!("Queue utilization high: {:.1}%", utilization * 100.0)
            } else {
                "Normal operation".to_string()
            },
        }
    }

    /// Linear ramp from the configured sampling rate at the threshold down to
    /// the floor at full occupancy. Below the threshold the configured rate is
    /// returned unchanged.
    pub fn recommended_rate(&self, utilization: f64) -> f64 {
        if utilization < self.threshold {
            return self.sampling_rate;
        }
        // The floor must sit strictly below the base rate for the ramp to decrease.
        let floor = self.floor_rate.min(self.sampling_rate * 0.5);
        let span = 1.0 - self.threshold;
        if span <= f64::EPSILON {
            return floor;
        }
        let progress = ((utilization - self.threshold) / span).clamp(0.0, 1.0);
        self.sampling_rate - (self.sampling_rate - floor) * progress
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn stats(&self) -> BackpressureStats {
        let state = self.state.lock();
        BackpressureStats {
            active: state.active,
            last_utilization: state.last_utilization,
            total_checks: state.total_checks,
            activations: state.activations,
            sampling_rate: self.sampling_rate,
        }
    }
}
