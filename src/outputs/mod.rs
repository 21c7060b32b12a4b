pub mod effector;

pub use effector::{Effector, EffectorStats, LoggingEffector};
