//! Adaptive polling per device class

pub mod manager;

pub use manager::{compute_interval, PollStatus, PollingError, PollingManager};
