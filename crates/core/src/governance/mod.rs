//! Call governance: daily quota, global spacing, debounce and retry
//!
//! [`QuotaManager`] owns the daily budget, [`CallGovernor`] applies it to
//! every outgoing call, and [`GovernedClient`] exposes the device-cloud
//! surface with the governor in front of it.

pub mod client;
pub mod governor;
pub mod quota;

pub use client::{GovernedClient, GovernedDevice};
pub use governor::{CallGovernor, CallKey, CallValue};
pub use quota::{compute_daily_quota, CallBudget, QuotaManager};
