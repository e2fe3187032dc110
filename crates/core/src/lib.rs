//! # Cloudbridge Core
//!
//! Call governance for a rate-limited device cloud.
//!
//! This crate contains:
//! - Daily quota accounting, global call spacing, debounce and retry
//! - A governed view of the device-cloud client
//! - Adaptive per-class polling
//! - Session lifecycle: proactive refresh and forced re-login
//! - Port interfaces (traits) for the client, login flow and session store
//!
//! ## Architecture Principles
//! - Depends on `cloudbridge-common` and `cloudbridge-domain` only
//! - No HTTP, filesystem or platform code
//! - All external collaborators via traits
//! - Wall-clock reads go through `Clock`; delays through tokio time

pub mod auth;
pub mod context;
pub mod governance;
pub mod polling;
pub mod ports;

// Re-export specific items to avoid ambiguity
pub use auth::{
    decode_token_claims, plan_refresh, ReauthManager, RefreshPlan, TokenClaims, TokenError,
    TokenLifecycleScheduler,
};
pub use context::GovernanceContext;
pub use governance::{
    compute_daily_quota, CallBudget, CallGovernor, CallKey, CallValue, GovernedClient,
    GovernedDevice, QuotaManager,
};
pub use polling::{compute_interval, PollStatus, PollingError, PollingManager};
pub use ports::{Authenticator, DeviceCloudClient, SessionStore, TokenRefresher};
