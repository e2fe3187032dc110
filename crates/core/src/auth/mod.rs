//! Session lifecycle: token claims, proactive refresh and forced re-login

pub mod reauth;
pub mod token;
pub mod token_scheduler;

pub use reauth::ReauthManager;
pub use token::{decode_token_claims, plan_refresh, RefreshPlan, TokenClaims, TokenError};
pub use token_scheduler::TokenLifecycleScheduler;
