//! Proactive session refresh
//!
//! [`TokenLifecycleScheduler`] keeps at most one pending refresh per token.
//! Delays longer than a single timer can hold are covered by a hop-chained
//! [`DelayedTask`]; only the last hop refreshes.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cloudbridge_common::time::{Clock, DelayedTask, HopProgress, SystemClock};
use cloudbridge_domain::{Result, Session, TokenConfig};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::token::{decode_token_claims, plan_refresh, RefreshPlan, TokenError};
use crate::ports::TokenRefresher;

#[derive(Debug, Default)]
struct SchedulerState {
    token: Option<String>,
    scheduled_expiry: Option<DateTime<Utc>>,
    plan: Option<RefreshPlan>,
    chain: Option<DelayedTask>,
}

impl SchedulerState {
    fn has_pending(&self) -> bool {
        self.chain.as_ref().is_some_and(|chain| !chain.is_finished())
    }

    fn clear_chain(&mut self) {
        if let Some(chain) = self.chain.take() {
            chain.cancel();
        }
    }
}

struct SchedulerInner {
    refresher: Arc<dyn TokenRefresher>,
    clock: Arc<dyn Clock>,
    config: TokenConfig,
    state: Mutex<SchedulerState>,
    refresh_in_progress: AtomicBool,
}

/// Clears the in-progress flag when a refresh ends, however it ends.
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SchedulerInner {
    fn schedule(self: &Arc<Self>, token: &str) -> std::result::Result<RefreshPlan, TokenError> {
        if !self.config.proactive_refresh {
            debug!("Proactive refresh disabled; relying on reactive re-authentication");
            let mut state = self.state.lock();
            state.clear_chain();
            state.token = Some(token.to_string());
            state.plan = Some(RefreshPlan::Reactive);
            return Ok(RefreshPlan::Reactive);
        }

        let claims = decode_token_claims(token)?;
        let remaining = claims.remaining_at(self.clock.now());
        let plan = plan_refresh(remaining, self.config.refresh_floor());

        let mut state = self.state.lock();
        state.clear_chain();
        state.token = Some(token.to_string());
        state.scheduled_expiry = Some(claims.expires_at);
        state.plan = Some(plan);

        match plan {
            RefreshPlan::Reactive => {
                info!(
                    expires_at = %claims.expires_at,
                    remaining_mins = remaining.as_secs() / 60,
                    "Session expires within the hour; not scheduling a proactive refresh"
                );
            }
            RefreshPlan::Scheduled { refresh_in, lead } => {
                info!(
                    expires_at = %claims.expires_at,
                    refresh_in_hours = refresh_in.as_secs_f64() / 3600.0,
                    lead_hours = lead.as_secs_f64() / 3600.0,
                    "Scheduled proactive session refresh"
                );
                state.chain = Some(self.spawn_chain(refresh_in));
            }
        }
        Ok(plan)
    }

    fn spawn_chain(self: &Arc<Self>, delay: Duration) -> DelayedTask {
        let hook_inner = Arc::downgrade(self);
        let task_inner = Arc::downgrade(self);

        DelayedTask::spawn_with_hop_hook(
            delay,
            self.config.max_timer_hop(),
            move |progress: HopProgress| {
                let Some(inner) = hook_inner.upgrade() else {
                    return ControlFlow::Break(());
                };
                if inner.refresh_in_progress.load(Ordering::SeqCst) {
                    info!(hop = progress.hop, "Refresh already in progress; dropping pending refresh chain");
                    return ControlFlow::Break(());
                }
                debug!(
                    hop = progress.hop,
                    remaining_hours = progress.remaining.as_secs_f64() / 3600.0,
                    "Refresh timer hop elapsed"
                );
                ControlFlow::Continue(())
            },
            move || async move {
                if let Some(inner) = Weak::upgrade(&task_inner) {
                    if let Err(err) = inner.run_refresh().await {
                        error!(error = %err, "Proactive session refresh failed");
                    }
                }
            },
        )
    }

    fn on_token_change(self: &Arc<Self>, token: &str) -> std::result::Result<RefreshPlan, TokenError> {
        {
            let state = self.state.lock();
            if state.token.as_deref() == Some(token) && state.has_pending() {
                debug!("Token unchanged and refresh already pending; keeping existing schedule");
                return Ok(state.plan.unwrap_or(RefreshPlan::Reactive));
            }
        }
        self.schedule(token)
    }

    async fn run_refresh(self: &Arc<Self>) -> Result<Option<Session>> {
        if self
            .refresh_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("Session refresh already in progress; skipping");
            return Ok(None);
        }
        let _guard = RefreshGuard(&self.refresh_in_progress);

        info!("Refreshing session");
        let session = self.refresher.refresh().await?;
        info!(expires_at = %session.expires_at, "Session refreshed");

        if let Err(err) = self.on_token_change(&session.token) {
            warn!(error = %err, "Refreshed token could not be decoded; relying on reactive re-authentication");
        }
        Ok(Some(session))
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        if state.has_pending() {
            info!("Cancelling pending session refresh");
        }
        *state = SchedulerState::default();
    }
}

/// Schedules session refreshes ahead of expiry
#[derive(Clone)]
pub struct TokenLifecycleScheduler {
    inner: Arc<SchedulerInner>,
}

impl TokenLifecycleScheduler {
    pub fn new(refresher: Arc<dyn TokenRefresher>, config: TokenConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                refresher,
                clock,
                config,
                state: Mutex::new(SchedulerState::default()),
                refresh_in_progress: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_system_clock(refresher: Arc<dyn TokenRefresher>, config: TokenConfig) -> Self {
        Self::new(refresher, config, Arc::new(SystemClock))
    }

    /// Plan a refresh for `token`, replacing any pending one.
    ///
    /// # Errors
    /// `TokenError` if the token's expiry cannot be decoded. Any previous
    /// schedule is left untouched in that case.
    pub fn schedule_proactive_refresh(&self, token: &str) -> std::result::Result<RefreshPlan, TokenError> {
        self.inner.schedule(token)
    }

    /// React to a new token. A repeat of the current token is ignored while
    /// its refresh is still pending.
    ///
    /// # Errors
    /// `TokenError` if the token's expiry cannot be decoded.
    pub fn on_token_change(&self, token: &str) -> std::result::Result<RefreshPlan, TokenError> {
        self.inner.on_token_change(token)
    }

    /// Refresh now. `Ok(None)` if a refresh is already running.
    ///
    /// # Errors
    /// The refresher's error.
    pub async fn force_refresh(&self) -> Result<Option<Session>> {
        self.inner.run_refresh().await
    }

    /// Drop the pending refresh and forget the current token.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Reschedule whenever a new session is published; cancel on logout.
    ///
    /// The task ends when the sender is dropped or the scheduler is.
    pub fn follow_sessions(&self, mut sessions: watch::Receiver<Option<Session>>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while sessions.changed().await.is_ok() {
                let session = sessions.borrow_and_update().clone();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match session {
                    Some(session) => {
                        if let Err(err) = inner.on_token_change(&session.token) {
                            warn!(error = %err, "Published token could not be decoded; relying on reactive re-authentication");
                        }
                    }
                    None => inner.cancel(),
                }
            }
            debug!("Session follower stopped");
        })
    }

    pub fn scheduled_expiry(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().scheduled_expiry
    }

    pub fn current_plan(&self) -> Option<RefreshPlan> {
        self.inner.state.lock().plan
    }

    /// Delay not yet covered by the pending chain's hops.
    pub fn remaining_delay(&self) -> Option<Duration> {
        let state = self.inner.state.lock();
        state.chain.as_ref().filter(|_| state.has_pending()).map(DelayedTask::remaining)
    }

    pub fn hops_completed(&self) -> u32 {
        self.inner.state.lock().chain.as_ref().map_or(0, DelayedTask::hops_completed)
    }

    pub fn has_pending_refresh(&self) -> bool {
        self.inner.state.lock().has_pending()
    }

    pub fn is_refresh_in_progress(&self) -> bool {
        self.inner.refresh_in_progress.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TokenLifecycleScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TokenLifecycleScheduler")
            .field("scheduled_expiry", &state.scheduled_expiry)
            .field("plan", &state.plan)
            .field("pending", &state.has_pending())
            .field("refresh_in_progress", &self.is_refresh_in_progress())
            .finish()
    }
}
