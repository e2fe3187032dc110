//! Daily API call budget
//!
//! The provider enforces a hard daily ceiling that scales with the number of
//! devices on the account. [`QuotaManager`] tracks calls against a slightly
//! lower budget and tells the governor whether a call may go out. Exhaustion
//! is a `false` answer, never an error.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use cloudbridge_common::time::{Clock, SystemClock};
use cloudbridge_domain::QuotaConfig;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

/// Usage levels (percent of the daily quota) that trigger a warning.
const WARNING_THRESHOLDS: [u64; 3] = [90, 95, 100];

/// `floor((base + per_device * device_count) * buffer)`
pub fn compute_daily_quota(base: u64, per_device: u64, buffer: f64, device_count: usize) -> u64 {
    let ceiling = base.saturating_add(per_device.saturating_mul(device_count as u64));
    // 1e-9 absorbs binary rounding of fractions like 0.95
    (ceiling as f64 * buffer + 1e-9).floor() as u64
}

/// Point-in-time view of the budget
#[derive(Debug, Clone, PartialEq)]
pub struct CallBudget {
    pub date: NaiveDate,
    pub call_count: u64,
    pub daily_quota: u64,
    pub device_count: usize,
    /// Calls since the last (re-)authentication.
    pub session_calls: u64,
    pub session_started: DateTime<Utc>,
}

impl CallBudget {
    pub fn remaining(&self) -> u64 {
        self.daily_quota.saturating_sub(self.call_count)
    }

    pub fn usage_percent(&self) -> f64 {
        if self.daily_quota == 0 {
            return 100.0;
        }
        self.call_count as f64 * 100.0 / self.daily_quota as f64
    }
}

#[derive(Debug)]
struct QuotaState {
    date: NaiveDate,
    call_count: u64,
    daily_quota: u64,
    device_count: usize,
    /// Highest threshold already warned about today (index into
    /// `WARNING_THRESHOLDS` plus one; zero means none).
    warned_level: usize,
    last_summary: DateTime<Utc>,
    session_calls: u64,
    session_started: DateTime<Utc>,
}

/// Process-wide daily call budget
pub struct QuotaManager {
    config: QuotaConfig,
    priority_methods: HashSet<String>,
    clock: Arc<dyn Clock>,
    state: Mutex<QuotaState>,
}

impl QuotaManager {
    /// Create a manager for an empty fleet.
    pub fn new(config: QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let daily_quota =
            compute_daily_quota(config.base_quota, config.per_device_quota, config.buffer_fraction, 0);
        let priority_methods = config.priority_methods.iter().cloned().collect();

        Self {
            priority_methods,
            state: Mutex::new(QuotaState {
                date: clock.local_date(),
                call_count: 0,
                daily_quota,
                device_count: 0,
                warned_level: 0,
                last_summary: now,
                session_calls: 0,
                session_started: now,
            }),
            config,
            clock,
        }
    }

    pub fn with_system_clock(config: QuotaConfig) -> Self {
        Self::new(config, Arc::new(SystemClock))
    }

    /// Whether `method` may go out now.
    ///
    /// Checks for a local-day rollover first, so the counter resets even if
    /// the process sat idle across midnight.
    pub fn can_make_call(&self, method: &str) -> bool {
        let mut state = self.state.lock();
        self.roll_over_if_needed(&mut state);
        self.admits(&state, method)
    }

    /// Check and count one outgoing call under a single lock.
    ///
    /// Returns `false` without counting when the call is refused, so
    /// concurrent dispatchers can never push the count past the quota with
    /// ordinary calls.
    pub fn try_acquire(&self, method: &str) -> bool {
        let mut state = self.state.lock();
        self.roll_over_if_needed(&mut state);
        if !self.admits(&state, method) {
            return false;
        }
        self.count_call(&mut state, method);
        true
    }

    fn admits(&self, state: &QuotaState, method: &str) -> bool {
        if state.call_count < state.daily_quota {
            return true;
        }

        if self.is_priority(method) {
            warn!(
                method,
                call_count = state.call_count,
                daily_quota = state.daily_quota,
                "Daily quota exhausted; allowing priority method"
            );
            true
        } else {
            warn!(
                method,
                call_count = state.call_count,
                daily_quota = state.daily_quota,
                "Daily quota exhausted; call denied"
            );
            false
        }
    }

    /// Count one outgoing call.
    pub fn record_call(&self, method: &str) {
        let mut state = self.state.lock();
        self.roll_over_if_needed(&mut state);
        self.count_call(&mut state, method);
    }

    fn count_call(&self, state: &mut QuotaState, method: &str) {
        state.call_count += 1;
        state.session_calls += 1;
        debug!(method, call_count = state.call_count, "Recorded API call");

        self.warn_on_threshold(state);
        self.maybe_log_summary(state);
    }

    /// Recompute the quota for a new fleet size.
    pub fn update_device_count(&self, device_count: usize) {
        let mut state = self.state.lock();
        if state.device_count == device_count {
            return;
        }

        let daily_quota = compute_daily_quota(
            self.config.base_quota,
            self.config.per_device_quota,
            self.config.buffer_fraction,
            device_count,
        );
        info!(
            previous_devices = state.device_count,
            device_count,
            daily_quota,
            "Device count changed; daily quota recomputed"
        );
        state.device_count = device_count;
        state.daily_quota = daily_quota;
        state.warned_level = state.warned_level.min(level_for(state.call_count, daily_quota));
    }

    /// Reset per-session counters after a re-login. Daily counters are kept.
    pub fn on_reauthenticated(&self) {
        let mut state = self.state.lock();
        info!(
            session_calls = state.session_calls,
            call_count = state.call_count,
            "Session renewed; resetting session call counter"
        );
        state.session_calls = 0;
        state.session_started = self.clock.now();
    }

    pub fn is_priority(&self, method: &str) -> bool {
        self.priority_methods.contains(method)
    }

    pub fn remaining(&self) -> u64 {
        self.snapshot().remaining()
    }

    pub fn snapshot(&self) -> CallBudget {
        let mut state = self.state.lock();
        self.roll_over_if_needed(&mut state);
        CallBudget {
            date: state.date,
            call_count: state.call_count,
            daily_quota: state.daily_quota,
            device_count: state.device_count,
            session_calls: state.session_calls,
            session_started: state.session_started,
        }
    }

    fn roll_over_if_needed(&self, state: &mut QuotaState) {
        let today = self.clock.local_date();
        if today == state.date {
            return;
        }
        info!(
            previous_date = %state.date,
            date = %today,
            calls_yesterday = state.call_count,
            "Local day changed; resetting daily call counter"
        );
        state.date = today;
        state.call_count = 0;
        state.warned_level = 0;
    }

    fn warn_on_threshold(&self, state: &mut QuotaState) {
        let level = level_for(state.call_count, state.daily_quota);
        if level <= state.warned_level {
            return;
        }
        state.warned_level = level;

        let threshold = WARNING_THRESHOLDS[level - 1];
        if threshold >= 100 {
            error!(
                call_count = state.call_count,
                daily_quota = state.daily_quota,
                "Daily API quota reached; only priority methods will be sent"
            );
        } else {
            warn!(
                threshold_percent = threshold,
                call_count = state.call_count,
                daily_quota = state.daily_quota,
                "Daily API quota usage crossed warning threshold"
            );
        }
    }

    fn maybe_log_summary(&self, state: &mut QuotaState) {
        let now = self.clock.now();
        let interval = chrono::Duration::from_std(self.config.summary_interval())
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        if now - state.last_summary < interval {
            return;
        }
        state.last_summary = now;
        info!(
            call_count = state.call_count,
            daily_quota = state.daily_quota,
            remaining = state.daily_quota.saturating_sub(state.call_count),
            device_count = state.device_count,
            "API quota summary"
        );
    }

    /// Interval between periodic budget summaries.
    pub fn summary_interval(&self) -> Duration {
        self.config.summary_interval()
    }
}

impl std::fmt::Debug for QuotaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaManager").field("state", &*self.state.lock()).finish_non_exhaustive()
    }
}

fn level_for(call_count: u64, daily_quota: u64) -> usize {
    if daily_quota == 0 {
        return WARNING_THRESHOLDS.len();
    }
    WARNING_THRESHOLDS
        .iter()
        .take_while(|threshold| call_count.saturating_mul(100) >= **threshold * daily_quota)
        .count()
}
