//! Adaptive, self-rescheduling poll loop for one device class
//!
//! The loop runs the callback, waits for it to finish, recomputes the
//! interval and only then arms the next single-shot sleep. A slow callback
//! therefore stretches the cycle instead of overlapping with the next poll.
//!
//! Interval: `base`, times `inactive_multiplier` when dynamic polling is on
//! and nothing in the class is active, times `error_penalty` after a failed
//! poll, clamped to `[min, max]`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cloudbridge_domain::{BridgeError, PollingConfig};
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Polling errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PollingError {
    /// The poll loop is already running
    #[error("poll loop for `{0}` is already running")]
    AlreadyRunning(String),

    /// A stopped loop is still finishing its last poll
    #[error("poll loop for `{0}` is still finishing its last poll")]
    StillStopping(String),
}

/// Lifecycle of a poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Constructed, never started
    Idle,
    /// Running a poll or waiting for the next one
    Polling,
    /// Recomputing the interval after an activity transition or a poll
    Adjusting,
    Stopped,
}

/// Next interval for the given activity and error state.
///
/// Never panics: a non-finite product falls back to the base interval and an
/// inverted `[min, max]` range resolves to `max`.
pub fn compute_interval(config: &PollingConfig, any_active: bool, last_failed: bool) -> Duration {
    let base = config.base_interval_secs as f64;
    let mut secs = base;
    if config.dynamic_polling && !any_active {
        secs *= config.inactive_multiplier;
    }
    if last_failed {
        secs *= config.error_penalty;
    }
    if !secs.is_finite() {
        secs = base;
    }
    let bounded = secs.max(config.min_interval_secs as f64).min(config.max_interval_secs as f64);
    Duration::try_from_secs_f64(bounded).unwrap_or_else(|_| config.max_interval())
}

#[derive(Debug)]
struct PollState {
    status: PollStatus,
    current_interval: Duration,
    is_active: bool,
    last_failed: bool,
    last_poll_at: Option<DateTime<Utc>>,
    /// Monotonic completion time of the last poll; the next deadline is
    /// measured from here.
    last_completed: Option<Instant>,
    poll_count: u64,
    error_count: u64,
}

struct PollInner {
    name: String,
    config: PollingConfig,
    state: Mutex<PollState>,
    rearm: Notify,
}

impl PollInner {
    fn set_status(&self, status: PollStatus) {
        self.state.lock().status = status;
    }

    /// Record a finished poll and return the next interval.
    fn finish_poll(&self, failed: bool) -> Duration {
        let mut state = self.state.lock();
        let stopped = state.status == PollStatus::Stopped;
        if !stopped {
            state.status = PollStatus::Adjusting;
        }
        state.poll_count += 1;
        if failed {
            state.error_count += 1;
        }
        state.last_failed = failed;
        state.last_poll_at = Some(Utc::now());
        state.last_completed = Some(Instant::now());

        let interval = compute_interval(&self.config, state.is_active, failed);
        if interval != state.current_interval {
            debug!(
                device_class = %self.name,
                previous_secs = state.current_interval.as_secs_f64(),
                interval_secs = interval.as_secs_f64(),
                "Poll interval adjusted"
            );
        }
        state.current_interval = interval;
        if !stopped {
            state.status = PollStatus::Polling;
        }
        interval
    }

    fn next_deadline(&self) -> Instant {
        let state = self.state.lock();
        state.last_completed.unwrap_or_else(Instant::now) + state.current_interval
    }
}

/// Self-rescheduling poller for one device class
pub struct PollingManager {
    inner: Arc<PollInner>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PollingManager {
    /// Create an idle manager. Devices start out active so a new class is
    /// polled at the base interval until told otherwise.
    pub fn new(name: impl Into<String>, config: PollingConfig) -> Self {
        let name = name.into();
        if let Err(err) = config.validate() {
            warn!(device_class = %name, error = %err, "Polling config is invalid; intervals will be bounded");
        }
        let current_interval = compute_interval(&config, true, false);
        Self {
            inner: Arc::new(PollInner {
                name,
                config,
                state: Mutex::new(PollState {
                    status: PollStatus::Idle,
                    current_interval,
                    is_active: true,
                    last_failed: false,
                    last_poll_at: None,
                    last_completed: None,
                    poll_count: 0,
                    error_count: 0,
                }),
                rearm: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Start the loop. `callback` runs immediately, then after every
    /// interval. Errors and panics from `callback` are logged and widen the
    /// interval; they never stop the loop.
    ///
    /// # Errors
    /// `PollingError::AlreadyRunning` if the loop is running,
    /// `PollingError::StillStopping` if a stopped loop's last poll has not
    /// returned yet.
    pub fn start_polling<F, Fut>(&self, callback: F) -> Result<(), PollingError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BridgeError>> + Send + 'static,
    {
        let mut task = self.task.lock();
        if let Some((cancel, handle)) = task.as_ref() {
            if !handle.is_finished() {
                let name = self.inner.name.clone();
                return Err(if cancel.is_cancelled() {
                    PollingError::StillStopping(name)
                } else {
                    PollingError::AlreadyRunning(name)
                });
            }
        }

        info!(device_class = %self.inner.name, "Starting poll loop");
        self.inner.set_status(PollStatus::Polling);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::poll_loop(Arc::clone(&self.inner), callback, cancel.clone()));
        *task = Some((cancel, handle));
        Ok(())
    }

    /// Cancel the pending poll. Idempotent. A poll already in progress runs
    /// to completion but is not rescheduled.
    pub fn stop_polling(&self) {
        let task = self.task.lock();
        let Some((cancel, _)) = task.as_ref().filter(|(cancel, _)| !cancel.is_cancelled()) else {
            return;
        };
        self.inner.set_status(PollStatus::Stopped);
        cancel.cancel();
        info!(device_class = %self.inner.name, "Poll loop stopped");
    }

    /// Report whether any device in the class is active.
    ///
    /// Only a transition recomputes the interval; a running loop re-arms its
    /// pending sleep with the new value.
    pub fn update_device_state(&self, is_active: bool) {
        let mut state = self.inner.state.lock();
        if state.is_active == is_active {
            return;
        }

        let running = matches!(state.status, PollStatus::Polling);
        if running {
            state.status = PollStatus::Adjusting;
        }
        state.is_active = is_active;
        let interval = compute_interval(&self.inner.config, is_active, state.last_failed);
        info!(
            device_class = %self.inner.name,
            is_active,
            interval_secs = interval.as_secs_f64(),
            "Device activity changed; poll interval recomputed"
        );
        state.current_interval = interval;

        if running {
            state.status = PollStatus::Polling;
            drop(state);
            self.inner.rearm.notify_one();
        }
    }

    pub fn status(&self) -> PollStatus {
        self.inner.state.lock().status
    }

    /// `true` while a started loop has neither been stopped nor exited.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|(cancel, handle)| !cancel.is_cancelled() && !handle.is_finished())
    }

    pub fn current_interval(&self) -> Duration {
        self.inner.state.lock().current_interval
    }

    pub fn poll_count(&self) -> u64 {
        self.inner.state.lock().poll_count
    }

    pub fn error_count(&self) -> u64 {
        self.inner.state.lock().error_count
    }

    pub fn last_poll_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().last_poll_at
    }

    async fn poll_loop<F, Fut>(inner: Arc<PollInner>, callback: F, cancel: CancellationToken)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BridgeError>> + Send + 'static,
    {
        loop {
            let failed = match AssertUnwindSafe(callback()).catch_unwind().await {
                Ok(Ok(())) => false,
                Ok(Err(err)) => {
                    warn!(device_class = %inner.name, error = %err, "Poll failed; keeping last known state");
                    true
                }
                Err(_) => {
                    error!(device_class = %inner.name, "Poll callback panicked");
                    true
                }
            };

            if cancel.is_cancelled() {
                debug!(device_class = %inner.name, "Poll loop stopped during a poll");
                return;
            }

            let interval = inner.finish_poll(failed);
            debug!(
                device_class = %inner.name,
                interval_secs = interval.as_secs_f64(),
                "Next poll scheduled"
            );

            let mut deadline = inner.next_deadline();
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(device_class = %inner.name, "Poll loop cancelled");
                        return;
                    }
                    () = sleep_until(deadline) => break,
                    () = inner.rearm.notified() => {
                        deadline = inner.next_deadline();
                        debug!(device_class = %inner.name, "Pending poll re-armed");
                    }
                }
            }
        }
    }
}

impl Drop for PollingManager {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.task.get_mut().take() {
            cancel.cancel();
        }
    }
}

impl std::fmt::Debug for PollingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingManager")
            .field("name", &self.inner.name)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn config() -> PollingConfig {
        PollingConfig::default()
    }

    #[test]
    fn test_compute_interval_rules() {
        let cfg = config();
        assert_eq!(compute_interval(&cfg, true, false), Duration::from_secs(60));
        assert_eq!(compute_interval(&cfg, false, false), Duration::from_secs(180));
        assert_eq!(compute_interval(&cfg, true, true), Duration::from_secs(90));
        assert_eq!(compute_interval(&cfg, false, true), Duration::from_secs(270));

        let fixed = PollingConfig { dynamic_polling: false, ..config() };
        assert_eq!(compute_interval(&fixed, false, false), Duration::from_secs(60));
    }

    #[test]
    fn test_compute_interval_is_clamped() {
        let wide = PollingConfig { base_interval_secs: 500, ..config() };
        assert_eq!(compute_interval(&wide, false, true), Duration::from_secs(900));

        let narrow = PollingConfig { base_interval_secs: 5, ..config() };
        assert_eq!(compute_interval(&narrow, true, false), Duration::from_secs(15));
    }

    #[test]
    fn test_compute_interval_tolerates_invalid_config() {
        let nan = PollingConfig { inactive_multiplier: f64::NAN, ..config() };
        assert_eq!(compute_interval(&nan, false, false), Duration::from_secs(60));

        let inverted = PollingConfig { min_interval_secs: 600, max_interval_secs: 60, ..config() };
        assert_eq!(compute_interval(&inverted, true, false), Duration::from_secs(60));

        let unbounded = PollingConfig { max_interval_secs: u64::MAX, error_penalty: 1e30, ..config() };
        assert_eq!(compute_interval(&unbounded, true, true), Duration::from_secs(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_change_with_nan_multiplier_keeps_base_interval() {
        let manager =
            PollingManager::new("heater", PollingConfig { inactive_multiplier: f64::NAN, ..config() });

        manager.update_device_state(false);

        assert_eq!(manager.current_interval(), Duration::from_secs(60));
    }

    /// Validates that stopping during a slow poll leaves the loop stopped and
    /// that no second loop can overlap the unfinished poll.
    ///
    /// # Test Steps
    /// 1. Start a loop whose callback takes five seconds
    /// 2. Stop it while the first poll is still running
    /// 3. Verify a restart is refused until that poll returns
    /// 4. Verify the status stays `Stopped` and the poll is not rescheduled
    #[tokio::test(start_paused = true)]
    async fn test_stop_during_slow_poll_stays_stopped() {
        let manager = PollingManager::new("thermostat", config());
        let polls = Arc::new(AtomicU32::new(0));

        let p = Arc::clone(&polls);
        manager
            .start_polling(move || {
                p.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        manager.stop_polling();
        assert!(!manager.is_running());
        assert_eq!(
            manager.start_polling(|| async { Ok(()) }),
            Err(PollingError::StillStopping("thermostat".to_string()))
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(manager.status(), PollStatus::Stopped);
        assert_eq!(manager.poll_count(), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 1);

        manager.start_polling(|| async { Ok(()) }).unwrap();
        assert_eq!(manager.status(), PollStatus::Polling);
        manager.stop_polling();
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_immediately_then_on_interval() {
        let manager = PollingManager::new("outlet", config());
        let polls = Arc::new(AtomicU32::new(0));

        let p = Arc::clone(&polls);
        manager
            .start_polling(move || {
                p.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status(), PollStatus::Polling);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 2);
        assert!(manager.last_poll_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected() {
        let manager = PollingManager::new("bulb", config());
        manager.start_polling(|| async { Ok(()) }).unwrap();

        assert_eq!(
            manager.start_polling(|| async { Ok(()) }),
            Err(PollingError::AlreadyRunning("bulb".to_string()))
        );
        manager.stop_polling();
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_and_panics_are_contained() {
        let manager = PollingManager::new("fan", config());
        let polls = Arc::new(AtomicU32::new(0));

        let p = Arc::clone(&polls);
        manager
            .start_polling(move || {
                let n = p.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 => Err(BridgeError::Network("timeout".into())),
                        1 => panic!("malformed payload"),
                        _ => Ok(()),
                    }
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.current_interval(), Duration::from_secs(90));

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.error_count(), 2);

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.current_interval(), Duration::from_secs(60));
        assert!(manager.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_transition_rearms_pending_poll() {
        let manager = PollingManager::new("humidifier", config());
        let polls = Arc::new(AtomicU32::new(0));

        let p = Arc::clone(&polls);
        manager
            .start_polling(move || {
                p.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        manager.update_device_state(false);
        assert_eq!(manager.current_interval(), Duration::from_secs(180));

        // The original 60s deadline no longer applies.
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 1);

        // Waking up again pulls the next poll back to 60s after the last one.
        manager.update_device_state(true);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_state_is_not_a_transition() {
        let manager = PollingManager::new("purifier", config());
        manager.update_device_state(true);
        assert_eq!(manager.current_interval(), Duration::from_secs(60));
        assert_eq!(manager.status(), PollStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_halts_polling() {
        let manager = PollingManager::new("outlet", config());
        let polls = Arc::new(AtomicU32::new(0));

        let p = Arc::clone(&polls);
        manager
            .start_polling(move || {
                p.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        manager.stop_polling();
        manager.stop_polling();
        assert_eq!(manager.status(), PollStatus::Stopped);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert!(!manager.is_running());

        manager.start_polling(|| async { Ok(()) }).unwrap();
        assert!(manager.is_running());
        manager.stop_polling();
    }
}
