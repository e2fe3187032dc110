//! Cancellable delayed tasks with hop chaining
//!
//! A single timer has a bounded realizable duration, while credentials live
//! for weeks. [`DelayedTask`] hides that limit: it covers the requested delay
//! with successive sleeps ("hops") of at most `max_hop` each, and runs the task
//! only after the final hop. Callers get one cancellable handle for the whole
//! chain.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A timer handle that can be used to cancel a timer
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    /// Create a new timer handle
    pub fn new() -> Self {
        Self { token: CancellationToken::new() }
    }

    /// Cancel the timer
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check if the timer has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Reported to the hop hook after each intermediate hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopProgress {
    /// Number of hops completed so far (1-based).
    pub hop: u32,
    /// Delay still to be covered before the task fires.
    pub remaining: Duration,
}

#[derive(Debug, Default)]
struct ChainState {
    uncovered_ms: AtomicU64,
    hops: AtomicU32,
    fired: AtomicBool,
}

/// A task scheduled to run once after a possibly very long delay
pub struct DelayedTask {
    handle: TimerHandle,
    state: Arc<ChainState>,
    join: JoinHandle<()>,
    delay: Duration,
}

impl DelayedTask {
    /// Schedule `task` to run after `delay`, sleeping at most `max_hop` at a
    /// time.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(delay: Duration, max_hop: Duration, task: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_with_hop_hook(delay, max_hop, |_| ControlFlow::Continue(()), task)
    }

    /// Like [`DelayedTask::spawn`], calling `on_hop` between hops.
    ///
    /// Returning `ControlFlow::Break(())` from the hook ends the chain without
    /// running the task.
    pub fn spawn_with_hop_hook<H, F, Fut>(
        delay: Duration,
        max_hop: Duration,
        mut on_hop: H,
        task: F,
    ) -> Self
    where
        H: FnMut(HopProgress) -> ControlFlow<()> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = TimerHandle::new();
        let state = Arc::new(ChainState::default());
        let max_hop = max_hop.max(Duration::from_millis(1));

        let chain_handle = handle.clone();
        let chain_state = Arc::clone(&state);
        let join = tokio::spawn(async move {
            let mut remaining = delay;
            loop {
                let hop = remaining.min(max_hop);
                chain_state
                    .uncovered_ms
                    .store(duration_ms(remaining.saturating_sub(hop)), Ordering::SeqCst);

                tokio::select! {
                    () = chain_handle.cancelled() => {
                        debug!("Delayed task cancelled");
                        return;
                    }
                    () = sleep(hop) => {}
                }

                remaining = remaining.saturating_sub(hop);
                let hops = chain_state.hops.fetch_add(1, Ordering::SeqCst) + 1;
                if remaining.is_zero() {
                    break;
                }

                debug!(hop = hops, remaining_ms = duration_ms(remaining), "Timer hop elapsed");
                if on_hop(HopProgress { hop: hops, remaining }).is_break() {
                    debug!(hop = hops, "Timer chain stopped by hop hook");
                    return;
                }
            }

            if chain_handle.is_cancelled() {
                return;
            }
            chain_state.fired.store(true, Ordering::SeqCst);
            task().await;
        });

        Self { handle, state, join, delay }
    }

    /// Get a handle to cancel the chain
    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    /// Cancel the chain; a no-op once the task has fired.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Total delay requested at spawn time.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Portion of the delay not yet covered by an active or completed hop.
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.state.uncovered_ms.load(Ordering::SeqCst))
    }

    /// Number of hops that have elapsed.
    pub fn hops_completed(&self) -> u32 {
        self.state.hops.load(Ordering::SeqCst)
    }

    /// Whether the final hop elapsed and the task was started.
    pub fn has_fired(&self) -> bool {
        self.state.fired.load(Ordering::SeqCst)
    }

    /// Whether the chain has ended (fired, cancelled or stopped by the hook).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        // A replaced chain must not fire after its owner forgot about it.
        if !self.has_fired() {
            self.handle.cancel();
        }
    }
}

impl std::fmt::Debug for DelayedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedTask")
            .field("delay", &self.delay)
            .field("remaining", &self.remaining())
            .field("hops_completed", &self.hops_completed())
            .field("fired", &self.has_fired())
            .finish()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
