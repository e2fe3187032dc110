//! Rate limiting and call coalescing
//!
//! Every networked call passes through [`CallGovernor::call`]:
//!
//! 1. Methods in the bypass set run directly (no quota, spacing or debounce).
//! 2. A call whose key is already in flight joins the outstanding call.
//! 3. A call whose key settled less than the debounce window ago gets the
//!    cached value.
//! 4. Otherwise the quota is consulted; a denied call yields
//!    [`CallOutcome::Denied`]. An allowed call runs under the retry policy.
//!    Each attempt waits for the global spacing slot, then takes one unit of
//!    quota; an attempt the quota refuses ends the call as `Denied`.
//!
//! Failures are never cached: the entry is dropped so the next call goes out
//! fresh.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use cloudbridge_common::{RetryError, RetryManager};
use cloudbridge_domain::{
    BridgeError, CallOutcome, DeviceDetails, DeviceId, DeviceInfo, GovernorConfig, Result,
};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::quota::QuotaManager;

/// Value produced by a governed call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallValue {
    /// Acknowledgement of a command
    Ack(bool),
    Details(DeviceDetails),
    Devices(Vec<DeviceInfo>),
}

impl CallValue {
    pub fn into_ack(self) -> Result<bool> {
        match self {
            Self::Ack(ack) => Ok(ack),
            other => Err(unexpected("ack", &other)),
        }
    }

    pub fn into_details(self) -> Result<DeviceDetails> {
        match self {
            Self::Details(details) => Ok(details),
            other => Err(unexpected("device details", &other)),
        }
    }

    pub fn into_devices(self) -> Result<Vec<DeviceInfo>> {
        match self {
            Self::Devices(devices) => Ok(devices),
            other => Err(unexpected("device list", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &CallValue) -> BridgeError {
    BridgeError::Internal(format!("expected {expected} from governed call, got {got:?}"))
}

/// Debounce key: `method[:device][:json(args)]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey(String);

impl CallKey {
    pub fn new(method: &str, device: Option<&DeviceId>, args: &serde_json::Value) -> Self {
        let mut key = method.to_string();
        if let Some(device) = device {
            key.push(':');
            key.push_str(device.as_str());
        }
        if !args.is_null() {
            key.push(':');
            key.push_str(&args.to_string());
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

type SharedCall = Shared<BoxFuture<'static, Result<CallOutcome<CallValue>>>>;

enum DebounceEntry {
    InFlight {
        generation: u64,
        call: SharedCall,
    },
    Settled {
        generation: u64,
        value: CallValue,
        settled_at: Instant,
        expiry: JoinHandle<()>,
    },
}

impl DebounceEntry {
    fn generation(&self) -> u64 {
        match self {
            Self::InFlight { generation, .. } | Self::Settled { generation, .. } => *generation,
        }
    }
}

enum Lookup {
    Join(SharedCall),
    Cached(CallValue),
    Stale,
    Miss,
}

struct GovernorInner {
    quota: Arc<QuotaManager>,
    retry: RetryManager,
    min_spacing: Duration,
    debounce_window: Duration,
    bypass: HashSet<String>,
    /// Held across the spacing sleep so dispatches queue behind each other.
    last_dispatch: tokio::sync::Mutex<Option<Instant>>,
    entries: Mutex<HashMap<CallKey, DebounceEntry>>,
    generation: AtomicU64,
}

/// Shared rate limiter and debouncer for all device-cloud traffic
///
/// Cheap to clone; clones share quota, spacing slot and debounce cache.
#[derive(Clone)]
pub struct CallGovernor {
    inner: Arc<GovernorInner>,
}

impl CallGovernor {
    pub fn new(config: &GovernorConfig, quota: Arc<QuotaManager>, retry: RetryManager) -> Self {
        Self {
            inner: Arc::new(GovernorInner {
                quota,
                retry,
                min_spacing: config.min_spacing(),
                debounce_window: config.debounce_window(),
                bypass: config.bypass_methods.iter().cloned().collect(),
                last_dispatch: tokio::sync::Mutex::new(None),
                entries: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn quota(&self) -> &Arc<QuotaManager> {
        &self.inner.quota
    }

    pub fn is_bypassed(&self, method: &str) -> bool {
        self.inner.bypass.contains(method)
    }

    /// Run `operation` under quota, spacing, debounce and retry discipline.
    ///
    /// `operation` may be invoked several times (once per retry attempt) and
    /// runs on a spawned task, so the call completes even if every caller
    /// stops waiting.
    ///
    /// # Errors
    /// The final error of the underlying call once retries are exhausted, or
    /// `BridgeError::EmptyResult` when every attempt came back empty.
    pub async fn call<F, Fut>(
        &self,
        method: &str,
        device: Option<&DeviceId>,
        args: serde_json::Value,
        operation: F,
    ) -> Result<CallOutcome<CallValue>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<CallValue>>> + Send + 'static,
    {
        if self.is_bypassed(method) {
            debug!(method, "Bypassing governor for local accessor");
            return operation().await.map(|value| value.map_or(CallOutcome::Empty, CallOutcome::Value));
        }

        let key = CallKey::new(method, device, &args);
        let call = {
            let mut entries = self.inner.entries.lock();

            let lookup = match entries.get(&key) {
                Some(DebounceEntry::InFlight { call, .. }) => Lookup::Join(call.clone()),
                Some(DebounceEntry::Settled { value, settled_at, .. })
                    if settled_at.elapsed() < self.inner.debounce_window =>
                {
                    Lookup::Cached(value.clone())
                }
                Some(DebounceEntry::Settled { .. }) => Lookup::Stale,
                None => Lookup::Miss,
            };

            match lookup {
                Lookup::Join(call) => {
                    debug!(method, key = %key, "Joining in-flight call");
                    call
                }
                Lookup::Cached(value) => {
                    debug!(method, key = %key, "Returning debounced result");
                    return Ok(CallOutcome::Value(value));
                }
                Lookup::Stale | Lookup::Miss => {
                    if let Some(DebounceEntry::Settled { expiry, .. }) = entries.remove(&key) {
                        expiry.abort();
                    }

                    if !self.inner.quota.can_make_call(method) {
                        return Ok(CallOutcome::Denied);
                    }

                    let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
                    let call = self.spawn_call(key.clone(), generation, method.to_string(), operation);
                    entries.insert(key, DebounceEntry::InFlight { generation, call: call.clone() });
                    call
                }
            }
        };

        call.await
    }

    /// Number of calls currently in flight.
    pub fn pending_calls(&self) -> usize {
        self.inner
            .entries
            .lock()
            .values()
            .filter(|entry| matches!(entry, DebounceEntry::InFlight { .. }))
            .count()
    }

    /// Keys holding a settled, still-debounced value.
    pub fn cached_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| matches!(entry, DebounceEntry::Settled { .. }))
            .map(|(key, _)| key.as_str().to_string())
            .collect();
        keys.sort();
        keys
    }

    /// Drop every settled entry. In-flight calls are left to finish.
    pub fn clear_cache(&self) {
        self.inner.entries.lock().retain(|_, entry| match entry {
            DebounceEntry::InFlight { .. } => true,
            DebounceEntry::Settled { expiry, .. } => {
                expiry.abort();
                false
            }
        });
    }

    fn spawn_call<F, Fut>(
        &self,
        key: CallKey,
        generation: u64,
        method: String,
        operation: F,
    ) -> SharedCall
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<CallValue>>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = AssertUnwindSafe(inner.dispatch(&method, operation))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(BridgeError::Internal(format!("governed call `{method}` panicked")))
                });
            GovernorInner::settle(&inner, &key, generation, &result);
            result
        });

        async move {
            task.await.unwrap_or_else(|err| {
                Err(BridgeError::Internal(format!("governed call task failed: {err}")))
            })
        }
        .boxed()
        .shared()
    }
}

/// Why a single attempt did not produce a value
#[derive(Debug, Error)]
enum AttemptError {
    #[error("daily quota exhausted")]
    QuotaDenied,
    #[error(transparent)]
    Call(BridgeError),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::QuotaDenied => false,
            Self::Call(err) => !err.is_session_expired(),
        }
    }
}

impl GovernorInner {
    async fn dispatch<F, Fut>(&self, method: &str, operation: F) -> Result<CallOutcome<CallValue>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<CallValue>>>,
    {
        let this = self;
        let operation = &operation;
        let attempt = move || async move {
            this.wait_for_slot(method).await;
            if !this.quota.try_acquire(method) {
                return Err(AttemptError::QuotaDenied);
            }
            operation().await.map_err(AttemptError::Call)
        };

        match self.retry.execute_if(attempt, method, AttemptError::is_retryable).await {
            Ok(value) => Ok(CallOutcome::Value(value)),
            Err(RetryError::NonRetryable { attempts, last_error: AttemptError::QuotaDenied }) => {
                warn!(method, attempts, "Call stopped: daily quota exhausted");
                Ok(CallOutcome::Denied)
            }
            Err(err) => Err(into_bridge_error(method, err)),
        }
    }

    /// Sleep until `min_spacing` has passed since the previous dispatch.
    async fn wait_for_slot(&self, method: &str) {
        let mut last = self.last_dispatch.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_spacing {
                let wait = self.min_spacing - elapsed;
                debug!(method, wait_ms = wait.as_millis() as u64, "Waiting for global call spacing");
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn settle(
        this: &Arc<Self>,
        key: &CallKey,
        generation: u64,
        result: &Result<CallOutcome<CallValue>>,
    ) {
        let mut entries = this.entries.lock();
        if entries.get(key).map(DebounceEntry::generation) != Some(generation) {
            return;
        }

        match result {
            Ok(CallOutcome::Value(value)) => {
                let expiry = tokio::spawn(Self::expire(
                    Arc::downgrade(this),
                    key.clone(),
                    generation,
                    this.debounce_window,
                ));
                entries.insert(
                    key.clone(),
                    DebounceEntry::Settled {
                        generation,
                        value: value.clone(),
                        settled_at: Instant::now(),
                        expiry,
                    },
                );
            }
            Ok(_) => {
                entries.remove(key);
            }
            Err(err) => {
                entries.remove(key);
                warn!(key = %key, error = %err, "Governed call failed; debounce entry cleared");
            }
        }
    }

    async fn expire(inner: Weak<Self>, key: CallKey, generation: u64, window: Duration) {
        tokio::time::sleep(window).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut entries = inner.entries.lock();
        if let Some(DebounceEntry::Settled { generation: current, .. }) = entries.get(&key) {
            if *current == generation {
                entries.remove(&key);
                debug!(key = %key, "Debounce window elapsed");
            }
        }
    }
}

fn into_bridge_error(method: &str, err: RetryError<AttemptError>) -> BridgeError {
    match err {
        RetryError::Exhausted { last_error, .. } | RetryError::NonRetryable { last_error, .. } => {
            match last_error {
                AttemptError::Call(err) => err,
                AttemptError::QuotaDenied => {
                    BridgeError::Internal(format!("{method} refused by the daily quota"))
                }
            }
        }
        RetryError::EmptyResult { attempts } => BridgeError::EmptyResult(format!(
            "{method} produced an empty result after {attempts} attempts"
        )),
        RetryError::InvalidConfiguration { message } => BridgeError::Config(message),
    }
}

impl std::fmt::Debug for CallGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallGovernor")
            .field("min_spacing", &self.inner.min_spacing)
            .field("debounce_window", &self.inner.debounce_window)
            .field("pending_calls", &self.pending_calls())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use cloudbridge_common::RetryConfig;
    use cloudbridge_domain::QuotaConfig;

    use super::*;

    fn governor_with(quota: QuotaConfig) -> CallGovernor {
        let retry = RetryManager::new(
            RetryConfig::builder()
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_millis(400))
                .build()
                .unwrap(),
        )
        .unwrap();
        CallGovernor::new(
            &GovernorConfig::default(),
            Arc::new(QuotaManager::with_system_clock(quota)),
            retry,
        )
    }

    fn governor() -> CallGovernor {
        governor_with(QuotaConfig::default())
    }

    fn counting_op(
        counter: &Arc<AtomicUsize>,
        latency: Duration,
    ) -> impl Fn() -> BoxFuture<'static, Result<Option<CallValue>>> + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move || {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(latency).await;
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Some(CallValue::Ack(n % 2 == 1)))
            }
            .boxed()
        }
    }

    #[test]
    fn test_call_key_layout() {
        let device = DeviceId::new("dev-1");
        assert_eq!(CallKey::new("list_devices", None, &serde_json::Value::Null).as_str(), "list_devices");
        assert_eq!(
            CallKey::new("set_brightness", Some(&device), &serde_json::json!([40])).as_str(),
            "set_brightness:dev-1:[40]"
        );
        assert_ne!(
            CallKey::new("set_brightness", Some(&device), &serde_json::json!([40])),
            CallKey::new("set_brightness", Some(&device), &serde_json::json!([41]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_calls_coalesce() {
        let governor = governor();
        let counter = Arc::new(AtomicUsize::new(0));
        let device = DeviceId::new("dev-1");

        let (a, b) = tokio::join!(
            governor.call("turn_on", Some(&device), serde_json::Value::Null, counting_op(&counter, Duration::from_millis(200))),
            governor.call("turn_on", Some(&device), serde_json::Value::Null, counting_op(&counter, Duration::from_millis(200))),
        );

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_value_is_debounced_then_expires() {
        let governor = governor();
        let counter = Arc::new(AtomicUsize::new(0));

        let first = governor
            .call("list_devices", None, serde_json::Value::Null, counting_op(&counter, Duration::ZERO))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let second = governor
            .call("list_devices", None, serde_json::Value::Null, counting_op(&counter, Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(governor.cached_keys(), vec!["list_devices".to_string()]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(governor.cached_keys().is_empty());

        governor
            .call("list_devices", None, serde_json::Value::Null, counting_op(&counter, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_calls_are_spaced() {
        let governor = governor();
        let stamps = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for level in 0..3u8 {
            let governor = governor.clone();
            let stamps = Arc::clone(&stamps);
            handles.push(tokio::spawn(async move {
                let device = DeviceId::new("dev-1");
                governor
                    .call("set_brightness", Some(&device), serde_json::json!([level]), move || {
                        let stamps = Arc::clone(&stamps);
                        async move {
                            stamps.lock().push(Instant::now());
                            Ok(Some(CallValue::Ack(true)))
                        }
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut stamps = stamps.lock().clone();
        stamps.sort();
        assert_eq!(stamps.len(), 3);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_not_cached() {
        let governor = governor();
        let attempts = Arc::new(AtomicUsize::new(0));

        let a = Arc::clone(&attempts);
        let result = governor
            .call("device_details", None, serde_json::Value::Null, move || {
                a.fetch_add(1, Ordering::SeqCst);
                async { Err(BridgeError::Network("connection reset".into())) }
            })
            .await;

        assert!(matches!(result, Err(BridgeError::Network(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(governor.pending_calls(), 0);
        assert!(governor.cached_keys().is_empty());
        assert_eq!(governor.quota().snapshot().call_count, 3);
    }

    /// Validates that retries consult the quota before every attempt.
    ///
    /// # Test Steps
    /// 1. Allow one call per day
    /// 2. Issue an ordinary call whose every attempt fails
    /// 3. Verify the retry loop stopped as `Denied` after the first attempt
    #[tokio::test(start_paused = true)]
    async fn test_retries_stop_when_quota_runs_out() {
        let governor = governor_with(QuotaConfig {
            base_quota: 1,
            per_device_quota: 0,
            buffer_fraction: 1.0,
            ..QuotaConfig::default()
        });
        let attempts = Arc::new(AtomicUsize::new(0));

        let a = Arc::clone(&attempts);
        let outcome = governor
            .call("device_details", None, serde_json::Value::Null, move || {
                a.fetch_add(1, Ordering::SeqCst);
                async { Err(BridgeError::Network("connection reset".into())) }
            })
            .await
            .unwrap();

        assert_eq!(outcome, CallOutcome::Denied);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let budget = governor.quota().snapshot();
        assert!(budget.call_count <= budget.daily_quota);
        assert_eq!(governor.pending_calls(), 0);
        assert!(governor.cached_keys().is_empty());
    }

    /// Validates that calls queued behind the spacing slot cannot overshoot
    /// the quota.
    #[tokio::test(start_paused = true)]
    async fn test_queued_calls_respect_quota() {
        let governor = governor_with(QuotaConfig {
            base_quota: 2,
            per_device_quota: 0,
            buffer_fraction: 1.0,
            ..QuotaConfig::default()
        });
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for level in 0..5u8 {
            let governor = governor.clone();
            let op = counting_op(&counter, Duration::ZERO);
            handles.push(tokio::spawn(async move {
                governor.call("set_brightness", None, serde_json::json!([level]), op).await
            }));
        }
        let mut denied = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_denied() {
                denied += 1;
            }
        }

        assert_eq!(denied, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(governor.quota().snapshot().call_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expired_is_not_retried() {
        let governor = governor();
        let attempts = Arc::new(AtomicUsize::new(0));

        let a = Arc::clone(&attempts);
        let result = governor
            .call("device_details", None, serde_json::Value::Null, move || {
                a.fetch_add(1, Ordering::SeqCst);
                async { Err(BridgeError::Auth("token expired".into())) }
            })
            .await;

        assert!(matches!(result, Err(BridgeError::Auth(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_empty_result_surfaces_as_error() {
        let governor = governor();

        let result = governor
            .call("device_details", None, serde_json::Value::Null, || async { Ok(None) })
            .await;

        match result {
            Err(BridgeError::EmptyResult(message)) => assert!(message.contains("after 3 attempts")),
            other => panic!("expected empty result error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_denial_returns_denied_without_calling() {
        let governor = governor_with(QuotaConfig {
            base_quota: 1,
            per_device_quota: 0,
            buffer_fraction: 1.0,
            ..QuotaConfig::default()
        });
        let counter = Arc::new(AtomicUsize::new(0));

        governor
            .call("device_details", None, serde_json::Value::Null, counting_op(&counter, Duration::ZERO))
            .await
            .unwrap();
        let denied = governor
            .call("list_devices", None, serde_json::Value::Null, counting_op(&counter, Duration::ZERO))
            .await
            .unwrap();
        let priority = governor
            .call("turn_off", None, serde_json::Value::Null, counting_op(&counter, Duration::ZERO))
            .await
            .unwrap();

        assert!(denied.is_denied());
        assert!(!priority.is_denied());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(!governor.cached_keys().contains(&"list_devices".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bypass_methods_skip_quota_and_cache() {
        let governor = governor();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            governor
                .call("cached_devices", None, serde_json::Value::Null, counting_op(&counter, Duration::ZERO))
                .await
                .unwrap();
        }
        let empty = governor
            .call("is_online", None, serde_json::Value::Null, || async { Ok(None) })
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(empty, CallOutcome::Empty);
        assert_eq!(governor.quota().snapshot().call_count, 0);
        assert!(governor.cached_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_completes_when_caller_drops() {
        let governor = governor();
        let counter = Arc::new(AtomicUsize::new(0));

        let pending = governor.call(
            "turn_on",
            None,
            serde_json::Value::Null,
            counting_op(&counter, Duration::from_secs(1)),
        );
        let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(governor.cached_keys(), vec!["turn_on".to_string()]);
    }
}
