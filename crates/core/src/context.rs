//! Governance context - wiring for the whole layer
//!
//! One quota manager and one governor serve every device; the context owns
//! them together with the session machinery so the bridge integration has a
//! single object to hold.

use std::collections::HashMap;
use std::sync::Arc;

use cloudbridge_common::time::{Clock, SystemClock};
use cloudbridge_common::{RetryConfig, RetryError, RetryManager};
use cloudbridge_domain::{BridgeError, DeviceKind, GovernanceConfig, RetrySettings, Result, Session};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::{ReauthManager, TokenLifecycleScheduler};
use crate::governance::{CallGovernor, GovernedClient, QuotaManager};
use crate::polling::PollingManager;
use crate::ports::{Authenticator, DeviceCloudClient, SessionStore};

/// Owns every governance component for one account
pub struct GovernanceContext {
    config: GovernanceConfig,
    quota: Arc<QuotaManager>,
    governor: CallGovernor,
    client: GovernedClient,
    reauth: ReauthManager,
    tokens: TokenLifecycleScheduler,
    pollers: Mutex<HashMap<DeviceKind, Arc<PollingManager>>>,
    session_follower: Mutex<Option<JoinHandle<()>>>,
}

impl GovernanceContext {
    /// # Errors
    /// `BridgeError::Config` if `config` does not validate.
    pub fn new(
        config: GovernanceConfig,
        client: Arc<dyn DeviceCloudClient>,
        authenticator: Arc<dyn Authenticator>,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        Self::with_clock(config, client, authenticator, store, Arc::new(SystemClock))
    }

    /// Like [`GovernanceContext::new`] with an explicit wall clock.
    ///
    /// # Errors
    /// `BridgeError::Config` if `config` does not validate.
    pub fn with_clock(
        config: GovernanceConfig,
        client: Arc<dyn DeviceCloudClient>,
        authenticator: Arc<dyn Authenticator>,
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let quota = Arc::new(QuotaManager::new(config.quota.clone(), Arc::clone(&clock)));
        let retry = RetryManager::new(retry_config(&config.retry)?).map_err(config_error)?;
        let governor = CallGovernor::new(&config.governor, Arc::clone(&quota), retry);

        let reauth = ReauthManager::new(
            authenticator,
            store,
            Arc::clone(&quota),
            config.reauth.clone(),
            Arc::clone(&clock),
        );
        let tokens =
            TokenLifecycleScheduler::new(Arc::new(reauth.clone()), config.token.clone(), clock);
        let client = GovernedClient::new(client, governor.clone()).with_reauth(reauth.clone());

        info!(
            daily_quota = quota.snapshot().daily_quota,
            min_spacing_ms = config.governor.min_spacing_ms,
            debounce_window_ms = config.governor.debounce_window_ms,
            "Governance context initialised"
        );

        Ok(Self {
            config,
            quota,
            governor,
            client,
            reauth,
            tokens,
            pollers: Mutex::new(HashMap::new()),
            session_follower: Mutex::new(None),
        })
    }

    /// Restore or establish the session and start following it for
    /// proactive refresh.
    ///
    /// # Errors
    /// The login error when re-authentication is bounded and exhausted.
    pub async fn start(&self) -> Result<Session> {
        let session = self.reauth.restore_or_login().await?;

        if let Err(err) = self.tokens.on_token_change(&session.token) {
            warn!(error = %err, "Session token carries no readable expiry; relying on reactive re-authentication");
        }

        let mut follower = self.session_follower.lock();
        if follower.is_none() {
            *follower = Some(self.tokens.follow_sessions(self.reauth.subscribe()));
        }
        Ok(session)
    }

    /// Poller for a device class, created on first use.
    pub fn polling_manager(&self, kind: DeviceKind) -> Arc<PollingManager> {
        let mut pollers = self.pollers.lock();
        Arc::clone(pollers.entry(kind).or_insert_with(|| {
            Arc::new(PollingManager::new(kind.to_string(), self.config.polling.clone()))
        }))
    }

    pub fn update_device_count(&self, device_count: usize) {
        self.quota.update_device_count(device_count);
    }

    /// Stop pollers, pending refreshes and the session follower.
    pub fn shutdown(&self) {
        info!("Shutting down governance context");
        for poller in self.pollers.lock().values() {
            poller.stop_polling();
        }
        self.tokens.cancel();
        if let Some(follower) = self.session_follower.lock().take() {
            follower.abort();
        }
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    pub fn quota(&self) -> &Arc<QuotaManager> {
        &self.quota
    }

    pub fn governor(&self) -> &CallGovernor {
        &self.governor
    }

    pub fn client(&self) -> &GovernedClient {
        &self.client
    }

    pub fn reauth(&self) -> &ReauthManager {
        &self.reauth
    }

    pub fn tokens(&self) -> &TokenLifecycleScheduler {
        &self.tokens
    }
}

impl Drop for GovernanceContext {
    fn drop(&mut self) {
        if let Some(follower) = self.session_follower.get_mut().take() {
            follower.abort();
        }
    }
}

impl std::fmt::Debug for GovernanceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceContext")
            .field("quota", &self.quota)
            .field("governor", &self.governor)
            .field("tokens", &self.tokens)
            .field("pollers", &self.pollers.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn retry_config(settings: &RetrySettings) -> Result<RetryConfig> {
    RetryConfig::builder()
        .max_attempts(settings.max_attempts)
        .initial_delay(settings.initial_delay())
        .max_delay(settings.max_delay())
        .backoff_factor(settings.backoff_factor)
        .build()
        .map_err(config_error)
}

fn config_error(err: RetryError<()>) -> BridgeError {
    match err {
        RetryError::InvalidConfiguration { message } => BridgeError::Config(format!("retry: {message}")),
        other => BridgeError::Config(format!("retry: {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_settings_map_onto_retry_config() {
        let settings = RetrySettings { max_attempts: 5, initial_delay_ms: 200, ..RetrySettings::default() };
        let config = retry_config(&settings).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.delay_for_attempt(1), std::time::Duration::from_millis(200));
    }

    #[test]
    fn test_inverted_retry_delays_are_a_config_error() {
        let settings =
            RetrySettings { initial_delay_ms: 20_000, max_delay_ms: 1_000, ..RetrySettings::default() };
        assert!(matches!(retry_config(&settings), Err(BridgeError::Config(_))));
    }
}
