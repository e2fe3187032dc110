//! Forced re-login with its own backoff
//!
//! Per-call retries give up after a few attempts; a lost session must not.
//! [`ReauthManager`] keeps logging in with exponential backoff until it
//! succeeds (or `max_attempts` is configured and spent), and concurrent
//! callers share a single login.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cloudbridge_common::time::{Clock, SystemClock};
use cloudbridge_domain::{BridgeError, ReauthConfig, Result, Session};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::governance::QuotaManager;
use crate::ports::{Authenticator, SessionStore, TokenRefresher};

type SharedLogin = Shared<BoxFuture<'static, Result<Session>>>;

struct ReauthInner {
    authenticator: Arc<dyn Authenticator>,
    store: Arc<dyn SessionStore>,
    quota: Arc<QuotaManager>,
    clock: Arc<dyn Clock>,
    config: ReauthConfig,
    identity: String,
    sessions: watch::Sender<Option<Session>>,
    in_flight: Mutex<Option<SharedLogin>>,
    consecutive_failures: AtomicU32,
}

impl ReauthInner {
    #[instrument(skip(self), name = "reauthenticate")]
    async fn login_with_backoff(&self) -> Result<Session> {
        let mut delay = self.config.initial_delay();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match self.login_once().await {
                Ok(session) => {
                    let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
                    if previous > 0 {
                        info!(attempts = attempt, "Re-authenticated after failures");
                    } else {
                        info!("Re-authenticated");
                    }
                    return Ok(session);
                }
                Err(err) => err,
            };

            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if self.config.max_attempts.is_some_and(|max| attempt >= max) {
                error!(attempts = attempt, error = %err, "Re-authentication failed; giving up");
                return Err(err);
            }

            if failures >= self.config.escalate_after {
                error!(
                    consecutive_failures = failures,
                    retry_in_secs = delay.as_secs(),
                    error = %err,
                    "Re-authentication keeps failing"
                );
            } else {
                warn!(
                    consecutive_failures = failures,
                    retry_in_secs = delay.as_secs(),
                    error = %err,
                    "Re-authentication failed; retrying"
                );
            }

            sleep(delay).await;
            delay = delay.saturating_mul(2).min(self.config.max_delay());
        }
    }

    async fn login_once(&self) -> Result<Session> {
        let mut session = self.authenticator.login(&self.config.account).await?;
        if session.identity.is_empty() {
            session.identity = self.identity.clone();
        }
        self.adopt(session, true).await
    }

    async fn adopt(&self, session: Session, persist: bool) -> Result<Session> {
        self.authenticator.adopt_session(&session).await?;

        if persist {
            if let Err(err) = self.store.save(&session).await {
                warn!(error = %err, "Failed to persist session; keeping it in memory only");
            }
        }

        self.quota.on_reauthenticated();
        self.sessions.send_replace(Some(session.clone()));
        Ok(session)
    }
}

/// Session owner: restores, renews and publishes the current session
#[derive(Clone)]
pub struct ReauthManager {
    inner: Arc<ReauthInner>,
}

impl ReauthManager {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        store: Arc<dyn SessionStore>,
        quota: Arc<QuotaManager>,
        config: ReauthConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (sessions, _) = watch::channel(None);
        Self {
            inner: Arc::new(ReauthInner {
                authenticator,
                store,
                quota,
                clock,
                identity: Session::identity_for(&config.account),
                config,
                sessions,
                in_flight: Mutex::new(None),
                consecutive_failures: AtomicU32::new(0),
            }),
        }
    }

    pub fn with_system_clock(
        authenticator: Arc<dyn Authenticator>,
        store: Arc<dyn SessionStore>,
        quota: Arc<QuotaManager>,
        config: ReauthConfig,
    ) -> Self {
        Self::new(authenticator, store, quota, config, Arc::new(SystemClock))
    }

    /// Use the persisted session if it belongs to the configured account and
    /// has not expired; log in otherwise.
    ///
    /// # Errors
    /// The login error when `max_attempts` is configured and spent.
    pub async fn restore_or_login(&self) -> Result<Session> {
        let inner = &self.inner;
        match inner.store.load(&inner.identity).await {
            Ok(Some(session)) if session.identity != inner.identity => {
                warn!("Persisted session belongs to another account; logging in");
            }
            Ok(Some(session)) if session.is_expired_at(inner.clock.now()) => {
                info!(expired_at = %session.expires_at, "Persisted session has expired; logging in");
            }
            Ok(Some(session)) => {
                let expires_at = session.expires_at;
                match inner.adopt(session, false).await {
                    Ok(session) => {
                        info!(%expires_at, "Restored persisted session");
                        return Ok(session);
                    }
                    Err(err) => warn!(error = %err, "Persisted session was rejected; logging in"),
                }
            }
            Ok(None) => debug!("No persisted session; logging in"),
            Err(err) => warn!(error = %err, "Failed to load persisted session; logging in"),
        }

        self.reauthenticate().await
    }

    /// Log in again. Concurrent callers join the login already in flight.
    ///
    /// The login runs on its own task, so dropping the caller does not
    /// abandon it.
    ///
    /// # Errors
    /// The login error when `max_attempts` is configured and spent.
    pub async fn reauthenticate(&self) -> Result<Session> {
        let login = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                Some(login) => {
                    debug!("Joining in-flight re-authentication");
                    login.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(async move {
                        let result = inner.login_with_backoff().await;
                        *inner.in_flight.lock() = None;
                        result
                    });
                    let login = async move {
                        task.await.unwrap_or_else(|err| {
                            Err(BridgeError::Internal(format!("re-authentication task failed: {err}")))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(login.clone());
                    login
                }
            }
        };

        login.await
    }

    /// Forget the session locally and in the store.
    ///
    /// # Errors
    /// Propagates the store's error; the in-memory session is cleared
    /// regardless.
    pub async fn logout(&self) -> Result<()> {
        info!("Logging out");
        self.inner.sessions.send_replace(None);
        self.inner.store.clear().await
    }

    pub fn current_session(&self) -> Option<Session> {
        self.inner.sessions.borrow().clone()
    }

    /// Receiver that sees every published session (`None` after logout).
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.inner.sessions.subscribe()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn is_reauthenticating(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }
}

#[async_trait]
impl TokenRefresher for ReauthManager {
    async fn refresh(&self) -> Result<Session> {
        self.reauthenticate().await
    }
}

impl std::fmt::Debug for ReauthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReauthManager")
            .field("has_session", &self.inner.sessions.borrow().is_some())
            .field("consecutive_failures", &self.consecutive_failures())
            .field("in_flight", &self.is_reauthenticating())
            .finish_non_exhaustive()
    }
}
