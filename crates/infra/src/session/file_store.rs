//! File-backed session persistence
//!
//! The session is one small JSON document. Writes go to `<path>.tmp`, are
//! synced, then renamed over the target, so a crash never leaves a torn
//! file behind. All writes go through one async mutex.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cloudbridge_core::SessionStore;
use cloudbridge_domain::{BridgeError, Result, Session};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// On-disk shape of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub token: String,
    pub account_id: String,
    pub region: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Identity tag of the account the session was issued for.
    pub identity: String,
}

impl From<&Session> for PersistedSession {
    fn from(session: &Session) -> Self {
        Self {
            token: session.token.clone(),
            account_id: session.account_id.clone(),
            region: session.region.clone(),
            issued_at: session.issued_at,
            expires_at: session.expires_at,
            identity: session.identity.clone(),
        }
    }
}

impl From<PersistedSession> for Session {
    fn from(persisted: PersistedSession) -> Self {
        Self {
            token: persisted.token,
            account_id: persisted.account_id,
            region: persisted.region,
            issued_at: persisted.issued_at,
            expires_at: persisted.expires_at,
            identity: persisted.identity,
        }
    }
}

/// [`SessionStore`] backed by a JSON file
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }

    async fn write_atomically(&self, data: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.temp_path();
        let mut file =
            fs::OpenOptions::new().write(true).create(true).truncate(true).open(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    #[instrument(skip(self, identity), fields(path = %self.path.display()))]
    async fn load(&self, identity: &str) -> Result<Option<Session>> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("No session file");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let persisted: PersistedSession = serde_json::from_slice(&data).map_err(|e| {
            BridgeError::Storage(format!("Corrupt session file {}: {e}", self.path.display()))
        })?;

        if persisted.identity != identity {
            info!("Session file belongs to a different account; ignoring it");
            return Ok(None);
        }

        debug!(expires_at = %persisted.expires_at, "Loaded persisted session");
        Ok(Some(persisted.into()))
    }

    #[instrument(skip(self, session), fields(path = %self.path.display()))]
    async fn save(&self, session: &Session) -> Result<()> {
        let data = serde_json::to_vec_pretty(&PersistedSession::from(session))?;

        let _guard = self.write_lock.lock().await;
        self.write_atomically(&data).await?;
        debug!(bytes = data.len(), "Session persisted");
        Ok(())
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Session file removed");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => {
                warn!(error = %err, "Failed to remove session file");
                Err(err.into())
            }
        }
    }
}
