use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use serde::{Deserialize, Serialize};
use vdg_core::Session;
use vdg_store::{KvStore, StoreError};

/// Local flag marking that this device completed one successful push.
pub const SYNC_COMPLETED_FLAG: &str = "serverSyncCompleted_v1";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no user id in session")]
    MissingUserId,
    #[error("server response has no data object")]
    MissingData,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest<'a> {
    user_id: &'a str,
    data: &'a BTreeMap<String, Option<String>>,
}

#[derive(Deserialize)]
struct PullResponse {
    data: Option<BTreeMap<String, String>>,
}

/// Pushes full snapshots of the local key space to the server and pulls
/// server snapshots into local storage, keyed by user id.
pub struct SyncClient {
    kv: Arc<dyn KvStore>,
    http: reqwest::Client,
    config: SyncConfig,
}

impl SyncClient {
    pub fn new(kv: Arc<dyn KvStore>, config: SyncConfig) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { kv, http, config })
    }

    /// Snapshot every local key (flags included, no exclusion list) and POST
    /// it to the server. `false` on missing user id, network failure or a
    /// non-2xx response; never an error.
    pub async fn push(&self, session: &Session) -> bool {
        match self.try_push(session).await {
            Ok(count) => {
                info!(keys = count, "pushed local snapshot to server");
                true
            }
            Err(err) => {
                warn!(error = %err, "push failed");
                false
            }
        }
    }

    async fn try_push(&self, session: &Session) -> Result<usize, SyncError> {
        let user_id = session.user_id().ok_or(SyncError::MissingUserId)?;
        let keys = self.kv.all_keys().await?;
        let values = self.kv.multi_get(&keys).await?;
        let data: BTreeMap<String, Option<String>> =
            keys.into_iter().zip(values).collect();
        let count = data.len();

        let url = format!("{}/sync/push", self.config.base_url);
        self.http
            .post(&url)
            .json(&PushRequest { user_id, data: &data })
            .send()
            .await?
            .error_for_status()?;
        Ok(count)
    }

    /// Pull the server snapshot into local storage.
    ///
    /// Local-wins: unless `force` is set, the pull is skipped entirely (no
    /// network call) whenever any local key exists. On success every key in
    /// the server's `data` object overwrites its local value in one batch;
    /// keys the server does not mention are left untouched.
    pub async fn pull(&self, session: &Session, force: bool) -> bool {
        match self.try_pull(session, force).await {
            Ok(pulled) => pulled,
            Err(err) => {
                warn!(error = %err, "pull failed");
                false
            }
        }
    }

    async fn try_pull(&self, session: &Session, force: bool) -> Result<bool, SyncError> {
        let user_id = session.user_id().ok_or(SyncError::MissingUserId)?;
        if !force && !self.kv.all_keys().await?.is_empty() {
            debug!("local data present, skipping pull");
            return Ok(false);
        }

        let url = format!("{}/sync/pull/{}", self.config.base_url, user_id);
        let response = self.http.get(&url).send().await?.error_for_status()?;
        let body: PullResponse = response.json().await?;
        let data = body.data.ok_or(SyncError::MissingData)?;

        let entries: Vec<(String, String)> = data.into_iter().collect();
        self.kv.multi_set(&entries).await?;
        info!(keys = entries.len(), "pulled server snapshot into local storage");
        Ok(true)
    }

    /// One-time orchestration: non-forced pull, then push, gated by
    /// [`SYNC_COMPLETED_FLAG`]. The flag is set only after a successful
    /// push; a pull that succeeded before a failed push is never repeated
    /// (local keys now exist, so the next non-forced pull short-circuits),
    /// which caps destructive pull-overwrites at one per device lifetime.
    pub async fn sync_once(&self, session: &Session) -> bool {
        match self.kv.get(SYNC_COMPLETED_FLAG).await {
            Ok(Some(flag)) if flag == "true" => {
                debug!("sync already completed on this device");
                return false;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "could not read sync flag, skipping sync");
                return false;
            }
        }

        self.pull(session, false).await;
        if !self.push(session).await {
            return false;
        }

        if let Err(err) = self.kv.set(SYNC_COMPLETED_FLAG, "true").await {
            warn!(error = %err, "push succeeded but sync flag write failed");
            return false;
        }
        true
    }
}
