use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::credentials::{CredentialStore, Credentials};
use crate::api::transport::{HttpRequest, Transport};
use crate::api::ApiError;

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

/// Failed exchange for one access token.
struct RefreshFailure {
    token: String,
    error: ApiError,
    /// Exchange counter value once this exchange finished.
    exchange: u64,
}

/// State guarded by the refresh gate.
#[derive(Default)]
struct RefreshGate {
    failure: Option<RefreshFailure>,
}

impl RefreshGate {
    /// Failure a caller for `token` must observe instead of starting its own
    /// exchange. `seen` is the exchange counter read before queueing.
    ///
    /// A rejection sticks to its token until a new pair is installed; any
    /// other failure is shared only with callers that were already queued.
    fn failure_for(&self, token: &str, seen: u64) -> Option<ApiError> {
        let failure = self.failure.as_ref().filter(|f| f.token == token)?;
        let rejected = matches!(failure.error, ApiError::AuthValidationFailed(_));
        (rejected || failure.exchange > seen).then(|| failure.error.clone())
    }
}

/// Live credential pair of one client, plus the means to renew it.
///
/// Reads take a cheap snapshot; only `refresh` and `replace` swap the pair.
/// Refreshes are single-flight: concurrent callers wait on the gate and
/// reuse whatever the first exchange produced, credentials or error.
pub struct AuthSession {
    credentials: RwLock<Arc<Credentials>>,
    refresh_url: String,
    refresh_timeout: Duration,
    store: Option<Arc<CredentialStore>>,
    gate: Mutex<RefreshGate>,
    /// Finished exchanges, only advanced while the gate is held.
    exchanges: AtomicU64,
}

impl AuthSession {
    pub fn new(credentials: Credentials, refresh_url: impl Into<String>) -> Self {
        Self {
            credentials: RwLock::new(Arc::new(credentials)),
            refresh_url: refresh_url.into(),
            refresh_timeout: Duration::from_secs(crate::config::DEFAULT_TIMEOUT_SECS),
            store: None,
            gate: Mutex::new(RefreshGate::default()),
            exchanges: AtomicU64::new(0),
        }
    }

    /// Persist refreshed credentials to `store`.
    pub fn with_store(mut self, store: Arc<CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn refresh_url(&self) -> &str {
        &self.refresh_url
    }

    pub fn store(&self) -> Option<&Arc<CredentialStore>> {
        self.store.as_ref()
    }

    /// Current pair. The lock is released before this returns.
    pub fn snapshot(&self) -> Arc<Credentials> {
        self.credentials.read().clone()
    }

    pub fn access_token(&self) -> String {
        self.snapshot().access_token.clone()
    }

    /// Explicit replacement (login, manual `set_credentials`).
    pub fn replace(&self, credentials: Credentials) {
        *self.credentials.write() = Arc::new(credentials);
    }

    /// Renew the access token after `stale_token` was rejected.
    ///
    /// If another caller already replaced `stale_token`, its result is
    /// returned without touching the network. Callers queued behind an
    /// exchange that failed get that same failure.
    pub async fn refresh(&self, transport: &dyn Transport, stale_token: &str) -> Result<Arc<Credentials>> {
        let seen = self.exchanges.load(Ordering::SeqCst);
        let mut gate = self.gate.lock().await;

        let current = self.snapshot();
        if current.access_token != stale_token {
            debug!("Credentials already refreshed by a concurrent request");
            return Ok(current);
        }
        if let Some(error) = gate.failure_for(stale_token, seen) {
            debug!(error = %error, "Reusing failure of the preceding refresh");
            return Err(error.into());
        }

        info!(url = %self.refresh_url, "Refreshing access token");
        let outcome = self.exchange(transport, &current).await;
        let exchange = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
        match outcome {
            Ok(renewed) => {
                let renewed = Arc::new(renewed);
                *self.credentials.write() = renewed.clone();
                gate.failure = None;
                self.persist(&renewed);
                Ok(renewed)
            }
            Err(err) => {
                warn!(error = %err, "Token refresh failed");
                let error = err
                    .downcast_ref::<ApiError>()
                    .cloned()
                    .unwrap_or_else(|| ApiError::InvalidResponse(format!("{:#}", err)));
                gate.failure = Some(RefreshFailure {
                    token: stale_token.to_string(),
                    error,
                    exchange,
                });
                Err(err)
            }
        }
    }

    /// Refresh proactively when the access token is about to expire.
    pub async fn refresh_if_stale(&self, transport: &dyn Transport) -> Result<Arc<Credentials>> {
        let current = self.snapshot();
        if !current.needs_refresh() {
            return Ok(current);
        }
        self.refresh(transport, &current.access_token).await
    }

    async fn exchange(&self, transport: &dyn Transport, current: &Credentials) -> Result<Credentials> {
        // The expiring token rides along so the server can audit who refreshed.
        let request = HttpRequest::post(&self.refresh_url)
            .json(&RefreshRequest {
                refresh_token: &current.refresh_token,
            })?
            .bearer(&current.access_token)?
            .timeout(self.refresh_timeout);

        let response = transport.send(request).await?;
        if !response.is_success() {
            return Err(ApiError::AuthValidationFailed(format!(
                "refresh endpoint answered {}",
                response.status
            ))
            .into());
        }

        let body: RefreshResponse = serde_json::from_slice(&response.body).map_err(|e| {
            ApiError::AuthValidationFailed(format!("malformed refresh response: {}", e))
        })?;
        let access_token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::AuthValidationFailed("refresh response has no access_token".to_string()))?;

        Ok(Credentials {
            access_token,
            refresh_token: body
                .refresh_token
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| current.refresh_token.clone()),
        })
    }

    fn persist(&self, credentials: &Credentials) {
        if let Some(ref store) = self.store {
            // The new pair is already live in memory; a disk failure only
            // costs the next process a login.
            if let Err(err) = store.save(credentials) {
                warn!(error = %err, "Failed to persist refreshed credentials");
            }
        }
    }
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("refresh_url", &self.refresh_url)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}
