//! Client facade for the labfunctions service.
//!
//! `LabClient` owns one `AuthSession` and hands out the pieces resource
//! clients are built from: an `AuthInterceptor` for ordinary requests and
//! the event stream/publisher pair for live execution status.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use super::transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
use super::ApiError;
use crate::auth::credentials::create_private_dir;
use crate::auth::{AuthInterceptor, AuthSession, CredentialStore, Credentials, UserInfo};
use crate::config::ClientConfig;
use crate::events::{EventPayload, EventPublisher, EventStream, EventStreamClient};

// ============================================================================
// Constants
// ============================================================================

const LOGIN_PATH: &str = "auth/login";
const REFRESH_TOKEN_PATH: &str = "auth/refresh_token";
const VERIFY_PATH: &str = "auth/verify";

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

pub struct LabClient {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    session: Option<Arc<AuthSession>>,
}

impl LabClient {
    /// Create a client using the reqwest transport
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new()?);
        Self::with_transport(config, transport)
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let store = Arc::new(CredentialStore::new(config.home_dir()?));
        Ok(Self {
            config,
            transport,
            store,
            session: None,
        })
    }

    /// Replace the credential store (e.g. with a custom provider chain).
    pub fn with_store(mut self, store: CredentialStore) -> Self {
        self.store = Arc::new(store);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn homedir(&self) -> Result<PathBuf> {
        self.config.home_dir()
    }

    /// Create the home directory (owner-only) if missing.
    pub fn create_homedir(&self) -> Result<PathBuf> {
        let dir = self.homedir()?;
        create_private_dir(&dir)?;
        Ok(dir)
    }

    pub fn session(&self) -> Option<&Arc<AuthSession>> {
        self.session.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.session.as_ref().map(|s| s.snapshot().as_ref().clone())
    }

    /// Install credentials. An existing session keeps its identity (and
    /// every interceptor sharing it sees the new pair).
    pub fn set_credentials(&mut self, credentials: Credentials) {
        match self.session {
            Some(ref session) => session.replace(credentials),
            None => self.session = Some(Arc::new(self.new_session(credentials))),
        }
    }

    pub fn clear_credentials(&mut self) {
        self.session = None;
    }

    fn new_session(&self, credentials: Credentials) -> AuthSession {
        let session = AuthSession::new(credentials, self.config.endpoint(REFRESH_TOKEN_PATH))
            .with_refresh_timeout(self.config.timeout);
        if self.config.store_credentials {
            session.with_store(self.store.clone())
        } else {
            session
        }
    }

    /// Load credentials from disk, or from the agent environment variables
    /// on first run, and start a session with them.
    pub fn load_credentials(&mut self) -> Result<Credentials> {
        let credentials = self.store.load()?;
        self.set_credentials(credentials.clone());
        Ok(credentials)
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<Credentials> {
        let request = HttpRequest::post(self.config.endpoint(LOGIN_PATH))
            .json(&LoginRequest { username, password })?
            .timeout(self.config.timeout);

        let response = self
            .transport
            .send(request)
            .await
            .context("Failed to send login request")?;

        if response.status != StatusCode::OK {
            debug!(status = %response.status, "Login rejected");
            return Err(ApiError::LoginError {
                service: self.config.service_url.clone(),
                username: username.to_string(),
            }
            .into());
        }

        let credentials: Credentials = response.json().context("Failed to parse login response")?;
        self.set_credentials(credentials.clone());
        if self.config.store_credentials {
            self.store.save(&credentials)?;
        }

        info!(username = %username, "Logged in");
        Ok(credentials)
    }

    /// Check the session against the server. A rejected session is dropped
    /// and `false` returned; network failures propagate.
    pub async fn verify(&mut self) -> Result<bool> {
        let interceptor = self.interceptor()?;
        let request = HttpRequest::get(self.config.endpoint(VERIFY_PATH)).timeout(self.config.timeout);

        match interceptor.execute(request).await {
            Ok(response) if response.status == StatusCode::OK => Ok(true),
            Ok(response) => {
                warn!(status = %response.status, "Credentials rejected by verify");
                self.clear_credentials();
                Ok(false)
            }
            Err(err) if matches!(err.downcast_ref::<ApiError>(), Some(ApiError::AuthValidationFailed(_))) => {
                warn!(error = %err, "Credentials could not be refreshed");
                self.clear_credentials();
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Refresh ahead of time when the access token is about to expire.
    /// Call before opening a long-lived stream, which never refreshes.
    pub async fn ensure_fresh_token(&self) -> Result<Credentials> {
        let session = self.require_session()?;
        let credentials = session.refresh_if_stale(self.transport.as_ref()).await?;
        Ok(credentials.as_ref().clone())
    }

    /// User named in the access token, if it is a JWT carrying `usr`.
    pub fn user(&self) -> Option<UserInfo> {
        self.session.as_ref()?.snapshot().user()
    }

    fn require_session(&self) -> Result<&Arc<AuthSession>> {
        match self.session {
            Some(ref session) => Ok(session),
            None => Err(ApiError::CredentialsNotFound {
                home: self.store.dir().to_path_buf(),
                tried: "active session".to_string(),
            }
            .into()),
        }
    }

    pub fn interceptor(&self) -> Result<AuthInterceptor> {
        let session = self.require_session()?;
        Ok(AuthInterceptor::new(session.clone(), self.transport.clone()))
    }

    /// Send an authenticated request, applying the configured timeout unless
    /// the request sets its own.
    pub async fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.interceptor()?
            .execute(request.or_timeout(self.config.timeout))
            .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.config.endpoint(path);
        self.request(HttpRequest::get(&url))
            .await
            .with_context(|| format!("Failed to send GET request to {}", url))?
            .error_for_status()?
            .json()
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.config.endpoint(path);
        self.request(HttpRequest::post(&url).json(body)?)
            .await
            .with_context(|| format!("Failed to send POST request to {}", url))?
            .error_for_status()?
            .json()
    }

    fn project_id(&self) -> Result<&str> {
        self.config
            .project_id
            .as_deref()
            .ok_or_else(|| ApiError::MissingProject.into())
    }

    pub fn events(&self) -> Result<EventStreamClient> {
        Ok(EventStreamClient::new(
            self.transport.clone(),
            self.require_session()?.clone(),
            self.config.base_url(),
            self.project_id()?,
        ))
    }

    pub fn publisher(&self) -> Result<EventPublisher> {
        Ok(EventPublisher::new(
            self.interceptor()?,
            self.config.base_url(),
            self.project_id()?,
        )
        .with_timeout(self.config.timeout))
    }

    /// Listen to an execution's events. `timeout` defaults to the client timeout.
    pub async fn events_listen(
        &self,
        execution_id: &str,
        last_event_id: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<EventStream> {
        self.events()?
            .listen(execution_id, last_event_id, timeout.unwrap_or(self.config.timeout))
            .await
    }

    pub async fn events_publish(
        &self,
        execution_id: &str,
        payload: impl Into<EventPayload>,
        event_type: Option<&str>,
    ) -> Result<()> {
        self.publisher()?.publish(execution_id, payload, event_type).await
    }

    /// End the session. Interceptors already handed out keep their own
    /// reference until dropped.
    pub fn close(mut self) {
        if self.session.take().is_some() {
            debug!("Client session closed");
        }
    }
}
