//! Bearer-token decoration of outbound requests with one refresh-and-replay
//! on `401 Unauthorized`.
//!
//! Each call walks a small state machine:
//!
//! ```text
//! Attached -> AwaitingResponse -> Done
//!                              \-> Refreshing -> Replayed -> Done
//! ```
//!
//! The replayed response is returned whatever its status, so one call
//! triggers at most one refresh.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::session::AuthSession;
use crate::api::transport::{HttpRequest, HttpResponse, StreamingResponse, Transport};

enum Phase {
    /// Request carries a snapshot of the current access token.
    Attached { request: HttpRequest, token: String },
    /// First response is in; decide whether the token was rejected.
    AwaitingResponse {
        request: HttpRequest,
        token: String,
        response: HttpResponse,
    },
    /// Token rejected; renew it through the session's single-flight gate.
    Refreshing { request: HttpRequest, stale_token: String },
    /// Request re-attached with the renewed token, sent exactly once more.
    Replayed { request: HttpRequest },
    Done(HttpResponse),
}

/// `Transport` decorator owning the refresh-and-replay protocol.
/// Clone is cheap; clones share the session and transport.
#[derive(Clone)]
pub struct AuthInterceptor {
    session: Arc<AuthSession>,
    transport: Arc<dyn Transport>,
}

impl AuthInterceptor {
    pub fn new(session: Arc<AuthSession>, transport: Arc<dyn Transport>) -> Self {
        Self { session, transport }
    }

    pub fn session(&self) -> &Arc<AuthSession> {
        &self.session
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Send `request` with the session's bearer token, refreshing and
    /// replaying once if the server answers 401.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let token = self.session.access_token();
        let mut phase = Phase::Attached {
            request: request.bearer(&token)?,
            token,
        };

        loop {
            phase = match phase {
                Phase::Attached { request, token } => {
                    let response = self.transport.send(request.clone()).await?;
                    Phase::AwaitingResponse {
                        request,
                        token,
                        response,
                    }
                }
                Phase::AwaitingResponse {
                    request,
                    token,
                    response,
                } => {
                    if response.status == StatusCode::UNAUTHORIZED {
                        debug!(url = %request.url, "Request rejected with 401, refreshing");
                        Phase::Refreshing {
                            request,
                            stale_token: token,
                        }
                    } else {
                        Phase::Done(response)
                    }
                }
                Phase::Refreshing {
                    request,
                    stale_token,
                } => {
                    let renewed = self
                        .session
                        .refresh(self.transport.as_ref(), &stale_token)
                        .await?;
                    Phase::Replayed {
                        request: request.bearer(&renewed.access_token)?,
                    }
                }
                Phase::Replayed { request } => {
                    let url = request.url.clone();
                    let response = self.transport.send(request).await?;
                    if response.status == StatusCode::UNAUTHORIZED {
                        warn!(url = %url, "Replayed request rejected again; not refreshing twice");
                    }
                    Phase::Done(response)
                }
                Phase::Done(response) => return Ok(response),
            };
        }
    }
}

/// Lets an interceptor stand wherever a plain `Transport` is expected.
/// Streaming requests get the bearer header but no replay: a rejected
/// stream surfaces its 401 to the caller.
#[async_trait]
impl Transport for AuthInterceptor {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.execute(request).await
    }

    async fn open_stream(&self, request: HttpRequest) -> Result<StreamingResponse> {
        let request = request.bearer(&self.session.access_token())?;
        self.transport.open_stream(request).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::api::ApiError;
    use crate::auth::{CredentialStore, Credentials};
    use crate::test_support::{json_response, ScriptedTransport};

    const REFRESH_URL: &str = "http://lab.local/v1/auth/refresh_token";

    fn session(access: &str, refresh: &str) -> Arc<AuthSession> {
        Arc::new(AuthSession::new(Credentials::new(access, refresh), REFRESH_URL))
    }

    /// Accepts only `valid`; the refresh endpoint hands out `refreshed`.
    fn server(valid: &'static str, refreshed: serde_json::Value) -> ScriptedTransport {
        ScriptedTransport::new(move |req| {
            if req.url == REFRESH_URL {
                return json_response(StatusCode::OK, refreshed.clone());
            }
            if req.bearer_token() == Some(valid) {
                json_response(StatusCode::OK, serde_json::json!({"ok": true}))
            } else {
                json_response(StatusCode::UNAUTHORIZED, serde_json::json!({}))
            }
        })
    }

    #[tokio::test]
    async fn test_valid_token_passes_through() {
        let transport = Arc::new(server("t1", serde_json::json!({})));
        let interceptor = AuthInterceptor::new(session("t1", "r1"), transport.clone());

        let response = interceptor.execute(HttpRequest::get("http://lab.local/v1/x")).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.count("refresh_token"), 0);
    }

    #[tokio::test]
    async fn test_401_refreshes_and_replays_once() {
        let transport = Arc::new(server("t2", serde_json::json!({"access_token": "t2", "refresh_token": "r2"})));
        let session = session("t1", "r1");
        let interceptor = AuthInterceptor::new(session.clone(), transport.clone());

        let response = interceptor.execute(HttpRequest::get("http://lab.local/v1/x")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].bearer_token(), Some("t1"));
        // Refresh carries the expiring token and the refresh token.
        assert_eq!(sent[1].url, REFRESH_URL);
        assert_eq!(sent[1].bearer_token(), Some("t1"));
        let body: serde_json::Value = serde_json::from_slice(sent[1].body.as_ref().unwrap()).unwrap();
        assert_eq!(body, serde_json::json!({"refresh_token": "r1"}));
        assert_eq!(sent[2].bearer_token(), Some("t2"));

        assert_eq!(*session.snapshot(), Credentials::new("t2", "r2"));
    }

    #[tokio::test]
    async fn test_refresh_without_new_refresh_token_keeps_old_one() {
        let transport = Arc::new(server("t2", serde_json::json!({"access_token": "t2"})));
        let session = session("t1", "r1");
        let interceptor = AuthInterceptor::new(session.clone(), transport);

        interceptor.execute(HttpRequest::get("http://lab.local/v1/x")).await.unwrap();

        assert_eq!(*session.snapshot(), Credentials::new("t2", "r1"));
    }

    #[tokio::test]
    async fn test_refresh_missing_access_token_fails_and_keeps_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(tmp.path()));
        store.save(&Credentials::new("t1", "r1")).unwrap();

        let transport = Arc::new(server("t2", serde_json::json!({"refresh_token": "r9"})));
        let session = Arc::new(
            AuthSession::new(Credentials::new("t1", "r1"), REFRESH_URL).with_store(store.clone()),
        );
        let interceptor = AuthInterceptor::new(session.clone(), transport.clone());

        let err = interceptor.execute(HttpRequest::get("http://lab.local/v1/x")).await.unwrap_err();

        assert!(matches!(err.downcast_ref::<ApiError>(), Some(ApiError::AuthValidationFailed(_))));
        assert_eq!(store.read().unwrap(), Some(Credentials::new("t1", "r1")));
        assert_eq!(*session.snapshot(), Credentials::new("t1", "r1"));
        // No replay after a failed refresh.
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_non_2xx_fails() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            if req.url == REFRESH_URL {
                json_response(StatusCode::FORBIDDEN, serde_json::json!({"access_token": "t2"}))
            } else {
                json_response(StatusCode::UNAUTHORIZED, serde_json::json!({}))
            }
        }));
        let interceptor = AuthInterceptor::new(session("t1", "r1"), transport);

        let err = interceptor.execute(HttpRequest::get("http://lab.local/v1/x")).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<ApiError>(), Some(ApiError::AuthValidationFailed(_))));
    }

    #[tokio::test]
    async fn test_refresh_persists_to_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(tmp.path()));
        let transport = Arc::new(server("t2", serde_json::json!({"access_token": "t2"})));
        let session = Arc::new(
            AuthSession::new(Credentials::new("t1", "r1"), REFRESH_URL).with_store(store.clone()),
        );

        AuthInterceptor::new(session, transport)
            .execute(HttpRequest::get("http://lab.local/v1/x"))
            .await
            .unwrap();

        assert_eq!(store.read().unwrap(), Some(Credentials::new("t2", "r1")));
    }

    #[tokio::test]
    async fn test_second_401_is_returned_without_second_refresh() {
        // Server never accepts anything, but refresh "succeeds".
        let transport = Arc::new(server("never", serde_json::json!({"access_token": "t2"})));
        let interceptor = AuthInterceptor::new(session("t1", "r1"), transport.clone());

        let response = interceptor.execute(HttpRequest::get("http://lab.local/v1/x")).await.unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(transport.count("refresh_token"), 1);
        assert_eq!(transport.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_transport_error_propagates_unchanged() {
        let transport = Arc::new(ScriptedTransport::new(|_| {
            Err(ApiError::Timeout(Duration::from_secs(1)).into())
        }));
        let interceptor = AuthInterceptor::new(session("t1", "r1"), transport);

        let err = interceptor.execute(HttpRequest::get("http://lab.local/v1/x")).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<ApiError>(), Some(ApiError::Timeout(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_401s_share_one_refresh() {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let counter = refreshes.clone();
        let transport = Arc::new(
            ScriptedTransport::new(move |req| {
                if req.url == REFRESH_URL {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    return json_response(
                        StatusCode::OK,
                        serde_json::json!({"access_token": format!("fresh-{}", n)}),
                    );
                }
                match req.bearer_token() {
                    Some(t) if t.starts_with("fresh-") => {
                        json_response(StatusCode::OK, serde_json::json!({"token": t}))
                    }
                    _ => json_response(StatusCode::UNAUTHORIZED, serde_json::json!({})),
                }
            })
            .with_latency(Duration::from_millis(20)),
        );
        let interceptor = AuthInterceptor::new(session("t1", "r1"), transport.clone());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let interceptor = interceptor.clone();
                tokio::spawn(async move {
                    interceptor
                        .execute(HttpRequest::get(format!("http://lab.local/v1/item/{}", i)))
                        .await
                })
            })
            .collect();

        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.status, StatusCode::OK);
            let body: serde_json::Value = response.json().unwrap();
            assert_eq!(body["token"], "fresh-1");
        }
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(transport.count("refresh_token"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_refresh_failure() {
        let transport = Arc::new(
            ScriptedTransport::new(|req| {
                if req.url == REFRESH_URL {
                    json_response(StatusCode::OK, serde_json::json!({"detail": "expired"}))
                } else {
                    json_response(StatusCode::UNAUTHORIZED, serde_json::json!({}))
                }
            })
            .with_latency(Duration::from_millis(20)),
        );
        let interceptor = AuthInterceptor::new(session("t1", "r1"), transport.clone());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let interceptor = interceptor.clone();
                tokio::spawn(async move {
                    interceptor.execute(HttpRequest::get("http://lab.local/v1/x")).await
                })
            })
            .collect();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err.downcast_ref::<ApiError>(), Some(ApiError::AuthValidationFailed(_))));
        }
        assert_eq!(transport.count("refresh_token"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_refresh_timeout() {
        let transport = Arc::new(
            ScriptedTransport::new(|req| {
                if req.url == REFRESH_URL {
                    Err(ApiError::Timeout(Duration::from_secs(5)).into())
                } else {
                    json_response(StatusCode::UNAUTHORIZED, serde_json::json!({}))
                }
            })
            .with_latency(Duration::from_millis(50)),
        );
        let interceptor = AuthInterceptor::new(session("t1", "r1"), transport.clone());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let interceptor = interceptor.clone();
                tokio::spawn(async move {
                    interceptor.execute(HttpRequest::get("http://lab.local/v1/x")).await
                })
            })
            .collect();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err.downcast_ref::<ApiError>(), Some(ApiError::Timeout(_))));
        }
        assert_eq!(transport.count("refresh_token"), 1);

        // A fresh request after the failure is free to try again.
        interceptor.execute(HttpRequest::get("http://lab.local/v1/x")).await.unwrap_err();
        assert_eq!(transport.count("refresh_token"), 2);
    }

    #[tokio::test]
    async fn test_refresh_if_stale_skips_fresh_tokens() {
        let transport = server("t1", serde_json::json!({"access_token": "t2"}));
        let session = session("t1", "r1");

        let creds = session.refresh_if_stale(&transport).await.unwrap();

        assert_eq!(creds.access_token, "t1");
        assert_eq!(transport.sent().len(), 0);
    }

    #[tokio::test]
    async fn test_open_stream_attaches_bearer() {
        let transport = Arc::new(ScriptedTransport::streaming(StatusCode::OK, vec![], false));
        let interceptor = AuthInterceptor::new(session("t1", "r1"), transport.clone());

        interceptor
            .open_stream(HttpRequest::get("http://lab.local/v1/events/p/e/_listen"))
            .await
            .unwrap();

        assert_eq!(transport.sent()[0].bearer_token(), Some("t1"));
    }
}
