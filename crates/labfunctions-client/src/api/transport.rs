//! HTTP execution boundary.
//!
//! `Transport` performs exactly one network exchange per call: no retries and
//! no authentication. `AuthInterceptor` decorates it, and tests swap in a
//! scripted implementation.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::ApiError;

/// Connect timeout applied to every request, including long-lived streams.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Incremental response body of a streaming request.
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// A fully constructed request. Cloning is cheap (the body is `Bytes`),
/// which is what lets the interceptor replay it.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Serialize `body` as the JSON payload of this request.
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self> {
        let encoded = serde_json::to_vec(body).context("Failed to serialize request body")?;
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Some(Bytes::from(encoded));
        Ok(self)
    }

    /// Set (or overwrite) the `Authorization: Bearer` header.
    pub fn bearer(mut self, token: &str) -> Result<Self> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
            .context("Access token is not a valid header value")?;
        value.set_sensitive(true);
        self.headers.insert(header::AUTHORIZATION, value);
        Ok(self)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fill in a timeout only when the caller did not pick one.
    pub fn or_timeout(mut self, timeout: Duration) -> Self {
        self.timeout.get_or_insert(timeout);
        self
    }

    /// The bearer token currently attached, if any.
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e)).into()
        })
    }

    /// Turn a non-success status into the matching `ApiError`.
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ApiError::from_status(self.status, &self.text()).into())
        }
    }
}

/// Response head plus a body that is still arriving.
pub struct StreamingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and buffer the whole response body.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Send a request and hand back the body as an incremental stream.
    /// The request timeout bounds only the wait for the response head.
    async fn open_stream(&self, request: HttpRequest) -> Result<StreamingResponse>;
}

/// `Transport` backed by a pooled reqwest client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// Wrap an existing client, sharing its connection pool.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn builder(&self, request: HttpRequest, apply_timeout: bool) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if apply_timeout {
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }
        }
        builder
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let timeout = request.timeout;
        debug!(method = %request.method, url = %request.url, "Sending request");

        let response = self
            .builder(request, true)
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(e, timeout))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::from_reqwest(e, timeout))?;

        Ok(HttpResponse { status, headers, body })
    }

    async fn open_stream(&self, request: HttpRequest) -> Result<StreamingResponse> {
        let timeout = request.timeout;
        debug!(url = %request.url, "Opening streaming request");

        // reqwest's per-request timeout would also cut the body, so only the
        // response head is bounded here.
        let pending = self.builder(request, false).send();
        let response = match timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| ApiError::Timeout(limit))?,
            None => pending.await,
        }
        .map_err(|e| ApiError::from_reqwest(e, timeout))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map_err(|e| anyhow::Error::from(ApiError::from(e)))
            .boxed();

        Ok(StreamingResponse { status, headers, body })
    }
}
