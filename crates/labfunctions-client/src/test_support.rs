//! Scripted `Transport` for unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use reqwest::StatusCode;

use crate::api::transport::{HttpRequest, HttpResponse, StreamingResponse, Transport};

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync;

/// Body script for `open_stream`.
pub(crate) struct StreamScript {
    pub status: StatusCode,
    pub chunks: Vec<&'static str>,
    /// Keep the connection open (pending) after the last chunk.
    pub hang: bool,
}

pub(crate) struct ScriptedTransport {
    handler: Box<Handler>,
    latency: Duration,
    stream: Mutex<Option<StreamScript>>,
    sent: Mutex<Vec<HttpRequest>>,
    /// Set once the streaming body has been dropped.
    pub released: Arc<AtomicBool>,
}

impl ScriptedTransport {
    pub fn new(handler: impl Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            latency: Duration::ZERO,
            stream: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn streaming(status: StatusCode, chunks: Vec<&'static str>, hang: bool) -> Self {
        let transport = Self::new(|_| Ok(HttpResponse::new(StatusCode::OK, "")));
        *transport.stream.lock() = Some(StreamScript { status, chunks, hang });
        transport
    }

    /// Delay every `send`, so concurrent callers overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn sent(&self) -> Vec<HttpRequest> {
        self.sent.lock().clone()
    }

    pub fn count(&self, url_suffix: &str) -> usize {
        self.sent.lock().iter().filter(|r| r.url.ends_with(url_suffix)).count()
    }
}

struct ReleaseGuard(Arc<AtomicBool>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.sent.lock().push(request.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        (self.handler)(&request)
    }

    async fn open_stream(&self, request: HttpRequest) -> Result<StreamingResponse> {
        self.sent.lock().push(request);
        let script = self
            .stream
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("no stream scripted"))?;

        let guard = ReleaseGuard(self.released.clone());
        let chunks = stream::iter(
            script
                .chunks
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                .collect::<Vec<Result<Bytes>>>(),
        );
        let body = if script.hang {
            chunks.chain(stream::pending()).boxed()
        } else {
            chunks.boxed()
        };
        let body = body
            .map(move |item| {
                let _held = &guard;
                item
            })
            .boxed();

        Ok(StreamingResponse {
            status: script.status,
            headers: Default::default(),
            body,
        })
    }
}

/// Plain JSON response.
pub(crate) fn json_response(status: StatusCode, body: serde_json::Value) -> Result<HttpResponse> {
    Ok(HttpResponse::new(status, body.to_string()))
}
