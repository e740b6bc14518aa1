//! Live execution events over a long-lived SSE connection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::{Stream, StreamExt};
use reqwest::header::{self, HeaderValue};
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use super::decoder::FrameDecoder;
use super::execution_url;
use super::model::Event;
use crate::api::transport::{BodyStream, HttpRequest, Transport};
use crate::api::ApiError;
use crate::auth::AuthSession;

/// Opens event streams for the executions of one project.
///
/// Streams use the session's current token as-is: a rejected token fails
/// the open with `ApiError::Unauthorized` instead of refreshing, so refresh
/// before listening (see `AuthSession::refresh_if_stale`).
#[derive(Clone)]
pub struct EventStreamClient {
    transport: Arc<dyn Transport>,
    session: Arc<AuthSession>,
    base_url: String,
    project_id: String,
}

impl EventStreamClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        session: Arc<AuthSession>,
        base_url: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            session,
            base_url: base_url.into(),
            project_id: project_id.into(),
        }
    }

    /// `{base}/events/{project}/{execution}/_listen[?last={id}]`
    pub fn listen_url(&self, execution_id: &str, last_event_id: Option<&str>) -> Result<String> {
        let mut url = execution_url(&self.base_url, &self.project_id, execution_id, "_listen")?;
        if let Some(last) = last_event_id {
            url.query_pairs_mut().append_pair("last", last);
        }
        Ok(url.into())
    }

    /// Open the stream of `execution_id`, resuming after `last_event_id`.
    /// `timeout` bounds the wait for the response head and for every
    /// subsequent read.
    pub async fn listen(
        &self,
        execution_id: &str,
        last_event_id: Option<&str>,
        timeout: Duration,
    ) -> Result<EventStream> {
        let url = self.listen_url(execution_id, last_event_id)?;
        let request = HttpRequest::get(url)
            .header(header::ACCEPT, HeaderValue::from_static("text/event-stream"))
            .header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))
            .bearer(&self.session.access_token())?
            .timeout(timeout);

        let response = self.transport.open_stream(request).await?;
        if response.status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized.into());
        }
        if !response.status.is_success() {
            let detail = error_detail(response.body, timeout).await;
            return Err(ApiError::from_status(response.status, &detail).into());
        }

        info!(execution_id = %execution_id, last = ?last_event_id, "Listening for events");
        Ok(EventStream::new(response.body, timeout)
            .resuming_from(last_event_id.map(str::to_string)))
    }
}

/// Longest error body read from a rejected listen.
const ERROR_BODY_LIMIT: usize = 4096;

/// Best-effort read of a rejected response's body, bounded by `timeout`.
async fn error_detail(mut body: BodyStream, timeout: Duration) -> String {
    let read = tokio::time::timeout(timeout, async move {
        let mut buf = Vec::new();
        while let Some(Ok(chunk)) = body.next().await {
            buf.extend_from_slice(&chunk);
            if buf.len() >= ERROR_BODY_LIMIT {
                break;
            }
        }
        buf
    })
    .await;
    read.map(|buf| String::from_utf8_lossy(&buf).into_owned()).unwrap_or_default()
}

/// Lazy sequence of events from one connection.
///
/// `next_event` yields `Ok(Some(_))` per event, `Ok(None)` once the exit
/// sentinel arrives (or after `close`), and an error if the connection drops
/// first. A finished or closed stream stays finished; resume with a new
/// `listen` call using `last_event_id()`.
pub struct EventStream {
    body: Option<BodyStream>,
    decoder: FrameDecoder,
    read_timeout: Duration,
    last_event_id: Option<String>,
}

impl EventStream {
    pub fn new(body: BodyStream, read_timeout: Duration) -> Self {
        Self {
            body: Some(body),
            decoder: FrameDecoder::new(),
            read_timeout,
            last_event_id: None,
        }
    }

    fn resuming_from(mut self, last_event_id: Option<String>) -> Self {
        self.last_event_id = last_event_id;
        self
    }

    /// Id of the last event seen on this stream (or the resume cursor it
    /// was opened with).
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.body.is_none()
    }

    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        loop {
            let Some(body) = self.body.as_mut() else {
                return Ok(None);
            };

            if let Some(frame) = self.decoder.next_frame() {
                let event = Event::from_frame(&frame);
                if event.is_exit() {
                    debug!("Exit signal received, closing event stream");
                    self.close();
                    return Ok(None);
                }
                if let Some(ref id) = event.id {
                    self.last_event_id = Some(id.clone());
                }
                return Ok(Some(event));
            }

            let read = tokio::time::timeout(self.read_timeout, body.next()).await;
            match read {
                Ok(Some(Ok(chunk))) => self.decoder.push(&chunk),
                Ok(Some(Err(err))) => {
                    self.close();
                    return Err(err);
                }
                Ok(None) => {
                    warn!(last = ?self.last_event_id, "Event stream ended before exit signal");
                    self.close();
                    return Err(ApiError::StreamClosed {
                        last_event_id: self.last_event_id.clone(),
                    }
                    .into());
                }
                Err(_) => {
                    self.close();
                    return Err(ApiError::Timeout(self.read_timeout).into());
                }
            }
        }
    }

    /// Drop the connection and anything buffered. No event is yielded after this.
    pub fn close(&mut self) {
        if self.body.take().is_some() {
            debug!("Event stream connection released");
        }
        self.decoder.clear();
    }

    /// Adapt into a `futures::Stream`, ending cleanly on the exit signal.
    pub fn into_stream(self) -> impl Stream<Item = Result<Event>> + Send {
        futures::stream::try_unfold(self, |mut stream| async move {
            Ok(stream.next_event().await?.map(|event| (event, stream)))
        })
    }
}
