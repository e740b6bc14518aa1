use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use super::execution_url;
use super::model::{Event, EventPayload};
use crate::api::transport::HttpRequest;
use crate::auth::AuthInterceptor;

/// Posts events to an execution's `_publish` endpoint.
#[derive(Clone)]
pub struct EventPublisher {
    interceptor: AuthInterceptor,
    base_url: String,
    project_id: String,
    timeout: Duration,
}

impl EventPublisher {
    pub fn new(interceptor: AuthInterceptor, base_url: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            interceptor,
            base_url: base_url.into(),
            project_id: project_id.into(),
            timeout: Duration::from_secs(crate::config::DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Bound every publish (and its replay) by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn publish_url(&self, execution_id: &str) -> Result<String> {
        Ok(execution_url(&self.base_url, &self.project_id, execution_id, "_publish")?.into())
    }

    /// Publish one event. Empty payloads are logged and skipped without
    /// touching the network.
    pub async fn publish(
        &self,
        execution_id: &str,
        payload: impl Into<EventPayload>,
        event_type: Option<&str>,
    ) -> Result<()> {
        let data = payload.into().encode()?;
        if data.is_empty() {
            warn!(execution_id = %execution_id, "Empty event payload, not publishing");
            return Ok(());
        }

        let mut event = Event::new(data);
        event.event = event_type.map(str::to_string);

        let request = HttpRequest::post(self.publish_url(execution_id)?)
            .json(&event)?
            .timeout(self.timeout);
        self.interceptor.execute(request).await?.error_for_status()?;

        debug!(execution_id = %execution_id, event = ?event_type, "Event published");
        Ok(())
    }
}
