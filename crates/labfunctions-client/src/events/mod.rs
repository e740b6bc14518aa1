//! Live execution status over Server-Sent Events.
//!
//! - `EventStreamClient` / `EventStream`: listen to an execution until the
//!   server sends the `exit` sentinel
//! - `EventPublisher`: post events to the companion endpoint
//! - `FrameDecoder`: frame reassembly across arbitrary read boundaries

use anyhow::{anyhow, Context, Result};
use reqwest::Url;

pub mod decoder;
pub mod model;
pub mod publisher;
pub mod stream;

pub use decoder::FrameDecoder;
pub use model::{Event, EventPayload, EXIT_SENTINEL};
pub use publisher::EventPublisher;
pub use stream::{EventStream, EventStreamClient};

/// `{base}/events/{project}/{execution}/{action}`, ids escaped as single
/// path segments.
pub(crate) fn execution_url(base_url: &str, project_id: &str, execution_id: &str, action: &str) -> Result<Url> {
    let mut url = Url::parse(base_url).with_context(|| format!("Invalid service URL {}", base_url))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("Service URL {} cannot carry a path", base_url))?
        .pop_if_empty()
        .extend(["events", project_id, execution_id, action]);
    Ok(url)
}
