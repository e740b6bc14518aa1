//! Client transport core for the labfunctions workflow service.
//!
//! Every resource client (projects, workflows, history, cluster) sits on top
//! of two channels provided here:
//!
//! - an HTTP pipeline that attaches the session's bearer token and, when the
//!   server answers 401, refreshes the token once and replays the request
//! - an SSE channel streaming live execution events until the server sends
//!   the `exit` sentinel
//!
//! ```no_run
//! use labfunctions_client::{ClientConfig, LabClient};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut client = LabClient::new(ClientConfig::from_env()?.with_project("my-project"))?;
//! client.load_credentials()?;
//! client.ensure_fresh_token().await?;
//!
//! let mut events = client.events_listen("exec-1", None, None).await?;
//! while let Some(event) = events.next_event().await? {
//!     println!("{:?}: {}", event.event, event.data);
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod events;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{ApiError, HttpRequest, HttpResponse, LabClient, ReqwestTransport, Transport};
pub use auth::{AuthInterceptor, AuthSession, CredentialStore, Credentials, UserInfo};
pub use config::ClientConfig;
pub use events::{Event, EventPayload, EventPublisher, EventStream, EventStreamClient};
