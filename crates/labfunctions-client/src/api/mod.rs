//! HTTP plumbing for the labfunctions service.
//!
//! `Transport` is the replaceable network boundary, `ApiError` the failure
//! taxonomy, and `LabClient` the facade resource clients build on.

pub mod client;
pub mod error;
pub mod transport;

pub use client::LabClient;
pub use error::ApiError;
pub use transport::{
    BodyStream, HttpRequest, HttpResponse, ReqwestTransport, StreamingResponse, Transport,
};
