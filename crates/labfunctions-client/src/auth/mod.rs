//! Authentication core: credential storage, the live session and the
//! request interceptor.
//!
//! This module provides:
//! - `CredentialStore`: on-disk token pair with an environment fallback
//! - `AuthSession`: current credentials with single-flight refresh
//! - `AuthInterceptor`: bearer attachment and refresh-and-replay on 401

pub mod credentials;
pub mod interceptor;
pub mod session;

pub use credentials::{
    CredentialProvider, CredentialStore, Credentials, EnvProvider, FileProvider, TokenClaims,
    UserInfo,
};
pub use interceptor::AuthInterceptor;
pub use session::AuthSession;
