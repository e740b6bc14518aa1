//! Client configuration.
//!
//! Holds the service address, API version, request timeout, the current
//! project and the home directory where credentials are kept
//! (`~/.labfunctions` unless overridden).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Directory under the user's home holding client state
pub const CLIENT_HOME_DIR: &str = ".labfunctions";

/// Default API version segment
pub const API_VERSION: &str = "v1";

/// Default service address
pub const DEFAULT_SERVICE_URL: &str = "http://localhost:8000";

/// Default timeout for a single request, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub const SERVICE_URL_ENV: &str = "LF_SERVICE_URL";
pub const API_VERSION_ENV: &str = "LF_API_VERSION";
pub const TIMEOUT_ENV: &str = "LF_CLIENT_TIMEOUT";
pub const PROJECT_ENV: &str = "LF_PROJECTID";
pub const HOME_ENV: &str = "LF_HOME";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub service_url: String,
    pub api_version: String,
    pub timeout: Duration,
    pub project_id: Option<String>,
    /// Overrides `~/.labfunctions`
    pub home_dir: Option<PathBuf>,
    /// Persist credentials after login and refresh
    pub store_credentials: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_string(),
            api_version: API_VERSION.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            project_id: None,
            home_dir: None,
            store_credentials: true,
        }
    }
}

impl ClientConfig {
    pub fn new(service_url: impl Into<String>) -> Self {
        Self {
            service_url: service_url.into(),
            ..Self::default()
        }
    }

    /// Build a config from `LF_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(url) = lookup(SERVICE_URL_ENV) {
            config.service_url = url;
        }
        if let Some(version) = lookup(API_VERSION_ENV) {
            config.api_version = version;
        }
        if let Some(secs) = lookup(TIMEOUT_ENV) {
            let secs: u64 = secs
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds", TIMEOUT_ENV))?;
            config.timeout = Duration::from_secs(secs);
        }
        config.project_id = lookup(PROJECT_ENV).filter(|p| !p.is_empty());
        config.home_dir = lookup(HOME_ENV).map(PathBuf::from);
        Ok(config)
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_home_dir(mut self, home_dir: impl Into<PathBuf>) -> Self {
        self.home_dir = Some(home_dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `{service_url}/{api_version}`
    pub fn base_url(&self) -> String {
        format!(
            "{}/{}",
            self.service_url.trim_end_matches('/'),
            self.api_version.trim_matches('/')
        )
    }

    /// Absolute URL for an API path such as `auth/login`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url(), path.trim_start_matches('/'))
    }

    pub fn home_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.home_dir {
            return Ok(dir.clone());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(CLIENT_HOME_DIR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_endpoint_joins_segments() {
        let config = ClientConfig::new("http://lab.local:8000/");
        assert_eq!(config.base_url(), "http://lab.local:8000/v1");
        assert_eq!(
            config.endpoint("/auth/refresh_token"),
            "http://lab.local:8000/v1/auth/refresh_token"
        );
    }

    #[test]
    fn test_from_lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (SERVICE_URL_ENV, "https://lab.example.com"),
            (TIMEOUT_ENV, "5"),
            (PROJECT_ENV, "proj1"),
            (HOME_ENV, "/tmp/lab"),
        ]);
        let config = ClientConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.service_url, "https://lab.example.com");
        assert_eq!(config.api_version, API_VERSION);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.project_id.as_deref(), Some("proj1"));
        assert_eq!(config.home_dir().unwrap(), PathBuf::from("/tmp/lab"));
    }

    #[test]
    fn test_from_lookup_rejects_bad_timeout() {
        let result = ClientConfig::from_lookup(|k| (k == TIMEOUT_ENV).then(|| "soon".to_string()));
        assert!(result.is_err());
    }
}
