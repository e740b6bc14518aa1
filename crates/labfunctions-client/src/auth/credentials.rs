use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::ApiError;

/// Credentials file name inside the client home directory
pub const CREDENTIALS_FILE: &str = "credentials.json";

/// Environment variable holding an agent's initial access token
pub const AGENT_TOKEN_ENV: &str = "LF_AGENT_TOKEN";

/// Environment variable holding an agent's initial refresh token
pub const AGENT_REFRESH_ENV: &str = "LF_AGENT_REFRESH_TOKEN";

/// Refresh this long before the access token's `exp` claim.
const TOKEN_REFRESH_BUFFER_MINUTES: i64 = 5;

/// Access/refresh token pair. Replaced wholesale, never edited in place.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Claims carried by the access token. Read without signature checks:
/// the server stays the authority, these only drive local decisions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenClaims {
    pub usr: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub exp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub username: String,
    pub scopes: Vec<String>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// Decode the JWT payload of the access token, if it is a JWT.
    pub fn claims(&self) -> Option<TokenClaims> {
        let payload = self.access_token.split('.').nth(1)?;
        let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        serde_json::from_slice(&decoded).ok()
    }

    pub fn user(&self) -> Option<UserInfo> {
        let claims = self.claims()?;
        Some(UserInfo {
            username: claims.usr?,
            scopes: claims.scopes,
        })
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.claims()?.exp?, 0)
    }

    /// Whether the access token expires within the refresh buffer.
    /// Opaque tokens (no `exp`) are never considered stale.
    pub fn needs_refresh(&self) -> bool {
        self.expires_at()
            .map(|exp| Utc::now() + Duration::minutes(TOKEN_REFRESH_BUFFER_MINUTES) > exp)
            .unwrap_or(false)
    }
}

/// One source in the credential lookup chain.
pub trait CredentialProvider: Send + Sync {
    /// Short human description used in `CredentialsNotFound`.
    fn describe(&self) -> String;

    fn provide(&self) -> Result<Option<Credentials>>;

    /// Whether credentials found here should be written to disk.
    fn persist_on_load(&self) -> bool {
        true
    }
}

/// Reads the credentials JSON file.
pub struct FileProvider {
    path: PathBuf,
}

impl FileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialProvider for FileProvider {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    fn provide(&self) -> Result<Option<Credentials>> {
        read_credentials_file(&self.path)
    }

    fn persist_on_load(&self) -> bool {
        false
    }
}

/// Reads a token pair from two environment variables; both must be set.
pub struct EnvProvider {
    token_var: String,
    refresh_var: String,
}

impl EnvProvider {
    pub fn new(token_var: impl Into<String>, refresh_var: impl Into<String>) -> Self {
        Self {
            token_var: token_var.into(),
            refresh_var: refresh_var.into(),
        }
    }

    /// `LF_AGENT_TOKEN` / `LF_AGENT_REFRESH_TOKEN`
    pub fn agent() -> Self {
        Self::new(AGENT_TOKEN_ENV, AGENT_REFRESH_ENV)
    }
}

impl CredentialProvider for EnvProvider {
    fn describe(&self) -> String {
        format!("env {}/{}", self.token_var, self.refresh_var)
    }

    fn provide(&self) -> Result<Option<Credentials>> {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Ok(match (read(&self.token_var), read(&self.refresh_var)) {
            (Some(access), Some(refresh)) => Some(Credentials::new(access, refresh)),
            _ => None,
        })
    }
}

fn read_credentials_file(path: &Path) -> Result<Option<Credentials>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read credentials file {}", path.display()))?;
    let creds = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse credentials file {}", path.display()))?;
    Ok(Some(creds))
}

/// Owner of the on-disk credential pair plus the lookup chain used on first run.
pub struct CredentialStore {
    dir: PathBuf,
    sources: Vec<Box<dyn CredentialProvider>>,
}

impl CredentialStore {
    /// Store rooted at `dir`, looking up the file first and then the agent
    /// environment variables.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let sources: Vec<Box<dyn CredentialProvider>> = vec![
            Box::new(FileProvider::new(dir.join(CREDENTIALS_FILE))),
            Box::new(EnvProvider::agent()),
        ];
        Self { dir, sources }
    }

    pub fn with_sources(dir: impl Into<PathBuf>, sources: Vec<Box<dyn CredentialProvider>>) -> Self {
        Self {
            dir: dir.into(),
            sources,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    /// Try each source in order. Credentials from a source other than the
    /// file itself are persisted before being returned.
    pub fn load(&self) -> Result<Credentials> {
        for source in &self.sources {
            if let Some(creds) = source.provide()? {
                debug!(source = %source.describe(), "Loaded credentials");
                if source.persist_on_load() {
                    self.save(&creds)?;
                }
                return Ok(creds);
            }
        }

        let tried = self
            .sources
            .iter()
            .map(|s| s.describe())
            .collect::<Vec<_>>()
            .join(", ");
        Err(ApiError::CredentialsNotFound {
            home: self.dir.clone(),
            tried,
        }
        .into())
    }

    /// Read the credentials file only.
    pub fn read(&self) -> Result<Option<Credentials>> {
        read_credentials_file(&self.path())
    }

    /// Write the pair through a temp file + rename so readers never see a
    /// partial document.
    pub fn save(&self, creds: &Credentials) -> Result<()> {
        self.ensure_dir()?;
        let mut file = tempfile::NamedTempFile::new_in(&self.dir)
            .context("Failed to create temporary credentials file")?;
        serde_json::to_writer_pretty(&mut file, creds)
            .context("Failed to serialize credentials")?;
        file.flush()?;
        file.persist(self.path())
            .context("Failed to replace credentials file")?;
        info!(path = %self.path().display(), "Credentials stored");
        Ok(())
    }

    /// Delete stored credentials
    pub fn clear(&self) -> Result<()> {
        let path = self.path();
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to delete {}", path.display()))?;
        }
        Ok(())
    }

    /// Create the home directory if missing, restricted to the owner.
    pub fn ensure_dir(&self) -> Result<()> {
        create_private_dir(&self.dir)
    }
}

pub(crate) fn create_private_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to restrict permissions on {}", dir.display()))?;
    }
    Ok(())
}
