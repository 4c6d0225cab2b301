//! Supervisor configuration.
//!
//! A plain value object the host binary fills in at startup, typically with
//! the version stamped in at build time:
//!
//! ```rust
//! use knockknock::Config;
//!
//! let config = Config::new("widgetd")
//!     .with_repo("acme/widgetd")
//!     .with_version(env!("CARGO_PKG_VERSION"));
//! ```

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// File name of the executable the user invokes (e.g. `"widgetd"`).
    pub binary_name: String,
    /// Directory containing the user-visible symlink.
    #[serde(default = "default_binary_dir")]
    pub binary_dir: PathBuf,
    /// Parent directory under which per-binary version state lives.
    #[serde(default = "default_versions_dir")]
    pub versions_dir: PathBuf,
    /// Registry reference to pull updates from (e.g. `"acme/widgetd"`).
    /// Opaque to everything but the artifact fetcher.
    #[serde(default)]
    pub repo: String,
    /// Current semantic version, typically `env!("CARGO_PKG_VERSION")`.
    #[serde(default)]
    pub version: String,
    /// Optional registry credentials.
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

/// Credentials for the artifact registry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

fn default_binary_dir() -> PathBuf {
    PathBuf::from("/usr/local/bin")
}

fn default_versions_dir() -> PathBuf {
    PathBuf::from("/usr/local/lib")
}

impl Config {
    /// Create a config for the named binary with default directories
    /// (`/usr/local/bin` and `/usr/local/lib`).
    pub fn new(binary_name: impl Into<String>) -> Self {
        Self {
            binary_name: binary_name.into(),
            binary_dir: default_binary_dir(),
            versions_dir: default_versions_dir(),
            repo: String::new(),
            version: String::new(),
            auth: None,
        }
    }

    /// Set the registry repository updates are pulled from.
    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = repo.into();
        self
    }

    /// Set the version compiled into the running binary.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set registry credentials.
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Override the directory holding the user-visible symlink.
    pub fn with_binary_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.binary_dir = dir.into();
        self
    }

    /// Override the base directory for version state.
    pub fn with_versions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.versions_dir = dir.into();
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.binary_name.is_empty() {
            return Err(Error::Config("binary name is required".into()));
        }
        if self.repo.is_empty() {
            return Err(Error::Config("repo is required".into()));
        }
        if self.version.is_empty() {
            return Err(Error::Config("version is required".into()));
        }
        Ok(())
    }
}

impl AuthConfig {
    /// Token (bearer) credentials.
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }

    /// Username/password (basic) credentials.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            ..Self::default()
        }
    }
}
