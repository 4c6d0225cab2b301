//! The supervisor: owns the update lifecycle for one binary.
//!
//! Construction validates the configuration; the read operations here
//! (version, update check, history) take no locks and may run concurrently
//! with an install — they observe either the pre- or post-swap tree, never a
//! partial one, because every link swap is a single atomic rename.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDateTime;
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::{self, ArtifactFetcher};
use crate::github::GithubFetcher;
use crate::layout::{self, Layout, BACKUP_PREFIX, LEGACY_VERSION};

mod install;
pub(crate) mod watch;

/// How many `previous-*` backup links to retain after each install.
pub(crate) const KEEP_BACKUPS: usize = 3;

/// Result of an update check against the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCheck {
    /// Newest registry version strictly greater than the running one.
    pub latest: Option<Version>,
    /// Every registry version, ascending by semver precedence.
    pub all: Vec<Version>,
}

/// One entry of the rollback history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricVersion {
    pub version: Version,
    pub last_installed: NaiveDateTime,
}

pub struct Supervisor {
    config: Config,
    layout: Layout,
    current_version: Version,
    fetcher: Arc<dyn ArtifactFetcher>,
    /// Serializes update against rollback; reads never take it.
    write_lock: Mutex<()>,
}

impl Supervisor {
    /// Build a supervisor talking to the configured registry.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let fetcher = Arc::new(GithubFetcher::new(&config)?);
        Self::with_fetcher(config, fetcher)
    }

    /// Build a supervisor with a custom artifact fetcher.
    pub fn with_fetcher(config: Config, fetcher: Arc<dyn ArtifactFetcher>) -> Result<Self> {
        config.validate()?;
        let current_version = Version::parse(&config.version).map_err(|e| {
            Error::Config(format!("invalid current version '{}': {e}", config.version))
        })?;
        let layout = Layout::new(&config);

        Ok(Self {
            config,
            layout,
            current_version,
            fetcher,
            write_lock: Mutex::new(()),
        })
    }

    /// The version compiled into the running binary.
    pub fn current_version(&self) -> &Version {
        &self.current_version
    }

    pub(crate) fn layout(&self) -> &Layout {
        &self.layout
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// Ask the registry for available versions and whether one is newer than
    /// the running binary. Pure read; no filesystem mutation.
    pub async fn check_for_update(&self) -> Result<UpdateCheck> {
        let tags = self.fetcher.list_tags().await?;
        let all = fetch::parse_versions(&tags);

        if all.is_empty() {
            return Err(Error::Registry("no versions found in repository".into()));
        }

        let latest = match all.last() {
            Some(newest) if *newest > self.current_version => Some(newest.clone()),
            _ => None,
        };

        Ok(UpdateCheck { latest, all })
    }

    /// Rollback history, most recently installed first.
    ///
    /// Never fails hard: a scan error yields an empty list, and entries whose
    /// target cannot be resolved or parsed are skipped.
    pub fn history(&self) -> Vec<HistoricVersion> {
        let backups = match self.backup_links() {
            Ok(links) => links,
            Err(_) => return Vec::new(),
        };

        let mut history: Vec<HistoricVersion> = backups
            .iter()
            .filter_map(|link| {
                let target = fs::read_link(link).ok()?;
                let version = version_for_dir(target.file_name()?.to_str()?)?;
                let name = link.file_name()?.to_str()?;
                let last_installed = layout::parse_timestamp(name).unwrap_or_default();
                Some(HistoricVersion {
                    version,
                    last_installed,
                })
            })
            .collect();

        history.sort_by(|a, b| b.last_installed.cmp(&a.last_installed));
        history
    }

    /// All `previous-*` symlinks under the data dir, sorted by name.
    /// Timestamps are zero-padded, so name order equals creation order.
    fn backup_links(&self) -> Result<Vec<PathBuf>> {
        let mut links = Vec::new();

        for entry in fs::read_dir(self.layout.data_dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_symlink() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with(BACKUP_PREFIX) {
                links.push(entry.path());
            }
        }

        links.sort();
        Ok(links)
    }
}

/// Map a version directory name to its ordinal. The reserved `legacy` name
/// (a migrated pre-symlink install) sorts before every real release and is
/// never a candidate for "latest".
fn version_for_dir(name: &str) -> Option<Version> {
    if name == LEGACY_VERSION {
        Version::parse("0.0.0-legacy").ok()
    } else {
        Version::parse(name).ok()
    }
}
