//! GitHub Releases artifact fetcher.
//!
//! Treats the configured `repo` as `owner/repo`. Each release tag is one
//! installable version; the release must carry either an asset named exactly
//! like the binary (raw executable) or a platform tarball named
//! `<binary>-<version>-<os>-<arch>.tar.gz` containing it.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::{AuthConfig, Config};
use crate::error::{Error, Result};
use crate::fetch::ArtifactFetcher;

const API_BASE: &str = "https://api.github.com";
const PAGE_SIZE: usize = 100;

/// A GitHub release.
#[derive(Debug, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

/// A single downloadable release asset.
#[derive(Debug, Deserialize)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
}

pub struct GithubFetcher {
    client: reqwest::Client,
    owner: String,
    repo: String,
    binary_name: String,
    auth: Option<AuthConfig>,
}

impl GithubFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        let (owner, repo) = config
            .repo
            .split_once('/')
            .ok_or_else(|| Error::Config(format!("repo must be 'owner/repo', got '{}'", config.repo)))?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("knockknock/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Registry(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            owner: owner.to_string(),
            repo: repo.to_string(),
            binary_name: config.binary_name.clone(),
            auth: config.auth.clone(),
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json");
        if let Some(auth) = &self.auth {
            if let Some(token) = &auth.token {
                req = req.bearer_auth(token);
            } else if let Some(username) = &auth.username {
                req = req.basic_auth(username, auth.password.as_deref());
            }
        }
        req
    }

    async fn fetch_release(&self, tag: &str) -> Result<Release> {
        let url = format!(
            "{API_BASE}/repos/{}/{}/releases/tags/{tag}",
            self.owner, self.repo
        );
        let response = self
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Registry(format!("fetching release '{tag}': {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::TagNotFound(tag.to_string()));
        }
        if !response.status().is_success() {
            return Err(Error::Registry(format!(
                "registry returned {} for {url}",
                response.status()
            )));
        }

        response
            .json::<Release>()
            .await
            .map_err(|e| Error::Registry(format!("parsing release '{tag}': {e}")))
    }

    async fn fetch_bytes(&self, url: &str, tag: &str) -> Result<Vec<u8>> {
        let response = self.get(url).send().await.map_err(|e| Error::Download {
            version: tag.to_string(),
            reason: e.to_string(),
        })?;

        if !response.status().is_success() {
            return Err(Error::Download {
                version: tag.to_string(),
                reason: format!("registry returned {} for {url}", response.status()),
            });
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::Download {
                version: tag.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl ArtifactFetcher for GithubFetcher {
    async fn list_tags(&self) -> Result<Vec<String>> {
        let mut tags = Vec::new();

        for page in 1.. {
            let url = format!(
                "{API_BASE}/repos/{}/{}/releases?per_page={PAGE_SIZE}&page={page}",
                self.owner, self.repo
            );
            let response = self
                .get(&url)
                .send()
                .await
                .map_err(|e| Error::Registry(format!("listing releases: {e}")))?;

            if !response.status().is_success() {
                return Err(Error::Registry(format!(
                    "registry returned {} for {url}",
                    response.status()
                )));
            }

            let releases: Vec<Release> = response
                .json()
                .await
                .map_err(|e| Error::Registry(format!("parsing release list: {e}")))?;

            let count = releases.len();
            tags.extend(releases.into_iter().map(|r| r.tag_name));

            if count < PAGE_SIZE {
                break;
            }
        }

        Ok(tags)
    }

    async fn download(&self, tag: &str, dest_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dest_dir)?;

        let release = self.fetch_release(tag).await?;
        let asset = select_asset(&release.assets, &self.binary_name, tag).ok_or_else(|| {
            Error::Download {
                version: tag.to_string(),
                reason: format!(
                    "no asset named '{}' or matching platform tarball",
                    self.binary_name
                ),
            }
        })?;

        let bytes = self.fetch_bytes(&asset.browser_download_url, tag).await?;
        let dest = dest_dir.join(&self.binary_name);

        if asset.name.ends_with(".tar.gz") {
            extract_tar_gz(&bytes, &dest, &self.binary_name, tag)
        } else {
            std::fs::write(&dest, &bytes).map_err(|e| Error::Download {
                version: tag.to_string(),
                reason: format!("writing {}: {e}", dest.display()),
            })
        }
    }
}

/// `(os, arch)` pair used in platform tarball names.
fn platform_target() -> (&'static str, &'static str) {
    let os = if cfg!(target_os = "macos") {
        "darwin"
    } else {
        "linux"
    };
    let arch = if cfg!(target_arch = "aarch64") {
        "arm64"
    } else {
        "x86_64"
    };
    (os, arch)
}

/// Pick the asset to install: an exact binary-name match wins, otherwise the
/// platform tarball for this tag.
fn select_asset<'a>(assets: &'a [Asset], binary_name: &str, tag: &str) -> Option<&'a Asset> {
    if let Some(raw) = assets.iter().find(|a| a.name == binary_name) {
        return Some(raw);
    }
    let (os, arch) = platform_target();
    let version = tag.strip_prefix('v').unwrap_or(tag);
    let tarball = format!("{binary_name}-{version}-{os}-{arch}.tar.gz");
    assets.iter().find(|a| a.name == tarball)
}

/// Extract `binary_name` out of a gzipped tarball, wherever it is nested.
fn extract_tar_gz(data: &[u8], dest: &Path, binary_name: &str, tag: &str) -> Result<()> {
    let gz = flate2::read::GzDecoder::new(data);
    let mut archive = tar::Archive::new(gz);

    let entries = archive.entries().map_err(|e| Error::Download {
        version: tag.to_string(),
        reason: format!("reading archive: {e}"),
    })?;

    for entry in entries {
        let mut entry = entry.map_err(|e| Error::Download {
            version: tag.to_string(),
            reason: format!("reading archive entry: {e}"),
        })?;
        let matches = entry
            .path()
            .ok()
            .and_then(|p| p.file_name().map(|n| n == binary_name))
            .unwrap_or(false);
        if matches {
            entry.unpack(dest).map_err(|e| Error::Download {
                version: tag.to_string(),
                reason: format!("extracting '{binary_name}': {e}"),
            })?;
            return Ok(());
        }
    }

    Err(Error::Download {
        version: tag.to_string(),
        reason: format!("'{binary_name}' not found in archive"),
    })
}
