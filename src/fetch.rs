//! The artifact fetcher seam between the supervisor and the remote registry.

use std::path::Path;

use async_trait::async_trait;
use semver::Version;

use crate::error::Result;

/// Talks to a remote artifact registry.
///
/// Implementations own transport, auth, and pagination; the supervisor only
/// ever sees a finite tag list and a populated version directory. Errors
/// propagate unmodified to the caller, and a partial download may leave the
/// destination directory behind — it is never referenced by any symlink, so
/// the next install of the same version simply overwrites it.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// List every tag in the repository.
    async fn list_tags(&self) -> Result<Vec<String>>;

    /// Download the artifact for `tag` into `dest_dir`.
    ///
    /// Must produce at least a file named after the configured binary inside
    /// `dest_dir`; sibling files are allowed.
    async fn download(&self, tag: &str, dest_dir: &Path) -> Result<()>;
}

/// Parse tags into versions, skipping anything that is not semver, and
/// return them in ascending precedence order. A leading `v` is tolerated.
pub fn parse_versions(tags: &[String]) -> Vec<Version> {
    let mut versions: Vec<Version> = tags
        .iter()
        .filter_map(|tag| Version::parse(tag.strip_prefix('v').unwrap_or(tag)).ok())
        .collect();
    versions.sort();
    versions
}
