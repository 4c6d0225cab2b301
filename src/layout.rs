//! On-disk layout conventions.
//!
//! All state for one supervised binary lives under
//! `<versions_dir>/<binary_name>/`:
//!
//! ```text
//! <versions_dir>/<binary_name>/
//!   versions/<V>/<binary_name>    immutable installed payloads
//!   versions/legacy/<binary_name> pre-existing install, migrated once
//!   current -> versions/<V>       published active version
//!   previous-<ts>[-<nonce>] -> versions/<V>
//! <binary_dir>/<binary_name> -> <data_dir>/current/<binary_name>
//! ```
//!
//! Every link is published with `symlink(target, tmp); rename(tmp, link)` so
//! readers observe either the old target or the new one, never a partial
//! state.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::NaiveDateTime;

use crate::config::Config;
use crate::error::{Error, Result};

pub(crate) const CURRENT_LINK: &str = "current";
pub(crate) const VERSIONS_SUBDIR: &str = "versions";
pub(crate) const LEGACY_VERSION: &str = "legacy";
pub(crate) const BACKUP_PREFIX: &str = "previous-";

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const TIMESTAMP_LEN: usize = 15;

/// Paths derived once from the configuration.
#[derive(Debug, Clone)]
pub struct Layout {
    data_dir: PathBuf,
    bin_path: PathBuf,
}

impl Layout {
    pub fn new(config: &Config) -> Self {
        Self {
            data_dir: config.versions_dir.join(&config.binary_name),
            bin_path: config.binary_dir.join(&config.binary_name),
        }
    }

    /// Per-binary state directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The user-visible executable path.
    pub fn bin_path(&self) -> &Path {
        &self.bin_path
    }

    /// The `current` symlink publishing the active version directory.
    pub fn current_link(&self) -> PathBuf {
        self.data_dir.join(CURRENT_LINK)
    }

    pub fn versions_root(&self) -> PathBuf {
        self.data_dir.join(VERSIONS_SUBDIR)
    }

    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.versions_root().join(version)
    }

    pub fn legacy_dir(&self) -> PathBuf {
        self.version_dir(LEGACY_VERSION)
    }

    pub fn backup_link(&self, suffix: &str) -> PathBuf {
        self.data_dir.join(format!("{BACKUP_PREFIX}{suffix}"))
    }
}

/// IPC socket path for this supervisor process.
pub fn socket_path() -> PathBuf {
    PathBuf::from(format!("/tmp/knockknock-{}.sock", std::process::id()))
}

/// Format a backup timestamp as `YYYYMMDD-HHMMSS` (local wall time).
pub fn format_timestamp(t: NaiveDateTime) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse the timestamp out of a `previous-*` link name. Tolerates a trailing
/// `-<nonce>` collision suffix by reading only the fixed-width stamp.
pub fn parse_timestamp(link_name: &str) -> Option<NaiveDateTime> {
    let rest = link_name.strip_prefix(BACKUP_PREFIX)?;
    let stamp = rest.get(..TIMESTAMP_LEN)?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()
}

static NONCE: AtomicU64 = AtomicU64::new(0);

/// A process-unique, monotonically increasing integer for temporary link
/// names and backup-name collision suffixes. Seeded from wall-clock nanos so
/// values also differ across supervisor restarts.
pub fn nonce() -> u64 {
    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    NONCE.fetch_max(clock, Ordering::Relaxed);
    NONCE.fetch_add(1, Ordering::Relaxed)
}

/// Atomically repoint `link` at `target`.
///
/// Creates a sibling `<link>.tmp.<nonce>` symlink and renames it over the
/// final name; the rename is the linearization point. The temporary link is
/// removed on failure, best effort.
pub fn swap_symlink(target: &Path, link: &Path) -> Result<()> {
    let name = link
        .file_name()
        .ok_or_else(|| Error::Swap(format!("link path has no file name: {}", link.display())))?;
    let tmp = link.with_file_name(format!("{}.tmp.{}", name.to_string_lossy(), nonce()));

    std::os::unix::fs::symlink(target, &tmp)
        .map_err(|e| Error::Swap(format!("creating {}: {e}", tmp.display())))?;

    if let Err(e) = fs::rename(&tmp, link) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::Swap(format!(
            "renaming {} to {}: {e}",
            tmp.display(),
            link.display()
        )));
    }

    Ok(())
}
