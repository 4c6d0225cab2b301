//! The install state machine: stage, verify, swap, rotate, roll back.
//!
//! Every transition that can leave partial state goes through
//! create-temp-then-rename; an abort at any point leaves either the old
//! `current` intact or a `previous-*` link usable for manual recovery. The
//! rename of `current` is the linearization point of an install.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::layout;
use crate::verify::verify_binary;

use super::{Supervisor, KEEP_BACKUPS};

impl Supervisor {
    /// Download, verify, and atomically install `version`, then hand control
    /// back to the init system by signalling this process.
    ///
    /// On success the supervisor receives SIGTERM before the IPC reply can be
    /// flushed; callers must tolerate the connection closing.
    pub async fn update(&self, version: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        info!(version, "installing update");

        let version_dir = self.layout().version_dir(version);
        fs::create_dir_all(&version_dir)?;

        self.fetcher.download(version, &version_dir).await?;

        let binary = version_dir.join(&self.config().binary_name);
        if !binary.is_file() {
            return Err(Error::Download {
                version: version.to_string(),
                reason: format!("fetcher produced no '{}' file", self.config().binary_name),
            });
        }
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755))?;

        verify_binary(&binary)?;

        self.backup_current()?;
        layout::swap_symlink(&version_dir, &self.layout().current_link())?;
        self.update_bin_symlink()?;

        if let Err(e) = self.rotate_backups(KEEP_BACKUPS) {
            warn!(error = %e, "failed to prune old backups");
        }

        info!(version, "update installed, restarting");
        self.request_restart()
    }

    /// Swap `current` back to the most recent backup, consuming its
    /// `previous-*` link so successive rollbacks walk backwards in history.
    pub async fn rollback(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let backups = self.backup_links()?;
        let newest = backups.last().ok_or(Error::NoBackups)?;

        let target = fs::read_link(newest)?;
        verify_binary(&target.join(&self.config().binary_name))?;

        layout::swap_symlink(&target, &self.layout().current_link())?;
        self.update_bin_symlink()?;

        if let Err(e) = fs::remove_file(newest) {
            warn!(link = %newest.display(), error = %e, "failed to remove consumed backup link");
        }

        info!(target = %target.display(), "rolled back, restarting");
        self.request_restart()
    }

    /// Record the target of `current` as a `previous-<timestamp>` link.
    /// Skipped on first install. An existing backup link is never
    /// overwritten: a same-second collision gets a nonce suffix.
    fn backup_current(&self) -> Result<()> {
        let target = match fs::read_link(self.layout().current_link()) {
            Ok(target) => target,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        self.create_backup_link(&target)
    }

    fn create_backup_link(&self, target: &Path) -> Result<()> {
        let stamp = layout::format_timestamp(chrono::Local::now().naive_local());
        let link = self.layout().backup_link(&stamp);

        match std::os::unix::fs::symlink(target, &link) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let link = self
                    .layout()
                    .backup_link(&format!("{stamp}-{}", layout::nonce()));
                std::os::unix::fs::symlink(target, link)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ensure the user-visible binary path is a symlink through `current`.
    /// A pre-existing regular file there is a legacy install and is migrated
    /// into the versions tree first.
    fn update_bin_symlink(&self) -> Result<()> {
        let bin = self.layout().bin_path();

        match fs::symlink_metadata(bin) {
            Ok(meta) if !meta.file_type().is_symlink() => self.migrate_legacy()?,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(dir) = bin.parent() {
                    fs::create_dir_all(dir)?;
                }
            }
            Err(e) => return Err(e.into()),
        }

        let target = self.layout().current_link().join(&self.config().binary_name);
        layout::swap_symlink(&target, bin)
    }

    /// Move a regular file at `bin_path` into `versions/legacy/` and record
    /// it in the backup history so it stays reachable by rollback.
    fn migrate_legacy(&self) -> Result<()> {
        let legacy_dir = self.layout().legacy_dir();
        fs::create_dir_all(&legacy_dir)
            .map_err(|e| Error::Migration(format!("creating {}: {e}", legacy_dir.display())))?;

        let dest = legacy_dir.join(&self.config().binary_name);
        move_file(self.layout().bin_path(), &dest)?;
        info!(dest = %dest.display(), "migrated legacy binary");

        // Best effort: the migration itself must not fail on this.
        if let Err(e) = self.create_backup_link(&legacy_dir) {
            warn!(error = %e, "failed to record backup link for legacy binary");
        }

        Ok(())
    }

    /// Remove all but the newest `keep` backup links. Per-link failures are
    /// logged and skipped.
    fn rotate_backups(&self, keep: usize) -> Result<()> {
        let backups = self.backup_links()?;
        if backups.len() <= keep {
            return Ok(());
        }

        for link in &backups[..backups.len() - keep] {
            if let Err(e) = fs::remove_file(link) {
                warn!(link = %link.display(), error = %e, "failed to remove aged backup link");
            }
        }

        Ok(())
    }

    /// SIGTERM ourselves so the init system relaunches the process group
    /// against the freshly swapped symlinks.
    fn request_restart(&self) -> Result<()> {
        kill(Pid::this(), Signal::SIGTERM).map_err(|e| Error::Signal(e.to_string()))
    }
}

/// Rename `src` to `dst`, degrading to copy+fsync+unlink when the two sit on
/// different filesystems.
fn move_file(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(nix::libc::EXDEV) => {
            fs::copy(src, dst)
                .and_then(|_| fs::File::open(dst)?.sync_all())
                .and_then(|_| fs::remove_file(src))
                .map_err(|e| {
                    Error::Migration(format!(
                        "copying {} to {}: {e}",
                        src.display(),
                        dst.display()
                    ))
                })
        }
        Err(e) => Err(Error::Migration(format!(
            "renaming {} to {}: {e}",
            src.display(),
            dst.display()
        ))),
    }
}
