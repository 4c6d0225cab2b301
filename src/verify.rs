//! Executable sanity checks performed before a binary is promoted.
//!
//! The installer must never publish a file that cannot be executed: the init
//! system would relaunch the supervisor against it and crash-loop.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::error::{Error, Result};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Check that `path` is a non-empty, executable ELF file.
pub fn verify_binary(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path)
        .map_err(|e| Error::Verify(format!("binary not found at {}: {e}", path.display())))?;

    if !meta.is_file() {
        return Err(Error::Verify(format!(
            "{} is not a regular file",
            path.display()
        )));
    }

    if meta.len() == 0 {
        return Err(Error::Verify(format!("{} is empty", path.display())));
    }

    if meta.permissions().mode() & 0o111 == 0 {
        return Err(Error::Verify(format!(
            "{} is not executable",
            path.display()
        )));
    }

    let mut file = File::open(path)
        .map_err(|e| Error::Verify(format!("failed to open {}: {e}", path.display())))?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .map_err(|e| Error::Verify(format!("failed to read header of {}: {e}", path.display())))?;

    if magic != ELF_MAGIC {
        return Err(Error::Verify(format!(
            "{} is not a valid ELF file",
            path.display()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_file(dir: &Path, bytes: &[u8], mode: u32) -> std::path::PathBuf {
        let path = dir.join("bin");
        fs::write(&path, bytes).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn test_accepts_executable_elf() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), b"\x7fELFrest-of-binary", 0o755);
        assert!(verify_binary(&path).is_ok());
    }

    #[test]
    fn test_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = verify_binary(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, Error::Verify(_)));
    }

    #[test]
    fn test_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), b"", 0o755);
        let err = verify_binary(&path).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_rejects_non_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), b"\x7fELF", 0o644);
        let err = verify_binary(&path).unwrap_err();
        assert!(err.to_string().contains("not executable"));
    }

    #[test]
    fn test_rejects_wrong_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), b"#!/bin/sh\necho hi\n", 0o755);
        let err = verify_binary(&path).unwrap_err();
        assert!(err.to_string().contains("ELF"));
    }
}
