//! End-to-end exercises of the install state machine against a stub fetcher.
//!
//! Tests that drive a full update or rollback register a SIGTERM stream
//! first: a successful install signals its own process, and without a
//! handler that would take the test binary down with it.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use knockknock::{ArtifactFetcher, Config, Error, IpcServer, Supervisor, UpdateClient};
use tokio::signal::unix::{signal, Signal, SignalKind};

const BIN: &str = "widgetd";

fn elf_payload(tag: &str) -> Vec<u8> {
    let mut bytes = vec![0x7f, b'E', b'L', b'F'];
    bytes.extend_from_slice(tag.as_bytes());
    bytes
}

struct StubFetcher {
    tags: Vec<String>,
    write_binary: bool,
}

impl StubFetcher {
    fn installing() -> Self {
        Self {
            tags: Vec::new(),
            write_binary: true,
        }
    }

    fn broken() -> Self {
        Self {
            tags: Vec::new(),
            write_binary: false,
        }
    }

    fn with_tags(tags: &[&str]) -> Self {
        Self {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            write_binary: true,
        }
    }
}

#[async_trait]
impl ArtifactFetcher for StubFetcher {
    async fn list_tags(&self) -> knockknock::Result<Vec<String>> {
        Ok(self.tags.clone())
    }

    async fn download(&self, tag: &str, dest_dir: &Path) -> knockknock::Result<()> {
        if self.write_binary {
            fs::write(dest_dir.join(BIN), elf_payload(tag))?;
        }
        Ok(())
    }
}

fn test_config(root: &Path) -> Config {
    Config::new(BIN)
        .with_repo("acme/widgetd")
        .with_version("1.0.0")
        .with_binary_dir(root.join("bin"))
        .with_versions_dir(root.join("lib"))
}

fn supervisor_with(root: &Path, fetcher: StubFetcher) -> Supervisor {
    Supervisor::with_fetcher(test_config(root), Arc::new(fetcher)).unwrap()
}

fn data_dir(root: &Path) -> PathBuf {
    root.join("lib").join(BIN)
}

/// Drop a legacy (pre-symlink) executable at the user-visible path.
fn place_legacy_binary(root: &Path) {
    let bin_dir = root.join("bin");
    fs::create_dir_all(&bin_dir).unwrap();
    let bin = bin_dir.join(BIN);
    fs::write(&bin, elf_payload("legacy")).unwrap();
    fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();
}

fn backup_names(data_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(data_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_symlink()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("previous-"))
        .collect();
    names.sort();
    names
}

/// Basenames of the directories the backup links point at, oldest first.
fn backup_targets(data_dir: &Path) -> Vec<String> {
    backup_names(data_dir)
        .iter()
        .map(|name| {
            let target = fs::read_link(data_dir.join(name)).unwrap();
            target.file_name().unwrap().to_string_lossy().into_owned()
        })
        .collect()
}

async fn expect_sigterm(sig: &mut Signal) {
    let received = tokio::time::timeout(Duration::from_secs(2), sig.recv()).await;
    assert!(received.is_ok(), "supervisor should have signalled itself");
}

#[tokio::test]
async fn first_install_migrates_legacy_binary() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let mut sig = signal(SignalKind::terminate()).unwrap();

    place_legacy_binary(root);
    let sup = supervisor_with(root, StubFetcher::installing());

    sup.update("1.2.3").await.unwrap();
    expect_sigterm(&mut sig).await;

    let data = data_dir(root);

    let installed = data.join("versions/1.2.3").join(BIN);
    assert!(installed.is_file());
    let mode = fs::metadata(&installed).unwrap().permissions().mode();
    assert_ne!(mode & 0o111, 0, "installed binary must be executable");

    assert!(data.join("versions/legacy").join(BIN).is_file());

    assert_eq!(
        fs::read_link(data.join("current")).unwrap(),
        data.join("versions/1.2.3")
    );

    let bin = root.join("bin").join(BIN);
    assert!(fs::symlink_metadata(&bin).unwrap().file_type().is_symlink());
    assert_eq!(fs::read_link(&bin).unwrap(), data.join("current").join(BIN));
    // Following the whole chain lands on a real executable file.
    assert!(fs::metadata(&bin).unwrap().is_file());

    assert_eq!(backup_targets(&data), vec!["legacy"]);
}

#[tokio::test]
async fn second_update_stacks_backups() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let mut sig = signal(SignalKind::terminate()).unwrap();

    place_legacy_binary(root);
    let sup = supervisor_with(root, StubFetcher::installing());

    sup.update("1.2.3").await.unwrap();
    expect_sigterm(&mut sig).await;
    sup.update("1.2.4").await.unwrap();
    expect_sigterm(&mut sig).await;

    let data = data_dir(root);
    assert_eq!(
        fs::read_link(data.join("current")).unwrap(),
        data.join("versions/1.2.4")
    );

    let targets = backup_targets(&data);
    assert_eq!(targets.len(), 2);
    assert!(targets.contains(&"legacy".to_string()));
    assert!(targets.contains(&"1.2.3".to_string()));
}

#[tokio::test]
async fn consecutive_rollbacks_walk_backwards() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let mut sig = signal(SignalKind::terminate()).unwrap();

    place_legacy_binary(root);
    let sup = supervisor_with(root, StubFetcher::installing());
    sup.update("1.2.3").await.unwrap();
    expect_sigterm(&mut sig).await;
    sup.update("1.2.4").await.unwrap();
    expect_sigterm(&mut sig).await;

    let data = data_dir(root);

    // First rollback: back to 1.2.3, consuming its backup link.
    sup.rollback().await.unwrap();
    expect_sigterm(&mut sig).await;
    assert_eq!(
        fs::read_link(data.join("current")).unwrap(),
        data.join("versions/1.2.3")
    );
    assert_eq!(backup_targets(&data), vec!["legacy"]);

    // Second rollback: all the way to the migrated legacy install.
    sup.rollback().await.unwrap();
    expect_sigterm(&mut sig).await;
    assert_eq!(
        fs::read_link(data.join("current")).unwrap(),
        data.join("versions/legacy")
    );
    assert!(backup_names(&data).is_empty());

    // Nothing left to roll back to.
    let err = sup.rollback().await.unwrap_err();
    assert!(matches!(err, Error::NoBackups));
}

#[tokio::test]
async fn verification_refuses_truncated_download() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();

    // A fetcher that "succeeds" without writing content, against a
    // pre-existing zero-byte payload.
    let sup = supervisor_with(root, StubFetcher::broken());
    let data = data_dir(root);
    fs::create_dir_all(data.join("versions/9.9.9")).unwrap();
    fs::write(data.join("versions/9.9.9").join(BIN), b"").unwrap();

    let err = sup.update("9.9.9").await.unwrap_err();
    assert!(matches!(err, Error::Verify(_)), "got: {err}");

    // No mutation of the published state.
    assert!(fs::symlink_metadata(data.join("current")).is_err());
    assert!(backup_names(&data).is_empty());
    let stray: Vec<_> = fs::read_dir(&data)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
        .collect();
    assert!(stray.is_empty());
}

#[tokio::test]
async fn rotation_keeps_three_newest_backups() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let mut sig = signal(SignalKind::terminate()).unwrap();

    place_legacy_binary(root);
    let sup = supervisor_with(root, StubFetcher::installing());

    for version in ["1.2.3", "1.2.4", "1.2.5", "1.2.6"] {
        sup.update(version).await.unwrap();
        expect_sigterm(&mut sig).await;
    }

    let data = data_dir(root);
    let targets = backup_targets(&data);
    assert_eq!(targets.len(), 3, "backups: {targets:?}");
    // The legacy backup was the oldest and has been rotated out.
    assert!(targets.contains(&"1.2.3".to_string()));
    assert!(targets.contains(&"1.2.4".to_string()));
    assert!(targets.contains(&"1.2.5".to_string()));
}

#[tokio::test]
async fn failed_update_leaves_state_untouched() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let mut sig = signal(SignalKind::terminate()).unwrap();

    let sup = supervisor_with(root, StubFetcher::installing());
    sup.update("1.2.3").await.unwrap();
    expect_sigterm(&mut sig).await;
    sup.update("1.2.4").await.unwrap();
    expect_sigterm(&mut sig).await;

    let data = data_dir(root);
    let current_before = fs::read_link(data.join("current")).unwrap();
    let backups_before = backup_names(&data);

    // Same tree, but the fetcher now fails to produce a binary.
    let broken = supervisor_with(root, StubFetcher::broken());
    let err = broken.update("9.9.9").await.unwrap_err();
    assert!(matches!(err, Error::Download { .. }), "got: {err}");

    assert_eq!(fs::read_link(data.join("current")).unwrap(), current_before);
    assert_eq!(backup_names(&data), backups_before);
}

#[tokio::test]
async fn same_second_installs_get_distinct_backup_names() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let mut sig = signal(SignalKind::terminate()).unwrap();

    let sup = supervisor_with(root, StubFetcher::installing());
    // Three installs back to back, almost certainly inside one second.
    for version in ["1.0.1", "1.0.2", "1.0.3"] {
        sup.update(version).await.unwrap();
        expect_sigterm(&mut sig).await;
    }

    let data = data_dir(root);
    let names = backup_names(&data);
    assert_eq!(names.len(), 2);
    let unique: std::collections::BTreeSet<_> = names.iter().collect();
    assert_eq!(unique.len(), names.len(), "backup names must never collide");
    assert_eq!(backup_targets(&data), vec!["1.0.1", "1.0.2"]);
}

#[tokio::test]
async fn history_reports_backups_newest_first() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let mut sig = signal(SignalKind::terminate()).unwrap();

    place_legacy_binary(root);
    let sup = supervisor_with(root, StubFetcher::installing());
    for version in ["1.2.3", "1.2.4", "1.2.5"] {
        sup.update(version).await.unwrap();
        expect_sigterm(&mut sig).await;
    }

    let history = sup.history();
    assert_eq!(history.len(), 3);

    let versions: Vec<String> = history.iter().map(|h| h.version.to_string()).collect();
    assert!(versions.contains(&"0.0.0-legacy".to_string()));
    assert!(versions.contains(&"1.2.3".to_string()));
    assert!(versions.contains(&"1.2.4".to_string()));

    // Newest first.
    for pair in history.windows(2) {
        assert!(pair[0].last_installed >= pair[1].last_installed);
    }

    // Idempotent for fixed on-disk state.
    assert_eq!(sup.history(), history);
}

#[tokio::test]
async fn history_is_empty_without_data_dir() {
    let tmp = tempfile::tempdir().unwrap();
    let sup = supervisor_with(tmp.path(), StubFetcher::installing());
    assert!(sup.history().is_empty());
}

#[tokio::test]
async fn check_for_update_selects_semver_max() {
    let tmp = tempfile::tempdir().unwrap();
    let sup = supervisor_with(
        tmp.path(),
        StubFetcher::with_tags(&["v0.9.0", "2.0.0", "junk", "1.5.0"]),
    );

    let check = sup.check_for_update().await.unwrap();
    assert_eq!(check.latest.unwrap().to_string(), "2.0.0");
    let all: Vec<String> = check.all.iter().map(|v| v.to_string()).collect();
    assert_eq!(all, vec!["0.9.0", "1.5.0", "2.0.0"]);
}

#[tokio::test]
async fn check_for_update_none_when_current_is_newest() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path()).with_version("2.0.0");
    let sup = Supervisor::with_fetcher(
        config,
        Arc::new(StubFetcher::with_tags(&["1.0.0", "2.0.0"])),
    )
    .unwrap();

    let check = sup.check_for_update().await.unwrap();
    assert!(check.latest.is_none());
    assert_eq!(check.all.len(), 2);
}

#[tokio::test]
async fn check_for_update_fails_on_empty_registry() {
    let tmp = tempfile::tempdir().unwrap();
    let sup = supervisor_with(tmp.path(), StubFetcher::with_tags(&["nightly"]));

    let err = sup.check_for_update().await.unwrap_err();
    assert!(matches!(err, Error::Registry(_)));
    assert!(err.to_string().contains("no versions found"));
}

#[tokio::test]
async fn ipc_round_trip_over_unix_socket() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let mut sig = signal(SignalKind::terminate()).unwrap();

    place_legacy_binary(root);
    let sup = Arc::new(supervisor_with(
        root,
        StubFetcher::with_tags(&["1.2.3", "2.0.0"]),
    ));

    let socket = root.join("knockknock-test.sock");
    let server = IpcServer::bind(sup.clone(), &socket).unwrap();
    tokio::spawn(server.serve());

    let mut client = UpdateClient::connect(&socket).await.unwrap();

    let version = client.current_version().await.unwrap();
    assert_eq!(version.to_string(), "1.0.0");

    assert!(client.history().await.unwrap().is_empty());

    let check = client.check_for_update().await.unwrap();
    assert_eq!(check.latest.unwrap().to_string(), "2.0.0");

    // A full install driven over the socket.
    client.update("1.2.3").await.unwrap();
    expect_sigterm(&mut sig).await;
    let data = data_dir(root);
    assert_eq!(
        fs::read_link(data.join("current")).unwrap(),
        data.join("versions/1.2.3")
    );

    let history = client.history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version.to_string(), "0.0.0-legacy");
}

#[tokio::test]
async fn ipc_update_error_is_reported_to_client() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();

    let sup = Arc::new(supervisor_with(root, StubFetcher::broken()));
    let socket = root.join("knockknock-err.sock");
    let server = IpcServer::bind(sup, &socket).unwrap();
    tokio::spawn(server.serve());

    let mut client = UpdateClient::connect(&socket).await.unwrap();
    let err = client.update("9.9.9").await.unwrap_err();
    assert!(err.to_string().contains("download failed"), "got: {err}");
}
