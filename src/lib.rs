//! # knockknock
//!
//! A self-updating supervisor embedded in long-running service binaries.
//!
//! The host executable calls [`run`] from its `main`. The first invocation
//! becomes the **supervisor**: it serves update requests over a local socket
//! and re-executes the binary as a **child** that runs the application's
//! real work. When the child asks for an update, the supervisor downloads
//! and verifies the new version, publishes it by atomically swapping the
//! `current` symlink, and exits so the init system relaunches everything
//! against the new binary. Crash-looping children are rolled back to the
//! previous version automatically.
//!
//! ## Quick start
//!
//! ```no_run
//! use knockknock::Config;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::new("widgetd")
//!         .with_repo("acme/widgetd")
//!         .with_version(env!("CARGO_PKG_VERSION"));
//!
//!     knockknock::run(config, |mut client| async move {
//!         // ... the application's actual work ...
//!         if let Ok(check) = client.check_for_update().await {
//!             if let Some(version) = check.latest {
//!                 let _ = client.update(&version.to_string()).await;
//!             }
//!         }
//!     })
//!     .await;
//! }
//! ```
//!
//! ## On-disk contract
//!
//! State lives under `<versions_dir>/<binary_name>/`; the published
//! `current` symlink always points at a version directory, and every swap is
//! a single atomic rename. See [`layout`] for the full tree. The atomicity
//! relies on POSIX rename semantics within one directory; filesystems
//! without that guarantee (some network mounts) weaken the crash-safety
//! story accordingly.

use std::future::Future;
use std::process;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod error;
pub mod fetch;
pub mod github;
pub mod ipc;
pub mod layout;
pub mod supervisor;
pub mod verify;

pub use config::{AuthConfig, Config};
pub use error::{Error, Result};
pub use fetch::ArtifactFetcher;
pub use github::GithubFetcher;
pub use ipc::client::UpdateClient;
pub use ipc::server::IpcServer;
pub use supervisor::{HistoricVersion, Supervisor, UpdateCheck};

/// Environment variable carrying the IPC socket path. Its presence is the
/// sole signal that this process is the child.
pub const SOCKET_ENV: &str = "KNOCKKNOCK_SOCKET";

/// Split into supervisor and child and never return.
///
/// The supervisor path validates the config, serves IPC, and supervises the
/// child until shutdown. The child path connects an [`UpdateClient`] and
/// hands it to `user_main`; a panic inside `user_main` is contained and
/// reported to the supervisor as an unclean exit.
pub async fn run<F, Fut>(config: Config, user_main: F) -> std::convert::Infallible
where
    F: FnOnce(UpdateClient) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    init_tracing();

    match std::env::var(SOCKET_ENV) {
        Ok(socket) => run_child(socket, user_main).await,
        Err(_) => run_supervisor(config).await,
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

async fn run_supervisor(config: Config) -> std::convert::Infallible {
    info!(
        pid = process::id(),
        version = %config.version,
        "running as supervisor"
    );

    let supervisor = match Supervisor::new(config) {
        Ok(supervisor) => Arc::new(supervisor),
        Err(e) => {
            error!(error = %e, "failed to initialize supervisor");
            process::exit(1);
        }
    };

    let socket = layout::socket_path();
    info!(socket = %socket.display(), "starting ipc server");

    let server = match IpcServer::bind(supervisor.clone(), &socket) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to bind ipc socket");
            process::exit(1);
        }
    };
    tokio::spawn(server.serve());

    let code = supervisor::watch::run(supervisor, &socket).await;
    let _ = std::fs::remove_file(&socket);
    process::exit(code);
}

async fn run_child<F, Fut>(socket: String, user_main: F) -> std::convert::Infallible
where
    F: FnOnce(UpdateClient) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    info!(pid = process::id(), socket = %socket, "running as child");

    let client = match UpdateClient::connect(&socket).await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to connect update client");
            process::exit(1);
        }
    };

    match tokio::spawn(user_main(client)).await {
        Ok(()) => process::exit(0),
        Err(e) if e.is_panic() => {
            error!("application main panicked");
            process::exit(1);
        }
        Err(_) => {
            error!("application main was cancelled");
            process::exit(1);
        }
    }
}
