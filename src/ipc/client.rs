//! The child-side RPC client.
//!
//! Handed to the application's main by [`crate::run`]; the child never needs
//! to know the socket path. Connecting retries briefly because the
//! supervisor may still be binding the socket when the child comes up.

use std::path::Path;
use std::time::Duration;

use semver::Version;
use tokio::io::BufReader;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};

use crate::error::{Error, Result};
use crate::ipc::{read_frame, write_frame, Request, Response};
use crate::supervisor::{HistoricVersion, UpdateCheck};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_BACKOFF_START: Duration = Duration::from_millis(50);
const CONNECT_BACKOFF_CAP: Duration = Duration::from_millis(500);

pub struct UpdateClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl UpdateClient {
    /// Connect to the supervisor socket, retrying with backoff.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut delay = CONNECT_BACKOFF_START;
        let mut last_error = None;

        for attempt in 0..CONNECT_ATTEMPTS {
            match UnixStream::connect(path).await {
                Ok(stream) => {
                    let (reader, writer) = stream.into_split();
                    return Ok(Self {
                        reader: BufReader::new(reader),
                        writer,
                        timeout: DEFAULT_TIMEOUT,
                    });
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt + 1 < CONNECT_ATTEMPTS {
                        sleep(delay).await;
                        delay = (delay * 2).min(CONNECT_BACKOFF_CAP);
                    }
                }
            }
        }

        Err(Error::Ipc(format!(
            "connecting to {} after {CONNECT_ATTEMPTS} attempts: {}",
            path.display(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Override the per-call deadline (default 30s).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ask the supervisor whether a newer version exists in the registry.
    pub async fn check_for_update(&mut self) -> Result<UpdateCheck> {
        match self.call(&Request::CheckForUpdate).await? {
            Some(Response::UpdateCheck { latest, all }) => Ok(UpdateCheck { latest, all }),
            other => Err(unexpected(other)),
        }
    }

    /// Install the given version. On success the supervisor restarts itself,
    /// so a connection closed after the request was sent counts as success.
    pub async fn update(&mut self, version: &str) -> Result<()> {
        let request = Request::Update {
            version: version.to_string(),
        };
        match self.call(&request).await? {
            Some(Response::Ok) | None => Ok(()),
            Some(Response::Error { message }) => Err(Error::Ipc(message)),
            other => Err(unexpected(other)),
        }
    }

    /// Roll back to the most recent backup. Same connection-close caveat as
    /// [`UpdateClient::update`].
    pub async fn rollback(&mut self) -> Result<()> {
        match self.call(&Request::Rollback).await? {
            Some(Response::Ok) | None => Ok(()),
            Some(Response::Error { message }) => Err(Error::Ipc(message)),
            other => Err(unexpected(other)),
        }
    }

    /// Rollback history, most recently installed first.
    pub async fn history(&mut self) -> Result<Vec<HistoricVersion>> {
        match self.call(&Request::History).await? {
            Some(Response::History { entries }) => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    /// The version the supervisor was compiled with.
    pub async fn current_version(&mut self) -> Result<Version> {
        match self.call(&Request::CurrentVersion).await? {
            Some(Response::Version { version }) => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    async fn call(&mut self, request: &Request) -> Result<Option<Response>> {
        timeout(self.timeout, async {
            write_frame(&mut self.writer, request).await?;
            read_frame(&mut self.reader).await
        })
        .await
        .map_err(|_| Error::Ipc("request timed out".into()))?
    }
}

fn unexpected(response: Option<Response>) -> Error {
    match response {
        Some(Response::Error { message }) => Error::Ipc(message),
        Some(other) => Error::Ipc(format!("unexpected reply: {other:?}")),
        None => Error::Ipc("connection closed before reply".into()),
    }
}
