//! The supervisor-side IPC server.
//!
//! One task per accepted connection, one request in flight per connection.
//! Update and rollback serialize on the supervisor's write lock; reads run
//! concurrently with anything.

use std::path::Path;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ipc::{read_frame, write_frame, Request, Response};
use crate::supervisor::Supervisor;

pub struct IpcServer {
    listener: UnixListener,
    supervisor: Arc<Supervisor>,
}

impl IpcServer {
    /// Bind the socket, replacing a stale one from a previous run.
    pub fn bind(supervisor: Arc<Supervisor>, path: &Path) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .map_err(|e| Error::Ipc(format!("binding {}: {e}", path.display())))?;
        Ok(Self {
            listener,
            supervisor,
        })
    }

    /// Accept connections until the process exits. Nothing here blocks the
    /// accept loop: each connection is served on its own task.
    pub async fn serve(self) {
        loop {
            let (stream, _) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "ipc accept failed");
                    continue;
                }
            };

            let supervisor = self.supervisor.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(supervisor, stream).await {
                    debug!(error = %e, "ipc connection closed with error");
                }
            });
        }
    }
}

async fn handle_connection(supervisor: Arc<Supervisor>, stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    while let Some(request) = read_frame::<_, Request>(&mut reader).await? {
        let response = dispatch(&supervisor, request).await;
        write_frame(&mut writer, &response).await?;
    }

    Ok(())
}

async fn dispatch(supervisor: &Supervisor, request: Request) -> Response {
    match request {
        Request::CheckForUpdate => match supervisor.check_for_update().await {
            Ok(check) => Response::UpdateCheck {
                latest: check.latest,
                all: check.all,
            },
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        },

        // On success these have already signalled the supervisor, so the
        // reply usually never reaches the wire; errors always do.
        Request::Update { version } => match supervisor.update(&version).await {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        },

        Request::Rollback => match supervisor.rollback().await {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        },

        Request::History => Response::History {
            entries: supervisor.history(),
        },

        Request::CurrentVersion => Response::Version {
            version: supervisor.current_version().clone(),
        },
    }
}
