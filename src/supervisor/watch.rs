//! Child lifecycle: spawn, observe exits, respawn or roll back.
//!
//! Exactly one child runs at a time. The child is re-executed from the
//! user-visible binary path on every respawn, so it naturally follows the
//! symlinks to whatever version an install published in the meantime.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::supervisor::Supervisor;

/// Unclean exits within [`CRASH_WINDOW`] that count as a crash loop.
const MAX_UNCLEAN_EXITS: usize = 5;
const CRASH_WINDOW: Duration = Duration::from_secs(60);
/// How long a child gets to exit after SIGTERM before SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const RESPAWN_DELAYS_MS: [u64; 5] = [0, 250, 500, 1000, 2000];
const RESPAWN_DELAY_CAP: Duration = Duration::from_secs(5);

enum ChildEvent {
    Exited(std::io::Result<std::process::ExitStatus>),
    Signalled,
}

/// Supervise the child until it exits cleanly, a crash loop forces a
/// rollback, or a shutdown signal arrives. Returns the supervisor exit code.
pub(crate) async fn run(supervisor: Arc<Supervisor>, socket_path: &Path) -> i32 {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to register SIGTERM handler");
            return 1;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to register SIGINT handler");
            return 1;
        }
    };

    let mut window = CrashWindow::new(CRASH_WINDOW);
    let mut streak: usize = 0;

    loop {
        let started = Instant::now();
        let mut child = match spawn_child(&supervisor, socket_path) {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "failed to spawn child");
                return 1;
            }
        };
        debug!(pid = child.id(), "child started");

        let event = tokio::select! {
            status = child.wait() => ChildEvent::Exited(status),
            _ = sigterm.recv() => ChildEvent::Signalled,
            _ = sigint.recv() => ChildEvent::Signalled,
        };

        let status = match event {
            ChildEvent::Signalled => {
                info!("shutdown signal received, stopping child");
                return shutdown_child(child).await;
            }
            ChildEvent::Exited(Ok(status)) => status,
            ChildEvent::Exited(Err(e)) => {
                error!(error = %e, "failed waiting on child");
                return 1;
            }
        };

        if status.success() {
            info!("child exited cleanly, shutting down");
            return 0;
        }

        let code = status.code().unwrap_or(1);
        warn!(code, "child exited uncleanly");

        if started.elapsed() >= CRASH_WINDOW {
            streak = 0;
        }

        if window.record(Instant::now()) >= MAX_UNCLEAN_EXITS {
            error!(
                exits = MAX_UNCLEAN_EXITS,
                window_secs = CRASH_WINDOW.as_secs(),
                "crash loop detected, rolling back"
            );
            match supervisor.rollback().await {
                Ok(()) => {
                    // Rollback signalled this process; drain the signal and
                    // let the init system restart against the prior version.
                    sigterm.recv().await;
                    return 0;
                }
                Err(e) => {
                    error!(error = %e, "rollback unavailable, giving up");
                    return code.max(1);
                }
            }
        }

        let delay = respawn_delay(streak);
        streak += 1;
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "backing off before respawn");
            sleep(delay).await;
        }
    }
}

/// Re-execute the supervised binary as the child, marked via the socket
/// environment variable and inheriting stdio.
fn spawn_child(supervisor: &Supervisor, socket_path: &Path) -> std::io::Result<Child> {
    Command::new(supervisor.layout().bin_path())
        .env(crate::SOCKET_ENV, socket_path)
        .kill_on_drop(true)
        .spawn()
}

/// Forward SIGTERM, wait out the grace period, then SIGKILL.
async fn shutdown_child(mut child: Child) -> i32 {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
            warn!("child did not exit within grace period, killing");
            let _ = child.kill().await;
        }
    }
    0
}

/// Backoff before the `streak`-th consecutive respawn.
fn respawn_delay(streak: usize) -> Duration {
    RESPAWN_DELAYS_MS
        .get(streak)
        .map(|ms| Duration::from_millis(*ms))
        .unwrap_or(RESPAWN_DELAY_CAP)
}

/// Sliding window of recent unclean exit times.
struct CrashWindow {
    window: Duration,
    exits: VecDeque<Instant>,
}

impl CrashWindow {
    fn new(window: Duration) -> Self {
        Self {
            window,
            exits: VecDeque::new(),
        }
    }

    /// Record an unclean exit and return how many fall inside the window.
    fn record(&mut self, now: Instant) -> usize {
        self.exits.push_back(now);
        while let Some(oldest) = self.exits.front() {
            if now.duration_since(*oldest) > self.window {
                self.exits.pop_front();
            } else {
                break;
            }
        }
        self.exits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_respawn_delay_schedule() {
        assert_eq!(respawn_delay(0), Duration::ZERO);
        assert_eq!(respawn_delay(1), Duration::from_millis(250));
        assert_eq!(respawn_delay(2), Duration::from_millis(500));
        assert_eq!(respawn_delay(3), Duration::from_secs(1));
        assert_eq!(respawn_delay(4), Duration::from_secs(2));
        assert_eq!(respawn_delay(5), Duration::from_secs(5));
        assert_eq!(respawn_delay(100), Duration::from_secs(5));
    }

    #[test]
    fn test_crash_window_counts_recent_exits() {
        let mut window = CrashWindow::new(Duration::from_secs(60));
        let base = Instant::now();
        for i in 0..4 {
            assert_eq!(window.record(base + Duration::from_secs(i)), i as usize + 1);
        }
        assert_eq!(window.record(base + Duration::from_secs(4)), 5);
    }

    #[test]
    fn test_crash_window_expires_old_exits() {
        let mut window = CrashWindow::new(Duration::from_secs(60));
        let base = Instant::now();
        window.record(base);
        window.record(base + Duration::from_secs(1));
        // Both earlier exits fall out of the 60s window.
        assert_eq!(window.record(base + Duration::from_secs(120)), 1);
    }

    #[test]
    fn test_crash_window_boundary_inclusive() {
        let mut window = CrashWindow::new(Duration::from_secs(60));
        let base = Instant::now();
        window.record(base);
        // Exactly at the window edge still counts.
        assert_eq!(window.record(base + Duration::from_secs(60)), 2);
    }
}
