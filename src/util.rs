//! Test-Mode Helpers
//!
//! The integration test harness runs the autopilot with `TEST_MODE=1` and
//! expects tightened collector intervals, a file-touch trigger for the drive
//! enumerator, a stdout keep-alive, and a clean exit on SIGPIPE.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::error;

/// Path whose mtime drives the drive enumerator during integration tests.
pub const TEST_TRIGGER_PATH: &str = "/run/swift-storage/check-drives";

/// Returns true during integration tests.
pub fn in_test_mode() -> bool {
    std::env::var("TEST_MODE").map(|v| v == "1").unwrap_or(false)
}

/// Returns true when verbose logging was requested via the environment.
pub fn in_debug_mode() -> bool {
    std::env::var("DEBUG").map(|v| !v.is_empty()).unwrap_or(false)
}

/// Collector jobs tighten their work schedule during integration tests.
pub fn job_interval(normal: Duration, test_mode: Duration) -> Duration {
    if in_test_mode() {
        test_mode
    } else {
        normal
    }
}

/// Produces a channel that fires in the given interval during productive
/// runs, or whenever the trigger file is touched during integration tests.
///
/// When `at_startup` is true, the channel fires once immediately so that the
/// first work cycle does not wait for a full interval.
pub fn standard_trigger(
    normal_interval: Duration,
    trigger_path: &'static str,
    at_startup: bool,
) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(1);

    if at_startup {
        // capacity 1 and nothing sent yet, cannot fail
        let _ = tx.try_send(());
    }

    if in_test_mode() {
        tokio::spawn(test_trigger(trigger_path, tx));
    } else {
        tokio::spawn(interval_trigger(normal_interval, tx));
    }

    rx
}

async fn interval_trigger(interval: Duration, tx: mpsc::Sender<()>) {
    loop {
        tokio::time::sleep(interval).await;
        if tx.send(()).await.is_err() {
            return;
        }
    }
}

async fn test_trigger(path: &'static str, tx: mpsc::Sender<()>) {
    let mut last_mtime = SystemTime::UNIX_EPOCH;
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mtime = match std::fs::metadata(Path::new(path)) {
            Ok(metadata) => metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => SystemTime::UNIX_EPOCH,
            Err(err) => {
                error!("stat {path}: {err}");
                continue;
            }
        };

        if mtime != last_mtime {
            last_mtime = mtime;
            if tx.send(()).await.is_err() {
                return;
            }
        }
    }
}

/// Performs the setup tasks that are only required for integration tests.
///
/// The harness kills the autopilot with SIGPIPE once it has seen all the log
/// lines it wanted, but SIGPIPE is only delivered on the next write to
/// stdout. Without the keep-alive below, that write would be the next
/// wakeup log line up to 30 seconds later.
pub fn setup_test_mode() {
    tokio::spawn(async {
        let mut stdout = tokio::io::stdout();
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = stdout.write_all(b"\n").await;
            let _ = stdout.flush().await;
        }
    });

    tokio::spawn(async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::pipe()) {
            Ok(mut sigpipe) => {
                sigpipe.recv().await;
                std::process::exit(0);
            }
            Err(err) => error!("cannot install SIGPIPE handler: {err}"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_interval_selection() {
        // not running under TEST_MODE=1 here
        let normal = Duration::from_secs(30);
        let test = Duration::from_secs(10);
        if !in_test_mode() {
            assert_eq!(job_interval(normal, test), normal);
        }
    }

    #[tokio::test]
    async fn test_trigger_fires_at_startup() {
        let mut rx = standard_trigger(Duration::from_secs(3600), TEST_TRIGGER_PATH, true);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_trigger_does_not_fire_without_startup() {
        let mut rx = standard_trigger(Duration::from_secs(3600), TEST_TRIGGER_PATH, false);
        assert!(rx.try_recv().is_err());
    }
}
