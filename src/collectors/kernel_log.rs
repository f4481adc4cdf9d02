//! Kernel Log Watcher
//!
//! Streams the kernel ring buffer and reports lines that look like errors
//! on a SCSI disk.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::collectors::Event;
use crate::error::fatal;
use crate::os::OsFacade;

static KLOG_ERROR_RX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:error|metadata corruption detected|unmount and run xfs_repair)\b")
        .unwrap()
});
static KLOG_DEVICE_RX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(sd[a-z]{1,2})\b").unwrap());

/// Collector task that emits [`Event::DriveError`] per matching kernel log
/// line.
pub async fn watch_kernel_log(os: Arc<dyn OsFacade>, queue: mpsc::Sender<Vec<Event>>) {
    let mut lines = match os.tail_kernel_log() {
        Ok(lines) => lines,
        Err(err) => fatal(&format!("cannot tail kernel log: {err}")),
    };

    // wait a few seconds before reading anything, so that the initial burst
    // of DriveAdded events is handled first
    tokio::time::sleep(Duration::from_secs(3)).await;

    while let Some(line) = lines.recv().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!("received kernel log line: '{line}'");

        if let Some(event) = drive_error_from_log_line(line) {
            if queue.send(vec![event]).await.is_err() {
                return;
            }
        }
    }
}

/// A log line maps to a [`Event::DriveError`] when it contains both an
/// error-indicating keyword and a SCSI disk name like "sda".
pub fn drive_error_from_log_line(line: &str) -> Option<Event> {
    if !KLOG_ERROR_RX.is_match(line) {
        return None;
    }
    let device = KLOG_DEVICE_RX.captures(line)?;
    Some(Event::DriveError {
        device_path: format!("/dev/{}", &device[1]),
        message: line.to_string(),
    })
}
