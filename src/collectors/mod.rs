//! Collectors
//!
//! Four independent tasks observe the host and produce [`Event`] batches on
//! a single bounded channel; the converger is the single consumer. No
//! collector holds converger state, all communication is by value.

pub mod drives;
pub mod kernel_log;
pub mod reinstatement;
pub mod wakeup;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::os::OsFacade;

/// Capacity of the event channel between collectors and converger.
pub const EVENT_QUEUE_CAPACITY: usize = 10;

// =============================================================================
// Events
// =============================================================================

/// A message from a collector to the converger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A new drive was found.
    DriveAdded {
        device_path: String,
        /// The device path before symlinks were expanded; only used in log
        /// messages.
        found_at_path: String,
        serial: Option<String>,
    },

    /// A drive's device file disappeared.
    DriveRemoved { device_path: String },

    /// A potential drive error was observed in the kernel log.
    DriveError {
        device_path: String,
        message: String,
    },

    /// An operator removed a drive's broken flag.
    DriveReinstated { device_path: String },

    /// Periodic no-op that triggers the converger's consistency checks.
    Wakeup,
}

impl Event {
    /// Label for the event counter metric.
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::DriveAdded { .. } => "drive-added",
            Event::DriveRemoved { .. } => "drive-removed",
            Event::DriveError { .. } => "drive-error",
            Event::DriveReinstated { .. } => "drive-reinstated",
            Event::Wakeup => "consistency-check",
        }
    }

    /// The "event received" log line, or None for events that would spam
    /// the log. The continued execution of consistency checks is visible
    /// through the event counter metric instead.
    pub fn log_message(&self) -> Option<String> {
        match self {
            Event::DriveAdded {
                device_path,
                found_at_path,
                ..
            } => {
                if found_at_path.is_empty() || found_at_path == device_path {
                    Some(format!("new device found: {device_path}"))
                } else {
                    Some(format!("new device found: {found_at_path} -> {device_path}"))
                }
            }
            Event::DriveRemoved { device_path } => {
                Some(format!("device removed: {device_path}"))
            }
            Event::DriveError {
                device_path,
                message,
            } => Some(format!(
                "potential device error for {device_path} seen in kernel log: {message}"
            )),
            Event::DriveReinstated { device_path } => {
                Some(format!("device reinstated: {device_path}"))
            }
            Event::Wakeup => {
                if crate::util::in_test_mode() {
                    Some("scheduled consistency check".to_string())
                } else {
                    None
                }
            }
        }
    }
}

/// Spawn all four collector tasks.
pub fn spawn_all(os: Arc<dyn OsFacade>, config: Arc<Config>, queue: mpsc::Sender<Vec<Event>>) {
    tokio::spawn(drives::collect_drive_events(
        os.clone(),
        config.clone(),
        queue.clone(),
    ));
    tokio::spawn(reinstatement::collect_reinstatements(
        os.clone(),
        queue.clone(),
    ));
    tokio::spawn(wakeup::schedule_wakeups(queue.clone()));
    tokio::spawn(kernel_log::watch_kernel_log(os, queue));
}
