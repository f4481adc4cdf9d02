//! Converger
//!
//! The single-threaded owner of the drive set. Drains one event batch at a
//! time from the collector channel, snapshots the OS state, dispatches the
//! event handlers, and then runs a full reconciliation pass across all
//! drives.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::assignment;
use crate::collectors::Event;
use crate::config::Config;
use crate::drive::Drive;
use crate::error::fatal;
use crate::metrics::EVENT_COUNTER;
use crate::os::{MountScope, OsFacade, FINAL_MOUNT_DIR};

/// Run the converger loop. Returns when the event channel is closed (which
/// only happens at shutdown).
pub async fn run(
    mut queue: mpsc::Receiver<Vec<Event>>,
    os: Arc<dyn OsFacade>,
    config: Arc<Config>,
) {
    let mut converger = Converger::new();
    while let Some(events) = queue.recv().await {
        converger.handle_batch(events, &*os, &config).await;
    }
}

/// The internal state of the converger task.
pub struct Converger {
    drives: Vec<Drive>,
}

impl Converger {
    pub fn new() -> Converger {
        Converger { drives: Vec::new() }
    }

    pub fn drives(&self) -> &[Drive] {
        &self.drives
    }

    /// Process one event batch: snapshot OS state, dispatch handlers, then
    /// reconcile all drives.
    pub async fn handle_batch(&mut self, events: Vec<Event>, os: &dyn OsFacade, config: &Config) {
        // initialize the snapshot for this iteration; failing snapshot
        // commands leave us blind, so they are fatal
        if let Err(err) = os.refresh_mounts().await {
            fatal(&err.to_string());
        }
        if let Err(err) = os.refresh_luks().await {
            fatal(&err.to_string());
        }

        for event in events {
            EVENT_COUNTER
                .with_label_values(&[event.event_type()])
                .inc();
            if let Some(message) = event.log_message() {
                info!("event received: {message}");
            }
            self.handle_event(event, os, config).await;
        }

        self.converge(os, config).await;
    }

    async fn handle_event(&mut self, event: Event, os: &dyn OsFacade, config: &Config) {
        match event {
            Event::DriveAdded {
                device_path,
                serial,
                ..
            } => {
                let mut drive =
                    Drive::new(&device_path, serial.as_deref(), config.keys.clone(), os).await;
                drive.converge(os).await;
                self.drives.push(drive);
            }

            Event::DriveRemoved { device_path } => {
                let Some(idx) = self.position_of(&device_path) else {
                    return;
                };
                let mut drive = self.drives.remove(idx);
                drive.teardown(os).await;
            }

            Event::DriveError { device_path, .. } => {
                if let Some(idx) = self.position_of(&device_path) {
                    self.drives[idx].mark_as_broken(os).await;
                }
            }

            Event::DriveReinstated { device_path } => {
                if let Some(idx) = self.position_of(&device_path) {
                    // reconstruct a pristine drive, preserving identity and
                    // keys; who knows what was done to fix the drive
                    let drive_id = self.drives[idx].id().as_str().to_string();
                    let keys = self.drives[idx].keys().to_vec();
                    let mut drive = Drive::new(&device_path, Some(drive_id.as_str()), keys, os).await;
                    drive.converge(os).await;
                    self.drives[idx] = drive;
                }

                if let Err(err) = os.clear_unmount_propagation_for_device(&device_path).await {
                    error!("{err}");
                }
            }

            Event::Wakeup => {
                // consistency checks run unconditionally after dispatch
            }
        }
    }

    fn position_of(&self, device_path: &str) -> Option<usize> {
        self.drives
            .iter()
            .position(|drive| drive.device_path() == device_path)
    }

    /// Move towards the desired state of all drives. Runs after every event
    /// batch.
    pub async fn converge(&mut self, os: &dyn OsFacade, config: &Config) {
        for drive in &mut self.drives {
            drive.converge(os).await;
        }

        // discover and auto-assign swift-ids across the whole set
        assignment::update_drive_assignments(&mut self.drives, &config.swift_id_pool, os).await;

        // a second pass moves newly assigned drives to their final mount
        for drive in &mut self.drives {
            drive.converge(os).await;

            if drive.is_broken() {
                continue;
            }
            let Some(mount_path) = drive.assignment().and_then(|a| a.mount_path()) else {
                continue;
            };
            if drive.mounted_path() == Some(mount_path.as_str()) {
                if let Err(err) = os
                    .chown(
                        &mount_path,
                        config.owner.user.as_deref(),
                        config.owner.group.as_deref(),
                    )
                    .await
                {
                    error!("{err}");
                }
            }
        }

        self.check_for_unexpected_mounts(os);
        self.write_drive_audit(os).await;

        // mark storage as ready for consumption by Swift
        if let Err(err) = os.announce_ready().await {
            error!("cannot write ready flag: {err}");
        }
    }

    /// Complain about every active mount below /srv/node that does not
    /// belong to a known drive's final mount.
    fn check_for_unexpected_mounts(&self, os: &dyn OsFacade) {
        for mount in os.mounts_in(FINAL_MOUNT_DIR, MountScope::Host) {
            let expected = self.drives.iter().any(|drive| {
                !drive.is_broken() && drive.mounted_path() == Some(mount.mount_path.as_str())
            });
            if !expected {
                error!("unexpected mount at {}", mount.mount_path);
            }
        }
    }

    /// Write /var/cache/swift/drive.recon in the format emitted by
    /// swift-drive-audit.
    async fn write_drive_audit(&self, os: &dyn OsFacade) {
        let mut entries = BTreeMap::new();
        let mut total = 0;

        for drive in &self.drives {
            let mount_path = drive.mount_path();
            if drive.is_broken() {
                entries.insert(mount_path, 1);
                total += 1;
            } else {
                entries.insert(mount_path, 0);
            }
        }
        entries.insert("drive_audit_errors".to_string(), total);

        if let Err(err) = os.write_drive_audit(&entries).await {
            error!("cannot write drive audit: {err}");
        }
    }
}

impl Default for Converger {
    fn default() -> Self {
        Self::new()
    }
}
