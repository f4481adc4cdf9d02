//! Swift-ID Assignment
//!
//! Decides each drive's identity within the Swift ring: reads the swift-id
//! files of all mounted drives, detects collisions and mismounts, and
//! auto-assigns identities from the configured pool.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use tracing::{error, info};

use crate::config::pool_entry_to_swift_id;
use crate::drive::Drive;
use crate::os::{OsFacade, FINAL_MOUNT_DIR};

// =============================================================================
// Assignment
// =============================================================================

/// A reason why a drive must not be mounted below /srv/node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentError {
    /// No swift-id on the device and auto-assignment is not configured.
    Missing,
    /// No swift-id on the device; one will be auto-assigned shortly.
    Pending,
    /// No swift-id on the device; auto-assignment is blocked by broken
    /// drives (their swift-ids cannot be read, so collisions cannot be
    /// ruled out).
    Blocked,
    /// The same swift-id was found on more than one drive.
    Duplicate,
    /// The drive is mounted below /srv/node under a different name than its
    /// swift-id.
    Mismatch,
}

/// Whether and where a drive is assigned an identity within Swift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub swift_id: String,
    /// When set, the drive stays at its temporary mount.
    pub error: Option<AssignmentError>,
}

impl Assignment {
    pub fn valid(swift_id: &str) -> Assignment {
        Assignment {
            swift_id: swift_id.to_string(),
            error: None,
        }
    }

    pub fn with_error(swift_id: &str, error: AssignmentError) -> Assignment {
        Assignment {
            swift_id: swift_id.to_string(),
            error: Some(error),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.error == Some(AssignmentError::Pending)
    }

    /// The path where a disk with this assignment shall be mounted, or None
    /// if this assignment does not allow mounting below /srv/node.
    pub fn mount_path(&self) -> Option<String> {
        if self.error.is_some() || self.swift_id == "spare" {
            return None;
        }
        Some(format!("{FINAL_MOUNT_DIR}/{}", self.swift_id))
    }

    /// The log message for an invalid assignment, or None if the assignment
    /// is valid.
    pub fn error_message(&self, device_path: &str, mounted_path: Option<&str>) -> Option<String> {
        let reason = match self.error? {
            AssignmentError::Missing => "no swift-id file found on device".to_string(),
            AssignmentError::Pending => {
                "no swift-id file found on device, will try to assign one".to_string()
            }
            AssignmentError::Blocked => {
                "no swift-id file found on device, cannot auto-assign because of broken drives"
                    .to_string()
            }
            AssignmentError::Duplicate => format!(
                "found multiple drives with swift-id \"{}\" (not mounting any of them)",
                self.swift_id
            ),
            AssignmentError::Mismatch => {
                format!("mountpoint mismatches swift-id \"{}\"", self.swift_id)
            }
        };
        Some(match mounted_path {
            Some(mounted_path) => {
                format!("invalid assignment for {device_path} (mounted at {mounted_path}): {reason}")
            }
            None => format!("invalid assignment for {device_path}: {reason}"),
        })
    }

    /// Change the drive's assignment, logging at most once per transition.
    /// Pending is logged at info level since it will be fixed shortly.
    pub fn apply(self, drive: &mut Drive) {
        let previous_message = drive.assignment().and_then(|assignment| {
            assignment.error_message(drive.device_path(), drive.mounted_path())
        });
        let current_message = self.error_message(drive.device_path(), drive.mounted_path());

        if previous_message != current_message {
            if let Some(message) = &current_message {
                if self.is_pending() {
                    info!("{message}");
                } else {
                    error!("{message}");
                }
            }
        }

        drive.set_assignment(Some(self));
    }
}

// =============================================================================
// Assignment Pass
// =============================================================================

/// Scan all drives for their swift-id assignments, and auto-assign ids from
/// the pool where required and possible.
pub async fn update_drive_assignments(drives: &mut [Drive], pool: &[String], os: &dyn OsFacade) {
    let has_broken = drives.iter().any(|drive| drive.is_broken());

    // read existing swift-id assignments
    let mut is_assigned: HashSet<String> = HashSet::new();
    let mut drives_by_swift_id: HashMap<String, usize> = HashMap::new();
    let mut has_mismounted = false;
    let mut spare_idx = 0;

    for idx in 0..drives.len() {
        let (mounted_path, broken) = {
            let drive = &drives[idx];
            (drive.mounted_path().map(String::from), drive.is_broken())
        };
        // ignore broken and unmounted drives and keep going
        if broken {
            continue;
        }
        let Some(mounted_path) = mounted_path else {
            continue;
        };

        let swift_id = match os.read_swift_id(&mounted_path).await {
            Ok(swift_id) => swift_id,
            Err(err) => {
                error!("read swift-id below {mounted_path}: {err}");
                continue;
            }
        };

        match swift_id.as_deref() {
            None | Some("") => {
                let error = if pool.is_empty() {
                    // auto-assignment not configured, the operator has to
                    // enter a swift-id manually
                    AssignmentError::Missing
                } else if has_broken {
                    AssignmentError::Blocked
                } else {
                    AssignmentError::Pending
                };
                Assignment::with_error("", error).apply(&mut drives[idx]);
            }
            Some("spare") => {
                Assignment::valid("spare").apply(&mut drives[idx]);
                // spare disks consume pool slots named spare/0, spare/1, …
                // in the same format as in the expanded pool; no collision
                // check for them
                is_assigned.insert(format!("spare/{spare_idx}"));
                spare_idx += 1;
            }
            Some(swift_id) => {
                // does the swift-id conflict with where the device is
                // currently mounted?
                let mounted = Path::new(&mounted_path);
                let mismounted = mounted.parent() == Some(Path::new(FINAL_MOUNT_DIR))
                    && mounted.file_name().and_then(|name| name.to_str()) != Some(swift_id);
                if mismounted {
                    Assignment::with_error(swift_id, AssignmentError::Mismatch)
                        .apply(&mut drives[idx]);
                    // something is seriously wrong, inhibit auto-assignment
                    has_mismounted = true;
                } else {
                    Assignment::valid(swift_id).apply(&mut drives[idx]);
                }
                is_assigned.insert(swift_id.to_string());

                match drives_by_swift_id.get(swift_id).copied() {
                    Some(other_idx) => {
                        let swift_id = swift_id.to_string();
                        Assignment::with_error(&swift_id, AssignmentError::Duplicate)
                            .apply(&mut drives[idx]);
                        Assignment::with_error(&swift_id, AssignmentError::Duplicate)
                            .apply(&mut drives[other_idx]);
                    }
                    None => {
                        drives_by_swift_id.insert(swift_id.to_string(), idx);
                    }
                }
            }
        }
    }

    // auto-assignment is only safe when every drive's swift-id could be read
    if has_broken || has_mismounted || pool.is_empty() {
        return;
    }

    for idx in 0..drives.len() {
        if !drives[idx].eligible_for_auto_assignment() {
            continue;
        }

        // IDs are GUARANTEED to be assigned in the order in which they
        // appear in the configuration; this is part of the interface
        // contract
        let pool_entry = pool
            .iter()
            .find(|entry| !is_assigned.contains(entry.as_str()))
            .cloned();
        let Some(pool_entry) = pool_entry else {
            error!(
                "tried to assign swift-id to {}, but pool is exhausted",
                drives[idx].device_path()
            );
            continue;
        };
        let swift_id = pool_entry_to_swift_id(&pool_entry).to_string();

        info!(
            "assigning swift-id '{swift_id}' to {}",
            drives[idx].device_path()
        );
        let target_path = match drives[idx].mounted_path() {
            Some(mounted_path) => mounted_path.to_string(),
            None => drives[idx].mount_path(),
        };
        if let Err(err) = os.write_swift_id(&target_path, &swift_id).await {
            error!("{err}");
            continue;
        }

        is_assigned.insert(pool_entry);
        Assignment::valid(&swift_id).apply(&mut drives[idx]);
    }
}
