//! Drive Entity
//!
//! One [`Drive`] per physical disk, owned by the converger. A drive carries
//! its stable identity, its device tree, its brokenness flag, and its
//! swift-id assignment.

use tracing::{error, info};

use crate::assignment::Assignment;
use crate::device::Device;
use crate::os::{OsFacade, BROKEN_FLAG_DIR, TEMPORARY_MOUNT_DIR};

// =============================================================================
// Drive ID
// =============================================================================

/// Identifies a drive in derived file names (broken flags, temporary mounts,
/// LUKS mapping names). Stable across restarts as long as the disk is
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DriveId(String);

impl DriveId {
    /// Prefer the (sanitized) disk serial number; fall back to the MD5 hash
    /// of the device path when no serial could be determined.
    pub fn for_drive(serial: Option<&str>, device_path: &str) -> DriveId {
        match serial {
            Some(serial) if !serial.is_empty() => DriveId(serial.to_string()),
            _ => {
                let id = format!("{:x}", md5::compute(device_path.as_bytes()));
                error!(
                    "cannot determine serial number for {device_path}, will use device ID {id} instead"
                );
                DriveId(id)
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DriveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Drive Context
// =============================================================================

/// The slice of drive state that the device tree needs during
/// setup/teardown/validate.
pub struct DriveContext<'a> {
    pub drive_id: &'a DriveId,
    pub device_path: &'a str,
    pub keys: &'a [String],
    /// Mount path mandated by the assignment, when one allows a final mount.
    pub assignment_mount_path: Option<String>,
    /// Fallback below /run/swift-storage when no assignment applies.
    pub temporary_mount_path: String,
}

impl DriveContext<'_> {
    /// Where the drive shall be mounted: the assignment's path if any, else
    /// wherever it is already mounted, else the temporary path.
    pub fn desired_mount_path(&self, currently_mounted_at: Option<&str>) -> String {
        self.assignment_mount_path
            .clone()
            .or_else(|| currently_mounted_at.map(|path| path.to_string()))
            .unwrap_or_else(|| self.temporary_mount_path.clone())
    }
}

// =============================================================================
// Drive
// =============================================================================

/// A physical disk managed by the autopilot.
#[derive(Debug)]
pub struct Drive {
    device_path: String,
    id: DriveId,
    keys: Vec<String>,
    /// None when the device was unreadable at construction time.
    device: Option<Device>,
    broken: bool,
    assignment: Option<Assignment>,
}

impl Drive {
    /// Build the drive's device tree and recover a brokenness flag left by
    /// a previous run (transient or durable).
    pub async fn new(
        device_path: &str,
        serial: Option<&str>,
        keys: Vec<String>,
        os: &dyn OsFacade,
    ) -> Drive {
        let id = DriveId::for_drive(serial, device_path);
        let device = Device::new_for(device_path, os, !keys.is_empty()).await;

        let mut drive = Drive {
            device_path: device_path.to_string(),
            id,
            keys,
            device,
            broken: false,
            assignment: None,
        };

        if drive.device.is_none() {
            error!("cannot classify device {device_path}: device is unreadable");
            drive.mark_as_broken(os).await;
        } else if os.is_flagged_broken(drive.id.as_str()).await {
            info!(
                "{device_path} was flagged as broken by a previous run of swift-drive-autopilot"
            );
            drive.mark_as_broken(os).await;
        }

        drive
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub fn id(&self) -> &DriveId {
        &self.id
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn assignment(&self) -> Option<&Assignment> {
        self.assignment.as_ref()
    }

    pub(crate) fn set_assignment(&mut self, assignment: Option<Assignment>) {
        self.assignment = assignment;
    }

    /// The path where this drive is mounted right now, as far as the device
    /// tree knows.
    pub fn mounted_path(&self) -> Option<&str> {
        self.device.as_ref().and_then(|device| device.mounted_path())
    }

    /// The path where this drive is supposed to be mounted: the assignment
    /// path if one applies, else the path where the drive is already mounted
    /// from an earlier run, else the temporary mount.
    pub fn mount_path(&self) -> String {
        self.context().desired_mount_path(self.mounted_path())
    }

    pub fn temporary_mount_path(&self) -> String {
        format!("{TEMPORARY_MOUNT_DIR}/{}", self.id)
    }

    fn context(&self) -> DriveContext<'_> {
        DriveContext {
            drive_id: &self.id,
            device_path: &self.device_path,
            keys: &self.keys,
            assignment_mount_path: self
                .assignment
                .as_ref()
                .and_then(|assignment| assignment.mount_path()),
            temporary_mount_path: self.temporary_mount_path(),
        }
    }

    /// Move the drive towards its locally desired state.
    ///
    /// If the drive is not broken, its LUKS container (if any) is created
    /// and/or opened and its filesystem is mounted, at the final mount path
    /// once an assignment is known. If the drive is broken (or discovered to
    /// be broken during this operation), existing mappings and mounts are
    /// torn down instead.
    pub async fn converge(&mut self, os: &dyn OsFacade) {
        if self.broken {
            self.teardown(os).await;
            return;
        }

        let assignment_mount_path = self
            .assignment
            .as_ref()
            .and_then(|assignment| assignment.mount_path());
        let temporary_mount_path = self.temporary_mount_path();
        let Some(device) = self.device.as_mut() else {
            return;
        };
        let ctx = DriveContext {
            drive_id: &self.id,
            device_path: &self.device_path,
            keys: &self.keys,
            assignment_mount_path,
            temporary_mount_path,
        };

        if let Err(err) = device.setup(&ctx, os).await {
            error!("{err}");
            self.mark_as_broken(os).await;
            self.teardown(os).await;
        }
    }

    /// Tear down all active mounts and mappings relating to this drive.
    pub async fn teardown(&mut self, os: &dyn OsFacade) {
        let assignment_mount_path = self
            .assignment
            .as_ref()
            .and_then(|assignment| assignment.mount_path());
        let temporary_mount_path = self.temporary_mount_path();
        let Some(device) = self.device.as_mut() else {
            return;
        };
        let ctx = DriveContext {
            drive_id: &self.id,
            device_path: &self.device_path,
            keys: &self.keys,
            assignment_mount_path,
            temporary_mount_path,
        };

        if let Err(err) = device.teardown(&ctx, os).await {
            error!("teardown of {}: {err}", self.device_path);
        }
    }

    /// Flag the drive as broken, on disk and in memory.
    ///
    /// The assignment is reset so that the swift-id file is re-read after
    /// the drive is reinstated.
    pub async fn mark_as_broken(&mut self, os: &dyn OsFacade) {
        if self.broken {
            // already flagged; the remediation hint is logged only once
            return;
        }
        info!(
            "flagging {} as broken because of previous error",
            self.device_path
        );
        self.broken = true;
        self.assignment = None;

        if let Err(err) = os.set_broken_flag(self.id.as_str(), &self.device_path).await {
            error!("cannot write broken flag for {}: {err}", self.device_path);
            return;
        }
        info!(
            "to reinstate this drive into the cluster, delete the symlink at {BROKEN_FLAG_DIR}/{}",
            self.id
        );
    }

    /// True if the drive does not have a swift-id yet but may get one
    /// auto-assigned from the pool.
    pub fn eligible_for_auto_assignment(&self) -> bool {
        !self.broken
            && self
                .assignment
                .as_ref()
                .map(|assignment| assignment.is_pending())
                .unwrap_or(false)
    }
}
