//! OS Facade
//!
//! Every shell-out, namespace decision, and kernel-log parse is hidden
//! behind the [`OsFacade`] trait. The converger, the device tree, and the
//! collectors use only this interface; production uses [`Linux`], tests
//! substitute the in-memory mock.
//!
//! There is an important distinction between "drive" and "device" in the
//! autopilot's jargon. A drive is the physical thing, a device is a device
//! file. For encrypted drives there are two devices per drive: the SCSI
//! device file (e.g. /dev/sdb) and the device file representing the contents
//! of the LUKS container (e.g. /dev/mapper/ABCDEFGH).

pub mod command;
pub mod linux;
pub mod lsblk;
#[cfg(test)]
pub mod mock;

pub use linux::Linux;

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

// =============================================================================
// Observation Types
// =============================================================================

/// Contents of a device, to the granularity required by this program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    /// Readable, but contains neither a LUKS container nor a filesystem.
    Unknown,
    /// The device could not be read.
    Unreadable,
    /// The device contains a LUKS container.
    Luks,
    /// The device contains an admissible filesystem.
    Filesystem,
}

/// Whether a mount happens in the autopilot's own mount namespace or in the
/// host mount namespace. Without a chroot both scopes collapse into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MountScope {
    Host,
    Local,
}

impl MountScope {
    /// Both scopes, in the order in which operations are applied.
    pub const ALL: [MountScope; 2] = [MountScope::Host, MountScope::Local];
}

impl std::fmt::Display for MountScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountScope::Host => write!(f, "host"),
            MountScope::Local => write!(f, "local"),
        }
    }
}

/// An active mount point observed on the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountObservation {
    pub device_path: String,
    pub mount_path: String,
    pub options: HashSet<String>,
}

impl MountObservation {
    pub fn is_read_only(&self) -> bool {
        self.options.contains("ro")
    }
}

/// Media type of a drive, as far as the serial-number probe can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Nvme,
    Hdd,
    Ssd,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Nvme => write!(f, "nvme"),
            MediaType::Hdd => write!(f, "hdd"),
            MediaType::Ssd => write!(f, "ssd"),
        }
    }
}

/// A drive as reported by the enumeration scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveObservation {
    /// Canonical device path, symlinks resolved.
    pub device_path: String,
    /// The globbed path before symlinks were expanded; only used in log
    /// messages.
    pub found_at_path: String,
    /// Sanitized disk serial number, if one could be determined.
    pub serial: Option<String>,
    /// Media type, if the serial-number probe could determine one.
    pub media_type: Option<MediaType>,
}

// =============================================================================
// Facade Trait
// =============================================================================

/// The set of OS-level operations available to the autopilot.
///
/// Snapshot state (mounts, LUKS mappings) is refreshed explicitly by the
/// converger once at the top of each pass and treated as immutable for the
/// remainder; the accessors below read from that snapshot.
#[async_trait]
pub trait OsFacade: Send + Sync {
    // --- enumeration ---------------------------------------------------------

    /// Expand the drive globs and probe every match. Returns one observation
    /// per eligible drive, sorted by device path. Drives with partition
    /// tables are logged and skipped; unreadable drives are skipped unless
    /// their serial number can be recovered from an already-open LUKS
    /// mapping. Matching nothing at all is a fatal misconfiguration.
    async fn scan_drives(&self, globs: &[String]) -> Result<Vec<DriveObservation>>;

    /// Start tailing the kernel log and return a channel of raw log lines.
    /// The tailing child is a long-lived owned resource; it is reaped at
    /// process shutdown.
    fn tail_kernel_log(&self) -> Result<mpsc::Receiver<String>>;

    // --- device contents -----------------------------------------------------

    /// Identify the contents of the given device.
    async fn classify_device(&self, device_path: &str) -> DeviceType;

    /// Create an XFS filesystem on this device. Existing contents are
    /// overwritten.
    async fn format_xfs(&self, device_path: &str) -> Result<()>;

    // --- mounts --------------------------------------------------------------

    /// Mount the device at the given path in the given scope, creating the
    /// mountpoint directory as needed. A no-op if the snapshot already shows
    /// this exact mount.
    async fn mount(&self, device_path: &str, mount_path: &str, scope: MountScope) -> Result<()>;

    /// Unmount whatever is mounted at the given path in the given scope.
    /// A no-op if the snapshot shows no mount there.
    async fn unmount(&self, mount_path: &str, scope: MountScope) -> Result<()>;

    /// Re-read the active mounts from the system. Fatal on failure.
    async fn refresh_mounts(&self) -> Result<()>;

    /// All active mounts below the given path prefix.
    fn mounts_in(&self, mount_path_prefix: &str, scope: MountScope) -> Vec<MountObservation>;

    /// All active mounts of the given device.
    fn mounts_of(&self, device_path: &str, scope: MountScope) -> Vec<MountObservation>;

    // --- LUKS ----------------------------------------------------------------

    /// Create a LUKS container on the device using the given key. Existing
    /// contents are overwritten.
    async fn create_luks(&self, device_path: &str, key: &str) -> Result<()>;

    /// Open the LUKS container on the device under the given mapping name.
    /// Keys are tried in declaration order; the first accepted key wins.
    /// Returns the mapped device path.
    async fn open_luks(
        &self,
        device_path: &str,
        mapping_name: &str,
        keys: &[String],
    ) -> Result<String>;

    /// Close the LUKS mapping with the given name.
    async fn close_luks(&self, mapping_name: &str) -> Result<()>;

    /// Re-read the active LUKS mappings from the system. Fatal on failure.
    async fn refresh_luks(&self) -> Result<()>;

    /// The mapped device path of the active LUKS mapping backed by this
    /// device, if any.
    fn luks_mapping_of(&self, device_path: &str) -> Option<String>;

    // --- ring identity -------------------------------------------------------

    /// Read the swift-id file in this directory; Ok(None) if absent.
    async fn read_swift_id(&self, mount_path: &str) -> Result<Option<String>>;

    /// Write the swift-id file in this directory (with trailing newline).
    async fn write_swift_id(&self, mount_path: &str, swift_id: &str) -> Result<()>;

    /// Change ownership of the given path. Owner and group may each be a
    /// name or a decimal ID; None leaves the respective field unchanged.
    async fn chown(&self, path: &str, owner: Option<&str>, group: Option<&str>) -> Result<()>;

    // --- state directory -----------------------------------------------------

    /// Create the directories under /run and /var that the autopilot reads
    /// and writes.
    async fn prepare_state_dirs(&self) -> Result<()>;

    /// Write the broken-flag symlink for this drive into the transient
    /// broken directory.
    async fn set_broken_flag(&self, drive_id: &str, device_path: &str) -> Result<()>;

    /// True if a broken flag for this drive exists in either the transient
    /// or the durable broken directory.
    async fn is_flagged_broken(&self, drive_id: &str) -> bool;

    /// Snapshot of the transient broken directory: drive ID → device path.
    async fn list_broken_flags(&self) -> Result<BTreeMap<String, String>>;

    /// Write the unmount-propagation symlink for a final mount that is being
    /// torn down.
    async fn set_unmount_propagation(&self, mount_name: &str, device_path: &str) -> Result<()>;

    /// Remove the unmount-propagation symlink with the given name, if any.
    async fn clear_unmount_propagation(&self, mount_name: &str) -> Result<()>;

    /// Remove all unmount-propagation symlinks pointing at the given device.
    async fn clear_unmount_propagation_for_device(&self, device_path: &str) -> Result<()>;

    // --- readiness -----------------------------------------------------------

    /// Write the drive-audit file consumed by swift-recon.
    async fn write_drive_audit(&self, entries: &BTreeMap<String, i64>) -> Result<()>;

    /// Touch the readiness flag that signals storage availability to Swift.
    async fn announce_ready(&self) -> Result<()>;
}

// =============================================================================
// Well-Known Paths
// =============================================================================

/// Directory for temporary mounts, keyed by drive ID.
pub const TEMPORARY_MOUNT_DIR: &str = "/run/swift-storage";

/// Directory for final mounts, keyed by swift-id.
pub const FINAL_MOUNT_DIR: &str = "/srv/node";

/// Transient broken-flag directory (cleared by reboot).
pub const BROKEN_FLAG_DIR: &str = "/run/swift-storage/broken";

/// Durable broken-flag directory (survives reboot; maintained by operators).
pub const DURABLE_BROKEN_FLAG_DIR: &str = "/var/lib/swift-storage/broken";

/// Directory of unmount-propagation hints for downstream consumers.
pub const UNMOUNT_PROPAGATION_DIR: &str = "/run/swift-storage/state/unmount-propagation";

/// Readiness flag touched at the end of every converger pass.
pub const READY_FLAG_PATH: &str = "/run/swift-storage/state/flag-ready";

/// Drive-audit file in the format emitted by swift-drive-audit.
pub const DRIVE_AUDIT_PATH: &str = "/var/cache/swift/drive.recon";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_scope_display() {
        assert_eq!(format!("{}", MountScope::Host), "host");
        assert_eq!(format!("{}", MountScope::Local), "local");
    }

    #[test]
    fn test_read_only_detection() {
        let mut options = HashSet::new();
        options.insert("rw".to_string());
        let mount = MountObservation {
            device_path: "/dev/sdb".into(),
            mount_path: "/srv/node/swift-01".into(),
            options,
        };
        assert!(!mount.is_read_only());

        let mut options = HashSet::new();
        options.insert("ro".to_string());
        let mount = MountObservation {
            options,
            ..mount
        };
        assert!(mount.is_read_only());
    }
}
