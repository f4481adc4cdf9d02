//! In-Memory Facade for Tests
//!
//! Simulates just enough of a storage node that the device tree, the
//! assignment logic, and the converger can be exercised without shelling
//! out: disks with typed contents, LUKS mappings, per-scope mounts, flag
//! directories, and the readiness artifacts.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::os::{
    DeviceType, DriveObservation, MountObservation, MountScope, OsFacade, FINAL_MOUNT_DIR,
};

/// Contents of a simulated disk (or of the mapped device inside a LUKS
/// container).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockContent {
    Blank,
    Luks {
        /// Keys that will be accepted by open_luks.
        keys: Vec<String>,
        inner: Box<MockContent>,
    },
    Xfs {
        /// Files on the filesystem; they follow the disk across remounts.
        files: BTreeMap<String, String>,
    },
}

impl MockContent {
    pub fn xfs_with_swift_id(swift_id: &str) -> MockContent {
        let mut files = BTreeMap::new();
        files.insert("swift-id".to_string(), format!("{swift_id}\n"));
        MockContent::Xfs { files }
    }

    pub fn empty_xfs() -> MockContent {
        MockContent::Xfs {
            files: BTreeMap::new(),
        }
    }
}

/// A simulated physical disk.
#[derive(Debug, Clone)]
pub struct MockDisk {
    pub content: MockContent,
    pub readable: bool,
    pub has_partition_table: bool,
    pub serial: Option<String>,
}

impl MockDisk {
    pub fn new(content: MockContent) -> MockDisk {
        MockDisk {
            content,
            readable: true,
            has_partition_table: false,
            serial: None,
        }
    }

    pub fn with_serial(mut self, serial: &str) -> MockDisk {
        self.serial = Some(serial.to_string());
        self
    }
}

#[derive(Debug, Default)]
struct MockState {
    disks: BTreeMap<String, MockDisk>,
    mounts: BTreeMap<MountScope, Vec<MountObservation>>,
    /// backing device path → mapped device path
    luks_mappings: BTreeMap<String, String>,
    broken_flags: BTreeMap<String, String>,
    durable_broken_flags: BTreeMap<String, String>,
    unmount_propagation: BTreeMap<String, String>,
    drive_audit: Option<BTreeMap<String, i64>>,
    ready_count: u64,
    chown_calls: Vec<(String, Option<String>, Option<String>)>,
    kernel_log_tx: Option<mpsc::Sender<String>>,
}

/// The in-memory [`OsFacade`] implementation.
#[derive(Default)]
pub struct MockOs {
    state: Mutex<MockState>,
}

impl MockOs {
    pub fn new() -> MockOs {
        MockOs::default()
    }

    // --- test setup ----------------------------------------------------------

    pub fn add_disk(&self, device_path: &str, disk: MockDisk) {
        self.state
            .lock()
            .disks
            .insert(device_path.to_string(), disk);
    }

    pub fn remove_disk(&self, device_path: &str) {
        let mut state = self.state.lock();
        state.disks.remove(device_path);
        for mounts in state.mounts.values_mut() {
            mounts.retain(|m| m.device_path != device_path);
        }
        state.luks_mappings.remove(device_path);
    }

    /// Flip an active mount to read-only, as a failing disk would.
    pub fn remount_read_only(&self, mount_path: &str) {
        let mut state = self.state.lock();
        for mounts in state.mounts.values_mut() {
            for mount in mounts.iter_mut().filter(|m| m.mount_path == mount_path) {
                mount.options.insert("ro".to_string());
            }
        }
    }

    pub fn set_durable_broken_flag(&self, drive_id: &str, device_path: &str) {
        self.state
            .lock()
            .durable_broken_flags
            .insert(drive_id.to_string(), device_path.to_string());
    }

    /// Simulates an operator deleting the transient broken flag.
    pub fn remove_broken_flag(&self, drive_id: &str) {
        self.state.lock().broken_flags.remove(drive_id);
    }

    pub fn remove_durable_broken_flag(&self, drive_id: &str) {
        self.state.lock().durable_broken_flags.remove(drive_id);
    }

    pub fn emit_kernel_log(&self, line: &str) {
        let tx = self.state.lock().kernel_log_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.try_send(line.to_string());
        }
    }

    // --- test inspection -----------------------------------------------------

    pub fn mounts_at(&self, mount_path: &str) -> Vec<MountObservation> {
        let state = self.state.lock();
        state
            .mounts
            .get(&MountScope::Host)
            .map(|mounts| {
                mounts
                    .iter()
                    .filter(|m| m.mount_path == mount_path)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_broken_flag(&self, drive_id: &str) -> bool {
        self.state.lock().broken_flags.contains_key(drive_id)
    }

    pub fn has_unmount_propagation(&self, mount_name: &str) -> bool {
        self.state
            .lock()
            .unmount_propagation
            .contains_key(mount_name)
    }

    pub fn drive_audit(&self) -> Option<BTreeMap<String, i64>> {
        self.state.lock().drive_audit.clone()
    }

    pub fn ready_count(&self) -> u64 {
        self.state.lock().ready_count
    }

    pub fn chown_calls(&self) -> Vec<(String, Option<String>, Option<String>)> {
        self.state.lock().chown_calls.clone()
    }

    pub fn mapping_for(&self, device_path: &str) -> Option<String> {
        self.state.lock().luks_mappings.get(device_path).cloned()
    }

    /// The swift-id file on the disk's filesystem (following one LUKS layer
    /// down if needed), regardless of where or whether it is mounted.
    pub fn swift_id_on_disk(&self, device_path: &str) -> Option<String> {
        let state = self.state.lock();
        let disk = state.disks.get(device_path)?;
        let content = match &disk.content {
            MockContent::Luks { inner, .. } => inner.as_ref(),
            other => other,
        };
        match content {
            MockContent::Xfs { files } => {
                files.get("swift-id").map(|buf| buf.trim().to_string())
            }
            _ => None,
        }
    }

    // --- content resolution --------------------------------------------------

    /// Resolve a device path (base or mapped) to the backing disk path plus
    /// whether the path addresses the mapped layer.
    fn resolve_device(state: &MockState, device_path: &str) -> Option<(String, bool)> {
        if state.disks.contains_key(device_path) {
            return Some((device_path.to_string(), false));
        }
        state
            .luks_mappings
            .iter()
            .find(|(_, mapped)| mapped.as_str() == device_path)
            .map(|(backing, _)| (backing.clone(), true))
    }

    fn with_content<T>(
        &self,
        device_path: &str,
        action: impl FnOnce(&mut MockContent) -> T,
    ) -> Option<T> {
        let mut state = self.state.lock();
        let (backing, mapped) = Self::resolve_device(&state, device_path)?;
        let disk = state.disks.get_mut(&backing)?;
        let content = if mapped {
            match &mut disk.content {
                MockContent::Luks { inner, .. } => inner.as_mut(),
                _ => return None,
            }
        } else {
            &mut disk.content
        };
        Some(action(content))
    }

    fn device_mounted_at(&self, mount_path: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .mounts
            .get(&MountScope::Host)
            .and_then(|mounts| mounts.iter().find(|m| m.mount_path == mount_path))
            .map(|m| m.device_path.clone())
    }
}

#[async_trait]
impl OsFacade for MockOs {
    async fn scan_drives(&self, globs: &[String]) -> Result<Vec<DriveObservation>> {
        let patterns: Vec<glob::Pattern> = globs
            .iter()
            .map(|pattern| {
                glob::Pattern::new(pattern)
                    .map_err(|err| Error::Configuration(format!("glob({pattern:?}): {err}")))
            })
            .collect::<Result<_>>()?;

        let state = self.state.lock();
        let mut result = Vec::new();
        let mut found_any = false;
        for (device_path, disk) in &state.disks {
            if !patterns.iter().any(|p| p.matches(device_path)) {
                continue;
            }
            found_any = true;
            if disk.has_partition_table {
                continue;
            }
            if !disk.readable {
                // recoverable only when a mapping is still open; its name is
                // the serial number by convention
                if let Some(mapped) = state.luks_mappings.get(device_path) {
                    result.push(DriveObservation {
                        device_path: device_path.clone(),
                        found_at_path: device_path.clone(),
                        serial: mapped.strip_prefix("/dev/mapper/").map(|s| s.to_string()),
                        media_type: None,
                    });
                }
                continue;
            }
            result.push(DriveObservation {
                device_path: device_path.clone(),
                found_at_path: device_path.clone(),
                serial: disk.serial.clone(),
                media_type: None,
            });
        }

        if !found_any {
            return Err(Error::NoDrivesMatched {
                patterns: globs.join(", "),
            });
        }
        Ok(result)
    }

    fn tail_kernel_log(&self) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(100);
        self.state.lock().kernel_log_tx = Some(tx);
        Ok(rx)
    }

    async fn classify_device(&self, device_path: &str) -> DeviceType {
        {
            let state = self.state.lock();
            match Self::resolve_device(&state, device_path) {
                Some((backing, _)) => {
                    if !state.disks[&backing].readable {
                        return DeviceType::Unreadable;
                    }
                }
                None => return DeviceType::Unreadable,
            }
        }
        self.with_content(device_path, |content| match content {
            MockContent::Blank => DeviceType::Unknown,
            MockContent::Luks { .. } => DeviceType::Luks,
            MockContent::Xfs { .. } => DeviceType::Filesystem,
        })
        .unwrap_or(DeviceType::Unreadable)
    }

    async fn format_xfs(&self, device_path: &str) -> Result<()> {
        self.with_content(device_path, |content| {
            *content = MockContent::empty_xfs();
        })
        .ok_or_else(|| Error::CommandFailed {
            command: format!("mkfs.xfs -f {device_path}"),
            reason: "no such device".into(),
        })
    }

    async fn mount(&self, device_path: &str, mount_path: &str, scope: MountScope) -> Result<()> {
        let mut state = self.state.lock();
        if Self::resolve_device(&state, device_path).is_none() {
            return Err(Error::CommandFailed {
                command: format!("mount {device_path} {mount_path}"),
                reason: "no such device".into(),
            });
        }
        // the mock always behaves like a single mount namespace
        let _ = scope;
        for scope in MountScope::ALL {
            let mounts = state.mounts.entry(scope).or_default();
            if !mounts
                .iter()
                .any(|m| m.device_path == device_path && m.mount_path == mount_path)
            {
                mounts.push(MountObservation {
                    device_path: device_path.to_string(),
                    mount_path: mount_path.to_string(),
                    options: std::iter::once("rw".to_string()).collect(),
                });
            }
        }
        Ok(())
    }

    async fn unmount(&self, mount_path: &str, scope: MountScope) -> Result<()> {
        let mut state = self.state.lock();
        let _ = scope;
        for scope in MountScope::ALL {
            if let Some(mounts) = state.mounts.get_mut(&scope) {
                mounts.retain(|m| m.mount_path != mount_path);
            }
        }
        Ok(())
    }

    async fn refresh_mounts(&self) -> Result<()> {
        Ok(()) // mock state is always fresh
    }

    fn mounts_in(&self, mount_path_prefix: &str, scope: MountScope) -> Vec<MountObservation> {
        let prefix = if mount_path_prefix.ends_with('/') {
            mount_path_prefix.to_string()
        } else {
            format!("{mount_path_prefix}/")
        };
        let state = self.state.lock();
        state
            .mounts
            .get(&scope)
            .map(|mounts| {
                mounts
                    .iter()
                    .filter(|m| m.mount_path.starts_with(&prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn mounts_of(&self, device_path: &str, scope: MountScope) -> Vec<MountObservation> {
        let state = self.state.lock();
        state
            .mounts
            .get(&scope)
            .map(|mounts| {
                mounts
                    .iter()
                    .filter(|m| m.device_path == device_path)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn create_luks(&self, device_path: &str, key: &str) -> Result<()> {
        self.with_content(device_path, |content| {
            *content = MockContent::Luks {
                keys: vec![key.to_string()],
                inner: Box::new(MockContent::Blank),
            };
        })
        .ok_or_else(|| Error::CommandFailed {
            command: format!("cryptsetup luksFormat {device_path}"),
            reason: "no such device".into(),
        })
    }

    async fn open_luks(
        &self,
        device_path: &str,
        mapping_name: &str,
        keys: &[String],
    ) -> Result<String> {
        let accepted = self
            .with_content(device_path, |content| match content {
                MockContent::Luks {
                    keys: accepted_keys,
                    ..
                } => keys.iter().any(|key| accepted_keys.contains(key)),
                _ => false,
            })
            .unwrap_or(false);

        if !accepted {
            return Err(Error::CommandFailed {
                command: format!("cryptsetup luksOpen {device_path} {mapping_name}"),
                reason: "none of the configured keys was accepted".into(),
            });
        }

        let mapped_device_path = format!("/dev/mapper/{mapping_name}");
        self.state
            .lock()
            .luks_mappings
            .insert(device_path.to_string(), mapped_device_path.clone());
        Ok(mapped_device_path)
    }

    async fn close_luks(&self, mapping_name: &str) -> Result<()> {
        let mapped = format!("/dev/mapper/{mapping_name}");
        self.state
            .lock()
            .luks_mappings
            .retain(|_, mapped_path| *mapped_path != mapped);
        Ok(())
    }

    async fn refresh_luks(&self) -> Result<()> {
        Ok(()) // mock state is always fresh
    }

    fn luks_mapping_of(&self, device_path: &str) -> Option<String> {
        self.state.lock().luks_mappings.get(device_path).cloned()
    }

    async fn read_swift_id(&self, mount_path: &str) -> Result<Option<String>> {
        let device_path = match self.device_mounted_at(mount_path) {
            Some(device_path) => device_path,
            None => return Ok(None),
        };
        Ok(self
            .with_content(&device_path, |content| match content {
                MockContent::Xfs { files } => {
                    files.get("swift-id").map(|buf| buf.trim().to_string())
                }
                _ => None,
            })
            .flatten())
    }

    async fn write_swift_id(&self, mount_path: &str, swift_id: &str) -> Result<()> {
        let device_path = self.device_mounted_at(mount_path).ok_or_else(|| {
            Error::CommandFailed {
                command: format!("write {mount_path}/swift-id"),
                reason: "nothing mounted there".into(),
            }
        })?;
        self.with_content(&device_path, |content| {
            if let MockContent::Xfs { files } = content {
                files.insert("swift-id".to_string(), format!("{swift_id}\n"));
            }
        });
        Ok(())
    }

    async fn chown(&self, path: &str, owner: Option<&str>, group: Option<&str>) -> Result<()> {
        self.state.lock().chown_calls.push((
            path.to_string(),
            owner.map(|s| s.to_string()),
            group.map(|s| s.to_string()),
        ));
        Ok(())
    }

    async fn prepare_state_dirs(&self) -> Result<()> {
        Ok(())
    }

    async fn set_broken_flag(&self, drive_id: &str, device_path: &str) -> Result<()> {
        self.state
            .lock()
            .broken_flags
            .insert(drive_id.to_string(), device_path.to_string());
        Ok(())
    }

    async fn is_flagged_broken(&self, drive_id: &str) -> bool {
        let state = self.state.lock();
        state.broken_flags.contains_key(drive_id)
            || state.durable_broken_flags.contains_key(drive_id)
    }

    async fn list_broken_flags(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.state.lock().broken_flags.clone())
    }

    async fn set_unmount_propagation(&self, mount_name: &str, device_path: &str) -> Result<()> {
        self.state
            .lock()
            .unmount_propagation
            .insert(mount_name.to_string(), device_path.to_string());
        Ok(())
    }

    async fn clear_unmount_propagation(&self, mount_name: &str) -> Result<()> {
        self.state.lock().unmount_propagation.remove(mount_name);
        Ok(())
    }

    async fn clear_unmount_propagation_for_device(&self, device_path: &str) -> Result<()> {
        self.state
            .lock()
            .unmount_propagation
            .retain(|_, target| target != device_path);
        Ok(())
    }

    async fn write_drive_audit(&self, entries: &BTreeMap<String, i64>) -> Result<()> {
        self.state.lock().drive_audit = Some(entries.clone());
        Ok(())
    }

    async fn announce_ready(&self) -> Result<()> {
        self.state.lock().ready_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_classify_and_format() {
        let os = MockOs::new();
        os.add_disk("/dev/sdb", MockDisk::new(MockContent::Blank));
        assert_eq!(os.classify_device("/dev/sdb").await, DeviceType::Unknown);

        os.format_xfs("/dev/sdb").await.unwrap();
        assert_eq!(os.classify_device("/dev/sdb").await, DeviceType::Filesystem);

        assert_eq!(os.classify_device("/dev/sdx").await, DeviceType::Unreadable);
    }

    #[tokio::test]
    async fn test_luks_lifecycle() {
        let os = MockOs::new();
        os.add_disk("/dev/sdb", MockDisk::new(MockContent::Blank));
        os.create_luks("/dev/sdb", "k1").await.unwrap();
        assert_eq!(os.classify_device("/dev/sdb").await, DeviceType::Luks);

        assert!(os
            .open_luks("/dev/sdb", "MAP", &["wrong".to_string()])
            .await
            .is_err());
        let mapped = os
            .open_luks("/dev/sdb", "MAP", &["other".to_string(), "k1".to_string()])
            .await
            .unwrap();
        assert_eq!(mapped, "/dev/mapper/MAP");
        assert_eq!(os.luks_mapping_of("/dev/sdb").as_deref(), Some(mapped.as_str()));

        // the mapped device addresses the inner content
        assert_eq!(os.classify_device(&mapped).await, DeviceType::Unknown);
        os.format_xfs(&mapped).await.unwrap();
        assert_eq!(os.classify_device(&mapped).await, DeviceType::Filesystem);

        os.close_luks("MAP").await.unwrap();
        assert!(os.luks_mapping_of("/dev/sdb").is_none());
    }

    #[tokio::test]
    async fn test_swift_id_follows_the_disk() {
        let os = MockOs::new();
        os.add_disk("/dev/sdb", MockDisk::new(MockContent::empty_xfs()));
        os.mount("/dev/sdb", "/run/swift-storage/x", MountScope::Host)
            .await
            .unwrap();
        os.write_swift_id("/run/swift-storage/x", "swift-01")
            .await
            .unwrap();
        os.unmount("/run/swift-storage/x", MountScope::Host)
            .await
            .unwrap();
        os.mount("/dev/sdb", "/srv/node/swift-01", MountScope::Host)
            .await
            .unwrap();
        assert_eq!(
            os.read_swift_id("/srv/node/swift-01").await.unwrap().as_deref(),
            Some("swift-01")
        );
        assert_eq!(os.swift_id_on_disk("/dev/sdb").as_deref(), Some("swift-01"));
    }

    #[tokio::test]
    async fn test_scan_drives_fatal_when_nothing_matches() {
        let os = MockOs::new();
        os.add_disk("/dev/sdb", MockDisk::new(MockContent::Blank));
        let err = os.scan_drives(&["/dev/vd*".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::NoDrivesMatched { .. }));
    }

    #[tokio::test]
    async fn test_scan_drives_reports_unreadable_with_open_mapping() {
        let os = MockOs::new();
        let mut disk = MockDisk::new(MockContent::Luks {
            keys: vec!["k1".to_string()],
            inner: Box::new(MockContent::empty_xfs()),
        });
        disk.readable = false;
        os.add_disk("/dev/sdb", disk);

        // no open mapping: the unreadable drive is skipped entirely
        os.add_disk("/dev/sdc", MockDisk::new(MockContent::Blank));
        let observations = os.scan_drives(&["/dev/sd*".to_string()]).await.unwrap();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].device_path, "/dev/sdc");

        // open mapping: the drive is reported with the recovered serial
        os.state
            .lock()
            .luks_mappings
            .insert("/dev/sdb".to_string(), "/dev/mapper/SERIAL123".to_string());
        let observations = os.scan_drives(&["/dev/sd*".to_string()]).await.unwrap();
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].serial.as_deref(), Some("SERIAL123"));
    }

    #[test]
    fn test_final_mount_dir_constant() {
        // the mock and the production facade agree on the namespace layout
        assert_eq!(FINAL_MOUNT_DIR, "/srv/node");
    }
}
