//! Linux Facade Implementation
//!
//! Implements [`OsFacade`] for productive runs on Linux hosts. All state
//! observed from the system (mounts, LUKS mappings) is kept in a snapshot
//! that the converger refreshes once per pass.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::os::command::{CommandOptions, CommandRunner};
use crate::os::lsblk::LsblkOutput;
use crate::os::{
    DeviceType, DriveObservation, MediaType, MountObservation, MountScope, OsFacade,
    BROKEN_FLAG_DIR, DRIVE_AUDIT_PATH, DURABLE_BROKEN_FLAG_DIR, READY_FLAG_PATH,
    UNMOUNT_PROPAGATION_DIR,
};

// =============================================================================
// Mount Propagation
// =============================================================================

/// Whether this process and processes within the chroot have different mount
/// namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountPropagationMode {
    /// No chroot is configured; there is only one mount namespace.
    Single,
    /// Mounts performed in the host namespace automatically appear in the
    /// local namespace.
    Connected,
    /// Mounts performed in the host namespace do NOT appear in the local
    /// namespace; every operation is applied once per scope.
    Separate,
}

impl std::fmt::Display for MountPropagationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountPropagationMode::Single => write!(f, "none"),
            MountPropagationMode::Connected => write!(f, "connected"),
            MountPropagationMode::Separate => write!(f, "separate"),
        }
    }
}

/// Decide the propagation mode by looking for the chroot's bind-mount in
/// /proc/self/mountinfo and inspecting its optional fields.
fn detect_mount_propagation(mountinfo: &str, chroot_path: &Path) -> Result<MountPropagationMode> {
    for line in mountinfo.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        // format is documented in the kernel's filesystems/proc.txt; field 5
        // is the mount point, fields 7.. up to the "-" separator are optional
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 || Path::new(fields[4]) != chroot_path {
            continue;
        }

        for field in &fields[6..] {
            if *field == "-" {
                break;
            }
            if field.starts_with("shared:")
                || field.starts_with("master:")
                || field.starts_with("propagate_from:")
            {
                return Ok(MountPropagationMode::Connected);
            }
        }

        // no evidence for connected mount namespaces
        return Ok(MountPropagationMode::Separate);
    }

    Err(Error::MountPropagationDetection(format!(
        "could not find mount for {} in /proc/self/mountinfo",
        chroot_path.display()
    )))
}

// =============================================================================
// Output Parsing
// =============================================================================

static SERIAL_NUMBER_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Serial number:\s*(\S+)\s*$").unwrap());
static VENDOR_RX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^Vendor:\s*(\S+)\s*$").unwrap());
static ROTATION_RATE_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Rotation Rate:\s*([a-zA-Z0-9- ]*)$").unwrap());

/// When a drive has a partition table, `sfdisk -l` prints a line like
/// "Disklabel type: gpt". For unpartitioned devices this line is missing.
static PARTITION_TABLE_RX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?mi)^Disklabel type").unwrap());

static BACKING_DEVICE_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*device:\s*(\S+)\s*$").unwrap());

static SPECIAL_CHAR_IN_SERIAL_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_-]").unwrap());

/// Disk serial numbers may contain characters (e.g. + or ] on some iSCSI
/// volumes) that confuse `cryptsetup luksOpen` when used as a mapping name,
/// so they are normalized early on.
fn sanitize_serial_number(input: &str) -> String {
    SPECIAL_CHAR_IN_SERIAL_RX.replace_all(input, "_").into_owned()
}

/// Information extracted from `smartctl -i`.
#[derive(Debug, Default, PartialEq, Eq)]
struct SmartctlInfo {
    serial: Option<String>,
    vendor: Option<String>,
    rotation_rate: Option<String>,
}

fn parse_smartctl_info(stdout: &str) -> SmartctlInfo {
    let capture = |rx: &Regex| {
        rx.captures(stdout)
            .map(|c| sanitize_serial_number(c[1].trim()).to_lowercase())
    };
    SmartctlInfo {
        serial: SERIAL_NUMBER_RX
            .captures(stdout)
            .map(|c| sanitize_serial_number(&c[1])),
        vendor: capture(&VENDOR_RX),
        rotation_rate: capture(&ROTATION_RATE_RX),
    }
}

fn media_type_from(info: &SmartctlInfo) -> Option<MediaType> {
    let vendor = info.vendor.as_deref()?;
    let rotation_rate = info.rotation_rate.as_deref()?;
    if vendor == "nvme" {
        Some(MediaType::Nvme)
    } else if rotation_rate.contains("rpm") {
        Some(MediaType::Hdd)
    } else {
        Some(MediaType::Ssd)
    }
}

/// Parse the output of mount(8); each line looks like
/// "<device> on <mountpoint> type <type> (<options>)".
fn parse_mount_output(stdout: &str) -> Vec<MountObservation> {
    let mut result = Vec::new();
    for line in stdout.lines() {
        let words: Vec<&str> = line.split(' ').collect();
        if words.len() < 6 || words[1] != "on" {
            continue;
        }
        let (device_path, mount_path) = (words[0], words[2]);

        // ignore mount points duplicated by container runtimes
        if mount_path.starts_with("/var/lib/docker/")
            || mount_path.starts_with("/var/lib/rkt/")
            || mount_path.starts_with("/var/lib/kubelet/")
        {
            continue;
        }

        let options: HashSet<String> = words[5]
            .trim_start_matches('(')
            .trim_end_matches(')')
            .split(',')
            .map(|option| option.to_string())
            .collect();

        result.push(MountObservation {
            device_path: device_path.to_string(),
            mount_path: mount_path.to_string(),
            options,
        });
    }
    result
}

// =============================================================================
// Linux Facade
// =============================================================================

#[derive(Debug, Default)]
struct Snapshot {
    mounts: HashMap<MountScope, Vec<MountObservation>>,
    /// backing device path → mapped device path
    luks_mappings: HashMap<String, String>,
}

/// The [`OsFacade`] implementation for productive runs.
pub struct Linux {
    runner: CommandRunner,
    chroot_active: bool,
    propagation: MountPropagationMode,
    snapshot: Mutex<Snapshot>,
}

impl Linux {
    /// Initialize the facade. The process must already have chdir'd into the
    /// chroot (when one is configured).
    pub fn new(chroot_active: bool) -> Result<Linux> {
        let propagation = if chroot_active {
            let cwd = std::env::current_dir()?;
            let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
            detect_mount_propagation(&mountinfo, &cwd)?
        } else {
            MountPropagationMode::Single
        };
        if !crate::util::in_test_mode() {
            info!("mount propagation mode is: {propagation}");
        }

        Ok(Linux {
            runner: CommandRunner::new(chroot_active),
            chroot_active,
            propagation,
            snapshot: Mutex::new(Snapshot::default()),
        })
    }

    fn scopes_are_separate(&self) -> bool {
        self.propagation == MountPropagationMode::Separate
    }

    /// Resolve symlinks in a path that is interpreted inside the chroot.
    fn eval_symlinks_in_chroot(&self, globbed_rel_path: &str) -> Result<String> {
        let resolved = std::fs::canonicalize(globbed_rel_path)?;
        if self.chroot_active {
            let cwd = std::env::current_dir()?;
            if let Ok(stripped) = resolved.strip_prefix(&cwd) {
                return Ok(format!("/{}", stripped.display()));
            }
        }
        Ok(resolved.display().to_string())
    }

    /// Ask lsblk whether the unreadable device has an open LUKS mapping from
    /// before the IO error; if so, the mapping name is the serial number by
    /// our own naming convention. A failing or unparseable `lsblk -J` is a
    /// fatal snapshot error.
    async fn try_find_serial_for_broken_device(&self, device_path: &str) -> Result<Option<String>> {
        let stdout = self
            .runner
            .run(&["lsblk", "-J"], CommandOptions::default())
            .await?;
        let output = LsblkOutput::parse(&stdout)?;
        Ok(output.find_serial_number_for_device(device_path))
    }

    fn record_mount(&self, mount: MountObservation, scope: MountScope) {
        let mut snapshot = self.snapshot.lock();
        if self.scopes_are_separate() {
            snapshot.mounts.entry(scope).or_default().push(mount);
        } else {
            for scope in MountScope::ALL {
                snapshot.mounts.entry(scope).or_default().push(mount.clone());
            }
        }
    }

    fn record_unmount(&self, mount_path: &str, scope: MountScope) {
        let mut snapshot = self.snapshot.lock();
        let scopes: &[MountScope] = if self.scopes_are_separate() {
            &[scope]
        } else {
            &MountScope::ALL
        };
        for scope in scopes {
            if let Some(mounts) = snapshot.mounts.get_mut(scope) {
                mounts.retain(|m| m.mount_path != mount_path);
            }
        }
    }

    async fn collect_mounts(&self, scope: MountScope) -> Result<Vec<MountObservation>> {
        // mount(8) runs inside the chroot even for the local scope so that
        // reported paths are not prefixed with the chroot path
        let stdout = self
            .runner
            .run(
                &["mount"],
                CommandOptions {
                    no_nsenter: scope == MountScope::Local,
                    ..Default::default()
                },
            )
            .await?;
        Ok(parse_mount_output(&stdout))
    }
}

#[async_trait]
impl OsFacade for Linux {
    async fn scan_drives(&self, globs: &[String]) -> Result<Vec<DriveObservation>> {
        let mut result = Vec::new();
        let mut found_any = false;

        for pattern in globs {
            // make the pattern relative to the cwd (== chroot directory)
            let rel_pattern = pattern.trim_start_matches('/');
            let matches = glob::glob(rel_pattern).map_err(|err| {
                Error::Configuration(format!("glob({pattern:?}) failed: {err}"))
            })?;

            for entry in matches {
                let globbed_rel_path = match entry {
                    Ok(path) => path.display().to_string(),
                    Err(err) => {
                        warn!("glob({pattern:?}): {err}");
                        continue;
                    }
                };
                found_any = true;
                let found_at_path = format!("/{globbed_rel_path}");
                let device_path = self.eval_symlinks_in_chroot(&globbed_rel_path)?;

                // ignore devices with partitions
                let sfdisk_output = self
                    .runner
                    .run(
                        &["sfdisk", "-l", device_path.as_str()],
                        CommandOptions {
                            skip_log: true,
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap_or_default();
                if PARTITION_TABLE_RX.is_match(&sfdisk_output) {
                    info!("ignoring drive {device_path} because it contains partitions");
                    continue;
                }

                if sfdisk_output.trim().is_empty() {
                    // `sfdisk -l` printing nothing at all means the device is
                    // not readable (e.g. a KVM remote volume where open()
                    // fails with ENOMEDIUM). If the drive has a LUKS
                    // container opened from before an IO error, report it
                    // anyway so that the error propagates upwards.
                    if let Some(serial) =
                        self.try_find_serial_for_broken_device(&device_path).await?
                    {
                        result.push(DriveObservation {
                            device_path: device_path.clone(),
                            found_at_path,
                            serial: Some(serial),
                            media_type: None,
                        });
                    }
                    info!("ignoring drive {device_path} because it is not readable");
                    continue;
                }

                // read the serial number using smartctl (relative path and no
                // chroot, since the host may not have smartctl in the chroot)
                let rel_device_path = device_path.trim_start_matches('/');
                let smartctl_output = self
                    .runner
                    .run(
                        &["smartctl", "-d", "scsi", "-i", rel_device_path],
                        CommandOptions {
                            no_chroot: true,
                            no_nsenter: true,
                            skip_log: true,
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap_or_default();
                let smartctl_info = parse_smartctl_info(&smartctl_output);
                let media_type = media_type_from(&smartctl_info);
                if let Some(media_type) = media_type {
                    debug!("drive {device_path} has media type {media_type}");
                }

                result.push(DriveObservation {
                    device_path,
                    found_at_path,
                    serial: smartctl_info.serial,
                    media_type,
                });
            }
        }

        // fail loudly when nothing matches our globs: this is almost always
        // a misconfiguration, and continuing would silently manage nothing
        if !found_any {
            return Err(Error::NoDrivesMatched {
                patterns: globs.join(", "),
            });
        }

        result.sort_by(|a, b| a.device_path.cmp(&b.device_path));
        Ok(result)
    }

    fn tail_kernel_log(&self) -> Result<mpsc::Receiver<String>> {
        // assembled manually (instead of via CommandRunner) because we need
        // a long-lived pipe on stdout
        let mut argv: Vec<&str> = vec!["journalctl", "-kf"];
        if self.chroot_active {
            argv = [
                vec!["chroot", ".", "nsenter", "--ipc=/proc/1/ns/ipc", "--"],
                argv,
            ]
            .concat();
        }
        if unsafe { libc::geteuid() } != 0 {
            argv.insert(0, "sudo");
        }

        let mut child = tokio::process::Command::new(argv[0])
            .args(&argv[1..])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| Error::CommandFailed {
            command: argv.join(" "),
            reason: "cannot attach to stdout".into(),
        })?;

        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            // the child handle is owned here so the process outlives the call
            let _child = child;
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(line).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(err) => warn!("error reading kernel log: {err}"),
                }
            }
        });
        Ok(rx)
    }

    async fn classify_device(&self, device_path: &str) -> DeviceType {
        // ask file(1) to identify the contents of this device; not run in
        // the chroot because e.g. CoreOS does not ship file(1)
        let rel_device_path = device_path.trim_start_matches('/');
        let desc = match self
            .runner
            .run(
                &["file", "-bLs", rel_device_path],
                CommandOptions {
                    no_chroot: true,
                    ..Default::default()
                },
            )
            .await
        {
            Ok(desc) => desc,
            Err(_) => return DeviceType::Unreadable,
        };

        if desc.starts_with("LUKS encrypted file") {
            DeviceType::Luks
        } else if desc.contains("filesystem data") {
            DeviceType::Filesystem
        } else {
            DeviceType::Unknown
        }
    }

    async fn format_xfs(&self, device_path: &str) -> Result<()> {
        self.runner
            .run(&["mkfs.xfs", "-f", device_path], CommandOptions::default())
            .await?;
        Ok(())
    }

    async fn mount(&self, device_path: &str, mount_path: &str, scope: MountScope) -> Result<()> {
        // check if already mounted
        {
            let snapshot = self.snapshot.lock();
            if snapshot
                .mounts
                .get(&scope)
                .map(|mounts| {
                    mounts
                        .iter()
                        .any(|m| m.device_path == device_path && m.mount_path == mount_path)
                })
                .unwrap_or(false)
            {
                return Ok(());
            }
        }

        self.runner
            .run(
                &["mkdir", "-m", "0700", "-p", mount_path],
                CommandOptions::default(),
            )
            .await?;
        self.runner
            .run(
                &["mount", device_path, mount_path],
                CommandOptions {
                    no_nsenter: scope == MountScope::Local,
                    ..Default::default()
                },
            )
            .await?;

        info!("mounted {device_path} to {mount_path} in {scope} mount namespace");
        if !self.scopes_are_separate() {
            for other in MountScope::ALL.into_iter().filter(|s| *s != scope) {
                info!("mounted {device_path} to {mount_path} in {other} mount namespace");
            }
        }

        self.record_mount(
            MountObservation {
                device_path: device_path.to_string(),
                mount_path: mount_path.to_string(),
                options: HashSet::new(),
            },
            scope,
        );
        Ok(())
    }

    async fn unmount(&self, mount_path: &str, scope: MountScope) -> Result<()> {
        // check if already unmounted
        {
            let snapshot = self.snapshot.lock();
            let mounted = snapshot
                .mounts
                .get(&scope)
                .map(|mounts| mounts.iter().any(|m| m.mount_path == mount_path))
                .unwrap_or(false);
            if !mounted {
                return Ok(());
            }
        }

        self.runner
            .run(
                &["umount", mount_path],
                CommandOptions {
                    no_nsenter: scope == MountScope::Local,
                    ..Default::default()
                },
            )
            .await?;

        info!("unmounted {mount_path} in {scope} mount namespace");
        if !self.scopes_are_separate() {
            for other in MountScope::ALL.into_iter().filter(|s| *s != scope) {
                info!("unmounted {mount_path} in {other} mount namespace");
            }
        }

        self.record_unmount(mount_path, scope);
        Ok(())
    }

    async fn refresh_mounts(&self) -> Result<()> {
        let local = self.collect_mounts(MountScope::Local).await?;
        let host = if self.scopes_are_separate() {
            self.collect_mounts(MountScope::Host).await?
        } else {
            local.clone()
        };

        let mut snapshot = self.snapshot.lock();
        snapshot.mounts.insert(MountScope::Local, local);
        snapshot.mounts.insert(MountScope::Host, host);
        for (scope, mounts) in &snapshot.mounts {
            for mount in mounts {
                debug!("active mount [{scope}]: {mount:?}");
            }
        }
        Ok(())
    }

    fn mounts_in(&self, mount_path_prefix: &str, scope: MountScope) -> Vec<MountObservation> {
        let prefix = if mount_path_prefix.ends_with('/') {
            mount_path_prefix.to_string()
        } else {
            format!("{mount_path_prefix}/")
        };
        let snapshot = self.snapshot.lock();
        snapshot
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
        let snapshot = self.snapshot.lock();
        snapshot
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
        self.runner
            .run(
                &["cryptsetup", "luksFormat", device_path],
                CommandOptions {
                    stdin: Some(format!("{key}\n")),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn open_luks(
        &self,
        device_path: &str,
        mapping_name: &str,
        keys: &[String],
    ) -> Result<String> {
        // try each key until one works
        for (idx, key) in keys.iter().enumerate() {
            debug!("trying to luksOpen {device_path} as {mapping_name} with key {idx}...");
            let outcome = self
                .runner
                .run(
                    &["cryptsetup", "luksOpen", device_path, mapping_name],
                    CommandOptions {
                        stdin: Some(format!("{key}\n")),
                        skip_log: true,
                        ..Default::default()
                    },
                )
                .await;
            if outcome.is_ok() {
                let mapped_device_path = format!("/dev/mapper/{mapping_name}");
                self.snapshot
                    .lock()
                    .luks_mappings
                    .insert(device_path.to_string(), mapped_device_path.clone());
                return Ok(mapped_device_path);
            }
        }

        Err(Error::CommandFailed {
            command: format!("cryptsetup luksOpen {device_path} {mapping_name}"),
            reason: "none of the configured keys was accepted".into(),
        })
    }

    async fn close_luks(&self, mapping_name: &str) -> Result<()> {
        self.runner
            .run(
                &["cryptsetup", "close", mapping_name],
                CommandOptions::default(),
            )
            .await?;
        let mapped = format!("/dev/mapper/{mapping_name}");
        self.snapshot
            .lock()
            .luks_mappings
            .retain(|_, mapped_path| *mapped_path != mapped);
        Ok(())
    }

    async fn refresh_luks(&self) -> Result<()> {
        let stdout = self
            .runner
            .run(
                &["dmsetup", "ls", "--target=crypt"],
                CommandOptions::default(),
            )
            .await?;

        let mut mappings = HashMap::new();
        for line in stdout.lines() {
            // each line describes one mapping: "mapname\t(maj, min)"
            if line.trim() == "No devices found" {
                continue;
            }
            let Some(mapping_name) = line.split_whitespace().next() else {
                continue;
            };

            // ask cryptsetup for the device backing this mapping
            let status = self
                .runner
                .run(
                    &["cryptsetup", "status", mapping_name],
                    CommandOptions {
                        skip_log: true,
                        ..Default::default()
                    },
                )
                .await;
            let status = match status {
                Ok(status) => status,
                Err(err) => {
                    // the mapping may have vanished between dmsetup and now
                    debug!("cryptsetup status {mapping_name} failed: {err}");
                    continue;
                }
            };
            match BACKING_DEVICE_RX.captures(&status) {
                Some(captures) => {
                    mappings.insert(
                        captures[1].to_string(),
                        format!("/dev/mapper/{mapping_name}"),
                    );
                }
                None => {
                    warn!("cannot find backing device for /dev/mapper/{mapping_name}");
                }
            }
        }

        for (backing, mapped) in &mappings {
            debug!("active LUKS mapping: {backing} -> {mapped}");
        }
        self.snapshot.lock().luks_mappings = mappings;
        Ok(())
    }

    fn luks_mapping_of(&self, device_path: &str) -> Option<String> {
        self.snapshot.lock().luks_mappings.get(device_path).cloned()
    }

    async fn read_swift_id(&self, mount_path: &str) -> Result<Option<String>> {
        let path = swift_id_path_in(mount_path);
        match tokio::fs::read_to_string(&path).await {
            Ok(buf) => Ok(Some(buf.trim().to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_swift_id(&self, mount_path: &str, swift_id: &str) -> Result<()> {
        let path = swift_id_path_in(mount_path);
        tokio::fs::write(&path, format!("{swift_id}\n")).await?;
        Ok(())
    }

    async fn chown(&self, path: &str, owner: Option<&str>, group: Option<&str>) -> Result<()> {
        let (command, arg) = match (owner, group) {
            (None, None) => return Ok(()),
            (None, Some(group)) => ("chgrp", group.to_string()),
            (Some(owner), None) => ("chown", owner.to_string()),
            (Some(owner), Some(group)) => ("chown", format!("{owner}:{group}")),
        };
        debug!("{command} {path} to {arg}");
        self.runner
            .run(&[command, arg.as_str(), path], CommandOptions::default())
            .await?;
        Ok(())
    }

    async fn prepare_state_dirs(&self) -> Result<()> {
        self.runner
            .run(
                &[
                    "mkdir",
                    "-p",
                    BROKEN_FLAG_DIR,
                    UNMOUNT_PROPAGATION_DIR,
                    "/var/cache/swift",
                ],
                CommandOptions::default(),
            )
            .await?;
        Ok(())
    }

    async fn set_broken_flag(&self, drive_id: &str, device_path: &str) -> Result<()> {
        let flag_path = format!("{BROKEN_FLAG_DIR}/{drive_id}");
        self.runner
            .run(
                &["ln", "-sfT", device_path, flag_path.as_str()],
                CommandOptions::default(),
            )
            .await?;
        Ok(())
    }

    async fn is_flagged_broken(&self, drive_id: &str) -> bool {
        for dir in [BROKEN_FLAG_DIR, DURABLE_BROKEN_FLAG_DIR] {
            let flag_path = rel(&format!("{dir}/{drive_id}"));
            if tokio::fs::symlink_metadata(&flag_path).await.is_ok() {
                return true;
            }
        }
        false
    }

    async fn list_broken_flags(&self) -> Result<BTreeMap<String, String>> {
        let mut result = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(rel(BROKEN_FLAG_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if !file_type.is_symlink() {
                continue;
            }
            let target = tokio::fs::read_link(entry.path()).await?;
            result.insert(
                entry.file_name().to_string_lossy().into_owned(),
                target.display().to_string(),
            );
        }
        Ok(result)
    }

    async fn set_unmount_propagation(&self, mount_name: &str, device_path: &str) -> Result<()> {
        let flag_path = format!("{UNMOUNT_PROPAGATION_DIR}/{mount_name}");
        self.runner
            .run(
                &["ln", "-sfT", device_path, flag_path.as_str()],
                CommandOptions::default(),
            )
            .await?;
        Ok(())
    }

    async fn clear_unmount_propagation(&self, mount_name: &str) -> Result<()> {
        let flag_path = rel(&format!("{UNMOUNT_PROPAGATION_DIR}/{mount_name}"));
        match tokio::fs::remove_file(&flag_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn clear_unmount_propagation_for_device(&self, device_path: &str) -> Result<()> {
        let dir = rel(UNMOUNT_PROPAGATION_DIR);
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = match tokio::fs::read_link(entry.path()).await {
                Ok(target) => target,
                Err(_) => continue,
            };
            if target == PathBuf::from(device_path) {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }

    async fn write_drive_audit(&self, entries: &BTreeMap<String, i64>) -> Result<()> {
        let buf = serde_json::to_vec(entries)?;
        tokio::fs::write(rel(DRIVE_AUDIT_PATH), buf).await?;
        Ok(())
    }

    async fn announce_ready(&self) -> Result<()> {
        tokio::fs::File::create(rel(READY_FLAG_PATH)).await?;
        Ok(())
    }
}

/// Make a path relative to the working directory to account for the chroot.
fn rel(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

fn swift_id_path_in(mount_path: &str) -> String {
    rel(&format!("{mount_path}/swift-id"))
}
