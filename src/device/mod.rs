//! Device Tree
//!
//! Models the contents of one drive as a small tree of typed devices: the
//! base device may hold a LUKS container, which in turn holds a filesystem.
//! Each variant exposes the same idempotent setup/teardown/validate
//! contract, so the converger treats every drive uniformly regardless of
//! encryption.

pub mod luks;
pub mod xfs;

pub use luks::LuksDevice;
pub use xfs::XfsDevice;

use crate::drive::DriveContext;
use crate::error::Result;
use crate::os::{DeviceType, OsFacade};

/// The contents of a device file.
#[derive(Debug)]
pub enum Device {
    Luks(LuksDevice),
    Xfs(XfsDevice),
}

impl Device {
    /// Classify the device and build the matching variant. Returns None for
    /// unreadable devices. An empty device becomes a not-yet-formatted LUKS
    /// container when encryption is configured, or a not-yet-formatted
    /// filesystem otherwise.
    pub async fn new_for(
        device_path: &str,
        os: &dyn OsFacade,
        prefer_luks: bool,
    ) -> Option<Device> {
        match os.classify_device(device_path).await {
            DeviceType::Unreadable => None,
            DeviceType::Unknown if prefer_luks => {
                Some(Device::Luks(LuksDevice::new(device_path, false)))
            }
            DeviceType::Unknown => Some(Device::Xfs(XfsDevice::new(device_path, false))),
            DeviceType::Luks => Some(Device::Luks(LuksDevice::new(device_path, true))),
            DeviceType::Filesystem => Some(Device::Xfs(XfsDevice::new(device_path, true))),
        }
    }

    /// Path to the device file.
    pub fn device_path(&self) -> &str {
        match self {
            Device::Luks(device) => device.device_path(),
            Device::Xfs(device) => device.device_path(),
        }
    }

    /// Where this device (or its contents) are mounted right now, as far as
    /// the in-memory state knows.
    pub fn mounted_path(&self) -> Option<&str> {
        match self {
            Device::Luks(device) => device.mounted_path(),
            Device::Xfs(device) => device.mounted_path(),
        }
    }

    /// Idempotently prepare the drive for consumption by Swift: create
    /// missing structure, open what is closed, mount at the drive's current
    /// mount path.
    pub async fn setup(&mut self, ctx: &DriveContext<'_>, os: &dyn OsFacade) -> Result<()> {
        match self {
            Device::Luks(device) => device.setup(ctx, os).await,
            Device::Xfs(device) => device.setup(ctx, os).await,
        }
    }

    /// Idempotently shut down all mounts and mappings for this drive.
    pub async fn teardown(&mut self, ctx: &DriveContext<'_>, os: &dyn OsFacade) -> Result<()> {
        match self {
            Device::Luks(device) => device.teardown(ctx, os).await,
            Device::Xfs(device) => device.teardown(ctx, os).await,
        }
    }

    /// Reconcile in-memory belief against fresh OS observations. An error
    /// means the drive has become broken.
    pub async fn validate(&mut self, ctx: &DriveContext<'_>, os: &dyn OsFacade) -> Result<()> {
        match self {
            Device::Luks(device) => device.validate(ctx, os).await,
            Device::Xfs(device) => device.validate(ctx, os).await,
        }
    }
}
