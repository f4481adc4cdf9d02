//! XFS Filesystem Device
//!
//! The leaf of the device tree: a device containing (or about to contain)
//! the XFS filesystem that Swift consumes.

use tracing::{debug, error, info};

use crate::drive::DriveContext;
use crate::error::{Error, Result};
use crate::os::{DeviceType, MountScope, OsFacade, FINAL_MOUNT_DIR};

/// A device containing an XFS filesystem.
#[derive(Debug)]
pub struct XfsDevice {
    path: String,
    formatted: bool,
    mount_path: Option<String>,
}

impl XfsDevice {
    pub fn new(device_path: &str, formatted: bool) -> XfsDevice {
        XfsDevice {
            path: device_path.to_string(),
            formatted,
            mount_path: None,
        }
    }

    pub fn device_path(&self) -> &str {
        &self.path
    }

    pub fn mounted_path(&self) -> Option<&str> {
        self.mount_path.as_deref()
    }

    pub async fn setup(&mut self, ctx: &DriveContext<'_>, os: &dyn OsFacade) -> Result<()> {
        // sanity check (and recognize a pre-existing mount before attempting
        // our own)
        self.validate(ctx, os).await?;

        // format on first use
        if !self.formatted {
            // double-check that the disk is empty
            if os.classify_device(&self.path).await != DeviceType::Unknown {
                return Err(Error::DeviceNotEmpty {
                    device: self.path.clone(),
                });
            }
            os.format_xfs(&self.path).await?;
            self.formatted = true;
            debug!("XFS filesystem created on {}", self.path);
        }

        let desired_mount_path = ctx.desired_mount_path(self.mount_path.as_deref());
        if self.mount_path.as_deref() == Some(desired_mount_path.as_str()) {
            // nothing to do
            return Ok(());
        }

        // when moving to the final mount in /srv/node, tear down the
        // temporary mount in /run first
        if let Some(previous) = self.mount_path.clone() {
            for scope in MountScope::ALL {
                os.unmount(&previous, scope).await?;
            }
            self.mount_path = None;
        }

        for scope in MountScope::ALL {
            os.mount(&self.path, &desired_mount_path, scope).await?;
        }
        self.mount_path = Some(desired_mount_path.clone());

        // the mount is live again, so downstream consumers no longer need
        // the unmount hint
        if let Some(mount_name) = final_mount_name(&desired_mount_path) {
            if let Err(err) = os.clear_unmount_propagation(mount_name).await {
                error!("{err}");
            }
        }

        Ok(())
    }

    pub async fn teardown(&mut self, ctx: &DriveContext<'_>, os: &dyn OsFacade) -> Result<()> {
        // remove the mount that we know about
        if let Some(mount_path) = self.mount_path.clone() {
            if let Some(mount_name) = final_mount_name(&mount_path) {
                if let Err(err) = os.set_unmount_propagation(mount_name, ctx.device_path).await {
                    error!("{err}");
                }
            }
            for scope in MountScope::ALL {
                os.unmount(&mount_path, scope).await?;
            }
            self.mount_path = None;
        }

        // remove any other mounts that the system knows about
        for scope in MountScope::ALL {
            for mount in os.mounts_of(&self.path, scope) {
                if let Some(mount_name) = final_mount_name(&mount.mount_path) {
                    if let Err(err) = os.set_unmount_propagation(mount_name, ctx.device_path).await
                    {
                        error!("{err}");
                    }
                }
                os.unmount(&mount.mount_path, scope).await?;
            }
        }

        Ok(())
    }

    pub async fn validate(&mut self, ctx: &DriveContext<'_>, os: &dyn OsFacade) -> Result<()> {
        let mounts = os.mounts_of(&self.path, MountScope::Host);

        if mounts.is_empty() {
            match self.mount_path.take() {
                None => return Ok(()),
                Some(expected) => {
                    return Err(Error::MountVanished {
                        device: self.path.clone(),
                        expected,
                    });
                }
            }
        }

        // when multiple mounts exist, adopt the one matching the desired
        // path as canonical
        if self.mount_path.is_none() {
            let desired = ctx.desired_mount_path(None);
            let adopted = mounts
                .iter()
                .find(|m| m.mount_path == desired)
                .unwrap_or(&mounts[0]);
            info!(
                "discovered {} to be mounted at {} already",
                self.path, adopted.mount_path
            );
            self.mount_path = Some(adopted.mount_path.clone());
        }

        for mount in &mounts {
            if mount.is_read_only() {
                return Err(Error::ReadOnlyMount {
                    device: self.path.clone(),
                    mount_path: mount.mount_path.clone(),
                });
            }

            if self.mount_path.as_deref() != Some(mount.mount_path.as_str()) {
                return Err(Error::MountMismatch {
                    device: self.path.clone(),
                    expected: self.mount_path.clone().unwrap_or_default(),
                    actual: mount.mount_path.clone(),
                });
            }
        }

        Ok(())
    }
}

/// The base name of a mount path below /srv/node, or None for any other
/// location.
fn final_mount_name(mount_path: &str) -> Option<&str> {
    mount_path
        .strip_prefix(FINAL_MOUNT_DIR)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|name| !name.is_empty() && !name.contains('/'))
}
