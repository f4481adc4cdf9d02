//! LUKS Container Device
//!
//! A device holding a LUKS container. The decrypted mapping is itself a
//! device (in practice always an XFS filesystem), so this variant carries
//! the inner device once the container is open.

use tracing::info;

use crate::device::Device;
use crate::drive::DriveContext;
use crate::error::{Error, Result};
use crate::os::{DeviceType, MountScope, OsFacade};

/// A device containing a LUKS container.
#[derive(Debug)]
pub struct LuksDevice {
    path: String,
    formatted: bool,
    mapped: Option<Box<Device>>,
    mapping_name: Option<String>,
}

impl LuksDevice {
    pub fn new(device_path: &str, formatted: bool) -> LuksDevice {
        LuksDevice {
            path: device_path.to_string(),
            formatted,
            mapped: None,
            mapping_name: None,
        }
    }

    pub fn device_path(&self) -> &str {
        &self.path
    }

    pub fn mounted_path(&self) -> Option<&str> {
        self.mapped.as_ref().and_then(|mapped| mapped.mounted_path())
    }

    pub async fn setup(&mut self, ctx: &DriveContext<'_>, os: &dyn OsFacade) -> Result<()> {
        // sanity check (and recognize a pre-existing mapping before
        // attempting our own)
        self.validate(ctx, os).await?;

        if ctx.keys.is_empty() {
            return Err(Error::NoKeysConfigured {
                device: self.path.clone(),
            });
        }

        // format on first use, with the preferred key
        if !self.formatted {
            // double-check that the disk is empty
            if os.classify_device(&self.path).await != DeviceType::Unknown {
                return Err(Error::DeviceNotEmpty {
                    device: self.path.clone(),
                });
            }
            os.create_luks(&self.path, &ctx.keys[0]).await?;
            self.formatted = true;
        }

        // decrypt if necessary
        if self.mapped.is_none() {
            let mapping_name = ctx.drive_id.as_str();
            let mapped_device_path = os.open_luks(&self.path, mapping_name, ctx.keys).await?;
            info!(
                "LUKS container at {} opened as {mapped_device_path}",
                self.path
            );
            let inner = Device::new_for(&mapped_device_path, os, false)
                .await
                .ok_or_else(|| Error::DeviceUnreadable {
                    device: mapped_device_path.clone(),
                })?;
            self.mapped = Some(Box::new(inner));
            self.mapping_name = Some(mapping_name.to_string());
        }

        // descend into the decrypted device
        match self.mapped.as_mut() {
            Some(mapped) => Box::pin(mapped.setup(ctx, os)).await,
            None => Err(Error::DeviceUnreadable {
                device: self.path.clone(),
            }),
        }
    }

    pub async fn teardown(&mut self, ctx: &DriveContext<'_>, os: &dyn OsFacade) -> Result<()> {
        // contents of the mapped device come down first
        if let Some(mapped) = self.mapped.as_mut() {
            Box::pin(mapped.teardown(ctx, os)).await?;
            self.mapped = None;
        }

        // unmap the container if necessary
        if let Some(mapping_name) = self.mapping_name.take() {
            match os.close_luks(&mapping_name).await {
                Ok(()) => info!("LUKS container /dev/mapper/{mapping_name} closed"),
                Err(err) => {
                    self.mapping_name = Some(mapping_name);
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    pub async fn validate(&mut self, ctx: &DriveContext<'_>, os: &dyn OsFacade) -> Result<()> {
        let observed_mapping = os.luks_mapping_of(&self.path);

        match (observed_mapping, &self.mapped) {
            (None, Some(mapped)) => {
                return Err(Error::MappingVanished {
                    device: self.path.clone(),
                    expected: mapped.device_path().to_string(),
                });
            }
            (Some(mapped_device_path), None) => {
                // an existing mapping is discovered for the first time
                info!(
                    "discovered {} to be mapped to {mapped_device_path} already",
                    self.path
                );
                let inner = Device::new_for(&mapped_device_path, os, false)
                    .await
                    .ok_or_else(|| Error::DeviceUnreadable {
                        device: mapped_device_path.clone(),
                    })?;
                self.mapped = Some(Box::new(inner));
                self.mapping_name = mapped_device_path
                    .strip_prefix("/dev/mapper/")
                    .map(|name| name.to_string());
                self.formatted = true;
            }
            (Some(mapped_device_path), Some(mapped))
                if mapped_device_path != mapped.device_path() =>
            {
                // our internal state tells a different story!
                return Err(Error::MappingMismatch {
                    device: self.path.clone(),
                    expected: mapped.device_path().to_string(),
                    actual: mapped_device_path,
                });
            }
            _ => {}
        }

        // a device containing a LUKS container must not be mounted itself
        for scope in MountScope::ALL {
            if !os.mounts_of(&self.path, scope).is_empty() {
                return Err(Error::MountedWhileEncrypted {
                    device: self.path.clone(),
                    scope: scope.to_string(),
                });
            }
        }

        // the mapping looks good, drill down into the mapped device
        match self.mapped.as_mut() {
            Some(mapped) => Box::pin(mapped.validate(ctx, os)).await,
            None => Ok(()),
        }
    }
}
