//! lsblk Output Parsing
//!
//! Parses `lsblk -J` to recover information about devices that cannot be
//! read directly anymore (e.g. a failed disk whose LUKS mapping is still
//! open from before the IO error).

use serde::Deserialize;

use crate::error::Result;

/// The parsed output of `lsblk -J`.
#[derive(Debug, Clone, Deserialize)]
pub struct LsblkOutput {
    #[serde(rename = "blockdevices")]
    pub block_devices: Vec<LsblkDevice>,
}

/// One device node in the lsblk tree.
#[derive(Debug, Clone, Deserialize)]
pub struct LsblkDevice {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub children: Vec<LsblkDevice>,
}

impl LsblkOutput {
    /// Parse output from `lsblk -J`.
    pub fn parse(buf: &str) -> Result<LsblkOutput> {
        Ok(serde_json::from_str(buf)?)
    }

    /// The device path backing the given LUKS mapping, or None if it cannot
    /// be determined from this output.
    pub fn find_backing_device_for_luks(&self, mapping_name: &str) -> Option<String> {
        self.block_devices
            .iter()
            .find_map(|device| device.find_backing_device_for_luks(mapping_name))
    }

    /// The serial number of the device with the given path, inferred from a
    /// LUKS mapping directly below it (whose mapping name is the serial
    /// number by the autopilot's own naming convention). Best-effort: if the
    /// drive is not encrypted or its container is not open, returns None.
    pub fn find_serial_number_for_device(&self, device_path: &str) -> Option<String> {
        let device = find_device_by_path(&self.block_devices, device_path)?;
        match device.children.as_slice() {
            [child] if child.device_type == "crypt" => Some(child.name.clone()),
            _ => None,
        }
    }
}

impl LsblkDevice {
    fn find_backing_device_for_luks(&self, mapping_name: &str) -> Option<String> {
        if self
            .children
            .iter()
            .any(|child| child.device_type == "crypt" && child.name == mapping_name)
        {
            return self.device_path();
        }
        self.children
            .iter()
            .find_map(|child| child.find_backing_device_for_luks(mapping_name))
    }

    /// The /dev path of this node. Unknown device types yield None (rather
    /// than guessing a path that may not exist).
    fn device_path(&self) -> Option<String> {
        match self.device_type.as_str() {
            "crypt" | "mpath" => Some(format!("/dev/mapper/{}", self.name)),
            "disk" | "part" | "rom" | "loop" => Some(format!("/dev/{}", self.name)),
            _ => None,
        }
    }
}

fn find_device_by_path<'a>(devices: &'a [LsblkDevice], device_path: &str) -> Option<&'a LsblkDevice> {
    for device in devices {
        if device.device_path().as_deref() == Some(device_path) {
            return Some(device);
        }
        if let Some(child) = find_device_by_path(&device.children, device_path) {
            return Some(child);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN_OUTPUT: &str = r#"{
        "blockdevices": [
            {"name": "sda", "type": "disk", "children": [
                {"name": "sda1", "type": "part"},
                {"name": "sda3", "type": "part", "children": [
                    {"name": "usr", "type": "crypt"}
                ]}
            ]},
            {"name": "sdc", "type": "disk", "children": [
                {"name": "EJIOQU5P", "type": "crypt"}
            ]},
            {"name": "sdg", "type": "disk", "children": [
                {"name": "XOHSOHW9", "type": "crypt"}
            ]}
        ]
    }"#;

    const MPATH_OUTPUT: &str = r#"{
        "blockdevices": [
            {"name": "sdb", "type": "disk", "children": [
                {"name": "mpatha", "type": "mpath", "children": [
                    {"name": "BAINGOO2", "type": "crypt"}
                ]}
            ]}
        ]
    }"#;

    #[test]
    fn test_find_backing_device_for_luks() {
        let output = LsblkOutput::parse(PLAIN_OUTPUT).unwrap();
        assert_eq!(
            output.find_backing_device_for_luks("EJIOQU5P").as_deref(),
            Some("/dev/sdc")
        );
        assert_eq!(
            output.find_backing_device_for_luks("usr").as_deref(),
            Some("/dev/sda3")
        );
        assert_eq!(output.find_backing_device_for_luks("DOESNOTEXIST"), None);

        let output = LsblkOutput::parse(MPATH_OUTPUT).unwrap();
        assert_eq!(
            output.find_backing_device_for_luks("BAINGOO2").as_deref(),
            Some("/dev/mapper/mpatha")
        );
    }

    #[test]
    fn test_find_serial_number_for_device() {
        let output = LsblkOutput::parse(PLAIN_OUTPUT).unwrap();
        assert_eq!(
            output.find_serial_number_for_device("/dev/sdc").as_deref(),
            Some("EJIOQU5P")
        );
        // sda has two children, neither directly crypt
        assert_eq!(output.find_serial_number_for_device("/dev/sda"), None);
        // partition with a single crypt child
        assert_eq!(
            output.find_serial_number_for_device("/dev/sda3").as_deref(),
            Some("usr")
        );
        assert_eq!(output.find_serial_number_for_device("/dev/null"), None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(LsblkOutput::parse("not json").is_err());
    }
}
