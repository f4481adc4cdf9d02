//! Error types for the drive autopilot
//!
//! Provides structured error types for all autopilot components: the OS
//! facade, the device tree, swift-id assignment, and the collectors.

use thiserror::Error;

/// Unified error type for the autopilot
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Fatal Errors (the caller is expected to exit the process)
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No drives found matching the configured patterns: {patterns}")]
    NoDrivesMatched { patterns: String },

    #[error("Mount propagation detection failed: {0}")]
    MountPropagationDetection(String),

    // =========================================================================
    // Drive-Scoped Errors (the drive is marked broken, the daemon continues)
    // =========================================================================
    #[error("Command failed: {command}: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Device {device} is unreadable")]
    DeviceUnreadable { device: String },

    #[error("Cannot set up LUKS container on {device}: no keys configured")]
    NoKeysConfigured { device: String },

    #[error("Refusing to format {device}: it is not empty")]
    DeviceNotEmpty { device: String },

    #[error("LUKS container in {device} should be open at {expected}, but is not")]
    MappingVanished { device: String, expected: String },

    #[error(
        "LUKS container in {device} should be open at {expected}, but is actually open at {actual}"
    )]
    MappingMismatch {
        device: String,
        expected: String,
        actual: String,
    },

    #[error(
        "{device} contains an open LUKS container, but is also mounted directly in {scope} mount namespace"
    )]
    MountedWhileEncrypted { device: String, scope: String },

    #[error("Expected {device} to be mounted at {expected}, but is not mounted anymore")]
    MountVanished { device: String, expected: String },

    #[error("Expected {device} to be mounted at {expected}, but is actually mounted at {actual}")]
    MountMismatch {
        device: String,
        expected: String,
        actual: String,
    },

    #[error("Mount of {device} at {mount_path} is read-only (could be due to a disk error)")]
    ReadOnlyMount { device: String, mount_path: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Fatal errors terminate the process; everything else is recovered at
    /// the drive scope.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_)
                | Error::NoDrivesMatched { .. }
                | Error::MountPropagationDetection(_)
        )
    }
}

/// Result type alias for the autopilot
pub type Result<T> = std::result::Result<T, Error>;

/// Log the message at error level and exit with a non-zero status.
///
/// This is the single escape hatch for the fatal conditions of the error
/// taxonomy (unusable configuration, broken snapshot commands). Everything
/// else must be propagated as a [`Result`].
pub fn fatal(message: &str) -> ! {
    tracing::error!("FATAL: {message}");
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let err = Error::NoDrivesMatched {
            patterns: "/dev/sd[b-z]".into(),
        };
        assert!(err.is_fatal());

        let err = Error::ReadOnlyMount {
            device: "/dev/sdb".into(),
            mount_path: "/srv/node/swift-01".into(),
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = Error::MountMismatch {
            device: "/dev/sdb".into(),
            expected: "/run/swift-storage/abc".into(),
            actual: "/srv/node/swift-01".into(),
        };
        assert_eq!(
            err.to_string(),
            "Expected /dev/sdb to be mounted at /run/swift-storage/abc, but is actually mounted at /srv/node/swift-01"
        );
    }
}
