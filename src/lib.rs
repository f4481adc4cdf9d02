//! Swift Drive Autopilot
//!
//! A supervisor daemon that manages a storage node's local block devices
//! for participation in a Swift object-storage cluster. It continuously
//! reconciles the observed state of the host's disks, encryption mappings,
//! filesystems, and mount points against a declarative target state, coping
//! with drive hot-plug, operator intervention, and disk failure.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐ ┌───────────────┐ ┌────────┐ ┌────────────┐
//! │ drive       │ │ reinstatement │ │ wakeup │ │ kernel log │   collectors
//! │ enumerator  │ │ watcher       │ │        │ │ watcher    │
//! └──────┬──────┘ └──────┬────────┘ └───┬────┘ └─────┬──────┘
//!        └───────────────┴──────┬───────┴────────────┘
//!                               ▼
//!                    bounded event channel
//!                               │
//!                        ┌──────┴──────┐
//!                        │  converger  │   single consumer, owns all drives
//!                        └──────┬──────┘
//!                ┌──────────────┼──────────────┐
//!                ▼              ▼              ▼
//!          device tree     assignment      OS facade
//!         (LUKS / XFS)    (swift-id)    (shell-outs, state)
//! ```
//!
//! # Modules
//!
//! - [`collectors`]: event producers (hot-plug, reinstatement, wakeup, klog)
//! - [`converger`]: the single reconciliation task
//! - [`device`]: per-drive device tree with setup/teardown/validate
//! - [`drive`]: drive identity, brokenness, assignment state
//! - [`assignment`]: swift-id discovery and pool auto-assignment
//! - [`os`]: facade over every OS interaction, with a Linux implementation
//! - [`config`]: YAML configuration
//! - [`metrics`]: Prometheus event counters
//! - [`error`]: error types and the fatal-exit primitive

pub mod assignment;
pub mod collectors;
pub mod config;
pub mod converger;
pub mod device;
pub mod drive;
pub mod error;
pub mod metrics;
pub mod os;
pub mod util;

// Re-export commonly used types
pub use assignment::{Assignment, AssignmentError};
pub use collectors::Event;
pub use config::Config;
pub use converger::Converger;
pub use device::Device;
pub use drive::{Drive, DriveId};
pub use error::{Error, Result};
pub use os::{Linux, OsFacade};

/// Version of the autopilot.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
