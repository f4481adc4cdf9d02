//! Configuration Loading
//!
//! Parses the YAML configuration file given as the single CLI argument,
//! resolves env-var key indirections, and expands templated swift-id pools
//! into the flat ordered pool that the assignment logic consumes.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

// =============================================================================
// Raw File Format
// =============================================================================

/// The configuration file as written by the operator.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    /// Optional chroot; when set, the process chdirs there and all paths are
    /// interpreted relative to it.
    #[serde(default)]
    chroot: Option<String>,

    /// Glob patterns for the device paths of the managed drives.
    drives: Vec<String>,

    /// Ownership applied to final mounts below /srv/node.
    #[serde(default)]
    chown: OwnerConfig,

    /// Candidate LUKS keys. An empty list disables encryption handling.
    #[serde(default)]
    keys: Vec<KeyRecord>,

    /// Flat ordered pool of swift-ids for auto-assignment.
    #[serde(default, rename = "swift-id-pool")]
    swift_id_pool: Vec<String>,

    /// Templated pools, expanded into the flat pool at load time.
    #[serde(default, rename = "swift-id-pools")]
    swift_id_pools: Vec<PoolTemplate>,

    /// host:port for the Prometheus /metrics endpoint.
    #[serde(default, rename = "metrics-listen-address")]
    metrics_listen_address: Option<String>,
}

/// A single entry in the `keys` list.
///
/// This is a struct (not a bare string) to later support the addition of a
/// key-derivation method field.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct KeyRecord {
    secret: String,
}

/// The `chown` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OwnerConfig {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

/// One entry of `swift-id-pools`: generates `prefix{i}postfix` for every i
/// in start..=end, with a spare slot inserted after every `spareInterval`
/// generated entries (0 disables spare insertion).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolTemplate {
    #[serde(rename = "type", default)]
    drive_type: Option<String>,
    #[serde(default)]
    prefix: String,
    #[serde(default)]
    postfix: String,
    start: u32,
    end: u32,
    #[serde(default, rename = "spareInterval")]
    spare_interval: u32,
}

// =============================================================================
// Loaded Configuration
// =============================================================================

/// The immutable configuration shared by all tasks.
#[derive(Debug, Clone)]
pub struct Config {
    pub chroot: Option<String>,
    pub drive_globs: Vec<String>,
    pub owner: OwnerConfig,
    /// Resolved LUKS key secrets, in declaration order. Keys\[0\] is used
    /// when creating a new container; all keys are tried when opening.
    pub keys: Vec<String>,
    /// The expanded flat pool. `spare` entries are disambiguated to
    /// `spare/0`, `spare/1`, … in declaration order.
    pub swift_id_pool: Vec<String>,
    pub metrics_listen_address: Option<String>,
}

impl Config {
    /// Read and validate the configuration file.
    pub fn load(path: &Path) -> Result<Config> {
        let buf = std::fs::read_to_string(path)?;
        Self::parse(&buf)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn parse(buf: &str) -> Result<Config> {
        let file: ConfigFile = serde_yaml::from_str(buf)?;

        if file.drives.is_empty() {
            return Err(Error::Configuration(
                "no drive globs configured (field `drives` is empty)".into(),
            ));
        }
        for pattern in &file.drives {
            if !pattern.starts_with('/') {
                return Err(Error::Configuration(format!(
                    "drive glob {pattern:?} is not an absolute path"
                )));
            }
        }

        let mut keys = Vec::with_capacity(file.keys.len());
        for record in &file.keys {
            keys.push(resolve_secret(&record.secret)?);
        }

        let mut pool = file.swift_id_pool.clone();
        for template in &file.swift_id_pools {
            expand_pool_template(template, &mut pool)?;
        }
        let pool = disambiguate_spares(pool);

        Ok(Config {
            chroot: file.chroot.filter(|path| !path.is_empty() && path != "/"),
            drive_globs: file.drives,
            owner: file.chown,
            keys,
            swift_id_pool: pool,
            metrics_listen_address: file.metrics_listen_address,
        })
    }
}

/// A secret of the form `env:VAR_NAME` is read from the environment at load
/// time; anything else is taken literally.
fn resolve_secret(secret: &str) -> Result<String> {
    match secret.strip_prefix("env:") {
        Some(var_name) => std::env::var(var_name).map_err(|_| {
            Error::Configuration(format!(
                "key secret references undefined environment variable {var_name:?}"
            ))
        }),
        None => Ok(secret.to_string()),
    }
}

fn expand_pool_template(template: &PoolTemplate, pool: &mut Vec<String>) -> Result<()> {
    if template.end < template.start {
        return Err(Error::Configuration(format!(
            "swift-id-pools template{}: end ({}) is less than start ({})",
            template
                .drive_type
                .as_deref()
                .map(|t| format!(" for type {t:?}"))
                .unwrap_or_default(),
            template.end,
            template.start,
        )));
    }

    let mut since_spare = 0;
    for idx in template.start..=template.end {
        pool.push(format!("{}{}{}", template.prefix, idx, template.postfix));
        since_spare += 1;
        if template.spare_interval > 0 && since_spare == template.spare_interval {
            pool.push("spare".into());
            since_spare = 0;
        }
    }
    Ok(())
}

/// Replaces every `spare` occurrence with `spare/N`, numbered left to right.
/// This is the form in which spare slots are tracked during assignment.
fn disambiguate_spares(pool: Vec<String>) -> Vec<String> {
    let mut spare_idx = 0;
    pool.into_iter()
        .map(|entry| {
            if entry == "spare" {
                let slot = format!("spare/{spare_idx}");
                spare_idx += 1;
                slot
            } else {
                entry
            }
        })
        .collect()
}

/// Pool entries of the form `spare/N` are written to disk as plain `spare`.
pub fn pool_entry_to_swift_id(entry: &str) -> &str {
    if entry.starts_with("spare/") {
        "spare"
    } else {
        entry
    }
}
