//! Device matrix: descriptors, release channels, inclusion predicates, run scope.
//!
//! The matrix is pure data loaded from configuration. Whether a device runs on
//! every invocation or only on full-fleet runs is an explicit [`Inclusion`] on
//! its entry, and the caller chooses a [`RunScope`] instead of relying on
//! ambient environment gating.

#![allow(missing_docs)]

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::errors::{DvhError, Result};

/// One of the two parallel release tracks an artifact may belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Release,
    Nightly,
}

impl Channel {
    /// The opposite release track. `complement(complement(c)) == c`.
    #[must_use]
    pub const fn complement(self) -> Self {
        match self {
            Self::Release => Self::Nightly,
            Self::Nightly => Self::Release,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Nightly => "nightly",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = DvhError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim() {
            "release" => Ok(Self::Release),
            "nightly" => Ok(Self::Nightly),
            _ => Err(DvhError::InvalidChannel {
                value: raw.to_string(),
            }),
        }
    }
}

/// Channel toggle over raw input: `release` <-> `nightly`, anything else is an error.
pub fn complement_of(raw: &str) -> Result<Channel> {
    raw.parse::<Channel>().map(Channel::complement)
}

/// Static identity of one test target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device_class: String,
    pub machine: String,
    /// Trust-policy document handed to the deployment tool untouched.
    pub delegation_config: PathBuf,
    pub channel: Channel,
}

impl DeviceDescriptor {
    /// Filesystem-safe identifier used to name this device's report artifacts.
    ///
    /// Includes the channel: one machine may be validated on both channels.
    #[must_use]
    pub fn slug(&self) -> String {
        let raw = format!("{}-{}-{}", self.device_class, self.machine, self.channel);
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ({})",
            self.device_class, self.machine, self.channel
        )
    }
}

/// When a device participates in a fleet run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inclusion {
    /// Part of the default subset; runs on every invocation.
    #[default]
    Always,
    /// Runs only when the whole fleet is requested.
    FullFleet,
}

impl Inclusion {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::FullFleet => "full_fleet",
        }
    }
}

/// Which subset of the matrix a fleet run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunScope {
    #[default]
    DefaultSubset,
    FullFleet,
}

impl RunScope {
    #[must_use]
    pub const fn includes(self, inclusion: Inclusion) -> bool {
        match self {
            Self::FullFleet => true,
            Self::DefaultSubset => matches!(inclusion, Inclusion::Always),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DefaultSubset => "default_subset",
            Self::FullFleet => "full_fleet",
        }
    }
}

/// Network address and credential reference of a remotely reachable device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Name of the environment variable holding the SSH password, if any.
    pub password_env: Option<String>,
}

impl Default for RemoteTarget {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: "torizon".to_string(),
            password_env: None,
        }
    }
}

/// One row of the device matrix as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    #[serde(flatten)]
    pub descriptor: DeviceDescriptor,
    #[serde(default)]
    pub include: Inclusion,
    /// Absent for host-attached targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteTarget>,
}

/// Select the active devices for `scope`, keeping matrix order.
///
/// A non-empty `only` further narrows the selection to those machine
/// identities; naming a machine the scope excludes (or that does not exist)
/// is an error rather than a silent skip.
pub fn select<'a>(
    devices: &'a [DeviceEntry],
    scope: RunScope,
    only: &[String],
) -> Result<Vec<&'a DeviceEntry>> {
    let in_scope: Vec<&DeviceEntry> = devices
        .iter()
        .filter(|entry| scope.includes(entry.include))
        .collect();

    if only.is_empty() {
        return Ok(in_scope);
    }

    for machine in only {
        if !in_scope.iter().any(|e| &e.descriptor.machine == machine) {
            let known = devices.iter().any(|e| &e.descriptor.machine == machine);
            let details = if known {
                format!("device {machine:?} is not part of the {} scope", scope.as_str())
            } else {
                format!("device {machine:?} is not in the device matrix")
            };
            return Err(DvhError::InvalidConfig { details });
        }
    }

    Ok(in_scope
        .into_iter()
        .filter(|e| only.contains(&e.descriptor.machine))
        .collect())
}
