//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::assertion::scenario::ScenarioCase;
use crate::core::errors::{DvhError, Result};
use crate::fleet::device::{Channel, DeviceEntry};
use crate::runner::template::{self, REMOTE_PLACEHOLDERS};

/// Full harness configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct HarnessConfig {
    pub run: RunConfig,
    pub reachability: ReachabilityConfig,
    pub channels: ChannelsConfig,
    pub commands: CommandsConfig,
    pub paths: PathsConfig,
    pub devices: Vec<DeviceEntry>,
    pub scenarios: Vec<ScenarioCase>,
}

/// Concurrency, time bounds and output location of a fleet run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Maximum number of devices driven at once.
    pub jobs: usize,
    /// Bound applied to every single command unless a scenario overrides it.
    pub command_timeout_secs: u64,
    /// Bound applied to one device's whole run (pre-hook through resync).
    pub run_timeout_secs: u64,
    pub reports_dir: PathBuf,
    pub shell: String,
}

/// Knobs for waiting on a device after a reboot-inducing deploy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReachabilityConfig {
    pub poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// Delay before the first probe so a rebooting device has time to go down.
    pub settle_delay_ms: u64,
}

/// Artifact deployed for each release channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ChannelsConfig {
    pub release: ChannelArtifact,
    pub nightly: ChannelArtifact,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ChannelArtifact {
    /// Image path or OSTree reference handed to the deployment tool.
    pub artifact: String,
}

impl ChannelsConfig {
    #[must_use]
    pub fn artifact_for(&self, channel: Channel) -> &str {
        match channel {
            Channel::Release => &self.release.artifact,
            Channel::Nightly => &self.nightly.artifact,
        }
    }
}

/// Command templates for each step of a device run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct CommandsConfig {
    pub pre_hook: Option<String>,
    pub primary: String,
    pub resync: String,
}

/// Filesystem paths used by dvh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub activity_log: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            jobs: std::thread::available_parallelism()
                .map_or(2, |n| n.get().saturating_div(2).max(1)),
            command_timeout_secs: 15 * 60,
            run_timeout_secs: 60 * 60,
            reports_dir: PathBuf::from("reports"),
            shell: "/bin/sh".to_string(),
        }
    }
}

impl RunConfig {
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    #[must_use]
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            connect_timeout_ms: 2_000,
            settle_delay_ms: 0,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[DVH-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        Self {
            config_file: home_dir.join(".config").join("dvh").join("harness.toml"),
            activity_log: home_dir
                .join(".local")
                .join("share")
                .join("dvh")
                .join("activity.jsonl"),
        }
    }
}

impl HarnessConfig {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| DvhError::Io {
                path: path_buf.clone(),
                source,
            })?;
            Self::from_toml_str(&raw)?
        } else if is_explicit_path {
            return Err(DvhError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse without env overrides or validation.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Deterministic hash of the effective config for the activity log.
    ///
    /// FNV-1a over the canonical JSON, stable across processes and toolchains.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("DVH_RUN_JOBS") {
            self.run.jobs = parse_env("DVH_RUN_JOBS", &raw)?;
        }
        if let Some(raw) = lookup("DVH_RUN_COMMAND_TIMEOUT_SECS") {
            self.run.command_timeout_secs = parse_env("DVH_RUN_COMMAND_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = lookup("DVH_RUN_TIMEOUT_SECS") {
            self.run.run_timeout_secs = parse_env("DVH_RUN_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = lookup("DVH_RUN_REPORTS_DIR") {
            self.run.reports_dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("DVH_RUN_SHELL") {
            self.run.shell = raw;
        }
        if let Some(raw) = lookup("DVH_REACHABILITY_POLL_INTERVAL_MS") {
            self.reachability.poll_interval_ms =
                parse_env("DVH_REACHABILITY_POLL_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = lookup("DVH_REACHABILITY_CONNECT_TIMEOUT_MS") {
            self.reachability.connect_timeout_ms =
                parse_env("DVH_REACHABILITY_CONNECT_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("DVH_ACTIVITY_LOG") {
            self.paths.activity_log = PathBuf::from(raw);
        }
        Ok(())
    }

    /// Check every invariant a fleet run relies on.
    pub fn validate(&self) -> Result<()> {
        if self.run.jobs == 0 {
            return Err(invalid("run.jobs must be >= 1"));
        }
        if self.run.command_timeout_secs == 0 || self.run.run_timeout_secs == 0 {
            return Err(invalid(
                "run.command_timeout_secs and run.run_timeout_secs must be > 0",
            ));
        }
        if self.run.shell.trim().is_empty() {
            return Err(invalid("run.shell must not be empty"));
        }
        if self.reachability.poll_interval_ms == 0 || self.reachability.connect_timeout_ms == 0 {
            return Err(invalid(
                "reachability.poll_interval_ms and connect_timeout_ms must be > 0",
            ));
        }

        for (name, channel) in [("release", Channel::Release), ("nightly", Channel::Nightly)] {
            if self.channels.artifact_for(channel).trim().is_empty() {
                return Err(invalid(&format!("channels.{name}.artifact must be set")));
            }
        }

        if self.commands.primary.trim().is_empty() {
            return Err(invalid("commands.primary must be set"));
        }
        if self.commands.resync.trim().is_empty() {
            return Err(invalid("commands.resync must be set"));
        }

        let templates = self.templates();
        let mut uses_remote = false;
        for (origin, text) in &templates {
            let names = template::placeholders(text).map_err(|err| {
                invalid(&format!("{origin}: {err}"))
            })?;
            uses_remote |= names.iter().any(|n| REMOTE_PLACEHOLDERS.contains(n));
        }

        let mut machines_seen = HashSet::new();
        let mut slugs_seen = HashMap::new();
        for entry in &self.devices {
            let d = &entry.descriptor;
            if d.machine.trim().is_empty() || d.device_class.trim().is_empty() {
                return Err(invalid(
                    "devices: machine and device_class must not be empty",
                ));
            }
            if uses_remote && entry.remote.is_none() {
                return Err(invalid(&format!(
                    "device {} has no [remote] target but the command templates use remote placeholders",
                    d.machine
                )));
            }
            if entry
                .remote
                .as_ref()
                .is_some_and(|remote| remote.host.trim().is_empty())
            {
                return Err(invalid(&format!("device {}: remote.host must be set", d.machine)));
            }
            // Same machine listed twice is allowed (runs are serialized by the
            // device lease), but the same machine + channel pair is a duplicate.
            if !machines_seen.insert((d.machine.clone(), d.channel)) {
                return Err(invalid(&format!(
                    "device {} is listed twice for channel {}",
                    d.machine, d.channel
                )));
            }
            // Report files are keyed by slug; two devices sharing one would
            // overwrite each other's report.
            if let Some(other) = slugs_seen.insert(d.slug(), d.machine.clone()) {
                return Err(invalid(&format!(
                    "devices {other} and {} map to the same report name {}",
                    d.machine,
                    d.slug()
                )));
            }
        }

        let mut scenario_names = HashSet::new();
        for case in &self.scenarios {
            if case.name.trim().is_empty() {
                return Err(invalid("scenarios: every scenario needs a name"));
            }
            if !scenario_names.insert(case.name.as_str()) {
                return Err(invalid(&format!("scenario {:?} is defined twice", case.name)));
            }
            if case.timeout_secs == Some(0) {
                return Err(invalid(&format!(
                    "scenario {:?}: timeout_secs must be > 0",
                    case.name
                )));
            }
        }

        Ok(())
    }

    /// Every command template in the config, labelled by where it came from.
    fn templates(&self) -> Vec<(String, &str)> {
        let mut out = Vec::new();
        if let Some(hook) = &self.commands.pre_hook {
            out.push(("commands.pre_hook".to_string(), hook.as_str()));
        }
        out.push(("commands.primary".to_string(), self.commands.primary.as_str()));
        out.push(("commands.resync".to_string(), self.commands.resync.as_str()));
        for case in &self.scenarios {
            for text in case.templates() {
                out.push((format!("scenario {:?}", case.name), text));
            }
        }
        out
    }
}

fn invalid(details: &str) -> DvhError {
    DvhError::InvalidConfig {
        details: details.to_string(),
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|error| DvhError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}
