//! Per-run results: failure taxonomy, step records and the report entry a
//! device run produces.

#![allow(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::errors::DvhError;
use crate::fleet::device::DeviceDescriptor;
use crate::runner::command::CommandResult;

/// Why a device run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Pre-hook exited nonzero; primary and resync were not attempted.
    HookFailure,
    /// The deployment under test failed its own assertions.
    PrimaryDeployFailure,
    /// The corrective resync failed: the update-tracking state is suspect.
    ResyncFailure,
    TimeoutExceeded,
    ReportMissing,
    UnreachableDevice,
    Interrupted,
    /// Harness-internal failure (worker panic, unwritable report).
    Runtime,
}

impl FailureKind {
    pub const ALL: [Self; 8] = [
        Self::HookFailure,
        Self::PrimaryDeployFailure,
        Self::ResyncFailure,
        Self::TimeoutExceeded,
        Self::ReportMissing,
        Self::UnreachableDevice,
        Self::Interrupted,
        Self::Runtime,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HookFailure => "hook_failure",
            Self::PrimaryDeployFailure => "primary_deploy_failure",
            Self::ResyncFailure => "resync_failure",
            Self::TimeoutExceeded => "timeout_exceeded",
            Self::ReportMissing => "report_missing",
            Self::UnreachableDevice => "unreachable_device",
            Self::Interrupted => "interrupted",
            Self::Runtime => "runtime",
        }
    }

    /// Parse the snake_case form written into reports.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }

    /// Kind for a command that could not produce a result in `phase`.
    ///
    /// Timeouts, interrupts and unreachable devices keep their own class; every
    /// other error takes the phase's failure class.
    #[must_use]
    pub fn for_error(err: &DvhError, phase: Phase) -> Self {
        match err {
            DvhError::TimeoutExceeded { .. } => Self::TimeoutExceeded,
            DvhError::Interrupted { .. } => Self::Interrupted,
            DvhError::UnreachableDevice { .. } => Self::UnreachableDevice,
            _ => phase.failure_kind(),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step of a device run a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PreHook,
    Primary,
    Scenario,
    Resync,
    Report,
}

impl Phase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreHook => "pre_hook",
            Self::Primary => "primary",
            Self::Scenario => "scenario",
            Self::Resync => "resync",
            Self::Report => "report",
        }
    }

    /// Failure class of a command that ran and returned the wrong answer.
    #[must_use]
    pub const fn failure_kind(self) -> FailureKind {
        match self {
            Self::PreHook => FailureKind::HookFailure,
            Self::Primary | Self::Scenario => FailureKind::PrimaryDeployFailure,
            Self::Resync => FailureKind::ResyncFailure,
            Self::Report => FailureKind::ReportMissing,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded failure with the literal unmet expectation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub phase: Phase,
    pub expectation: String,
}

impl RunFailure {
    pub fn new(kind: FailureKind, phase: Phase, expectation: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            expectation: expectation.into(),
        }
    }

    /// Failure for a command that errored instead of returning a result.
    #[must_use]
    pub fn from_error(err: &DvhError, phase: Phase) -> Self {
        Self::new(FailureKind::for_error(err, phase), phase, err.to_string())
    }

    /// Failure for a command whose output could not be fully collected.
    #[must_use]
    pub fn truncated_output(phase: Phase) -> Self {
        Self::new(
            FailureKind::Runtime,
            phase,
            "output pipes held open by a detached process; captured output is incomplete",
        )
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.phase, self.kind, self.expectation)
    }
}

/// One executed (or skipped) step of a device run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub phase: Phase,
    /// TAP description, e.g. `primary` or `resync to nightly`.
    pub name: String,
    /// Expanded command line; `None` when the step never ran.
    pub command: Option<String>,
    pub result: Option<CommandResult>,
    pub failures: Vec<RunFailure>,
}

impl StepRecord {
    pub fn new(phase: Phase, name: impl Into<String>) -> Self {
        Self {
            phase,
            name: name.into(),
            command: None,
            result: None,
            failures: Vec::new(),
        }
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
        })
    }
}

/// Result of one device run, as aggregated into the fleet report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEntry {
    pub device: DeviceDescriptor,
    pub outcome: Outcome,
    /// Human-readable unmet expectations, one per failure.
    pub failure_lines: Vec<String>,
    pub failures: Vec<RunFailure>,
}

impl ReportEntry {
    /// Derive the entry from a run's recorded failures.
    #[must_use]
    pub fn from_failures(device: DeviceDescriptor, failures: Vec<RunFailure>) -> Self {
        let outcome = if failures.is_empty() {
            Outcome::Pass
        } else {
            Outcome::Fail
        };
        Self {
            device,
            outcome,
            failure_lines: failures.iter().map(ToString::to_string).collect(),
            failures,
        }
    }

    /// Distinct failure kinds, in first-seen order.
    #[must_use]
    pub fn kinds(&self) -> Vec<FailureKind> {
        let mut kinds = Vec::new();
        for failure in &self.failures {
            if !kinds.contains(&failure.kind) {
                kinds.push(failure.kind);
            }
        }
        kinds
    }
}
