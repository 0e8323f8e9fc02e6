//! Scenario runner: one named command at a time against one device, bounded
//! by both the per-command timeout and what is left of the run's budget.

#![allow(missing_docs)]

use std::time::{Duration, Instant};

use crate::core::errors::{DvhError, Result};
use crate::runner::cancel::CancelToken;
use crate::runner::channel::DeviceChannel;
use crate::runner::command::{CommandResult, millis};

/// Time bounds of one device run.
#[derive(Debug, Clone, Copy)]
pub struct RunBudget {
    deadline: Instant,
    command_timeout: Duration,
}

impl RunBudget {
    #[must_use]
    pub fn new(command_timeout: Duration, run_timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + run_timeout,
            command_timeout,
        }
    }

    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Effective bound for the next command: the tighter of its own timeout
    /// and the remaining run budget.
    #[must_use]
    pub fn bound(&self, override_timeout: Option<Duration>) -> Duration {
        override_timeout
            .unwrap_or(self.command_timeout)
            .min(self.remaining())
    }
}

/// Drives the commands of one device run.
///
/// Deployment commands run through `host` because the deployment tool talks
/// to the device itself; `device` carries device-side checks and reachability.
pub struct ScenarioRunner<'a> {
    host: &'a dyn DeviceChannel,
    device: &'a dyn DeviceChannel,
    budget: RunBudget,
    cancel: &'a CancelToken,
}

impl<'a> ScenarioRunner<'a> {
    pub fn new(
        host: &'a dyn DeviceChannel,
        device: &'a dyn DeviceChannel,
        budget: RunBudget,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            host,
            device,
            budget,
            cancel,
        }
    }

    #[must_use]
    pub const fn budget(&self) -> &RunBudget {
        &self.budget
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run a command on the harness host.
    pub fn on_host(
        &self,
        label: &str,
        command_line: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult> {
        self.dispatch(self.host, label, command_line, timeout)
    }

    /// Run a command through the device's own channel.
    pub fn on_device(
        &self,
        label: &str,
        command_line: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult> {
        self.dispatch(self.device, label, command_line, timeout)
    }

    /// Wait for the device to accept connections, bounded by the run budget.
    pub fn wait_reachable(&self, within: Duration) -> Result<Duration> {
        let bound = within.min(self.budget.remaining());
        self.device.wait_reachable(bound, self.cancel)
    }

    fn dispatch(
        &self,
        channel: &dyn DeviceChannel,
        label: &str,
        command_line: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult> {
        if self.cancel.is_cancelled() {
            return Err(DvhError::Interrupted {
                command: command_line.to_string(),
            });
        }
        let bound = self.budget.bound(timeout);
        if bound.is_zero() {
            return Err(DvhError::TimeoutExceeded {
                command: command_line.to_string(),
                timeout_ms: millis(bound),
            });
        }
        channel.run(label, command_line, bound, self.cancel)
    }
}
