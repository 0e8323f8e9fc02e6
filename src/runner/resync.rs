//! Divergence resync: after the primary phase, deploy an artifact from the
//! opposite release channel so the device's update-tracking metadata and its
//! filesystem are forced through the same deployment path into agreement.
//!
//! The resync is unconditional. Nothing on the device reports divergence, and
//! skipping the step would hide exactly the class of bug being hunted.

#![allow(missing_docs)]

use serde::Serialize;

use crate::core::config::ChannelsConfig;
use crate::core::errors::Result;
use crate::fleet::device::Channel;
use crate::runner::command::CommandResult;
use crate::runner::scenario::ScenarioRunner;
use crate::runner::template::{self, TemplateVars};

/// The corrective deployment for one device run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResyncPlan {
    /// Channel validated by the primary phase.
    pub from: Channel,
    /// Always `from.complement()`.
    pub to: Channel,
    pub artifact: String,
    pub command_line: String,
}

impl ResyncPlan {
    /// Expand the resync template against the complement of the primary channel.
    pub fn new(
        template_text: &str,
        primary: &TemplateVars<'_>,
        channels: &ChannelsConfig,
    ) -> Result<Self> {
        let to = primary.channel.complement();
        let artifact = channels.artifact_for(to);
        let vars = TemplateVars {
            channel: to,
            artifact,
            ..*primary
        };
        Ok(Self {
            from: primary.channel,
            to,
            artifact: artifact.to_string(),
            command_line: template::expand(template_text, &vars)?,
        })
    }

    /// TAP description of the step.
    #[must_use]
    pub fn describe(&self) -> String {
        format!("resync to {}", self.to)
    }

    /// Issue the corrective deployment.
    pub fn execute(&self, runner: &ScenarioRunner<'_>) -> Result<CommandResult> {
        runner.on_host("resync", &self.command_line, None)
    }
}
