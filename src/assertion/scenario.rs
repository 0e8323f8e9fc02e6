//! Declarative scenario cases and their evaluation.
//!
//! A case passes only when the exit code matches exactly, every expected
//! substring appears in stdout or stderr, and every post-condition holds.
//! Every unmet expectation is recorded, so one report shows all of them.

#![allow(missing_docs)]

use std::fs;
use std::time::Duration;

use memchr::memmem;
use serde::{Deserialize, Serialize};

use crate::core::errors::DvhError;
use crate::fleet::outcome::{FailureKind, Phase, RunFailure};
use crate::runner::command::CommandResult;
use crate::runner::scenario::ScenarioRunner;
use crate::runner::template::{self, TemplateVars};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioCase {
    pub name: String,
    /// Command template, run on the harness host.
    pub command: String,
    #[serde(default)]
    pub expected_exit_code: i32,
    /// Substrings that must each appear in stdout or stderr.
    #[serde(default)]
    pub expected_output: Vec<String>,
    #[serde(default)]
    pub post_conditions: Vec<PostCondition>,
    /// Overrides `run.command_timeout_secs` for this case's command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Check performed after a scenario's command, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PostCondition {
    /// A file on the harness host (e.g. inside an unpacked image) contains `substring`.
    FileContains { path: String, substring: String },
    ExitCodeEquals {
        command: String,
        value: i32,
        #[serde(default)]
        on_device: bool,
    },
    /// The device accepts connections again within the bound.
    ReachableWithin { timeout_secs: u64 },
    /// `command` prints JSON whose RFC 6901 `pointer` equals `value`.
    JsonFieldEquals {
        command: String,
        pointer: String,
        value: serde_json::Value,
        #[serde(default)]
        on_device: bool,
    },
}

impl ScenarioCase {
    /// Every template string in the case.
    #[must_use]
    pub fn templates(&self) -> Vec<&str> {
        let mut out = vec![self.command.as_str()];
        for condition in &self.post_conditions {
            match condition {
                PostCondition::FileContains { path, .. } => out.push(path),
                PostCondition::ExitCodeEquals { command, .. }
                | PostCondition::JsonFieldEquals { command, .. } => out.push(command),
                PostCondition::ReachableWithin { .. } => {}
            }
        }
        out
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Result of evaluating one case.
#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    pub name: String,
    /// Expanded command line, `None` if expansion failed.
    pub command: Option<String>,
    pub result: Option<CommandResult>,
    pub unmet: Vec<RunFailure>,
}

impl ScenarioOutcome {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.unmet.is_empty()
    }
}

/// Run `case` and check all of its expectations.
pub fn evaluate(
    case: &ScenarioCase,
    runner: &ScenarioRunner<'_>,
    vars: &TemplateVars<'_>,
) -> ScenarioOutcome {
    let mut outcome = ScenarioOutcome {
        name: case.name.clone(),
        command: None,
        result: None,
        unmet: Vec::new(),
    };

    let command_line = match template::expand(&case.command, vars) {
        Ok(line) => line,
        Err(err) => {
            outcome.unmet.push(RunFailure::new(
                FailureKind::Runtime,
                Phase::Scenario,
                err.to_string(),
            ));
            return outcome;
        }
    };
    outcome.command = Some(command_line.clone());

    let result = match runner.on_host(&case.name, &command_line, case.timeout()) {
        Ok(result) => result,
        Err(err) => {
            outcome
                .unmet
                .push(RunFailure::from_error(&err, Phase::Scenario));
            return outcome;
        }
    };

    if result.exit_code != case.expected_exit_code {
        outcome.unmet.push(mismatch(format!(
            "exit code {}, expected {}",
            result.exit_code, case.expected_exit_code
        )));
    }
    for needle in &case.expected_output {
        if !result.output_contains(needle) {
            outcome
                .unmet
                .push(mismatch(format!("output does not contain {needle:?}")));
        }
    }
    if result.output_truncated {
        outcome
            .unmet
            .push(RunFailure::truncated_output(Phase::Scenario));
    }
    outcome.result = Some(result);

    for condition in &case.post_conditions {
        if let Err(failure) = check(condition, runner, vars) {
            let stop = matches!(
                failure.kind,
                FailureKind::UnreachableDevice | FailureKind::Interrupted
            );
            outcome.unmet.push(failure);
            if stop {
                break;
            }
        }
    }

    outcome
}

fn check(
    condition: &PostCondition,
    runner: &ScenarioRunner<'_>,
    vars: &TemplateVars<'_>,
) -> Result<(), RunFailure> {
    match condition {
        PostCondition::FileContains { path, substring } => {
            let path = template::expand_path(path, vars).map_err(runtime)?;
            let bytes = fs::read(&path)
                .map_err(|err| mismatch(format!("file {path} unreadable: {err}")))?;
            if memmem::find(&bytes, substring.as_bytes()).is_none() {
                return Err(mismatch(format!(
                    "file {path} does not contain {substring:?}"
                )));
            }
            Ok(())
        }
        PostCondition::ExitCodeEquals {
            command,
            value,
            on_device,
        } => {
            let command = expand(command, vars)?;
            let result = run(runner, &command, *on_device)?;
            if result.exit_code != *value {
                return Err(mismatch(format!(
                    "`{command}` exit code {}, expected {value}",
                    result.exit_code
                )));
            }
            Ok(())
        }
        PostCondition::ReachableWithin { timeout_secs } => runner
            .wait_reachable(Duration::from_secs(*timeout_secs))
            .map(|_| ())
            .map_err(|err| match err {
                DvhError::UnreachableDevice { .. } => RunFailure::new(
                    FailureKind::UnreachableDevice,
                    Phase::Scenario,
                    format!("device not reachable within {timeout_secs}s"),
                ),
                other => RunFailure::from_error(&other, Phase::Scenario),
            }),
        PostCondition::JsonFieldEquals {
            command,
            pointer,
            value,
            on_device,
        } => {
            let command = expand(command, vars)?;
            let result = run(runner, &command, *on_device)?;
            let doc: serde_json::Value = serde_json::from_slice(&result.stdout)
                .map_err(|err| mismatch(format!("`{command}` did not print JSON: {err}")))?;
            match doc.pointer(pointer) {
                Some(actual) if actual == value => Ok(()),
                Some(actual) => Err(mismatch(format!(
                    "`{command}` {pointer} = {actual}, expected {value}"
                ))),
                None => Err(mismatch(format!("`{command}` has no field at {pointer}"))),
            }
        }
    }
}

fn run(
    runner: &ScenarioRunner<'_>,
    command: &str,
    on_device: bool,
) -> Result<CommandResult, RunFailure> {
    let result = if on_device {
        runner.on_device("post-condition", command, None)
    } else {
        runner.on_host("post-condition", command, None)
    };
    result.map_err(|err| RunFailure::from_error(&err, Phase::Scenario))
}

fn expand(text: &str, vars: &TemplateVars<'_>) -> Result<String, RunFailure> {
    template::expand(text, vars).map_err(runtime)
}

fn runtime(err: DvhError) -> RunFailure {
    RunFailure::new(FailureKind::Runtime, Phase::Scenario, err.to_string())
}

fn mismatch(expectation: String) -> RunFailure {
    RunFailure::new(FailureKind::PrimaryDeployFailure, Phase::Scenario, expectation)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::fleet::device::{Channel, DeviceDescriptor};
    use crate::runner::cancel::CancelToken;
    use crate::runner::channel::MockChannel;
    use crate::runner::scenario::RunBudget;

    const MISSING_ARGS: &str =
        "One of the following arguments is required: --output-directory, --remote-host";

    fn device() -> DeviceDescriptor {
        DeviceDescriptor {
            device_class: "verdin-imx8mm".into(),
            machine: "verdin-01".into(),
            delegation_config: PathBuf::from("delegations/verdin.json"),
            channel: Channel::Release,
        }
    }

    fn with_runner<R>(
        host: &MockChannel,
        device_channel: &MockChannel,
        report_dir: &Path,
        body: impl FnOnce(&ScenarioRunner<'_>, &TemplateVars<'_>) -> R,
    ) -> R {
        let cancel = CancelToken::new();
        let runner = ScenarioRunner::new(
            host,
            device_channel,
            RunBudget::new(Duration::from_secs(5), Duration::from_secs(60)),
            &cancel,
        );
        let descriptor = device();
        let vars = TemplateVars {
            device: &descriptor,
            channel: Channel::Release,
            artifact: "torizon/release",
            remote: None,
            report_dir,
        };
        body(&runner, &vars)
    }

    fn case(command: &str) -> ScenarioCase {
        ScenarioCase {
            name: "case".into(),
            command: command.into(),
            expected_exit_code: 0,
            expected_output: Vec::new(),
            post_conditions: Vec::new(),
            timeout_secs: None,
        }
    }

    #[test]
    fn deploy_without_arguments_passes_on_255_and_message() {
        let host = MockChannel::new(true).with_output(255, &format!("error: {MISSING_ARGS}\n"));
        let dev = MockChannel::new(true);
        let mut c = case("torizoncore-builder deploy");
        c.expected_exit_code = 255;
        c.expected_output = vec![MISSING_ARGS.into()];
        let outcome = with_runner(&host, &dev, Path::new("r"), |runner, vars| {
            evaluate(&c, runner, vars)
        });
        assert!(outcome.passed(), "{:?}", outcome.unmet);
        assert_eq!(outcome.result.unwrap().exit_code, 255);
    }

    #[test]
    fn truncated_capture_is_unmet_even_when_text_matches() {
        let host = MockChannel::new(true).with_truncated_output(0, "deployed\n");
        let dev = MockChannel::new(true);
        let mut c = case("deploy-and-detach");
        c.expected_output = vec!["deployed".into()];
        let outcome = with_runner(&host, &dev, Path::new("r"), |runner, vars| {
            evaluate(&c, runner, vars)
        });
        assert_eq!(outcome.unmet.len(), 1);
        assert_eq!(outcome.unmet[0].kind, FailureKind::Runtime);
        assert!(outcome.unmet[0].expectation.contains("incomplete"));
    }

    #[test]
    fn every_unmet_expectation_is_recorded() {
        let host = MockChannel::new(true).with_output(0, "something else");
        let dev = MockChannel::new(true);
        let mut c = case("torizoncore-builder deploy");
        c.expected_exit_code = 255;
        c.expected_output = vec![MISSING_ARGS.into(), "usage".into()];
        let outcome = with_runner(&host, &dev, Path::new("r"), |runner, vars| {
            evaluate(&c, runner, vars)
        });
        assert_eq!(outcome.unmet.len(), 3);
        assert_eq!(outcome.unmet[0].expectation, "exit code 0, expected 255");
        assert!(
            outcome
                .unmet
                .iter()
                .all(|f| f.kind == FailureKind::PrimaryDeployFailure)
        );
    }

    #[test]
    fn file_contains_checks_literal_line() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("etc").join("feature.conf");
        fs::create_dir_all(conf.parent().unwrap()).unwrap();
        fs::write(&conf, "name=demo\nenabled=1\n").unwrap();

        let host = MockChannel::new(true).with_output(0, "");
        let dev = MockChannel::new(true);
        let mut c = case("deploy --output-directory {report_dir}/image");
        c.post_conditions = vec![PostCondition::FileContains {
            path: "{report_dir}/etc/feature.conf".into(),
            substring: "enabled=1".into(),
        }];
        let outcome = with_runner(&host, &dev, dir.path(), |runner, vars| {
            evaluate(&c, runner, vars)
        });
        assert!(outcome.passed(), "{:?}", outcome.unmet);

        fs::write(&conf, "enabled=0\n").unwrap();
        let host = MockChannel::new(true).with_output(0, "");
        let outcome = with_runner(&host, &dev, dir.path(), |runner, vars| {
            evaluate(&c, runner, vars)
        });
        assert_eq!(outcome.unmet.len(), 1);
        assert_eq!(outcome.unmet[0].kind, FailureKind::PrimaryDeployFailure);
        assert!(outcome.unmet[0].expectation.contains("enabled=1"));
    }

    #[test]
    fn reboot_then_device_exit_code_42_is_a_pass() {
        let host = MockChannel::new(true).with_output(0, "deployed");
        let dev = MockChannel::new(true).with_output(42, "");
        let mut c = case("deploy --reboot");
        c.post_conditions = vec![
            PostCondition::ReachableWithin { timeout_secs: 10 },
            PostCondition::ExitCodeEquals {
                command: "check-update".into(),
                value: 42,
                on_device: true,
            },
        ];
        let outcome = with_runner(&host, &dev, Path::new("r"), |runner, vars| {
            evaluate(&c, runner, vars)
        });
        assert!(outcome.passed(), "{:?}", outcome.unmet);
        assert_eq!(dev.calls(), vec!["check-update"]);
    }

    #[test]
    fn unreachable_device_stops_remaining_post_conditions() {
        let host = MockChannel::new(true).with_output(0, "deployed");
        let dev = MockChannel::new(false).with_output(42, "");
        let mut c = case("deploy --reboot");
        c.post_conditions = vec![
            PostCondition::ReachableWithin { timeout_secs: 10 },
            PostCondition::ExitCodeEquals {
                command: "check-update".into(),
                value: 42,
                on_device: true,
            },
        ];
        let outcome = with_runner(&host, &dev, Path::new("r"), |runner, vars| {
            evaluate(&c, runner, vars)
        });
        assert_eq!(outcome.unmet.len(), 1);
        assert_eq!(outcome.unmet[0].kind, FailureKind::UnreachableDevice);
        assert!(dev.calls().is_empty());
    }

    #[test]
    fn json_field_compares_structured_status() {
        let host = MockChannel::new(true)
            .with_output(0, "")
            .with_output(0, r#"{"deployment":{"booted":true,"channel":"nightly"}}"#);
        let dev = MockChannel::new(true);
        let mut c = case("deploy");
        c.post_conditions = vec![PostCondition::JsonFieldEquals {
            command: "status --json".into(),
            pointer: "/deployment/channel".into(),
            value: serde_json::json!("release"),
            on_device: false,
        }];
        let outcome = with_runner(&host, &dev, Path::new("r"), |runner, vars| {
            evaluate(&c, runner, vars)
        });
        assert_eq!(outcome.unmet.len(), 1);
        assert!(
            outcome.unmet[0]
                .expectation
                .contains("/deployment/channel = \"nightly\"")
        );
    }

    #[test]
    fn command_timeout_is_recorded_as_timeout() {
        let host = MockChannel::new(true).with_error(DvhError::TimeoutExceeded {
            command: "deploy".into(),
            timeout_ms: 5_000,
        });
        let dev = MockChannel::new(true);
        let c = case("deploy");
        let outcome = with_runner(&host, &dev, Path::new("r"), |runner, vars| {
            evaluate(&c, runner, vars)
        });
        assert_eq!(outcome.unmet.len(), 1);
        assert_eq!(outcome.unmet[0].kind, FailureKind::TimeoutExceeded);
        assert!(outcome.result.is_none());
    }

    #[test]
    fn toml_post_conditions_use_kind_tag() {
        let case: ScenarioCase = toml::from_str(
            r#"
            name = "reboot"
            command = "deploy --reboot"
            [[post_conditions]]
            kind = "reachable_within"
            timeout_secs = 10
            [[post_conditions]]
            kind = "exit_code_equals"
            command = "exit 42"
            value = 42
            on_device = true
            "#,
        )
        .unwrap();
        assert_eq!(case.expected_exit_code, 0);
        assert_eq!(
            case.post_conditions[0],
            PostCondition::ReachableWithin { timeout_secs: 10 }
        );
        assert_eq!(case.templates(), vec!["deploy --reboot", "exit 42"]);
    }
}
