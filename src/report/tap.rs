//! Per-device TAP report writer.
//!
//! Each device run produces `<reports_dir>/<slug>.tap` plus one log per step
//! under `<reports_dir>/<slug>/`. A failing step is a `not ok` line followed by
//! `# kind:`, `# phase:` and `# unmet:` diagnostics for every failure. Captured
//! command output in step logs is prefixed with `| ` so that tool output can
//! never masquerade as a failure marker.

#![allow(missing_docs)]

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::errors::{DvhError, Result};
use crate::fleet::device::DeviceDescriptor;
use crate::fleet::outcome::{Phase, StepRecord};

pub const TAP_EXTENSION: &str = "tap";

/// `<reports_dir>/<slug>.tap`
#[must_use]
pub fn tap_path(reports_dir: &Path, device: &DeviceDescriptor) -> PathBuf {
    reports_dir.join(format!("{}.{TAP_EXTENSION}", device.slug()))
}

/// `<reports_dir>/<slug>/`
#[must_use]
pub fn device_dir(reports_dir: &Path, device: &DeviceDescriptor) -> PathBuf {
    reports_dir.join(device.slug())
}

/// Remove any previous report for `device` and create an empty report directory.
pub fn prepare_device_dir(reports_dir: &Path, device: &DeviceDescriptor) -> Result<PathBuf> {
    let tap = tap_path(reports_dir, device);
    if tap.exists() {
        fs::remove_file(&tap).map_err(|source| DvhError::io(&tap, source))?;
    }
    let dir = device_dir(reports_dir, device);
    if dir.exists() {
        fs::remove_dir_all(&dir).map_err(|source| DvhError::io(&dir, source))?;
    }
    fs::create_dir_all(&dir).map_err(|source| DvhError::io(&dir, source))?;
    Ok(dir)
}

/// Render the TAP document for one device run.
#[must_use]
pub fn render(device: &DeviceDescriptor, steps: &[StepRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "TAP version 13");
    let _ = writeln!(
        out,
        "# device: {} machine={} channel={}",
        device.device_class, device.machine, device.channel
    );
    let _ = writeln!(out, "1..{}", steps.len());

    for (index, step) in steps.iter().enumerate() {
        let number = index + 1;
        let name = single_line(&step.name);
        match step.failures.first() {
            None => {
                let _ = writeln!(out, "ok {number} - {name}");
            }
            Some(first) => {
                let _ = writeln!(
                    out,
                    "not ok {number} - {name}: {}",
                    single_line(&first.expectation)
                );
                for failure in &step.failures {
                    let _ = writeln!(out, "# kind: {}", failure.kind);
                    let _ = writeln!(out, "# phase: {}", failure.phase);
                    let _ = writeln!(out, "# unmet: {}", single_line(&failure.expectation));
                }
            }
        }
    }
    out
}

/// Write the TAP file and the step logs for one device run.
pub fn write_device_report(
    reports_dir: &Path,
    device: &DeviceDescriptor,
    steps: &[StepRecord],
) -> Result<PathBuf> {
    let dir = device_dir(reports_dir, device);
    fs::create_dir_all(&dir).map_err(|source| DvhError::io(&dir, source))?;

    for (index, step) in steps.iter().enumerate() {
        let log = dir.join(format!("{:02}-{}.log", index + 1, step_file_stem(step)));
        fs::write(&log, render_step_log(step)).map_err(|source| DvhError::io(&log, source))?;
    }

    let tap = tap_path(reports_dir, device);
    let staging = tap.with_extension("tap.partial");
    fs::write(&staging, render(device, steps))
        .map_err(|source| DvhError::io(&staging, source))?;
    fs::rename(&staging, &tap).map_err(|source| DvhError::io(&tap, source))?;
    Ok(tap)
}

fn render_step_log(step: &StepRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# step: {}", single_line(&step.name));
    let _ = writeln!(out, "# phase: {}", step.phase);
    if let Some(command) = &step.command {
        let _ = writeln!(out, "# command: {}", single_line(command));
    }
    match &step.result {
        Some(result) => {
            let _ = writeln!(out, "# exit_code: {}", result.exit_code);
            let _ = writeln!(out, "# duration_ms: {}", result.duration_ms);
            if result.output_truncated {
                let _ = writeln!(out, "# output_truncated: true");
            }
            let _ = writeln!(out, "## stdout");
            quote_into(&mut out, &result.stdout_lossy());
            let _ = writeln!(out, "## stderr");
            quote_into(&mut out, &result.stderr_lossy());
        }
        None => {
            let _ = writeln!(out, "# no command output");
        }
    }
    for failure in &step.failures {
        let _ = writeln!(out, "# failed: {}", single_line(&failure.to_string()));
    }
    out
}

fn quote_into(out: &mut String, text: &str) {
    for line in text.lines() {
        let _ = writeln!(out, "| {line}");
    }
}

fn step_file_stem(step: &StepRecord) -> String {
    match step.phase {
        Phase::PreHook => "pre-hook".to_string(),
        Phase::Primary => "primary".to_string(),
        Phase::Resync => "resync".to_string(),
        Phase::Report => "report".to_string(),
        Phase::Scenario => {
            let name: String = step
                .name
                .trim_start_matches("scenario ")
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
                .collect();
            format!("scenario-{}", name.trim_matches('-'))
        }
    }
}

fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::device::Channel;
    use crate::fleet::outcome::{FailureKind, RunFailure};
    use crate::runner::command::CommandResult;

    fn device() -> DeviceDescriptor {
        DeviceDescriptor {
            device_class: "colibri-imx6".into(),
            machine: "colibri-04".into(),
            delegation_config: PathBuf::from("d.json"),
            channel: Channel::Release,
        }
    }

    fn steps() -> Vec<StepRecord> {
        let mut hook = StepRecord::new(Phase::PreHook, "pre-hook");
        hook.command = Some("true".into());
        let mut primary = StepRecord::new(Phase::Primary, "primary");
        primary.command = Some("deploy".into());
        primary.result = Some(CommandResult {
            exit_code: 1,
            stdout: b"not ok 1 - from the tool\n".to_vec(),
            stderr: b"boom\n".to_vec(),
            duration_ms: 7,
            output_truncated: false,
        });
        primary.failures.push(RunFailure::new(
            FailureKind::PrimaryDeployFailure,
            Phase::Primary,
            "exit code 1, expected 0",
        ));
        let resync = StepRecord::new(Phase::Resync, "resync to nightly");
        vec![hook, primary, resync]
    }

    #[test]
    fn renders_plan_results_and_diagnostics() {
        let text = render(&device(), &steps());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "TAP version 13");
        assert_eq!(
            lines[1],
            "# device: colibri-imx6 machine=colibri-04 channel=release"
        );
        assert_eq!(lines[2], "1..3");
        assert_eq!(lines[3], "ok 1 - pre-hook");
        assert_eq!(lines[4], "not ok 2 - primary: exit code 1, expected 0");
        assert_eq!(lines[5], "# kind: primary_deploy_failure");
        assert_eq!(lines[6], "# phase: primary");
        assert_eq!(lines[7], "# unmet: exit code 1, expected 0");
        assert_eq!(lines[8], "ok 3 - resync to nightly");
    }

    #[test]
    fn writes_tap_and_quoted_step_logs() {
        let dir = tempfile::tempdir().unwrap();
        let device = device();
        prepare_device_dir(dir.path(), &device).unwrap();
        let tap = write_device_report(dir.path(), &device, &steps()).unwrap();
        assert_eq!(tap, dir.path().join("colibri-imx6-colibri-04-release.tap"));

        let log = fs::read_to_string(
            dir.path()
                .join("colibri-imx6-colibri-04")
                .join("02-primary.log"),
        )
        .unwrap();
        assert!(log.contains("| not ok 1 - from the tool"));
        assert!(log.lines().all(|line| !line.starts_with("not ok")));
        assert!(!dir.path().join("colibri-imx6-colibri-04-release.tap.partial").exists());
    }

    #[test]
    fn prepare_clears_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let device = device();
        write_device_report(dir.path(), &device, &steps()).unwrap();
        let report_dir = prepare_device_dir(dir.path(), &device).unwrap();
        assert!(!tap_path(dir.path(), &device).exists());
        assert_eq!(fs::read_dir(report_dir).unwrap().count(), 0);
    }

    #[test]
    fn scenario_log_names_are_filesystem_safe() {
        let step = StepRecord::new(Phase::Scenario, "scenario deploy without arguments");
        assert_eq!(step_file_stem(&step), "scenario-deploy-without-arguments");
    }
}
