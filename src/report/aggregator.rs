//! Fleet verdict: scan every report artifact for failure markers.
//!
//! The gate is deliberately blunt: any line, in any file under the reports
//! directory, that begins with the literal `not ok` fails the fleet run. A
//! device whose `<slug>.tap` is absent or unreadable fails too, with
//! `report_missing` rather than an assertion failure.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{DvhError, Result};
use crate::fleet::device::DeviceDescriptor;
use crate::fleet::outcome::{FailureKind, Outcome, Phase, ReportEntry, RunFailure};
use crate::report::tap;

/// Literal token that marks a failed assertion.
pub const FAILURE_MARKER: &str = "not ok";

/// File the fleet summary is written to, inside the reports directory.
pub const SUMMARY_FILE: &str = "fleet-summary.json";

/// Line shapes of a TAP document the aggregator understands.
struct TapPatterns {
    /// `# kind: x`, `# phase: x`, `# unmet: x`
    diagnostic: Regex,
    /// `ok N ...` or `not ok N ...`
    test_line: Regex,
}

impl TapPatterns {
    fn compile() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|err| DvhError::Runtime {
                details: format!("TAP pattern {pattern:?}: {err}"),
            })
        };
        Ok(Self {
            diagnostic: compile(r"^#\s*(kind|phase|unmet):\s*(.*?)\s*$")?,
            test_line: compile(r"^(?:not )?ok\b")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

/// One `not ok` line found under the reports directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureMarker {
    pub file: PathBuf,
    /// 1-based.
    pub line_number: usize,
    pub line: String,
    /// From the `# kind:` diagnostic following the marker, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
}

/// Aggregated result of a fleet run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetReport {
    pub verdict: Verdict,
    pub devices: Vec<ReportEntry>,
    pub markers: Vec<FailureMarker>,
    /// Slugs of expected devices with no readable report.
    pub missing: Vec<String>,
}

impl FleetReport {
    pub fn failing(&self) -> impl Iterator<Item = &ReportEntry> {
        self.devices.iter().filter(|e| e.outcome == Outcome::Fail)
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

/// Every failure marker under `reports_dir`, in path then line order.
pub fn scan_markers(reports_dir: &Path) -> Result<Vec<FailureMarker>> {
    let patterns = TapPatterns::compile()?;
    let mut files = Vec::new();
    collect_files(reports_dir, &mut files)?;
    files.sort();

    let mut markers = Vec::new();
    for file in files {
        let bytes = fs::read(&file).map_err(|source| DvhError::io(&file, source))?;
        let text = String::from_utf8_lossy(&bytes);
        markers.extend(markers_in(&patterns, &file, &text));
    }
    Ok(markers)
}

fn markers_in(patterns: &TapPatterns, file: &Path, text: &str) -> Vec<FailureMarker> {
    let lines: Vec<&str> = text.lines().collect();
    let mut markers = Vec::new();
    for (index, line) in lines.iter().enumerate() {
        if !line.starts_with(FAILURE_MARKER) {
            continue;
        }
        let kind = lines[index + 1..]
            .iter()
            .take_while(|next| !patterns.test_line.is_match(next))
            .find_map(|next| {
                patterns
                    .diagnostic
                    .captures(next)
                    .filter(|caps| &caps[1] == "kind")
                    .and_then(|caps| FailureKind::parse(&caps[2]))
            });
        markers.push(FailureMarker {
            file: file.to_path_buf(),
            line_number: index + 1,
            line: (*line).to_string(),
            kind,
        });
    }
    markers
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|source| DvhError::io(dir, source))?;
    for entry in entries {
        let entry = entry.map_err(|source| DvhError::io(dir, source))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|source| DvhError::io(&path, source))?;
        if file_type.is_dir() {
            collect_files(&path, out)?;
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// Rebuild a device's failures from its TAP file.
fn failures_from_tap(patterns: &TapPatterns, text: &str) -> Vec<RunFailure> {
    let mut failures = Vec::new();
    let mut in_failed_test = false;
    let mut diagnosed = false;
    let mut current: Option<RunFailure> = None;

    let flush = |current: &mut Option<RunFailure>, failures: &mut Vec<RunFailure>| {
        if let Some(failure) = current.take() {
            failures.push(failure);
        }
    };

    for line in text.lines() {
        if patterns.test_line.is_match(line) {
            flush(&mut current, &mut failures);
            in_failed_test = line.starts_with(FAILURE_MARKER);
            diagnosed = false;
            if in_failed_test {
                // Stands in until a `# kind:` block describes the failure.
                current = Some(RunFailure::new(
                    FailureKind::PrimaryDeployFailure,
                    phase_from_description(line),
                    line.to_string(),
                ));
            }
            continue;
        }
        if !in_failed_test {
            continue;
        }
        let Some(caps) = patterns.diagnostic.captures(line) else {
            continue;
        };
        let value = caps[2].to_string();
        match &caps[1] {
            "kind" => {
                if diagnosed {
                    flush(&mut current, &mut failures);
                }
                diagnosed = true;
                let phase = current
                    .as_ref()
                    .map_or(Phase::Primary, |failure| failure.phase);
                let kind = FailureKind::parse(&value).unwrap_or(FailureKind::PrimaryDeployFailure);
                current = Some(RunFailure::new(kind, phase, String::new()));
            }
            "phase" => {
                if let (Some(failure), Some(phase)) = (current.as_mut(), parse_phase(&value)) {
                    failure.phase = phase;
                }
            }
            _ => {
                if let Some(failure) = current.as_mut() {
                    failure.expectation = value;
                }
            }
        }
    }
    flush(&mut current, &mut failures);
    failures
}

fn parse_phase(raw: &str) -> Option<Phase> {
    [
        Phase::PreHook,
        Phase::Primary,
        Phase::Scenario,
        Phase::Resync,
        Phase::Report,
    ]
    .into_iter()
    .find(|phase| phase.as_str() == raw)
}

fn phase_from_description(line: &str) -> Phase {
    let description = line.split_once(" - ").map_or("", |(_, rest)| rest);
    if description.starts_with("pre-hook") {
        Phase::PreHook
    } else if description.starts_with("scenario") {
        Phase::Scenario
    } else if description.starts_with("resync") {
        Phase::Resync
    } else {
        Phase::Primary
    }
}

/// Aggregate `reports_dir` against the devices expected to have reported.
pub fn aggregate(reports_dir: &Path, expected: &[DeviceDescriptor]) -> Result<FleetReport> {
    let patterns = TapPatterns::compile()?;
    let markers = if reports_dir.is_dir() {
        scan_markers(reports_dir)?
    } else {
        Vec::new()
    };

    let mut devices = Vec::with_capacity(expected.len());
    let mut missing = Vec::new();
    for device in expected {
        let tap_path = tap::tap_path(reports_dir, device);
        let mut failures = match fs::read(&tap_path) {
            Ok(bytes) => failures_from_tap(&patterns, &String::from_utf8_lossy(&bytes)),
            Err(_) => {
                missing.push(device.slug());
                vec![RunFailure::new(
                    FailureKind::ReportMissing,
                    Phase::Report,
                    format!("report {} is missing or unreadable", tap_path.display()),
                )]
            }
        };

        // Payload reports a scenario dropped into the device's directory.
        let device_dir = tap::device_dir(reports_dir, device);
        for marker in markers.iter().filter(|m| m.file.starts_with(&device_dir)) {
            failures.push(RunFailure::new(
                marker.kind.unwrap_or(FailureKind::PrimaryDeployFailure),
                Phase::Scenario,
                format!(
                    "{}:{}: {}",
                    marker.file.display(),
                    marker.line_number,
                    marker.line
                ),
            ));
        }

        devices.push(ReportEntry::from_failures(device.clone(), failures));
    }

    let verdict = if markers.is_empty()
        && missing.is_empty()
        && devices.iter().all(|e| e.outcome == Outcome::Pass)
    {
        Verdict::Pass
    } else {
        Verdict::Fail
    };

    Ok(FleetReport {
        verdict,
        devices,
        markers,
        missing,
    })
}

/// Write the report as single-line JSON to `<reports_dir>/fleet-summary.json`.
pub fn write_summary(reports_dir: &Path, report: &FleetReport) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir).map_err(|source| DvhError::io(reports_dir, source))?;
    let path = reports_dir.join(SUMMARY_FILE);
    let mut json = serde_json::to_string(report)?;
    json.push('\n');
    fs::write(&path, json).map_err(|source| DvhError::io(&path, source))?;
    Ok(path)
}
