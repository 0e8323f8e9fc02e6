//! JSONL activity log: one JSON object per line, every line tagged with the
//! fleet run that produced it.
//!
//! The log is shared by successive `dvh run` invocations. Rotation happens
//! only when a run opens the log, so the lines of one run always land in the
//! same file. Each line is written with one `write_all` on an `O_APPEND`
//! descriptor; a process tailing the file never sees a partial line.
//!
//! When the log cannot be opened the writer falls back to a temp-dir file,
//! then to stderr with a `[DVH-JSONL]` prefix, then to discarding. A fleet
//! run never fails because logging failed.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FleetStart,
    RunStart,
    CommandFinish,
    RunFinish,
    ReportWritten,
    FleetFinish,
    Error,
}

/// A single activity record. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// ISO 8601 UTC timestamp.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    /// Device slug.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Expanded command line. Never carries credentials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            event,
            severity,
            device: None,
            machine: None,
            channel: None,
            phase: None,
            command: None,
            exit_code: None,
            duration_ms: None,
            ok: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }
}

/// What actually goes on the wire: the run id followed by the entry fields.
#[derive(Serialize)]
struct Line<'a> {
    run: &'a str,
    #[serde(flatten)]
    entry: &'a LogEntry,
}

/// Identifier for one fleet run: UTC start time plus the harness pid.
#[must_use]
pub fn new_run_id() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
        std::process::id()
    )
}

#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    /// Used when `path` cannot be opened.
    pub fallback_path: Option<PathBuf>,
    /// A log larger than this is rotated when the next run opens it.
    pub rotate_above_bytes: u64,
    /// Rotated generations kept next to the log (`.1` is the newest).
    pub keep_rotated: u32,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            path: crate::core::config::PathsConfig::default().activity_log,
            fallback_path: Some(std::env::temp_dir().join("dvh-activity.jsonl")),
            rotate_above_bytes: 8 * 1024 * 1024,
            keep_rotated: 3,
        }
    }
}

enum Sink {
    Primary(File),
    Fallback(File),
    Stderr,
    Discard,
}

/// Append-only writer for the activity lines of one fleet run.
pub struct JsonlWriter {
    run_id: String,
    fallback_path: Option<PathBuf>,
    sink: Sink,
    lines: u64,
}

impl JsonlWriter {
    /// Open the log for the run `run_id`, rotating an oversized log first.
    pub fn open(config: &JsonlConfig, run_id: impl Into<String>) -> Self {
        let sink = match open_for_run(&config.path, config) {
            Ok(file) => Sink::Primary(file),
            Err(err) => {
                let _ = writeln!(
                    io::stderr(),
                    "[DVH-JSONL] cannot open {}: {err}",
                    config.path.display()
                );
                open_fallback(config.fallback_path.as_deref())
            }
        };
        Self {
            run_id: run_id.into(),
            fallback_path: config.fallback_path.clone(),
            sink,
            lines: 0,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// `normal`, `fallback`, `stderr` or `discard`.
    pub fn state(&self) -> &'static str {
        match self.sink {
            Sink::Primary(_) => "normal",
            Sink::Fallback(_) => "fallback",
            Sink::Stderr => "stderr",
            Sink::Discard => "discard",
        }
    }

    /// Lines accepted so far by a file or stderr.
    pub fn lines_written(&self) -> u64 {
        self.lines
    }

    pub fn write_entry(&mut self, entry: &LogEntry) {
        let line = Line {
            run: &self.run_id,
            entry,
        };
        let mut bytes = match serde_json::to_vec(&line) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = writeln!(io::stderr(), "[DVH-JSONL] serialize error: {e}");
                return;
            }
        };
        bytes.push(b'\n');
        self.write_line(&bytes);
    }

    /// Sync the log file once the run is over.
    pub fn finish(self) -> u64 {
        if let Sink::Primary(file) | Sink::Fallback(file) = &self.sink {
            let _ = file.sync_data();
        }
        self.lines
    }

    fn write_line(&mut self, bytes: &[u8]) {
        let written = match &mut self.sink {
            Sink::Primary(file) | Sink::Fallback(file) => file.write_all(bytes).is_ok(),
            Sink::Stderr => {
                let mut stderr = io::stderr().lock();
                stderr
                    .write_all(b"[DVH-JSONL] ")
                    .and_then(|()| stderr.write_all(bytes))
                    .is_ok()
            }
            Sink::Discard => return,
        };
        if written {
            self.lines += 1;
            return;
        }
        self.degrade();
        self.write_line(bytes);
    }

    fn degrade(&mut self) {
        self.sink = match self.sink {
            Sink::Primary(_) => open_fallback(self.fallback_path.as_deref()),
            Sink::Fallback(_) => {
                let _ = writeln!(io::stderr(), "[DVH-JSONL] fallback write failed, using stderr");
                Sink::Stderr
            }
            Sink::Stderr | Sink::Discard => Sink::Discard,
        };
    }
}

fn open_fallback(path: Option<&Path>) -> Sink {
    let Some(path) = path else {
        let _ = writeln!(io::stderr(), "[DVH-JSONL] no fallback configured, using stderr");
        return Sink::Stderr;
    };
    match open_append(path) {
        Ok(file) => {
            let _ = writeln!(
                io::stderr(),
                "[DVH-JSONL] using fallback log {}",
                path.display()
            );
            Sink::Fallback(file)
        }
        Err(_) => {
            let _ = writeln!(io::stderr(), "[DVH-JSONL] fallback unavailable, using stderr");
            Sink::Stderr
        }
    }
}

fn open_for_run(path: &Path, config: &JsonlConfig) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if size > config.rotate_above_bytes {
        rotate(path, config.keep_rotated);
    }
    open_append(path)
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// `log` -> `log.1`, `log.1` -> `log.2`, ...; the oldest beyond `keep` is removed.
fn rotate(path: &Path, keep: u32) {
    if keep == 0 {
        let _ = fs::remove_file(path);
        return;
    }
    let _ = fs::remove_file(rotated_name(path, keep));
    for index in (1..keep).rev() {
        let _ = fs::rename(rotated_name(path, index), rotated_name(path, index + 1));
    }
    let _ = fs::rename(path, rotated_name(path, 1));
}

fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(path: PathBuf) -> JsonlConfig {
        JsonlConfig {
            path,
            fallback_path: None,
            rotate_above_bytes: 1024 * 1024,
            keep_rotated: 2,
        }
    }

    fn parse_lines(path: &Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn every_line_carries_the_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.jsonl");
        let mut writer = JsonlWriter::open(&config(path.clone()), "run-a");
        writer.write_entry(&LogEntry::new(EventType::FleetStart, Severity::Info));
        let mut cmd = LogEntry::new(EventType::CommandFinish, Severity::Warning);
        cmd.device = Some("verdin-imx8mm-verdin-01-release".into());
        cmd.exit_code = Some(255);
        writer.write_entry(&cmd);
        assert_eq!(writer.finish(), 2);

        let lines = parse_lines(&path);
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l["run"] == "run-a"));
        assert_eq!(lines[0]["event"], "fleet_start");
        assert_eq!(lines[1]["exit_code"], 255);
        assert_eq!(lines[1]["severity"], "warning");
    }

    #[test]
    fn successive_runs_append_to_one_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.jsonl");
        for run in ["run-a", "run-b"] {
            let mut writer = JsonlWriter::open(&config(path.clone()), run);
            writer.write_entry(&LogEntry::new(EventType::FleetStart, Severity::Info));
            writer.write_entry(&LogEntry::new(EventType::FleetFinish, Severity::Info));
            writer.finish();
        }
        let runs: Vec<_> = parse_lines(&path)
            .iter()
            .map(|l| l["run"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(runs, vec!["run-a", "run-a", "run-b", "run-b"]);
    }

    #[test]
    fn oversized_log_rotates_at_open_and_never_mid_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.jsonl");
        fs::write(&path, "x".repeat(300)).unwrap();
        fs::write(rotated_name(&path, 1), "older\n").unwrap();
        fs::write(rotated_name(&path, 2), "oldest\n").unwrap();
        let cfg = JsonlConfig {
            rotate_above_bytes: 100,
            ..config(path.clone())
        };

        let mut writer = JsonlWriter::open(&cfg, "run-c");
        for _ in 0..20 {
            writer.write_entry(&LogEntry::new(EventType::CommandFinish, Severity::Info));
        }
        writer.finish();

        assert_eq!(parse_lines(&path).len(), 20);
        assert_eq!(fs::read_to_string(rotated_name(&path, 1)).unwrap(), "x".repeat(300));
        assert_eq!(fs::read_to_string(rotated_name(&path, 2)).unwrap(), "older\n");
        assert!(!rotated_name(&path, 3).exists());
    }

    #[test]
    fn falls_back_when_primary_cannot_be_created() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        let fallback = dir.path().join("fallback.jsonl");
        let cfg = JsonlConfig {
            fallback_path: Some(fallback.clone()),
            ..config(blocker.join("activity.jsonl"))
        };

        let mut writer = JsonlWriter::open(&cfg, "run-d");
        assert_eq!(writer.state(), "fallback");
        writer.write_entry(&LogEntry::new(EventType::Error, Severity::Critical));
        writer.finish();

        assert_eq!(parse_lines(&fallback)[0]["run"], "run-d");
    }

    #[test]
    fn without_fallback_lines_go_to_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        let writer = JsonlWriter::open(&config(blocker.join("activity.jsonl")), "run-e");
        assert_eq!(writer.state(), "stderr");
    }

    #[test]
    fn unset_fields_are_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.jsonl");
        let mut writer = JsonlWriter::open(&config(path.clone()), "run-f");
        writer.write_entry(&LogEntry::new(EventType::FleetStart, Severity::Info));
        writer.finish();

        let line = fs::read_to_string(&path).unwrap();
        assert!(!line.contains("\"device\""));
        assert!(!line.contains("\"exit_code\""));
    }

    #[test]
    fn run_ids_embed_the_pid() {
        let id = new_run_id();
        assert!(id.ends_with(&format!("-{}", std::process::id())), "{id}");
        assert!(id.contains('T') && id.contains('Z'), "{id}");
    }
}
