#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_dvh") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "dvh.exe" } else { "dvh" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve dvh binary path for integration test"),
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    run_cli_case_with_env(case_name, args, &[])
}

/// Run `dvh` with extra environment variables. Output defaults to JSON
/// because stdout is never a terminal here.
pub fn run_cli_case_with_env(case_name: &str, args: &[&str], envs: &[(&str, &str)]) -> CmdResult {
    let root = std::env::temp_dir().join("dvh-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let mut command = Command::new(&bin_path);
    command
        .args(args)
        .env_remove("DVH_OUTPUT_FORMAT")
        .env("RUST_BACKTRACE", "1");
    for (key, value) in envs {
        command.env(key, value);
    }
    let output = command.output().expect("execute dvh command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("envs={envs:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// A harness config whose deployment tool is plain `/bin/sh`.
///
/// `devices` and `scenarios` are raw TOML appended after the shared sections.
pub fn write_harness_config(dir: &Path, commands: &str, devices: &str, scenarios: &str) -> PathBuf {
    let reports = dir.join("reports");
    let log = dir.join("activity.jsonl");
    let body = format!(
        r#"
[run]
jobs = 2
command_timeout_secs = 30
run_timeout_secs = 120
reports_dir = "{reports}"
shell = "/bin/sh"

[paths]
activity_log = "{log}"

[channels.release]
artifact = "images/release.tar"
[channels.nightly]
artifact = "images/nightly.tar"

{commands}

{devices}

{scenarios}
"#,
        reports = reports.display(),
        log = log.display(),
    );
    let path = dir.join("harness.toml");
    fs::write(&path, body).expect("write harness config");
    path
}

pub const TWO_DEVICES: &str = r#"
[[devices]]
device_class = "verdin-imx8mm"
machine = "verdin-01"
delegation_config = "delegations/verdin.json"
channel = "release"

[[devices]]
device_class = "apalis-imx6"
machine = "apalis-07"
delegation_config = "delegations/apalis.json"
channel = "nightly"
include = "full_fleet"
"#;
