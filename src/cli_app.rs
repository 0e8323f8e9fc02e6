//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use deploy_validation_harness::core::config::HarnessConfig;
use deploy_validation_harness::core::errors::DvhError;
use deploy_validation_harness::fleet::device::{self, DeviceDescriptor, RunScope};
use deploy_validation_harness::fleet::orchestrator::{FleetOptions, FleetOrchestrator, FleetOutcome};
use deploy_validation_harness::fleet::outcome::{Outcome, ReportEntry};
use deploy_validation_harness::logger::activity::{
    ActivityEvent, ActivityLoggerConfig, spawn_logger,
};
use deploy_validation_harness::logger::jsonl::JsonlConfig;
use deploy_validation_harness::report::aggregator::{self, FleetReport};
use deploy_validation_harness::runner::cancel::CancelToken;

/// Deploy Validation Harness: drive update deployments across a device fleet.
#[derive(Debug, Parser)]
#[command(
    name = "dvh",
    author,
    version,
    about = "Deploy Validation Harness - hardware-in-the-loop update validation",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (failures only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the validation matrix, write reports and print the fleet verdict.
    Run(RunArgs),
    /// Re-aggregate an existing reports directory into a verdict.
    Verdict(VerdictArgs),
    /// List the device matrix and which devices a run would select.
    Devices(DevicesArgs),
    /// Print the complement of a release channel.
    Channel(ChannelArgs),
    /// View or validate configuration.
    Config(ConfigArgs),
    /// Show version and build metadata.
    Version(VersionArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Which part of the matrix to cover, as spelled on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
enum ScopeArg {
    /// Devices marked `include = "always"`.
    Default,
    /// Every device in the matrix.
    FullFleet,
}

#[derive(Debug, Clone, Args, Serialize, Default)]
struct ScopeSelection {
    /// Cover the whole fleet (same as `--scope full-fleet`).
    #[arg(long, conflicts_with = "scope")]
    all: bool,
    /// Matrix subset to cover.
    #[arg(long, value_enum, value_name = "SCOPE")]
    scope: Option<ScopeArg>,
}

impl ScopeSelection {
    fn resolve(&self) -> RunScope {
        if self.all || self.scope == Some(ScopeArg::FullFleet) {
            RunScope::FullFleet
        } else {
            RunScope::DefaultSubset
        }
    }
}

#[derive(Debug, Clone, Args, Serialize, Default)]
struct RunArgs {
    #[command(flatten)]
    selection: ScopeSelection,
    /// Only run these machines (repeatable).
    #[arg(long = "device", value_name = "MACHINE")]
    devices: Vec<String>,
    /// Maximum number of devices validated concurrently.
    #[arg(long, value_name = "N")]
    jobs: Option<usize>,
    /// Write reports here instead of `run.reports_dir`.
    #[arg(long, value_name = "PATH")]
    reports_dir: Option<PathBuf>,
    /// Empty the reports directory before the run.
    #[arg(long)]
    clean: bool,
}

#[derive(Debug, Clone, Args, Serialize, Default)]
struct VerdictArgs {
    #[command(flatten)]
    selection: ScopeSelection,
    /// Reports directory to aggregate (defaults to `run.reports_dir`).
    #[arg(long, value_name = "PATH")]
    reports_dir: Option<PathBuf>,
    /// Expect a report from this device slug instead of the matrix scope (repeatable).
    #[arg(long = "expect", value_name = "SLUG")]
    expect: Vec<String>,
}

#[derive(Debug, Clone, Args, Serialize, Default)]
struct DevicesArgs {
    #[command(flatten)]
    selection: ScopeSelection,
}

#[derive(Debug, Clone, Args, Serialize)]
struct ChannelArgs {
    /// Channel to flip (`release` or `nightly`).
    #[arg(value_name = "VALUE")]
    value: String,
}

#[derive(Debug, Clone, Args, Serialize, Default)]
struct ConfigArgs {
    /// Config operation to run.
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand, Serialize)]
enum ConfigCommand {
    /// Print resolved config file path.
    Path,
    /// Print effective merged configuration.
    Show,
    /// Validate configuration and exit.
    Validate,
}

#[derive(Debug, Clone, Args, Serialize, Default)]
struct VersionArgs {
    /// Include additional build metadata fields.
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// The fleet verdict is fail. The summary has already been printed.
    #[error("{0}")]
    Verdict(String),
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Verdict(_) => 1,
            Self::User(_) => 2,
            Self::Runtime(_) | Self::Io(_) => 3,
            Self::Internal(_) | Self::Json(_) => 4,
        }
    }
}

impl From<DvhError> for CliError {
    fn from(err: DvhError) -> Self {
        let message = err.to_string();
        match err {
            DvhError::InvalidConfig { .. }
            | DvhError::MissingConfig { .. }
            | DvhError::ConfigParse { .. }
            | DvhError::InvalidChannel { .. }
            | DvhError::Template { .. } => Self::User(message),
            DvhError::Serialization { .. } => Self::Internal(message),
            _ => Self::Runtime(message),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Run(args) => run_fleet(cli, args),
        Command::Verdict(args) => run_verdict(cli, args),
        Command::Devices(args) => run_devices(cli, args),
        Command::Channel(args) => run_channel(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Version(args) => emit_version(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// run / verdict
// ---------------------------------------------------------------------------

fn run_fleet(cli: &Cli, args: &RunArgs) -> Result<(), CliError> {
    if args.jobs == Some(0) {
        return Err(CliError::User("--jobs must be at least 1".to_string()));
    }
    let config = HarnessConfig::load(cli.config.as_deref())?;
    let scope = args.selection.resolve();
    let mode = output_mode(cli);

    let logger_config = ActivityLoggerConfig {
        jsonl_config: JsonlConfig {
            path: config.paths.activity_log.clone(),
            ..JsonlConfig::default()
        },
        ..ActivityLoggerConfig::default()
    };
    let run_id = logger_config.run_id.clone();
    let (logger, logger_thread) = spawn_logger(logger_config)?;

    let orchestrator = FleetOrchestrator::new(Arc::new(config), cancel_token(), logger.clone());
    let options = FleetOptions {
        scope,
        only: args.devices.clone(),
        jobs: args.jobs,
        reports_dir: args.reports_dir.clone(),
        clean: args.clean,
    };
    let result = orchestrator.run_and_aggregate(&options);
    if let Err(e) = &result {
        logger.send(ActivityEvent::from_error(e));
    }
    logger.shutdown();
    if logger_thread.join().is_err() {
        eprintln!("[DVH-JSONL] activity logger thread panicked; log may be incomplete");
    }

    let (outcome, report) = result?;
    match mode {
        OutputMode::Human => print_run_summary(cli, scope, &outcome, &report),
        OutputMode::Json => {
            let payload = json!({
                "command": "run",
                "run_id": run_id,
                "scope": scope.as_str(),
                "reports_dir": outcome.reports_dir.to_string_lossy(),
                "duration_ms": outcome.duration_ms,
                "report": serde_json::to_value(&report)?,
            });
            write_json_line(&payload)?;
        }
    }
    verdict_result(&report)
}

fn run_verdict(cli: &Cli, args: &VerdictArgs) -> Result<(), CliError> {
    let config = HarnessConfig::load(cli.config.as_deref())?;
    let reports_dir = args
        .reports_dir
        .clone()
        .unwrap_or_else(|| config.run.reports_dir.clone());
    let expected = expected_devices(&config, args)?;
    let report = aggregator::aggregate(&reports_dir, &expected)?;

    match output_mode(cli) {
        OutputMode::Human => print_report(cli, &report, &reports_dir),
        OutputMode::Json => {
            let payload = json!({
                "command": "verdict",
                "reports_dir": reports_dir.to_string_lossy(),
                "report": serde_json::to_value(&report)?,
            });
            write_json_line(&payload)?;
        }
    }
    verdict_result(&report)
}

fn expected_devices(
    config: &HarnessConfig,
    args: &VerdictArgs,
) -> Result<Vec<DeviceDescriptor>, CliError> {
    if args.expect.is_empty() {
        let selected = device::select(&config.devices, args.selection.resolve(), &[])?;
        return Ok(selected.into_iter().map(|e| e.descriptor.clone()).collect());
    }

    args.expect
        .iter()
        .map(|slug| {
            config
                .devices
                .iter()
                .find(|e| &e.descriptor.slug() == slug)
                .map(|e| e.descriptor.clone())
                .ok_or_else(|| CliError::User(format!("no device in the matrix has slug {slug:?}")))
        })
        .collect()
}

fn verdict_result(report: &FleetReport) -> Result<(), CliError> {
    if report.passed() {
        return Ok(());
    }
    let failing = report.failing().count();
    Err(CliError::Verdict(format!(
        "fleet verdict: fail ({failing} failing device(s), {} failure marker(s))",
        report.markers.len()
    )))
}

fn print_run_summary(cli: &Cli, scope: RunScope, outcome: &FleetOutcome, report: &FleetReport) {
    if !cli.quiet {
        #[allow(clippy::cast_precision_loss)]
        let secs = outcome.duration_ms as f64 / 1000.0;
        println!(
            "Fleet run: {} device(s), scope {}, {secs:.1}s",
            outcome.selected.len(),
            scope.as_str()
        );
    }
    print_report(cli, report, &outcome.reports_dir);
}

fn print_report(cli: &Cli, report: &FleetReport, reports_dir: &Path) {
    for entry in &report.devices {
        match entry.outcome {
            Outcome::Pass if cli.quiet => {}
            Outcome::Pass => println!("  {}  {}", "PASS".green(), entry.device),
            Outcome::Fail => print_failing_entry(entry),
        }
    }

    if !report.missing.is_empty() {
        println!("Missing reports: {}", report.missing.join(", "));
    }
    if cli.verbose {
        for marker in &report.markers {
            println!(
                "  marker {}:{}: {}",
                marker.file.display(),
                marker.line_number,
                marker.line
            );
        }
    }

    let verdict = if report.passed() {
        "PASS".green().bold()
    } else {
        "FAIL".red().bold()
    };
    println!(
        "Verdict: {verdict} ({} marker(s) under {})",
        report.markers.len(),
        reports_dir.display()
    );
}

fn print_failing_entry(entry: &ReportEntry) {
    let kinds: Vec<&str> = entry.kinds().iter().map(|k| k.as_str()).collect();
    println!(
        "  {}  {} [{}]",
        "FAIL".red().bold(),
        entry.device,
        kinds.join(", ")
    );
    for line in &entry.failure_lines {
        println!("        {line}");
    }
}

#[cfg(feature = "signals")]
fn cancel_token() -> CancelToken {
    CancelToken::with_signal_hooks()
}

#[cfg(not(feature = "signals"))]
fn cancel_token() -> CancelToken {
    CancelToken::new()
}

// ---------------------------------------------------------------------------
// devices / channel
// ---------------------------------------------------------------------------

fn run_devices(cli: &Cli, args: &DevicesArgs) -> Result<(), CliError> {
    let config = HarnessConfig::load(cli.config.as_deref())?;
    let scope = args.selection.resolve();

    match output_mode(cli) {
        OutputMode::Human => {
            if config.devices.is_empty() {
                println!("No devices configured in {}", config.paths.config_file.display());
                return Ok(());
            }
            for entry in &config.devices {
                let marker = if scope.includes(entry.include) { "*" } else { " " };
                let target = entry
                    .remote
                    .as_ref()
                    .map_or_else(|| "local".to_string(), |r| format!("{}:{}", r.host, r.port));
                println!(
                    "{marker} {:<32} {:<8} {:<10} {target}",
                    entry.descriptor.slug(),
                    entry.descriptor.channel.as_str(),
                    entry.include.as_str(),
                );
            }
            if cli.verbose {
                println!("(* = selected for scope {})", scope.as_str());
            }
        }
        OutputMode::Json => {
            let devices: Vec<Value> = config
                .devices
                .iter()
                .map(|entry| {
                    Ok(json!({
                        "slug": entry.descriptor.slug(),
                        "device": serde_json::to_value(entry)?,
                        "selected": scope.includes(entry.include),
                    }))
                })
                .collect::<Result<_, serde_json::Error>>()?;
            let payload = json!({
                "command": "devices",
                "scope": scope.as_str(),
                "devices": devices,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_channel(cli: &Cli, args: &ChannelArgs) -> Result<(), CliError> {
    let complement = device::complement_of(&args.value)?;
    match output_mode(cli) {
        OutputMode::Human => println!("{complement}"),
        OutputMode::Json => {
            let payload = json!({
                "command": "channel",
                "input": args.value.trim(),
                "complement": complement.as_str(),
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config / version
// ---------------------------------------------------------------------------

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(HarnessConfig::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = HarnessConfig::load(cli.config.as_deref())?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Internal(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match HarnessConfig::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Devices: {}", config.devices.len());
                        println!("  Scenarios: {}", config.scenarios.len());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "devices": config.devices.len(),
                            "scenarios": config.scenarios.len(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                if output_mode(cli) == OutputMode::Json {
                    let payload = json!({
                        "command": "config validate",
                        "valid": false,
                        "code": e.code(),
                        "error": e.to_string(),
                    });
                    write_json_line(&payload)?;
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

fn emit_version(cli: &Cli, args: &VersionArgs) -> Result<(), CliError> {
    let version = env!("CARGO_PKG_VERSION");
    let package = env!("CARGO_PKG_NAME");
    let target = option_env!("TARGET").unwrap_or("unknown");
    let profile = option_env!("PROFILE").unwrap_or("unknown");
    let git_sha = option_env!("GIT_SHA").unwrap_or("unknown");

    match output_mode(cli) {
        OutputMode::Human => {
            println!("dvh {version}");
            if args.verbose {
                println!("package: {package}");
                println!("target: {target}");
                println!("profile: {profile}");
                println!("git_sha: {git_sha}");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "binary": "dvh",
                "version": version,
                "package": package,
                "build": {
                    "target": target,
                    "profile": profile,
                    "git_sha": git_sha,
                }
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("DVH_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        Some("auto") | None => fallback,
        Some(_) => fallback,
    }
}
