//! Fleet orchestrator: select devices, drive one validation run per device on
//! a bounded worker pool, and hand the reports to the aggregator.
//!
//! Within a device the run is strictly sequential (pre-hook, primary,
//! scenarios, resync) and holds that machine's lease throughout. Across
//! devices nothing is ordered. A failure, timeout or panic in one device's run
//! is captured into its own report entry and never touches its siblings.

#![allow(missing_docs)]

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel as channel;

use crate::assertion::scenario;
use crate::core::config::HarnessConfig;
use crate::core::errors::{DvhError, Result};
use crate::fleet::device::{self, DeviceDescriptor, DeviceEntry, RunScope};
use crate::fleet::lock::DeviceLockRegistry;
use crate::fleet::outcome::{FailureKind, Phase, ReportEntry, RunFailure, StepRecord};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::report::aggregator::{self, FleetReport};
use crate::report::tap;
use crate::runner::cancel::CancelToken;
use crate::runner::channel::{LocalChannel, open_channel};
use crate::runner::command::millis;
use crate::runner::resync::ResyncPlan;
use crate::runner::scenario::{RunBudget, ScenarioRunner};
use crate::runner::template::{self, TemplateVars};

/// Caller-chosen parameters of one fleet run.
#[derive(Debug, Clone, Default)]
pub struct FleetOptions {
    pub scope: RunScope,
    /// Restrict the run to these machine identities (within `scope`).
    pub only: Vec<String>,
    /// Overrides `run.jobs`.
    pub jobs: Option<usize>,
    /// Overrides `run.reports_dir`.
    pub reports_dir: Option<PathBuf>,
    /// Empty the reports directory before the run.
    pub clean: bool,
}

/// What the orchestrator produced, before aggregation.
#[derive(Debug, Clone)]
pub struct FleetOutcome {
    /// One entry per selected device, in matrix order.
    pub entries: Vec<ReportEntry>,
    pub selected: Vec<DeviceDescriptor>,
    pub reports_dir: PathBuf,
    pub duration_ms: u64,
}

/// One device's run: its commands, expanded at dispatch, plus what they did.
#[derive(Debug, Clone)]
pub struct ValidationRun {
    pub device: DeviceEntry,
    pub report_dir: PathBuf,
    pub pre_hook: Option<String>,
    pub primary: String,
    pub resync: ResyncPlan,
    steps: Vec<StepRecord>,
}

impl ValidationRun {
    /// Expand every step's command for `device`.
    pub fn prepare(device: DeviceEntry, config: &HarnessConfig, report_dir: PathBuf) -> Result<Self> {
        let (pre_hook, primary, resync) = {
            let vars = primary_vars(&device, config, &report_dir);
            let pre_hook = config
                .commands
                .pre_hook
                .as_deref()
                .map(|hook| template::expand(hook, &vars))
                .transpose()?;
            let primary = template::expand(&config.commands.primary, &vars)?;
            let resync = ResyncPlan::new(&config.commands.resync, &vars, &config.channels)?;
            (pre_hook, primary, resync)
        };
        Ok(Self {
            device,
            report_dir,
            pre_hook,
            primary,
            resync,
            steps: Vec::new(),
        })
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// Every failure recorded so far, in step order.
    pub fn failures(&self) -> Vec<RunFailure> {
        self.steps
            .iter()
            .flat_map(|step| step.failures.iter().cloned())
            .collect()
    }

    fn record(&mut self, step: StepRecord, on_step: &mut dyn FnMut(&StepRecord)) {
        on_step(&step);
        self.steps.push(step);
    }

    /// Drive the run to completion: pre-hook, primary, scenarios, resync.
    ///
    /// A failed pre-hook ends the run. Otherwise the resync is always issued,
    /// whatever the primary phase did, unless the run was interrupted or its
    /// budget is gone; the skip is then recorded as the resync's failure.
    pub fn execute(
        &mut self,
        runner: &ScenarioRunner<'_>,
        config: &HarnessConfig,
        on_step: &mut dyn FnMut(&StepRecord),
    ) {
        if let Some(hook) = self.pre_hook.clone() {
            let step = command_step(runner, Phase::PreHook, "pre-hook", &hook);
            let failed = !step.passed();
            self.record(step, on_step);
            if failed {
                return;
            }
        }

        let primary = self.primary.clone();
        let step = command_step(runner, Phase::Primary, "primary", &primary);
        self.record(step, on_step);

        let descriptor = self.device.descriptor.clone();
        let remote = self.device.remote.clone();
        let report_dir = self.report_dir.clone();
        let vars = TemplateVars {
            device: &descriptor,
            channel: descriptor.channel,
            artifact: config.channels.artifact_for(descriptor.channel),
            remote: remote.as_ref(),
            report_dir: &report_dir,
        };
        for case in &config.scenarios {
            if runner.is_cancelled() || runner.budget().is_exhausted() {
                break;
            }
            let outcome = scenario::evaluate(case, runner, &vars);
            let mut step = StepRecord::new(Phase::Scenario, format!("scenario {}", case.name));
            step.command = outcome.command;
            step.result = outcome.result;
            step.failures = outcome.unmet;
            self.record(step, on_step);
        }

        let step = self.resync_step(runner);
        self.record(step, on_step);
    }

    fn resync_step(&self, runner: &ScenarioRunner<'_>) -> StepRecord {
        let mut step = StepRecord::new(Phase::Resync, self.resync.describe());
        if runner.is_cancelled() {
            step.failures.push(RunFailure::new(
                FailureKind::Interrupted,
                Phase::Resync,
                "resync skipped: run interrupted",
            ));
            return step;
        }
        if runner.budget().is_exhausted() {
            step.failures.push(RunFailure::new(
                FailureKind::TimeoutExceeded,
                Phase::Resync,
                "resync skipped: run budget exhausted",
            ));
            return step;
        }

        step.command = Some(self.resync.command_line.clone());
        match self.resync.execute(runner) {
            Ok(result) => {
                if !result.success() {
                    step.failures.push(RunFailure::new(
                        FailureKind::ResyncFailure,
                        Phase::Resync,
                        format!(
                            "resync to {} exit code {}, expected 0",
                            self.resync.to, result.exit_code
                        ),
                    ));
                }
                step.result = Some(result);
            }
            Err(err) => step.failures.push(RunFailure::from_error(&err, Phase::Resync)),
        }
        step
    }
}

fn primary_vars<'a>(
    device: &'a DeviceEntry,
    config: &'a HarnessConfig,
    report_dir: &'a Path,
) -> TemplateVars<'a> {
    let channel = device.descriptor.channel;
    TemplateVars {
        device: &device.descriptor,
        channel,
        artifact: config.channels.artifact_for(channel),
        remote: device.remote.as_ref(),
        report_dir,
    }
}

fn command_step(
    runner: &ScenarioRunner<'_>,
    phase: Phase,
    name: &str,
    command_line: &str,
) -> StepRecord {
    let mut step = StepRecord::new(phase, name);
    step.command = Some(command_line.to_string());
    match runner.on_host(phase.as_str(), command_line, None) {
        Ok(result) => {
            if !result.success() {
                step.failures.push(RunFailure::new(
                    phase.failure_kind(),
                    phase,
                    format!("exit code {}, expected 0", result.exit_code),
                ));
            }
            if result.output_truncated {
                step.failures.push(RunFailure::truncated_output(phase));
            }
            step.result = Some(result);
        }
        Err(err) => step.failures.push(RunFailure::from_error(&err, phase)),
    }
    step
}

/// Drives validation runs across the fleet.
pub struct FleetOrchestrator {
    config: Arc<HarnessConfig>,
    locks: Arc<DeviceLockRegistry>,
    cancel: CancelToken,
    logger: ActivityLoggerHandle,
}

impl FleetOrchestrator {
    pub fn new(config: Arc<HarnessConfig>, cancel: CancelToken, logger: ActivityLoggerHandle) -> Self {
        Self {
            config,
            locks: Arc::new(DeviceLockRegistry::new()),
            cancel,
            logger,
        }
    }

    /// Share a lease registry, e.g. with another orchestrator on the same bench.
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<DeviceLockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    pub fn locks(&self) -> &Arc<DeviceLockRegistry> {
        &self.locks
    }

    /// Run every selected device and return one entry per device.
    pub fn run(&self, options: &FleetOptions) -> Result<FleetOutcome> {
        let started = Instant::now();
        let selected: Vec<DeviceEntry> =
            device::select(&self.config.devices, options.scope, &options.only)?
                .into_iter()
                .cloned()
                .collect();

        let reports_dir = options
            .reports_dir
            .clone()
            .unwrap_or_else(|| self.config.run.reports_dir.clone());
        if options.clean && reports_dir.exists() {
            fs::remove_dir_all(&reports_dir).map_err(|source| DvhError::io(&reports_dir, source))?;
        }
        fs::create_dir_all(&reports_dir).map_err(|source| DvhError::io(&reports_dir, source))?;

        let jobs = options
            .jobs
            .unwrap_or(self.config.run.jobs)
            .clamp(1, selected.len().max(1));

        self.logger.send(ActivityEvent::FleetStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash: self.config.stable_hash()?,
            scope: options.scope.as_str().to_string(),
            devices: selected.len(),
            jobs,
        });

        let mut entries = self.dispatch(&selected, &reports_dir, jobs)?;
        for (index, slot) in entries.iter_mut().enumerate() {
            if slot.is_none() {
                let descriptor = &selected[index].descriptor;
                let failure = RunFailure::new(
                    FailureKind::Runtime,
                    Phase::Primary,
                    "worker exited without reporting a result",
                );
                *slot = Some(ReportEntry::from_failures(descriptor.clone(), vec![failure]));
            }
        }

        Ok(FleetOutcome {
            entries: entries.into_iter().flatten().collect(),
            selected: selected.into_iter().map(|e| e.descriptor).collect(),
            reports_dir,
            duration_ms: millis(started.elapsed()),
        })
    }

    /// Run the fleet, aggregate its reports and write `fleet-summary.json`.
    pub fn run_and_aggregate(&self, options: &FleetOptions) -> Result<(FleetOutcome, FleetReport)> {
        let outcome = self.run(options)?;
        let report = aggregator::aggregate(&outcome.reports_dir, &outcome.selected)?;
        aggregator::write_summary(&outcome.reports_dir, &report)?;
        self.logger.send(ActivityEvent::FleetFinished {
            verdict: if report.passed() { "pass" } else { "fail" }.to_string(),
            failing_devices: report.failing().count(),
            missing_reports: report.missing.len(),
            duration_ms: outcome.duration_ms,
        });
        Ok((outcome, report))
    }

    fn dispatch(
        &self,
        selected: &[DeviceEntry],
        reports_dir: &Path,
        jobs: usize,
    ) -> Result<Vec<Option<ReportEntry>>> {
        let (work_tx, work_rx) = channel::bounded::<(usize, DeviceEntry)>(selected.len().max(1));
        let (result_tx, result_rx) = channel::unbounded::<(usize, ReportEntry)>();

        for (index, entry) in selected.iter().enumerate() {
            work_tx
                .send((index, entry.clone()))
                .map_err(|_| DvhError::ChannelClosed {
                    component: "fleet work queue",
                })?;
        }
        drop(work_tx);

        let mut handles = Vec::with_capacity(jobs);
        for worker in 0..jobs {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let ctx = RunContext {
                config: Arc::clone(&self.config),
                locks: Arc::clone(&self.locks),
                cancel: self.cancel.clone(),
                logger: self.logger.clone(),
                reports_dir: reports_dir.to_path_buf(),
            };
            let handle = thread::Builder::new()
                .name(format!("dvh-worker-{worker}"))
                .spawn(move || worker_thread(&work_rx, &result_tx, &ctx))
                .map_err(|e| DvhError::Runtime {
                    details: format!("failed to spawn fleet worker: {e}"),
                })?;
            handles.push(handle);
        }
        drop(result_tx);

        let mut entries: Vec<Option<ReportEntry>> = vec![None; selected.len()];
        for (index, entry) in result_rx {
            entries[index] = Some(entry);
        }
        for handle in handles {
            let _ = handle.join();
        }
        Ok(entries)
    }
}

/// Everything a worker needs, owned so it can move into the thread.
struct RunContext {
    config: Arc<HarnessConfig>,
    locks: Arc<DeviceLockRegistry>,
    cancel: CancelToken,
    logger: ActivityLoggerHandle,
    reports_dir: PathBuf,
}

fn worker_thread(
    work_rx: &channel::Receiver<(usize, DeviceEntry)>,
    result_tx: &channel::Sender<(usize, ReportEntry)>,
    ctx: &RunContext,
) {
    while let Ok((index, entry)) = work_rx.recv() {
        let descriptor = entry.descriptor.clone();
        let report = panic::catch_unwind(AssertUnwindSafe(|| run_device(ctx, entry)))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                let err = DvhError::Runtime {
                    details: format!("device run for {descriptor} panicked: {message}"),
                };
                ctx.logger.send(ActivityEvent::from_error(&err));
                let mut step = StepRecord::new(Phase::Primary, "run");
                step.failures
                    .push(RunFailure::new(FailureKind::Runtime, Phase::Primary, err.to_string()));
                finish(ctx, &descriptor, &[step], Instant::now())
            });
        if result_tx.send((index, report)).is_err() {
            return;
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// One device's full run under its lease.
fn run_device(ctx: &RunContext, entry: DeviceEntry) -> ReportEntry {
    let started = Instant::now();
    let descriptor = entry.descriptor.clone();

    let lease = match ctx.locks.acquire(&descriptor.machine, &ctx.cancel) {
        Ok(lease) => lease,
        Err(err) => return finish(ctx, &descriptor, &[interrupted_step(&err)], started),
    };
    if ctx.cancel.is_cancelled() {
        let err = DvhError::Interrupted {
            command: format!("run for {descriptor}"),
        };
        return finish(ctx, &descriptor, &[interrupted_step(&err)], started);
    }

    ctx.logger.send(ActivityEvent::RunStarted {
        device: descriptor.slug(),
        machine: descriptor.machine.clone(),
        channel: descriptor.channel.to_string(),
    });

    let report_dir = match tap::prepare_device_dir(&ctx.reports_dir, &descriptor) {
        Ok(dir) => dir,
        Err(err) => {
            ctx.logger.send(ActivityEvent::from_error(&err));
            let mut step = StepRecord::new(Phase::Report, "prepare report directory");
            step.failures
                .push(RunFailure::new(FailureKind::Runtime, Phase::Report, err.to_string()));
            return finish(ctx, &descriptor, &[step], started);
        }
    };

    let mut run = match ValidationRun::prepare(entry, &ctx.config, report_dir) {
        Ok(run) => run,
        Err(err) => {
            let mut step = StepRecord::new(Phase::Primary, "expand commands");
            step.failures
                .push(RunFailure::new(FailureKind::Runtime, Phase::Primary, err.to_string()));
            return finish(ctx, &descriptor, &[step], started);
        }
    };

    let host = LocalChannel::new(ctx.config.run.shell.clone());
    let device_channel = open_channel(
        run.device.remote.as_ref(),
        &ctx.config.run.shell,
        &ctx.config.reachability,
    );
    let budget = RunBudget::new(
        ctx.config.run.command_timeout(),
        ctx.config.run.run_timeout(),
    );
    let runner = ScenarioRunner::new(&host, device_channel.as_ref(), budget, &ctx.cancel);

    let slug = descriptor.slug();
    let mut log_step = |step: &StepRecord| {
        let error = step
            .result
            .is_none()
            .then(|| step.failures.first())
            .flatten()
            .map(|f| (f.kind.to_string(), f.expectation.clone()));
        ctx.logger.send(ActivityEvent::CommandFinished {
            device: slug.clone(),
            phase: step.phase.to_string(),
            command: step.command.clone().unwrap_or_default(),
            exit_code: step.result.as_ref().map(|r| r.exit_code),
            duration_ms: step.result.as_ref().map(|r| r.duration_ms),
            ok: step.passed(),
            error,
        });
    };
    run.execute(&runner, &ctx.config, &mut log_step);

    let entry = finish(ctx, &descriptor, run.steps(), started);
    drop(lease);
    entry
}

fn interrupted_step(err: &DvhError) -> StepRecord {
    let mut step = StepRecord::new(Phase::Primary, "run");
    step.failures.push(RunFailure::new(
        FailureKind::Interrupted,
        Phase::Primary,
        format!("run interrupted before it started: {err}"),
    ));
    step
}

/// Write the device's report and build its entry.
fn finish(
    ctx: &RunContext,
    descriptor: &DeviceDescriptor,
    steps: &[StepRecord],
    started: Instant,
) -> ReportEntry {
    let mut failures: Vec<RunFailure> = steps
        .iter()
        .flat_map(|step| step.failures.iter().cloned())
        .collect();

    match tap::write_device_report(&ctx.reports_dir, descriptor, steps) {
        Ok(path) => ctx.logger.send(ActivityEvent::ReportWritten {
            device: descriptor.slug(),
            path: path.display().to_string(),
        }),
        Err(err) => {
            eprintln!("[DVH-REPORT] {err}");
            ctx.logger.send(ActivityEvent::from_error(&err));
            failures.push(RunFailure::new(
                FailureKind::ReportMissing,
                Phase::Report,
                err.to_string(),
            ));
        }
    }

    let entry = ReportEntry::from_failures(descriptor.clone(), failures);
    ctx.logger.send(ActivityEvent::RunFinished {
        device: descriptor.slug(),
        ok: entry.failures.is_empty(),
        failures: entry.failure_lines.clone(),
        duration_ms: millis(started.elapsed()),
    });
    entry
}
