//! Activity logger: a dedicated thread owns the [`JsonlWriter`].
//!
//! Fleet workers send [`ActivityEvent`]s over a bounded crossbeam channel.
//! `send()` uses `try_send()`, so a slow disk never stalls a device run; events
//! that do not fit are counted and reported as a warning line.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{DvhError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity, new_run_id};

/// Default bounded channel capacity for log events.
const CHANNEL_CAPACITY: usize = 1024;

/// Events emitted during a fleet run.
#[derive(Debug, Clone)]
pub enum ActivityEvent {
    FleetStarted {
        version: String,
        config_hash: String,
        scope: String,
        devices: usize,
        jobs: usize,
    },
    RunStarted {
        device: String,
        machine: String,
        channel: String,
    },
    CommandFinished {
        device: String,
        phase: String,
        command: String,
        exit_code: Option<i32>,
        duration_ms: Option<u64>,
        ok: bool,
        /// `(code, message)` when the command could not produce a result.
        error: Option<(String, String)>,
    },
    RunFinished {
        device: String,
        ok: bool,
        failures: Vec<String>,
        duration_ms: u64,
    },
    ReportWritten {
        device: String,
        path: String,
    },
    FleetFinished {
        verdict: String,
        failing_devices: usize,
        missing_reports: usize,
        duration_ms: u64,
    },
    Error {
        code: String,
        message: String,
    },
    /// Sentinel to request graceful shutdown of the logger thread.
    Shutdown,
}

impl ActivityEvent {
    /// Error event carrying the code of a library error.
    #[must_use]
    pub fn from_error(err: &DvhError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Thread-safe, cheaply-cloneable handle for sending log events.
#[derive(Debug, Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Send an event to the logger thread. Non-blocking.
    ///
    /// If the channel is full the event is dropped and counted.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        // Disconnected is fine during shutdown.
    }

    /// Number of events dropped due to channel back-pressure.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Request graceful shutdown. Join the thread handle to wait for the flush.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }

    /// A handle whose events go nowhere, for library callers without a log.
    #[must_use]
    pub fn disabled() -> Self {
        let (tx, _rx) = bounded(1);
        Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Options for the activity logger.
#[derive(Debug, Clone)]
pub struct ActivityLoggerConfig {
    pub jsonl_config: JsonlConfig,
    pub channel_capacity: usize,
    /// Stamped on every line this logger writes.
    pub run_id: String,
}

impl Default for ActivityLoggerConfig {
    fn default() -> Self {
        Self {
            jsonl_config: JsonlConfig::default(),
            channel_capacity: CHANNEL_CAPACITY,
            run_id: new_run_id(),
        }
    }
}

/// Spawn the logger thread and return a handle.
///
/// The thread runs until `handle.shutdown()` is called or all senders drop.
pub fn spawn_logger(
    config: ActivityLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_clone = Arc::clone(&dropped);

    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: dropped,
    };

    let join = thread::Builder::new()
        .name("dvh-logger".to_string())
        .spawn(move || {
            logger_thread_main(&rx, &config.jsonl_config, config.run_id, &dropped_clone);
        })
        .map_err(|e| DvhError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

fn logger_thread_main(
    rx: &Receiver<ActivityEvent>,
    jsonl_config: &JsonlConfig,
    run_id: String,
    dropped: &AtomicU64,
) {
    let mut jsonl = JsonlWriter::open(jsonl_config, run_id);

    while let Ok(event) = rx.recv() {
        let d = dropped.swap(0, Ordering::Relaxed);
        if d > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.details = Some(format!("{d} log events dropped due to back-pressure"));
            jsonl.write_entry(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        jsonl.write_entry(&event_to_log_entry(&event));
    }

    jsonl.finish();
}

fn event_to_log_entry(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::FleetStarted {
            version,
            config_hash,
            scope,
            devices,
            jobs,
        } => {
            let mut e = LogEntry::new(EventType::FleetStart, Severity::Info);
            e.details = Some(format!(
                "version={version} config_hash={config_hash} scope={scope} devices={devices} jobs={jobs}"
            ));
            e.ok = Some(true);
            e
        }
        ActivityEvent::RunStarted {
            device,
            machine,
            channel,
        } => {
            let mut e = LogEntry::new(EventType::RunStart, Severity::Info);
            e.device = Some(device.clone());
            e.machine = Some(machine.clone());
            e.channel = Some(channel.clone());
            e
        }
        ActivityEvent::CommandFinished {
            device,
            phase,
            command,
            exit_code,
            duration_ms,
            ok,
            error,
        } => {
            let severity = if *ok { Severity::Info } else { Severity::Warning };
            let mut e = LogEntry::new(EventType::CommandFinish, severity);
            e.device = Some(device.clone());
            e.phase = Some(phase.clone());
            e.command = Some(command.clone());
            e.exit_code = *exit_code;
            e.duration_ms = *duration_ms;
            e.ok = Some(*ok);
            if let Some((code, message)) = error {
                e.error_code = Some(code.clone());
                e.error_message = Some(message.clone());
            }
            e
        }
        ActivityEvent::RunFinished {
            device,
            ok,
            failures,
            duration_ms,
        } => {
            let severity = if *ok { Severity::Info } else { Severity::Warning };
            let mut e = LogEntry::new(EventType::RunFinish, severity);
            e.device = Some(device.clone());
            e.ok = Some(*ok);
            e.duration_ms = Some(*duration_ms);
            if !failures.is_empty() {
                e.details = Some(failures.join("; "));
            }
            e
        }
        ActivityEvent::ReportWritten { device, path } => {
            let mut e = LogEntry::new(EventType::ReportWritten, Severity::Info);
            e.device = Some(device.clone());
            e.details = Some(path.clone());
            e.ok = Some(true);
            e
        }
        ActivityEvent::FleetFinished {
            verdict,
            failing_devices,
            missing_reports,
            duration_ms,
        } => {
            let ok = verdict == "pass";
            let severity = if ok { Severity::Info } else { Severity::Critical };
            let mut e = LogEntry::new(EventType::FleetFinish, severity);
            e.ok = Some(ok);
            e.duration_ms = Some(*duration_ms);
            e.details = Some(format!(
                "verdict={verdict} failing_devices={failing_devices} missing_reports={missing_reports}"
            ));
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::FleetFinish, Severity::Info),
    }
}
