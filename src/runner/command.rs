//! Bounded external command execution with full output capture.
//!
//! Each command runs in its own process group with piped stdout/stderr drained
//! by reader threads into shared buffers, so a chatty child never blocks on a
//! full pipe and bytes already read survive a reader that never sees EOF. The parent polls `try_wait`; on deadline or
//! interrupt the whole group is killed, so helper processes spawned by the
//! deployment tool (ssh, rsync, ...) do not outlive the step.

#![allow(missing_docs)]

use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use memchr::memmem;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{DvhError, Result};
use crate::runner::cancel::CancelToken;

/// How often the parent checks for exit, deadline and interrupt.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to wait for output readers after the child exited before
/// killing lingering group members that still hold the pipes open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

type Capture = Arc<Mutex<Vec<u8>>>;

/// A fully resolved command, ready to spawn.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Short step name used in logs and reports (e.g. `primary`).
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    /// Human-readable form for logs and errors. Never contains secrets.
    pub display: String,
}

impl CommandSpec {
    /// `shell -c <command_line>` on the harness host.
    pub fn shell(
        label: impl Into<String>,
        shell: &str,
        command_line: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            program: shell.to_string(),
            args: vec!["-c".to_string(), command_line.to_string()],
            env: Vec::new(),
            timeout,
            display: command_line.to_string(),
        }
    }

    /// Same command with a tighter bound, never a looser one.
    #[must_use]
    pub fn bounded_by(mut self, limit: Duration) -> Self {
        self.timeout = self.timeout.min(limit);
        self
    }
}

/// Outcome of one executed command. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Literal process exit code; `128 + signo` when killed by a signal.
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
    /// A process outside the killed group (e.g. started with `setsid`) kept
    /// the pipes open past the drain grace; output is what was read until then.
    #[serde(default)]
    pub output_truncated: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Substring search across stdout followed by stderr.
    pub fn output_contains(&self, needle: &str) -> bool {
        let finder = memmem::Finder::new(needle.as_bytes());
        finder.find(&self.stdout).is_some() || finder.find(&self.stderr).is_some()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run `spec` to completion, honoring its timeout and the cancel token.
///
/// Fails with [`DvhError::TimeoutExceeded`] when the bound elapses and with
/// [`DvhError::Interrupted`] when `cancel` trips; in both cases the process
/// group has been killed and reaped before returning.
pub fn execute(spec: &CommandSpec, cancel: &CancelToken) -> Result<CommandResult> {
    if cancel.is_cancelled() {
        return Err(DvhError::Interrupted {
            command: spec.display.clone(),
        });
    }

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|source| DvhError::Spawn {
        command: spec.display.clone(),
        source,
    })?;

    let stdout = Capture::default();
    let stderr = Capture::default();
    let (done_tx, done_rx) = bounded::<()>(2);
    let mut readers = 0;
    if let Some(pipe) = child.stdout.take() {
        spawn_reader(pipe, Arc::clone(&stdout), done_tx.clone());
        readers += 1;
    }
    if let Some(pipe) = child.stderr.take() {
        spawn_reader(pipe, Arc::clone(&stderr), done_tx.clone());
        readers += 1;
    }
    drop(done_tx);

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(source) => {
                terminate(&mut child);
                return Err(DvhError::Runtime {
                    details: format!("waiting for {:?} failed: {source}", spec.display),
                });
            }
        }

        if start.elapsed() >= spec.timeout {
            terminate(&mut child);
            return Err(DvhError::TimeoutExceeded {
                command: spec.display.clone(),
                timeout_ms: millis(spec.timeout),
            });
        }
        if cancel.is_cancelled() {
            terminate(&mut child);
            return Err(DvhError::Interrupted {
                command: spec.display.clone(),
            });
        }

        thread::sleep(POLL_INTERVAL);
    };

    let drained = wait_for_readers(&done_rx, readers, child.id());

    // A reader still blocked on a held pipe may append later; take what is there.
    let stdout = std::mem::take(&mut *stdout.lock());
    let stderr = std::mem::take(&mut *stderr.lock());
    Ok(CommandResult {
        exit_code: exit_code(status),
        stdout,
        stderr,
        duration_ms: millis(start.elapsed()),
        output_truncated: !drained,
    })
}

fn spawn_reader<R>(mut source: R, sink: Capture, done: Sender<()>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut chunk = [0_u8; READ_CHUNK];
        loop {
            match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        let _ = done.send(());
    });
}

/// Wait until every reader hit EOF. Returns `false` when some pipe is still
/// held open after the group was killed and a second grace period passed.
fn wait_for_readers(done: &Receiver<()>, expected: usize, pid: u32) -> bool {
    let mut finished = 0;
    let mut killed_stragglers = false;

    while finished < expected {
        match done.recv_timeout(DRAIN_GRACE) {
            Ok(()) => finished += 1,
            Err(RecvTimeoutError::Timeout) if !killed_stragglers => {
                // Background children inherited the pipes; reap them so the
                // readers reach EOF.
                kill_group(pid);
                killed_stragglers = true;
            }
            Err(_) => return false,
        }
    }
    true
}

fn terminate(child: &mut Child) {
    if !kill_group(child.id()) {
        let _ = child.kill();
    }
    let _ = child.wait();
}

#[cfg(unix)]
fn kill_group(pid: u32) -> bool {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    i32::try_from(pid).is_ok_and(|raw| killpg(Pid::from_raw(raw), Signal::SIGKILL).is_ok())
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) -> bool {
    false
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
