//! Device command channels: how device-side commands and reachability probes
//! reach a target, whether it is attached to the harness host or on the network.
//!
//! Both paths produce the same [`CommandResult`] shape so assertions never
//! care which transport was used.

#![allow(missing_docs)]

use std::collections::VecDeque;
use std::env;
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::config::ReachabilityConfig;
use crate::core::errors::{DvhError, Result};
use crate::fleet::device::RemoteTarget;
use crate::runner::cancel::CancelToken;
use crate::runner::command::{self, CommandResult, CommandSpec, millis};

/// Transport used to issue commands to one device.
pub trait DeviceChannel: Send + Sync {
    /// Short transport description for logs (`local`, `ssh torizon@10.0.0.7:22`).
    fn describe(&self) -> String;

    /// Run `command_line` on the device.
    fn run(
        &self,
        label: &str,
        command_line: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<CommandResult>;

    /// Block until the device accepts connections, up to `within`.
    ///
    /// Returns how long the wait took.
    fn wait_reachable(&self, within: Duration, cancel: &CancelToken) -> Result<Duration>;
}

/// Build the channel for a device: SSH when it has a remote target, the local
/// shell otherwise.
pub fn open_channel(
    remote: Option<&RemoteTarget>,
    shell: &str,
    reachability: &ReachabilityConfig,
) -> Box<dyn DeviceChannel> {
    match remote {
        Some(target) => Box::new(SshChannel::new(target.clone(), reachability.clone())),
        None => Box::new(LocalChannel::new(shell)),
    }
}

// ──────────────────── local ────────────────────

/// Host-attached target: commands run through the harness host's shell.
#[derive(Debug, Clone)]
pub struct LocalChannel {
    shell: String,
}

impl LocalChannel {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl DeviceChannel for LocalChannel {
    fn describe(&self) -> String {
        "local".to_string()
    }

    fn run(
        &self,
        label: &str,
        command_line: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<CommandResult> {
        command::execute(
            &CommandSpec::shell(label, &self.shell, command_line, timeout),
            cancel,
        )
    }

    fn wait_reachable(&self, _within: Duration, _cancel: &CancelToken) -> Result<Duration> {
        Ok(Duration::ZERO)
    }
}

// ──────────────────── ssh ────────────────────

/// Network target reached over `ssh` (through `sshpass -e` when a password
/// variable is configured).
#[derive(Debug, Clone)]
pub struct SshChannel {
    target: RemoteTarget,
    reachability: ReachabilityConfig,
}

impl SshChannel {
    pub fn new(target: RemoteTarget, reachability: ReachabilityConfig) -> Self {
        Self {
            target,
            reachability,
        }
    }

    /// Resolve the spawnable command for `command_line`.
    ///
    /// The password, when configured, travels only through the `SSHPASS`
    /// environment of the child; `display` never includes it.
    pub fn command_spec(
        &self,
        label: &str,
        command_line: &str,
        timeout: Duration,
    ) -> Result<CommandSpec> {
        self.command_spec_from(label, command_line, timeout, |name| env::var(name).ok())
    }

    fn command_spec_from<F>(
        &self,
        label: &str,
        command_line: &str,
        timeout: Duration,
        lookup: F,
    ) -> Result<CommandSpec>
    where
        F: Fn(&str) -> Option<String>,
    {
        let connect_secs = self.reachability.connect_timeout_ms.div_ceil(1000).max(1);
        let destination = format!("{}@{}", self.target.username, self.target.host);

        let mut ssh_args = vec![
            "-p".to_string(),
            self.target.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={connect_secs}"),
        ];

        let mut spec = CommandSpec {
            label: label.to_string(),
            program: "ssh".to_string(),
            args: Vec::new(),
            env: Vec::new(),
            timeout,
            display: format!("ssh {destination} -- {command_line}"),
        };

        if let Some(var) = &self.target.password_env {
            let password = lookup(var).ok_or_else(|| DvhError::InvalidConfig {
                details: format!(
                    "password variable {var} for {destination} is not set in the environment"
                ),
            })?;
            spec.program = "sshpass".to_string();
            spec.args.push("-e".to_string());
            spec.args.push("ssh".to_string());
            spec.env.push(("SSHPASS".to_string(), password));
        } else {
            ssh_args.push("-o".to_string());
            ssh_args.push("BatchMode=yes".to_string());
        }

        spec.args.extend(ssh_args);
        spec.args.push(destination);
        spec.args.push("--".to_string());
        spec.args.push(command_line.to_string());
        Ok(spec)
    }

    fn probe(&self) -> bool {
        let timeout = Duration::from_millis(self.reachability.connect_timeout_ms.max(1));
        let Ok(addrs) = (self.target.host.as_str(), self.target.port).to_socket_addrs() else {
            return false;
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
    }
}

impl DeviceChannel for SshChannel {
    fn describe(&self) -> String {
        format!(
            "ssh {}@{}:{}",
            self.target.username, self.target.host, self.target.port
        )
    }

    fn run(
        &self,
        label: &str,
        command_line: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<CommandResult> {
        let spec = self.command_spec(label, command_line, timeout)?;
        command::execute(&spec, cancel)
    }

    fn wait_reachable(&self, within: Duration, cancel: &CancelToken) -> Result<Duration> {
        let start = Instant::now();
        let poll = Duration::from_millis(self.reachability.poll_interval_ms.max(1));
        let settle = Duration::from_millis(self.reachability.settle_delay_ms).min(within);

        sleep_unless_cancelled(settle, cancel, &self.target.host)?;

        loop {
            if self.probe() {
                return Ok(start.elapsed());
            }
            let elapsed = start.elapsed();
            if elapsed >= within {
                return Err(DvhError::UnreachableDevice {
                    host: self.target.host.clone(),
                    port: self.target.port,
                    waited_ms: millis(elapsed),
                });
            }
            sleep_unless_cancelled(poll.min(within - elapsed), cancel, &self.target.host)?;
        }
    }
}

fn sleep_unless_cancelled(total: Duration, cancel: &CancelToken, host: &str) -> Result<()> {
    let deadline = Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            return Err(DvhError::Interrupted {
                command: format!("reachability wait for {host}"),
            });
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}

// ──────────────────── mock ────────────────────

/// Scripted channel for tests: replays queued results in order and records
/// every command it was asked to run.
#[derive(Debug, Default)]
pub struct MockChannel {
    results: Mutex<VecDeque<Result<CommandResult>>>,
    reachable: bool,
    calls: Mutex<Vec<String>>,
}

impl MockChannel {
    pub fn new(reachable: bool) -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            reachable,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful run with the given exit code and stdout.
    #[must_use]
    pub fn with_output(self, exit_code: i32, stdout: &str) -> Self {
        self.results.lock().push_back(Ok(CommandResult {
            exit_code,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            duration_ms: 1,
            output_truncated: false,
        }));
        self
    }

    /// Queue a run whose pipes were still held open when collection gave up.
    #[must_use]
    pub fn with_truncated_output(self, exit_code: i32, stdout: &str) -> Self {
        self.results.lock().push_back(Ok(CommandResult {
            exit_code,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            duration_ms: 1,
            output_truncated: true,
        }));
        self
    }

    /// Queue an error.
    #[must_use]
    pub fn with_error(self, error: DvhError) -> Self {
        self.results.lock().push_back(Err(error));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl DeviceChannel for MockChannel {
    fn describe(&self) -> String {
        "mock".to_string()
    }

    fn run(
        &self,
        _label: &str,
        command_line: &str,
        _timeout: Duration,
        _cancel: &CancelToken,
    ) -> Result<CommandResult> {
        self.calls.lock().push(command_line.to_string());
        self.results
            .lock()
            .pop_front()
            .unwrap_or_else(|| {
                Err(DvhError::Runtime {
                    details: format!("mock channel has no scripted result for {command_line:?}"),
                })
            })
    }

    fn wait_reachable(&self, within: Duration, _cancel: &CancelToken) -> Result<Duration> {
        if self.reachable {
            Ok(Duration::ZERO)
        } else {
            Err(DvhError::UnreachableDevice {
                host: "mock".to_string(),
                port: 0,
                waited_ms: millis(within),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    fn fast_reachability() -> ReachabilityConfig {
        ReachabilityConfig {
            poll_interval_ms: 20,
            connect_timeout_ms: 100,
            settle_delay_ms: 0,
        }
    }

    #[test]
    fn ssh_spec_uses_batch_mode_without_password() {
        let channel = SshChannel::new(
            RemoteTarget {
                host: "10.1.2.3".into(),
                port: 2222,
                username: "torizon".into(),
                password_env: None,
            },
            fast_reachability(),
        );
        let spec = channel
            .command_spec("probe", "exit 42", Duration::from_secs(5))
            .unwrap();
        assert_eq!(spec.program, "ssh");
        assert!(spec.args.contains(&"BatchMode=yes".to_string()));
        assert!(spec.args.windows(2).any(|w| w == ["-p", "2222"]));
        assert_eq!(spec.args.last().unwrap(), "exit 42");
        assert_eq!(spec.display, "ssh torizon@10.1.2.3 -- exit 42");
        assert!(spec.env.is_empty());
    }

    #[test]
    fn ssh_spec_passes_password_only_through_env() {
        let var = "DVH_TEST_SSH_PASSWORD";
        let channel = SshChannel::new(
            RemoteTarget {
                host: "dut.local".into(),
                password_env: Some(var.into()),
                ..RemoteTarget::default()
            },
            fast_reachability(),
        );
        let spec = channel
            .command_spec_from("probe", "true", Duration::from_secs(5), |name| {
                (name == var).then(|| "hunter2".to_string())
            })
            .unwrap();
        assert_eq!(spec.program, "sshpass");
        assert_eq!(&spec.args[..2], ["-e", "ssh"]);
        assert!(!spec.args.contains(&"BatchMode=yes".to_string()));
        assert_eq!(spec.env, vec![("SSHPASS".to_string(), "hunter2".to_string())]);
        assert!(!spec.display.contains("hunter2"));
        assert!(spec.args.iter().all(|a| !a.contains("hunter2")));
    }

    #[test]
    fn missing_password_variable_is_a_config_error() {
        let channel = SshChannel::new(
            RemoteTarget {
                host: "dut.local".into(),
                password_env: Some("DVH_TEST_UNSET_PASSWORD_VAR_93".into()),
                ..RemoteTarget::default()
            },
            fast_reachability(),
        );
        let err = channel
            .command_spec("probe", "true", Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err.code(), "DVH-1001");
    }

    #[test]
    fn reachability_succeeds_against_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let channel = SshChannel::new(
            RemoteTarget {
                host: "127.0.0.1".into(),
                port,
                ..RemoteTarget::default()
            },
            fast_reachability(),
        );
        let waited = channel
            .wait_reachable(Duration::from_secs(2), &CancelToken::new())
            .unwrap();
        assert!(waited < Duration::from_secs(2));
    }

    #[test]
    fn reachability_times_out_against_closed_port() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let channel = SshChannel::new(
            RemoteTarget {
                host: "127.0.0.1".into(),
                port,
                ..RemoteTarget::default()
            },
            fast_reachability(),
        );
        let err = channel
            .wait_reachable(Duration::from_millis(200), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DvhError::UnreachableDevice { .. }));
    }

    #[test]
    fn mock_replays_in_order_and_records_calls() {
        let mock = MockChannel::new(true)
            .with_output(0, "first")
            .with_output(42, "");
        let cancel = CancelToken::new();
        let a = mock.run("a", "cmd-a", Duration::from_secs(1), &cancel).unwrap();
        let b = mock.run("b", "cmd-b", Duration::from_secs(1), &cancel).unwrap();
        assert_eq!(a.stdout_lossy(), "first");
        assert_eq!(b.exit_code, 42);
        assert!(mock.run("c", "cmd-c", Duration::from_secs(1), &cancel).is_err());
        assert_eq!(mock.calls(), vec!["cmd-a", "cmd-b", "cmd-c"]);
    }

    #[cfg(unix)]
    #[test]
    fn local_channel_runs_through_shell() {
        let channel = LocalChannel::new("/bin/sh");
        let cancel = CancelToken::new();
        let result = channel
            .run("probe", "echo hi; exit 42", Duration::from_secs(5), &cancel)
            .unwrap();
        assert_eq!(result.exit_code, 42);
        assert_eq!(result.stdout_lossy(), "hi\n");
        assert_eq!(
            channel
                .wait_reachable(Duration::from_secs(1), &cancel)
                .unwrap(),
            Duration::ZERO
        );
    }
}
