//! Command execution, local or over SSH.
//!
//! Every dataset operation goes through [`Executor`]. Local commands are
//! spawned from argv directly; remote commands are composed into a single
//! shell-quoted string handed to `ssh <host>`. The two paths are never
//! mixed: quoting only ever applies to the remote string.
//!
//! [`Executor::pipe`] streams one command's stdout into another's stdin,
//! with both sides spawned up front and awaited together, so EOF propagates
//! as soon as the sender finishes and neither half can hang the other.

use crate::error::ExecError;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

/// A command bound to an endpoint: local when `host` is `None`, otherwise
/// executed via SSH on the named host.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub host: Option<String>,
    pub argv: Vec<String>,
}

impl CommandSpec {
    pub fn new(host: Option<&str>, argv: Vec<String>) -> Self {
        Self {
            host: host.map(str::to_owned),
            argv,
        }
    }
}

/// Captured result of a completed command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// The seam between the replication engine and the outside world.
///
/// The engine never inspects a host or builds a process itself; it hands
/// argv vectors to an executor. Tests substitute a scripted implementation.
#[allow(async_fn_in_trait)]
pub trait Executor {
    /// Run one command to completion, capturing stdout, stderr and the
    /// exit status. A non-zero exit is *not* an error at this level; the
    /// caller decides what the status means.
    async fn run(&self, host: Option<&str>, argv: &[String]) -> Result<CommandOutput, ExecError>;

    /// Stream `left`'s stdout into `right`'s stdin. Succeeds iff both
    /// sides exit zero. Sender failure is reported distinctly from
    /// receiver failure.
    async fn pipe(&self, left: &CommandSpec, right: &CommandSpec) -> Result<(), ExecError>;
}

/// Quote a single argument for a remote POSIX shell.
///
/// Wraps in single quotes, closing and reopening around any embedded
/// single quote. Dataset names never need this in practice, but the
/// remote path must be explicit about it.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Compose an argv into one remote shell string.
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Executor backed by real processes: plain argv locally, `ssh` remotely.
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor {
    /// Extra arguments inserted between `ssh` and the host, e.g.
    /// `-o BatchMode=yes` so an unattended run never blocks on a prompt.
    ssh_args: Vec<String>,
}

impl SystemExecutor {
    pub fn new() -> Self {
        Self {
            ssh_args: vec!["-o".to_string(), "BatchMode=yes".to_string()],
        }
    }

    fn build(&self, host: Option<&str>, argv: &[String]) -> Command {
        match host {
            None => {
                let mut cmd = Command::new(&argv[0]);
                cmd.args(&argv[1..]);
                cmd
            }
            Some(host) => {
                let mut cmd = Command::new("ssh");
                cmd.args(&self.ssh_args);
                cmd.arg(host);
                cmd.arg(shell_join(argv));
                cmd
            }
        }
    }
}

impl Executor for SystemExecutor {
    async fn run(&self, host: Option<&str>, argv: &[String]) -> Result<CommandOutput, ExecError> {
        debug!(host = host.unwrap_or("local"), cmd = %argv.join(" "), "running command");
        let mut cmd = self.build(host, argv);
        let out = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ExecError::Spawn {
                argv: argv.to_vec(),
                source,
            })?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            status: out.status.code().unwrap_or(-1),
        })
    }

    async fn pipe(&self, left: &CommandSpec, right: &CommandSpec) -> Result<(), ExecError> {
        debug!(
            sender = %left.argv.join(" "),
            receiver = %right.argv.join(" "),
            "running pipeline"
        );
        let mut lcmd = self.build(left.host.as_deref(), &left.argv);
        let mut rcmd = self.build(right.host.as_deref(), &right.argv);
        lcmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        rcmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut sender = lcmd.spawn().map_err(|source| ExecError::Spawn {
            argv: left.argv.clone(),
            source,
        })?;
        let mut receiver = rcmd.spawn().map_err(|source| ExecError::Spawn {
            argv: right.argv.clone(),
            source,
        })?;

        let mut sender_out = sender
            .stdout
            .take()
            .ok_or_else(|| ExecError::Bridge(std::io::Error::other("sender stdout missing")))?;
        let mut receiver_in = receiver
            .stdin
            .take()
            .ok_or_else(|| ExecError::Bridge(std::io::Error::other("receiver stdin missing")))?;
        let mut sender_err = sender.stderr.take();
        let mut receiver_err = receiver.stderr.take();
        let mut receiver_out = receiver.stdout.take();

        // The bridge closes the receiver's stdin the moment the sender's
        // stdout reaches EOF. Both stderr streams are drained concurrently
        // so neither child can block on a full pipe.
        let bridge = async {
            let copied = tokio::io::copy(&mut sender_out, &mut receiver_in).await;
            drop(receiver_in);
            copied
        };
        let sender_side = async {
            let mut captured = Vec::new();
            if let Some(e) = sender_err.as_mut() {
                let _ = e.read_to_end(&mut captured).await;
            }
            (sender.wait().await, captured)
        };
        let receiver_side = async {
            let mut captured = Vec::new();
            if let Some(e) = receiver_err.as_mut() {
                let _ = e.read_to_end(&mut captured).await;
            }
            let mut swallowed = Vec::new();
            if let Some(o) = receiver_out.as_mut() {
                let _ = o.read_to_end(&mut swallowed).await;
            }
            (receiver.wait().await, captured, swallowed)
        };

        let (copied, (sender_status, sender_stderr), (receiver_status, receiver_stderr, receiver_stdout)) =
            tokio::join!(bridge, sender_side, receiver_side);

        if !receiver_stdout.is_empty() {
            debug!(output = %String::from_utf8_lossy(&receiver_stdout).trim_end(), "receiver output");
        }

        let sender_status = sender_status.map_err(ExecError::Bridge)?;
        let receiver_status = receiver_status.map_err(ExecError::Bridge)?;

        // A sender that exits non-zero of its own accord is the root cause;
        // a sender killed by SIGPIPE after the receiver died is not. Report
        // the side that actually failed.
        match sender_status.code() {
            Some(0) | None => {}
            Some(status) if receiver_status.success() || !sender_stderr.is_empty() => {
                return Err(ExecError::SenderFailed {
                    status,
                    stderr: String::from_utf8_lossy(&sender_stderr).trim_end().to_string(),
                });
            }
            Some(_) => {}
        }
        if !receiver_status.success() {
            return Err(ExecError::ReceiverFailed {
                status: receiver_status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&receiver_stderr)
                    .trim_end()
                    .to_string(),
            });
        }
        if !sender_status.success() {
            return Err(ExecError::SenderFailed {
                status: sender_status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&sender_stderr).trim_end().to_string(),
            });
        }
        copied.map_err(ExecError::Bridge)?;
        Ok(())
    }
}
