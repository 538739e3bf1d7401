// FQLab: Network-Emulation Experiments for Fair-Queuing Detection in Congestion Control
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Supervision of a single external process: spawn, graceful termination, and reaping with
//! full output collection.

use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn `{label}`: {source}")]
    Spawn {
        label: String,
        source: std::io::Error,
    },
    #[error("failed to reap `{label}`: {source}")]
    Reap {
        label: String,
        source: std::io::Error,
    },
    #[error("`{label}` was already reaped")]
    AlreadyReaped { label: String },
}

/// Liveness of a supervised process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Terminated,
    Reaped,
}

/// The collected output of a reaped process. Streams are drained exactly once, after exit.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// A single supervised external process.
///
/// Each `Supervised` owns exactly one child and is responsible for reaping it: call
/// [`Supervised::terminate`] (or let the process exit on its own) and then
/// [`Supervised::join`] before dropping the value. Dropping a still-running child is a
/// bug in the caller and is logged as such; the child is then killed as a backstop.
#[derive(Debug)]
pub struct Supervised {
    label: String,
    child: Option<Child>,
    liveness: Liveness,
}

impl Supervised {
    /// Spawn `cmd` with both output streams piped. Does not block past process creation.
    ///
    /// The `label` only names the process in logs and errors.
    pub fn spawn(label: impl Into<String>, mut cmd: Command) -> Result<Self, SupervisorError> {
        let label = label.into();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::debug!("[{label}] spawning {:?}", cmd.as_std());
        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            label: label.clone(),
            source,
        })?;

        Ok(Self {
            label,
            child: Some(child),
            liveness: Liveness::Running,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    /// Send a graceful stop signal (SIGTERM). Idempotent: terminating a process that has
    /// already been terminated or reaped is a no-op.
    ///
    /// SIGTERM rather than SIGKILL, so that capture processes get to flush their output
    /// files before exiting.
    pub fn terminate(&mut self) {
        if self.liveness != Liveness::Running {
            return;
        }
        if let Some(id) = self.child.as_ref().and_then(Child::id) {
            log::debug!("[{}] sending SIGTERM to pid {id}", self.label);
            // a stale pid makes kill(2) fail; join() reports the actual outcome
            unsafe { libc::kill(id as i32, libc::SIGTERM) };
        }
        self.liveness = Liveness::Terminated;
    }

    /// Wait for the process to exit and drain both output streams.
    ///
    /// Called without a prior [`Supervised::terminate`], this blocks until the process
    /// exits on its own; the client process uses this, as its natural completion signals
    /// that the transfer is done.
    pub async fn join(&mut self) -> Result<ProcessOutput, SupervisorError> {
        let child = self.child.take().ok_or_else(|| SupervisorError::AlreadyReaped {
            label: self.label.clone(),
        })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| SupervisorError::Reap {
                label: self.label.clone(),
                source,
            })?;
        self.liveness = Liveness::Reaped;

        log::debug!("[{}] exited with {}", self.label, output.status);
        Ok(ProcessOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl Drop for Supervised {
    fn drop(&mut self) {
        if self.child.is_some() && self.liveness == Liveness::Running {
            log::error!(
                "[{}] dropped while still running; the child is killed, but its output is lost",
                self.label
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn command(program: &str, args: &[&str]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    }

    #[tokio::test]
    async fn join_collects_stdout() {
        let mut proc = Supervised::spawn("echo", command("echo", &["hello"])).unwrap();
        let output = proc.join().await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.stderr, "");
        assert_eq!(proc.liveness(), Liveness::Reaped);
    }

    #[tokio::test]
    async fn join_blocks_until_natural_exit() {
        let mut proc = Supervised::spawn(
            "sh",
            command("sh", &["-c", "sleep 0.2 && echo done"]),
        )
        .unwrap();
        let output = proc.join().await.unwrap();
        assert_eq!(output.stdout, "done\n");
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let mut proc = Supervised::spawn("sleep", command("sleep", &["10"])).unwrap();
        proc.terminate();
        proc.terminate();
        assert_eq!(proc.liveness(), Liveness::Terminated);
        let output = proc.join().await.unwrap();
        // killed by SIGTERM, not a clean exit
        assert!(!output.status.success());
        proc.terminate(); // no-op after reaping
    }

    #[tokio::test]
    async fn double_join_fails() {
        let mut proc = Supervised::spawn("true", command("true", &[])).unwrap();
        proc.join().await.unwrap();
        assert!(matches!(
            proc.join().await,
            Err(SupervisorError::AlreadyReaped { .. })
        ));
    }

    #[tokio::test]
    async fn spawn_missing_binary_fails() {
        assert!(matches!(
            Supervised::spawn("nope", command("/nonexistent/binary", &[])),
            Err(SupervisorError::Spawn { .. })
        ));
    }
}
