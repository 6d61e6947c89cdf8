//! Subprocess launching and ownership.
//!
//! A [`ProcessHandle`] is the only owner of a spawned command. The child is
//! spawned with `kill_on_drop(true)`, so a handle dropped while its process is
//! still running (early return, panic, aborted request future) kills it.
//! [`ProcessHandle::terminate`] is the explicit, awaited version of the same
//! guarantee and is safe to call whether or not the process already exited.

use crate::env::ResolvedEnvironment;
use crate::error::CommandError;
use std::{
    path::Path,
    process::{ExitStatus, Stdio},
};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::debug;

/// Starts `argv[0]` with the given arguments, environment and working directory.
///
/// The environment is exactly `env`; nothing else leaks in from the server.
/// stdout and stderr are piped, stdin is closed.
pub fn spawn(
    argv: &[String],
    env: &ResolvedEnvironment,
    cwd: &Path,
) -> Result<ProcessHandle, CommandError> {
    let program = argv.first().cloned().unwrap_or_default();

    let child = Command::new(&program)
        .args(argv.iter().skip(1))
        .env_clear()
        .envs(env.iter())
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

    let pid = child.id();
    debug!(program = %program, pid = ?pid, cwd = %cwd.display(), "spawned subprocess");

    Ok(ProcessHandle {
        child,
        pid,
        program,
        status: None,
    })
}

/// Exclusive owner of one running (or finished) subprocess.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    program: String,
    status: Option<ExitStatus>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Exit status, once the process has been observed to exit.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Takes the stdout and stderr pipes. Can only succeed once.
    pub fn take_output(&mut self) -> Result<(ChildStdout, ChildStderr), CommandError> {
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or(CommandError::MissingOutput("stdout"))?;
        let stderr = self
            .child
            .stderr
            .take()
            .ok_or(CommandError::MissingOutput("stderr"))?;
        Ok((stdout, stderr))
    }

    /// Waits for the process to exit. Cancel safe.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.status = Some(status);
        Ok(status)
    }

    /// Kills the process unless it has already exited, then reaps it.
    ///
    /// Returns `true` if a kill was actually delivered. Calling this on an
    /// exited process is a no-op, not an error.
    pub async fn terminate(&mut self) -> std::io::Result<bool> {
        if self.status.is_some() {
            return Ok(false);
        }
        if let Some(status) = self.child.try_wait()? {
            self.status = Some(status);
            return Ok(false);
        }

        self.child.kill().await?;
        self.status = self.child.try_wait()?;
        debug!(
            program = %self.program,
            pid = ?self.pid,
            status = ?self.status,
            "killed subprocess"
        );
        Ok(true)
    }
}

/// Numeric exit code reported to callers. A process ended by a signal has no
/// code and is reported as `-1`.
pub fn exit_code(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
