use std::{
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use tokio::{
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::Notify,
};

use crate::{
    core::{
        domain::{ExecutionDescriptor, RunMode},
        errors::StartError,
    },
    native::workdir::WorkDir,
};

/// Spawns one interpreter process per run.
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    interpreter: PathBuf,
}

/// A freshly spawned child with its output pipes split off.
#[derive(Debug)]
pub struct Spawned {
    pub process: RunningProcess,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

impl ProcessRunner {
    pub fn new<T>(interpreter: T) -> Self
    where
        T: AsRef<Path>,
    {
        ProcessRunner {
            interpreter: interpreter.as_ref().into(),
        }
    }

    /// Runs the script in `workdir` as the interpreter's only argument.
    ///
    /// Stdin is closed, stdout/stderr are piped, and the child leads a new
    /// process group so the whole group can be signalled without touching
    /// ours.
    pub fn start(
        &self,
        descriptor: &ExecutionDescriptor,
        workdir: &WorkDir,
    ) -> Result<Spawned, StartError> {
        let mut child = Command::new(&self.interpreter)
            .arg(workdir.script())
            .current_dir(workdir.path())
            // Output printed before a timeout kill must still reach the pipe.
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => StartError::InterpreterNotFound {
                    interpreter: self.interpreter.display().to_string(),
                },
                _ => StartError::Spawn(e),
            })?;

        let pid = child.id().ok_or(StartError::MissingPid)?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(StartError::Spawn(io::Error::other("child pipes unavailable")));
        };

        tracing::info!(
            key = %descriptor.key,
            run_id = %descriptor.run_id,
            mode = %descriptor.mode,
            pid,
            "process spawned"
        );

        Ok(Spawned {
            process: RunningProcess { child, pid },
            stdout,
            stderr,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationCause {
    Exited,
    TimedOut,
    Stopped,
}

#[derive(Clone, Copy, Debug)]
pub struct Termination {
    pub status: ExitStatus,
    pub cause: TerminationCause,
    /// SIGTERM was not enough and the group had to be killed.
    pub forced: bool,
}

#[derive(Debug)]
pub struct RunningProcess {
    child: Child,
    pid: u32,
}

impl RunningProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Waits until the process is gone.
    ///
    /// One-shot runs are terminated once their deadline passes; any run is
    /// terminated as soon as `stop` is notified.
    pub async fn supervise(
        &mut self,
        mode: RunMode,
        grace: Duration,
        stop: &Notify,
    ) -> io::Result<Termination> {
        let deadline = async {
            match mode.deadline() {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let cause = tokio::select! {
            status = self.child.wait() => {
                return Ok(Termination {
                    status: status?,
                    cause: TerminationCause::Exited,
                    forced: false,
                });
            }
            _ = deadline => {
                tracing::info!(pid = self.pid, %mode, "deadline reached");
                TerminationCause::TimedOut
            }
            _ = stop.notified() => TerminationCause::Stopped,
        };

        let (status, forced) = self.terminate(grace).await?;
        Ok(Termination {
            status,
            cause,
            forced,
        })
    }

    /// SIGTERM to the group, then SIGKILL if it outlives `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<(ExitStatus, bool)> {
        self.signal_group(Signal::SIGTERM);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok((status?, false)),
            Err(_) => {
                tracing::warn!(pid = self.pid, ?grace, "process outlived grace period, killing");
                self.signal_group(Signal::SIGKILL);
                let _ = self.child.start_kill();
                Ok((self.child.wait().await?, true))
            }
        }
    }

    /// Kills whatever is left of the group once the child itself has exited.
    pub fn sweep(&self) {
        self.signal_group(Signal::SIGKILL);
    }

    fn signal_group(&self, signal: Signal) {
        match killpg(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) => tracing::debug!(pid = self.pid, ?signal, "signalled process group"),
            Err(Errno::ESRCH) => tracing::debug!(pid = self.pid, ?signal, "process group already gone"),
            Err(e) => tracing::warn!(pid = self.pid, ?signal, error = %e, "failed to signal process group"),
        }
    }
}
