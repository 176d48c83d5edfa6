use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::time;
use tracing::{debug, trace, warn};

/// Process group led by a spawned child.
///
/// Requires the child to have been spawned with `process_group(0)` so that its
/// PGID equals its PID. The PGID is captured at spawn time because tokio forgets
/// the PID once the leader has been reaped, while the group itself can outlive
/// the leader.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProcessGroup(Pid);

impl ProcessGroup {
    fn of(child: &Child) -> Option<Self> {
        let pid = i32::try_from(child.id()?).ok()?;
        Some(Self(Pid::from_raw(pid)))
    }

    /// Send `signal` to every process in the group. Returns `false` if the
    /// group no longer exists or the signal could not be delivered.
    pub(crate) fn signal(self, signal: Signal) -> bool {
        match killpg(self.0, signal) {
            Ok(()) => true,
            Err(errno) => {
                trace!(pgid = self.0.as_raw(), signal = signal.as_str(), %errno, "killpg failed");
                false
            }
        }
    }
}

/// The pipe ends of a child spawned with piped stdout and stderr.
pub(crate) struct Pipes {
    pub stdin: Option<ChildStdin>,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// A spawned child that must be reaped before it goes away.
///
/// Every path through a run ends in [`RunningProcess::wait`],
/// [`RunningProcess::kill`] or [`RunningProcess::terminate`]. If the owning
/// future is dropped first, `Drop` kills the whole group and tokio's
/// `kill_on_drop` hands the leader to the runtime's orphan reaper.
pub(crate) struct RunningProcess {
    child: Child,
    group: Option<ProcessGroup>,
    reaped: bool,
}

impl RunningProcess {
    pub(crate) fn new(child: Child) -> Self {
        let group = ProcessGroup::of(&child);
        Self {
            child,
            group,
            reaped: false,
        }
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub(crate) fn take_pipes(&mut self) -> io::Result<Pipes> {
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout is not piped"))?;
        let stderr = self
            .child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("child stderr is not piped"))?;
        Ok(Pipes {
            stdin: self.child.stdin.take(),
            stdout,
            stderr,
        })
    }

    /// Wait for the leader to exit. Not bounded; callers wrap it in a deadline.
    pub(crate) async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.reaped = true;
        Ok(status)
    }

    /// SIGKILL the group and reap the leader.
    pub(crate) async fn kill(&mut self) {
        self.signal_group(Signal::SIGKILL);
        // Covers a leader that moved itself out of its group.
        let _ = self.child.start_kill();
        self.reap().await;
    }

    /// SIGTERM the group, give the leader `grace` to exit, then SIGKILL
    /// whatever is left of the group and reap the leader.
    pub(crate) async fn terminate(&mut self, grace: Duration) {
        if self.signal_group(Signal::SIGTERM) {
            match time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => {
                    self.reaped = true;
                    debug!(?status, "process exited after SIGTERM");
                }
                Ok(Err(e)) => warn!(error = %e, "wait after SIGTERM failed"),
                Err(_) => debug!(grace_ms = grace.as_millis(), "SIGTERM grace period elapsed"),
            }
        }
        self.kill().await;
    }

    fn signal_group(&self, signal: Signal) -> bool {
        self.group.is_some_and(|group| group.signal(signal))
    }

    async fn reap(&mut self) {
        if self.reaped {
            return;
        }
        match self.child.wait().await {
            Ok(status) => {
                self.reaped = true;
                trace!(?status, "reaped child");
            }
            Err(e) => warn!(error = %e, "failed to reap child"),
        }
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        if !self.reaped {
            debug!(pid = ?self.child.id(), "dropping unreaped child; killing process group");
            self.signal_group(Signal::SIGKILL);
        }
    }
}

/// Translate a raw exit status into a code or a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    Exited(i32),
    Signaled(i32),
}

impl From<ExitStatus> for Termination {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signal)) => Self::Signaled(signal),
            // Stopped/continued statuses are never returned by wait().
            (None, None) => Self::Exited(-1),
        }
    }
}

/// Name of a signal number, e.g. `SIGSEGV`.
pub(crate) fn signal_name(signal: i32) -> &'static str {
    Signal::try_from(signal)
        .map(Signal::as_str)
        .unwrap_or("unknown signal")
}
