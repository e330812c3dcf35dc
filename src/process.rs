//! The process-control capability used by the job-control core.

use crate::launch::LaunchPlan;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, setpgid};
use tracing::debug;

/// A state change of one child, as reported by `waitpid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEvent {
    Exited(Pid, i32),
    Signaled(Pid, Signal),
    Stopped(Pid, Signal),
    Continued(Pid),
}

impl ChildEvent {
    pub fn pid(&self) -> Pid {
        match *self {
            ChildEvent::Exited(pid, _)
            | ChildEvent::Signaled(pid, _)
            | ChildEvent::Stopped(pid, _)
            | ChildEvent::Continued(pid) => pid,
        }
    }

    fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(pid, code) => Some(ChildEvent::Exited(pid, code)),
            WaitStatus::Signaled(pid, sig, _) => Some(ChildEvent::Signaled(pid, sig)),
            WaitStatus::Stopped(pid, sig) => Some(ChildEvent::Stopped(pid, sig)),
            WaitStatus::Continued(pid) => Some(ChildEvent::Continued(pid)),
            _ => None,
        }
    }
}

/// Creating, grouping, signalling and waiting on child processes.
///
/// The job-control algorithms only talk to the OS through this trait so they can be
/// exercised against a fake in tests.
pub trait ProcessControl: Send + Sync {
    /// Creates a child running `plan`. The child side never returns into the caller.
    fn spawn(&self, plan: &LaunchPlan) -> Result<Pid, Errno>;

    /// Puts `pid` into process group `pgid`.
    fn set_group(&self, pid: Pid, pgid: Pid) -> Result<(), Errno>;

    /// Sends `signal` to every process in group `pgid`.
    fn signal_group(&self, pgid: Pid, signal: Signal) -> Result<(), Errno>;

    /// Blocks until `pid` stops or terminates.
    fn wait_for(&self, pid: Pid) -> Result<ChildEvent, Errno>;

    /// Returns a pending state change of any child without blocking.
    ///
    /// `Ok(None)` means children exist but none has changed state; `Err(ECHILD)` means
    /// there are no children left at all.
    fn try_wait_any(&self) -> Result<Option<ChildEvent>, Errno>;
}

/// [`ProcessControl`] backed by `fork`/`execvp`/`waitpid`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixProcesses;

impl ProcessControl for UnixProcesses {
    fn spawn(&self, plan: &LaunchPlan) -> Result<Pid, Errno> {
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                debug!(
                    pid = %child,
                    command = plan.command_line(),
                    foreground = plan.is_foreground(),
                    "forked"
                );
                Ok(child)
            }
            ForkResult::Child => plan.exec_child(),
        }
    }

    fn set_group(&self, pid: Pid, pgid: Pid) -> Result<(), Errno> {
        setpgid(pid, pgid)
    }

    fn signal_group(&self, pgid: Pid, signal: Signal) -> Result<(), Errno> {
        killpg(pgid, signal)
    }

    fn wait_for(&self, pid: Pid) -> Result<ChildEvent, Errno> {
        loop {
            match waitpid(pid, Some(WaitPidFlag::WUNTRACED)) {
                Ok(status) => {
                    if let Some(event) = ChildEvent::from_wait_status(status) {
                        return Ok(event);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno),
            }
        }
    }

    fn try_wait_any(&self) -> Result<Option<ChildEvent>, Errno> {
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        loop {
            match waitpid(Pid::from_raw(-1), Some(flags)) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(status) => {
                    if let Some(event) = ChildEvent::from_wait_status(status) {
                        return Ok(Some(event));
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno),
            }
        }
    }
}
