//! Ownership of the controlling terminal.
//!
//! Handoff is best-effort: without a controlling terminal (say, stdin is a pipe) every
//! call fails with a [`TerminalError`] that callers log and otherwise ignore, and job
//! control carries on with process-group signalling alone.

use nix::errno::Errno;
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::unistd::{Pid, getpgrp, getpid, setpgid, tcgetpgrp, tcsetpgrp};
use std::io::IsTerminal;
use std::os::fd::{BorrowedFd, RawFd};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminalError {
    #[error("no controlling terminal")]
    NotATerminal,
    #[error("cannot hand terminal to process group {pgid}: {source}")]
    Handoff { pgid: Pid, source: Errno },
    #[error("interactive setup failed: {0}")]
    Setup(Errno),
}

/// Moves the controlling terminal between process groups.
pub trait TerminalControl: Send + Sync {
    /// Makes `pgid` the terminal's foreground process group.
    fn grant(&self, pgid: Pid) -> Result<(), TerminalError>;

    /// Hands the terminal back to the interpreter's own group.
    fn reclaim(&self, shell_pgid: Pid) -> Result<(), TerminalError>;

    /// Current foreground process group, if there is a terminal.
    fn owner(&self) -> Option<Pid>;
}

/// [`TerminalControl`] over a terminal file descriptor, stdin by default.
#[derive(Debug, Clone, Copy)]
pub struct UnixTerminal {
    fd: RawFd,
}

impl Default for UnixTerminal {
    fn default() -> Self {
        Self {
            fd: libc::STDIN_FILENO,
        }
    }
}

impl UnixTerminal {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    fn borrowed(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }

    pub fn is_interactive(&self) -> bool {
        self.borrowed().is_terminal()
    }

    /// One-time setup of an interactive interpreter.
    ///
    /// Ignores the job-control signals in the interpreter itself, makes it the leader
    /// of its own process group and takes the terminal. Returns the interpreter's group.
    pub fn take_control(&self) -> Result<Pid, TerminalError> {
        if !self.is_interactive() {
            return Err(TerminalError::NotATerminal);
        }

        // Wait until we are in the foreground before touching anything.
        loop {
            let pgrp = getpgrp();
            match tcgetpgrp(self.borrowed()) {
                Ok(owner) if owner == pgrp => break,
                Ok(_) => {
                    nix::sys::signal::killpg(pgrp, Signal::SIGTTIN).map_err(TerminalError::Setup)?
                }
                Err(errno) => return Err(TerminalError::Setup(errno)),
            }
        }

        for sig in [
            Signal::SIGINT,
            Signal::SIGQUIT,
            Signal::SIGTSTP,
            Signal::SIGTTIN,
            Signal::SIGTTOU,
        ] {
            unsafe { signal(sig, SigHandler::SigIgn) }.map_err(TerminalError::Setup)?;
        }

        let shell_pid = getpid();
        match setpgid(shell_pid, shell_pid) {
            // Already a session leader: it is its own group anyway.
            Ok(()) | Err(Errno::EPERM) => {}
            Err(errno) => return Err(TerminalError::Setup(errno)),
        }
        let shell_pgid = getpgrp();
        self.grant(shell_pgid)?;
        debug!(pgid = %shell_pgid, "took control of the terminal");
        Ok(shell_pgid)
    }
}

impl TerminalControl for UnixTerminal {
    fn grant(&self, pgid: Pid) -> Result<(), TerminalError> {
        tcsetpgrp(self.borrowed(), pgid).map_err(|errno| match errno {
            Errno::ENOTTY => TerminalError::NotATerminal,
            source => TerminalError::Handoff { pgid, source },
        })
    }

    fn reclaim(&self, shell_pgid: Pid) -> Result<(), TerminalError> {
        self.grant(shell_pgid)
    }

    fn owner(&self) -> Option<Pid> {
        tcgetpgrp(self.borrowed()).ok()
    }
}

/// [`TerminalControl`] for running without job control: every handoff is refused.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTerminal;

impl TerminalControl for NoTerminal {
    fn grant(&self, _pgid: Pid) -> Result<(), TerminalError> {
        Err(TerminalError::NotATerminal)
    }

    fn reclaim(&self, _shell_pgid: Pid) -> Result<(), TerminalError> {
        Err(TerminalError::NotATerminal)
    }

    fn owner(&self) -> Option<Pid> {
        None
    }
}

/// Scoped terminal ownership for a foreground job.
///
/// Creating a lease grants the terminal to the job's group; dropping it gives the
/// terminal back to the interpreter, whichever way the holder's scope is left.
pub struct TerminalLease<'a> {
    terminal: &'a dyn TerminalControl,
    shell_pgid: Pid,
}

impl<'a> TerminalLease<'a> {
    pub fn grant(terminal: &'a dyn TerminalControl, pgid: Pid, shell_pgid: Pid) -> Self {
        if let Err(err) = terminal.grant(pgid) {
            log_failure("grant", &err);
        }
        Self {
            terminal,
            shell_pgid,
        }
    }
}

impl Drop for TerminalLease<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.terminal.reclaim(self.shell_pgid) {
            log_failure("reclaim", &err);
        }
    }
}

fn log_failure(op: &str, err: &TerminalError) {
    match err {
        // Normal when running non-interactively.
        TerminalError::NotATerminal => debug!(op, "terminal handoff skipped: {err}"),
        _ => warn!(op, "terminal handoff failed: {err}"),
    }
}
