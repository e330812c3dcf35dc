//! Everything a forked child needs, prepared ahead of the fork, and the child side
//! of a launch.
//!
//! After `fork` the child may only make async-signal-safe calls, so no allocation
//! happens there: argument vectors, redirection paths and diagnostic prefixes are
//! all built into a [`LaunchPlan`] by the parent beforehand.

use crate::redirect::{Redirect, Resolved};
use nix::errno::Errno;
use nix::fcntl::{OFlag, open};
use nix::sys::signal::{SigHandler, SigSet, SigmaskHow, Signal, signal, sigprocmask};
use nix::unistd::{Pid, close, dup2, execvp, getpid, setpgid, tcsetpgrp};
use std::ffi::{CString, NulError};
use std::os::fd::{BorrowedFd, RawFd};
use thiserror::Error;

/// Exit status of a child whose program could not be found.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit status of a child whose program exists but could not be executed.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;
/// Exit status of a child that failed to open a redirection target.
pub const EXIT_REDIRECT_FAILED: i32 = 1;

const DIAG_PREFIX: &str = "job_shell: ";

/// Signals the interpreter handles itself and the child must see at their defaults.
const RESET_SIGNALS: [Signal; 6] = [
    Signal::SIGINT,
    Signal::SIGTSTP,
    Signal::SIGQUIT,
    Signal::SIGCHLD,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("empty command")]
    Empty,
    #[error("argument contains a NUL byte: {0:?}")]
    Nul(String),
}

#[derive(Debug)]
struct PreparedRedirect {
    path: CString,
    flags: OFlag,
    target: RawFd,
    diag: Vec<u8>,
}

/// A fully prepared command, ready to be handed to [`crate::ProcessControl::spawn`].
#[derive(Debug)]
pub struct LaunchPlan {
    argv: Vec<CString>,
    redirects: Vec<PreparedRedirect>,
    foreground: bool,
    claim_terminal: bool,
    command_line: String,
    not_found: Vec<u8>,
    exec_failed: Vec<u8>,
}

impl LaunchPlan {
    pub fn new(resolved: &Resolved, background: bool) -> Result<Self, PlanError> {
        let program = resolved.argv.first().ok_or(PlanError::Empty)?;

        let argv = resolved
            .argv
            .iter()
            .map(|arg| cstring(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let redirects = resolved
            .redirects
            .iter()
            .map(prepare_redirect)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            argv,
            redirects,
            foreground: !background,
            claim_terminal: !background,
            command_line: command_line(resolved),
            not_found: format!("{DIAG_PREFIX}{program}: command not found\n").into_bytes(),
            exec_failed: format!("{DIAG_PREFIX}{program}: ").into_bytes(),
        })
    }

    pub fn program(&self) -> &str {
        self.argv
            .first()
            .and_then(|arg| arg.to_str().ok())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn args(&self) -> impl Iterator<Item = &str> {
        self.argv.iter().filter_map(|arg| arg.to_str().ok())
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground
    }

    /// Keeps the child from taking the terminal even when it runs in the foreground.
    pub fn without_terminal(mut self) -> Self {
        self.claim_terminal = false;
        self
    }

    /// Text shown for this command under `jobs`.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Runs in the freshly forked child and never returns.
    ///
    /// Order matters: the child leaves the interpreter's process group and, when it is
    /// a foreground job under job control, takes the terminal before anything else can
    /// produce terminal I/O. Only then are signal dispositions reset and the
    /// redirections applied.
    pub fn exec_child(&self) -> ! {
        let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
        if self.claim_terminal {
            let stdin = unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) };
            let _ = tcsetpgrp(stdin, getpid());
        }

        for sig in RESET_SIGNALS {
            let _ = unsafe { signal(sig, SigHandler::SigDfl) };
        }
        let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);

        for redirect in &self.redirects {
            if let Err(errno) = redirect.apply() {
                report(&[&redirect.diag, errno.desc().as_bytes(), b"\n"]);
                exit_child(EXIT_REDIRECT_FAILED);
            }
        }

        let errno = match execvp(&self.argv[0], &self.argv) {
            Ok(never) => match never {},
            Err(errno) => errno,
        };
        if errno == Errno::ENOENT {
            report(&[&self.not_found]);
            exit_child(EXIT_NOT_FOUND);
        }
        report(&[&self.exec_failed, errno.desc().as_bytes(), b"\n"]);
        exit_child(EXIT_NOT_EXECUTABLE)
    }
}

impl PreparedRedirect {
    fn apply(&self) -> Result<(), Errno> {
        let fd = open(self.path.as_c_str(), self.flags, Redirect::create_mode())?;
        if fd != self.target {
            dup2(fd, self.target)?;
            close(fd)?;
        }
        Ok(())
    }
}

fn prepare_redirect(redirect: &Redirect) -> Result<PreparedRedirect, PlanError> {
    Ok(PreparedRedirect {
        path: cstring(&redirect.path)?,
        flags: redirect.open_flags(),
        target: redirect.stream.fd(),
        diag: format!("{DIAG_PREFIX}{}: ", redirect.path).into_bytes(),
    })
}

fn cstring(s: &str) -> Result<CString, PlanError> {
    CString::new(s).map_err(|_: NulError| PlanError::Nul(s.to_string()))
}

fn command_line(resolved: &Resolved) -> String {
    let mut line = resolved.argv.join(" ");
    for redirect in &resolved.redirects {
        line.push(' ');
        line.push_str(&redirect.to_string());
    }
    line
}

fn report(parts: &[&[u8]]) {
    let stderr = unsafe { BorrowedFd::borrow_raw(libc::STDERR_FILENO) };
    for part in parts {
        let _ = nix::unistd::write(stderr, part);
    }
}

fn exit_child(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}
