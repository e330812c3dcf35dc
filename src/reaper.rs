//! Asynchronous reconciliation of child state changes into the job table.
//!
//! SIGCHLD is delivered through `signal-hook` to a dedicated thread which calls
//! [`Reaper::notify`]. The main flow brackets anything that must not interleave with
//! reaping (fork + table insert, a foreground wait) with [`Reaper::hold`]; a
//! notification that arrives meanwhile stays pending and is drained when the hold is
//! released, the same way a blocked signal is delivered once it is unmasked.

use crate::jobs::{JobStatus, JobTable, JobTableError};
use crate::process::{ChildEvent, ProcessControl};
use nix::errno::Errno;
use signal_hook::consts::SIGCHLD;
use signal_hook::iterator::{Handle, Signals};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Label for a stopped process the table did not know about.
pub const UNTRACKED_STOPPED_LABEL: &str = "stopped job";

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Reaper {
    jobs: Arc<Mutex<JobTable>>,
    procs: Arc<dyn ProcessControl>,
    gate: Mutex<()>,
    pending: AtomicBool,
    #[cfg(test)]
    before_release: Mutex<Option<Box<dyn FnOnce(&Reaper) + Send>>>,
}

impl Reaper {
    pub fn new(jobs: Arc<Mutex<JobTable>>, procs: Arc<dyn ProcessControl>) -> Self {
        Self {
            jobs,
            procs,
            gate: Mutex::new(()),
            pending: AtomicBool::new(false),
            #[cfg(test)]
            before_release: Mutex::new(None),
        }
    }

    /// Keeps the reaper out until the returned guard is dropped.
    ///
    /// Waits only for a drain that is already running, which never blocks on a child.
    pub fn hold(&self) -> Hold<'_> {
        Hold {
            reaper: self,
            guard: Some(lock(&self.gate)),
        }
    }

    /// Signal-path entry point: drains now unless the main flow holds the gate, in
    /// which case the drain happens when the hold ends.
    pub fn notify(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.run_if_free();
    }

    fn run_if_free(&self) {
        // A notifier that found the gate taken left its flag for us, so look again
        // after every release.
        while self.pending.load(Ordering::SeqCst) {
            let guard = match self.gate.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            if self.pending.swap(false, Ordering::SeqCst) {
                self.drain_locked();
            }
            #[cfg(test)]
            self.run_before_release();
            drop(guard);
        }
    }

    #[cfg(test)]
    fn run_before_release(&self) {
        let hook = lock(&self.before_release).take();
        if let Some(hook) = hook {
            hook(self);
        }
    }

    /// Runs `hook` once, just before a drain gives the gate back.
    #[cfg(test)]
    pub(crate) fn before_release(&self, hook: impl FnOnce(&Reaper) + Send + 'static) {
        *lock(&self.before_release) = Some(Box::new(hook));
    }

    /// Collects every pending child state change. Returns how many were reconciled.
    ///
    /// The caller must hold the gate (or be the gate's holder via [`Hold::drain`]).
    fn drain_locked(&self) -> usize {
        let mut reconciled = 0;
        loop {
            match self.procs.try_wait_any() {
                Ok(Some(event)) => {
                    reconcile(&mut lock(&self.jobs), event);
                    reconciled += 1;
                }
                Ok(None) | Err(Errno::ECHILD) => break,
                Err(errno) => {
                    warn!("reaper: waitpid failed: {errno}");
                    break;
                }
            }
        }
        reconciled
    }

    /// Drains pending changes from the calling thread.
    pub fn drain(&self) -> usize {
        self.hold().drain()
    }

    /// Registers for SIGCHLD and starts the thread that feeds notifications in.
    pub fn install(self: &Arc<Self>) -> io::Result<ReaperThread> {
        let mut signals = Signals::new([SIGCHLD])?;
        let handle = signals.handle();
        let reaper = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || {
                for _ in signals.forever() {
                    reaper.notify();
                }
                debug!("reaper thread exiting");
            })?;
        // Children may have changed state before the handler existed.
        self.notify();
        Ok(ReaperThread {
            handle,
            thread: Some(thread),
        })
    }
}

/// Exclusion from the reaper, see [`Reaper::hold`].
pub struct Hold<'a> {
    reaper: &'a Reaper,
    guard: Option<MutexGuard<'a, ()>>,
}

impl Hold<'_> {
    /// Drains pending changes without giving up the hold.
    pub fn drain(&self) -> usize {
        self.reaper.pending.store(false, Ordering::SeqCst);
        self.reaper.drain_locked()
    }
}

impl Drop for Hold<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.reaper.run_if_free();
    }
}

/// The running SIGCHLD listener. Dropping it unregisters and joins the thread.
pub struct ReaperThread {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl ReaperThread {
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("reaper thread panicked");
            }
        }
    }
}

impl Drop for ReaperThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Applies one child state change to the table.
pub fn reconcile(table: &mut JobTable, event: ChildEvent) {
    match event {
        ChildEvent::Exited(pid, _) | ChildEvent::Signaled(pid, _) => {
            if let Some(job) = table.remove(pid) {
                debug!(%pid, job_id = job.job_id, "job finished: {event:?}");
            }
        }
        ChildEvent::Stopped(pid, _) => {
            if table.update_status(pid, JobStatus::Stopped) {
                return;
            }
            match table.add(pid, UNTRACKED_STOPPED_LABEL, false) {
                Ok(_) => {
                    table.update_status(pid, JobStatus::Stopped);
                }
                Err(err @ JobTableError::Full { .. }) => {
                    warn!(%pid, "stopped process left untracked: {err}");
                }
                Err(JobTableError::Duplicate { .. }) => {}
            }
        }
        ChildEvent::Continued(pid) => {
            table.update_status(pid, JobStatus::Running);
        }
    }
}
