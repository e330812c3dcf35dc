//! Launching commands and moving jobs between foreground and background.

use crate::error::{JobError, LaunchError};
use crate::jobs::{
    DEFAULT_MAX_COMMAND_LEN, DEFAULT_MAX_JOBS, JobId, JobStatus, JobTable, JobTableError, JobView,
};
use crate::launch::LaunchPlan;
use crate::process::{ChildEvent, ProcessControl, UnixProcesses};
use crate::reaper::{Reaper, ReaperThread, lock};
use crate::redirect::resolve;
use crate::terminal::{NoTerminal, TerminalControl, TerminalLease, UnixTerminal};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::io;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobControlConfig {
    /// Upper bound on concurrently tracked jobs.
    pub max_jobs: usize,
    /// Stored command lines are cut to this many bytes.
    pub max_command_len: usize,
    /// Whether foreground jobs are given the controlling terminal.
    pub claim_terminal: bool,
}

impl Default for JobControlConfig {
    fn default() -> Self {
        Self {
            max_jobs: DEFAULT_MAX_JOBS,
            max_command_len: DEFAULT_MAX_COMMAND_LEN,
            claim_terminal: true,
        }
    }
}

/// Result of [`JobControl::launch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launched {
    Background { job_id: JobId, pid: Pid },
    Exited(i32),
    Signaled(Signal),
    /// The foreground job was stopped and is now tracked.
    Stopped(JobView),
}

/// How a job brought to the foreground stopped waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Exited(i32),
    Signaled(Signal),
    Stopped(JobView),
}

/// The job-control engine: owns the job table and talks to the OS through the
/// [`ProcessControl`] and [`TerminalControl`] capabilities.
pub struct JobControl {
    jobs: Arc<Mutex<JobTable>>,
    reaper: Arc<Reaper>,
    procs: Arc<dyn ProcessControl>,
    terminal: Arc<dyn TerminalControl>,
    shell_pgid: Pid,
    claim_terminal: bool,
}

impl JobControl {
    pub fn new(
        procs: Arc<dyn ProcessControl>,
        terminal: Arc<dyn TerminalControl>,
        shell_pgid: Pid,
        config: JobControlConfig,
    ) -> Self {
        let jobs = Arc::new(Mutex::new(JobTable::new(
            config.max_jobs,
            config.max_command_len,
        )));
        let reaper = Arc::new(Reaper::new(Arc::clone(&jobs), Arc::clone(&procs)));
        Self {
            jobs,
            reaper,
            procs,
            terminal,
            shell_pgid,
            claim_terminal: config.claim_terminal,
        }
    }

    /// Engine over the real process and terminal interfaces of this process.
    pub fn unix(shell_pgid: Pid, config: JobControlConfig) -> Self {
        let terminal: Arc<dyn TerminalControl> = if config.claim_terminal {
            Arc::new(UnixTerminal::default())
        } else {
            Arc::new(NoTerminal)
        };
        Self::new(Arc::new(UnixProcesses), terminal, shell_pgid, config)
    }

    /// Starts an external command.
    ///
    /// `argv` may contain `<`, `>` and `>>` directives. A background job is recorded and
    /// control returns at once; a foreground job gets the terminal and is waited for.
    pub fn launch<S: AsRef<str>>(
        &self,
        argv: &[S],
        background: bool,
    ) -> Result<Launched, LaunchError> {
        let resolved = resolve(argv)?;
        let mut plan = LaunchPlan::new(&resolved, background)?;
        if !self.claim_terminal {
            plan = plan.without_terminal();
        }

        let _hold = self.reaper.hold();
        let pid = self
            .procs
            .spawn(&plan)
            .map_err(|source| LaunchError::Spawn {
                program: plan.program().to_string(),
                source,
            })?;
        match self.procs.set_group(pid, pid) {
            // The child already exec'd or exited; it ran its own setpgid first.
            Ok(()) | Err(Errno::EACCES) | Err(Errno::ESRCH) => {}
            Err(errno) => warn!(%pid, "setpgid failed: {errno}"),
        }

        if background {
            let job_id = self.track(pid, plan.command_line(), true)?;
            debug!(%pid, job_id, "background job started");
            return Ok(Launched::Background { job_id, pid });
        }

        let event = {
            let _lease = TerminalLease::grant(self.terminal.as_ref(), pid, self.shell_pgid);
            self.wait_until_settled(pid)
        }
        .map_err(|source| LaunchError::Wait { pid, source })?;

        match event {
            Settled::Exited(code) => Ok(Launched::Exited(code)),
            Settled::Signaled(sig) => Ok(Launched::Signaled(sig)),
            Settled::Stopped => {
                self.track(pid, plan.command_line(), false)?;
                self.mark(pid, JobStatus::Stopped)
                    .map(Launched::Stopped)
                    .ok_or(LaunchError::TableFull { pid })
            }
        }
    }

    /// `fg`: resumes a job with the terminal and waits until it stops or finishes.
    pub fn foreground(&self, job_id: JobId) -> Result<Completion, JobError> {
        let _hold = self.reaper.hold();
        let pid = self.pid_of(job_id)?;

        let waited = {
            let _lease = TerminalLease::grant(self.terminal.as_ref(), pid, self.shell_pgid);
            self.resume(pid);
            lock(&self.jobs).update_status(pid, JobStatus::Running);
            self.wait_until_settled(pid)
        };

        let event = match waited {
            Ok(event) => event,
            Err(source) => {
                if source == Errno::ECHILD {
                    // Nothing left to wait for; the entry is stale.
                    lock(&self.jobs).remove(pid);
                }
                return Err(JobError::Wait { job_id, source });
            }
        };

        match event {
            Settled::Stopped => self
                .mark(pid, JobStatus::Stopped)
                .map(Completion::Stopped)
                .ok_or(JobError::NotFound(job_id)),
            Settled::Signaled(sig) => {
                lock(&self.jobs).remove(pid);
                Ok(Completion::Signaled(sig))
            }
            Settled::Exited(code) => {
                lock(&self.jobs).remove(pid);
                Ok(Completion::Exited(code))
            }
        }
    }

    /// `bg`: resumes a job without waiting for it or touching the terminal.
    pub fn background(&self, job_id: JobId) -> Result<JobView, JobError> {
        let _hold = self.reaper.hold();
        let pid = self.pid_of(job_id)?;
        self.resume(pid);
        self.mark(pid, JobStatus::Running)
            .ok_or(JobError::NotFound(job_id))
    }

    /// Snapshot of every tracked job, ascending by id.
    pub fn list_jobs(&self) -> Vec<JobView> {
        lock(&self.jobs).list().map(JobView::from).collect()
    }

    /// Reconciles whatever child state changes are pending right now.
    pub fn reap_pending(&self) -> usize {
        self.reaper.drain()
    }

    /// Starts reaping children asynchronously on SIGCHLD.
    pub fn install_reaper(&self) -> io::Result<ReaperThread> {
        self.reaper.install()
    }

    fn pid_of(&self, job_id: JobId) -> Result<Pid, JobError> {
        lock(&self.jobs)
            .find_by_id(job_id)
            .map(|job| job.pid)
            .ok_or(JobError::NotFound(job_id))
    }

    fn track(
        &self,
        pid: Pid,
        command_line: &str,
        background: bool,
    ) -> Result<JobId, LaunchError> {
        let mut table = lock(&self.jobs);
        let added = match table.add(pid, command_line, background) {
            Err(JobTableError::Duplicate { .. }) => {
                // A reused pid whose old entry was never reaped.
                warn!(%pid, "replacing stale job entry");
                table.remove(pid);
                table.add(pid, command_line, background)
            }
            other => other,
        };
        added.map_err(|err| {
            // Reported once by whoever handles the error.
            debug!(%pid, "{err}; process left running untracked");
            LaunchError::TableFull { pid }
        })
    }

    fn mark(&self, pid: Pid, status: JobStatus) -> Option<JobView> {
        let mut table = lock(&self.jobs);
        table.update_status(pid, status);
        table.find_by_pid(pid).map(JobView::from)
    }

    fn resume(&self, pid: Pid) {
        match self.procs.signal_group(pid, Signal::SIGCONT) {
            Ok(()) => {}
            Err(Errno::ESRCH) => debug!(%pid, "SIGCONT: process group already gone"),
            Err(errno) => warn!(%pid, "SIGCONT failed: {errno}"),
        }
    }

    /// Waits until `pid` stops or terminates; continue reports are skipped.
    fn wait_until_settled(&self, pid: Pid) -> Result<Settled, Errno> {
        loop {
            match self.procs.wait_for(pid)? {
                ChildEvent::Exited(_, code) => return Ok(Settled::Exited(code)),
                ChildEvent::Signaled(_, sig) => return Ok(Settled::Signaled(sig)),
                ChildEvent::Stopped(..) => return Ok(Settled::Stopped),
                ChildEvent::Continued(_) => continue,
            }
        }
    }
}

enum Settled {
    Exited(i32),
    Signaled(Signal),
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FIRST_FAKE_PID, FakeProcesses, FakeTerminal};

    const SHELL: Pid = Pid::from_raw(1);

    fn fake_pid(n: i32) -> Pid {
        Pid::from_raw(FIRST_FAKE_PID + n)
    }

    type Fixture = (Arc<FakeProcesses>, Arc<FakeTerminal>, JobControl);

    fn setup_with(config: JobControlConfig) -> Fixture {
        let procs = Arc::new(FakeProcesses::default());
        let terminal = Arc::new(FakeTerminal::new(SHELL));
        let control = JobControl::new(procs.clone(), terminal.clone(), SHELL, config);
        (procs, terminal, control)
    }

    fn setup() -> Fixture {
        setup_with(JobControlConfig::default())
    }

    fn ids(control: &JobControl) -> Vec<JobId> {
        control.list_jobs().iter().map(|job| job.job_id).collect()
    }

    #[test]
    fn test_background_launch_records_running_job() {
        let (procs, terminal, control) = setup();

        let launched = control.launch(&["sleep", "10"], true).unwrap();

        assert_eq!(
            launched,
            Launched::Background {
                job_id: 1,
                pid: fake_pid(0)
            }
        );
        let jobs = control.list_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Running);
        assert_eq!(jobs[0].command_line, "sleep 10");
        assert!(jobs[0].background);
        assert_eq!(procs.groups(), vec![(fake_pid(0), fake_pid(0))]);
        assert!(terminal.grants().is_empty());
        assert_eq!(terminal.owner(), Some(SHELL));
    }

    #[test]
    fn test_finished_background_job_is_reaped() {
        let (procs, _terminal, control) = setup();
        control.launch(&["sleep", "1"], true).unwrap();

        procs.push_change(ChildEvent::Exited(fake_pid(0), 0));
        control.reap_pending();

        assert!(control.list_jobs().is_empty());
    }

    #[test]
    fn test_job_ids_stay_dense() {
        let (procs, _terminal, control) = setup();
        for _ in 0..4 {
            control.launch(&["sleep", "5"], true).unwrap();
        }
        procs.push_change(ChildEvent::Exited(fake_pid(1), 0));
        procs.push_change(ChildEvent::Signaled(fake_pid(3), Signal::SIGTERM));
        control.reap_pending();
        assert_eq!(ids(&control), vec![1, 2]);

        control.launch(&["sleep", "5"], true).unwrap();
        assert_eq!(ids(&control), vec![1, 2, 3]);
        let pids: Vec<_> = control.list_jobs().iter().map(|job| job.pid).collect();
        assert_eq!(pids, vec![fake_pid(0), fake_pid(2), fake_pid(4)]);
    }

    #[test]
    fn test_foreground_launch_hands_terminal_over_and_back() {
        let (procs, terminal, control) = setup();
        procs.push_wait(ChildEvent::Exited(fake_pid(0), 0));

        assert_eq!(control.launch(&["true"], false).unwrap(), Launched::Exited(0));

        assert_eq!(terminal.grants(), vec![fake_pid(0), SHELL]);
        assert_eq!(terminal.owner(), Some(SHELL));
        assert!(control.list_jobs().is_empty());
        assert!(procs.spawned()[0].2, "spawned as foreground");
    }

    #[test]
    fn test_missing_program_is_an_abnormal_exit() {
        let (procs, terminal, control) = setup();
        procs.push_wait(ChildEvent::Exited(fake_pid(0), crate::launch::EXIT_NOT_FOUND));

        let launched = control.launch(&["nonexistent_prog"], false).unwrap();

        assert_eq!(launched, Launched::Exited(127));
        assert!(control.list_jobs().is_empty());
        assert_eq!(terminal.owner(), Some(SHELL));
    }

    #[test]
    fn test_killed_foreground_job_reports_signal() {
        let (procs, _terminal, control) = setup();
        procs.push_wait(ChildEvent::Signaled(fake_pid(0), Signal::SIGINT));
        assert_eq!(
            control.launch(&["yes"], false).unwrap(),
            Launched::Signaled(Signal::SIGINT)
        );
    }

    #[test]
    fn test_stopped_foreground_job_is_recorded() {
        let (procs, terminal, control) = setup();
        procs.push_wait(ChildEvent::Stopped(fake_pid(0), Signal::SIGTSTP));

        let launched = control.launch(&["vi", "notes.txt"], false).unwrap();

        let Launched::Stopped(view) = launched else {
            panic!("expected a stopped job, got {launched:?}");
        };
        assert_eq!(view.job_id, 1);
        assert_eq!(view.status, JobStatus::Stopped);
        assert_eq!(view.command_line, "vi notes.txt");
        assert!(!view.background);
        assert_eq!(terminal.owner(), Some(SHELL));
    }

    #[test]
    fn test_failed_wait_still_reclaims_terminal() {
        let (_procs, terminal, control) = setup();
        // Nothing scripted: the wait fails with ECHILD.
        let err = control.launch(&["true"], false).unwrap_err();
        assert_eq!(
            err,
            LaunchError::Wait {
                pid: fake_pid(0),
                source: Errno::ECHILD
            }
        );
        assert_eq!(terminal.owner(), Some(SHELL));
    }

    #[test]
    fn test_full_table_leaves_process_untracked() {
        let (procs, _terminal, control) = setup_with(JobControlConfig {
            max_jobs: 1,
            ..JobControlConfig::default()
        });
        control.launch(&["sleep", "5"], true).unwrap();

        let err = control.launch(&["sleep", "6"], true).unwrap_err();

        assert_eq!(err, LaunchError::TableFull { pid: fake_pid(1) });
        assert_eq!(procs.spawned().len(), 2, "process still started");
        assert_eq!(control.list_jobs().len(), 1);
    }

    #[test]
    fn test_spawn_failure_changes_nothing() {
        let (procs, terminal, control) = setup();
        procs.fail_spawn_with(Errno::EAGAIN);

        let err = control.launch(&["sleep", "5"], true).unwrap_err();

        assert_eq!(
            err,
            LaunchError::Spawn {
                program: "sleep".to_string(),
                source: Errno::EAGAIN
            }
        );
        assert!(control.list_jobs().is_empty());
        assert!(terminal.grants().is_empty());
    }

    #[test]
    fn test_bad_command_lines_never_fork() {
        let (procs, _terminal, control) = setup();
        assert!(matches!(
            control.launch(&["cat", ">"], false),
            Err(LaunchError::Syntax(_))
        ));
        assert_eq!(
            control.launch(&[] as &[&str], false),
            Err(LaunchError::EmptyCommand)
        );
        assert_eq!(
            control.launch(&["<", "in.txt"], true),
            Err(LaunchError::EmptyCommand)
        );
        assert!(procs.spawned().is_empty());
    }

    #[test]
    fn test_foreground_of_unknown_job_is_not_found() {
        let (_procs, terminal, control) = setup();
        control.launch(&["sleep", "5"], true).unwrap();

        assert_eq!(control.foreground(42), Err(JobError::NotFound(42)));

        assert_eq!(control.list_jobs().len(), 1);
        assert!(terminal.grants().is_empty());
        assert_eq!(terminal.owner(), Some(SHELL));
    }

    #[test]
    fn test_foreground_resumes_and_waits() {
        let (procs, terminal, control) = setup();
        control.launch(&["sleep", "5"], true).unwrap();
        procs.push_change(ChildEvent::Stopped(fake_pid(0), Signal::SIGTSTP));
        control.reap_pending();
        assert_eq!(control.list_jobs()[0].status, JobStatus::Stopped);

        procs.push_wait(ChildEvent::Exited(fake_pid(0), 3));
        assert_eq!(control.foreground(1), Ok(Completion::Exited(3)));

        assert_eq!(procs.signals(), vec![(fake_pid(0), Signal::SIGCONT)]);
        assert!(control.list_jobs().is_empty());
        assert_eq!(terminal.grants(), vec![fake_pid(0), SHELL]);
        assert_eq!(terminal.owner(), Some(SHELL));
    }

    #[test]
    fn test_foreground_job_stopping_again_stays_tracked() {
        let (procs, terminal, control) = setup();
        control.launch(&["sleep", "5"], true).unwrap();
        procs.push_wait(ChildEvent::Continued(fake_pid(0)));
        procs.push_wait(ChildEvent::Stopped(fake_pid(0), Signal::SIGTSTP));

        let Ok(Completion::Stopped(view)) = control.foreground(1) else {
            panic!("expected the job to stop");
        };
        assert_eq!(view.job_id, 1);
        assert_eq!(view.status, JobStatus::Stopped);
        assert_eq!(control.list_jobs().len(), 1);
        assert_eq!(terminal.owner(), Some(SHELL));
    }

    #[test]
    fn test_foreground_of_vanished_process_drops_entry() {
        let (procs, _terminal, control) = setup();
        control.launch(&["sleep", "5"], true).unwrap();
        procs.mark_exited(fake_pid(0));

        assert_eq!(
            control.foreground(1),
            Err(JobError::Wait {
                job_id: 1,
                source: Errno::ECHILD
            })
        );
        assert!(control.list_jobs().is_empty());
    }

    #[test]
    fn test_termination_is_removed_once_whoever_sees_it_first() {
        // The foreground wait sees the exit, then the reaper gets the same report.
        let (procs, _terminal, control) = setup();
        control.launch(&["a"], true).unwrap();
        control.launch(&["b"], true).unwrap();
        procs.push_wait(ChildEvent::Exited(fake_pid(0), 0));
        control.foreground(1).unwrap();
        procs.push_change(ChildEvent::Exited(fake_pid(0), 0));
        control.reap_pending();
        let wait_first = control.list_jobs();

        // SIGCHLD arrives while the foreground wait is in progress.
        let (procs, _terminal, control) = setup();
        control.launch(&["a"], true).unwrap();
        control.launch(&["b"], true).unwrap();
        procs.push_wait(ChildEvent::Exited(fake_pid(0), 0));
        procs.push_change(ChildEvent::Exited(fake_pid(0), 0));
        let reaper = Arc::clone(&control.reaper);
        procs.on_wait(move || reaper.notify());
        control.foreground(1).unwrap();
        let reaper_during_wait = control.list_jobs();

        assert_eq!(wait_first.len(), 1);
        assert_eq!(wait_first[0].job_id, 1);
        assert_eq!(wait_first[0].command_line, "b");
        assert_eq!(
            wait_first.iter().map(|j| (j.job_id, j.pid)).collect::<Vec<_>>(),
            reaper_during_wait
                .iter()
                .map(|j| (j.job_id, j.pid))
                .collect::<Vec<_>>()
        );
        assert_eq!(procs.pending_changes(), 0);
    }

    #[test]
    fn test_background_resumes_without_terminal() {
        let (procs, terminal, control) = setup();
        control.launch(&["sleep", "5"], true).unwrap();
        procs.push_change(ChildEvent::Stopped(fake_pid(0), Signal::SIGTSTP));
        control.reap_pending();

        let view = control.background(1).unwrap();

        assert_eq!(view.status, JobStatus::Running);
        assert_eq!(procs.signals(), vec![(fake_pid(0), Signal::SIGCONT)]);
        assert!(terminal.grants().is_empty());
        assert_eq!(control.background(2), Err(JobError::NotFound(2)));
    }

    #[test]
    fn test_background_tolerates_group_already_gone() {
        let (procs, _terminal, control) = setup();
        control.launch(&["sleep", "5"], true).unwrap();
        procs.mark_exited(fake_pid(0));
        assert!(control.background(1).is_ok());
    }

    #[test]
    fn test_detached_terminal_does_not_stop_jobs() {
        let procs = Arc::new(FakeProcesses::default());
        let terminal = Arc::new(FakeTerminal::detached());
        let control = JobControl::new(
            procs.clone(),
            terminal.clone(),
            SHELL,
            JobControlConfig::default(),
        );
        procs.push_wait(ChildEvent::Exited(fake_pid(0), 0));

        assert_eq!(control.launch(&["true"], false), Ok(Launched::Exited(0)));
        assert_eq!(terminal.owner(), None);
    }
}
