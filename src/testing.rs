//! In-memory stand-ins for the process and terminal capabilities.

use crate::launch::LaunchPlan;
use crate::process::{ChildEvent, ProcessControl};
use crate::reaper::lock;
use crate::terminal::{TerminalControl, TerminalError};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// First pid handed out by [`FakeProcesses::spawn`].
pub const FIRST_FAKE_PID: i32 = 1000;

#[derive(Default)]
struct ProcState {
    next_pid: i32,
    spawned: Vec<(Pid, Vec<String>, bool)>,
    groups: Vec<(Pid, Pid)>,
    signals: Vec<(Pid, Signal)>,
    waits: HashMap<Pid, VecDeque<ChildEvent>>,
    changes: VecDeque<ChildEvent>,
    fail_spawn: Option<Errno>,
    no_children: bool,
    exited: Vec<Pid>,
}

type WaitHook = Box<dyn Fn() + Send + Sync>;

/// Records every call and replays scripted wait results.
#[derive(Default)]
pub struct FakeProcesses {
    state: Mutex<ProcState>,
    on_wait: Mutex<Option<WaitHook>>,
}

impl FakeProcesses {
    pub fn fail_spawn_with(&self, errno: Errno) {
        lock(&self.state).fail_spawn = Some(errno);
    }

    /// Scripts the next result of `wait_for(pid)`.
    pub fn push_wait(&self, event: ChildEvent) {
        lock(&self.state)
            .waits
            .entry(event.pid())
            .or_default()
            .push_back(event);
    }

    /// Runs `hook` every time a blocking wait returns, as if SIGCHLD arrived then.
    pub fn on_wait(&self, hook: impl Fn() + Send + Sync + 'static) {
        *lock(&self.on_wait) = Some(Box::new(hook));
    }

    /// Queues a state change for `try_wait_any`.
    pub fn push_change(&self, event: ChildEvent) {
        lock(&self.state).changes.push_back(event);
    }

    pub fn pending_changes(&self) -> usize {
        lock(&self.state).changes.len()
    }

    pub fn set_no_children(&self, none: bool) {
        lock(&self.state).no_children = none;
    }

    /// Processes marked as gone; signalling them fails with ESRCH.
    pub fn mark_exited(&self, pid: Pid) {
        lock(&self.state).exited.push(pid);
    }

    pub fn spawned(&self) -> Vec<(Pid, Vec<String>, bool)> {
        lock(&self.state).spawned.clone()
    }

    pub fn groups(&self) -> Vec<(Pid, Pid)> {
        lock(&self.state).groups.clone()
    }

    pub fn signals(&self) -> Vec<(Pid, Signal)> {
        lock(&self.state).signals.clone()
    }
}

impl ProcessControl for FakeProcesses {
    fn spawn(&self, plan: &LaunchPlan) -> Result<Pid, Errno> {
        let mut state = lock(&self.state);
        if let Some(errno) = state.fail_spawn {
            return Err(errno);
        }
        let pid = Pid::from_raw(FIRST_FAKE_PID + state.next_pid);
        state.next_pid += 1;
        let args = plan.args().map(str::to_string).collect();
        state.spawned.push((pid, args, plan.is_foreground()));
        Ok(pid)
    }

    fn set_group(&self, pid: Pid, pgid: Pid) -> Result<(), Errno> {
        lock(&self.state).groups.push((pid, pgid));
        Ok(())
    }

    fn signal_group(&self, pgid: Pid, signal: Signal) -> Result<(), Errno> {
        let mut state = lock(&self.state);
        if state.exited.contains(&pgid) {
            return Err(Errno::ESRCH);
        }
        state.signals.push((pgid, signal));
        Ok(())
    }

    fn wait_for(&self, pid: Pid) -> Result<ChildEvent, Errno> {
        let event = lock(&self.state)
            .waits
            .get_mut(&pid)
            .and_then(VecDeque::pop_front)
            .ok_or(Errno::ECHILD);
        if let Some(hook) = lock(&self.on_wait).as_ref() {
            hook();
        }
        event
    }

    fn try_wait_any(&self) -> Result<Option<ChildEvent>, Errno> {
        let mut state = lock(&self.state);
        if state.no_children {
            return Err(Errno::ECHILD);
        }
        Ok(state.changes.pop_front())
    }
}

/// Tracks which process group owns a pretend terminal.
pub struct FakeTerminal {
    owner: Mutex<Option<Pid>>,
    grants: Mutex<Vec<Pid>>,
}

impl FakeTerminal {
    pub fn new(shell_pgid: Pid) -> Self {
        Self {
            owner: Mutex::new(Some(shell_pgid)),
            grants: Mutex::new(Vec::new()),
        }
    }

    /// A terminal that refuses every handoff, like running without a tty.
    pub fn detached() -> Self {
        Self {
            owner: Mutex::new(None),
            grants: Mutex::new(Vec::new()),
        }
    }

    pub fn grants(&self) -> Vec<Pid> {
        lock(&self.grants).clone()
    }
}

impl TerminalControl for FakeTerminal {
    fn grant(&self, pgid: Pid) -> Result<(), TerminalError> {
        let mut owner = lock(&self.owner);
        if owner.is_none() {
            return Err(TerminalError::NotATerminal);
        }
        *owner = Some(pgid);
        lock(&self.grants).push(pgid);
        Ok(())
    }

    fn reclaim(&self, shell_pgid: Pid) -> Result<(), TerminalError> {
        self.grant(shell_pgid)
    }

    fn owner(&self) -> Option<Pid> {
        *lock(&self.owner)
    }
}
