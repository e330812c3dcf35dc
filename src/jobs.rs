//! The table of jobs the interpreter has spawned and not yet reaped.

use nix::unistd::Pid;
use std::fmt;
use thiserror::Error;

/// User-facing job number. Always in `1..=len` of the owning table.
pub type JobId = usize;

/// Default upper bound on concurrently tracked jobs.
pub const DEFAULT_MAX_JOBS: usize = 20;

/// Default capacity in bytes of a job's stored command line.
pub const DEFAULT_MAX_COMMAND_LEN: usize = 511;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Stopped,
    /// Observed termination; a job in this state is removed immediately.
    Done,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "Running"),
            JobStatus::Stopped => write!(f, "Stopped"),
            JobStatus::Done => write!(f, "Done"),
        }
    }
}

/// A tracked process. The leader's pid doubles as the process-group id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub pid: Pid,
    pub job_id: JobId,
    pub command_line: String,
    pub status: JobStatus,
    pub background: bool,
}

/// Snapshot of a job handed out to callers of the job-control API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobView {
    pub job_id: JobId,
    pub pid: Pid,
    pub status: JobStatus,
    pub command_line: String,
    pub background: bool,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            pid: job.pid,
            status: job.status,
            command_line: job.command_line.clone(),
            background: job.background,
        }
    }
}

impl fmt::Display for JobView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} {}",
            self.job_id, self.pid, self.status, self.command_line
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobTableError {
    #[error("job table full ({capacity} jobs)")]
    Full { capacity: usize },
    #[error("process {pid} is already tracked")]
    Duplicate { pid: Pid },
}

/// Fixed-capacity job table with dense, gap-free job ids.
///
/// Jobs are kept in insertion order and a job's id is its 1-based position, so
/// removing an entry renumbers everything after it. The table does no locking of
/// its own; see [`crate::reaper::Reaper`] for how it is shared with the reaper.
#[derive(Debug)]
pub struct JobTable {
    jobs: Vec<Job>,
    capacity: usize,
    max_command_len: usize,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_JOBS, DEFAULT_MAX_COMMAND_LEN)
    }
}

impl JobTable {
    pub fn new(capacity: usize, max_command_len: usize) -> Self {
        Self {
            jobs: Vec::with_capacity(capacity),
            capacity,
            max_command_len,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Starts tracking `pid` as a running job and returns its id.
    pub fn add(
        &mut self,
        pid: Pid,
        command_line: &str,
        background: bool,
    ) -> Result<JobId, JobTableError> {
        if self.exists(pid) {
            return Err(JobTableError::Duplicate { pid });
        }
        if self.jobs.len() >= self.capacity {
            return Err(JobTableError::Full {
                capacity: self.capacity,
            });
        }

        let job_id = self.jobs.len() + 1;
        self.jobs.push(Job {
            pid,
            job_id,
            command_line: truncate(command_line, self.max_command_len).to_string(),
            status: JobStatus::Running,
            background,
        });
        Ok(job_id)
    }

    /// Stops tracking `pid`. Returns the removed job, or `None` if it wasn't tracked.
    pub fn remove(&mut self, pid: Pid) -> Option<Job> {
        let index = self.index_of(pid)?;
        let mut job = self.jobs.remove(index);
        job.status = JobStatus::Done;
        for (i, rest) in self.jobs.iter_mut().enumerate().skip(index) {
            rest.job_id = i + 1;
        }
        Some(job)
    }

    /// Sets the status of `pid`. Unknown pids are ignored and reported as `false`.
    pub fn update_status(&mut self, pid: Pid, status: JobStatus) -> bool {
        match self.jobs.iter_mut().find(|job| job.pid == pid) {
            Some(job) => {
                job.status = status;
                true
            }
            None => false,
        }
    }

    pub fn find_by_pid(&self, pid: Pid) -> Option<&Job> {
        self.jobs.iter().find(|job| job.pid == pid)
    }

    pub fn find_by_id(&self, job_id: JobId) -> Option<&Job> {
        job_id.checked_sub(1).and_then(|index| self.jobs.get(index))
    }

    pub fn exists(&self, pid: Pid) -> bool {
        self.index_of(pid).is_some()
    }

    /// All jobs in ascending id order.
    pub fn list(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    fn index_of(&self, pid: Pid) -> Option<usize> {
        self.jobs.iter().position(|job| job.pid == pid)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
