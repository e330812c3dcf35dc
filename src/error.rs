use crate::jobs::JobId;
use crate::launch::PlanError;
use crate::redirect::RedirectError;
use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

/// Why a command could not be started, or could not be followed to completion.
///
/// Failures inside the child (bad redirection target, program not found) are not
/// errors here: they surface as a non-zero exit status of the launched job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Syntax(#[from] RedirectError),
    #[error("empty command")]
    EmptyCommand,
    #[error("invalid argument {0:?}")]
    InvalidArgument(String),
    #[error("{program}: cannot create process: {source}")]
    Spawn { program: String, source: Errno },
    /// The process runs, but the table had no room to track it.
    #[error("job table full, process {pid} is running untracked")]
    TableFull { pid: Pid },
    #[error("waiting for process {pid} failed: {source}")]
    Wait { pid: Pid, source: Errno },
}

impl From<PlanError> for LaunchError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::Empty => LaunchError::EmptyCommand,
            PlanError::Nul(arg) => LaunchError::InvalidArgument(arg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("{0}: no such job")]
    NotFound(JobId),
    #[error("waiting for job {job_id} failed: {source}")]
    Wait { job_id: JobId, source: Errno },
}
