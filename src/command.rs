use crate::control::JobControl;
use crate::history::History;
use anyhow::Result;
use std::env as stdenv;
use std::io::Write;
use std::marker::PhantomData;
use std::path::PathBuf;

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
pub type ExitCode = i32;

/// Interpreter state that builtins can read and change.
pub struct Environment {
    /// Directory new commands start in; kept in sync with the process cwd by `cd`.
    pub current_dir: PathBuf,
    /// Set by `exit`; the read loop stops once it is true.
    pub should_exit: bool,
    pub jobs: JobControl,
    pub history: History,
}

impl Environment {
    pub fn new(jobs: JobControl, history: History) -> Self {
        let current_dir = stdenv::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            current_dir,
            should_exit: false,
            jobs,
            history,
        }
    }
}

/// Object-safe trait for any command that runs inside the interpreter process.
pub trait ExecutableCommand {
    fn execute(self: Box<Self>, stdout: &mut dyn Write, env: &mut Environment) -> Result<ExitCode>;
}

/// Creates a command from a name and its arguments.
///
/// Returns `None` when the factory doesn't recognize `name`; the line is then run as an
/// external program.
pub trait CommandFactory {
    fn try_create(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableCommand>>;
}

/// Factory for a statically known command type.
pub(crate) struct Factory<T> {
    _phantom: PhantomData<T>,
}

impl<T> Default for Factory<T> {
    fn default() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}
