//! A small interactive shell with Unix job control.
//!
//! The core is [`JobControl`]: it launches external commands in their own process
//! groups, hands the controlling terminal to foreground jobs, and keeps a table of
//! background and stopped jobs that a SIGCHLD-driven [`Reaper`] reconciles
//! asynchronously. All OS access goes through the [`ProcessControl`] and
//! [`TerminalControl`] traits.
//!
//! Around it sits a minimal line interpreter ([`Interpreter`]) with `<`, `>`, `>>`
//! redirection, a trailing `&`, a bounded history with `!n` recall, and the builtins
//! `cd`, `pwd`, `echo`, `exit`, `jobs`, `fg`, `bg` and `history`.

mod builtin;
pub mod command;
pub mod control;
pub mod error;
pub mod history;
mod interpreter;
pub mod jobs;
pub mod launch;
pub mod lexer;
pub mod process;
pub mod reaper;
pub mod redirect;
pub mod terminal;

#[cfg(test)]
mod testing;

pub use control::{Completion, JobControl, JobControlConfig, Launched};
pub use error::{JobError, LaunchError};
pub use interpreter::{DEFAULT_PROMPT, Interpreter};
pub use jobs::{JobId, JobStatus, JobView};
pub use process::{ChildEvent, ProcessControl, UnixProcesses};
pub use reaper::Reaper;
pub use terminal::{TerminalControl, TerminalError, UnixTerminal};
