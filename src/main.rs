use anyhow::{Context, Result};
use argh::FromArgs;
use job_shell::command::Environment;
use job_shell::history::{DEFAULT_HISTORY_SIZE, History};
use job_shell::jobs::{DEFAULT_MAX_COMMAND_LEN, DEFAULT_MAX_JOBS};
use job_shell::{
    DEFAULT_PROMPT, Interpreter, JobControl, JobControlConfig, TerminalError, UnixTerminal,
};
use nix::unistd::getpgrp;
use std::process::ExitCode;
use tracing::{debug, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(FromArgs)]
/// Interactive shell with job control.
struct Options {
    #[argh(option, default = "DEFAULT_PROMPT.to_string()")]
    /// text shown before each input line.
    prompt: String,

    #[argh(option, default = "DEFAULT_MAX_JOBS")]
    /// maximum number of jobs tracked at once.
    max_jobs: usize,

    #[argh(option, default = "DEFAULT_HISTORY_SIZE")]
    /// number of lines kept for `history` and `!n`.
    history_size: usize,

    #[argh(switch)]
    /// do not take over the terminal, e.g. when stdin is not a tty.
    no_job_control: bool,
}

fn main() -> ExitCode {
    // RUST_LOG overrides; warnings only by default.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match run(argh::from_env()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("job_shell: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(options: Options) -> Result<()> {
    let controlled = if options.no_job_control {
        None
    } else {
        match UnixTerminal::default().take_control() {
            Ok(pgid) => Some(pgid),
            Err(TerminalError::NotATerminal) => {
                debug!("stdin is not a terminal, terminal control disabled");
                None
            }
            Err(err) => {
                warn!("{err}; continuing without terminal control");
                None
            }
        }
    };

    let shell_pgid = controlled.unwrap_or_else(getpgrp);
    let config = JobControlConfig {
        max_jobs: options.max_jobs,
        max_command_len: DEFAULT_MAX_COMMAND_LEN,
        claim_terminal: controlled.is_some(),
    };
    let jobs = JobControl::unix(shell_pgid, config);
    let reaper = jobs.install_reaper().context("cannot watch for SIGCHLD")?;

    let env = Environment::new(jobs, History::new(options.history_size));
    let mut sh = Interpreter::with_builtins(env);
    sh.set_prompt(options.prompt);
    sh.repl().context("reading input")?;

    reaper.shutdown();
    Ok(())
}
