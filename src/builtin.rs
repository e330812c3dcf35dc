use crate::command::{CommandFactory, Environment, ExecutableCommand, ExitCode, Factory};
use crate::control::Completion;
use crate::jobs::JobId;
use anyhow::{Context, Result, anyhow};
use argh::{EarlyExit, FromArgs};
use nix::sys::signal::Signal;
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Built-in commands known to the shell at compile time.
///
/// Builtins are parsed using the [`argh`] crate (`FromArgs`) and executed directly
/// in-process without spawning a child process.
pub(crate) trait BuiltinCommand: Sized + FromArgs {
    /// Canonical name of the command, e.g. "echo" or "cd".
    fn name() -> &'static str;

    /// Executes the command, writing its output to `stdout`.
    ///
    /// Return value should follow shell conventions: 0 for success, non-zero for error.
    fn execute(self, stdout: &mut dyn Write, env: &mut Environment) -> Result<ExitCode>;
}

impl<T: BuiltinCommand> ExecutableCommand for T {
    fn execute(self: Box<Self>, stdout: &mut dyn Write, env: &mut Environment) -> Result<ExitCode> {
        match T::execute(*self, stdout, env) {
            Ok(code) => Ok(code),
            Err(e) => {
                eprintln!("job_shell: {e:#}");
                Ok(1)
            }
        }
    }
}

/// Usage text or a parse error from `argh`, shown instead of running the builtin.
struct InvalidArgs {
    output: String,
    is_error: bool,
}

impl ExecutableCommand for InvalidArgs {
    fn execute(
        self: Box<Self>,
        stdout: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        if self.is_error {
            eprintln!("{}", self.output.trim_end());
            Ok(2)
        } else {
            writeln!(stdout, "{}", self.output.trim_end())?;
            Ok(0)
        }
    }
}

impl<T: BuiltinCommand + 'static> CommandFactory for Factory<T> {
    fn try_create(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableCommand>> {
        if name != T::name() {
            return None;
        }
        Some(match T::from_args(&[name], args) {
            Ok(cmd) => Box::new(cmd),
            Err(EarlyExit { output, status }) => Box::new(InvalidArgs {
                output,
                is_error: status.is_err(),
            }),
        })
    }
}

/// Every builtin, in lookup order.
pub(crate) fn factories() -> Vec<Box<dyn CommandFactory>> {
    vec![
        Box::new(Factory::<Cd>::default()),
        Box::new(Factory::<Pwd>::default()),
        Box::new(Factory::<Echo>::default()),
        Box::new(Factory::<Exit>::default()),
        Box::new(Factory::<Jobs>::default()),
        Box::new(Factory::<Fg>::default()),
        Box::new(Factory::<Bg>::default()),
        Box::new(Factory::<HistoryCmd>::default()),
    ]
}

#[derive(FromArgs)]
/// Print the current working directory to standard output.
pub struct Pwd {}

impl BuiltinCommand for Pwd {
    fn name() -> &'static str {
        "pwd"
    }

    fn execute(self, stdout: &mut dyn Write, env: &mut Environment) -> Result<ExitCode> {
        writeln!(stdout, "{}", env.current_dir.to_string_lossy())?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Change the current working directory.
/// If no target is provided, changes to the directory specified by the HOME environment variable.
pub struct Cd {
    #[argh(positional)]
    /// directory to switch to; absolute or relative to the current directory. Defaults to $HOME when omitted.
    pub target: Option<String>,
}

impl BuiltinCommand for Cd {
    fn name() -> &'static str {
        "cd"
    }

    fn execute(self, _stdout: &mut dyn Write, env: &mut Environment) -> Result<ExitCode> {
        let target = match self.target.filter(|t| !t.is_empty()) {
            Some(t) => PathBuf::from(t),
            None => env::var_os("HOME")
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("cd: no target and HOME not set"))?,
        };

        let new_dir = env.current_dir.join(target);
        let canonical = fs::canonicalize(&new_dir)
            .with_context(|| format!("cd: {}", new_dir.display()))?;
        env::set_current_dir(&canonical)
            .with_context(|| format!("cd: {}", canonical.display()))?;
        env.current_dir = canonical;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Leave the shell.
pub struct Exit {}

impl BuiltinCommand for Exit {
    fn name() -> &'static str {
        "exit"
    }

    fn execute(self, _stdout: &mut dyn Write, env: &mut Environment) -> Result<ExitCode> {
        env.should_exit = true;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// write the arguments to standard output, separated by spaces.
/// by default, a trailing newline is printed.
pub struct Echo {
    #[argh(switch, short = 'n')]
    /// do not output the trailing newline.
    pub no_newline: bool,

    #[argh(positional, greedy)]
    /// values to print as-is, separated by spaces.
    pub args: Vec<String>,
}

impl BuiltinCommand for Echo {
    fn name() -> &'static str {
        "echo"
    }

    fn execute(self, stdout: &mut dyn Write, _env: &mut Environment) -> Result<ExitCode> {
        let s = self.args.join(" ");
        if self.no_newline {
            write!(stdout, "{s}")?;
        } else {
            writeln!(stdout, "{s}")?;
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// List tracked jobs.
pub struct Jobs {}

impl BuiltinCommand for Jobs {
    fn name() -> &'static str {
        "jobs"
    }

    fn execute(self, stdout: &mut dyn Write, env: &mut Environment) -> Result<ExitCode> {
        let jobs = env.jobs.list_jobs();
        if jobs.is_empty() {
            writeln!(stdout, "No background jobs.")?;
        }
        for job in jobs {
            writeln!(stdout, "{job}")?;
        }
        Ok(0)
    }
}

fn parse_job_id(value: &str) -> Result<JobId, String> {
    value
        .strip_prefix('%')
        .unwrap_or(value)
        .parse()
        .map_err(|_| format!("{value}: not a job number"))
}

/// Shell-style status of a job that stopped being waited for.
fn completion_code(completion: &Completion) -> ExitCode {
    match completion {
        Completion::Exited(code) => *code,
        Completion::Signaled(sig) => 128 + *sig as i32,
        Completion::Stopped(_) => 128 + Signal::SIGTSTP as i32,
    }
}

#[derive(FromArgs)]
/// Resume a job in the foreground and wait for it.
pub struct Fg {
    #[argh(positional, from_str_fn(parse_job_id))]
    /// job number as shown by `jobs`, optionally prefixed with `%`.
    pub job: JobId,
}

impl BuiltinCommand for Fg {
    fn name() -> &'static str {
        "fg"
    }

    fn execute(self, stdout: &mut dyn Write, env: &mut Environment) -> Result<ExitCode> {
        let completion = env.jobs.foreground(self.job).context("fg")?;
        if let Completion::Stopped(view) = &completion {
            writeln!(stdout, "\n{view}")?;
        }
        Ok(completion_code(&completion))
    }
}

#[derive(FromArgs)]
/// Resume a stopped job in the background.
pub struct Bg {
    #[argh(positional, from_str_fn(parse_job_id))]
    /// job number as shown by `jobs`, optionally prefixed with `%`.
    pub job: JobId,
}

impl BuiltinCommand for Bg {
    fn name() -> &'static str {
        "bg"
    }

    fn execute(self, stdout: &mut dyn Write, env: &mut Environment) -> Result<ExitCode> {
        let view = env.jobs.background(self.job).context("bg")?;
        writeln!(stdout, "[{}] {} resumed in background", view.job_id, view.pid)?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Show the most recent command lines, numbered for `!n` recall.
pub struct HistoryCmd {}

impl BuiltinCommand for HistoryCmd {
    fn name() -> &'static str {
        "history"
    }

    fn execute(self, stdout: &mut dyn Write, env: &mut Environment) -> Result<ExitCode> {
        for (n, line) in env.history.iter() {
            writeln!(stdout, "{n} {line}")?;
        }
        Ok(0)
    }
}
