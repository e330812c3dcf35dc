use crate::builtin;
use crate::command::{CommandFactory, Environment, ExecutableCommand, ExitCode};
use crate::control::Launched;
use crate::lexer;
use crate::redirect::{self, Resolved, Stream};
use anyhow::Context;
use nix::sys::signal::Signal;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::fmt::Display;
use std::fs::File;
use std::io::{self, Write};
use tracing::debug;

pub const DEFAULT_PROMPT: &str = "job_shell> ";

/// Exit code reported for a line that could not be run at all.
const EXIT_USAGE: ExitCode = 2;

/// Reads command lines and runs them as builtins or job-controlled programs.
///
/// Every failure is reported as one `job_shell: ...` line on stderr and the
/// interpreter carries on with the next line.
pub struct Interpreter {
    env: Environment,
    commands: Vec<Box<dyn CommandFactory>>,
    prompt: String,
}

impl Interpreter {
    /// Create a new interpreter with a custom set of command factories.
    pub fn new(env: Environment, commands: Vec<Box<dyn CommandFactory>>) -> Self {
        Self {
            env,
            commands,
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }

    /// Interpreter with every builtin.
    pub fn with_builtins(env: Environment) -> Self {
        Self::new(env, builtin::factories())
    }

    pub fn set_prompt(&mut self, prompt: impl Into<String>) {
        self.prompt = prompt.into();
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn should_exit(&self) -> bool {
        self.env.should_exit
    }

    /// Runs one input line against the process's own stdout and stderr.
    pub fn run_line(&mut self, line: &str) -> ExitCode {
        self.run_line_with_output(line, &mut io::stdout().lock(), &mut io::stderr().lock())
    }

    /// Runs one input line; builtins without a `>` redirection write to `stdout` and
    /// each failure becomes one line on `stderr`.
    pub fn run_line_with_output(
        &mut self,
        line: &str,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> ExitCode {
        let line = match self.env.history.expand(line) {
            Ok(line) => line,
            Err(err) => {
                report(stderr, &err);
                return 1;
            }
        };
        self.env.history.push(&line);

        let parsed = match lexer::split_into_tokens(&line) {
            Ok(parsed) => parsed,
            Err(err) => {
                report(stderr, &err);
                return EXIT_USAGE;
            }
        };
        if parsed.is_empty() {
            return 0;
        }
        let resolved = match redirect::resolve(&parsed.tokens) {
            Ok(resolved) => resolved,
            Err(err) => {
                report(stderr, &err);
                return EXIT_USAGE;
            }
        };

        if let Some(cmd) = self.find_builtin(&resolved) {
            if parsed.background {
                debug!("`&` ignored for builtin");
            }
            return self.run_builtin(cmd, &resolved, stdout, stderr);
        }

        match self.env.jobs.launch(&parsed.tokens, parsed.background) {
            Ok(launched) => report_launch(launched, stdout),
            Err(err) => {
                report(stderr, &err);
                1
            }
        }
    }

    fn find_builtin(&self, resolved: &Resolved) -> Option<Box<dyn ExecutableCommand>> {
        let (name, args) = resolved.argv.split_first()?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.commands
            .iter()
            .find_map(|factory| factory.try_create(name, &args))
    }

    /// Builtins run in-process: `<` is ignored and the last `>`/`>>` target receives
    /// the output. Earlier targets are still created or truncated, in order.
    fn run_builtin(
        &mut self,
        cmd: Box<dyn ExecutableCommand>,
        resolved: &Resolved,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> ExitCode {
        let mut redirected: Option<File> = None;
        for redirect in resolved.redirects.iter().filter(|r| r.stream == Stream::Stdout) {
            match redirect.open().with_context(|| redirect.path.clone()) {
                Ok(file) => redirected = Some(file),
                Err(err) => {
                    report(stderr, &format_args!("{err:#}"));
                    return 1;
                }
            }
        }

        let out: &mut dyn Write = match redirected.as_mut() {
            Some(file) => file,
            None => stdout,
        };
        let result = cmd.execute(out, &mut self.env).and_then(|code| {
            out.flush()?;
            Ok(code)
        });
        match result {
            Ok(code) => code,
            Err(err) => {
                report(stderr, &format_args!("{err:#}"));
                1
            }
        }
    }

    /// Interactive read-eval-print loop. Returns on `exit` or end of input.
    pub fn repl(&mut self) -> rustyline::Result<()> {
        let mut rl = DefaultEditor::new()?;

        while !self.env.should_exit {
            match rl.readline(&self.prompt) {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        rl.add_history_entry(line.as_str())?;
                    }
                    let code = self.run_line(&line);
                    debug!(code, "line finished");
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }
}

fn report(stderr: &mut dyn Write, err: &dyn Display) {
    // Nowhere left to report a failing stderr.
    let _ = writeln!(stderr, "job_shell: {err}");
}

fn report_launch(launched: Launched, stdout: &mut dyn Write) -> ExitCode {
    // Notices are best effort.
    let _ = match &launched {
        Launched::Background { job_id, pid } => writeln!(stdout, "[{job_id}] {pid}"),
        Launched::Stopped(view) => writeln!(stdout, "\n{view}"),
        Launched::Signaled(_) => writeln!(stdout),
        Launched::Exited(_) => Ok(()),
    };
    match launched {
        Launched::Background { .. } => 0,
        Launched::Exited(code) => code,
        Launched::Signaled(sig) => 128 + sig as i32,
        Launched::Stopped(_) => 128 + Signal::SIGTSTP as i32,
    }
}
