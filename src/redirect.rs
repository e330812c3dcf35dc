//! Extraction of `<`, `>` and `>>` redirections from a command's token list.

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use thiserror::Error;

/// Standard stream a redirection rebinds in the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdin,
    Stdout,
}

impl Stream {
    /// Descriptor slot the opened file is duplicated onto.
    pub fn fd(self) -> i32 {
        match self {
            Stream::Stdin => libc::STDIN_FILENO,
            Stream::Stdout => libc::STDOUT_FILENO,
        }
    }
}

/// How the redirection target is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Truncate,
    Append,
}

/// A single `(stream, mode, path)` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub stream: Stream,
    pub mode: OpenMode,
    pub path: String,
}

impl Redirect {
    pub fn new(stream: Stream, mode: OpenMode, path: impl Into<String>) -> Self {
        Self {
            stream,
            mode,
            path: path.into(),
        }
    }

    /// Flags passed to `open(2)` for this directive.
    pub fn open_flags(&self) -> OFlag {
        match self.mode {
            OpenMode::Read => OFlag::O_RDONLY,
            OpenMode::Truncate => OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
            OpenMode::Append => OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND,
        }
    }

    /// Permission bits for files created by an output redirection (0644).
    pub fn create_mode() -> Mode {
        Mode::from_bits_truncate(0o644)
    }

    /// Opens the target in the calling process, for commands that run in-process.
    pub fn open(&self) -> io::Result<File> {
        let mut options = OpenOptions::new();
        match self.mode {
            OpenMode::Read => options.read(true),
            OpenMode::Truncate => options.write(true).create(true).truncate(true),
            OpenMode::Append => options.append(true).create(true),
        };
        options.mode(Self::create_mode().bits()).open(&self.path)
    }
}

impl fmt::Display for Redirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.mode {
            OpenMode::Read => "<",
            OpenMode::Truncate => ">",
            OpenMode::Append => ">>",
        };
        write!(f, "{} {}", op, self.path)
    }
}

/// Residual argument vector plus the redirections stripped from it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolved {
    pub argv: Vec<String>,
    pub redirects: Vec<Redirect>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedirectError {
    /// An operator was the last token or was followed by another operator.
    #[error("syntax error: expected file name after `{0}`")]
    MissingTarget(String),
}

fn operator(token: &str) -> Option<(Stream, OpenMode)> {
    match token {
        "<" => Some((Stream::Stdin, OpenMode::Read)),
        ">" => Some((Stream::Stdout, OpenMode::Truncate)),
        ">>" => Some((Stream::Stdout, OpenMode::Append)),
        _ => None,
    }
}

/// Splits `tokens` into the program's arguments and its redirection directives.
///
/// The relative order of the remaining arguments is preserved, and directives are
/// returned in the order they appeared so that applying them sequentially lets the
/// last redirection of a stream win.
pub fn resolve<S: AsRef<str>>(tokens: &[S]) -> Result<Resolved, RedirectError> {
    let mut resolved = Resolved::default();
    let mut iter = tokens.iter().map(AsRef::as_ref);

    while let Some(token) = iter.next() {
        match operator(token) {
            Some((stream, mode)) => match iter.next() {
                Some(target) if operator(target).is_none() => {
                    resolved.redirects.push(Redirect::new(stream, mode, target));
                }
                _ => return Err(RedirectError::MissingTarget(token.to_string())),
            },
            None => resolved.argv.push(token.to_string()),
        }
    }

    Ok(resolved)
}
