//! Splitting an input line into words and operators.

use thiserror::Error;

/// A tokenized command line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandLine {
    /// Words and redirection operators, in input order. The trailing `&` is not included.
    pub tokens: Vec<String>,
    /// Whether the line ended with `&`.
    pub background: bool,
}

impl CommandLine {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexingError {
    #[error("syntax error near unexpected token `&'")]
    MisplacedAmpersand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexingState {
    Start,
    ReadingWord,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    state: LexingState,
    buffer: String,
    out: Vec<String>,
}

impl<'a> Lexer<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            chars: line.chars().peekable(),
            state: LexingState::Start,
            buffer: String::new(),
            out: Vec::new(),
        }
    }

    fn run(mut self) -> Vec<String> {
        while let Some(ch) = self.chars.next() {
            match ch {
                ' ' | '\t' | '\n' | '\r' => self.finish_word(),
                '<' | '&' => {
                    self.finish_word();
                    self.out.push(ch.to_string());
                }
                '>' => {
                    self.finish_word();
                    if self.chars.next_if_eq(&'>').is_some() {
                        self.out.push(">>".to_string());
                    } else {
                        self.out.push(">".to_string());
                    }
                }
                _ => {
                    self.state = LexingState::ReadingWord;
                    self.buffer.push(ch);
                }
            }
        }
        self.finish_word();
        self.out
    }

    fn finish_word(&mut self) {
        if self.state == LexingState::ReadingWord {
            self.out.push(std::mem::take(&mut self.buffer));
            self.state = LexingState::Start;
        }
    }
}

/// Splits `line` on blanks. `<`, `>`, `>>` and `&` always form tokens of their own,
/// even when written without surrounding spaces (`a>b` gives `a`, `>`, `b`).
///
/// # Returns
/// The tokens with a trailing `&` removed and turned into [`CommandLine::background`],
/// or [`LexingError::MisplacedAmpersand`] when `&` appears anywhere but at the end.
pub fn split_into_tokens(line: &str) -> Result<CommandLine, LexingError> {
    let mut tokens = Lexer::new(line).run();

    let background = tokens.last().is_some_and(|t| t == "&");
    if background {
        tokens.pop();
    }
    if tokens.iter().any(|t| t == "&") {
        return Err(LexingError::MisplacedAmpersand);
    }

    Ok(CommandLine { tokens, background })
}
