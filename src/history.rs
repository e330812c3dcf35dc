//! Bounded command history with `!n` recall.

use std::collections::VecDeque;
use thiserror::Error;

pub const DEFAULT_HISTORY_SIZE: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("invalid history reference !{0}")]
    InvalidReference(String),
}

/// The last `capacity` non-blank lines, oldest first. Entries are numbered from 1.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<String>,
    capacity: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Records `line`, evicting the oldest entry when full. Blank lines are skipped.
    pub fn push(&mut self, line: &str) {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() || self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(line.to_string());
    }

    pub fn get(&self, n: usize) -> Option<&str> {
        n.checked_sub(1)
            .and_then(|idx| self.entries.get(idx))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(number, line)` pairs, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.as_str()))
    }

    /// Replaces a `!n` line with history entry `n`; any other line is returned as is.
    pub fn expand(&self, line: &str) -> Result<String, HistoryError> {
        let trimmed = line.trim_start();
        let Some(reference) = trimmed.strip_prefix('!').filter(|r| !r.trim().is_empty()) else {
            return Ok(line.to_string());
        };
        let reference = reference.trim();
        reference
            .parse::<usize>()
            .ok()
            .and_then(|n| self.get(n))
            .map(str::to_string)
            .ok_or_else(|| HistoryError::InvalidReference(reference.to_string()))
    }
}
