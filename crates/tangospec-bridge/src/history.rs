//! [`CommandHistory`] – bounded log of executed commands.
//!
//! An entry is appended only when it differs from the most recent one, so
//! running the same command twice in a row records it once.  When the log
//! exceeds its maximum the oldest entries are evicted first.
//!
//! # Example
//!
//! ```rust
//! use tangospec_bridge::CommandHistory;
//!
//! let mut history = CommandHistory::new(2);
//! history.record("wa");
//! history.record("wa");
//! history.record("ct 1");
//! history.record("mv th 1");
//! assert_eq!(history.entries(), vec!["ct 1", "mv th 1"]);
//! ```

use std::collections::VecDeque;

// ─────────────────────────────────────────────────────────────────────────────
// CommandHistory
// ─────────────────────────────────────────────────────────────────────────────

pub struct CommandHistory {
    max_len: usize,
    entries: VecDeque<String>,
}

impl CommandHistory {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            entries: VecDeque::new(),
        }
    }

    /// Record `command`.  Returns `false` when it repeated the last entry.
    pub fn record(&mut self, command: &str) -> bool {
        if self.entries.back().is_some_and(|last| last == command) {
            return false;
        }
        self.entries.push_back(command.to_string());
        self.evict();
        true
    }

    pub fn set_max_len(&mut self, max_len: usize) {
        self.max_len = max_len;
        self.evict();
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict(&mut self) {
        while self.entries.len() > self.max_len {
            self.entries.pop_front();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_repeats_are_recorded_once() {
        let mut history = CommandHistory::new(10);
        assert!(history.record("wa"));
        assert!(!history.record("wa"));
        assert!(history.record("ct"));
        assert!(history.record("wa"));
        assert_eq!(history.entries(), vec!["wa", "ct", "wa"]);
    }

    #[test]
    fn length_never_exceeds_maximum() {
        let mut history = CommandHistory::new(3);
        for i in 0..10 {
            history.record(&format!("p {i}"));
            assert!(history.len() <= 3);
        }
        assert_eq!(history.entries(), vec!["p 7", "p 8", "p 9"]);
    }

    #[test]
    fn shrinking_the_maximum_evicts_oldest() {
        let mut history = CommandHistory::new(5);
        for cmd in ["a", "b", "c", "d"] {
            history.record(cmd);
        }
        history.set_max_len(2);
        assert_eq!(history.entries(), vec!["c", "d"]);
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut history = CommandHistory::new(0);
        history.record("wa");
        assert!(history.is_empty());
    }
}
