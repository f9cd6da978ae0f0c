//! Command history with prev/next navigation and back-search.

use serde::{Deserialize, Serialize};

use kestrel_types::error::{KernelError, Result};

/// Default number of entries kept.
pub const DEFAULT_MAX_HISTORY: usize = 50;

/// Bounded, ordered command history. Only the entries are persisted; the
/// navigation and search cursors start fresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct History {
    entries: Vec<String>,
    max: usize,
    cursor: Option<usize>,
    search_cursor: Option<usize>,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

impl History {
    pub fn new(max: usize) -> Self {
        Self {
            entries: Vec::new(),
            max,
            cursor: None,
            search_cursor: None,
        }
    }

    /// Change the bound, evicting the oldest entries if needed.
    pub fn set_max(&mut self, max: usize) {
        self.max = max;
        self.evict();
    }

    fn evict(&mut self) {
        if self.entries.len() > self.max {
            let excess = self.entries.len() - self.max;
            self.entries.drain(..excess);
        }
    }

    /// Record a command. Blank input and an exact repeat of the previous
    /// entry are skipped. Resets navigation. Returns whether it was stored.
    pub fn add(&mut self, command: &str) -> bool {
        self.reset_cursor();
        let command = command.trim();
        if command.is_empty() || self.entries.last().is_some_and(|last| last == command) {
            return false;
        }
        self.entries.push(command.to_string());
        self.evict();
        true
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.reset_cursor();
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = None;
        self.search_cursor = None;
    }

    /// Step back one entry. Stays on the oldest entry once reached.
    pub fn previous(&mut self) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let index = match self.cursor {
            None => self.entries.len() - 1,
            Some(i) => i.saturating_sub(1),
        };
        self.cursor = Some(index);
        self.entries.get(index).map(String::as_str)
    }

    /// Step forward one entry. Moving past the newest entry leaves
    /// navigation and returns `None` (an empty input line).
    pub fn next(&mut self) -> Option<&str> {
        let i = self.cursor?;
        if i + 1 < self.entries.len() {
            self.cursor = Some(i + 1);
            self.entries.get(i + 1).map(String::as_str)
        } else {
            self.cursor = None;
            None
        }
    }

    /// Case-insensitive substring search, newest first. Each call continues
    /// from the previous hit unless `restart` is set.
    pub fn search(&mut self, query: &str, restart: bool) -> Option<&str> {
        let end = match (restart, self.search_cursor) {
            (false, Some(i)) => i,
            _ => self.entries.len(),
        };
        let needle = query.to_lowercase();
        let hit = self.entries[..end]
            .iter()
            .rposition(|e| e.to_lowercase().contains(&needle))?;
        self.search_cursor = Some(hit);
        self.entries.get(hit).map(String::as_str)
    }

    /// Expand `!!` (the last entry) and `!n` (entry `n`, counted from 1).
    pub fn expand(&self, input: &str) -> Result<String> {
        let trimmed = input.trim();
        if trimmed == "!!" {
            return self
                .entries
                .last()
                .cloned()
                .ok_or_else(|| KernelError::InvalidArgument("!!: no previous command".to_string()));
        }
        if let Some(n_str) = trimmed.strip_prefix('!')
            && let Ok(n) = n_str.parse::<usize>()
        {
            if n == 0 || n > self.entries.len() {
                return Err(KernelError::InvalidArgument(format!("!{n}: event not found")));
            }
            return Ok(self.entries[n - 1].clone());
        }
        if trimmed.contains("!!")
            && let Some(last) = self.entries.last()
        {
            return Ok(input.replace("!!", last));
        }
        Ok(input.to_string())
    }
}

impl From<Vec<String>> for History {
    fn from(entries: Vec<String>) -> Self {
        let mut history = Self::default();
        history.entries = entries;
        history.evict();
        history
    }
}

impl From<History> for Vec<String> {
    fn from(history: History) -> Self {
        history.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(items: &[&str]) -> History {
        let mut h = History::default();
        for item in items {
            h.add(item);
        }
        h
    }

    #[test]
    fn add_trims_and_skips() {
        let mut h = History::default();
        assert!(h.add("  ls  "));
        assert!(!h.add("ls"));
        assert!(!h.add("   "));
        assert!(h.add("pwd"));
        assert!(h.add("ls"));
        assert_eq!(h.entries(), ["ls", "pwd", "ls"]);
    }

    #[test]
    fn evicts_oldest() {
        let mut h = History::new(2);
        h.add("a");
        h.add("b");
        h.add("c");
        assert_eq!(h.entries(), ["b", "c"]);
    }

    #[test]
    fn navigation() {
        let mut h = filled(&["a", "b", "c"]);
        assert_eq!(h.previous(), Some("c"));
        assert_eq!(h.previous(), Some("b"));
        assert_eq!(h.previous(), Some("a"));
        assert_eq!(h.previous(), Some("a"));
        assert_eq!(h.next(), Some("b"));
        assert_eq!(h.next(), Some("c"));
        assert_eq!(h.next(), None);
        assert_eq!(h.next(), None);
    }

    #[test]
    fn back_search_continues() {
        let mut h = filled(&["cat a", "ls", "CAT b", "pwd"]);
        assert_eq!(h.search("cat", true), Some("CAT b"));
        assert_eq!(h.search("cat", false), Some("cat a"));
        assert_eq!(h.search("cat", false), None);
        assert_eq!(h.search("cat", true), Some("CAT b"));
    }

    #[test]
    fn expand_recall() {
        let h = filled(&["echo one", "echo two"]);
        assert_eq!(h.expand("!!").unwrap(), "echo two");
        assert_eq!(h.expand("!1").unwrap(), "echo one");
        assert!(h.expand("!9").is_err());
        assert!(h.expand("!0").is_err());
        assert_eq!(h.expand("sudo !!").unwrap(), "sudo echo two");
        assert_eq!(h.expand("ls").unwrap(), "ls");
        assert!(History::default().expand("!!").is_err());
    }

    #[test]
    fn persisted_as_list() {
        let h = filled(&["a", "b"]);
        assert_eq!(serde_json::to_string(&h).unwrap(), r#"["a","b"]"#);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;
        use proptest::prelude::prop;

        proptest! {
            #[test]
            fn never_exceeds_bound(max in 1usize..10, cmds in prop::collection::vec("[a-c]{1,2}", 0..40)) {
                let mut h = History::new(max);
                for c in &cmds {
                    h.add(c);
                }
                prop_assert!(h.len() <= max);
                for pair in h.entries().windows(2) {
                    prop_assert_ne!(&pair[0], &pair[1]);
                }
            }
        }
    }
}
