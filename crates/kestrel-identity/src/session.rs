//! The stack of nested logins.

use serde::{Deserialize, Serialize};

/// Usernames from the base login up to the current one. Never empty: the
/// base entry cannot be popped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<String>", try_from = "Vec<String>")]
pub struct SessionStack {
    base: String,
    above: Vec<String>,
}

impl SessionStack {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            above: Vec::new(),
        }
    }

    pub fn push(&mut self, user: impl Into<String>) {
        self.above.push(user.into());
    }

    /// Remove the current login. Returns `None`, leaving the stack as it
    /// was, when only the base entry remains.
    pub fn pop(&mut self) -> Option<String> {
        self.above.pop()
    }

    pub fn current(&self) -> &str {
        self.above.last().unwrap_or(&self.base)
    }

    pub fn depth(&self) -> usize {
        self.above.len() + 1
    }

    /// Entries from base to top.
    pub fn entries(&self) -> Vec<String> {
        std::iter::once(self.base.clone())
            .chain(self.above.iter().cloned())
            .collect()
    }

    /// Replace the whole stack with a single login.
    pub fn reset(&mut self, user: impl Into<String>) {
        self.base = user.into();
        self.above.clear();
    }
}

impl From<SessionStack> for Vec<String> {
    fn from(stack: SessionStack) -> Self {
        stack.entries()
    }
}

impl TryFrom<Vec<String>> for SessionStack {
    type Error = String;

    fn try_from(mut entries: Vec<String>) -> Result<Self, Self::Error> {
        if entries.is_empty() {
            return Err("session stack is empty".to_string());
        }
        let base = entries.remove(0);
        Ok(Self {
            base,
            above: entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_pop() {
        let mut s = SessionStack::new("Guest");
        s.push("bob");
        assert_eq!(s.current(), "bob");
        assert_eq!(s.depth(), 2);
        assert_eq!(s.pop().as_deref(), Some("bob"));
        assert_eq!(s.current(), "Guest");
    }

    #[test]
    fn pop_on_single_entry_is_noop() {
        let mut s = SessionStack::new("Guest");
        assert_eq!(s.pop(), None);
        assert_eq!(s.depth(), 1);
        assert_eq!(s.current(), "Guest");
    }

    #[test]
    fn reset_collapses() {
        let mut s = SessionStack::new("Guest");
        s.push("a");
        s.push("b");
        s.reset("alice");
        assert_eq!(s.entries(), vec!["alice"]);
    }

    #[test]
    fn serializes_as_list() {
        let mut s = SessionStack::new("Guest");
        s.push("root");
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, r#"["Guest","root"]"#);
        let back: SessionStack = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
        assert!(serde_json::from_str::<SessionStack>("[]").is_err());
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn never_empties(pushes in 0usize..8, pops in 0usize..16) {
                let mut s = SessionStack::new("Guest");
                for i in 0..pushes {
                    s.push(format!("u{i}"));
                }
                for _ in 0..pops {
                    s.pop();
                }
                prop_assert!(s.depth() >= 1);
                prop_assert_eq!(s.depth(), 1 + pushes.saturating_sub(pops));
            }
        }
    }
}
