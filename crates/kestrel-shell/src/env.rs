//! Scoped shell variables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use kestrel_types::error::{KernelError, Result};

/// Default search path for executable scripts.
pub const DEFAULT_PATH: &str = "/bin:/usr/bin";
/// Default prompt template.
pub const DEFAULT_PS1: &str = "\\u@\\h:\\w\\$ ";

/// A stack of variable frames. Lookups and writes go to the top frame;
/// pushing copies the top so a child scope sees its parent's values and can
/// shadow them without leaking back. Only the top frame is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct EnvironmentStack {
    frames: Vec<BTreeMap<String, String>>,
}

impl Default for EnvironmentStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `name` is usable as a variable name.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl EnvironmentStack {
    pub fn new() -> Self {
        Self {
            frames: vec![BTreeMap::new()],
        }
    }

    /// A fresh login environment.
    pub fn with_defaults(user: &str, home: &str, host: &str) -> Self {
        let mut frame = BTreeMap::new();
        frame.insert("USER".to_string(), user.to_string());
        frame.insert("HOME".to_string(), home.to_string());
        frame.insert("HOST".to_string(), host.to_string());
        frame.insert("PATH".to_string(), DEFAULT_PATH.to_string());
        frame.insert("PS1".to_string(), DEFAULT_PS1.to_string());
        Self::from(frame)
    }

    fn top(&self) -> &BTreeMap<String, String> {
        // `frames` is never empty.
        &self.frames[self.frames.len() - 1]
    }

    fn top_mut(&mut self) -> &mut BTreeMap<String, String> {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.top().get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        if !is_valid_name(name) {
            return Err(KernelError::InvalidArgument(format!(
                "invalid variable name: '{name}'"
            )));
        }
        self.top_mut().insert(name.to_string(), value.into());
        Ok(())
    }

    /// Remove a variable from the current scope. Returns whether it existed.
    pub fn unset(&mut self, name: &str) -> bool {
        self.top_mut().remove(name).is_some()
    }

    /// Every variable visible in the current scope.
    pub fn all(&self) -> &BTreeMap<String, String> {
        self.top()
    }

    /// Enter a child scope.
    pub fn push(&mut self) {
        let copy = self.top().clone();
        self.frames.push(copy);
    }

    /// Leave the current scope. The outermost frame is never popped;
    /// returns `false` in that case.
    pub fn pop(&mut self) -> bool {
        if self.frames.len() > 1 {
            self.frames.pop();
            true
        } else {
            false
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

impl From<BTreeMap<String, String>> for EnvironmentStack {
    fn from(frame: BTreeMap<String, String>) -> Self {
        Self {
            frames: vec![frame],
        }
    }
}

impl From<EnvironmentStack> for BTreeMap<String, String> {
    fn from(mut stack: EnvironmentStack) -> Self {
        stack.frames.pop().unwrap_or_default()
    }
}
