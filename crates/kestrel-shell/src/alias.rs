//! The alias table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use kestrel_types::error::{KernelError, Result};

/// Flat name-to-expansion mapping, persisted across sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AliasTable {
    aliases: BTreeMap<String, String>,
}

impl AliasTable {
    /// The shortcuts every new install starts with.
    pub fn with_defaults() -> Self {
        let mut table = Self::default();
        for (name, value) in [
            ("ll", "ls -la"),
            ("la", "ls -a"),
            ("..", "cd .."),
            ("...", "cd ../.."),
            ("h", "history"),
            ("c", "clear"),
        ] {
            table.aliases.insert(name.to_string(), value.to_string());
        }
        table
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.aliases.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        if name.is_empty() || name.contains(char::is_whitespace) || name.contains('=') {
            return Err(KernelError::InvalidArgument(format!(
                "invalid alias name: '{name}'"
            )));
        }
        self.aliases.insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.aliases.remove(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.aliases.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}
