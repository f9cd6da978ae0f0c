//! Sudoers policy and authentication timestamps.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use kestrel_platform::Clock;
use kestrel_types::config::SudoConfig;

use crate::users::ROOT;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Subject {
    User(String),
    Group(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Grant {
    All,
    Commands(Vec<String>),
}

impl Grant {
    fn allows(&self, command: &str) -> bool {
        match self {
            Self::All => true,
            Self::Commands(list) => list.iter().any(|c| c == command),
        }
    }
}

/// Parsed `/etc/sudoers`.
///
/// Each rule line is `identity host=(target) commands`; `%name` names a
/// group. `ALL` anywhere after the identity grants every command, otherwise
/// the last column is a comma-separated list of command names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SudoersPolicy {
    rules: Vec<(Subject, Grant)>,
}

impl SudoersPolicy {
    pub fn parse(text: &str) -> Self {
        let mut rules = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let Some(identity) = parts.next() else {
                continue;
            };
            let columns: Vec<&str> = parts.collect();
            let Some(last) = columns.last() else {
                log::debug!("Ignoring sudoers line without grants: {line}");
                continue;
            };
            let grant = if columns.iter().any(|c| c.contains("ALL")) {
                Grant::All
            } else {
                Grant::Commands(
                    last.split(',')
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(str::to_string)
                        .collect(),
                )
            };
            let subject = match identity.strip_prefix('%') {
                Some(group) => Subject::Group(group.to_string()),
                None => Subject::User(identity.to_string()),
            };
            rules.push((subject, grant));
        }
        Self { rules }
    }

    /// Whether a rule lets `user` (a member of `groups`) run `command`.
    pub fn permits(&self, user: &str, groups: &[String], command: &str) -> bool {
        self.rules.iter().any(|(subject, grant)| {
            let applies = match subject {
                Subject::User(u) => u == user,
                Subject::Group(g) => groups.iter().any(|m| m == g),
            };
            applies && grant.allows(command)
        })
    }
}

/// Decides escalation and remembers recent successful authentications.
pub struct SudoAuthorizer {
    timeout_minutes: i64,
    clock: Arc<dyn Clock>,
    timestamps: HashMap<String, DateTime<Utc>>,
}

impl SudoAuthorizer {
    pub fn new(config: &SudoConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            timeout_minutes: config.timeout_minutes,
            clock,
            timestamps: HashMap::new(),
        }
    }

    /// Check `command` (its first word decides) against the sudoers text.
    /// The text is parsed afresh on every call. `root` and members of the
    /// `root` group are always allowed.
    pub fn can_user_run_command(
        &self,
        user: &str,
        groups: &[String],
        command: &str,
        sudoers: Option<&str>,
    ) -> bool {
        if user == ROOT || groups.iter().any(|g| g == ROOT) {
            return true;
        }
        let name = command.split_whitespace().next().unwrap_or_default();
        match sudoers {
            Some(text) => SudoersPolicy::parse(text).permits(user, groups, name),
            None => false,
        }
    }

    /// Whether `user` authenticated within the timeout window.
    pub fn is_timestamp_valid(&self, user: &str) -> bool {
        if self.timeout_minutes <= 0 {
            return false;
        }
        match self.timestamps.get(user) {
            Some(at) => self.clock.now() - *at < Duration::minutes(self.timeout_minutes),
            None => false,
        }
    }

    /// Record a successful authentication now.
    pub fn update_timestamp(&mut self, user: &str) {
        if self.timeout_minutes > 0 {
            self.timestamps.insert(user.to_string(), self.clock.now());
        }
    }

    pub fn clear_timestamp(&mut self, user: &str) {
        self.timestamps.remove(user);
    }
}
