//! The persisted state document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use kestrel_identity::{GroupRegistry, SessionStack, UserRegistry};
use kestrel_shell::{AliasTable, EnvironmentStack, History};
use kestrel_types::KernelConfig;
use kestrel_types::error::{KernelError, Result};
use kestrel_vfs::{Vfs, path};

/// Current layout version of the document.
pub const STATE_VERSION: u32 = 1;

/// What a user had going when they last left their session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub cwd: String,
    #[serde(default)]
    pub history: History,
    #[serde(default)]
    pub env: EnvironmentStack,
}

impl SessionSnapshot {
    /// A first login: home directory (or `/` without one) and default
    /// variables.
    pub fn fresh(user: &str, vfs: &Vfs, config: &KernelConfig) -> Self {
        let home = path::join("/home", user);
        let cwd = if vfs.get_node(&home).is_some_and(|n| n.is_dir()) {
            home.clone()
        } else {
            "/".to_string()
        };
        Self {
            cwd,
            history: History::new(config.terminal.max_history),
            env: EnvironmentStack::with_defaults(user, &home, &config.hostname),
        }
    }
}

/// Everything the kernel keeps between boots, as one JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub version: u32,
    pub filesystem: Vfs,
    pub users: UserRegistry,
    pub groups: GroupRegistry,
    pub session_stack: SessionStack,
    #[serde(default)]
    pub aliases: AliasTable,
    /// Per-user snapshots, the active session's included.
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionSnapshot>,
}

impl PersistedState {
    /// The state of a fresh install.
    pub fn fresh(config: &KernelConfig) -> Self {
        let user = &config.default_user;
        let filesystem = Vfs::with_defaults(user, user);
        let mut sessions = BTreeMap::new();
        sessions.insert(user.clone(), SessionSnapshot::fresh(user, &filesystem, config));
        Self {
            version: STATE_VERSION,
            users: UserRegistry::with_defaults(user, config.security.clone()),
            groups: GroupRegistry::with_defaults(user),
            session_stack: SessionStack::new(user.clone()),
            aliases: AliasTable::with_defaults(),
            sessions,
            filesystem,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate a stored document. Anything that does not hold
    /// together is `Corrupted`.
    pub fn from_json(text: &str, config: &KernelConfig) -> Result<Self> {
        let mut state: Self = serde_json::from_str(text)
            .map_err(|e| KernelError::Corrupted(format!("state document: {e}")))?;
        if state.version != STATE_VERSION {
            return Err(KernelError::Corrupted(format!(
                "unsupported state version {}",
                state.version
            )));
        }
        state.filesystem.check_structure()?;
        if !state.users.exists(kestrel_vfs::ROOT_USER) {
            return Err(KernelError::Corrupted("no root account".to_string()));
        }
        if let Some(unknown) = state
            .session_stack
            .entries()
            .into_iter()
            .find(|u| !state.users.exists(u))
        {
            return Err(KernelError::Corrupted(format!(
                "session for unknown user '{unknown}'"
            )));
        }
        state.users.set_security(config.security.clone());
        for snapshot in state.sessions.values_mut() {
            snapshot.history.set_max(config.terminal.max_history);
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_round_trips() {
        let config = KernelConfig::default();
        let state = PersistedState::fresh(&config);
        let text = state.to_json().unwrap();
        let back = PersistedState::from_json(&text, &config).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.sessions["Guest"].cwd, "/home/Guest");
    }

    #[test]
    fn garbage_is_corrupted() {
        let config = KernelConfig::default();
        assert!(matches!(
            PersistedState::from_json("{not json", &config).unwrap_err(),
            KernelError::Corrupted(_)
        ));
    }

    #[test]
    fn dangling_session_is_corrupted() {
        let config = KernelConfig::default();
        let mut value =
            serde_json::to_value(PersistedState::fresh(&config)).unwrap();
        value["sessionStack"] = serde_json::json!(["Guest", "ghost"]);
        let err = PersistedState::from_json(&value.to_string(), &config).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn wrong_version_is_corrupted() {
        let config = KernelConfig::default();
        let mut value =
            serde_json::to_value(PersistedState::fresh(&config)).unwrap();
        value["version"] = serde_json::json!(99);
        assert!(matches!(
            PersistedState::from_json(&value.to_string(), &config).unwrap_err(),
            KernelError::Corrupted(_)
        ));
    }

    #[test]
    fn fresh_session_without_home_starts_at_root() {
        let config = KernelConfig::default();
        let vfs = Vfs::with_defaults("Guest", "Guest");
        let snap = SessionSnapshot::fresh("nobody", &vfs, &config);
        assert_eq!(snap.cwd, "/");
        assert_eq!(snap.env.get("HOME"), Some("/home/nobody"));
    }
}
