//! Everything the kernel owns apart from its command registry and storage.

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use kestrel_identity::{GroupRegistry, SessionStack, SudoAuthorizer, UserRegistry};
use kestrel_platform::Clock;
use kestrel_shell::{AliasTable, AuditEvent, JobTable};
use kestrel_types::KernelConfig;
use kestrel_types::error::Result;
use kestrel_vfs::{Credentials, Vfs, path};

use crate::audit;
use crate::runner::Pending;
use crate::state::{PersistedState, STATE_VERSION, SessionSnapshot};

pub(crate) struct World {
    pub config: KernelConfig,
    pub clock: Arc<dyn Clock>,
    pub vfs: Vfs,
    pub users: UserRegistry,
    pub groups: GroupRegistry,
    pub sessions: SessionStack,
    pub jobs: JobTable,
    pub aliases: AliasTable,
    pub sudo: SudoAuthorizer,
    /// The session of whoever is on top of the stack.
    pub session: SessionSnapshot,
    /// Parked sessions of everyone else.
    pub snapshots: BTreeMap<String, SessionSnapshot>,
    pub last_status: bool,
    /// Events not yet written to the audit log.
    pub audit: Vec<AuditEvent>,
    /// The effect the last interactive request stopped on.
    pub pending: Option<Pending>,
}

impl World {
    pub fn from_state(config: KernelConfig, clock: Arc<dyn Clock>, mut state: PersistedState) -> Self {
        let current = state.session_stack.current().to_string();
        let session = state
            .sessions
            .remove(&current)
            .unwrap_or_else(|| SessionSnapshot::fresh(&current, &state.filesystem, &config));
        Self {
            sudo: SudoAuthorizer::new(&config.sudo, Arc::clone(&clock)),
            vfs: state.filesystem,
            users: state.users,
            groups: state.groups,
            sessions: state.session_stack,
            jobs: JobTable::new(),
            aliases: state.aliases,
            session,
            snapshots: state.sessions,
            last_status: true,
            audit: Vec::new(),
            pending: None,
            config,
            clock,
        }
    }

    pub fn to_state(&self) -> PersistedState {
        let mut sessions = self.snapshots.clone();
        sessions.insert(self.sessions.current().to_string(), self.session.clone());
        PersistedState {
            version: STATE_VERSION,
            filesystem: self.vfs.clone(),
            users: self.users.clone(),
            groups: self.groups.clone(),
            session_stack: self.sessions.clone(),
            aliases: self.aliases.clone(),
            sessions,
        }
    }

    pub fn current_user(&self) -> &str {
        self.sessions.current()
    }

    pub fn credentials(&self, user: &str) -> Credentials {
        let primary = self.users.primary_group(user).unwrap_or(user).to_string();
        Credentials::new(user, primary, self.groups.groups_for(user, &self.users))
    }

    /// Push (or, with `reset`, replace the stack with) a login for `user`,
    /// parking the outgoing session at `cwd`.
    pub fn enter_session(&mut self, user: &str, reset: bool, cwd: &str) {
        let outgoing = self.sessions.current().to_string();
        self.swap_session(&outgoing, user, cwd);
        if reset {
            self.sessions.reset(user);
        } else {
            self.sessions.push(user);
        }
        log::info!("Session switched from {outgoing} to {user}");
    }

    /// Pop the current login. `None` when only the base login is left.
    pub fn leave_session(&mut self, cwd: &str) -> Option<String> {
        let left = self.sessions.pop()?;
        let resumed = self.sessions.current().to_string();
        self.swap_session(&left, &resumed, cwd);
        log::info!("{left} logged out; back to {resumed}");
        Some(left)
    }

    fn swap_session(&mut self, outgoing: &str, incoming: &str, cwd: &str) {
        if outgoing == incoming {
            self.session.cwd = cwd.to_string();
            return;
        }
        let next = self
            .snapshots
            .remove(incoming)
            .unwrap_or_else(|| SessionSnapshot::fresh(incoming, &self.vfs, &self.config));
        let mut parked = mem::replace(&mut self.session, next);
        parked.cwd = cwd.to_string();
        self.snapshots.insert(outgoing.to_string(), parked);
    }

    /// Create `/home/<user>` if needed and hand it to the user.
    pub fn create_home(&mut self, user: &str) -> Result<()> {
        let home = path::join("/home", user);
        let root = Credentials::root();
        self.vfs.create_directory(&home, &root, true)?;
        let group = self.users.primary_group(user).unwrap_or(user).to_string();
        self.vfs.chown(&home, user, &root, false)?;
        self.vfs.chgrp(&home, &group, &root, false)?;
        Ok(())
    }

    pub fn record(&mut self, actor: &str, action: &str, details: impl Into<String>) {
        self.audit.push(AuditEvent {
            actor: actor.to_string(),
            action: action.to_string(),
            details: details.into(),
        });
    }

    /// Write queued audit events to the log.
    pub fn flush_audit(&mut self) -> Result<()> {
        if self.audit.is_empty() {
            return Ok(());
        }
        let events = mem::take(&mut self.audit);
        let log_path = self.config.audit.log_path.clone();
        audit::append(&mut self.vfs, &log_path, self.clock.now(), &events)
    }
}
