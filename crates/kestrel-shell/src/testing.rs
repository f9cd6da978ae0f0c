//! In-crate fixture: a full interpreter state owned in one place.

use std::sync::Arc;

use kestrel_identity::{GroupRegistry, SessionStack, SudoAuthorizer, UserRegistry};
use kestrel_platform::ManualClock;
use kestrel_types::KernelConfig;
use kestrel_types::config::SecurityConfig;
use kestrel_types::error::Result;
use kestrel_vfs::{ROOT_USER, Vfs};

use crate::alias::AliasTable;
use crate::commands::register_builtins;
use crate::env::EnvironmentStack;
use crate::history::History;
use crate::interpreter::{AuditEvent, CommandRegistry, Environment, Execution};
use crate::jobs::JobTable;

pub(crate) fn cheap_security() -> SecurityConfig {
    SecurityConfig {
        hash_memory_kib: 8,
        hash_iterations: 1,
        hash_parallelism: 1,
    }
}

pub(crate) struct Fixture {
    pub registry: CommandRegistry,
    pub cwd: String,
    pub user: String,
    pub last_status: bool,
    pub vfs: Vfs,
    pub users: UserRegistry,
    pub groups: GroupRegistry,
    pub sessions: SessionStack,
    pub jobs: JobTable,
    pub vars: EnvironmentStack,
    pub aliases: AliasTable,
    pub history: History,
    pub sudo: SudoAuthorizer,
    pub clock: Arc<ManualClock>,
    pub config: KernelConfig,
    pub stdin: Option<String>,
    pub audit: Vec<AuditEvent>,
}

impl Fixture {
    pub fn new() -> Self {
        let mut config = KernelConfig::default();
        config.security = cheap_security();
        let clock = Arc::new(ManualClock::default());
        let mut registry = CommandRegistry::new();
        register_builtins(&mut registry);
        Self {
            registry,
            cwd: "/home/Guest".to_string(),
            user: "Guest".to_string(),
            last_status: true,
            vfs: Vfs::with_defaults("Guest", "Guest"),
            users: UserRegistry::with_defaults("Guest", cheap_security()),
            groups: GroupRegistry::with_defaults("Guest"),
            sessions: SessionStack::new("Guest"),
            jobs: JobTable::new(),
            vars: EnvironmentStack::with_defaults("Guest", "/home/Guest", "kestrel"),
            aliases: AliasTable::with_defaults(),
            history: History::new(config.terminal.max_history),
            sudo: SudoAuthorizer::new(&config.sudo, Arc::clone(&clock) as Arc<dyn kestrel_platform::Clock>),
            clock,
            config,
            stdin: None,
            audit: Vec::new(),
        }
    }

    pub fn as_root(&mut self) {
        self.user = ROOT_USER.to_string();
    }

    pub fn as_guest(&mut self) {
        self.user = "Guest".to_string();
    }

    pub fn run(&mut self, line: &str) -> Result<Execution> {
        let mut env = Environment {
            cwd: self.cwd.clone(),
            user: self.user.clone(),
            vfs: &mut self.vfs,
            users: &mut self.users,
            groups: &mut self.groups,
            sessions: &self.sessions,
            jobs: &mut self.jobs,
            vars: &mut self.vars,
            aliases: &mut self.aliases,
            history: &mut self.history,
            sudo: &mut self.sudo,
            clock: self.clock.as_ref(),
            config: &self.config,
            stdin: self.stdin.take(),
            cancel: None,
            last_status: self.last_status,
            audit: Vec::new(),
        };
        let result = self.registry.execute(line, &mut env);
        if result.is_err() {
            env.last_status = false;
        }
        self.cwd = env.cwd;
        self.user = env.user;
        self.last_status = env.last_status;
        self.audit.extend(env.audit);
        result
    }

    /// Run a line that must succeed and return its text.
    pub fn text(&mut self, line: &str) -> String {
        match self.run(line) {
            Ok(exec) => exec.text(),
            Err(e) => panic!("'{line}' failed: {e}"),
        }
    }
}
