//! The kernel: boot, persistence, interactive requests, and the background
//! job scheduler.

use std::sync::Arc;

use serde::Serialize;

use kestrel_identity::{GroupRegistry, SessionStack, UserRegistry, create_account, validate_username};
use kestrel_platform::{Clock, StorageBackend};
use kestrel_shell::{
    AliasTable, CommandRegistry, Effect, EnvironmentStack, Execution, History, JobStatus, JobTable,
    StepBudget, register_builtins,
};
use kestrel_types::error::{KernelError, Result};
use kestrel_types::{Failure, KernelConfig};
use kestrel_vfs::{Credentials, ROOT_USER, Vfs, path};

use crate::runner::{Context, Runner, Settled};
use crate::state::PersistedState;
use crate::world::World;

/// Result type of the caller-facing kernel API.
pub type KernelResult<T> = std::result::Result<T, Failure>;

/// What an interactive request produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub success: bool,
    pub output: Vec<String>,
    /// A pass-through effect for the caller to act on, or the effect the
    /// request is waiting on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect: Option<Effect>,
    /// What to ask the user before calling [`Kernel::resume`].
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prompts: Vec<String>,
}

impl Outcome {
    pub fn text(&self) -> String {
        self.output.join("\n")
    }

    /// Whether the request stopped and wants input.
    pub fn is_pending(&self) -> bool {
        self.effect.as_ref().is_some_and(|e| !e.passes_through())
    }
}

/// One scheduling step of a background job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub id: u64,
    /// The step that ran.
    pub command: String,
    pub output: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
    /// The job is gone from the table.
    pub finished: bool,
}

/// The running kernel.
pub struct Kernel {
    registry: CommandRegistry,
    storage: Box<dyn StorageBackend>,
    pub(crate) world: World,
    last_saved: Option<String>,
}

impl Kernel {
    /// Load state from `storage`, or install defaults when it is empty.
    ///
    /// A stored document that does not parse or validate halts the boot
    /// with `Corrupted`; an unreadable backend with `Storage`.
    pub fn boot(
        config: KernelConfig,
        storage: Box<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        log::info!("Booting {} from {}", config.hostname, storage.describe());
        let (state, fresh) = match storage.load()? {
            Some(text) => (PersistedState::from_json(&text, &config)?, false),
            None => {
                log::info!("No saved state; installing defaults");
                (PersistedState::fresh(&config), true)
            },
        };
        let mut registry = CommandRegistry::new();
        register_builtins(&mut registry);
        let mut kernel = Self {
            registry,
            storage,
            world: World::from_state(config, clock, state),
            last_saved: None,
        };
        if fresh {
            kernel.save()?;
        } else {
            kernel.last_saved = Some(kernel.export_state()?);
        }
        log::info!(
            "Kernel ready: {} user(s), session {}",
            kernel.world.users.names().count(),
            kernel.world.current_user()
        );
        Ok(kernel)
    }

    /// Save and give the storage backend back, for a reboot.
    pub fn shutdown(mut self) -> Result<Box<dyn StorageBackend>> {
        self.world.flush_audit()?;
        self.save()?;
        log::info!("Kernel shut down");
        Ok(self.storage)
    }

    /// Write the state document if it differs from the last one written.
    /// Returns whether anything was written.
    pub fn save(&mut self) -> Result<bool> {
        let document = self.export_state()?;
        if self.last_saved.as_deref() == Some(document.as_str()) {
            return Ok(false);
        }
        self.storage.save(&document)?;
        log::info!(
            "Saved state to {} ({} bytes)",
            self.storage.describe(),
            document.len()
        );
        self.last_saved = Some(document);
        Ok(true)
    }

    /// The whole state as one JSON document.
    pub fn export_state(&self) -> Result<String> {
        self.world.to_state().to_json()
    }

    /// Flush audit events and save. Called after every request.
    pub(crate) fn commit(&mut self) -> Result<()> {
        self.world.flush_audit()?;
        self.save()?;
        Ok(())
    }

    // -- Accessors --

    pub fn config(&self) -> &KernelConfig {
        &self.world.config
    }

    pub fn current_user(&self) -> &str {
        self.world.current_user()
    }

    pub fn cwd(&self) -> &str {
        &self.world.session.cwd
    }

    pub fn credentials(&self) -> Credentials {
        self.world.credentials(self.current_user())
    }

    pub fn vfs(&self) -> &Vfs {
        &self.world.vfs
    }

    pub fn users(&self) -> &UserRegistry {
        &self.world.users
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.world.groups
    }

    pub fn sessions(&self) -> &SessionStack {
        &self.world.sessions
    }

    pub fn jobs(&self) -> &JobTable {
        &self.world.jobs
    }

    pub fn history(&self) -> &History {
        &self.world.session.history
    }

    pub fn env(&self) -> &EnvironmentStack {
        &self.world.session.env
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.world.aliases
    }

    pub fn last_status(&self) -> bool {
        self.world.last_status
    }

    /// The prompt from `PS1`: `\u` user, `\h` host, `\w` directory with the
    /// home shortened to `~`, `\$` `#` for root and `$` otherwise.
    pub fn prompt(&self) -> String {
        let user = self.current_user();
        let cwd = self.cwd();
        let home = self.env().get("HOME").unwrap_or_default();
        let shown = if !home.is_empty() && (cwd == home || path::is_descendant(cwd, home)) {
            format!("~{}", &cwd[home.len()..])
        } else {
            cwd.to_string()
        };
        let ps1 = self.env().get("PS1").unwrap_or(kestrel_shell::env::DEFAULT_PS1);
        ps1.replace("\\u", user)
            .replace("\\h", &self.world.config.hostname)
            .replace("\\w", &shown)
            .replace("\\$", if user == ROOT_USER { "#" } else { "$" })
    }

    // -- Interactive requests --

    /// Run a command line as the current session user.
    pub fn execute(&mut self, line: &str) -> KernelResult<Outcome> {
        self.execute_with_stdin(line, None)
    }

    /// Run a command line with `stdin` piped into its first command.
    pub fn execute_with_stdin(&mut self, line: &str, stdin: Option<String>) -> KernelResult<Outcome> {
        let result = self.interactive(None, |runner, budget| {
            let expanded = runner.world.session.history.expand(line)?;
            runner.world.session.history.add(&expanded);
            runner.run_line_with(&expanded, stdin, 0, budget)
        });
        self.finish(result)
    }

    /// Complete an effect the last request stopped on, with the answers
    /// the caller collected.
    pub fn resume(&mut self, effect: Effect, inputs: Vec<String>) -> KernelResult<Outcome> {
        let resumable = matches!(
            effect,
            Effect::SudoExec { .. }
                | Effect::SwitchUser { .. }
                | Effect::Login { .. }
                | Effect::Useradd { .. }
                | Effect::Passwd { .. }
                | Effect::Confirm { .. }
        );
        if !resumable {
            return Err(Failure::from(KernelError::InvalidArgument(
                "nothing to resume for this effect".to_string(),
            )));
        }
        self.resolve_effect(effect, inputs, true)
    }

    /// Resolve a session or input-driven effect outside of a command line.
    pub(crate) fn resolve_effect(
        &mut self,
        effect: Effect,
        inputs: Vec<String>,
        interactive: bool,
    ) -> KernelResult<Outcome> {
        let (raised_by, rest) = match self.world.pending.take() {
            Some(pending) if pending.effect == effect => (Some(pending.user), pending.rest),
            _ => (None, Vec::new()),
        };
        let result = self.interactive(raised_by, |runner, budget| {
            runner.ctx.inputs = inputs.into();
            runner.ctx.interactive = interactive;
            let chained = !rest.is_empty();
            let exec = Execution {
                effect: Some(effect),
                remainder: rest,
                ..Execution::default()
            };
            runner.settle(exec, chained, 0, budget)
        });
        self.finish(result)
    }

    fn interactive(
        &mut self,
        as_user: Option<String>,
        run: impl FnOnce(&mut Runner<'_>, &mut StepBudget) -> Result<Settled>,
    ) -> Result<Settled> {
        self.world.pending = None;
        let scripting = &self.world.config.scripting;
        let mut budget = StepBudget::new(scripting.max_steps, scripting.max_depth);
        let mut ctx = Context::session(&self.world);
        if let Some(user) = as_user {
            ctx.user = user;
        }
        let mut runner = Runner {
            registry: &self.registry,
            world: &mut self.world,
            ctx,
        };
        let result = run(&mut runner, &mut budget);
        let ctx = runner.ctx;
        self.world.session.cwd = ctx.cwd;
        self.world.last_status = result.is_ok() && ctx.last_status;
        result
    }

    fn finish(&mut self, result: Result<Settled>) -> KernelResult<Outcome> {
        let outcome = match result {
            Ok(settled) => {
                let (effect, prompts) = match settled.pending {
                    Some(pending) => {
                        let prompts = pending.effect.input_prompts();
                        let effect = pending.effect.clone();
                        self.world.pending = Some(pending);
                        (Some(effect), prompts)
                    },
                    None => (settled.notice, Vec::new()),
                };
                Ok(Outcome {
                    success: true,
                    output: settled.output,
                    effect,
                    prompts,
                })
            },
            Err(e) => {
                log::debug!("request failed: {e}");
                Err(Failure::from(e))
            },
        };
        if let Err(e) = self.commit() {
            log::error!("Could not persist state: {e}");
            if outcome.is_ok() {
                return Err(Failure::from(e));
            }
        }
        outcome
    }

    // -- Background jobs --

    /// Advance every running job by one step, in id order.
    pub fn poll_jobs(&mut self) -> Vec<JobReport> {
        let mut reports = Vec::new();
        for id in self.world.jobs.ids() {
            if let Some(report) = self.step_job(id) {
                reports.push(report);
            }
        }
        if let Err(e) = self.commit() {
            log::error!("Could not persist state after job step: {e}");
        }
        reports
    }

    fn step_job(&mut self, id: u64) -> Option<JobReport> {
        let scripting = self.world.config.scripting.clone();
        let job = self.world.jobs.get_mut(id)?;
        if job.token.is_cancelled() {
            self.world.jobs.remove(id);
            return None;
        }
        if job.status == JobStatus::Paused {
            return None;
        }
        let Some(step) = job.steps.pop_front() else {
            let command = job.command.clone();
            self.world.jobs.remove(id);
            log::info!("Job [{id}] finished");
            return Some(JobReport {
                id,
                command,
                output: Vec::new(),
                error: None,
                finished: true,
            });
        };
        job.steps_run += 1;
        if job.steps_run > scripting.max_steps {
            self.world.jobs.remove(id);
            log::warn!("Job [{id}] stopped after {} steps", scripting.max_steps);
            return Some(JobReport {
                id,
                command: step.command,
                output: Vec::new(),
                error: Some(Failure::from(KernelError::ScriptLimitExceeded(format!(
                    "job exceeded {} steps",
                    scripting.max_steps
                )))),
                finished: true,
            });
        }

        let depth = job.depth;
        let ctx = Context::job(job, step.inputs);
        let mut budget = StepBudget::new(scripting.max_steps, scripting.max_depth);
        let mut runner = Runner {
            registry: &self.registry,
            world: &mut self.world,
            ctx,
        };
        let result = runner.run_job_step(&step.command, depth, &mut budget);
        let ctx = runner.ctx;

        let mut report = JobReport {
            id,
            command: step.command,
            output: Vec::new(),
            error: None,
            finished: true,
        };
        let Some(job) = self.world.jobs.get_mut(id) else {
            // The step ended its own job.
            if let Ok(progress) = result {
                report.output = progress.output;
            }
            return Some(report);
        };
        job.vars = ctx.vars.unwrap_or_default();
        job.cwd = ctx.cwd;
        match result {
            Ok(progress) => {
                report.output = progress.output;
                if progress.nested {
                    job.depth += 1;
                }
                for queued in progress.queued.into_iter().rev() {
                    job.steps.push_front(queued);
                }
                report.finished = job.is_finished();
            },
            Err(e) => {
                log::debug!("Job [{id}] failed: {e}");
                report.error = Some(Failure::from(e));
            },
        }
        if report.finished {
            self.world.jobs.remove(id);
            log::info!("Job [{id}] finished");
        }
        Some(report)
    }

    // -- Setup --

    /// Create the first real account and set the root password, all or
    /// nothing. Refused once root has a password.
    pub fn first_time_setup(
        &mut self,
        username: &str,
        password: &str,
        root_password: &str,
    ) -> KernelResult<()> {
        let result = self.setup(username, password, root_password);
        let committed = self.commit();
        result.map_err(Failure::from)?;
        committed.map_err(Failure::from)
    }

    fn setup(&mut self, username: &str, password: &str, root_password: &str) -> Result<()> {
        if self.world.users.has_password(ROOT_USER) {
            return Err(KernelError::InvalidArgument(
                "Setup has already been completed.".to_string(),
            ));
        }
        let vfs = self.world.vfs.clone();
        let users = self.world.users.clone();
        let groups = self.world.groups.clone();
        if let Err(e) = apply_setup(&mut self.world, username, password, root_password) {
            self.world.vfs = vfs;
            self.world.users = users;
            self.world.groups = groups;
            log::warn!("First-time setup rolled back: {e}");
            return Err(e);
        }
        self.world.record(ROOT_USER, "SETUP", username);
        log::info!("First-time setup created {username}");
        Ok(())
    }
}

fn apply_setup(world: &mut World, username: &str, password: &str, root_password: &str) -> Result<()> {
    validate_username(username, &world.config.users)?;
    if password.is_empty() {
        return Err(KernelError::InvalidArgument(
            "Password cannot be empty.".to_string(),
        ));
    }
    create_account(&mut world.users, &mut world.groups, username, Some(password))?;
    world.groups.add_member(ROOT_USER, username)?;
    world.users.change_password(ROOT_USER, root_password)?;
    world.create_home(username)?;
    Ok(())
}
