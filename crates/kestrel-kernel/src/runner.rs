//! Running command lines against the kernel state and settling the effects
//! they stop on.
//!
//! The interpreter hands back an [`Effect`] whenever a command needs
//! something it cannot do itself. Effects that only inform the caller pass
//! through; the rest (escalation, user switching, scripts, account
//! prompts) are resolved here, asking the caller for input only when a
//! request is interactive and the input has not already been supplied.

use std::collections::VecDeque;
use std::mem;

use kestrel_identity::{create_account, validate_username};
use kestrel_shell::{
    CancellationToken, ChainOp, ChainSegment, CommandRegistry, Effect, Environment, EnvironmentStack, Execution,
    Job, JobStep, ScriptHost, ScriptLine, StepBudget, parse_script, run_script, split_chains,
    substitute_positional,
};
use kestrel_types::error::{KernelError, Result};
use kestrel_vfs::ROOT_USER;

use crate::world::World;

/// Whether `line` has more than one chained segment.
fn is_chained(line: &str) -> bool {
    split_chains(line.trim()).is_ok_and(|s| s.len() > 1)
}

/// Who is running, where, and with which inputs.
pub(crate) struct Context {
    pub user: String,
    pub cwd: String,
    /// Job-local variables; `None` uses the live session's.
    pub vars: Option<EnvironmentStack>,
    pub cancel: Option<CancellationToken>,
    /// Answers for prompts, consumed in order.
    pub inputs: VecDeque<String>,
    /// Whether a missing answer may be asked of the caller. Otherwise it
    /// counts as an empty line.
    pub interactive: bool,
    pub last_status: bool,
    /// Owner of each script scope pushed so far, innermost last. `None` is
    /// the job's own stack, otherwise the login whose session it went on.
    pub scopes: Vec<Option<String>>,
}

impl Context {
    pub fn session(world: &World) -> Self {
        Self {
            user: world.current_user().to_string(),
            cwd: world.session.cwd.clone(),
            vars: None,
            cancel: None,
            inputs: VecDeque::new(),
            interactive: true,
            last_status: world.last_status,
            scopes: Vec::new(),
        }
    }

    /// Context for one step of `job`. The job's variables move into the
    /// context and must be handed back afterwards.
    pub fn job(job: &mut Job, inputs: Vec<String>) -> Self {
        Self {
            user: job.user.clone(),
            cwd: job.cwd.clone(),
            vars: Some(mem::take(&mut job.vars)),
            cancel: Some(job.token.clone()),
            inputs: inputs.into(),
            interactive: false,
            last_status: true,
            scopes: Vec::new(),
        }
    }

    fn in_session(&self) -> bool {
        self.vars.is_none()
    }
}

/// An effect waiting on caller input, with the identity it was raised
/// under and the chained segments to run once it is answered.
#[derive(Debug, Clone)]
pub(crate) struct Pending {
    pub effect: Effect,
    pub user: String,
    pub rest: Vec<ChainSegment>,
}

/// What a request produced once every stopping effect was dealt with.
#[derive(Debug, Default)]
pub(crate) struct Settled {
    pub output: Vec<String>,
    /// Last pass-through effect, for the caller to act on.
    pub notice: Option<Effect>,
    pub pending: Option<Pending>,
}

impl Settled {
    fn lines(output: Vec<String>) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }

    fn absorb(&mut self, other: Settled) {
        self.output.extend(other.output);
        if other.notice.is_some() {
            self.notice = other.notice;
        }
        self.pending = other.pending;
    }

    fn note_failure(&mut self, err: &KernelError) {
        if !matches!(err, KernelError::ExitFailure(_)) {
            self.output.push(format!("error: {err}"));
        }
    }
}

/// Work a background job step produced.
pub(crate) struct JobProgress {
    pub output: Vec<String>,
    /// Steps to run next, ahead of anything already queued.
    pub queued: Vec<JobStep>,
    /// Whether the step expanded into a script.
    pub nested: bool,
}

pub(crate) struct Runner<'a> {
    pub registry: &'a CommandRegistry,
    pub world: &'a mut World,
    pub ctx: Context,
}

impl Runner<'_> {
    fn vars_mut(&mut self) -> &mut EnvironmentStack {
        match self.ctx.vars.as_mut() {
            Some(vars) => vars,
            None => &mut self.world.session.env,
        }
    }

    /// Build an [`Environment`] over the world for the current context and
    /// hand it to `run`.
    pub fn dispatch(
        &mut self,
        stdin: Option<String>,
        run: impl FnOnce(&CommandRegistry, &mut Environment<'_>) -> Result<Execution>,
    ) -> Result<Execution> {
        let registry = self.registry;
        let world = &mut *self.world;
        let vars = match self.ctx.vars.as_mut() {
            Some(vars) => vars,
            None => &mut world.session.env,
        };
        let mut env = Environment {
            cwd: self.ctx.cwd.clone(),
            user: self.ctx.user.clone(),
            vfs: &mut world.vfs,
            users: &mut world.users,
            groups: &mut world.groups,
            sessions: &world.sessions,
            jobs: &mut world.jobs,
            vars,
            aliases: &mut world.aliases,
            history: &mut world.session.history,
            sudo: &mut world.sudo,
            clock: world.clock.as_ref(),
            config: &world.config,
            stdin,
            cancel: self.ctx.cancel.clone(),
            last_status: self.ctx.last_status,
            audit: Vec::new(),
        };
        let result = run(registry, &mut env);
        if result.is_err() {
            env.last_status = false;
        }
        self.ctx.cwd = env.cwd;
        self.ctx.last_status = env.last_status;
        world.audit.extend(env.audit);
        result
    }

    /// Run `line` and settle whatever it stops on.
    pub fn run_line(&mut self, line: &str, depth: usize, budget: &mut StepBudget) -> Result<Settled> {
        self.run_line_with(line, None, depth, budget)
    }

    pub fn run_line_with(
        &mut self,
        line: &str,
        stdin: Option<String>,
        depth: usize,
        budget: &mut StepBudget,
    ) -> Result<Settled> {
        let chained = is_chained(line);
        let exec = self.dispatch(stdin, |reg, env| reg.execute(line, env))?;
        self.settle(exec, chained, depth, budget)
    }

    /// Resolve stopping effects one by one, continuing the rest of the
    /// line after each. A chained line reports failures inline the way the
    /// interpreter does; a lone command propagates them.
    pub fn settle(
        &mut self,
        mut exec: Execution,
        chained: bool,
        depth: usize,
        budget: &mut StepBudget,
    ) -> Result<Settled> {
        let mut settled = Settled::default();
        loop {
            settled.output.append(&mut exec.output);
            let effect = match exec.effect.take() {
                Some(effect) if !effect.passes_through() => effect,
                notice => {
                    if notice.is_some() {
                        settled.notice = notice;
                    }
                    return Ok(settled);
                },
            };

            match self.resolve(effect, depth, budget) {
                Ok(resolved) => {
                    settled.absorb(resolved);
                    if let Some(pending) = settled.pending.as_mut() {
                        pending.rest.append(&mut exec.remainder);
                        return Ok(settled);
                    }
                    self.ctx.last_status = true;
                },
                Err(e @ KernelError::ScriptLimitExceeded(_)) => return Err(e),
                Err(e) if chained => {
                    settled.note_failure(&e);
                    self.ctx.last_status = false;
                },
                Err(e) => return Err(e),
            }

            if exec.remainder.is_empty() {
                return Ok(settled);
            }
            let remainder = mem::take(&mut exec.remainder);
            exec = match self.dispatch(None, |reg, env| reg.execute_segments(remainder, env)) {
                Ok(next) => next,
                Err(e) if chained => {
                    settled.note_failure(&e);
                    return Ok(settled);
                },
                Err(e) => return Err(e),
            };
        }
    }

    /// Resolve a single effect.
    pub fn resolve(&mut self, effect: Effect, depth: usize, budget: &mut StepBudget) -> Result<Settled> {
        match effect {
            Effect::SudoExec { command, password } => self.sudo_exec(command, password, depth, budget),
            Effect::SwitchUser { username, password } => self.switch_user(username, password, false),
            Effect::Login { username, password } => self.switch_user(username, password, true),
            Effect::Logout => self.logout(),
            Effect::ExecuteScript { lines, args } => {
                let output = run_script(self, &lines, &args, depth + 1, budget)?;
                Ok(Settled::lines(output))
            },
            Effect::Useradd { username } => self.useradd(username),
            Effect::Passwd { username } => self.passwd(username),
            Effect::Confirm { prompt, command } => self.confirm(prompt, command, depth, budget),
            notice => Ok(Settled {
                notice: Some(notice),
                ..Settled::default()
            }),
        }
    }

    // -- Inputs --

    fn pending(&self, effect: Effect) -> Settled {
        Settled {
            pending: Some(Pending {
                effect,
                user: self.ctx.user.clone(),
                rest: Vec::new(),
            }),
            ..Settled::default()
        }
    }

    /// Take `n` answers. `None` means the caller must be asked.
    fn take_inputs(&mut self, n: usize) -> Option<Vec<String>> {
        if self.ctx.inputs.len() >= n {
            return Some(self.ctx.inputs.drain(..n).collect());
        }
        if self.ctx.interactive {
            return None;
        }
        let mut answers: Vec<String> = self.ctx.inputs.drain(..).collect();
        answers.resize(n, String::new());
        Some(answers)
    }

    fn take_password(&mut self, given: Option<String>) -> Option<String> {
        given.or_else(|| self.take_inputs(1).and_then(|v| v.into_iter().next()))
    }

    // -- Escalation --

    fn sudo_exec(
        &mut self,
        command: String,
        password: Option<String>,
        depth: usize,
        budget: &mut StepBudget,
    ) -> Result<Settled> {
        let user = self.ctx.user.clone();
        if user != ROOT_USER {
            let groups = self.world.groups.groups_for(&user, &self.world.users);
            let sudoers = self
                .world
                .vfs
                .get_node(&self.world.config.sudo.sudoers_path)
                .and_then(|n| n.content())
                .map(str::to_string);
            if !self
                .world
                .sudo
                .can_user_run_command(&user, &groups, &command, sudoers.as_deref())
            {
                log::warn!("{user} is not in the sudoers file for '{command}'");
                self.world.record(&user, "SUDO_DENIED", command.as_str());
                return Err(KernelError::denied("sudo"));
            }
            if !self.world.sudo.is_timestamp_valid(&user) {
                let Some(attempt) = self.take_password(password) else {
                    return Ok(self.pending(Effect::SudoExec {
                        command,
                        password: None,
                    }));
                };
                if let Err(e) = self.world.users.authenticate(&user, &attempt) {
                    self.world.record(&user, "SUDO_FAILED", command.as_str());
                    return Err(e);
                }
                self.world.sudo.update_timestamp(&user);
            }
            self.world.record(&user, "SUDO", command.as_str());
        }
        self.run_as(ROOT_USER, &command, depth, budget)
    }

    /// Run `command` as `user` in the current directory. Identity and
    /// directory come back afterwards unless the command switched sessions.
    fn run_as(&mut self, user: &str, command: &str, depth: usize, budget: &mut StepBudget) -> Result<Settled> {
        let sessions = self.world.sessions.clone();
        let saved_user = mem::replace(&mut self.ctx.user, user.to_string());
        let saved_cwd = self.ctx.cwd.clone();
        let result = self.run_line(command, depth, budget);
        if self.world.sessions == sessions {
            self.ctx.user = saved_user;
            self.ctx.cwd = saved_cwd;
        }
        result
    }

    // -- Sessions --

    fn switch_user(&mut self, username: String, password: Option<String>, login: bool) -> Result<Settled> {
        if !self.ctx.in_session() {
            return Err(KernelError::InvalidArgument(
                "sessions cannot change inside a background job".to_string(),
            ));
        }
        let action = if login { "LOGIN" } else { "SU" };
        let actor = self.ctx.user.clone();
        let skip_password = !login && actor == ROOT_USER;
        if !skip_password {
            let users = &self.world.users;
            let needs_password = !users.exists(&username) || users.has_password(&username);
            let attempt = if needs_password {
                match self.take_password(password) {
                    Some(attempt) => attempt,
                    None => {
                        let effect = if login {
                            Effect::Login {
                                username,
                                password: None,
                            }
                        } else {
                            Effect::SwitchUser {
                                username,
                                password: None,
                            }
                        };
                        return Ok(self.pending(effect));
                    },
                }
            } else {
                String::new()
            };
            if let Err(e) = self.world.users.authenticate(&username, &attempt) {
                self.world.record(&actor, "AUTH_FAILED", username.as_str());
                return Err(e);
            }
        }

        self.world.enter_session(&username, login, &self.ctx.cwd);
        self.ctx.user = username.clone();
        self.ctx.cwd = self.world.session.cwd.clone();
        self.world.record(&actor, action, username);
        Ok(Settled::default())
    }

    fn logout(&mut self) -> Result<Settled> {
        if !self.ctx.in_session() {
            return Err(KernelError::InvalidArgument(
                "sessions cannot change inside a background job".to_string(),
            ));
        }
        let Some(left) = self.world.leave_session(&self.ctx.cwd) else {
            return Err(KernelError::InvalidArgument(
                "logout: no nested session to end".to_string(),
            ));
        };
        self.ctx.user = self.world.current_user().to_string();
        self.ctx.cwd = self.world.session.cwd.clone();
        self.world.record(&left, "LOGOUT", "");
        Ok(Settled::default())
    }

    // -- Accounts --

    fn read_new_password(&mut self) -> Option<Result<String>> {
        let answers = self.take_inputs(2)?;
        if answers[0] != answers[1] {
            return Some(Err(KernelError::InvalidArgument(
                "passwords do not match".to_string(),
            )));
        }
        answers.into_iter().next().map(Ok)
    }

    fn useradd(&mut self, username: String) -> Result<Settled> {
        if self.ctx.user != ROOT_USER {
            return Err(KernelError::denied("useradd"));
        }
        validate_username(&username, &self.world.config.users)?;
        if self.world.users.exists(&username) {
            return Err(KernelError::AlreadyExists(format!("user '{username}'")));
        }
        let password = match self.read_new_password() {
            Some(password) => password?,
            None => return Ok(self.pending(Effect::Useradd { username })),
        };
        let world = &mut *self.world;
        create_account(&mut world.users, &mut world.groups, &username, Some(&password))?;
        world.create_home(&username)?;
        world.record(&self.ctx.user, "USERADD", username.as_str());
        Ok(Settled::lines(vec![format!("User '{username}' created.")]))
    }

    fn passwd(&mut self, username: String) -> Result<Settled> {
        if self.ctx.user != username && self.ctx.user != ROOT_USER {
            return Err(KernelError::denied(format!("passwd {username}")));
        }
        if !self.world.users.exists(&username) {
            return Err(KernelError::InvalidArgument(format!(
                "User '{username}' does not exist."
            )));
        }
        let password = match self.read_new_password() {
            Some(password) => password?,
            None => return Ok(self.pending(Effect::Passwd { username })),
        };
        self.world.users.change_password(&username, &password)?;
        self.world.record(&self.ctx.user, "PASSWD", username.as_str());
        Ok(Settled::lines(vec![format!("Password updated for {username}.")]))
    }

    fn confirm(&mut self, prompt: String, command: String, depth: usize, budget: &mut StepBudget) -> Result<Settled> {
        let Some(answer) = self.take_inputs(1).and_then(|v| v.into_iter().next()) else {
            return Ok(self.pending(Effect::Confirm { prompt, command }));
        };
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => self.run_line(&command, depth, budget),
            _ => Ok(Settled::lines(vec!["Cancelled.".to_string()])),
        }
    }

    // -- Background jobs --

    /// Run one queued job step. A script is not run in place: its lines
    /// are handed back to be queued, with whatever followed it on the line.
    pub fn run_job_step(&mut self, command: &str, depth: usize, budget: &mut StepBudget) -> Result<JobProgress> {
        let mut exec = self.dispatch(None, |reg, env| reg.execute(command, env))?;
        if let Some(Effect::ExecuteScript { lines, args }) = &exec.effect {
            budget.check_depth(depth + 1)?;
            let mut queued: Vec<JobStep> = parse_script(lines)
                .into_iter()
                .map(|line| JobStep {
                    command: substitute_positional(&line.command, args),
                    inputs: line.inputs,
                })
                .collect();
            for segment in &exec.remainder {
                if segment.op == ChainOp::Or {
                    continue;
                }
                let command = if segment.background {
                    format!("{} &", segment.command)
                } else {
                    segment.command.clone()
                };
                queued.push(JobStep::new(command));
            }
            return Ok(JobProgress {
                output: mem::take(&mut exec.output),
                queued,
                nested: true,
            });
        }
        let settled = self.settle(exec, is_chained(command), depth, budget)?;
        Ok(JobProgress {
            output: settled.output,
            queued: Vec::new(),
            nested: false,
        })
    }
}

impl ScriptHost for Runner<'_> {
    fn enter_scope(&mut self) {
        let owner = if self.ctx.in_session() {
            Some(self.world.sessions.current().to_string())
        } else {
            None
        };
        self.vars_mut().push();
        self.ctx.scopes.push(owner);
    }

    /// Pop the scope from the stack it was pushed on. A script line may
    /// have switched sessions since, parking that stack in a snapshot.
    fn leave_scope(&mut self) {
        match self.ctx.scopes.pop() {
            Some(Some(owner)) if owner != self.world.sessions.current() => {
                if let Some(parked) = self.world.snapshots.get_mut(&owner) {
                    parked.env.pop();
                }
            },
            _ => {
                self.vars_mut().pop();
            },
        }
    }

    fn run_script_line(
        &mut self,
        line: &ScriptLine,
        depth: usize,
        budget: &mut StepBudget,
    ) -> Result<Vec<String>> {
        if self.ctx.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(KernelError::InvalidArgument("job cancelled".to_string()));
        }
        let interactive = mem::replace(&mut self.ctx.interactive, false);
        let inputs = mem::replace(&mut self.ctx.inputs, line.inputs.iter().cloned().collect());
        let result = self.run_line(&line.command, depth, budget);
        self.ctx.interactive = interactive;
        self.ctx.inputs = inputs;
        Ok(result?.output)
    }
}
