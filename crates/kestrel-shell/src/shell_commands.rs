//! Shell state and job control commands.

use kestrel_types::error::{KernelError, Result};

use crate::effect::Effect;
use crate::interpreter::{Command, CommandOutput, CommandRegistry, Environment};
use crate::jobs::{Signal, parse_job_id};

// ---------------------------------------------------------------------------
// history
// ---------------------------------------------------------------------------

struct HistoryCmd;
impl Command for HistoryCmd {
    fn name(&self) -> &str {
        "history"
    }
    fn description(&self) -> &str {
        "Show or clear command history"
    }
    fn usage(&self) -> &str {
        "history [-c]"
    }
    fn category(&self) -> &str {
        "shell"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        match args {
            [] => {},
            ["-c"] => {
                env.history.clear();
                return Ok(CommandOutput::Text("History cleared.".to_string()));
            },
            _ => return Err(KernelError::usage(self.usage())),
        }
        if env.history.is_empty() {
            return Ok(CommandOutput::Text("(no history)".to_string()));
        }
        let lines: Vec<String> = env
            .history
            .entries()
            .iter()
            .enumerate()
            .map(|(i, entry)| format!("  {:4}  {entry}", i + 1))
            .collect();
        Ok(CommandOutput::Text(lines.join("\n")))
    }
}

// ---------------------------------------------------------------------------
// alias / unalias
// ---------------------------------------------------------------------------

struct AliasCmd;
impl Command for AliasCmd {
    fn name(&self) -> &str {
        "alias"
    }
    fn description(&self) -> &str {
        "Define or list command aliases"
    }
    fn usage(&self) -> &str {
        "alias [name[=command]]"
    }
    fn category(&self) -> &str {
        "shell"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        if args.is_empty() {
            if env.aliases.is_empty() {
                return Ok(CommandOutput::Text("(no aliases defined)".to_string()));
            }
            let lines: Vec<String> = env
                .aliases
                .iter()
                .map(|(k, v)| format!("alias {k}='{v}'"))
                .collect();
            return Ok(CommandOutput::Text(lines.join("\n")));
        }
        let assignment = args.join(" ");
        match assignment.split_once('=') {
            Some((name, value)) => {
                env.aliases.set(name.trim(), value.trim())?;
                Ok(CommandOutput::None)
            },
            None => match env.aliases.get(&assignment) {
                Some(value) => Ok(CommandOutput::Text(format!("alias {assignment}='{value}'"))),
                None => Err(KernelError::InvalidArgument(format!(
                    "alias: {assignment}: not found"
                ))),
            },
        }
    }
}

struct UnaliasCmd;
impl Command for UnaliasCmd {
    fn name(&self) -> &str {
        "unalias"
    }
    fn description(&self) -> &str {
        "Remove aliases"
    }
    fn usage(&self) -> &str {
        "unalias <name...>"
    }
    fn category(&self) -> &str {
        "shell"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        if args.is_empty() {
            return Err(KernelError::usage(self.usage()));
        }
        for name in args {
            if !env.aliases.remove(name) {
                return Err(KernelError::InvalidArgument(format!("unalias: {name}: not found")));
            }
        }
        Ok(CommandOutput::None)
    }
}

// ---------------------------------------------------------------------------
// set / unset / export
// ---------------------------------------------------------------------------

fn list_variables(env: &Environment<'_>, prefix: &str) -> CommandOutput {
    let lines: Vec<String> = env
        .vars
        .all()
        .iter()
        .map(|(k, v)| format!("{prefix}{k}={v}"))
        .collect();
    CommandOutput::Text(lines.join("\n"))
}

fn assign(args: &[&str], env: &mut Environment<'_>) -> Result<bool> {
    let assignment = args.join(" ");
    let Some((name, value)) = assignment.split_once('=') else {
        return Ok(false);
    };
    env.vars.set(name.trim(), value)?;
    Ok(true)
}

struct SetCmd;
impl Command for SetCmd {
    fn name(&self) -> &str {
        "set"
    }
    fn description(&self) -> &str {
        "Set or show shell variables"
    }
    fn usage(&self) -> &str {
        "set [VAR[=value]]"
    }
    fn category(&self) -> &str {
        "shell"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        if args.is_empty() {
            return Ok(list_variables(env, ""));
        }
        if assign(args, env)? {
            return Ok(CommandOutput::None);
        }
        let name = args[0];
        Ok(CommandOutput::Text(match env.vars.get(name) {
            Some(value) => format!("{name}={value}"),
            None => format!("{name}: not set"),
        }))
    }
}

struct UnsetCmd;
impl Command for UnsetCmd {
    fn name(&self) -> &str {
        "unset"
    }
    fn description(&self) -> &str {
        "Remove shell variables"
    }
    fn usage(&self) -> &str {
        "unset <VAR...>"
    }
    fn category(&self) -> &str {
        "shell"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        if args.is_empty() {
            return Err(KernelError::usage(self.usage()));
        }
        for name in args {
            env.vars.unset(name);
        }
        Ok(CommandOutput::None)
    }
}

/// Variables have a single namespace, so `export` is `set` with a
/// different listing format.
struct ExportCmd;
impl Command for ExportCmd {
    fn name(&self) -> &str {
        "export"
    }
    fn description(&self) -> &str {
        "Set shell variables"
    }
    fn usage(&self) -> &str {
        "export [VAR=value]"
    }
    fn category(&self) -> &str {
        "shell"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        if args.is_empty() {
            return Ok(list_variables(env, "export "));
        }
        if assign(args, env)? {
            Ok(CommandOutput::None)
        } else {
            Err(KernelError::usage(self.usage()))
        }
    }
}

// ---------------------------------------------------------------------------
// true / false
// ---------------------------------------------------------------------------

struct TrueCmd;
impl Command for TrueCmd {
    fn name(&self) -> &str {
        "true"
    }
    fn description(&self) -> &str {
        "Succeed"
    }
    fn usage(&self) -> &str {
        "true"
    }
    fn category(&self) -> &str {
        "shell"
    }
    fn execute(&self, _args: &[&str], _env: &mut Environment<'_>) -> Result<CommandOutput> {
        Ok(CommandOutput::None)
    }
}

struct FalseCmd;
impl Command for FalseCmd {
    fn name(&self) -> &str {
        "false"
    }
    fn description(&self) -> &str {
        "Fail"
    }
    fn usage(&self) -> &str {
        "false"
    }
    fn category(&self) -> &str {
        "shell"
    }
    fn execute(&self, _args: &[&str], _env: &mut Environment<'_>) -> Result<CommandOutput> {
        Err(KernelError::ExitFailure("false".to_string()))
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct RunCmd;
impl Command for RunCmd {
    fn name(&self) -> &str {
        "run"
    }
    fn description(&self) -> &str {
        "Run a script file"
    }
    fn usage(&self) -> &str {
        "run <script> [args...]"
    }
    fn category(&self) -> &str {
        "shell"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let Some((script, rest)) = args.split_first() else {
            return Err(KernelError::usage(self.usage()));
        };
        let text = env.read_file(script)?;
        Ok(CommandOutput::Effect(Effect::ExecuteScript {
            lines: text.lines().map(str::to_string).collect(),
            args: rest.iter().map(|a| a.to_string()).collect(),
        }))
    }
}

// ---------------------------------------------------------------------------
// jobs / ps / bg / fg / kill
// ---------------------------------------------------------------------------

struct JobsCmd;
impl Command for JobsCmd {
    fn name(&self) -> &str {
        "jobs"
    }
    fn description(&self) -> &str {
        "List background jobs"
    }
    fn usage(&self) -> &str {
        "jobs"
    }
    fn category(&self) -> &str {
        "jobs"
    }
    fn execute(&self, _args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let lines: Vec<String> = env
            .jobs
            .list()
            .into_iter()
            .map(|j| format!("[{}]  {}  {}", j.id, j.status, j.command))
            .collect();
        Ok(CommandOutput::Text(lines.join("\n")))
    }
}

struct PsCmd;
impl Command for PsCmd {
    fn name(&self) -> &str {
        "ps"
    }
    fn description(&self) -> &str {
        "Show job details"
    }
    fn usage(&self) -> &str {
        "ps"
    }
    fn category(&self) -> &str {
        "jobs"
    }
    fn execute(&self, _args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let rows = env
            .jobs
            .list()
            .into_iter()
            .map(|j| {
                vec![
                    j.id.to_string(),
                    j.user,
                    j.status.to_string(),
                    j.start_time.format("%H:%M:%S").to_string(),
                    j.command,
                ]
            })
            .collect();
        Ok(CommandOutput::Table {
            headers: ["ID", "USER", "STATUS", "STARTED", "COMMAND"]
                .iter()
                .map(|h| h.to_string())
                .collect(),
            rows,
        })
    }
}

/// Resolve a job reference the effective user may control.
fn owned_job(arg: &str, env: &Environment<'_>) -> Result<u64> {
    let id = parse_job_id(arg)?;
    let job = env
        .jobs
        .get(id)
        .ok_or_else(|| KernelError::NotFound(format!("job {id}")))?;
    if job.user != env.user && !env.is_root() {
        return Err(KernelError::denied(format!("job {id}")));
    }
    Ok(id)
}

struct BgCmd;
impl Command for BgCmd {
    fn name(&self) -> &str {
        "bg"
    }
    fn description(&self) -> &str {
        "Resume a stopped job"
    }
    fn usage(&self) -> &str {
        "bg [%id]"
    }
    fn category(&self) -> &str {
        "jobs"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let id = match args {
            [] => env
                .jobs
                .last_paused()
                .ok_or_else(|| KernelError::InvalidArgument("bg: no stopped jobs".to_string()))?,
            [arg] => owned_job(arg, env)?,
            _ => return Err(KernelError::usage(self.usage())),
        };
        env.jobs.signal(id, Signal::Cont)?;
        let command = env.jobs.get(id).map(|j| j.command.clone()).unwrap_or_default();
        Ok(CommandOutput::Text(format!("[{id}] {command} &")))
    }
}

struct FgCmd;
impl Command for FgCmd {
    fn name(&self) -> &str {
        "fg"
    }
    fn description(&self) -> &str {
        "Resume a job"
    }
    fn usage(&self) -> &str {
        "fg %id"
    }
    fn category(&self) -> &str {
        "jobs"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let [arg] = args[..] else {
            return Err(KernelError::usage(self.usage()));
        };
        let id = owned_job(arg, env)?;
        env.jobs.signal(id, Signal::Cont)?;
        Ok(CommandOutput::Text(format!(
            "[{id}] continued; foreground control is not available"
        )))
    }
}

struct KillCmd;
impl Command for KillCmd {
    fn name(&self) -> &str {
        "kill"
    }
    fn description(&self) -> &str {
        "Send a signal to a job"
    }
    fn usage(&self) -> &str {
        "kill [-s SIG | -SIG] <%id|id>"
    }
    fn category(&self) -> &str {
        "jobs"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let (signal, target) = match args {
            [target] => (Signal::Term, *target),
            ["-s", name, target] => (name.parse()?, *target),
            [flag, target] if flag.starts_with('-') => (flag[1..].parse()?, *target),
            _ => return Err(KernelError::usage(self.usage())),
        };
        let id = owned_job(target, env)?;
        env.jobs.signal(id, signal)?;
        Ok(CommandOutput::None)
    }
}

// ---------------------------------------------------------------------------
// post_message / read_messages
// ---------------------------------------------------------------------------

struct PostMessageCmd;
impl Command for PostMessageCmd {
    fn name(&self) -> &str {
        "post_message"
    }
    fn description(&self) -> &str {
        "Queue a message for a job"
    }
    fn usage(&self) -> &str {
        "post_message <%id|id> <message...>"
    }
    fn category(&self) -> &str {
        "jobs"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let [target, message @ ..] = args else {
            return Err(KernelError::usage(self.usage()));
        };
        if message.is_empty() {
            return Err(KernelError::usage(self.usage()));
        }
        env.jobs.post_message(parse_job_id(target)?, &message.join(" "))?;
        Ok(CommandOutput::None)
    }
}

struct ReadMessagesCmd;
impl Command for ReadMessagesCmd {
    fn name(&self) -> &str {
        "read_messages"
    }
    fn description(&self) -> &str {
        "Take every pending message for a job"
    }
    fn usage(&self) -> &str {
        "read_messages <%id|id>"
    }
    fn category(&self) -> &str {
        "jobs"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let [target] = args[..] else {
            return Err(KernelError::usage(self.usage()));
        };
        let messages = env.jobs.read_messages(parse_job_id(target)?)?;
        Ok(CommandOutput::Text(messages.join("\n")))
    }
}

/// Register shell state and job control commands.
pub fn register_shell_commands(reg: &mut CommandRegistry) {
    reg.register(Box::new(HistoryCmd));
    reg.register(Box::new(AliasCmd));
    reg.register(Box::new(UnaliasCmd));
    reg.register(Box::new(SetCmd));
    reg.register(Box::new(UnsetCmd));
    reg.register(Box::new(ExportCmd));
    reg.register(Box::new(TrueCmd));
    reg.register(Box::new(FalseCmd));
    reg.register(Box::new(RunCmd));
    reg.register(Box::new(JobsCmd));
    reg.register(Box::new(PsCmd));
    reg.register(Box::new(BgCmd));
    reg.register(Box::new(FgCmd));
    reg.register(Box::new(KillCmd));
    reg.register(Box::new(PostMessageCmd));
    reg.register(Box::new(ReadMessagesCmd));
}
