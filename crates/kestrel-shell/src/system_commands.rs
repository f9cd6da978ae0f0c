//! System commands: date, uptime, hostname, delay, fsck, reboot, beep, and
//! the launchers for sub-applications.

use kestrel_types::error::{KernelError, Result};

use crate::commands::parse_flags;
use crate::effect::Effect;
use crate::interpreter::{Command, CommandOutput, CommandRegistry, Environment};

// ---------------------------------------------------------------------------
// date / uptime / hostname
// ---------------------------------------------------------------------------

struct DateCmd;
impl Command for DateCmd {
    fn name(&self) -> &str {
        "date"
    }
    fn description(&self) -> &str {
        "Show current date and time"
    }
    fn usage(&self) -> &str {
        "date"
    }
    fn category(&self) -> &str {
        "system"
    }
    fn execute(&self, _args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let now = env.clock.now();
        Ok(CommandOutput::Text(
            now.format("%a %b %e %H:%M:%S UTC %Y").to_string(),
        ))
    }
}

struct UptimeCmd;
impl Command for UptimeCmd {
    fn name(&self) -> &str {
        "uptime"
    }
    fn description(&self) -> &str {
        "Show system uptime"
    }
    fn usage(&self) -> &str {
        "uptime"
    }
    fn category(&self) -> &str {
        "system"
    }
    fn execute(&self, _args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let secs = env.clock.uptime_secs();
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        let mins = (secs % 3600) / 60;
        let s = secs % 60;
        if days > 0 {
            Ok(CommandOutput::Text(format!(
                "up {days} day(s), {hours:02}:{mins:02}:{s:02}"
            )))
        } else {
            Ok(CommandOutput::Text(format!("up {hours:02}:{mins:02}:{s:02}")))
        }
    }
}

struct HostnameCmd;
impl Command for HostnameCmd {
    fn name(&self) -> &str {
        "hostname"
    }
    fn description(&self) -> &str {
        "Print system hostname"
    }
    fn usage(&self) -> &str {
        "hostname"
    }
    fn category(&self) -> &str {
        "system"
    }
    fn execute(&self, _args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        Ok(CommandOutput::Text(env.config.hostname.clone()))
    }
}

// ---------------------------------------------------------------------------
// delay
// ---------------------------------------------------------------------------

/// Longest pause a single `delay` may request.
const MAX_DELAY_MS: u64 = 60_000;

struct DelayCmd;
impl Command for DelayCmd {
    fn name(&self) -> &str {
        "delay"
    }
    fn description(&self) -> &str {
        "Pause for a number of milliseconds"
    }
    fn usage(&self) -> &str {
        "delay <ms>"
    }
    fn category(&self) -> &str {
        "system"
    }
    fn execute(&self, args: &[&str], _env: &mut Environment<'_>) -> Result<CommandOutput> {
        let [ms] = args[..] else {
            return Err(KernelError::usage(self.usage()));
        };
        let millis: u64 = ms
            .parse()
            .map_err(|_| KernelError::InvalidArgument(format!("invalid delay: '{ms}'")))?;
        if millis > MAX_DELAY_MS {
            return Err(KernelError::InvalidArgument(format!(
                "delay: at most {MAX_DELAY_MS} ms"
            )));
        }
        Ok(CommandOutput::Effect(Effect::Delay { millis }))
    }
}

// ---------------------------------------------------------------------------
// fsck
// ---------------------------------------------------------------------------

struct FsckCmd;
impl Command for FsckCmd {
    fn name(&self) -> &str {
        "fsck"
    }
    fn description(&self) -> &str {
        "Check the filesystem against the account tables"
    }
    fn usage(&self) -> &str {
        "fsck [-r]"
    }
    fn category(&self) -> &str {
        "system"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let (flags, rest) = parse_flags("fsck", args, "r")?;
        if !rest.is_empty() {
            return Err(KernelError::usage(self.usage()));
        }
        let repair = flags.contains('r');
        if repair && !env.is_root() {
            return Err(KernelError::denied("fsck -r"));
        }
        let report = env
            .vfs
            .fsck(&env.users.primary_groups(), &env.groups.name_set(), repair)?;
        if report.is_clean() {
            return Ok(CommandOutput::Text("fsck: no problems found".to_string()));
        }
        let mut lines: Vec<String> = report.issues.iter().map(ToString::to_string).collect();
        if repair {
            env.record("FSCK", format!("repaired {} issue(s)", report.issues.len()));
            lines.push(format!("fsck: repaired {} issue(s)", report.issues.len()));
        } else {
            lines.push(format!(
                "fsck: {} issue(s) found; run 'fsck -r' as root to repair",
                report.issues.len()
            ));
        }
        Ok(CommandOutput::Text(lines.join("\n")))
    }
}

// ---------------------------------------------------------------------------
// reboot / beep / edit / top
// ---------------------------------------------------------------------------

struct RebootCmd;
impl Command for RebootCmd {
    fn name(&self) -> &str {
        "reboot"
    }
    fn description(&self) -> &str {
        "Save state and restart the kernel"
    }
    fn usage(&self) -> &str {
        "reboot"
    }
    fn category(&self) -> &str {
        "system"
    }
    fn execute(&self, _args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        env.record("REBOOT", "");
        Ok(CommandOutput::Effect(Effect::Reboot))
    }
}

struct BeepCmd;
impl Command for BeepCmd {
    fn name(&self) -> &str {
        "beep"
    }
    fn description(&self) -> &str {
        "Ring the terminal bell"
    }
    fn usage(&self) -> &str {
        "beep"
    }
    fn category(&self) -> &str {
        "system"
    }
    fn execute(&self, _args: &[&str], _env: &mut Environment<'_>) -> Result<CommandOutput> {
        Ok(CommandOutput::Effect(Effect::Beep))
    }
}

struct EditCmd;
impl Command for EditCmd {
    fn name(&self) -> &str {
        "edit"
    }
    fn description(&self) -> &str {
        "Open a file in the editor"
    }
    fn usage(&self) -> &str {
        "edit [file]"
    }
    fn category(&self) -> &str {
        "system"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let args = match args {
            [] => Vec::new(),
            [file] => vec![env.resolve(file)],
            _ => return Err(KernelError::usage(self.usage())),
        };
        Ok(CommandOutput::Effect(Effect::LaunchApp {
            app: "edit".to_string(),
            args,
        }))
    }
}

struct TopCmd;
impl Command for TopCmd {
    fn name(&self) -> &str {
        "top"
    }
    fn description(&self) -> &str {
        "Open the process monitor"
    }
    fn usage(&self) -> &str {
        "top"
    }
    fn category(&self) -> &str {
        "system"
    }
    fn execute(&self, _args: &[&str], _env: &mut Environment<'_>) -> Result<CommandOutput> {
        Ok(CommandOutput::Effect(Effect::LaunchApp {
            app: "top".to_string(),
            args: Vec::new(),
        }))
    }
}

/// Register system commands.
pub fn register_system_commands(reg: &mut CommandRegistry) {
    reg.register(Box::new(DateCmd));
    reg.register(Box::new(UptimeCmd));
    reg.register(Box::new(HostnameCmd));
    reg.register(Box::new(DelayCmd));
    reg.register(Box::new(FsckCmd));
    reg.register(Box::new(RebootCmd));
    reg.register(Box::new(BeepCmd));
    reg.register(Box::new(EditCmd));
    reg.register(Box::new(TopCmd));
}
