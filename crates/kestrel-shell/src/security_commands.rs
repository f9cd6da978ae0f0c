//! Security and identity commands: permissions, accounts, groups, and the
//! privilege switches (sudo, su, login, logout).

use kestrel_identity::{delete_account, validate_username};
use kestrel_types::error::{KernelError, Result};
use kestrel_vfs::{Credentials, parse_mode, path};

use crate::commands::parse_flags;
use crate::effect::Effect;
use crate::interpreter::{Command, CommandOutput, CommandRegistry, Environment};
use crate::script::quote_if_needed;

// ---------------------------------------------------------------------------
// chmod / chown / chgrp
// ---------------------------------------------------------------------------

/// Which metadata field a change targets.
#[derive(Clone, Copy)]
enum Metadata {
    Mode,
    Owner,
    Group,
}

fn change_metadata(
    command: &str,
    usage: &str,
    field: Metadata,
    args: &[&str],
    env: &mut Environment<'_>,
) -> Result<CommandOutput> {
    let (flags, operands) = parse_flags(command, args, "R")?;
    let recursive = !flags.is_empty();
    let Some((&value, paths)) = operands.split_first() else {
        return Err(KernelError::usage(usage));
    };
    if paths.is_empty() {
        return Err(KernelError::usage(usage));
    }
    match field {
        Metadata::Owner if !env.users.exists(value) => {
            return Err(KernelError::InvalidArgument(format!("invalid user: '{value}'")));
        },
        Metadata::Group if !env.groups.exists(value) => {
            return Err(KernelError::InvalidArgument(format!("invalid group: '{value}'")));
        },
        _ => {},
    }
    let mode = match field {
        Metadata::Mode => Some(parse_mode(value)?),
        _ => None,
    };
    let creds = env.credentials();
    for target in paths {
        let full = env.resolve(target);
        match (field, mode) {
            (Metadata::Mode, Some(mode)) => env.vfs.chmod(&full, mode, &creds, recursive)?,
            (Metadata::Owner, _) => env.vfs.chown(&full, value, &creds, recursive)?,
            (Metadata::Group, _) => env.vfs.chgrp(&full, value, &creds, recursive)?,
            (Metadata::Mode, None) => {},
        }
        env.record(&command.to_ascii_uppercase(), format!("{value} {full}"));
    }
    Ok(CommandOutput::None)
}

struct ChmodCmd;
impl Command for ChmodCmd {
    fn name(&self) -> &str {
        "chmod"
    }
    fn description(&self) -> &str {
        "Change file mode bits"
    }
    fn usage(&self) -> &str {
        "chmod [-R] <mode> <path...>"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        change_metadata("chmod", self.usage(), Metadata::Mode, args, env)
    }
}

struct ChownCmd;
impl Command for ChownCmd {
    fn name(&self) -> &str {
        "chown"
    }
    fn description(&self) -> &str {
        "Change file owner"
    }
    fn usage(&self) -> &str {
        "chown [-R] <user> <path...>"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        change_metadata("chown", self.usage(), Metadata::Owner, args, env)
    }
}

struct ChgrpCmd;
impl Command for ChgrpCmd {
    fn name(&self) -> &str {
        "chgrp"
    }
    fn description(&self) -> &str {
        "Change file group"
    }
    fn usage(&self) -> &str {
        "chgrp [-R] <group> <path...>"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        change_metadata("chgrp", self.usage(), Metadata::Group, args, env)
    }
}

// ---------------------------------------------------------------------------
// whoami / groups / id / listusers
// ---------------------------------------------------------------------------

struct WhoamiCmd;
impl Command for WhoamiCmd {
    fn name(&self) -> &str {
        "whoami"
    }
    fn description(&self) -> &str {
        "Print the effective user"
    }
    fn usage(&self) -> &str {
        "whoami"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn execute(&self, _args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        Ok(CommandOutput::Text(env.user.clone()))
    }
}

fn known_user<'a>(args: &[&'a str], env: &'a Environment<'_>) -> Result<&'a str> {
    let user = args.first().copied().unwrap_or(env.user.as_str());
    if env.users.exists(user) {
        Ok(user)
    } else {
        Err(KernelError::InvalidArgument(format!("{user}: no such user")))
    }
}

struct GroupsCmd;
impl Command for GroupsCmd {
    fn name(&self) -> &str {
        "groups"
    }
    fn description(&self) -> &str {
        "Print the groups a user is in"
    }
    fn usage(&self) -> &str {
        "groups [user]"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let user = known_user(args, env)?;
        Ok(CommandOutput::Text(env.groups.groups_for(user, env.users).join(" ")))
    }
}

struct IdCmd;
impl Command for IdCmd {
    fn name(&self) -> &str {
        "id"
    }
    fn description(&self) -> &str {
        "Print user and group identity"
    }
    fn usage(&self) -> &str {
        "id [user]"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let user = known_user(args, env)?;
        let primary = env.users.primary_group(user).unwrap_or(user);
        let groups = env.groups.groups_for(user, env.users);
        Ok(CommandOutput::Text(format!(
            "uid={user} gid={primary} groups={}",
            groups.join(",")
        )))
    }
}

struct ListUsersCmd;
impl Command for ListUsersCmd {
    fn name(&self) -> &str {
        "listusers"
    }
    fn description(&self) -> &str {
        "List user accounts"
    }
    fn usage(&self) -> &str {
        "listusers"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn execute(&self, _args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let rows = env
            .users
            .iter()
            .map(|(name, record)| {
                vec![
                    name.to_string(),
                    record.primary_group.clone(),
                    if record.password_hash.is_some() { "yes" } else { "no" }.to_string(),
                ]
            })
            .collect();
        Ok(CommandOutput::Table {
            headers: vec!["USER".into(), "GROUP".into(), "PASSWORD".into()],
            rows,
        })
    }
}

// ---------------------------------------------------------------------------
// passwd / useradd / removeuser / usermod
// ---------------------------------------------------------------------------

struct PasswdCmd;
impl Command for PasswdCmd {
    fn name(&self) -> &str {
        "passwd"
    }
    fn description(&self) -> &str {
        "Change a user's password"
    }
    fn usage(&self) -> &str {
        "passwd [user]"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let user = known_user(args, env)?.to_string();
        if user != env.user && !env.is_root() {
            return Err(KernelError::denied(format!("passwd {user}")));
        }
        Ok(CommandOutput::Effect(Effect::Passwd { username: user }))
    }
}

struct UseraddCmd;
impl Command for UseraddCmd {
    fn name(&self) -> &str {
        "useradd"
    }
    fn description(&self) -> &str {
        "Create a user account"
    }
    fn usage(&self) -> &str {
        "useradd <username>"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn root_required(&self) -> bool {
        true
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let [name] = args[..] else {
            return Err(KernelError::usage(self.usage()));
        };
        validate_username(name, &env.config.users)?;
        if env.users.exists(name) {
            return Err(KernelError::AlreadyExists(format!("user '{name}'")));
        }
        Ok(CommandOutput::Effect(Effect::Useradd {
            username: name.to_string(),
        }))
    }
}

struct RemoveUserCmd;
impl Command for RemoveUserCmd {
    fn name(&self) -> &str {
        "removeuser"
    }
    fn description(&self) -> &str {
        "Delete a user account"
    }
    fn usage(&self) -> &str {
        "removeuser [-r] [-f] <username>"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn root_required(&self) -> bool {
        true
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let (flags, operands) = parse_flags("removeuser", args, "rf")?;
        let [name] = operands[..] else {
            return Err(KernelError::usage(self.usage()));
        };
        let with_home = flags.contains('r');
        if !env.users.exists(name) {
            return Err(KernelError::InvalidArgument(format!(
                "User '{name}' does not exist."
            )));
        }
        if env.sessions.entries().iter().any(|u| u == name) {
            return Err(KernelError::InvalidArgument(format!(
                "Cannot remove '{name}' while they are logged in."
            )));
        }
        if !flags.contains('f') {
            let (what, flag) = if with_home {
                (" and their home directory", "-r ")
            } else {
                ("", "")
            };
            return Ok(CommandOutput::Effect(Effect::Confirm {
                prompt: format!("Remove user '{name}'{what}?"),
                command: format!("removeuser -f {flag}{name}"),
            }));
        }

        delete_account(env.users, env.groups, name)?;
        if with_home {
            let home = path::join("/home", name);
            if env.vfs.exists(&home) {
                env.vfs.remove(&home, &Credentials::root(), true)?;
            }
        }
        env.record("USERDEL", name);
        Ok(CommandOutput::Text(format!("User '{name}' removed.")))
    }
}

struct UsermodCmd;
impl Command for UsermodCmd {
    fn name(&self) -> &str {
        "usermod"
    }
    fn description(&self) -> &str {
        "Add a user to a supplementary group"
    }
    fn usage(&self) -> &str {
        "usermod -aG <group> <username>"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn root_required(&self) -> bool {
        true
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let ["-aG", group, user] = args[..] else {
            return Err(KernelError::usage(self.usage()));
        };
        if !env.users.exists(user) {
            return Err(KernelError::InvalidArgument(format!("{user}: no such user")));
        }
        if env.groups.add_member(group, user)? {
            env.record("USERMOD", format!("{user} +{group}"));
        }
        Ok(CommandOutput::None)
    }
}

// ---------------------------------------------------------------------------
// groupadd / groupdel
// ---------------------------------------------------------------------------

struct GroupaddCmd;
impl Command for GroupaddCmd {
    fn name(&self) -> &str {
        "groupadd"
    }
    fn description(&self) -> &str {
        "Create a group"
    }
    fn usage(&self) -> &str {
        "groupadd <group>"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn root_required(&self) -> bool {
        true
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let [group] = args[..] else {
            return Err(KernelError::usage(self.usage()));
        };
        env.groups.create(group)?;
        env.record("GROUPADD", group);
        Ok(CommandOutput::None)
    }
}

struct GroupdelCmd;
impl Command for GroupdelCmd {
    fn name(&self) -> &str {
        "groupdel"
    }
    fn description(&self) -> &str {
        "Delete a group"
    }
    fn usage(&self) -> &str {
        "groupdel <group>"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn root_required(&self) -> bool {
        true
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let [group] = args[..] else {
            return Err(KernelError::usage(self.usage()));
        };
        env.groups.delete(group, env.users)?;
        env.record("GROUPDEL", group);
        Ok(CommandOutput::None)
    }
}

// ---------------------------------------------------------------------------
// sudo / su / login / logout
// ---------------------------------------------------------------------------

struct SudoCmd;
impl Command for SudoCmd {
    fn name(&self) -> &str {
        "sudo"
    }
    fn description(&self) -> &str {
        "Run a command as root"
    }
    fn usage(&self) -> &str {
        "sudo <command> | sudo -k"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        match args {
            [] => Err(KernelError::usage(self.usage())),
            ["-k"] => {
                env.sudo.clear_timestamp(&env.user);
                Ok(CommandOutput::None)
            },
            _ => {
                let command = args
                    .iter()
                    .map(|a| quote_if_needed(a))
                    .collect::<Vec<_>>()
                    .join(" ");
                Ok(CommandOutput::Effect(Effect::SudoExec {
                    command,
                    password: None,
                }))
            },
        }
    }
}

struct SuCmd;
impl Command for SuCmd {
    fn name(&self) -> &str {
        "su"
    }
    fn description(&self) -> &str {
        "Switch to another user"
    }
    fn usage(&self) -> &str {
        "su [user] [password]"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn execute(&self, args: &[&str], _env: &mut Environment<'_>) -> Result<CommandOutput> {
        Ok(CommandOutput::Effect(Effect::SwitchUser {
            username: args.first().copied().unwrap_or("root").to_string(),
            password: args.get(1).map(|p| p.to_string()),
        }))
    }
}

struct LoginCmd;
impl Command for LoginCmd {
    fn name(&self) -> &str {
        "login"
    }
    fn description(&self) -> &str {
        "Log in as a user, replacing every session"
    }
    fn usage(&self) -> &str {
        "login <user> [password]"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn execute(&self, args: &[&str], _env: &mut Environment<'_>) -> Result<CommandOutput> {
        let Some(user) = args.first() else {
            return Err(KernelError::usage(self.usage()));
        };
        Ok(CommandOutput::Effect(Effect::Login {
            username: user.to_string(),
            password: args.get(1).map(|p| p.to_string()),
        }))
    }
}

struct LogoutCmd;
impl Command for LogoutCmd {
    fn name(&self) -> &str {
        "logout"
    }
    fn description(&self) -> &str {
        "End the current session"
    }
    fn usage(&self) -> &str {
        "logout"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn execute(&self, _args: &[&str], _env: &mut Environment<'_>) -> Result<CommandOutput> {
        Ok(CommandOutput::Effect(Effect::Logout))
    }
}

// ---------------------------------------------------------------------------
// audit
// ---------------------------------------------------------------------------

struct AuditCmd;
impl Command for AuditCmd {
    fn name(&self) -> &str {
        "audit"
    }
    fn description(&self) -> &str {
        "Show the security audit log"
    }
    fn usage(&self) -> &str {
        "audit [-n N]"
    }
    fn category(&self) -> &str {
        "security"
    }
    fn root_required(&self) -> bool {
        true
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let limit = match args {
            [] => None,
            ["-n", n] => Some(
                n.parse::<usize>()
                    .map_err(|_| KernelError::InvalidArgument(format!("invalid number: '{n}'")))?,
            ),
            _ => return Err(KernelError::usage(self.usage())),
        };
        let log_path = &env.config.audit.log_path;
        let content = env
            .vfs
            .get_node(log_path)
            .and_then(|n| n.content())
            .unwrap_or_default();
        let lines: Vec<&str> = content.lines().collect();
        let start = limit.map_or(0, |n| lines.len().saturating_sub(n));
        Ok(CommandOutput::Text(lines[start..].join("\n")))
    }
}

/// Register security and identity commands.
pub fn register_security_commands(reg: &mut CommandRegistry) {
    reg.register(Box::new(ChmodCmd));
    reg.register(Box::new(ChownCmd));
    reg.register(Box::new(ChgrpCmd));
    reg.register(Box::new(WhoamiCmd));
    reg.register(Box::new(GroupsCmd));
    reg.register(Box::new(IdCmd));
    reg.register(Box::new(ListUsersCmd));
    reg.register(Box::new(PasswdCmd));
    reg.register(Box::new(UseraddCmd));
    reg.register(Box::new(RemoveUserCmd));
    reg.register(Box::new(UsermodCmd));
    reg.register(Box::new(GroupaddCmd));
    reg.register(Box::new(GroupdelCmd));
    reg.register(Box::new(SudoCmd));
    reg.register(Box::new(SuCmd));
    reg.register(Box::new(LoginCmd));
    reg.register(Box::new(LogoutCmd));
    reg.register(Box::new(AuditCmd));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use kestrel_identity::create_account;

    fn with_bob() -> Fixture {
        let mut f = Fixture::new();
        create_account(&mut f.users, &mut f.groups, "bob", Some("pass1")).unwrap();
        f.vfs
            .create_directory("/home/bob", &Credentials::root(), false)
            .unwrap();
        f.vfs
            .chown("/home/bob", "bob", &Credentials::root(), false)
            .unwrap();
        f
    }

    #[test]
    fn chmod_by_owner_only() {
        let mut f = Fixture::new();
        f.run("touch mine").unwrap();
        f.run("chmod 600 mine").unwrap();
        assert_eq!(f.vfs.get_node("/home/Guest/mine").unwrap().mode, 0o600);
        assert!(f.run("chmod 999 mine").is_err());
        assert!(matches!(
            f.run("chmod 777 /etc/sudoers").unwrap_err(),
            KernelError::PermissionDenied(_)
        ));
        assert_eq!(f.audit.len(), 1);
        assert_eq!(f.audit[0].action, "CHMOD");
    }

    #[test]
    fn chown_checks_user_exists() {
        let mut f = with_bob();
        f.run("touch gift").unwrap();
        assert!(f.run("chown nobody gift").is_err());
        f.run("chown bob gift").unwrap();
        assert_eq!(f.vfs.get_node("/home/Guest/gift").unwrap().owner, "bob");
        assert!(f.run("chgrp ghosts gift").is_err());
    }

    #[test]
    fn recursive_chmod() {
        let mut f = Fixture::new();
        f.run("mkdir -p a/b; touch a/b/c").unwrap();
        f.run("chmod -R 700 a").unwrap();
        assert_eq!(f.vfs.get_node("/home/Guest/a/b/c").unwrap().mode, 0o700);
    }

    #[test]
    fn identity_queries() {
        let mut f = with_bob();
        f.as_root();
        f.run("groupadd staff; usermod -aG staff bob").unwrap();
        assert_eq!(f.text("groups bob"), "bob staff");
        assert_eq!(f.text("id bob"), "uid=bob gid=bob groups=bob,staff");
        assert_eq!(f.text("whoami"), "root");
        assert!(f.run("groups ghost").is_err());
        let listing = f.text("listusers");
        assert!(listing.starts_with("USER"));
        assert!(listing.contains("bob    bob    yes"));
    }

    #[test]
    fn passwd_self_or_root() {
        let mut f = with_bob();
        assert_eq!(
            f.run("passwd").unwrap().effect,
            Some(Effect::Passwd {
                username: "Guest".into()
            })
        );
        assert!(matches!(
            f.run("passwd bob").unwrap_err(),
            KernelError::PermissionDenied(_)
        ));
        f.as_root();
        assert!(f.run("passwd bob").is_ok());
    }

    #[test]
    fn useradd_validates_first() {
        let mut f = with_bob();
        assert!(matches!(
            f.run("useradd carol").unwrap_err(),
            KernelError::PermissionDenied(_)
        ));
        f.as_root();
        assert!(matches!(
            f.run("useradd bob").unwrap_err(),
            KernelError::AlreadyExists(_)
        ));
        assert!(f.run("useradd admin").is_err());
        assert!(f.run("useradd ab").is_err());
        assert_eq!(
            f.run("useradd carol").unwrap().effect,
            Some(Effect::Useradd {
                username: "carol".into()
            })
        );
    }

    #[test]
    fn removeuser_confirms_then_cascades() {
        let mut f = with_bob();
        assert!(matches!(
            f.run("removeuser bob").unwrap_err(),
            KernelError::PermissionDenied(_)
        ));
        f.as_root();
        let exec = f.run("removeuser -r bob").unwrap();
        assert_eq!(
            exec.effect,
            Some(Effect::Confirm {
                prompt: "Remove user 'bob' and their home directory?".into(),
                command: "removeuser -f -r bob".into(),
            })
        );
        assert!(f.users.exists("bob"));
        f.run("removeuser -f -r bob").unwrap();
        assert!(!f.users.exists("bob"));
        assert!(!f.groups.exists("bob"));
        assert!(!f.vfs.exists("/home/bob"));
        assert!(f.audit.iter().any(|e| e.action == "USERDEL"));
    }

    #[test]
    fn removeuser_refuses_logged_in_user() {
        let mut f = Fixture::new();
        f.as_root();
        assert!(f.run("removeuser -f Guest").is_err());
    }

    #[test]
    fn group_admin_is_root_only() {
        let mut f = with_bob();
        assert!(f.run("usermod -aG root bob").is_err());
        f.as_root();
        f.run("groupadd ops").unwrap();
        assert!(f.groups.exists("ops"));
        assert!(f.run("groupdel bob").is_err());
        f.run("groupdel ops").unwrap();
        assert!(!f.groups.exists("ops"));
    }

    #[test]
    fn privilege_switches_return_effects() {
        let mut f = Fixture::new();
        assert_eq!(
            f.run("sudo cat '/etc/my file'").unwrap().effect,
            Some(Effect::SudoExec {
                command: "cat '/etc/my file'".into(),
                password: None
            })
        );
        assert_eq!(
            f.run("su").unwrap().effect,
            Some(Effect::SwitchUser {
                username: "root".into(),
                password: None
            })
        );
        assert_eq!(
            f.run("login bob pw").unwrap().effect,
            Some(Effect::Login {
                username: "bob".into(),
                password: Some("pw".into())
            })
        );
        assert_eq!(f.run("logout").unwrap().effect, Some(Effect::Logout));
        assert!(f.run("login").is_err());
    }

    #[test]
    fn sudo_k_clears_timestamp() {
        let mut f = Fixture::new();
        f.sudo.update_timestamp("Guest");
        assert!(f.sudo.is_timestamp_valid("Guest"));
        f.run("sudo -k").unwrap();
        assert!(!f.sudo.is_timestamp_valid("Guest"));
    }

    #[test]
    fn audit_reads_log_as_root() {
        let mut f = Fixture::new();
        f.vfs
            .create_or_update_file("/var/log/audit.log", "a\nb\nc", &Credentials::root())
            .unwrap();
        assert!(f.run("audit").is_err());
        f.as_root();
        assert_eq!(f.text("audit -n 2"), "b\nc");
    }
}
