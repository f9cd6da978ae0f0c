//! The syscall gateway: `call(domain, method, args)` over JSON values.
//!
//! Front ends that cannot hold a typed [`Kernel`] talk to it through here.
//! Every call answers `{success, data?, error?, kind?, suggestion?}`. Calls
//! made before [`Gateway::boot`] fail with `KernelNotReady`.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::{Value, json};

use kestrel_identity::{create_account, delete_account, validate_username};
use kestrel_platform::{Clock, StorageBackend};
use kestrel_shell::{Effect, Signal, parse_job_id};
use kestrel_types::error::{ErrorKind, KernelError, Result};
use kestrel_types::{Failure, KernelConfig};
use kestrel_vfs::{Access, Credentials, NodeType, ROOT_USER, ValidateOptions, parse_mode, path};

use crate::kernel::Kernel;

/// Answer to one gateway call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            kind: None,
            suggestion: None,
        }
    }

    pub fn failure(failure: Failure) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(failure.message),
            kind: Some(failure.kind),
            suggestion: failure.suggestion,
        }
    }
}

/// A kernel behind a lock, reachable by domain and method name.
#[derive(Default)]
pub struct Gateway {
    kernel: Mutex<Option<Kernel>>,
}

impl Gateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boot(
        &self,
        config: KernelConfig,
        storage: Box<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<()> {
        let kernel = Kernel::boot(config, storage, clock)?;
        self.install(kernel);
        Ok(())
    }

    /// Serve an already booted kernel.
    pub fn install(&self, kernel: Kernel) {
        *self.lock() = Some(kernel);
    }

    /// Stop serving, handing the kernel back.
    pub fn take(&self) -> Option<Kernel> {
        self.lock().take()
    }

    /// Save and stop. Later calls fail with `KernelNotReady` until the next
    /// boot.
    pub fn shutdown(&self) -> Result<()> {
        match self.take() {
            Some(kernel) => kernel.shutdown().map(drop),
            None => Ok(()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Kernel>> {
        // A panic mid-call leaves the kernel state as it was at the panic;
        // serving it is no worse than refusing.
        self.kernel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn call(&self, domain: &str, method: &str, args: &[Value]) -> Response {
        let mut guard = self.lock();
        let Some(kernel) = guard.as_mut() else {
            return Response::failure(Failure::from(KernelError::KernelNotReady));
        };
        log::debug!("syscall {domain}.{method}");
        let result = dispatch(kernel, domain, method, &Args { method, values: args });
        let committed = kernel.commit();
        match (result, committed) {
            (Ok(data), Ok(())) => Response::ok(data),
            (Err(failure), _) => Response::failure(failure),
            (Ok(_), Err(e)) => {
                log::error!("Could not persist state: {e}");
                Response::failure(Failure::from(e))
            },
        }
    }

    /// [`call`](Self::call), answered as a JSON string.
    pub fn call_json(&self, domain: &str, method: &str, args: &[Value]) -> String {
        let response = self.call(domain, method, args);
        serde_json::to_string(&response).unwrap_or_else(|e| {
            json!({ "success": false, "error": e.to_string() }).to_string()
        })
    }
}

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

struct Args<'a> {
    method: &'a str,
    values: &'a [Value],
}

impl Args<'_> {
    fn invalid(&self, i: usize, what: &str) -> KernelError {
        KernelError::InvalidArgument(format!(
            "{}: argument {} must be {what}",
            self.method,
            i + 1
        ))
    }

    fn str(&self, i: usize) -> Result<&str> {
        self.values
            .get(i)
            .and_then(Value::as_str)
            .ok_or_else(|| self.invalid(i, "a string"))
    }

    fn opt_str(&self, i: usize) -> Option<&str> {
        self.values.get(i).and_then(Value::as_str)
    }

    fn flag(&self, i: usize) -> bool {
        self.values.get(i).and_then(Value::as_bool).unwrap_or(false)
    }

    fn u64(&self, i: usize) -> Result<u64> {
        self.values
            .get(i)
            .and_then(Value::as_u64)
            .ok_or_else(|| self.invalid(i, "a non-negative integer"))
    }

    fn strings(&self, i: usize) -> Result<Vec<String>> {
        match self.values.get(i) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string).ok_or_else(|| self.invalid(i, "a list of strings")))
                .collect(),
            Some(_) => Err(self.invalid(i, "a list of strings")),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

fn dispatch(kernel: &mut Kernel, domain: &str, method: &str, args: &Args<'_>) -> std::result::Result<Value, Failure> {
    match domain {
        "executor" => executor(kernel, method, args),
        "session" if matches!(method, "push" | "pop") => session_switch(kernel, method, args),
        "users" if method == "first_time_setup" => {
            kernel.first_time_setup(args.str(0)?, args.str(1)?, args.str(2)?)?;
            Ok(Value::Null)
        },
        "jobs" if method == "poll" => Ok(to_value(&kernel.poll_jobs())?),
        _ => {
            let result = match domain {
                "filesystem" => filesystem(kernel, method, args),
                "users" => users(kernel, method, args),
                "groups" => groups(kernel, method, args),
                "session" => session(kernel, method),
                "history" => history(kernel, method, args),
                "alias" => alias(kernel, method, args),
                "env" => env(kernel, method, args),
                "sudo" => sudo(kernel, method, args),
                "jobs" => jobs(kernel, method, args),
                _ => Err(KernelError::InvalidArgument(format!("unknown domain '{domain}'"))),
            };
            result.map_err(Failure::from)
        },
    }
}

fn unknown(domain: &str, method: &str) -> KernelError {
    KernelError::InvalidArgument(format!("unknown method '{domain}.{method}'"))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn require_root(kernel: &Kernel, what: &str) -> Result<()> {
    if kernel.current_user() == ROOT_USER {
        Ok(())
    } else {
        Err(KernelError::denied(what))
    }
}

fn executor(kernel: &mut Kernel, method: &str, args: &Args<'_>) -> std::result::Result<Value, Failure> {
    let outcome = match method {
        "execute" => {
            let stdin = args.opt_str(1).map(str::to_string);
            kernel.execute_with_stdin(args.str(0)?, stdin)?
        },
        "resume" => {
            let raw = args.values.first().cloned().unwrap_or(Value::Null);
            let effect: Effect = serde_json::from_value(raw).map_err(KernelError::from)?;
            kernel.resume(effect, args.strings(1)?)?
        },
        _ => return Err(Failure::from(unknown("executor", method))),
    };
    Ok(to_value(&outcome)?)
}

/// `session.push(user, password?)` and `session.pop()`. Both go through
/// the same checks as `su` and `logout`, without prompting.
fn session_switch(kernel: &mut Kernel, method: &str, args: &Args<'_>) -> std::result::Result<Value, Failure> {
    let effect = match method {
        "push" => Effect::SwitchUser {
            username: args.str(0)?.to_string(),
            password: Some(args.opt_str(1).unwrap_or_default().to_string()),
        },
        _ => Effect::Logout,
    };
    kernel.resolve_effect(effect, Vec::new(), false)?;
    Ok(json!(kernel.current_user()))
}

// ---------------------------------------------------------------------------
// Domains
// ---------------------------------------------------------------------------

fn parse_node_type(name: &str) -> Result<NodeType> {
    match name {
        "file" => Ok(NodeType::File),
        "directory" => Ok(NodeType::Directory),
        "symlink" => Ok(NodeType::Symlink),
        _ => Err(KernelError::InvalidArgument(format!("unknown node type '{name}'"))),
    }
}

fn parse_access(name: &str) -> Result<Access> {
    match name {
        "read" | "r" => Ok(Access::Read),
        "write" | "w" => Ok(Access::Write),
        "execute" | "x" => Ok(Access::Execute),
        _ => Err(KernelError::InvalidArgument(format!("unknown permission '{name}'"))),
    }
}

/// `{expect?, require?: [..], allow_missing?, no_follow?}`
fn validate_options(value: Option<&Value>) -> Result<ValidateOptions> {
    let mut opts = ValidateOptions::new();
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(opts);
    };
    if let Some(expect) = value.get("expect").and_then(Value::as_str) {
        opts = opts.expect(parse_node_type(expect)?);
    }
    if let Some(required) = value.get("require").and_then(Value::as_array) {
        for access in required.iter().filter_map(Value::as_str) {
            opts = opts.require(parse_access(access)?);
        }
    }
    if value.get("allow_missing").and_then(Value::as_bool) == Some(true) {
        opts = opts.allow_missing();
    }
    if value.get("no_follow").and_then(Value::as_bool) == Some(true) {
        opts = opts.no_follow();
    }
    Ok(opts)
}

fn filesystem(kernel: &mut Kernel, method: &str, args: &Args<'_>) -> Result<Value> {
    if method == "save" {
        return Ok(json!({ "saved": kernel.save()? }));
    }
    let creds = kernel.credentials();
    let cwd = kernel.cwd().to_string();
    let world = &mut kernel.world;
    match method {
        "get_node" => {
            let path = path::resolve(args.str(0)?, &cwd);
            Ok(world.vfs.get_node(&path).map_or(Ok(Value::Null), to_value)?)
        },
        "resolve" => {
            let base = args.opt_str(1).unwrap_or(&cwd);
            Ok(json!(path::resolve(args.str(0)?, base)))
        },
        "validate_path" => {
            let opts = validate_options(args.values.get(1))?;
            let validated = world.vfs.validate_path(args.str(0)?, &cwd, &creds, &opts)?;
            Ok(json!({
                "path": validated.path,
                "physical": validated.physical,
                "node": validated.node.map_or(Ok(Value::Null), to_value)?,
            }))
        },
        "create_or_update_file" => {
            let path = path::resolve(args.str(0)?, &cwd);
            world.vfs.create_or_update_file(&path, args.str(1)?, &creds)?;
            Ok(Value::Null)
        },
        "create_directory" => {
            let path = path::resolve(args.str(0)?, &cwd);
            world.vfs.create_directory(&path, &creds, args.flag(1))?;
            Ok(Value::Null)
        },
        "remove" => {
            let path = path::resolve(args.str(0)?, &cwd);
            world.vfs.remove(&path, &creds, args.flag(1))?;
            Ok(Value::Null)
        },
        "chmod" => {
            let path = path::resolve(args.str(0)?, &cwd);
            let mode = parse_mode(args.str(1)?)?;
            world.vfs.chmod(&path, mode, &creds, args.flag(2))?;
            Ok(Value::Null)
        },
        "chown" => {
            let path = path::resolve(args.str(0)?, &cwd);
            let owner = args.str(1)?;
            if !world.users.exists(owner) {
                return Err(KernelError::InvalidArgument(format!("invalid user: '{owner}'")));
            }
            world.vfs.chown(&path, owner, &creds, args.flag(2))?;
            Ok(Value::Null)
        },
        "rename" => {
            let from = path::resolve(args.str(0)?, &cwd);
            let to = path::resolve(args.str(1)?, &cwd);
            world.vfs.rename(&from, &to, &creds)?;
            Ok(Value::Null)
        },
        "fsck" => {
            let repair = args.flag(0);
            if repair && !creds.is_root() {
                return Err(KernelError::denied("fsck repair"));
            }
            let report = world
                .vfs
                .fsck(&world.users.primary_groups(), &world.groups.name_set(), repair)?;
            if repair && !report.is_clean() {
                world.record(&creds.user, "FSCK", format!("repaired {} issue(s)", report.issues.len()));
            }
            to_value(&report)
        },
        "calculate_size" => {
            let path = path::resolve(args.str(0)?, &cwd);
            let size = world
                .vfs
                .size_of(&path)
                .ok_or_else(|| KernelError::NotFound(path.clone()))?;
            Ok(json!(size))
        },
        _ => Err(unknown("filesystem", method)),
    }
}

fn users(kernel: &mut Kernel, method: &str, args: &Args<'_>) -> Result<Value> {
    match method {
        "user_exists" => Ok(json!(kernel.users().exists(args.str(0)?))),
        "has_password" => Ok(json!(kernel.users().has_password(args.str(0)?))),
        "verify_password" => Ok(json!(kernel.users().verify_password(args.str(0)?, args.str(1)?))),
        "validate_username" => {
            let name = args.str(0)?;
            validate_username(name, &kernel.config().users)?;
            if kernel.users().exists(name) {
                return Err(KernelError::AlreadyExists(format!("user '{name}'")));
            }
            Ok(Value::Null)
        },
        "list" => {
            let users: Vec<Value> = kernel
                .users()
                .iter()
                .map(|(name, record)| {
                    json!({
                        "username": name,
                        "primaryGroup": record.primary_group,
                        "hasPassword": record.password_hash.is_some(),
                    })
                })
                .collect();
            Ok(Value::Array(users))
        },
        "current_user" => Ok(json!(kernel.current_user())),
        "create_user" => {
            require_root(kernel, "create_user")?;
            let name = args.str(0)?;
            validate_username(name, &kernel.config().users)?;
            let world = &mut kernel.world;
            create_account(&mut world.users, &mut world.groups, name, args.opt_str(1))?;
            world.create_home(name)?;
            world.record(ROOT_USER, "USERADD", name);
            Ok(Value::Null)
        },
        "delete_user" => {
            require_root(kernel, "delete_user")?;
            let name = args.str(0)?;
            if kernel.sessions().entries().iter().any(|u| u == name) {
                return Err(KernelError::InvalidArgument(format!(
                    "Cannot remove '{name}' while they are logged in."
                )));
            }
            let world = &mut kernel.world;
            delete_account(&mut world.users, &mut world.groups, name)?;
            if args.flag(1) {
                let home = path::join("/home", name);
                if world.vfs.exists(&home) {
                    world.vfs.remove(&home, &Credentials::root(), true)?;
                }
            }
            world.record(ROOT_USER, "USERDEL", name);
            Ok(Value::Null)
        },
        "change_password" => {
            let name = args.str(0)?;
            let actor = kernel.current_user().to_string();
            if actor != name && actor != ROOT_USER {
                return Err(KernelError::denied(format!("change_password {name}")));
            }
            kernel.world.users.change_password(name, args.str(1)?)?;
            kernel.world.record(&actor, "PASSWD", name);
            Ok(Value::Null)
        },
        _ => Err(unknown("users", method)),
    }
}

fn groups(kernel: &mut Kernel, method: &str, args: &Args<'_>) -> Result<Value> {
    match method {
        "list" => {
            let groups: serde_json::Map<String, Value> = kernel
                .groups()
                .names()
                .map(|name| {
                    let members: Vec<&String> = kernel
                        .groups()
                        .members(name)
                        .map(|m| m.iter().collect())
                        .unwrap_or_default();
                    (name.to_string(), json!(members))
                })
                .collect();
            Ok(Value::Object(groups))
        },
        "groups_for_user" => {
            let user = args.str(0)?;
            Ok(json!(kernel.groups().groups_for(user, kernel.users())))
        },
        "create" | "delete" | "add_member" | "remove_member" => {
            require_root(kernel, method)?;
            let group = args.str(0)?;
            let world = &mut kernel.world;
            let changed = match method {
                "create" => {
                    world.groups.create(group)?;
                    world.record(ROOT_USER, "GROUPADD", group);
                    true
                },
                "delete" => {
                    world.groups.delete(group, &world.users)?;
                    world.record(ROOT_USER, "GROUPDEL", group);
                    true
                },
                "add_member" => {
                    let user = args.str(1)?;
                    if !world.users.exists(user) {
                        return Err(KernelError::InvalidArgument(format!(
                            "User '{user}' does not exist."
                        )));
                    }
                    let added = world.groups.add_member(group, user)?;
                    world.record(ROOT_USER, "USERMOD", format!("{user} +{group}"));
                    added
                },
                _ => {
                    let user = args.str(1)?;
                    let removed = world.groups.remove_member(group, user)?;
                    world.record(ROOT_USER, "USERMOD", format!("{user} -{group}"));
                    removed
                },
            };
            Ok(json!(changed))
        },
        _ => Err(unknown("groups", method)),
    }
}

fn session(kernel: &Kernel, method: &str) -> Result<Value> {
    match method {
        "stack" => Ok(json!(kernel.sessions().entries())),
        "current_user" => Ok(json!(kernel.current_user())),
        "cwd" => Ok(json!(kernel.cwd())),
        _ => Err(unknown("session", method)),
    }
}

fn history(kernel: &mut Kernel, method: &str, args: &Args<'_>) -> Result<Value> {
    let history = &mut kernel.world.session.history;
    match method {
        "add" => Ok(json!(history.add(args.str(0)?))),
        "list" => Ok(json!(history.entries())),
        "clear" => {
            history.clear();
            Ok(Value::Null)
        },
        "previous" => Ok(json!(history.previous())),
        "next" => Ok(json!(history.next())),
        "search" => Ok(json!(history.search(args.str(0)?, args.flag(1)))),
        _ => Err(unknown("history", method)),
    }
}

fn alias(kernel: &mut Kernel, method: &str, args: &Args<'_>) -> Result<Value> {
    let aliases = &mut kernel.world.aliases;
    match method {
        "set" => {
            aliases.set(args.str(0)?, args.str(1)?)?;
            Ok(Value::Null)
        },
        "remove" => Ok(json!(aliases.remove(args.str(0)?))),
        "get" => Ok(json!(aliases.get(args.str(0)?))),
        "list" => Ok(to_value(aliases)?),
        _ => Err(unknown("alias", method)),
    }
}

fn env(kernel: &mut Kernel, method: &str, args: &Args<'_>) -> Result<Value> {
    let vars = &mut kernel.world.session.env;
    match method {
        "get" => Ok(json!(vars.get(args.str(0)?))),
        "set" => {
            vars.set(args.str(0)?, args.str(1)?)?;
            Ok(Value::Null)
        },
        "unset" => Ok(json!(vars.unset(args.str(0)?))),
        "list" => Ok(json!(vars.all())),
        "push" => {
            vars.push();
            Ok(json!(vars.depth()))
        },
        "pop" => Ok(json!(vars.pop())),
        _ => Err(unknown("env", method)),
    }
}

fn sudo(kernel: &mut Kernel, method: &str, args: &Args<'_>) -> Result<Value> {
    let world = &mut kernel.world;
    let user = args.str(0)?;
    match method {
        "can_user_run_command" => {
            let groups = world.groups.groups_for(user, &world.users);
            let sudoers = world
                .vfs
                .get_node(&world.config.sudo.sudoers_path)
                .and_then(|n| n.content());
            Ok(json!(world.sudo.can_user_run_command(user, &groups, args.str(1)?, sudoers)))
        },
        "is_timestamp_valid" => Ok(json!(world.sudo.is_timestamp_valid(user))),
        "update_timestamp" => {
            world.users.authenticate(user, args.opt_str(1).unwrap_or_default())?;
            world.sudo.update_timestamp(user);
            Ok(Value::Null)
        },
        "clear_timestamp" => {
            world.sudo.clear_timestamp(user);
            Ok(Value::Null)
        },
        _ => Err(unknown("sudo", method)),
    }
}

fn jobs(kernel: &mut Kernel, method: &str, args: &Args<'_>) -> Result<Value> {
    match method {
        "list" => to_value(&kernel.jobs().list()),
        "signal" => {
            let id = match args.values.first() {
                Some(Value::String(s)) => parse_job_id(s)?,
                _ => args.u64(0)?,
            };
            let signal: Signal = args.str(1)?.parse()?;
            let actor = kernel.current_user().to_string();
            let jobs = &mut kernel.world.jobs;
            let owner = jobs
                .get(id)
                .map(|j| j.user.clone())
                .ok_or_else(|| KernelError::NotFound(format!("job {id}")))?;
            if owner != actor && actor != ROOT_USER {
                return Err(KernelError::denied(format!("signal job {id}")));
            }
            jobs.signal(id, signal)?;
            Ok(Value::Null)
        },
        _ => Err(unknown("jobs", method)),
    }
}
