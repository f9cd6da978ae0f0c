//! Built-in file commands and the registration entry point.

use kestrel_types::error::{KernelError, Result};
use kestrel_vfs::{Access, Node, NodeType, TransferKind, ValidateOptions, can_access, format_mode, path};

use crate::effect::Effect;
use crate::interpreter::{Command, CommandOutput, CommandRegistry, Environment};

/// Register all built-in commands into a registry.
pub fn register_builtins(reg: &mut CommandRegistry) {
    reg.register(Box::new(LsCmd));
    reg.register(Box::new(CdCmd));
    reg.register(Box::new(PwdCmd));
    reg.register(Box::new(CatCmd));
    reg.register(Box::new(MkdirCmd));
    reg.register(Box::new(RmdirCmd));
    reg.register(Box::new(RmCmd));
    reg.register(Box::new(TouchCmd));
    reg.register(Box::new(CpCmd));
    reg.register(Box::new(MvCmd));
    reg.register(Box::new(LnCmd));
    reg.register(Box::new(TreeCmd));
    reg.register(Box::new(DuCmd));
    reg.register(Box::new(EchoCmd));
    reg.register(Box::new(ClearCmd));
    crate::text_commands::register_text_commands(reg);
    crate::security_commands::register_security_commands(reg);
    crate::shell_commands::register_shell_commands(reg);
    crate::system_commands::register_system_commands(reg);
}

/// Split leading `-xyz` flags from operands. Every flag letter must appear
/// in `allowed`. A lone `-` and anything after `--` are operands.
pub(crate) fn parse_flags<'a>(
    command: &str,
    args: &[&'a str],
    allowed: &str,
) -> Result<(String, Vec<&'a str>)> {
    let mut flags = String::new();
    let mut operands = Vec::new();
    let mut only_operands = false;
    for &arg in args {
        if only_operands || arg == "-" || !arg.starts_with('-') {
            operands.push(arg);
            continue;
        }
        if arg == "--" {
            only_operands = true;
            continue;
        }
        for c in arg[1..].chars() {
            if !allowed.contains(c) {
                return Err(KernelError::InvalidArgument(format!(
                    "{command}: invalid option -- '{c}'"
                )));
            }
            flags.push(c);
        }
    }
    Ok((flags, operands))
}

// ---------------------------------------------------------------------------
// ls
// ---------------------------------------------------------------------------

struct LsCmd;
impl Command for LsCmd {
    fn name(&self) -> &str {
        "ls"
    }
    fn description(&self) -> &str {
        "List directory contents"
    }
    fn usage(&self) -> &str {
        "ls [-l] [-a] [-R] [path...]"
    }
    fn category(&self) -> &str {
        "file"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let (flags, mut targets) = parse_flags("ls", args, "laR")?;
        let opts = LsOptions {
            long: flags.contains('l'),
            all: flags.contains('a'),
            recursive: flags.contains('R'),
        };
        if targets.is_empty() {
            targets.push(".");
        }
        let creds = env.credentials();
        let mut read = ValidateOptions::new().require(Access::Read);
        if opts.long {
            read = read.no_follow();
        }
        let mut sections = Vec::new();
        for target in &targets {
            let validated = env.vfs.validate_path(target, &env.cwd, &creds, &read)?;
            let Some(node) = validated.node else {
                continue;
            };
            if !node.is_dir() {
                sections.push(format_entry(target, node, opts.long));
                continue;
            }
            let header = targets.len() > 1 || opts.recursive;
            let mut lines = Vec::new();
            list_directory(target, node, &opts, header, &creds, &mut lines);
            sections.push(lines.join("\n"));
        }
        Ok(CommandOutput::Text(sections.join("\n")))
    }
}

struct LsOptions {
    long: bool,
    all: bool,
    recursive: bool,
}

fn list_directory(
    label: &str,
    dir: &Node,
    opts: &LsOptions,
    header: bool,
    creds: &kestrel_vfs::Credentials,
    out: &mut Vec<String>,
) {
    if header {
        if !out.is_empty() {
            out.push(String::new());
        }
        out.push(format!("{label}:"));
    }
    let Some(children) = dir.children() else {
        return;
    };
    let visible = children
        .iter()
        .filter(|(name, _)| opts.all || !name.starts_with('.'));
    for (name, child) in visible.clone() {
        out.push(format_entry(name, child, opts.long));
    }
    if !opts.recursive {
        return;
    }
    for (name, child) in visible {
        if !child.is_dir() {
            continue;
        }
        let sub = path::join(label, name);
        if can_access(child, creds, Access::Read) {
            list_directory(&sub, child, opts, true, creds, out);
        } else {
            out.push(String::new());
            out.push(format!("{sub}: permission denied"));
        }
    }
}

fn format_entry(name: &str, node: &Node, long: bool) -> String {
    if !long {
        return if node.is_dir() {
            format!("{name}/")
        } else {
            name.to_string()
        };
    }
    let mut line = format!(
        "{} {:<8} {:<8} {:>6} {} {name}",
        format_mode(node.node_type(), node.mode),
        node.owner,
        node.group,
        node.size(),
        node.mtime.format("%Y-%m-%d %H:%M"),
    );
    if let Some(target) = node.target() {
        line.push_str(&format!(" -> {target}"));
    }
    line
}

// ---------------------------------------------------------------------------
// cd
// ---------------------------------------------------------------------------

struct CdCmd;
impl Command for CdCmd {
    fn name(&self) -> &str {
        "cd"
    }
    fn description(&self) -> &str {
        "Change working directory"
    }
    fn usage(&self) -> &str {
        "cd [path]"
    }
    fn category(&self) -> &str {
        "file"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let home = env
            .vars
            .get("HOME")
            .map_or_else(|| path::join("/home", &env.user), str::to_string);
        let target = args.first().copied().unwrap_or(&home);
        let creds = env.credentials();
        let opts = ValidateOptions::new()
            .expect(NodeType::Directory)
            .require(Access::Execute);
        let resolved = env.vfs.validate_path(target, &env.cwd, &creds, &opts)?.path;
        env.cwd = resolved.clone();
        Ok(CommandOutput::Effect(Effect::ChangeDirectory { path: resolved }))
    }
}

// ---------------------------------------------------------------------------
// pwd
// ---------------------------------------------------------------------------

struct PwdCmd;
impl Command for PwdCmd {
    fn name(&self) -> &str {
        "pwd"
    }
    fn description(&self) -> &str {
        "Print working directory"
    }
    fn usage(&self) -> &str {
        "pwd"
    }
    fn category(&self) -> &str {
        "file"
    }
    fn execute(&self, _args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        Ok(CommandOutput::Text(env.cwd.clone()))
    }
}

// ---------------------------------------------------------------------------
// cat
// ---------------------------------------------------------------------------

struct CatCmd;
impl Command for CatCmd {
    fn name(&self) -> &str {
        "cat"
    }
    fn description(&self) -> &str {
        "Print file contents"
    }
    fn usage(&self) -> &str {
        "cat [file...]"
    }
    fn category(&self) -> &str {
        "file"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        if args.is_empty() {
            return Ok(CommandOutput::Text(env.stdin.clone().unwrap_or_default()));
        }
        let parts = args
            .iter()
            .map(|a| env.read_file(a))
            .collect::<Result<Vec<_>>>()?;
        Ok(CommandOutput::Text(parts.join("\n")))
    }
}

// ---------------------------------------------------------------------------
// mkdir
// ---------------------------------------------------------------------------

struct MkdirCmd;
impl Command for MkdirCmd {
    fn name(&self) -> &str {
        "mkdir"
    }
    fn description(&self) -> &str {
        "Create directories"
    }
    fn usage(&self) -> &str {
        "mkdir [-p] <dir...>"
    }
    fn category(&self) -> &str {
        "file"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let (flags, dirs) = parse_flags("mkdir", args, "p")?;
        if dirs.is_empty() {
            return Err(KernelError::usage(self.usage()));
        }
        let creds = env.credentials();
        for dir in dirs {
            let full = env.resolve(dir);
            env.vfs.create_directory(&full, &creds, flags.contains('p'))?;
        }
        Ok(CommandOutput::None)
    }
}

// ---------------------------------------------------------------------------
// rmdir
// ---------------------------------------------------------------------------

struct RmdirCmd;
impl Command for RmdirCmd {
    fn name(&self) -> &str {
        "rmdir"
    }
    fn description(&self) -> &str {
        "Remove empty directories"
    }
    fn usage(&self) -> &str {
        "rmdir <dir...>"
    }
    fn category(&self) -> &str {
        "file"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        if args.is_empty() {
            return Err(KernelError::usage(self.usage()));
        }
        let creds = env.credentials();
        let opts = ValidateOptions::new()
            .expect(NodeType::Directory)
            .no_follow();
        for dir in args {
            let full = env.vfs.validate_path(dir, &env.cwd, &creds, &opts)?.path;
            env.vfs.remove(&full, &creds, false)?;
        }
        Ok(CommandOutput::None)
    }
}

// ---------------------------------------------------------------------------
// rm
// ---------------------------------------------------------------------------

struct RmCmd;
impl Command for RmCmd {
    fn name(&self) -> &str {
        "rm"
    }
    fn description(&self) -> &str {
        "Remove files or directories"
    }
    fn usage(&self) -> &str {
        "rm [-r] [-f] <path...>"
    }
    fn category(&self) -> &str {
        "file"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let (flags, targets) = parse_flags("rm", args, "rRf")?;
        let recursive = flags.contains('r') || flags.contains('R');
        let force = flags.contains('f');
        if targets.is_empty() && !force {
            return Err(KernelError::usage(self.usage()));
        }
        let creds = env.credentials();
        let opts = ValidateOptions::new().no_follow();
        for target in targets {
            let validated = match env.vfs.validate_path(target, &env.cwd, &creds, &opts) {
                Ok(v) => v,
                Err(KernelError::NotFound(_)) if force => continue,
                Err(e) => return Err(e),
            };
            let is_dir = validated.node.is_some_and(Node::is_dir);
            let full = validated.path;
            if is_dir && !recursive {
                return Err(KernelError::IsADirectory(target.to_string()));
            }
            env.vfs.remove(&full, &creds, recursive)?;
        }
        Ok(CommandOutput::None)
    }
}

// ---------------------------------------------------------------------------
// touch
// ---------------------------------------------------------------------------

struct TouchCmd;
impl Command for TouchCmd {
    fn name(&self) -> &str {
        "touch"
    }
    fn description(&self) -> &str {
        "Create empty files or update timestamps"
    }
    fn usage(&self) -> &str {
        "touch <file...>"
    }
    fn category(&self) -> &str {
        "file"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        if args.is_empty() {
            return Err(KernelError::usage(self.usage()));
        }
        let creds = env.credentials();
        for file in args {
            let full = env.resolve(file);
            env.vfs.touch(&full, &creds)?;
        }
        Ok(CommandOutput::None)
    }
}

// ---------------------------------------------------------------------------
// cp / mv
// ---------------------------------------------------------------------------

fn transfer(
    env: &mut Environment<'_>,
    operands: &[&str],
    kind: TransferKind,
    recursive: bool,
) -> Result<CommandOutput> {
    let Some((dest, sources)) = operands.split_last() else {
        return Err(KernelError::InvalidArgument("missing file operand".to_string()));
    };
    if sources.is_empty() {
        return Err(KernelError::InvalidArgument(format!(
            "missing destination file operand after '{dest}'"
        )));
    }
    let creds = env.credentials();
    let resolved: Vec<String> = sources.iter().map(|s| env.resolve(s)).collect();
    let refs: Vec<&str> = resolved.iter().map(String::as_str).collect();
    let dest = env.resolve(dest);
    let plan = env
        .vfs
        .prepare_file_operation(&refs, &dest, &creds, kind, recursive)?;
    env.vfs.commit(plan)?;
    Ok(CommandOutput::None)
}

struct CpCmd;
impl Command for CpCmd {
    fn name(&self) -> &str {
        "cp"
    }
    fn description(&self) -> &str {
        "Copy files or directories"
    }
    fn usage(&self) -> &str {
        "cp [-r] <src...> <dest>"
    }
    fn category(&self) -> &str {
        "file"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let (flags, operands) = parse_flags("cp", args, "rR")?;
        transfer(env, &operands, TransferKind::Copy, !flags.is_empty())
    }
}

struct MvCmd;
impl Command for MvCmd {
    fn name(&self) -> &str {
        "mv"
    }
    fn description(&self) -> &str {
        "Move or rename files"
    }
    fn usage(&self) -> &str {
        "mv <src...> <dest>"
    }
    fn category(&self) -> &str {
        "file"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        transfer(env, args, TransferKind::Move, true)
    }
}

// ---------------------------------------------------------------------------
// ln
// ---------------------------------------------------------------------------

struct LnCmd;
impl Command for LnCmd {
    fn name(&self) -> &str {
        "ln"
    }
    fn description(&self) -> &str {
        "Create a symbolic link"
    }
    fn usage(&self) -> &str {
        "ln -s <target> <link>"
    }
    fn category(&self) -> &str {
        "file"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let (flags, operands) = parse_flags("ln", args, "s")?;
        if !flags.contains('s') {
            return Err(KernelError::InvalidArgument(
                "ln: hard links are not supported, use -s".to_string(),
            ));
        }
        let [target, link] = operands[..] else {
            return Err(KernelError::usage(self.usage()));
        };
        let creds = env.credentials();
        let link = env.resolve(link);
        env.vfs.symlink(target, &link, &creds)?;
        Ok(CommandOutput::None)
    }
}

// ---------------------------------------------------------------------------
// tree
// ---------------------------------------------------------------------------

struct TreeCmd;
impl Command for TreeCmd {
    fn name(&self) -> &str {
        "tree"
    }
    fn description(&self) -> &str {
        "Show a directory tree"
    }
    fn usage(&self) -> &str {
        "tree [path]"
    }
    fn category(&self) -> &str {
        "file"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let target = args.first().copied().unwrap_or(".");
        let creds = env.credentials();
        let opts = ValidateOptions::new()
            .expect(NodeType::Directory)
            .require(Access::Read);
        let validated = env.vfs.validate_path(target, &env.cwd, &creds, &opts)?;
        let Some(root) = validated.node else {
            return Err(KernelError::NotFound(target.to_string()));
        };
        let mut lines = vec![target.to_string()];
        let mut counts = (0usize, 0usize);
        draw_tree(root, "", &creds, &mut lines, &mut counts);
        lines.push(String::new());
        lines.push(format!("{} directories, {} files", counts.0, counts.1));
        Ok(CommandOutput::Text(lines.join("\n")))
    }
}

fn draw_tree(
    dir: &Node,
    prefix: &str,
    creds: &kestrel_vfs::Credentials,
    lines: &mut Vec<String>,
    counts: &mut (usize, usize),
) {
    let Some(children) = dir.children() else {
        return;
    };
    let total = children.len();
    for (i, (name, child)) in children.iter().enumerate() {
        let last = i + 1 == total;
        let branch = if last { "└── " } else { "├── " };
        match child.target() {
            Some(target) => lines.push(format!("{prefix}{branch}{name} -> {target}")),
            None => lines.push(format!("{prefix}{branch}{name}")),
        }
        if child.is_dir() {
            counts.0 += 1;
            if can_access(child, creds, Access::Read) {
                let extension = if last { "    " } else { "│   " };
                draw_tree(child, &format!("{prefix}{extension}"), creds, lines, counts);
            }
        } else {
            counts.1 += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// du
// ---------------------------------------------------------------------------

struct DuCmd;
impl Command for DuCmd {
    fn name(&self) -> &str {
        "du"
    }
    fn description(&self) -> &str {
        "Show content size in bytes"
    }
    fn usage(&self) -> &str {
        "du [path...]"
    }
    fn category(&self) -> &str {
        "file"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let targets = if args.is_empty() { vec!["."] } else { args.to_vec() };
        let creds = env.credentials();
        let opts = ValidateOptions::new().require(Access::Read);
        let mut lines = Vec::new();
        for target in targets {
            let validated = env.vfs.validate_path(target, &env.cwd, &creds, &opts)?;
            let size = validated.node.map_or(0, Node::size);
            lines.push(format!("{size}\t{target}"));
        }
        Ok(CommandOutput::Text(lines.join("\n")))
    }
}

// ---------------------------------------------------------------------------
// echo
// ---------------------------------------------------------------------------

struct EchoCmd;
impl Command for EchoCmd {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Print text"
    }
    fn usage(&self) -> &str {
        "echo [text...]"
    }
    fn execute(&self, args: &[&str], _env: &mut Environment<'_>) -> Result<CommandOutput> {
        Ok(CommandOutput::Text(args.join(" ")))
    }
}

// ---------------------------------------------------------------------------
// clear
// ---------------------------------------------------------------------------

struct ClearCmd;
impl Command for ClearCmd {
    fn name(&self) -> &str {
        "clear"
    }
    fn description(&self) -> &str {
        "Clear the screen"
    }
    fn usage(&self) -> &str {
        "clear"
    }
    fn execute(&self, _args: &[&str], _env: &mut Environment<'_>) -> Result<CommandOutput> {
        Ok(CommandOutput::Effect(Effect::ClearScreen))
    }
}
