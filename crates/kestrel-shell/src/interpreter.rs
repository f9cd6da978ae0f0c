//! Command trait, registry, and dispatch logic.
//!
//! A line is split into chains (`;`, `&&`, `||`, `&`), each chain segment
//! into pipes, and each stage has its redirections peeled off before dollar
//! expansion, tokenizing, alias and brace expansion, globbing, and dispatch.

use std::collections::{BTreeMap, VecDeque};

use kestrel_identity::{GroupRegistry, SessionStack, SudoAuthorizer, UserRegistry};
use kestrel_platform::Clock;
use kestrel_types::KernelConfig;
use kestrel_types::error::{KernelError, Result};
use kestrel_vfs::{Access, Credentials, NodeType, ROOT_USER, ValidateOptions, Vfs, can_access, path};

use crate::alias::AliasTable;
use crate::effect::Effect;
use crate::env::{DEFAULT_PATH, EnvironmentStack, is_valid_name};
use crate::history::History;
use crate::jobs::{CancellationToken, JobTable};

/// Output produced by a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    /// Plain text lines.
    Text(String),
    /// Tabular data (header row + data rows).
    Table {
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    /// Command produced no visible output.
    None,
    /// A request for the caller.
    Effect(Effect),
}

impl CommandOutput {
    /// The output as text, or `None` for silent and effect results.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Text(t) => Some(t.clone()),
            Self::Table { headers, rows } => Some(render_table(headers, rows)),
            Self::None | Self::Effect(_) => None,
        }
    }
}

/// Left-align every column but the last, two spaces apart.
pub fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            let len = cell.chars().count();
            match widths.get_mut(i) {
                Some(w) => *w = (*w).max(len),
                None => widths.push(len),
            }
        }
    }
    let format_row = |cells: &[String]| {
        let last = cells.len().saturating_sub(1);
        cells
            .iter()
            .enumerate()
            .map(|(i, c)| {
                if i == last {
                    c.clone()
                } else {
                    format!("{c:<w$}", w = widths[i])
                }
            })
            .collect::<Vec<_>>()
            .join("  ")
    };
    let mut lines = vec![format_row(headers)];
    lines.extend(rows.iter().map(|r| format_row(r)));
    lines.join("\n")
}

/// A security-relevant action, flushed to the audit log by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub actor: String,
    pub action: String,
    pub details: String,
}

/// Shared mutable environment passed to every command.
pub struct Environment<'a> {
    /// Current working directory (VFS path).
    pub cwd: String,
    /// Effective user.
    pub user: String,
    pub vfs: &'a mut Vfs,
    pub users: &'a mut UserRegistry,
    pub groups: &'a mut GroupRegistry,
    pub sessions: &'a SessionStack,
    pub jobs: &'a mut JobTable,
    pub vars: &'a mut EnvironmentStack,
    pub aliases: &'a mut AliasTable,
    pub history: &'a mut History,
    pub sudo: &'a mut SudoAuthorizer,
    pub clock: &'a dyn Clock,
    pub config: &'a KernelConfig,
    /// Piped input from a previous command in a pipeline.
    pub stdin: Option<String>,
    /// Set when running inside a background job.
    pub cancel: Option<CancellationToken>,
    /// Whether the last command succeeded (`$?`).
    pub last_status: bool,
    /// Security events raised while the line ran.
    pub audit: Vec<AuditEvent>,
}

impl Environment<'_> {
    /// The effective user's identity for permission checks.
    pub fn credentials(&self) -> Credentials {
        let primary = self
            .users
            .primary_group(&self.user)
            .unwrap_or(&self.user)
            .to_string();
        Credentials::new(&self.user, primary, self.groups.groups_for(&self.user, self.users))
    }

    pub fn is_root(&self) -> bool {
        self.user == ROOT_USER
    }

    /// Resolve a path argument against the working directory.
    pub fn resolve(&self, arg: &str) -> String {
        path::resolve(arg, &self.cwd)
    }

    /// Read a regular file the effective user may read.
    pub fn read_file(&self, arg: &str) -> Result<String> {
        let creds = self.credentials();
        let opts = ValidateOptions::new()
            .expect(NodeType::File)
            .require(Access::Read);
        let validated = self.vfs.validate_path(arg, &self.cwd, &creds, &opts)?;
        Ok(validated
            .node
            .and_then(|n| n.content())
            .unwrap_or_default()
            .to_string())
    }

    pub fn record(&mut self, action: &str, details: impl Into<String>) {
        self.audit.push(AuditEvent {
            actor: self.user.clone(),
            action: action.to_string(),
            details: details.into(),
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// A single executable command.
pub trait Command: Send + Sync {
    /// The command name (what the user types).
    fn name(&self) -> &str;

    /// One-line description for `help`.
    fn description(&self) -> &str;

    /// Usage string (e.g. "ls \[path\]").
    fn usage(&self) -> &str;

    /// Category for grouping in `help`.
    fn category(&self) -> &str {
        "general"
    }

    /// Only root may run this command.
    fn root_required(&self) -> bool {
        false
    }

    /// Run the command.
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput>;
}

/// Everything a command line produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    pub output: Vec<String>,
    /// The last pass-through effect, or the effect that stopped the line.
    pub effect: Option<Effect>,
    /// Segments still to run once a stopping effect has been resolved.
    pub remainder: Vec<ChainSegment>,
}

impl Execution {
    pub fn text(&self) -> String {
        self.output.join("\n")
    }

    /// Whether the line stopped on an effect the kernel must handle.
    pub fn is_suspended(&self) -> bool {
        self.effect.as_ref().is_some_and(|e| !e.passes_through())
    }
}

/// Commands intercepted before the registry because they need it.
const INTERCEPTED: [&str; 2] = ["help", "which"];
/// Nesting bound for `$(...)`.
const MAX_SUBSTITUTION_DEPTH: usize = 16;

/// Registry of available commands.
#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Box<dyn Command>>,
}

impl CommandRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command. Replaces any existing command with the same name.
    pub fn register(&mut self, cmd: Box<dyn Command>) {
        self.commands.insert(cmd.name().to_ascii_lowercase(), cmd);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Command> {
        self.commands
            .get(&name.to_ascii_lowercase())
            .map(|c| c.as_ref())
    }

    /// Name and description of every registered command.
    pub fn list_commands(&self) -> Vec<(&str, &str)> {
        self.commands
            .values()
            .map(|c| (c.name(), c.description()))
            .collect()
    }

    /// Parse and execute a command line.
    pub fn execute(&self, line: &str, env: &mut Environment<'_>) -> Result<Execution> {
        self.execute_at(line, env, 0)
    }

    /// Continue the segments left over by a suspended line.
    pub fn execute_segments(
        &self,
        segments: Vec<ChainSegment>,
        env: &mut Environment<'_>,
    ) -> Result<Execution> {
        self.run_segments(segments, env, 0)
    }

    fn execute_at(&self, line: &str, env: &mut Environment<'_>, depth: usize) -> Result<Execution> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Execution::default());
        }
        let segments = split_chains(trimmed)?;
        self.run_segments(segments, env, depth)
    }

    fn run_segments(
        &self,
        segments: Vec<ChainSegment>,
        env: &mut Environment<'_>,
        depth: usize,
    ) -> Result<Execution> {
        let single = segments.len() == 1;
        let mut queue: VecDeque<ChainSegment> = segments.into();
        let mut exec = Execution::default();

        while let Some(segment) = queue.pop_front() {
            let should_run = match segment.op {
                ChainOp::Always => true,
                ChainOp::And => env.last_status,
                ChainOp::Or => !env.last_status,
            };
            if !should_run {
                continue;
            }

            if segment.background {
                let job_id = env.jobs.spawn(
                    &segment.command,
                    &env.user,
                    &env.cwd,
                    EnvironmentStack::from(env.vars.all().clone()),
                    env.clock.now(),
                );
                exec.output.push(format!("[{job_id}] {}", segment.command));
                exec.effect = Some(Effect::Background {
                    job_id,
                    command: segment.command,
                });
                env.last_status = true;
                continue;
            }

            match self.execute_pipeline(&segment.command, env, depth) {
                Ok(CommandOutput::Effect(effect)) => {
                    env.last_status = true;
                    if effect == Effect::ClearScreen {
                        exec.output.clear();
                    }
                    let stops = !effect.passes_through();
                    exec.effect = Some(effect);
                    if stops {
                        exec.remainder = queue.into_iter().collect();
                        return Ok(exec);
                    }
                },
                Ok(output) => {
                    env.last_status = true;
                    if let Some(text) = output.as_text()
                        && !text.is_empty()
                    {
                        exec.output.push(text);
                    }
                },
                Err(e) => {
                    env.last_status = false;
                    if single {
                        return Err(e);
                    }
                    log::debug!("chain segment '{}' failed: {e}", segment.command);
                    if !matches!(e, KernelError::ExitFailure(_)) {
                        exec.output.push(format!("error: {e}"));
                    }
                },
            }
        }
        Ok(exec)
    }

    /// Execute a pipeline: `cmd1 | cmd2 | cmd3`.
    fn execute_pipeline(
        &self,
        pipeline: &str,
        env: &mut Environment<'_>,
        depth: usize,
    ) -> Result<CommandOutput> {
        let stages = split_pipes(pipeline)?;
        if stages.len() == 1 {
            return self.execute_redirected(&stages[0], env, depth);
        }

        let mut stdin = env.stdin.take();
        let last = stages.len() - 1;
        for (i, stage) in stages.iter().enumerate() {
            env.stdin = stdin.take();
            let wrap = |source: KernelError| KernelError::Pipeline {
                segment: stage.clone(),
                source: Box::new(source),
            };
            let result = self.execute_redirected(stage, env, depth).map_err(wrap)?;
            if i == last {
                env.stdin = None;
                return Ok(result);
            }
            if let CommandOutput::Effect(effect) = &result
                && !effect.passes_through()
            {
                env.stdin = None;
                return Err(wrap(KernelError::InvalidArgument(
                    "cannot be used in a pipeline".to_string(),
                )));
            }
            stdin = result.as_text();
        }
        Ok(CommandOutput::None)
    }

    /// Execute one stage, handling `<`, `>` and `>>`.
    fn execute_redirected(
        &self,
        stage: &str,
        env: &mut Environment<'_>,
        depth: usize,
    ) -> Result<CommandOutput> {
        let (command, redirects) = parse_redirects(stage)?;
        if let Some(input) = &redirects.input {
            env.stdin = Some(env.read_file(input)?);
        }

        let result = self.execute_simple(&command, env, depth)?;

        let Some(target) = redirects.output else {
            return Ok(result);
        };
        if matches!(result, CommandOutput::Effect(_)) {
            return Ok(result);
        }
        let text = result.as_text().unwrap_or_default();
        let path = env.resolve(&target.path);
        let content = if target.append {
            match env.vfs.get_node(&path).and_then(|n| n.content()) {
                Some(existing) if !existing.is_empty() => format!("{existing}\n{text}"),
                _ => text,
            }
        } else {
            text
        };
        let creds = env.credentials();
        env.vfs.create_or_update_file(&path, &content, &creds)?;
        Ok(CommandOutput::None)
    }

    /// Expand and dispatch a single command.
    fn execute_simple(
        &self,
        command: &str,
        env: &mut Environment<'_>,
        depth: usize,
    ) -> Result<CommandOutput> {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Ok(CommandOutput::None);
        }

        let expanded = self.expand_dollars(trimmed, env, depth)?;
        let words = split_words(&expanded)?;
        let words = expand_alias(words, env.aliases)?;

        let mut tokens = Vec::new();
        for word in words {
            if word.quoted {
                tokens.push(word.text);
                continue;
            }
            for piece in expand_braces(&word.text) {
                let piece = expand_tilde(piece, env);
                tokens.extend(expand_glob(&piece, env));
            }
        }
        if tokens.is_empty() {
            return Ok(CommandOutput::None);
        }
        self.dispatch(&tokens, env)
    }

    fn dispatch(&self, tokens: &[String], env: &mut Environment<'_>) -> Result<CommandOutput> {
        if tokens.iter().all(|t| assignment(t).is_some()) {
            for token in tokens {
                if let Some((name, value)) = assignment(token) {
                    env.vars.set(name, value)?;
                }
            }
            return Ok(CommandOutput::None);
        }

        let name = tokens[0].as_str();
        let args: Vec<&str> = tokens[1..].iter().map(String::as_str).collect();

        match name.to_ascii_lowercase().as_str() {
            "help" => return self.execute_help(&args),
            "which" => return self.execute_which(&args, env),
            _ => {},
        }

        if let Some(cmd) = self.get(name) {
            if cmd.root_required() && !env.is_root() {
                return Err(KernelError::denied(cmd.name()));
            }
            log::debug!("dispatch {} {:?} as {}", cmd.name(), args, env.user);
            return cmd.execute(&args, env);
        }

        if let Some(script) = find_executable(name, env)? {
            return Ok(CommandOutput::Effect(Effect::ExecuteScript {
                lines: script.lines().map(str::to_string).collect(),
                args: args.iter().map(|a| a.to_string()).collect(),
            }));
        }
        Err(KernelError::CommandNotFound(name.to_string()))
    }

    // -- Dollar expansion --

    /// Expand `$VAR`, `${VAR}`, `$?`, `$PWD` and `$(...)` outside single
    /// quotes. Quotes and escapes are kept for the tokenizer.
    fn expand_dollars(&self, input: &str, env: &mut Environment<'_>, depth: usize) -> Result<String> {
        let chars: Vec<char> = input.chars().collect();
        let mut out = String::with_capacity(input.len());
        let mut in_single = false;
        let mut in_double = false;
        let mut i = 0;

        while i < chars.len() {
            let ch = chars[i];
            match ch {
                '\\' if !in_single => {
                    out.push(ch);
                    if let Some(&next) = chars.get(i + 1) {
                        out.push(next);
                    }
                    i += 2;
                    continue;
                },
                '\'' if !in_double => in_single = !in_single,
                '"' if !in_single => in_double = !in_double,
                '$' if !in_single => {
                    if let Some((value, consumed)) = self.expand_one(&chars[i..], env, depth)? {
                        out.push_str(&escape_expansion(&value, in_double));
                        i += consumed;
                        continue;
                    }
                },
                _ => {},
            }
            out.push(ch);
            i += 1;
        }
        Ok(out)
    }

    /// Expand the `$` form at the start of `chars`. Returns the value and
    /// the number of chars consumed, or `None` for a literal `$`.
    fn expand_one(
        &self,
        chars: &[char],
        env: &mut Environment<'_>,
        depth: usize,
    ) -> Result<Option<(String, usize)>> {
        match chars.get(1).copied() {
            Some('?') => Ok(Some((status_code(env.last_status).to_string(), 2))),
            Some('(') => {
                let close = matching_paren(chars, 1).ok_or_else(|| {
                    KernelError::InvalidArgument("unterminated command substitution".to_string())
                })?;
                let inner: String = chars[2..close].iter().collect();
                let value = self.substitute(&inner, env, depth)?;
                Ok(Some((value, close + 1)))
            },
            Some('{') => match chars[2..].iter().position(|&c| c == '}') {
                Some(len) => {
                    let name: String = chars[2..2 + len].iter().collect();
                    Ok(Some((lookup_var(&name, env), len + 3)))
                },
                None => Ok(None),
            },
            Some(c) if c.is_ascii_alphanumeric() || c == '_' => {
                let len = chars[1..]
                    .iter()
                    .take_while(|c| c.is_ascii_alphanumeric() || **c == '_')
                    .count();
                let name: String = chars[1..1 + len].iter().collect();
                Ok(Some((lookup_var(&name, env), len + 1)))
            },
            _ => Ok(None),
        }
    }

    /// Run `$(...)` and return its output without trailing newlines.
    fn substitute(&self, inner: &str, env: &mut Environment<'_>, depth: usize) -> Result<String> {
        if depth >= MAX_SUBSTITUTION_DEPTH {
            return Err(KernelError::InvalidArgument(
                "command substitution nested too deeply".to_string(),
            ));
        }
        let saved_stdin = env.stdin.take();
        let result = self.execute_at(inner, env, depth + 1);
        env.stdin = saved_stdin;
        let exec = result?;
        if exec.is_suspended() {
            return Err(KernelError::InvalidArgument(format!(
                "{inner}: cannot run inside $(...)"
            )));
        }
        Ok(exec.text().trim_end_matches('\n').to_string())
    }

    // -- Intercepted built-ins --

    /// Built-in help with access to the registry.
    fn execute_help(&self, args: &[&str]) -> Result<CommandOutput> {
        if let Some(&name) = args.first() {
            return match self.get(name) {
                Some(cmd) => Ok(CommandOutput::Text(format!(
                    "{} ({})\n  {}\n  Usage: {}",
                    cmd.name(),
                    cmd.category(),
                    cmd.description(),
                    cmd.usage()
                ))),
                None if INTERCEPTED.contains(&name) => {
                    Ok(CommandOutput::Text(format!("{name}: shell built-in")))
                },
                None => Err(KernelError::CommandNotFound(name.to_string())),
            };
        }

        let mut categories: BTreeMap<&str, Vec<(&str, &str)>> = BTreeMap::new();
        categories
            .entry("general")
            .or_default()
            .extend([("help", "Show available commands"), ("which", "Locate a command")]);
        for cmd in self.commands.values() {
            categories
                .entry(cmd.category())
                .or_default()
                .push((cmd.name(), cmd.description()));
        }

        let total: usize = categories.values().map(Vec::len).sum();
        let mut out = format!("Commands ({total}):\n");
        for (cat, mut cmds) in categories {
            cmds.sort_by_key(|(name, _)| *name);
            out.push_str(&format!("\n  [{cat}]\n"));
            for (name, desc) in cmds {
                out.push_str(&format!("    {name:12} {desc}\n"));
            }
        }
        out.push_str("\nType 'help <command>' for details.");
        Ok(CommandOutput::Text(out))
    }

    /// Built-in `which`: alias, then built-in, then `$PATH`.
    fn execute_which(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let name = args.first().ok_or_else(|| KernelError::usage("which <command>"))?;
        if let Some(expansion) = env.aliases.get(name) {
            return Ok(CommandOutput::Text(format!("{name}: aliased to '{expansion}'")));
        }
        if INTERCEPTED.contains(name) {
            return Ok(CommandOutput::Text(format!("{name}: shell built-in")));
        }
        if let Some(cmd) = self.get(name) {
            return Ok(CommandOutput::Text(format!(
                "{}: {} ({})",
                cmd.name(),
                cmd.description(),
                cmd.category()
            )));
        }
        match executable_candidates(name, env)
            .into_iter()
            .find(|p| env.vfs.get_node(p).is_some_and(|n| n.is_file()))
        {
            Some(path) => Ok(CommandOutput::Text(path)),
            None => Err(KernelError::CommandNotFound(name.to_string())),
        }
    }
}

fn status_code(ok: bool) -> u8 {
    if ok { 0 } else { 1 }
}

fn lookup_var(name: &str, env: &Environment<'_>) -> String {
    match name {
        "PWD" => env.cwd.clone(),
        "?" => status_code(env.last_status).to_string(),
        _ => env.vars.get(name).unwrap_or_default().to_string(),
    }
}

/// Index of the `)` closing the `(` at `open`.
fn matching_paren(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_single = false;
    for (i, &c) in chars.iter().enumerate().skip(open) {
        match c {
            '\'' => in_single = !in_single,
            '(' if !in_single => depth += 1,
            ')' if !in_single => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            },
            _ => {},
        }
    }
    None
}

/// Split `NAME=value`, if `token` is one.
fn assignment(token: &str) -> Option<(&str, &str)> {
    let (name, value) = token.split_once('=')?;
    is_valid_name(name).then_some((name, value))
}

fn executable_candidates(name: &str, env: &Environment<'_>) -> Vec<String> {
    if name.contains('/') {
        return vec![env.resolve(name)];
    }
    env.vars
        .get("PATH")
        .unwrap_or(DEFAULT_PATH)
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| path::join(&path::resolve(dir, "/"), name))
        .collect()
}

/// Find a script named by `name` on `$PATH` (or at a path containing `/`).
/// The file must be readable and executable.
fn find_executable(name: &str, env: &Environment<'_>) -> Result<Option<String>> {
    let Some(path) = executable_candidates(name, env)
        .into_iter()
        .find(|p| env.vfs.get_node(p).is_some_and(|n| n.is_file()))
    else {
        return Ok(None);
    };
    let creds = env.credentials();
    let opts = ValidateOptions::new()
        .expect(NodeType::File)
        .require(Access::Read)
        .require(Access::Execute);
    let validated = env.vfs.validate_path(&path, "/", &creds, &opts)?;
    Ok(validated.node.and_then(|n| n.content()).map(str::to_string))
}

// ---------------------------------------------------------------------------
// Quote tracking
// ---------------------------------------------------------------------------

/// Quote and escape state while scanning a raw line.
#[derive(Default)]
struct Quotes {
    single: bool,
    double: bool,
    escaped: bool,
}

impl Quotes {
    /// Advance past `ch`. Returns whether it is unquoted and unescaped, and
    /// so may be shell syntax.
    fn feed(&mut self, ch: char) -> bool {
        if self.escaped {
            self.escaped = false;
            return false;
        }
        if self.single {
            if ch == '\'' {
                self.single = false;
            }
            return false;
        }
        match ch {
            '\\' => {
                self.escaped = true;
                false
            },
            '"' => {
                self.double = !self.double;
                false
            },
            '\'' if !self.double => {
                self.single = true;
                false
            },
            _ => !self.double,
        }
    }
}

// ---------------------------------------------------------------------------
// Tokenizing
// ---------------------------------------------------------------------------

/// One shell word. `quoted` words skip brace and glob expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Word {
    text: String,
    quoted: bool,
}

/// Tokenize a command line respecting quotes and backslash escapes.
///
/// - Single-quoted strings preserve all characters literally.
/// - Double-quoted strings allow `$VAR` expansion (done before tokenize).
/// - Backslash escapes the next character outside of quotes.
pub fn tokenize(input: &str) -> Result<Vec<String>> {
    Ok(split_words(input)?.into_iter().map(|w| w.text).collect())
}

fn split_words(input: &str) -> Result<Vec<Word>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = input.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(ch) = chars.next() {
        if in_single {
            if ch == '\'' {
                in_single = false;
            } else {
                current.push(ch);
            }
        } else if in_double {
            match ch {
                '"' => in_double = false,
                '\\' => match chars.peek() {
                    Some(&next @ ('"' | '\\' | '$')) => {
                        current.push(next);
                        chars.next();
                    },
                    _ => current.push('\\'),
                },
                _ => current.push(ch),
            }
        } else {
            match ch {
                '\'' => {
                    in_single = true;
                    quoted = true;
                },
                '"' => {
                    in_double = true;
                    quoted = true;
                },
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                        quoted = true;
                    }
                },
                c if c.is_whitespace() => {
                    if !current.is_empty() || quoted {
                        words.push(Word {
                            text: std::mem::take(&mut current),
                            quoted,
                        });
                    }
                    quoted = false;
                },
                _ => current.push(ch),
            }
        }
    }

    if in_single {
        return Err(KernelError::InvalidArgument(
            "unterminated single quote".to_string(),
        ));
    }
    if in_double {
        return Err(KernelError::InvalidArgument(
            "unterminated double quote".to_string(),
        ));
    }
    if !current.is_empty() || quoted {
        words.push(Word {
            text: current,
            quoted,
        });
    }
    Ok(words)
}

/// Escape an expanded value so tokenizing keeps its quote characters as
/// text. Whitespace is left alone so unquoted values still split.
fn escape_expansion(value: &str, in_double: bool) -> String {
    let special: &[char] = if in_double {
        &['"', '\\', '$']
    } else {
        &['\'', '"', '\\']
    };
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if special.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Replace the first word by its alias, once.
fn expand_alias(mut words: Vec<Word>, aliases: &AliasTable) -> Result<Vec<Word>> {
    let Some(first) = words.first() else {
        return Ok(words);
    };
    if first.quoted {
        return Ok(words);
    }
    match aliases.get(&first.text) {
        Some(expansion) => {
            let mut expanded = split_words(expansion)?;
            expanded.extend(words.drain(1..));
            Ok(expanded)
        },
        None => Ok(words),
    }
}

fn expand_tilde(word: String, env: &Environment<'_>) -> String {
    let home = || {
        env.vars
            .get("HOME")
            .map_or_else(|| path::join("/home", &env.user), str::to_string)
    };
    if word == "~" {
        home()
    } else if let Some(rest) = word.strip_prefix("~/") {
        path::join(&home(), rest)
    } else {
        word
    }
}

// ---------------------------------------------------------------------------
// Brace expansion
// ---------------------------------------------------------------------------

/// Upper bound on the words one brace expression may produce.
const MAX_BRACE_WORDS: usize = 1024;

/// Expand `{a,b}` alternatives and `{1..3}` / `{a..c}` ranges.
fn expand_braces(word: &str) -> Vec<String> {
    let Some((open, close)) = find_brace_group(word) else {
        return vec![word.to_string()];
    };
    let Some(alternatives) = brace_alternatives(&word[open + 1..close]) else {
        return vec![word.to_string()];
    };
    let (prefix, suffix) = (&word[..open], &word[close + 1..]);
    let mut out = Vec::new();
    for alt in alternatives {
        for expanded in expand_braces(&format!("{prefix}{alt}{suffix}")) {
            if out.len() >= MAX_BRACE_WORDS {
                return out;
            }
            out.push(expanded);
        }
    }
    out
}

/// Byte offsets of the first `{` and its matching `}`.
fn find_brace_group(word: &str) -> Option<(usize, usize)> {
    let open = word.find('{')?;
    let mut depth = 0usize;
    for (i, c) in word[open..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((open, open + i));
                }
            },
            _ => {},
        }
    }
    None
}

fn brace_alternatives(body: &str) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in body.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(body[start..i].to_string());
                start = i + 1;
            },
            _ => {},
        }
    }
    if !parts.is_empty() {
        parts.push(body[start..].to_string());
        return Some(parts);
    }

    let (from, to) = body.split_once("..")?;
    if let (Ok(a), Ok(b)) = (from.parse::<i64>(), to.parse::<i64>()) {
        if a.abs_diff(b) as usize >= MAX_BRACE_WORDS {
            return None;
        }
        let range: Vec<String> = if a <= b {
            (a..=b).map(|n| n.to_string()).collect()
        } else {
            (b..=a).rev().map(|n| n.to_string()).collect()
        };
        return Some(range);
    }
    let (mut a_chars, mut b_chars) = (from.chars(), to.chars());
    match (a_chars.next(), a_chars.next(), b_chars.next(), b_chars.next()) {
        (Some(a), None, Some(b), None) if a.is_ascii_alphabetic() && b.is_ascii_alphabetic() => {
            let range: Vec<String> = if a <= b {
                (a..=b).map(String::from).collect()
            } else {
                (b..=a).rev().map(String::from).collect()
            };
            Some(range)
        },
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Chain splitting: ;, &&, ||, &
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOp {
    /// First command or after `;` or `&`.
    Always,
    /// After `&&` -- run only if previous succeeded.
    And,
    /// After `||` -- run only if previous failed.
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSegment {
    pub command: String,
    pub op: ChainOp,
    /// Ended by a lone `&`.
    pub background: bool,
}

/// Split a command line on `;`, `&&`, `||` and `&` (respecting quotes).
pub fn split_chains(input: &str) -> Result<Vec<ChainSegment>> {
    let chars: Vec<char> = input.chars().collect();
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut op = ChainOp::Always;
    let mut quotes = Quotes::default();
    let mut i = 0;

    let mut flush = |current: &mut String, op: ChainOp, background: bool| {
        let command = current.trim().to_string();
        current.clear();
        if !command.is_empty() {
            segments.push(ChainSegment {
                command,
                op,
                background,
            });
        }
    };

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();
        if !quotes.feed(ch) {
            current.push(ch);
            i += 1;
            continue;
        }
        match (ch, next) {
            (';', _) => {
                flush(&mut current, op, false);
                op = ChainOp::Always;
            },
            ('&', Some('&')) => {
                flush(&mut current, op, false);
                op = ChainOp::And;
                i += 1;
            },
            ('|', Some('|')) => {
                flush(&mut current, op, false);
                op = ChainOp::Or;
                i += 1;
            },
            ('&', _) => {
                flush(&mut current, op, true);
                op = ChainOp::Always;
            },
            _ => current.push(ch),
        }
        i += 1;
    }
    flush(&mut current, op, false);
    Ok(segments)
}

// ---------------------------------------------------------------------------
// Pipe splitting
// ---------------------------------------------------------------------------

/// Split on `|` (single pipe, not `||`), respecting quotes.
fn split_pipes(input: &str) -> Result<Vec<String>> {
    let mut stages = Vec::new();
    let mut current = String::new();
    let mut quotes = Quotes::default();
    for ch in input.chars() {
        if quotes.feed(ch) && ch == '|' {
            stages.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(ch);
        }
    }
    stages.push(current.trim().to_string());
    if stages.len() > 1 && stages.iter().any(String::is_empty) {
        return Err(KernelError::InvalidArgument(
            "syntax error near unexpected token `|'".to_string(),
        ));
    }
    Ok(stages)
}

// ---------------------------------------------------------------------------
// Redirection parsing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
struct OutputRedirect {
    path: String,
    append: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Redirects {
    output: Option<OutputRedirect>,
    input: Option<String>,
}

/// Pull unquoted `<`, `>` and `>>` with their targets out of a stage. A
/// later redirection of the same direction wins.
fn parse_redirects(input: &str) -> Result<(String, Redirects)> {
    let chars: Vec<char> = input.chars().collect();
    let mut command = String::new();
    let mut redirects = Redirects::default();
    let mut quotes = Quotes::default();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if !quotes.feed(ch) || (ch != '>' && ch != '<') {
            command.push(ch);
            i += 1;
            continue;
        }
        let append = ch == '>' && chars.get(i + 1) == Some(&'>');
        i += if append { 2 } else { 1 };
        let (target, next) = read_target(&chars, i)?;
        i = next;
        if ch == '<' {
            redirects.input = Some(target);
        } else {
            redirects.output = Some(OutputRedirect {
                path: target,
                append,
            });
        }
    }
    Ok((command.trim().to_string(), redirects))
}

/// Read the word after a redirection operator, unquoting it.
fn read_target(chars: &[char], mut i: usize) -> Result<(String, usize)> {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    let mut raw = String::new();
    let mut quotes = Quotes::default();
    while i < chars.len() {
        let ch = chars[i];
        if quotes.feed(ch) && (ch.is_whitespace() || ch == '<' || ch == '>') {
            break;
        }
        raw.push(ch);
        i += 1;
    }
    match tokenize(&raw)?.into_iter().next() {
        Some(target) if !target.is_empty() => Ok((target, i)),
        _ => Err(KernelError::InvalidArgument(
            "syntax error near unexpected token `newline'".to_string(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Glob expansion
// ---------------------------------------------------------------------------

/// Expand `*` and `?` in the last path component against a readable
/// directory. A pattern without matches is passed through as-is.
fn expand_glob(word: &str, env: &Environment<'_>) -> Vec<String> {
    if !word.contains(['*', '?']) {
        return vec![word.to_string()];
    }
    let (dir_part, pattern) = match word.rfind('/') {
        Some(idx) => word.split_at(idx + 1),
        None => ("", word),
    };
    if dir_part.contains(['*', '?']) {
        return vec![word.to_string()];
    }

    let dir = env.resolve(if dir_part.is_empty() { "." } else { dir_part });
    let creds = env.credentials();
    let names: Vec<String> = match env.vfs.get_node(&dir) {
        Some(node) if can_access(node, &creds, Access::Read) => node
            .children()
            .map(|c| {
                c.keys()
                    .filter(|name| !name.starts_with('.') || pattern.starts_with('.'))
                    .filter(|name| glob_match(pattern, name))
                    .map(|name| format!("{dir_part}{name}"))
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    if names.is_empty() {
        vec![word.to_string()]
    } else {
        names
    }
}

/// Simple glob matching: `*` matches any string, `?` matches one char.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_inner(&p, &t, 0, 0, 0)
}

/// Maximum recursion depth for glob matching.
const GLOB_MAX_DEPTH: usize = 256;

fn glob_match_inner(p: &[char], t: &[char], pi: usize, ti: usize, depth: usize) -> bool {
    if depth >= GLOB_MAX_DEPTH {
        return false;
    }
    if pi == p.len() {
        return ti == t.len();
    }
    if p[pi] == '*' {
        (ti..=t.len()).any(|skip| glob_match_inner(p, t, pi + 1, skip, depth + 1))
    } else if ti < t.len() && (p[pi] == '?' || p[pi] == t[ti]) {
        glob_match_inner(p, t, pi + 1, ti + 1, depth + 1)
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    #[test]
    fn tokenize_quotes() {
        assert_eq!(
            tokenize(r#"echo "a b" 'c $d' e\ f"#).unwrap(),
            vec!["echo", "a b", "c $d", "e f"]
        );
        assert_eq!(tokenize(r#"echo "" x"#).unwrap(), vec!["echo", "", "x"]);
        assert!(tokenize("echo 'open").is_err());
        assert!(tokenize("echo \"open").is_err());
    }

    #[test]
    fn chains_split_on_operators() {
        let segs = split_chains("a; b && c || d & e").unwrap();
        let summary: Vec<(&str, ChainOp, bool)> = segs
            .iter()
            .map(|s| (s.command.as_str(), s.op, s.background))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("a", ChainOp::Always, false),
                ("b", ChainOp::Always, false),
                ("c", ChainOp::And, false),
                ("d", ChainOp::Or, true),
                ("e", ChainOp::Always, false),
            ]
        );
        assert_eq!(split_chains("echo 'a;b'").unwrap().len(), 1);
    }

    #[test]
    fn pipes_reject_empty_stage() {
        assert_eq!(split_pipes("a | b").unwrap(), vec!["a", "b"]);
        assert_eq!(split_pipes("echo '|'").unwrap().len(), 1);
        assert!(split_pipes("a |").is_err());
    }

    #[test]
    fn redirect_parsing() {
        let (cmd, r) = parse_redirects("sort < in.txt >> 'out file'").unwrap();
        assert_eq!(cmd, "sort");
        assert_eq!(r.input.as_deref(), Some("in.txt"));
        assert_eq!(
            r.output,
            Some(OutputRedirect {
                path: "out file".into(),
                append: true
            })
        );
        let (cmd, r) = parse_redirects("echo 'a > b'").unwrap();
        assert_eq!(cmd, "echo 'a > b'");
        assert_eq!(r, Redirects::default());
        assert!(parse_redirects("echo >").is_err());
    }

    #[test]
    fn braces() {
        assert_eq!(expand_braces("f{a,b}.txt"), vec!["fa.txt", "fb.txt"]);
        assert_eq!(expand_braces("{1..3}"), vec!["1", "2", "3"]);
        assert_eq!(expand_braces("{3..1}"), vec!["3", "2", "1"]);
        assert_eq!(expand_braces("{a..c}"), vec!["a", "b", "c"]);
        assert_eq!(expand_braces("{x,{y,z}}"), vec!["x", "y", "z"]);
        assert_eq!(expand_braces("{lonely}"), vec!["{lonely}"]);
        assert_eq!(expand_braces("a{b"), vec!["a{b"]);
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("*.txt", "a.txt"));
        assert!(glob_match("?.txt", "a.txt"));
        assert!(!glob_match("?.txt", "ab.txt"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("a*b", "acd"));
    }

    #[test]
    fn table_rendering() {
        let out = render_table(
            &["ID".into(), "NAME".into()],
            &[vec!["1".into(), "alpha".into()], vec!["10".into(), "b".into()]],
        );
        assert_eq!(out, "ID  NAME\n1   alpha\n10  b");
    }

    #[test]
    fn empty_line_is_silent() {
        let mut f = Fixture::new();
        assert_eq!(f.run("   ").unwrap(), Execution::default());
    }

    #[test]
    fn unknown_command() {
        let mut f = Fixture::new();
        let err = f.run("frobnicate").unwrap_err();
        assert!(matches!(err, KernelError::CommandNotFound(_)));
        assert_eq!(err.suggestion(), Some("Type 'help' to see all available commands."));
    }

    #[test]
    fn variables_and_status() {
        let mut f = Fixture::new();
        assert_eq!(f.text("GREETING=hi; echo $GREETING ${GREETING}!"), "hi hi!");
        assert_eq!(f.text("echo '$GREETING' \"$GREETING\""), "$GREETING hi");
        assert_eq!(f.text("echo $PWD"), "/home/Guest");
        f.run("false").unwrap_err();
        assert_eq!(f.text("echo $?"), "1");
        assert_eq!(f.text("echo $?"), "0");
        assert_eq!(f.text("echo \\$HOME"), "$HOME");
    }

    #[test]
    fn command_substitution() {
        let mut f = Fixture::new();
        assert_eq!(f.text("echo [$(pwd)]"), "[/home/Guest]");
        assert_eq!(f.text("echo $(echo $(echo deep))"), "deep");
        assert_eq!(f.text("echo '$(pwd)'"), "$(pwd)");
    }

    #[test]
    fn expanded_quotes_stay_literal() {
        let mut f = Fixture::new();
        f.run("X=\"it's\"").unwrap();
        assert_eq!(f.text("echo $X"), "it's");
        assert_eq!(f.text("echo \"[$X]\""), "[it's]");
        f.run("Q='say \"hi\" \\ bye'").unwrap();
        assert_eq!(f.text("echo \"$Q\""), "say \"hi\" \\ bye");
        assert_eq!(f.text("echo $Q"), "say \"hi\" \\ bye");

        f.run("echo \"don't\" > quote.txt").unwrap();
        assert_eq!(f.text("echo $(cat quote.txt)"), "don't");
        assert_eq!(f.text("echo \"$(cat quote.txt)!\""), "don't!");
    }

    #[test]
    fn chaining_semantics() {
        let mut f = Fixture::new();
        assert_eq!(f.text("true && echo yes || echo no"), "yes");
        assert_eq!(f.text("false && echo yes || echo no"), "no");
        let exec = f.run("echo a; cat /missing; echo b").unwrap();
        assert_eq!(exec.output.len(), 3);
        assert!(exec.output[1].starts_with("error: "));
    }

    #[test]
    fn pipes_feed_stdin() {
        let mut f = Fixture::new();
        assert_eq!(f.text("echo b a c | tr ' ' '\\n' | sort"), "a\nb\nc");
    }

    #[test]
    fn pipeline_failure_names_segment() {
        let mut f = Fixture::new();
        let err = f.run("echo x | cat /nope | sort").unwrap_err();
        match &err {
            KernelError::Pipeline { segment, .. } => assert_eq!(segment, "cat /nope"),
            other => panic!("expected pipeline error, got {other:?}"),
        }
        assert_eq!(err.kind(), kestrel_types::ErrorKind::PipelineError);
    }

    #[test]
    fn redirection_round_trip() {
        let mut f = Fixture::new();
        f.run("echo one > notes.txt").unwrap();
        f.run("echo two >> notes.txt").unwrap();
        assert_eq!(f.text("cat notes.txt"), "one\ntwo");
        f.run("echo zed > notes.txt").unwrap();
        assert_eq!(f.text("cat notes.txt"), "zed");
        f.run("printf-missing > x.txt").unwrap_err();
        f.run("echo b > in.txt; echo a >> in.txt").unwrap();
        assert_eq!(f.text("sort < in.txt"), "a\nb");
    }

    #[test]
    fn redirect_into_protected_dir_denied() {
        let mut f = Fixture::new();
        let err = f.run("echo x > /etc/evil").unwrap_err();
        assert!(matches!(err, KernelError::PermissionDenied(_)));
        assert!(f.vfs.get_node("/etc/evil").is_none());
    }

    #[test]
    fn aliases_expand_first_word_once() {
        let mut f = Fixture::new();
        f.run("alias say='echo said'").unwrap();
        assert_eq!(f.text("say hi"), "said hi");
        assert!(matches!(
            f.run("'say' hi").unwrap_err(),
            KernelError::CommandNotFound(_)
        ));
    }

    #[test]
    fn globs_expand_against_cwd() {
        let mut f = Fixture::new();
        f.run("touch a.txt b.txt c.log").unwrap();
        assert_eq!(f.text("echo *.txt"), "a.txt b.txt");
        assert_eq!(f.text("echo /home/Guest/?.log"), "/home/Guest/c.log");
        assert_eq!(f.text("echo *.none"), "*.none");
        assert_eq!(f.text("echo '*.txt'"), "*.txt");
    }

    #[test]
    fn tilde_and_braces_in_commands() {
        let mut f = Fixture::new();
        f.run("mkdir ~/d{1,2}").unwrap();
        assert!(f.vfs.get_node("/home/Guest/d1").is_some());
        assert!(f.vfs.get_node("/home/Guest/d2").is_some());
    }

    #[test]
    fn background_spawns_job() {
        let mut f = Fixture::new();
        let exec = f.run("echo later &").unwrap();
        assert_eq!(exec.text(), "[1] echo later");
        assert!(matches!(exec.effect, Some(Effect::Background { job_id: 1, .. })));
        assert_eq!(f.jobs.ids(), vec![1]);
    }

    #[test]
    fn stopping_effect_keeps_remainder() {
        let mut f = Fixture::new();
        let exec = f.run("echo before; su root; echo after").unwrap();
        assert_eq!(exec.text(), "before");
        assert!(matches!(exec.effect, Some(Effect::SwitchUser { .. })));
        assert_eq!(exec.remainder.len(), 1);
        assert_eq!(exec.remainder[0].command, "echo after");
    }

    #[test]
    fn clear_discards_earlier_output() {
        let mut f = Fixture::new();
        let exec = f.run("echo hi; clear; echo bye").unwrap();
        assert_eq!(exec.text(), "bye");
        assert_eq!(exec.effect, Some(Effect::ClearScreen));
    }

    #[test]
    fn stopping_effect_cannot_be_piped() {
        let mut f = Fixture::new();
        let err = f.run("logout | cat").unwrap_err();
        assert!(matches!(err, KernelError::Pipeline { .. }));
    }

    #[test]
    fn path_executables_become_scripts() {
        let mut f = Fixture::new();
        f.as_root();
        f.run("echo 'echo hi $1' > /bin/greet").unwrap();
        f.run("chmod 755 /bin/greet").unwrap();
        f.as_guest();
        let exec = f.run("greet bob").unwrap();
        assert_eq!(
            exec.effect,
            Some(Effect::ExecuteScript {
                lines: vec!["echo hi $1".into()],
                args: vec!["bob".into()]
            })
        );
        f.as_root();
        f.run("chmod 644 /bin/greet").unwrap();
        f.as_guest();
        assert!(matches!(
            f.run("greet").unwrap_err(),
            KernelError::PermissionDenied(_)
        ));
    }

    #[test]
    fn root_required_commands_are_refused() {
        let mut f = Fixture::new();
        let err = f.run("groupadd staff").unwrap_err();
        assert_eq!(err.to_string(), "groupadd: You aren't allowed to do that.");
    }

    #[test]
    fn help_and_which() {
        let mut f = Fixture::new();
        let help = f.text("help");
        assert!(help.starts_with("Commands ("));
        assert!(help.contains("[file]"));
        assert!(f.text("help ls").contains("Usage: ls"));
        assert_eq!(f.text("which ll"), "ll: aliased to 'ls -la'");
        assert_eq!(f.text("which help"), "help: shell built-in");
        assert!(f.text("which cat").starts_with("cat: "));
        assert!(f.run("which nothing").is_err());
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;
        use proptest::prelude::prop;

        proptest! {
            #[test]
            fn quoted_args_round_trip(args in prop::collection::vec("[a-zA-Z0-9 $*;|&<>'\"]{0,12}", 1..5)) {
                let line = args
                    .iter()
                    .map(|a| format!("'{}'", a.replace('\'', "'\\''")))
                    .collect::<Vec<_>>()
                    .join(" ");
                prop_assert_eq!(tokenize(&line).unwrap(), args);
            }

            #[test]
            fn quoted_separators_never_split(arg in "[a-z;&|]{1,10}") {
                let segs = split_chains(&format!("echo '{arg}'")).unwrap();
                prop_assert_eq!(segs.len(), 1);
            }
        }
    }
}
