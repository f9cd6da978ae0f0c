//! Text processing commands: head, tail, wc, grep, sort, uniq, tr.

use kestrel_types::error::{KernelError, Result};

use crate::commands::parse_flags;
use crate::interpreter::{Command, CommandOutput, CommandRegistry, Environment};

// ---------------------------------------------------------------------------
// head
// ---------------------------------------------------------------------------

struct HeadCmd;
impl Command for HeadCmd {
    fn name(&self) -> &str {
        "head"
    }
    fn description(&self) -> &str {
        "Show first N lines of a file"
    }
    fn usage(&self) -> &str {
        "head [-n N] [file]"
    }
    fn category(&self) -> &str {
        "text"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let (n, file) = parse_n_flag(args, 10)?;
        let text = read_text_input(file, env)?;
        let result: Vec<&str> = text.lines().take(n).collect();
        Ok(CommandOutput::Text(result.join("\n")))
    }
}

// ---------------------------------------------------------------------------
// tail
// ---------------------------------------------------------------------------

struct TailCmd;
impl Command for TailCmd {
    fn name(&self) -> &str {
        "tail"
    }
    fn description(&self) -> &str {
        "Show last N lines of a file"
    }
    fn usage(&self) -> &str {
        "tail [-n N] [file]"
    }
    fn category(&self) -> &str {
        "text"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let (n, file) = parse_n_flag(args, 10)?;
        let text = read_text_input(file, env)?;
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(n);
        Ok(CommandOutput::Text(lines[start..].join("\n")))
    }
}

// ---------------------------------------------------------------------------
// wc
// ---------------------------------------------------------------------------

struct WcCmd;
impl Command for WcCmd {
    fn name(&self) -> &str {
        "wc"
    }
    fn description(&self) -> &str {
        "Count lines, words, and bytes"
    }
    fn usage(&self) -> &str {
        "wc [-l|-w|-c] [file]"
    }
    fn category(&self) -> &str {
        "text"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let (flags, files) = parse_flags("wc", args, "lwc")?;
        let text = read_text_input(files.first().copied(), env)?;
        let lines = text.lines().count();
        let words = text.split_whitespace().count();
        let bytes = text.len();
        let out = match flags.chars().last() {
            Some('l') => lines.to_string(),
            Some('w') => words.to_string(),
            Some('c') => bytes.to_string(),
            _ => format!("{lines:>8} {words:>8} {bytes:>8}"),
        };
        Ok(CommandOutput::Text(out))
    }
}

// ---------------------------------------------------------------------------
// grep
// ---------------------------------------------------------------------------

struct GrepCmd;
impl Command for GrepCmd {
    fn name(&self) -> &str {
        "grep"
    }
    fn description(&self) -> &str {
        "Search for pattern in text"
    }
    fn usage(&self) -> &str {
        "grep [-i] [-n] [-v] [-c] <pattern> [file]"
    }
    fn category(&self) -> &str {
        "text"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let (flags, positional) = parse_flags("grep", args, "invc")?;
        let Some(&pattern) = positional.first() else {
            return Err(KernelError::usage(self.usage()));
        };
        let case_insensitive = flags.contains('i');
        let invert = flags.contains('v');
        let text = read_text_input(positional.get(1).copied(), env)?;

        let pat = if case_insensitive {
            pattern.to_lowercase()
        } else {
            pattern.to_string()
        };
        let mut matches = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let found = if case_insensitive {
                line.to_lowercase().contains(&pat)
            } else {
                line.contains(&pat)
            };
            if found != invert {
                if flags.contains('n') {
                    matches.push(format!("{}:{line}", i + 1));
                } else {
                    matches.push(line.to_string());
                }
            }
        }

        if flags.contains('c') {
            Ok(CommandOutput::Text(matches.len().to_string()))
        } else {
            Ok(CommandOutput::Text(matches.join("\n")))
        }
    }
}

// ---------------------------------------------------------------------------
// sort
// ---------------------------------------------------------------------------

struct SortCmd;
impl Command for SortCmd {
    fn name(&self) -> &str {
        "sort"
    }
    fn description(&self) -> &str {
        "Sort lines of text"
    }
    fn usage(&self) -> &str {
        "sort [-r] [-n] [file]"
    }
    fn category(&self) -> &str {
        "text"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let (flags, files) = parse_flags("sort", args, "rn")?;
        let text = read_text_input(files.first().copied(), env)?;
        let mut lines: Vec<&str> = text.lines().collect();

        if flags.contains('n') {
            let key = |s: &str| -> f64 {
                s.split_whitespace()
                    .next()
                    .and_then(|w| w.parse().ok())
                    .unwrap_or(0.0)
            };
            lines.sort_by(|a, b| key(a).total_cmp(&key(b)));
        } else {
            lines.sort();
        }
        if flags.contains('r') {
            lines.reverse();
        }
        Ok(CommandOutput::Text(lines.join("\n")))
    }
}

// ---------------------------------------------------------------------------
// uniq
// ---------------------------------------------------------------------------

struct UniqCmd;
impl Command for UniqCmd {
    fn name(&self) -> &str {
        "uniq"
    }
    fn description(&self) -> &str {
        "Remove adjacent duplicate lines"
    }
    fn usage(&self) -> &str {
        "uniq [-c] [file]"
    }
    fn category(&self) -> &str {
        "text"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let (flags, files) = parse_flags("uniq", args, "c")?;
        let show_count = flags.contains('c');
        let text = read_text_input(files.first().copied(), env)?;

        let mut runs: Vec<(usize, &str)> = Vec::new();
        for line in text.lines() {
            match runs.last_mut() {
                Some((count, prev)) if *prev == line => *count += 1,
                _ => runs.push((1, line)),
            }
        }
        let result: Vec<String> = runs
            .into_iter()
            .map(|(count, line)| {
                if show_count {
                    format!("{count:>7} {line}")
                } else {
                    line.to_string()
                }
            })
            .collect();
        Ok(CommandOutput::Text(result.join("\n")))
    }
}

// ---------------------------------------------------------------------------
// tr
// ---------------------------------------------------------------------------

struct TrCmd;
impl Command for TrCmd {
    fn name(&self) -> &str {
        "tr"
    }
    fn description(&self) -> &str {
        "Translate or delete characters"
    }
    fn usage(&self) -> &str {
        "tr [-d] <set1> [set2]"
    }
    fn category(&self) -> &str {
        "text"
    }
    fn execute(&self, args: &[&str], env: &mut Environment<'_>) -> Result<CommandOutput> {
        let (flags, sets) = parse_flags("tr", args, "d")?;
        let input = env.stdin.clone().unwrap_or_default();
        let from: Vec<char> = match sets.first() {
            Some(s) => unescape(s).chars().collect(),
            None => return Err(KernelError::usage(self.usage())),
        };
        if flags.contains('d') {
            let out: String = input.chars().filter(|c| !from.contains(c)).collect();
            return Ok(CommandOutput::Text(out));
        }
        let Some(to) = sets.get(1) else {
            return Err(KernelError::usage(self.usage()));
        };
        let to: Vec<char> = unescape(to).chars().collect();
        let out: String = input
            .chars()
            .map(|c| match from.iter().position(|&f| f == c) {
                Some(i) => to.get(i).or(to.last()).copied().unwrap_or(c),
                None => c,
            })
            .collect();
        Ok(CommandOutput::Text(out))
    }
}

/// Interpret `\n` and `\t` in a `tr` set.
fn unescape(set: &str) -> String {
    set.replace("\\n", "\n").replace("\\t", "\t")
}

fn parse_n_flag<'a>(args: &[&'a str], default: usize) -> Result<(usize, Option<&'a str>)> {
    let mut n = default;
    let mut file = None;
    let mut i = 0;
    while i < args.len() {
        if args[i] == "-n" {
            i += 1;
            let value = args.get(i).ok_or_else(|| {
                KernelError::InvalidArgument("option requires an argument -- 'n'".to_string())
            })?;
            n = value
                .parse()
                .map_err(|_| KernelError::InvalidArgument(format!("invalid number: '{value}'")))?;
        } else {
            file = Some(args[i]);
        }
        i += 1;
    }
    Ok((n, file))
}

/// Read text from a file path or stdin.
fn read_text_input(file: Option<&str>, env: &mut Environment<'_>) -> Result<String> {
    match file {
        Some(path) => env.read_file(path),
        None => Ok(env.stdin.clone().unwrap_or_default()),
    }
}

/// Register text processing commands.
pub fn register_text_commands(reg: &mut CommandRegistry) {
    reg.register(Box::new(HeadCmd));
    reg.register(Box::new(TailCmd));
    reg.register(Box::new(WcCmd));
    reg.register(Box::new(GrepCmd));
    reg.register(Box::new(SortCmd));
    reg.register(Box::new(UniqCmd));
    reg.register(Box::new(TrCmd));
}
