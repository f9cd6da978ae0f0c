//! Script parsing, positional substitution, and bounded execution.

use kestrel_types::error::{KernelError, Result};

/// One executable script line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLine {
    /// 1-based line number in the source, for error reports.
    pub number: usize,
    pub command: String,
    /// Following lines consumed as password input.
    pub inputs: Vec<String>,
}

/// How many following lines a command reads as password input.
fn lookahead(command: &str) -> usize {
    let words: Vec<&str> = command.split_whitespace().collect();
    match words.first().copied() {
        Some("useradd" | "passwd") => 2,
        Some("sudo") => 1,
        Some("su" | "login") if words.len() < 3 => 1,
        _ => 0,
    }
}

/// Split script text into executable lines. Blank lines and `#` comments
/// are dropped; password lookahead lines are attached to their command.
pub fn parse_script(lines: &[String]) -> Vec<ScriptLine> {
    let mut parsed = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let command = lines[i].trim();
        let number = i + 1;
        i += 1;
        if command.is_empty() || command.starts_with('#') {
            continue;
        }
        let take = lookahead(command).min(lines.len() - i);
        let inputs = lines[i..i + take].iter().map(|l| l.trim().to_string()).collect();
        i += take;
        parsed.push(ScriptLine {
            number,
            command: command.to_string(),
            inputs,
        });
    }
    parsed
}

fn single_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Quote `arg` only when it would not survive tokenizing as one word.
pub(crate) fn quote_if_needed(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_alphanumeric() || "-_./=:,+%@".contains(c));
    if plain { arg.to_string() } else { single_quote(arg) }
}

/// Replace `$@`, `$#` and `$1`..`$9` in one left-to-right pass, so text
/// coming from an argument is never substituted again. Only one digit is
/// read: `$10` is `$1` followed by `0`.
pub fn substitute_positional(line: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        match chars.peek().copied() {
            Some('@') => {
                chars.next();
                let all: Vec<String> = args.iter().map(|a| single_quote(a)).collect();
                out.push_str(&all.join(" "));
            },
            Some('#') => {
                chars.next();
                out.push_str(&args.len().to_string());
            },
            Some(d @ '1'..='9') => {
                chars.next();
                let index = d as usize - '1' as usize;
                out.push_str(args.get(index).map_or("", String::as_str));
            },
            _ => out.push('$'),
        }
    }
    out
}

/// Step and depth limits shared by every script run within one request.
#[derive(Debug, Clone)]
pub struct StepBudget {
    steps: usize,
    max_steps: usize,
    max_depth: usize,
}

impl StepBudget {
    pub fn new(max_steps: usize, max_depth: usize) -> Self {
        Self {
            steps: 0,
            max_steps,
            max_depth,
        }
    }

    /// Count one step.
    pub fn tick(&mut self) -> Result<()> {
        self.steps += 1;
        if self.steps > self.max_steps {
            return Err(KernelError::ScriptLimitExceeded(format!(
                "script exceeded {} steps",
                self.max_steps
            )));
        }
        Ok(())
    }

    pub fn check_depth(&self, depth: usize) -> Result<()> {
        if depth > self.max_depth {
            return Err(KernelError::ScriptLimitExceeded(format!(
                "script nesting exceeded depth {}",
                self.max_depth
            )));
        }
        Ok(())
    }

    pub fn steps(&self) -> usize {
        self.steps
    }
}

/// Whatever executes script lines on the script's behalf.
pub trait ScriptHost {
    /// Push a variable scope for the script.
    fn enter_scope(&mut self);
    /// Pop the scope pushed by `enter_scope`.
    fn leave_scope(&mut self);
    /// Run one already-substituted line. A line that starts another script
    /// recurses into [`run_script`] with `depth + 1`.
    fn run_script_line(
        &mut self,
        line: &ScriptLine,
        depth: usize,
        budget: &mut StepBudget,
    ) -> Result<Vec<String>>;
}

/// Run `lines` with positional `args` inside a fresh scope, stopping at the
/// first failing line. The scope is popped on every exit path.
pub fn run_script<H: ScriptHost + ?Sized>(
    host: &mut H,
    lines: &[String],
    args: &[String],
    depth: usize,
    budget: &mut StepBudget,
) -> Result<Vec<String>> {
    budget.check_depth(depth)?;
    let parsed = parse_script(lines);
    host.enter_scope();
    let result = run_lines(host, &parsed, args, depth, budget);
    host.leave_scope();
    result
}

fn run_lines<H: ScriptHost + ?Sized>(
    host: &mut H,
    parsed: &[ScriptLine],
    args: &[String],
    depth: usize,
    budget: &mut StepBudget,
) -> Result<Vec<String>> {
    let mut output = Vec::new();
    for line in parsed {
        budget.tick()?;
        let line = ScriptLine {
            command: substitute_positional(&line.command, args),
            ..line.clone()
        };
        match host.run_script_line(&line, depth, budget) {
            Ok(lines) => output.extend(lines),
            Err(e @ KernelError::ScriptLimitExceeded(_)) => return Err(e),
            Err(source) => {
                return Err(KernelError::Script {
                    line: line.number,
                    command: line.command,
                    source: Box::new(source),
                });
            },
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// Echoes each line, fails on `fail`, and re-runs its own script on
    /// `recurse`.
    struct Recorder {
        ran: Vec<String>,
        scopes: i32,
        max_scopes: i32,
        script: Vec<String>,
    }

    impl Recorder {
        fn new(script: &str) -> Self {
            Self {
                ran: Vec::new(),
                scopes: 0,
                max_scopes: 0,
                script: lines(script),
            }
        }
    }

    impl ScriptHost for Recorder {
        fn enter_scope(&mut self) {
            self.scopes += 1;
            self.max_scopes = self.max_scopes.max(self.scopes);
        }

        fn leave_scope(&mut self) {
            self.scopes -= 1;
        }

        fn run_script_line(
            &mut self,
            line: &ScriptLine,
            depth: usize,
            budget: &mut StepBudget,
        ) -> Result<Vec<String>> {
            self.ran.push(line.command.clone());
            match line.command.as_str() {
                "fail" => Err(KernelError::NotFound("thing".into())),
                "recurse" => {
                    let script = self.script.clone();
                    run_script(self, &script, &[], depth + 1, budget)
                },
                other => Ok(vec![other.to_string()]),
            }
        }
    }

    #[test]
    fn positional_substitution() {
        let args = strings(&["a", "b"]);
        assert_eq!(substitute_positional("echo $1 $2", &args), "echo a b");
        assert_eq!(substitute_positional("echo $# $3.", &args), "echo 2 .");
        let spaced = strings(&["a b", "c"]);
        assert_eq!(substitute_positional("echo $@", &spaced), "echo 'a b' 'c'");
        let quote = strings(&["it's"]);
        assert_eq!(substitute_positional("echo $@", &quote), "echo 'it'\\''s'");
        assert_eq!(substitute_positional("echo $HOME $", &args), "echo $HOME $");
    }

    #[test]
    fn argument_text_is_not_substituted_again() {
        let args = strings(&["$2", "x"]);
        assert_eq!(substitute_positional("echo $1", &args), "echo $2");
        assert_eq!(substitute_positional("echo $2$1", &args), "echo x$2");
        let one = strings(&["a"]);
        assert_eq!(substitute_positional("echo $10", &one), "echo a0");
    }

    #[test]
    fn parse_skips_comments_and_takes_passwords() {
        let parsed = parse_script(&lines(
            "# setup\n\nuseradd bob\npass1\npass1\nsu bob\npass1\nsu bob pass1\nsudo ls\nsecret\nls",
        ));
        let commands: Vec<&str> = parsed.iter().map(|l| l.command.as_str()).collect();
        assert_eq!(commands, ["useradd bob", "su bob", "su bob pass1", "sudo ls", "ls"]);
        assert_eq!(parsed[0].inputs, ["pass1", "pass1"]);
        assert_eq!(parsed[0].number, 3);
        assert_eq!(parsed[1].inputs, ["pass1"]);
        assert!(parsed[2].inputs.is_empty());
        assert_eq!(parsed[3].inputs, ["secret"]);
        assert_eq!(parsed[4].number, 11);
    }

    #[test]
    fn lookahead_stops_at_end() {
        let parsed = parse_script(&lines("passwd\nonly-one"));
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].inputs, ["only-one"]);
    }

    #[test]
    fn runs_in_scope_and_substitutes() {
        let mut host = Recorder::new("");
        let mut budget = StepBudget::new(100, 10);
        let out = run_script(&mut host, &lines("echo $1\necho $#"), &strings(&["x"]), 0, &mut budget)
            .unwrap();
        assert_eq!(out, ["echo x", "echo 1"]);
        assert_eq!(host.scopes, 0);
        assert_eq!(host.max_scopes, 1);
        assert_eq!(budget.steps(), 2);
    }

    #[test]
    fn failure_reports_line_and_pops_scope() {
        let mut host = Recorder::new("");
        let mut budget = StepBudget::new(100, 10);
        let err = run_script(&mut host, &lines("a\n\nfail\nnever"), &[], 0, &mut budget).unwrap_err();
        assert_eq!(
            err.to_string(),
            "error on line 3: fail: thing: No such file or directory"
        );
        assert_eq!(host.ran, ["a", "fail"]);
        assert_eq!(host.scopes, 0);
    }

    #[test]
    fn step_limit_is_fatal() {
        let mut host = Recorder::new("");
        let mut budget = StepBudget::new(2, 10);
        let err = run_script(&mut host, &lines("a\nb\nc"), &[], 0, &mut budget).unwrap_err();
        assert!(matches!(err, KernelError::ScriptLimitExceeded(_)));
        assert_eq!(host.ran, ["a", "b"]);
    }

    #[test]
    fn recursion_hits_depth_limit_unwrapped() {
        let mut host = Recorder::new("recurse");
        let mut budget = StepBudget::new(1000, 5);
        let script = host.script.clone();
        let err = run_script(&mut host, &script, &[], 0, &mut budget).unwrap_err();
        assert!(matches!(err, KernelError::ScriptLimitExceeded(_)));
        assert_eq!(host.scopes, 0);
        assert_eq!(host.max_scopes, 6);
    }
}
