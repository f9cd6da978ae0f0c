//! Command interpreter and shell state.
//!
//! The interpreter is a registry-based dispatch system. Commands implement
//! the `Command` trait and are registered by name. A command line is split
//! into chains and pipes, expanded, and dispatched against the registry.
//! Anything a command cannot finish on its own (a password prompt, a user
//! switch, a script run) comes back as an [`Effect`] for the kernel.

pub mod alias;
mod commands;
pub mod effect;
pub mod env;
pub mod history;
mod interpreter;
pub mod jobs;
pub mod script;
mod security_commands;
mod shell_commands;
mod system_commands;
#[cfg(test)]
mod testing;
mod text_commands;

/// Alias table with the default shortcuts.
pub use alias::AliasTable;
/// Register every built-in command into a registry.
pub use commands::register_builtins;
/// Requests a command hands back to its caller.
pub use effect::Effect;
/// Scoped shell variables.
pub use env::EnvironmentStack;
/// Bounded command history with navigation.
pub use history::History;
/// A single executable command trait.
pub use interpreter::Command;
/// Output produced by a command (text, table, effect).
pub use interpreter::CommandOutput;
/// Registry of available commands with dispatch.
pub use interpreter::CommandRegistry;
/// Shared mutable environment passed to every command.
pub use interpreter::Environment;
/// Security event raised by a command for the audit log.
pub use interpreter::AuditEvent;
/// Column-aligned rendering of tabular output.
pub use interpreter::render_table;
/// Folded result of a whole command line.
pub use interpreter::Execution;
/// Chain segments left over after a suspending effect.
pub use interpreter::{ChainOp, ChainSegment};
/// Quote-aware splitting of a command line and its chains.
pub use interpreter::{split_chains, tokenize};
/// Background jobs, signals, and cancellation.
pub use jobs::{CancellationToken, Job, JobInfo, JobStatus, JobStep, JobTable, Signal, parse_job_id};
/// Script parsing and execution.
pub use script::{ScriptHost, ScriptLine, StepBudget, parse_script, run_script, substitute_positional};
