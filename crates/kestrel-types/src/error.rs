//! Error types for Kestrel.

use std::io;

use serde::{Deserialize, Serialize};

/// Appended to every permission failure message.
pub const PERMISSION_DENIED_SUFFIX: &str = ": You aren't allowed to do that.";

/// Errors produced by the Kestrel kernel and its components.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("{0}: No such file or directory")]
    NotFound(String),

    #[error("{0}: Not a directory")]
    NotADirectory(String),

    #[error("{0}: Is a directory")]
    IsADirectory(String),

    #[error("{0}{suffix}", suffix = PERMISSION_DENIED_SUFFIX)]
    PermissionDenied(String),

    #[error("{0}: already exists")]
    AlreadyExists(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}: command not found")]
    CommandNotFound(String),

    /// A command that fails without anything to report (`false`).
    #[error("{0}: exited with failure")]
    ExitFailure(String),

    #[error("{segment}: {source}")]
    Pipeline {
        segment: String,
        source: Box<KernelError>,
    },

    #[error("error on line {line}: {command}: {source}")]
    Script {
        line: usize,
        command: String,
        source: Box<KernelError>,
    },

    #[error("script limit exceeded: {0}")]
    ScriptLimitExceeded(String),

    #[error("authentication failed: invalid username or password")]
    AuthenticationFailed,

    #[error("kernel not ready")]
    KernelNotReady,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupted state: {0}")]
    Corrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, KernelError>;

/// Stable, serializable classification of a [`KernelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    NotADirectory,
    IsADirectory,
    PermissionDenied,
    AlreadyExists,
    InvalidArgument,
    CommandNotFound,
    PipelineError,
    ScriptLimitExceeded,
    AuthenticationFailed,
    KernelNotReady,
    StorageUnavailable,
    CorruptedState,
}

impl KernelError {
    /// Classify this error.
    ///
    /// A script failure reports the kind of the line that failed; a
    /// pipeline failure is always `PipelineError`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NotADirectory(_) => ErrorKind::NotADirectory,
            Self::IsADirectory(_) => ErrorKind::IsADirectory,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InvalidArgument(_)
            | Self::ExitFailure(_)
            | Self::Json(_)
            | Self::TomlParse(_) => {
                ErrorKind::InvalidArgument
            },
            Self::CommandNotFound(_) => ErrorKind::CommandNotFound,
            Self::Pipeline { .. } => ErrorKind::PipelineError,
            Self::Script { source, .. } => source.kind(),
            Self::ScriptLimitExceeded(_) => ErrorKind::ScriptLimitExceeded,
            Self::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            Self::KernelNotReady => ErrorKind::KernelNotReady,
            Self::Storage(_) | Self::Io(_) => ErrorKind::StorageUnavailable,
            Self::Corrupted(_) => ErrorKind::CorruptedState,
        }
    }

    /// Human-readable hint for the user, if one applies.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::NotFound(_) => Some("Check the path with 'ls' and try again."),
            Self::NotADirectory(_) => Some("A path component is a file, not a directory."),
            Self::IsADirectory(_) => Some("Use a file path, or pass -r for directories."),
            Self::PermissionDenied(_) => {
                Some("Check ownership and mode with 'ls -l', or try 'sudo'.")
            },
            Self::CommandNotFound(_) => Some("Type 'help' to see all available commands."),
            Self::Script { source, .. } | Self::Pipeline { source, .. } => source.suggestion(),
            Self::ScriptLimitExceeded(_) => {
                Some("Check the script for runaway loops or recursive 'run' calls.")
            },
            Self::KernelNotReady => Some("Wait for boot to complete before issuing calls."),
            _ => None,
        }
    }

    /// Shorthand for a `PermissionDenied` naming the refused target.
    pub fn denied(target: impl Into<String>) -> Self {
        Self::PermissionDenied(target.into())
    }

    /// Shorthand for an `InvalidArgument` carrying a usage string.
    pub fn usage(usage: &str) -> Self {
        Self::InvalidArgument(format!("usage: {usage}"))
    }
}

/// The `Err` half of a kernel result as seen by callers: kind, message, and
/// an optional suggestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl From<&KernelError> for Failure {
    fn from(err: &KernelError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            suggestion: err.suggestion().map(str::to_string),
        }
    }
}

impl From<KernelError> for Failure {
    fn from(err: KernelError) -> Self {
        Self::from(&err)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let e = KernelError::NotFound("/nope".into());
        assert_eq!(format!("{e}"), "/nope: No such file or directory");
    }

    #[test]
    fn permission_denied_carries_suffix() {
        let e = KernelError::denied("/etc/sudoers");
        assert_eq!(
            format!("{e}"),
            "/etc/sudoers: You aren't allowed to do that."
        );
        assert_eq!(e.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn authentication_message_is_uniform() {
        let e = KernelError::AuthenticationFailed;
        assert_eq!(
            format!("{e}"),
            "authentication failed: invalid username or password"
        );
    }

    #[test]
    fn pipeline_wraps_inner_message() {
        let e = KernelError::Pipeline {
            segment: "cat /x".into(),
            source: Box::new(KernelError::NotFound("/x".into())),
        };
        assert_eq!(format!("{e}"), "cat /x: /x: No such file or directory");
        assert_eq!(e.kind(), ErrorKind::PipelineError);
    }

    #[test]
    fn script_reports_line_and_inner_kind() {
        let e = KernelError::Script {
            line: 3,
            command: "cat /x".into(),
            source: Box::new(KernelError::NotFound("/x".into())),
        };
        assert!(format!("{e}").starts_with("error on line 3: cat /x"));
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert!(e.suggestion().is_some());
    }

    #[test]
    fn usage_helper() {
        let e = KernelError::usage("cd <dir>");
        assert_eq!(format!("{e}"), "usage: cd <dir>");
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn io_error_from_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let e: KernelError = io_err.into();
        let msg = format!("{e}");
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("gone"));
        assert_eq!(e.kind(), ErrorKind::StorageUnavailable);
    }

    #[test]
    fn toml_error_from_conversion() {
        let bad_toml = "this is [[[not valid toml";
        let toml_err = toml::from_str::<toml::Value>(bad_toml).unwrap_err();
        let e: KernelError = toml_err.into();
        assert!(format!("{e}").contains("TOML parse error"));
    }

    #[test]
    fn json_error_from_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let e: KernelError = json_err.into();
        assert!(format!("{e}").contains("JSON error"));
    }

    #[test]
    fn failure_from_error() {
        let f = Failure::from(KernelError::CommandNotFound("frob".into()));
        assert_eq!(f.kind, ErrorKind::CommandNotFound);
        assert_eq!(f.message, "frob: command not found");
        assert!(f.suggestion.unwrap().contains("help"));
    }

    #[test]
    fn failure_serializes_without_empty_suggestion() {
        let f = Failure::from(KernelError::AuthenticationFailed);
        let json = serde_json::to_string(&f).unwrap();
        assert!(!json.contains("suggestion"));
        assert!(json.contains("AuthenticationFailed"));
    }
}
