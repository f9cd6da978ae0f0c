//! Requests a command returns instead of plain output.

use serde::{Deserialize, Serialize};

/// Something the command could not finish by itself.
///
/// Pass-through effects ([`Effect::passes_through`]) are informational and
/// the rest of the command line keeps running. Every other effect stops the
/// line; the kernel either resolves it directly or hands it to the caller to
/// gather input, then calls `resume`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    /// Run `command` as root once the invoking user is authenticated.
    SudoExec {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    /// Push a login for `username` onto the session stack.
    SwitchUser {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    /// Replace the whole session stack with `username`.
    Login {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    Logout,
    ChangeDirectory { path: String },
    ClearScreen,
    /// A job was spawned for a `&` segment.
    Background { job_id: u64, command: String },
    /// Run script lines with positional arguments.
    ExecuteScript { lines: Vec<String>, args: Vec<String> },
    /// Create `username`; needs a password and its confirmation.
    Useradd { username: String },
    /// Set a new password for `username`; needs it twice.
    Passwd { username: String },
    /// Ask a yes/no question, then run `command` on yes.
    Confirm { prompt: String, command: String },
    LaunchApp { app: String, args: Vec<String> },
    Beep,
    Delay { millis: u64 },
    Reboot,
}

impl Effect {
    /// Whether the rest of the command line keeps running after this effect.
    pub fn passes_through(&self) -> bool {
        matches!(
            self,
            Self::ChangeDirectory { .. }
                | Self::ClearScreen
                | Self::Background { .. }
                | Self::LaunchApp { .. }
                | Self::Beep
                | Self::Delay { .. }
                | Self::Reboot
        )
    }

    /// Prompts a front end should show, in order, to collect the inputs
    /// `resume` expects. Empty when the effect needs no input as it stands.
    pub fn input_prompts(&self) -> Vec<String> {
        match self {
            Self::SudoExec { password: None, .. } => vec!["[sudo] password:".to_string()],
            Self::SwitchUser {
                username,
                password: None,
            }
            | Self::Login {
                username,
                password: None,
            } => vec![format!("Password for {username}:")],
            Self::Useradd { username } | Self::Passwd { username } => vec![
                format!("New password for {username}:"),
                "Confirm password:".to_string(),
            ],
            Self::Confirm { prompt, .. } => vec![format!("{prompt} (y/n)")],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_is_tagged() {
        let effect = Effect::ChangeDirectory {
            path: "/tmp".into(),
        };
        let json = serde_json::to_value(&effect).unwrap();
        assert_eq!(json["effect"], "change_directory");
        assert_eq!(json["path"], "/tmp");

        let sudo: Effect =
            serde_json::from_str(r#"{"effect":"sudo_exec","command":"ls"}"#).unwrap();
        assert_eq!(
            sudo,
            Effect::SudoExec {
                command: "ls".into(),
                password: None
            }
        );
    }

    #[test]
    fn pass_through_classification() {
        assert!(Effect::ClearScreen.passes_through());
        assert!(Effect::Delay { millis: 5 }.passes_through());
        assert!(!Effect::Logout.passes_through());
        assert!(
            !Effect::Useradd {
                username: "bob".into()
            }
            .passes_through()
        );
    }

    #[test]
    fn prompts_only_when_input_is_missing() {
        let with_pw = Effect::SwitchUser {
            username: "bob".into(),
            password: Some("x".into()),
        };
        assert!(with_pw.input_prompts().is_empty());
        let without = Effect::SwitchUser {
            username: "bob".into(),
            password: None,
        };
        assert_eq!(without.input_prompts().len(), 1);
        assert_eq!(
            Effect::Passwd {
                username: "bob".into()
            }
            .input_prompts()
            .len(),
            2
        );
    }
}
