//! Kernel configuration loaded from TOML.
//!
//! Every field has a default, so an empty document (or no file at all)
//! yields a working configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Top-level kernel configuration (`kestrel.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Base entry of the session stack and the owner of the guest home.
    #[serde(default = "default_user")]
    pub default_user: String,
    #[serde(default)]
    pub users: UserPolicy,
    #[serde(default)]
    pub sudo: SudoConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub scripting: ScriptingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

fn default_hostname() -> String {
    "kestrel".to_string()
}
fn default_user() -> String {
    "Guest".to_string()
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            default_user: default_user(),
            users: UserPolicy::default(),
            sudo: SudoConfig::default(),
            terminal: TerminalConfig::default(),
            scripting: ScriptingConfig::default(),
            security: SecurityConfig::default(),
            storage: StorageConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl KernelConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a configuration file from the host filesystem.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        log::info!("Loaded kernel config from {}", path.display());
        Ok(config)
    }
}

/// Username rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPolicy {
    /// Names nobody may register, compared case-insensitively.
    #[serde(default = "default_reserved")]
    pub reserved_names: Vec<String>,
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

fn default_reserved() -> Vec<String> {
    ["guest", "root", "admin", "system"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_min_length() -> usize {
    3
}
fn default_max_length() -> usize {
    20
}

impl Default for UserPolicy {
    fn default() -> Self {
        Self {
            reserved_names: default_reserved(),
            min_length: default_min_length(),
            max_length: default_max_length(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SudoConfig {
    /// Minutes a successful authentication is remembered. Zero or negative
    /// disables remembering.
    #[serde(default = "default_sudo_timeout")]
    pub timeout_minutes: i64,
    #[serde(default = "default_sudoers_path")]
    pub sudoers_path: String,
}

fn default_sudo_timeout() -> i64 {
    15
}
fn default_sudoers_path() -> String {
    "/etc/sudoers".to_string()
}

impl Default for SudoConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_sudo_timeout(),
            sudoers_path: default_sudoers_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalConfig {
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_max_history() -> usize {
    50
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptingConfig {
    /// Lines executed per top-level request, nested scripts included.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Maximum `run` nesting.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_max_steps() -> usize {
    10_000
}
fn default_max_depth() -> usize {
    100
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_depth: default_max_depth(),
        }
    }
}

/// Argon2 cost parameters for new password hashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_hash_memory")]
    pub hash_memory_kib: u32,
    #[serde(default = "default_hash_iterations")]
    pub hash_iterations: u32,
    #[serde(default = "default_hash_parallelism")]
    pub hash_parallelism: u32,
}

fn default_hash_memory() -> u32 {
    19_456
}
fn default_hash_iterations() -> u32 {
    2
}
fn default_hash_parallelism() -> u32 {
    1
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            hash_memory_kib: default_hash_memory(),
            hash_iterations: default_hash_iterations(),
            hash_parallelism: default_hash_parallelism(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Host path of the persisted state document.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("kestrel-state.json")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// VFS path of the security audit log.
    #[serde(default = "default_audit_path")]
    pub log_path: String,
}

fn default_audit_path() -> String {
    "/var/log/audit.log".to_string()
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: default_audit_path(),
        }
    }
}
