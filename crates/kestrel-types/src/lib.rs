//! Foundation types for Kestrel.
//!
//! This crate holds what every other Kestrel crate shares: the kernel error
//! taxonomy, the serializable failure payload handed across the syscall
//! boundary, and the TOML-backed kernel configuration.

pub mod config;
pub mod error;

pub use config::KernelConfig;
pub use error::{ErrorKind, Failure, KernelError, Result};
