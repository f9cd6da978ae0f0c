//! In-memory virtual filesystem for Kestrel.
//!
//! A tree of [`Node`]s rooted at `/`, with Unix-style ownership and mode
//! bits. All mutation goes through [`Vfs`], which validates a request fully
//! before changing anything.

pub mod fsck;
pub mod node;
pub mod path;
pub mod permissions;
pub mod transfer;
pub mod tree;

pub use fsck::{FsckIssue, FsckReport};
pub use node::{Node, NodeKind, NodeType};
pub use permissions::{Access, Credentials, ROOT_USER, can_access, format_mode, parse_mode};
pub use transfer::{TransferKind, TransferOp, TransferPlan};
pub use tree::{DEFAULT_SUDOERS, ValidateOptions, Validated, Vfs};
