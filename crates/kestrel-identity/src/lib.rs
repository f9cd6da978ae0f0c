//! Accounts and privilege for Kestrel.
//!
//! Users and groups are plain registries; the session stack records nested
//! logins; [`SudoAuthorizer`] decides escalation from the sudoers text and
//! remembers recent authentications.

pub mod accounts;
pub mod groups;
pub mod session;
pub mod sudo;
pub mod users;

pub use accounts::{create_account, delete_account};
pub use groups::{GroupRecord, GroupRegistry};
pub use session::SessionStack;
pub use sudo::{SudoAuthorizer, SudoersPolicy};
pub use users::{UserRecord, UserRegistry, validate_username};
