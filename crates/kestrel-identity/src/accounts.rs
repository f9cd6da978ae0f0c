//! Operations spanning both registries.

use kestrel_types::error::Result;

use crate::groups::GroupRegistry;
use crate::users::{UserRecord, UserRegistry};

/// Create `name` with a same-named primary group, adding the group if it is
/// missing.
pub fn create_account(
    users: &mut UserRegistry,
    groups: &mut GroupRegistry,
    name: &str,
    password: Option<&str>,
) -> Result<()> {
    users.create_user(name, password, name)?;
    if !groups.exists(name) {
        groups.create(name)?;
    }
    Ok(())
}

/// Remove `name` from the user table and from every member set. The
/// same-named group goes too unless another user still has it as primary.
pub fn delete_account(
    users: &mut UserRegistry,
    groups: &mut GroupRegistry,
    name: &str,
) -> Result<UserRecord> {
    let record = users.remove_user(name)?;
    groups.remove_user_everywhere(name);
    if groups.exists(name) && users.iter().all(|(_, u)| u.primary_group != name) {
        groups.delete(name, users)?;
    }
    Ok(record)
}
