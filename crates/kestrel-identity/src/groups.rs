//! Groups and memberships.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use kestrel_types::error::{KernelError, Result};

use crate::users::{ROOT, UserRegistry};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    #[serde(default)]
    pub members: BTreeSet<String>,
}

/// Every group, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupRegistry {
    groups: BTreeMap<String, GroupRecord>,
}

fn validate_group_name(name: &str) -> Result<()> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == '%' || c == '/') {
        return Err(KernelError::InvalidArgument(format!(
            "invalid group name: '{name}'"
        )));
    }
    Ok(())
}

impl GroupRegistry {
    /// `root` and the default user's group, each holding its namesake.
    pub fn with_defaults(default_user: &str) -> Self {
        let mut registry = Self::default();
        registry.ensure_defaults(default_user);
        registry
    }

    pub fn ensure_defaults(&mut self, default_user: &str) {
        for name in [ROOT, default_user] {
            self.groups
                .entry(name.to_string())
                .or_default()
                .members
                .insert(name.to_string());
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn name_set(&self) -> BTreeSet<String> {
        self.groups.keys().cloned().collect()
    }

    pub fn members(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.groups.get(name).map(|g| &g.members)
    }

    pub fn create(&mut self, name: &str) -> Result<()> {
        validate_group_name(name)?;
        if self.exists(name) {
            return Err(KernelError::AlreadyExists(format!("group '{name}'")));
        }
        self.groups.insert(name.to_string(), GroupRecord::default());
        log::info!("Created group {name}");
        Ok(())
    }

    /// Delete a group. `root` and any user's primary group are refused.
    pub fn delete(&mut self, name: &str, users: &UserRegistry) -> Result<()> {
        if name == ROOT {
            return Err(KernelError::InvalidArgument(
                "cannot delete the root group".to_string(),
            ));
        }
        if !self.exists(name) {
            return Err(KernelError::InvalidArgument(format!(
                "group '{name}' does not exist"
            )));
        }
        if let Some((user, _)) = users.iter().find(|(_, u)| u.primary_group == name) {
            return Err(KernelError::InvalidArgument(format!(
                "cannot remove the primary group of user '{user}'"
            )));
        }
        self.groups.remove(name);
        log::info!("Deleted group {name}");
        Ok(())
    }

    /// Add `user` to `group`. Returns whether membership changed.
    pub fn add_member(&mut self, group: &str, user: &str) -> Result<bool> {
        let record = self.groups.get_mut(group).ok_or_else(|| {
            KernelError::InvalidArgument(format!("group '{group}' does not exist"))
        })?;
        Ok(record.members.insert(user.to_string()))
    }

    pub fn remove_member(&mut self, group: &str, user: &str) -> Result<bool> {
        let record = self.groups.get_mut(group).ok_or_else(|| {
            KernelError::InvalidArgument(format!("group '{group}' does not exist"))
        })?;
        Ok(record.members.remove(user))
    }

    /// Drop `user` from every member set. Returns whether anything changed.
    pub fn remove_user_everywhere(&mut self, user: &str) -> bool {
        let mut changed = false;
        for record in self.groups.values_mut() {
            changed |= record.members.remove(user);
        }
        changed
    }

    /// The user's primary group followed by every group listing them.
    pub fn groups_for(&self, user: &str, users: &UserRegistry) -> Vec<String> {
        let mut result = Vec::new();
        if let Some(primary) = users.primary_group(user) {
            result.push(primary.to_string());
        }
        for (name, record) in &self.groups {
            if record.members.contains(user) && !result.contains(name) {
                result.push(name.clone());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::cheap_security;

    fn fixtures() -> (UserRegistry, GroupRegistry) {
        (
            UserRegistry::with_defaults("Guest", cheap_security()),
            GroupRegistry::with_defaults("Guest"),
        )
    }

    #[test]
    fn defaults() {
        let (_, groups) = fixtures();
        assert!(groups.members("root").unwrap().contains("root"));
        assert!(groups.members("Guest").unwrap().contains("Guest"));
    }

    #[test]
    fn membership_round_trip() {
        let (mut users, mut groups) = fixtures();
        users.create_user("alice", None, "alice").unwrap();
        groups.create("alice").unwrap();
        groups.create("staff").unwrap();
        assert!(groups.add_member("staff", "alice").unwrap());
        assert!(!groups.add_member("staff", "alice").unwrap());
        assert_eq!(groups.groups_for("alice", &users), vec!["alice", "staff"]);
        assert!(groups.remove_member("staff", "alice").unwrap());
        assert_eq!(groups.groups_for("alice", &users), vec!["alice"]);
    }

    #[test]
    fn primary_group_listed_once() {
        let (users, groups) = fixtures();
        assert_eq!(groups.groups_for("root", &users), vec!["root"]);
    }

    #[test]
    fn create_rejects_duplicates_and_bad_names() {
        let (_, mut groups) = fixtures();
        assert!(matches!(
            groups.create("root").unwrap_err(),
            KernelError::AlreadyExists(_)
        ));
        assert!(groups.create("%wheel").is_err());
        assert!(groups.create("two words").is_err());
    }

    #[test]
    fn delete_guards() {
        let (users, mut groups) = fixtures();
        assert!(groups.delete("root", &users).is_err());
        assert!(groups.delete("Guest", &users).is_err());
        assert!(groups.delete("nope", &users).is_err());
        groups.create("staff").unwrap();
        groups.delete("staff", &users).unwrap();
        assert!(!groups.exists("staff"));
    }

    #[test]
    fn remove_user_everywhere_clears_memberships() {
        let (_, mut groups) = fixtures();
        groups.create("staff").unwrap();
        groups.add_member("staff", "bob").unwrap();
        groups.add_member("root", "bob").unwrap();
        assert!(groups.remove_user_everywhere("bob"));
        assert!(!groups.members("staff").unwrap().contains("bob"));
        assert!(!groups.members("root").unwrap().contains("bob"));
        assert!(!groups.remove_user_everywhere("bob"));
    }

    #[test]
    fn serialized_shape() {
        let (_, groups) = fixtures();
        let json = serde_json::to_value(&groups).unwrap();
        assert_eq!(json["root"]["members"][0], "root");
    }
}
