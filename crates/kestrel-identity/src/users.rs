//! User accounts and password verification.

use std::collections::BTreeMap;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use kestrel_types::config::{SecurityConfig, UserPolicy};
use kestrel_types::error::{KernelError, Result};

/// Name of the superuser account and group.
pub const ROOT: &str = "root";

/// One account. A missing hash means the account has no password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    #[serde(default)]
    pub password_hash: Option<String>,
    pub primary_group: String,
}

/// Every account, keyed by username.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserRegistry {
    users: BTreeMap<String, UserRecord>,
    #[serde(skip)]
    security: SecurityConfig,
}

/// Check a prospective username against the naming policy.
pub fn validate_username(name: &str, policy: &UserPolicy) -> Result<()> {
    let invalid = |msg: String| Err(KernelError::InvalidArgument(msg));
    if name.trim().is_empty() {
        return invalid("Username cannot be empty.".to_string());
    }
    if name.chars().any(char::is_whitespace) {
        return invalid("Username cannot contain spaces.".to_string());
    }
    let lowered = name.to_lowercase();
    if policy.reserved_names.iter().any(|r| r.to_lowercase() == lowered) {
        return invalid(format!("Cannot use '{name}'. This username is reserved."));
    }
    let len = name.chars().count();
    if len < policy.min_length {
        return invalid(format!(
            "Username must be at least {} characters long.",
            policy.min_length
        ));
    }
    if len > policy.max_length {
        return invalid(format!(
            "Username cannot exceed {} characters.",
            policy.max_length
        ));
    }
    Ok(())
}

fn hasher(security: &SecurityConfig) -> Result<Argon2<'static>> {
    let params = Params::new(
        security.hash_memory_kib,
        security.hash_iterations,
        security.hash_parallelism,
        None,
    )
    .map_err(|e| KernelError::InvalidArgument(format!("invalid hash parameters: {e}")))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash a password into a PHC string with a fresh random salt.
pub fn hash_password(password: &str, security: &SecurityConfig) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = hasher(security)?
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| KernelError::InvalidArgument(format!("cannot hash password: {e}")))?;
    Ok(hash.to_string())
}

fn verify_hash(attempt: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        // Cost parameters come from the stored string.
        Ok(parsed) => Argon2::default()
            .verify_password(attempt.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            log::warn!("Unreadable password hash: {e}");
            false
        },
    }
}

impl UserRegistry {
    pub fn new(security: SecurityConfig) -> Self {
        Self {
            users: BTreeMap::new(),
            security,
        }
    }

    /// `root` and the default user, both without passwords.
    pub fn with_defaults(default_user: &str, security: SecurityConfig) -> Self {
        let mut registry = Self::new(security);
        registry.ensure_defaults(default_user);
        registry
    }

    /// Add `root` and the default user if a loaded table lacks them.
    pub fn ensure_defaults(&mut self, default_user: &str) {
        for name in [ROOT, default_user] {
            self.users.entry(name.to_string()).or_insert_with(|| UserRecord {
                password_hash: None,
                primary_group: name.to_string(),
            });
        }
    }

    /// Replace the hashing cost used for new passwords.
    pub fn set_security(&mut self, security: SecurityConfig) {
        self.security = security;
    }

    pub fn exists(&self, name: &str) -> bool {
        self.users.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&UserRecord> {
        self.users.get(name)
    }

    pub fn primary_group(&self, name: &str) -> Option<&str> {
        self.users.get(name).map(|u| u.primary_group.as_str())
    }

    pub fn has_password(&self, name: &str) -> bool {
        self.users
            .get(name)
            .is_some_and(|u| u.password_hash.is_some())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.users.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &UserRecord)> {
        self.users.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Username to primary group, for consistency checks.
    pub fn primary_groups(&self) -> BTreeMap<String, String> {
        self.users
            .iter()
            .map(|(name, u)| (name.clone(), u.primary_group.clone()))
            .collect()
    }

    /// Register an account. An empty or absent password makes it
    /// passwordless.
    pub fn create_user(
        &mut self,
        name: &str,
        password: Option<&str>,
        primary_group: &str,
    ) -> Result<()> {
        if self.exists(name) {
            return Err(KernelError::AlreadyExists(format!("user '{name}'")));
        }
        let password_hash = match password {
            Some(p) if !p.is_empty() => Some(hash_password(p, &self.security)?),
            _ => None,
        };
        self.users.insert(
            name.to_string(),
            UserRecord {
                password_hash,
                primary_group: primary_group.to_string(),
            },
        );
        log::info!("Created user {name}");
        Ok(())
    }

    /// Drop an account. `root` cannot be removed.
    pub fn remove_user(&mut self, name: &str) -> Result<UserRecord> {
        if name == ROOT {
            return Err(KernelError::InvalidArgument(
                "Cannot remove the root user.".to_string(),
            ));
        }
        let record = self
            .users
            .remove(name)
            .ok_or_else(|| KernelError::InvalidArgument(format!("User '{name}' does not exist.")))?;
        log::info!("Removed user {name}");
        Ok(record)
    }

    /// Check a password attempt.
    ///
    /// A passwordless account accepts only the empty attempt; an account
    /// with a password never accepts it. Unknown users always fail.
    pub fn verify_password(&self, name: &str, attempt: &str) -> bool {
        match self.users.get(name) {
            None => false,
            Some(UserRecord {
                password_hash: None,
                ..
            }) => attempt.is_empty(),
            Some(UserRecord {
                password_hash: Some(_),
                ..
            }) if attempt.is_empty() => false,
            Some(UserRecord {
                password_hash: Some(hash),
                ..
            }) => verify_hash(attempt, hash),
        }
    }

    /// [`verify_password`](Self::verify_password) as a `Result` that never
    /// says which half of the pair was wrong.
    pub fn authenticate(&self, name: &str, attempt: &str) -> Result<()> {
        if self.verify_password(name, attempt) {
            Ok(())
        } else {
            log::warn!("Failed authentication for '{name}'");
            Err(KernelError::AuthenticationFailed)
        }
    }

    pub fn change_password(&mut self, name: &str, new_password: &str) -> Result<()> {
        if new_password.is_empty() {
            return Err(KernelError::InvalidArgument(
                "Password cannot be empty.".to_string(),
            ));
        }
        let hash = hash_password(new_password, &self.security)?;
        let record = self
            .users
            .get_mut(name)
            .ok_or_else(|| KernelError::InvalidArgument(format!("User '{name}' does not exist.")))?;
        record.password_hash = Some(hash);
        log::info!("Password changed for {name}");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn cheap_security() -> SecurityConfig {
    SecurityConfig {
        hash_memory_kib: 8,
        hash_iterations: 1,
        hash_parallelism: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> UserRegistry {
        UserRegistry::with_defaults("Guest", cheap_security())
    }

    #[test]
    fn defaults_have_no_passwords() {
        let users = registry();
        assert!(users.exists("root"));
        assert!(users.exists("Guest"));
        assert!(!users.has_password("root"));
        assert!(users.verify_password("Guest", ""));
        assert!(!users.verify_password("Guest", "x"));
    }

    #[test]
    fn create_and_verify() {
        let mut users = registry();
        users.create_user("bob", Some("pass1"), "bob").unwrap();
        assert!(users.has_password("bob"));
        assert!(users.verify_password("bob", "pass1"));
        assert!(!users.verify_password("bob", "wrong"));
        assert!(!users.verify_password("bob", ""));
        assert_eq!(users.primary_group("bob"), Some("bob"));
    }

    #[test]
    fn hash_is_phc_string() {
        let mut users = registry();
        users.create_user("bob", Some("pass1"), "bob").unwrap();
        let hash = users.get("bob").unwrap().password_hash.clone().unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(!hash.contains("pass1"));
    }

    #[test]
    fn duplicate_user_rejected() {
        let mut users = registry();
        users.create_user("bob", None, "bob").unwrap();
        let err = users.create_user("bob", None, "bob").unwrap_err();
        assert!(matches!(err, KernelError::AlreadyExists(_)));
    }

    #[test]
    fn authentication_failure_is_uniform() {
        let mut users = registry();
        users.create_user("bob", Some("pass1"), "bob").unwrap();
        let wrong_pw = users.authenticate("bob", "nope").unwrap_err().to_string();
        let no_user = users.authenticate("nobody", "nope").unwrap_err().to_string();
        assert_eq!(wrong_pw, no_user);
    }

    #[test]
    fn change_password_rejects_empty() {
        let mut users = registry();
        users.create_user("bob", Some("pass1"), "bob").unwrap();
        assert!(users.change_password("bob", "").is_err());
        users.change_password("bob", "pass2").unwrap();
        assert!(users.verify_password("bob", "pass2"));
        assert!(!users.verify_password("bob", "pass1"));
    }

    #[test]
    fn root_cannot_be_removed() {
        let mut users = registry();
        assert!(users.remove_user("root").is_err());
        assert!(users.remove_user("ghost").is_err());
        users.create_user("bob", None, "bob").unwrap();
        users.remove_user("bob").unwrap();
        assert!(!users.exists("bob"));
    }

    #[test]
    fn username_rules() {
        let policy = UserPolicy::default();
        assert!(validate_username("bob", &policy).is_ok());
        assert!(validate_username("", &policy).is_err());
        assert!(validate_username("a b", &policy).is_err());
        assert!(validate_username("ROOT", &policy).is_err());
        assert!(validate_username("Guest", &policy).is_err());
        assert!(validate_username("ab", &policy).is_err());
        assert!(validate_username(&"x".repeat(21), &policy).is_err());
    }

    #[test]
    fn serialized_shape() {
        let mut users = registry();
        users.create_user("bob", None, "staff").unwrap();
        let json = serde_json::to_value(&users).unwrap();
        assert_eq!(json["bob"]["primaryGroup"], "staff");
        assert!(json["bob"]["passwordHash"].is_null());
        let back: UserRegistry = serde_json::from_value(json).unwrap();
        assert_eq!(back.get("bob"), users.get("bob"));
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn whitespace_names_always_rejected(a in "[a-z]{2,8}", b in "[a-z]{2,8}") {
                let name = format!("{a} {b}");
                prop_assert!(validate_username(&name, &UserPolicy::default()).is_err());
            }
        }
    }
}
