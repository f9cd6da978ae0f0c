//! Unix-style owner/group/other permission checks.

use std::collections::BTreeSet;

use kestrel_types::error::{KernelError, Result};

use crate::node::{Node, NodeType};

/// The superuser name. Always passes every check.
pub const ROOT_USER: &str = "root";

/// A single permission bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    /// Bit within an rwx triplet.
    pub fn bit(self) -> u16 {
        match self {
            Self::Read => 0b100,
            Self::Write => 0b010,
            Self::Execute => 0b001,
        }
    }

    pub fn verb(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
        }
    }
}

/// Who is asking: the effective user, their primary group, and every group
/// they belong to (primary included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub primary_group: String,
    pub groups: BTreeSet<String>,
}

impl Credentials {
    pub fn new(
        user: impl Into<String>,
        primary_group: impl Into<String>,
        groups: impl IntoIterator<Item = String>,
    ) -> Self {
        let primary_group = primary_group.into();
        let mut groups: BTreeSet<String> = groups.into_iter().collect();
        groups.insert(primary_group.clone());
        Self {
            user: user.into(),
            primary_group,
            groups,
        }
    }

    pub fn root() -> Self {
        Self::new(ROOT_USER, ROOT_USER, std::iter::empty())
    }

    pub fn is_root(&self) -> bool {
        self.user == ROOT_USER
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}

/// Decide whether `creds` may perform `access` on `node`.
///
/// Root always passes. Otherwise exactly one triplet is consulted: owner
/// bits if the user owns the node, else group bits if the user belongs to
/// the node's group, else other bits.
pub fn can_access(node: &Node, creds: &Credentials, access: Access) -> bool {
    if creds.is_root() {
        return true;
    }
    let triplet = if node.owner == creds.user {
        (node.mode >> 6) & 0o7
    } else if creds.in_group(&node.group) {
        (node.mode >> 3) & 0o7
    } else {
        node.mode & 0o7
    };
    triplet & access.bit() != 0
}

/// Only a node's owner, or root, may change its mode or ownership.
pub fn can_modify_metadata(node: &Node, creds: &Credentials) -> bool {
    creds.is_root() || node.owner == creds.user
}

/// Fail with `PermissionDenied` naming `path` unless access is allowed.
pub fn require(node: &Node, creds: &Credentials, access: Access, path: &str) -> Result<()> {
    if can_access(node, creds, access) {
        Ok(())
    } else {
        Err(KernelError::denied(format!("cannot {} '{path}'", access.verb())))
    }
}

/// Parse an octal mode argument such as `755` or `0640`.
pub fn parse_mode(text: &str) -> Result<u16> {
    let valid = (3..=4).contains(&text.len()) && text.chars().all(|c| ('0'..='7').contains(&c));
    if !valid {
        return Err(KernelError::InvalidArgument(format!(
            "invalid mode: '{text}' (expected 3 or 4 octal digits)"
        )));
    }
    let mode = u16::from_str_radix(text, 8)
        .map_err(|_| KernelError::InvalidArgument(format!("invalid mode: '{text}'")))?;
    if mode > 0o777 {
        return Err(KernelError::InvalidArgument(format!(
            "invalid mode: '{text}' (special bits are not supported)"
        )));
    }
    Ok(mode)
}

/// Render a node's type and mode the way `ls -l` does, e.g. `drwxr-x---`.
pub fn format_mode(node_type: NodeType, mode: u16) -> String {
    let mut out = String::with_capacity(10);
    out.push(match node_type {
        NodeType::Directory => 'd',
        NodeType::Symlink => 'l',
        NodeType::File => '-',
    });
    for shift in [6, 3, 0] {
        let t = (mode >> shift) & 0o7;
        out.push(if t & 0b100 != 0 { 'r' } else { '-' });
        out.push(if t & 0b010 != 0 { 'w' } else { '-' });
        out.push(if t & 0b001 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(user: &str, groups: &[&str]) -> Credentials {
        Credentials::new(user, user, groups.iter().map(|g| g.to_string()))
    }

    fn file_640() -> Node {
        Node::file("secret", "alice", "staff", 0o640)
    }

    #[test]
    fn owner_uses_owner_bits() {
        let n = file_640();
        let alice = creds("alice", &[]);
        assert!(can_access(&n, &alice, Access::Read));
        assert!(can_access(&n, &alice, Access::Write));
        assert!(!can_access(&n, &alice, Access::Execute));
    }

    #[test]
    fn group_member_reads_but_cannot_write_or_execute() {
        let n = file_640();
        let bob = creds("bob", &["staff"]);
        assert!(can_access(&n, &bob, Access::Read));
        assert!(!can_access(&n, &bob, Access::Write));
        assert!(!can_access(&n, &bob, Access::Execute));
    }

    #[test]
    fn stranger_gets_other_bits() {
        let n = file_640();
        let eve = creds("eve", &["users"]);
        assert!(!can_access(&n, &eve, Access::Read));
        assert!(!can_access(&n, &eve, Access::Write));
        assert!(!can_access(&n, &eve, Access::Execute));
    }

    #[test]
    fn root_always_passes() {
        let n = Node::file("x", "alice", "staff", 0o000);
        let root = Credentials::root();
        assert!(can_access(&n, &root, Access::Read));
        assert!(can_access(&n, &root, Access::Write));
        assert!(can_access(&n, &root, Access::Execute));
    }

    #[test]
    fn owner_triplet_is_not_widened_by_group() {
        // Owner bits deny even though the group bits would allow.
        let n = Node::file("x", "alice", "staff", 0o070);
        let alice = creds("alice", &["staff"]);
        assert!(!can_access(&n, &alice, Access::Read));
    }

    #[test]
    fn metadata_changes_owner_or_root_only() {
        let n = file_640();
        assert!(can_modify_metadata(&n, &creds("alice", &[])));
        assert!(can_modify_metadata(&n, &Credentials::root()));
        assert!(!can_modify_metadata(&n, &creds("bob", &["staff"])));
    }

    #[test]
    fn require_message_has_suffix() {
        let n = file_640();
        let err = require(&n, &creds("eve", &[]), Access::Read, "/x").unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot read '/x': You aren't allowed to do that."
        );
    }

    #[test]
    fn credentials_include_primary_group() {
        let c = Credentials::new("bob", "bob", vec!["dev".to_string()]);
        assert!(c.in_group("bob"));
        assert!(c.in_group("dev"));
        assert!(!c.is_root());
    }

    #[test]
    fn parse_mode_accepts_octal() {
        assert_eq!(parse_mode("755").unwrap(), 0o755);
        assert_eq!(parse_mode("0640").unwrap(), 0o640);
        assert_eq!(parse_mode("000").unwrap(), 0);
    }

    #[test]
    fn parse_mode_rejects_bad_input() {
        assert!(parse_mode("75").is_err());
        assert!(parse_mode("789").is_err());
        assert!(parse_mode("rwx").is_err());
        assert!(parse_mode("4755").is_err());
        assert!(parse_mode("07555").is_err());
    }

    #[test]
    fn format_mode_renders_triplets() {
        assert_eq!(format_mode(NodeType::Directory, 0o755), "drwxr-xr-x");
        assert_eq!(format_mode(NodeType::File, 0o640), "-rw-r-----");
        assert_eq!(format_mode(NodeType::Symlink, 0o777), "lrwxrwxrwx");
    }
}
