//! Consistency check between the tree and the user/group tables.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use kestrel_types::error::Result;

use crate::node::{DEFAULT_DIR_MODE, Node};
use crate::path::{self, join};
use crate::permissions::ROOT_USER;
use crate::tree::Vfs;

/// One problem found by [`Vfs::fsck`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum FsckIssue {
    UnknownOwner { path: String, owner: String },
    UnknownGroup { path: String, group: String },
    DanglingSymlink { path: String, target: String },
    MissingHome { user: String, path: String },
}

impl fmt::Display for FsckIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOwner { path, owner } => write!(f, "{path}: unknown owner '{owner}'"),
            Self::UnknownGroup { path, group } => write!(f, "{path}: unknown group '{group}'"),
            Self::DanglingSymlink { path, target } => {
                write!(f, "{path}: dangling symlink to '{target}'")
            },
            Self::MissingHome { user, path } => write!(f, "{path}: missing home of '{user}'"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FsckReport {
    pub issues: Vec<FsckIssue>,
    /// Whether the issues were fixed or only reported.
    pub repaired: bool,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

impl Vfs {
    /// Check the tree against the known accounts.
    ///
    /// `users` maps each username to its primary group. With `repair`,
    /// unknown owners and groups are reassigned to root, dangling symlinks
    /// are removed, and missing home directories are recreated.
    pub fn fsck(
        &mut self,
        users: &BTreeMap<String, String>,
        groups: &BTreeSet<String>,
        repair: bool,
    ) -> Result<FsckReport> {
        let mut issues = Vec::new();
        self.root().walk("/", &mut |p, n: &Node| {
            if !users.contains_key(&n.owner) {
                issues.push(FsckIssue::UnknownOwner {
                    path: p.to_string(),
                    owner: n.owner.clone(),
                });
            }
            if !groups.contains(&n.group) {
                issues.push(FsckIssue::UnknownGroup {
                    path: p.to_string(),
                    group: n.group.clone(),
                });
            }
            if let Some(target) = n.target() {
                let resolved = path::resolve(target, path::parent(p));
                if self.get_node(&resolved).is_none() {
                    issues.push(FsckIssue::DanglingSymlink {
                        path: p.to_string(),
                        target: target.to_string(),
                    });
                }
            }
        });
        for user in users.keys() {
            let home = join("/home", user);
            if !self.get_node(&home).is_some_and(Node::is_dir) {
                issues.push(FsckIssue::MissingHome {
                    user: user.clone(),
                    path: home,
                });
            }
        }

        if repair && !issues.is_empty() {
            self.apply_repairs(&issues, users)?;
            log::info!("fsck repaired {} issue(s)", issues.len());
        }
        Ok(FsckReport {
            issues,
            repaired: repair,
        })
    }

    fn apply_repairs(&mut self, issues: &[FsckIssue], users: &BTreeMap<String, String>) -> Result<()> {
        for issue in issues {
            match issue {
                FsckIssue::UnknownOwner { path, .. } => {
                    if let Some(node) = self.node_mut(path) {
                        node.owner = ROOT_USER.to_string();
                    }
                },
                FsckIssue::UnknownGroup { path, .. } => {
                    if let Some(node) = self.node_mut(path) {
                        node.group = ROOT_USER.to_string();
                    }
                },
                FsckIssue::DanglingSymlink { path, .. } => {
                    self.detach(path);
                },
                FsckIssue::MissingHome { user, path } => {
                    if self.node("/home").is_none() {
                        self.attach("/home", Node::directory(ROOT_USER, ROOT_USER, DEFAULT_DIR_MODE))?;
                    }
                    // A non-directory squatting on the home path is replaced.
                    self.detach(path);
                    let group = users.get(user).map_or(user.as_str(), String::as_str);
                    self.attach(path, Node::directory(user, group, DEFAULT_DIR_MODE))?;
                },
            }
        }
        self.mark_changed();
        Ok(())
    }
}
