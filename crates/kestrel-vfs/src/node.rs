//! Filesystem nodes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default mode for newly created files.
pub const DEFAULT_FILE_MODE: u16 = 0o644;
/// Default mode for newly created directories.
pub const DEFAULT_DIR_MODE: u16 = 0o755;
/// Mode given to files created inside a collaborative directory.
pub const COLLABORATIVE_FILE_MODE: u16 = 0o660;
/// Mode of symlink nodes (never consulted for access).
pub const SYMLINK_MODE: u16 = 0o777;

/// The three kinds of node, without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Directory,
    Symlink,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Symlink => "symlink",
        })
    }
}

/// Type-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    File { content: String },
    Directory { children: BTreeMap<String, Node> },
    Symlink { target: String },
}

/// A file, directory, or symlink with its ownership metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub owner: String,
    pub group: String,
    /// rwx bits for owner, group, and other.
    pub mode: u16,
    pub mtime: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    pub fn file(content: impl Into<String>, owner: &str, group: &str, mode: u16) -> Self {
        Self::with_kind(
            NodeKind::File {
                content: content.into(),
            },
            owner,
            group,
            mode,
        )
    }

    pub fn directory(owner: &str, group: &str, mode: u16) -> Self {
        Self::with_kind(
            NodeKind::Directory {
                children: BTreeMap::new(),
            },
            owner,
            group,
            mode,
        )
    }

    pub fn symlink(target: impl Into<String>, owner: &str, group: &str) -> Self {
        Self::with_kind(
            NodeKind::Symlink {
                target: target.into(),
            },
            owner,
            group,
            SYMLINK_MODE,
        )
    }

    fn with_kind(kind: NodeKind, owner: &str, group: &str, mode: u16) -> Self {
        Self {
            owner: owner.to_string(),
            group: group.to_string(),
            mode,
            mtime: Utc::now(),
            kind,
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::File { .. } => NodeType::File,
            NodeKind::Directory { .. } => NodeType::Directory,
            NodeKind::Symlink { .. } => NodeType::Symlink,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, NodeKind::Symlink { .. })
    }

    pub fn content(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::File { content } => Some(content),
            _ => None,
        }
    }

    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Symlink { target } => Some(target),
            _ => None,
        }
    }

    pub fn children(&self) -> Option<&BTreeMap<String, Node>> {
        match &self.kind {
            NodeKind::Directory { children } => Some(children),
            _ => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut BTreeMap<String, Node>> {
        match &mut self.kind {
            NodeKind::Directory { children } => Some(children),
            _ => None,
        }
    }

    /// Whether group bits are set and other bits are clear. Files created in
    /// such a directory are shared with the directory's group.
    pub fn is_collaborative(&self) -> bool {
        self.is_dir() && (self.mode & 0o070) != 0 && (self.mode & 0o007) == 0
    }

    /// Bytes of content: file length, link target length, or the sum over a
    /// directory's subtree.
    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File { content } => content.len() as u64,
            NodeKind::Symlink { target } => target.len() as u64,
            NodeKind::Directory { children } => children.values().map(Node::size).sum(),
        }
    }

    /// Apply `f` to this node and every node below it.
    pub fn for_each_mut(&mut self, f: &mut impl FnMut(&mut Node)) {
        f(self);
        if let Some(children) = self.children_mut() {
            for child in children.values_mut() {
                child.for_each_mut(f);
            }
        }
    }

    /// Visit this node and its subtree with paths, depth-first.
    pub fn walk<'a>(&'a self, path: &str, f: &mut impl FnMut(&str, &'a Node)) {
        f(path, self);
        if let Some(children) = self.children() {
            for (name, child) in children {
                child.walk(&crate::path::join(path, name), f);
            }
        }
    }

    pub(crate) fn touch(&mut self) {
        self.mtime = Utc::now();
    }
}
