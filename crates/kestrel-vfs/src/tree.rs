//! The node store: lookups, path validation, and in-place mutations.
//!
//! Every mutation validates fully before it touches the tree, so a failed
//! call leaves the store exactly as it was.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use kestrel_types::error::{KernelError, Result};

use crate::node::{
    COLLABORATIVE_FILE_MODE, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, Node, NodeKind, NodeType,
};
use crate::path::{self, basename, components, is_valid_name, join, normalize};
use crate::permissions::{Access, Credentials, ROOT_USER, can_access, can_modify_metadata};

/// Symlink hops allowed during one lookup before it is treated as a loop.
pub const MAX_SYMLINK_HOPS: usize = 40;

/// Preconditions checked by [`Vfs::validate_path`].
#[derive(Debug, Clone, Default)]
pub struct ValidateOptions {
    pub expected_type: Option<NodeType>,
    pub permissions: Vec<Access>,
    pub allow_missing: bool,
    /// Inspect a final symlink itself rather than its target.
    pub no_follow: bool,
}

impl ValidateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn expect(mut self, node_type: NodeType) -> Self {
        self.expected_type = Some(node_type);
        self
    }

    #[must_use]
    pub fn require(mut self, access: Access) -> Self {
        self.permissions.push(access);
        self
    }

    #[must_use]
    pub fn allow_missing(mut self) -> Self {
        self.allow_missing = true;
        self
    }

    #[must_use]
    pub fn no_follow(mut self) -> Self {
        self.no_follow = true;
        self
    }
}

/// A successfully validated path.
#[derive(Debug)]
pub struct Validated<'a> {
    /// The resolved absolute path as the user named it.
    pub path: String,
    /// The same location with every symlink resolved.
    pub physical: String,
    /// The node, or `None` when missing and `allow_missing` was set.
    pub node: Option<&'a Node>,
}

/// Result of walking a path through the tree.
struct Walked {
    physical: String,
    exists: bool,
}

/// Where a create-or-update lands.
enum Placement {
    /// The target already exists at this physical path.
    Exists(String),
    /// The target is missing; `missing` names hang below the `anchor`
    /// directory, the last of them being the target itself.
    Create(CreationPlan),
}

struct CreationPlan {
    anchor: String,
    missing: Vec<String>,
}

/// The virtual filesystem tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vfs {
    #[serde(rename = "/")]
    root: Node,
    #[serde(skip)]
    revision: u64,
}

impl PartialEq for Vfs {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

fn stack_path(stack: &[String]) -> String {
    if stack.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", stack.join("/"))
    }
}

impl Vfs {
    /// A tree holding only the root directory.
    pub fn new() -> Self {
        Self {
            root: Node::directory(ROOT_USER, ROOT_USER, DEFAULT_DIR_MODE),
            revision: 0,
        }
    }

    /// The layout of a fresh install.
    pub fn with_defaults(default_user: &str, default_group: &str) -> Self {
        fn dir(owner: &str, group: &str, mode: u16, kids: Vec<(&str, Node)>) -> Node {
            let mut d = Node::directory(owner, group, mode);
            if let Some(children) = d.children_mut() {
                for (name, kid) in kids {
                    children.insert(name.to_string(), kid);
                }
            }
            d
        }
        let r = ROOT_USER;
        let mut homes = vec![("root", dir(r, r, 0o700, vec![]))];
        if default_user != ROOT_USER {
            homes.push((
                default_user,
                dir(default_user, default_group, DEFAULT_DIR_MODE, vec![]),
            ));
        }
        let sudoers = Node::file(DEFAULT_SUDOERS, r, r, 0o440);
        let root = dir(
            r,
            r,
            DEFAULT_DIR_MODE,
            vec![
                ("bin", dir(r, r, DEFAULT_DIR_MODE, vec![])),
                ("etc", dir(r, r, DEFAULT_DIR_MODE, vec![("sudoers", sudoers)])),
                ("home", dir(r, r, DEFAULT_DIR_MODE, homes)),
                ("tmp", dir(r, r, 0o777, vec![])),
                (
                    "var",
                    dir(r, r, DEFAULT_DIR_MODE, vec![("log", dir(r, r, DEFAULT_DIR_MODE, vec![]))]),
                ),
            ],
        );
        Self { root, revision: 0 }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Increments on every committed mutation. Not persisted.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn bump(&mut self) {
        self.revision += 1;
    }

    // -- Lookup --

    /// Descend along a symlink-free path.
    fn node_at(&self, physical: &str) -> Option<&Node> {
        let mut node = &self.root;
        for name in components(physical) {
            node = node.children()?.get(name)?;
        }
        Some(node)
    }

    fn node_at_mut(&mut self, physical: &str) -> Option<&mut Node> {
        let mut node = &mut self.root;
        for name in components(physical) {
            node = node.children_mut()?.get_mut(name)?;
        }
        Some(node)
    }

    /// Walk a canonical path, expanding symlinks on the way.
    ///
    /// A missing final component is reported through `exists` rather than
    /// as an error so callers can create it. With credentials, execute
    /// permission is required on every directory traversed.
    fn walk(&self, path: &str, follow_final: bool, creds: Option<&Credentials>) -> Result<Walked> {
        let mut pending: VecDeque<String> = components(path).map(str::to_string).collect();
        let mut stack: Vec<String> = Vec::new();
        let mut hops = 0;

        while let Some(name) = pending.pop_front() {
            match name.as_str() {
                "" | "." => continue,
                ".." => {
                    stack.pop();
                    continue;
                },
                _ => {},
            }
            let dir_path = stack_path(&stack);
            let dir = self
                .node_at(&dir_path)
                .ok_or_else(|| KernelError::NotFound(path.to_string()))?;
            let children = dir
                .children()
                .ok_or_else(|| KernelError::NotADirectory(dir_path.clone()))?;
            if let Some(creds) = creds
                && !can_access(dir, creds, Access::Execute)
            {
                return Err(KernelError::denied(format!("cannot access '{dir_path}'")));
            }
            let is_last = pending.is_empty();
            match children.get(&name) {
                None if is_last => {
                    stack.push(name);
                    return Ok(Walked {
                        physical: stack_path(&stack),
                        exists: false,
                    });
                },
                None => return Err(KernelError::NotFound(path.to_string())),
                Some(child) => {
                    if let Some(target) = child.target()
                        && (!is_last || follow_final)
                    {
                        hops += 1;
                        if hops > MAX_SYMLINK_HOPS {
                            return Err(KernelError::NotFound(format!(
                                "{path} (too many levels of symbolic links)"
                            )));
                        }
                        if target.starts_with('/') {
                            stack.clear();
                        }
                        for part in target.split('/').rev().filter(|s| !s.is_empty()) {
                            pending.push_front(part.to_string());
                        }
                    } else {
                        stack.push(name);
                    }
                },
            }
        }

        Ok(Walked {
            physical: stack_path(&stack),
            exists: true,
        })
    }

    fn lookup(&self, path: &str, follow_final: bool) -> Option<&Node> {
        let walked = self.walk(&normalize(path), follow_final, None).ok()?;
        if walked.exists {
            self.node_at(&walked.physical)
        } else {
            None
        }
    }

    /// Look up an absolute path, following symlinks.
    pub fn get_node(&self, path: &str) -> Option<&Node> {
        self.lookup(path, true)
    }

    /// Look up an absolute path without following a final symlink.
    pub fn get_node_nofollow(&self, path: &str) -> Option<&Node> {
        self.lookup(path, false)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.get_node(path).is_some()
    }

    /// The symlink-free location of an existing path.
    pub fn physical_path(&self, path: &str) -> Result<String> {
        let walked = self.walk(&normalize(path), true, None)?;
        if walked.exists {
            Ok(walked.physical)
        } else {
            Err(KernelError::NotFound(path.to_string()))
        }
    }

    /// Total content bytes at and below `path`.
    pub fn size_of(&self, path: &str) -> Option<u64> {
        self.get_node(path).map(Node::size)
    }

    /// Resolve `path_arg` against `cwd` and check every precondition in
    /// `opts`: traversal rights along the way, existence, node type, and the
    /// requested permissions on the target.
    ///
    /// When the target is missing and `allow_missing` is set, any requested
    /// write permission is checked against the parent directory instead.
    pub fn validate_path(
        &self,
        path_arg: &str,
        cwd: &str,
        creds: &Credentials,
        opts: &ValidateOptions,
    ) -> Result<Validated<'_>> {
        let resolved = path::resolve(path_arg, cwd);
        let walked = self.walk(&resolved, !opts.no_follow, Some(creds))?;

        if !walked.exists {
            if !opts.allow_missing {
                return Err(KernelError::NotFound(path_arg.to_string()));
            }
            if opts.permissions.contains(&Access::Write) {
                let parent = path::parent(&walked.physical);
                let parent_node = self
                    .node_at(parent)
                    .ok_or_else(|| KernelError::NotFound(parent.to_string()))?;
                if !can_access(parent_node, creds, Access::Write) {
                    return Err(KernelError::denied(format!("cannot create '{path_arg}'")));
                }
            }
            return Ok(Validated {
                path: resolved,
                physical: walked.physical,
                node: None,
            });
        }

        let node = self
            .node_at(&walked.physical)
            .ok_or_else(|| KernelError::NotFound(path_arg.to_string()))?;
        match (opts.expected_type, node.node_type()) {
            (Some(NodeType::Directory), t) if t != NodeType::Directory => {
                return Err(KernelError::NotADirectory(path_arg.to_string()));
            },
            (Some(NodeType::File), NodeType::Directory) => {
                return Err(KernelError::IsADirectory(path_arg.to_string()));
            },
            _ => {},
        }
        for &access in &opts.permissions {
            if !can_access(node, creds, access) {
                return Err(KernelError::denied(format!(
                    "cannot {} '{path_arg}'",
                    access.verb()
                )));
            }
        }
        Ok(Validated {
            path: resolved,
            physical: walked.physical,
            node: Some(node),
        })
    }

    // -- Creation planning --

    /// Find where `path` lands, checking traversal rights and, when
    /// something must be created, write access on the deepest existing
    /// directory.
    fn place(&self, path: &str, creds: &Credentials) -> Result<Placement> {
        let comps: Vec<&str> = components(path).collect();
        let mut anchor = "/".to_string();
        for i in 0..comps.len() {
            let prefix = format!("/{}", comps[..=i].join("/"));
            let walked = self.walk(&prefix, true, Some(creds))?;
            if !walked.exists {
                let anchor_node = self
                    .node_at(&anchor)
                    .ok_or_else(|| KernelError::NotFound(anchor.clone()))?;
                if !anchor_node.is_dir() {
                    return Err(KernelError::NotADirectory(anchor));
                }
                if !can_access(anchor_node, creds, Access::Write) {
                    return Err(KernelError::denied(format!("cannot create '{path}'")));
                }
                let missing: Vec<String> = comps[i..].iter().map(|s| s.to_string()).collect();
                if let Some(bad) = missing.iter().find(|n| !is_valid_name(n)) {
                    return Err(KernelError::InvalidArgument(format!("invalid name: '{bad}'")));
                }
                return Ok(Placement::Create(CreationPlan { anchor, missing }));
            }
            anchor = walked.physical;
        }
        Ok(Placement::Exists(anchor))
    }

    /// Create the planned chain of directories, ending in `leaf` if given.
    /// Each touched parent gets a fresh mtime.
    fn materialize(
        &mut self,
        plan: CreationPlan,
        creds: &Credentials,
        mut leaf: Option<NodeKind>,
    ) -> Result<()> {
        let last = plan.missing.len().saturating_sub(1);
        let mut current = plan.anchor;
        for (i, name) in plan.missing.into_iter().enumerate() {
            let parent = self
                .node_at_mut(&current)
                .ok_or_else(|| KernelError::NotFound(current.clone()))?;
            let node = match leaf.take() {
                Some(kind) if i == last => leaf_node(kind, parent, creds),
                other => {
                    leaf = other;
                    Node::directory(&creds.user, &creds.primary_group, DEFAULT_DIR_MODE)
                },
            };
            parent.touch();
            parent
                .children_mut()
                .ok_or_else(|| KernelError::NotADirectory(current.clone()))?
                .insert(name.clone(), node);
            current = join(&current, &name);
        }
        Ok(())
    }

    // -- Mutations --

    /// Write `content` to `path`, creating the file and any missing parent
    /// directories.
    pub fn create_or_update_file(
        &mut self,
        path: &str,
        content: &str,
        creds: &Credentials,
    ) -> Result<()> {
        let path = normalize(path).into_owned();
        match self.place(&path, creds)? {
            Placement::Exists(physical) => {
                let node = self
                    .node_at_mut(&physical)
                    .ok_or_else(|| KernelError::NotFound(path.clone()))?;
                if node.is_dir() {
                    return Err(KernelError::IsADirectory(path));
                }
                if !can_access(node, creds, Access::Write) {
                    return Err(KernelError::denied(format!("cannot write '{path}'")));
                }
                node.kind = NodeKind::File {
                    content: content.to_string(),
                };
                node.touch();
            },
            Placement::Create(plan) => {
                let leaf = NodeKind::File {
                    content: content.to_string(),
                };
                self.materialize(plan, creds, Some(leaf))?;
            },
        }
        self.bump();
        log::debug!("wrote {} bytes to {path} as {}", content.len(), creds.user);
        Ok(())
    }

    /// Create a directory. With `parents`, missing ancestors are created and
    /// an existing directory is not an error.
    pub fn create_directory(&mut self, path: &str, creds: &Credentials, parents: bool) -> Result<()> {
        let path = normalize(path).into_owned();
        match self.place(&path, creds)? {
            Placement::Exists(physical) => {
                let is_dir = self.node_at(&physical).is_some_and(Node::is_dir);
                if parents && is_dir {
                    Ok(())
                } else {
                    Err(KernelError::AlreadyExists(path))
                }
            },
            Placement::Create(plan) => {
                if plan.missing.len() > 1 && !parents {
                    return Err(KernelError::NotFound(path::parent(&path).to_string()));
                }
                self.materialize(plan, creds, None)?;
                self.bump();
                log::debug!("created directory {path} as {}", creds.user);
                Ok(())
            },
        }
    }

    /// Update a node's mtime, creating an empty file if it is missing.
    pub fn touch(&mut self, path: &str, creds: &Credentials) -> Result<()> {
        let path = normalize(path).into_owned();
        match self.place(&path, creds)? {
            Placement::Exists(physical) => {
                let node = self
                    .node_at_mut(&physical)
                    .ok_or_else(|| KernelError::NotFound(path.clone()))?;
                if !can_access(node, creds, Access::Write) && !can_modify_metadata(node, creds) {
                    return Err(KernelError::denied(format!("cannot touch '{path}'")));
                }
                node.touch();
            },
            Placement::Create(plan) => {
                if plan.missing.len() > 1 {
                    return Err(KernelError::NotFound(path::parent(&path).to_string()));
                }
                let leaf = NodeKind::File {
                    content: String::new(),
                };
                self.materialize(plan, creds, Some(leaf))?;
            },
        }
        self.bump();
        Ok(())
    }

    /// Create a symlink at `link_path` pointing at `target` (stored verbatim).
    pub fn symlink(&mut self, target: &str, link_path: &str, creds: &Credentials) -> Result<()> {
        let link_path = normalize(link_path).into_owned();
        if link_path == "/" {
            return Err(KernelError::AlreadyExists(link_path));
        }
        let walked = self.walk(&link_path, false, Some(creds))?;
        if walked.exists {
            return Err(KernelError::AlreadyExists(link_path));
        }
        let anchor = path::parent(&walked.physical).to_string();
        let parent = self
            .node_at(&anchor)
            .ok_or_else(|| KernelError::NotFound(anchor.clone()))?;
        if !can_access(parent, creds, Access::Write) {
            return Err(KernelError::denied(format!("cannot create '{link_path}'")));
        }
        let plan = CreationPlan {
            missing: vec![basename(&walked.physical).to_string()],
            anchor,
        };
        let leaf = NodeKind::Symlink {
            target: target.to_string(),
        };
        self.materialize(plan, creds, Some(leaf))?;
        self.bump();
        Ok(())
    }

    /// Remove a node. Directories with entries need `recursive`, and then
    /// every non-empty directory below must be writable by the caller.
    pub fn remove(&mut self, path: &str, creds: &Credentials, recursive: bool) -> Result<()> {
        let path = normalize(path).into_owned();
        if path == "/" {
            return Err(KernelError::InvalidArgument(
                "cannot remove '/': refusing to remove the root directory".to_string(),
            ));
        }
        let walked = self.walk(&path, false, Some(creds))?;
        if !walked.exists {
            return Err(KernelError::NotFound(path));
        }
        let physical = walked.physical;
        let parent_path = path::parent(&physical).to_string();
        let parent = self
            .node_at(&parent_path)
            .ok_or_else(|| KernelError::NotFound(parent_path.clone()))?;
        if !can_access(parent, creds, Access::Write) {
            return Err(KernelError::denied(format!("cannot remove '{path}'")));
        }
        let node = self
            .node_at(&physical)
            .ok_or_else(|| KernelError::NotFound(path.clone()))?;
        if node.children().is_some_and(|c| !c.is_empty()) {
            if !recursive {
                return Err(KernelError::InvalidArgument(format!(
                    "cannot remove '{path}': Directory not empty"
                )));
            }
            let mut blocked: Option<String> = None;
            node.walk(&physical, &mut |p, n| {
                let nonempty = n.children().is_some_and(|c| !c.is_empty());
                if blocked.is_none()
                    && nonempty
                    && !(can_access(n, creds, Access::Write)
                        && can_access(n, creds, Access::Execute))
                {
                    blocked = Some(p.to_string());
                }
            });
            if let Some(p) = blocked {
                return Err(KernelError::denied(format!("cannot remove entries in '{p}'")));
            }
        }

        let name = basename(&physical).to_string();
        let parent = self
            .node_at_mut(&parent_path)
            .ok_or_else(|| KernelError::NotFound(parent_path.clone()))?;
        if let Some(children) = parent.children_mut() {
            children.remove(&name);
        }
        parent.touch();
        self.bump();
        log::debug!("removed {path} as {}", creds.user);
        Ok(())
    }

    /// Validate that every affected node may have its metadata changed, then
    /// apply `change` to each of them.
    fn update_metadata(
        &mut self,
        path: &str,
        creds: &Credentials,
        recursive: bool,
        change: impl Fn(&mut Node),
    ) -> Result<()> {
        let path = normalize(path).into_owned();
        let walked = self.walk(&path, true, Some(creds))?;
        if !walked.exists {
            return Err(KernelError::NotFound(path));
        }
        let node = self
            .node_at(&walked.physical)
            .ok_or_else(|| KernelError::NotFound(path.clone()))?;
        let mut blocked: Option<String> = None;
        if recursive {
            node.walk(&walked.physical, &mut |p, n| {
                if blocked.is_none() && !can_modify_metadata(n, creds) {
                    blocked = Some(p.to_string());
                }
            });
        } else if !can_modify_metadata(node, creds) {
            blocked = Some(path.clone());
        }
        if let Some(p) = blocked {
            return Err(KernelError::denied(format!("cannot change '{p}'")));
        }

        let node = self
            .node_at_mut(&walked.physical)
            .ok_or_else(|| KernelError::NotFound(path.clone()))?;
        if recursive {
            node.for_each_mut(&mut |n| change(n));
        } else {
            change(node);
        }
        self.bump();
        Ok(())
    }

    pub fn chmod(&mut self, path: &str, mode: u16, creds: &Credentials, recursive: bool) -> Result<()> {
        self.update_metadata(path, creds, recursive, |n| n.mode = mode & 0o777)
    }

    /// Change the owning user. The caller checks that `owner` exists.
    pub fn chown(&mut self, path: &str, owner: &str, creds: &Credentials, recursive: bool) -> Result<()> {
        self.update_metadata(path, creds, recursive, |n| n.owner = owner.to_string())
    }

    /// Change the owning group. The caller checks that `group` exists.
    pub fn chgrp(&mut self, path: &str, group: &str, creds: &Credentials, recursive: bool) -> Result<()> {
        self.update_metadata(path, creds, recursive, |n| n.group = group.to_string())
    }

    // -- Low-level access for the transfer and fsck passes --

    pub(crate) fn detach(&mut self, physical: &str) -> Option<Node> {
        let parent = self.node_at_mut(path::parent(physical))?;
        let node = parent.children_mut()?.remove(basename(physical))?;
        parent.touch();
        Some(node)
    }

    pub(crate) fn attach(&mut self, physical: &str, node: Node) -> Result<()> {
        let parent_path = path::parent(physical);
        let parent = self
            .node_at_mut(parent_path)
            .ok_or_else(|| KernelError::NotFound(parent_path.to_string()))?;
        parent
            .children_mut()
            .ok_or_else(|| KernelError::NotADirectory(parent_path.to_string()))?
            .insert(basename(physical).to_string(), node);
        parent.touch();
        Ok(())
    }

    pub(crate) fn node_mut(&mut self, physical: &str) -> Option<&mut Node> {
        self.node_at_mut(physical)
    }

    pub(crate) fn node(&self, physical: &str) -> Option<&Node> {
        self.node_at(physical)
    }

    pub(crate) fn walk_physical(
        &self,
        path: &str,
        follow_final: bool,
        creds: Option<&Credentials>,
    ) -> Result<(String, bool)> {
        let walked = self.walk(&normalize(path), follow_final, creds)?;
        Ok((walked.physical, walked.exists))
    }

    pub(crate) fn mark_changed(&mut self) {
        self.bump();
    }

    // -- Persistence --

    /// Serialize the whole tree as `{"/": <root node>}`.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Rebuild a tree from its serialized form, rejecting structurally
    /// invalid documents.
    pub fn from_json(text: &str) -> Result<Self> {
        let vfs: Self = serde_json::from_str(text)
            .map_err(|e| KernelError::Corrupted(format!("filesystem: {e}")))?;
        vfs.check_structure()?;
        Ok(vfs)
    }

    /// Structural invariants a loaded tree must satisfy.
    pub fn check_structure(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(KernelError::Corrupted(
                "filesystem root is not a directory".to_string(),
            ));
        }
        let mut bad: Option<String> = None;
        self.root.walk("/", &mut |p, n| {
            if bad.is_none()
                && let Some(children) = n.children()
                && let Some(name) = children.keys().find(|k| !is_valid_name(k))
            {
                bad = Some(format!("invalid entry name '{name}' in {p}"));
            }
        });
        match bad {
            Some(msg) => Err(KernelError::Corrupted(msg)),
            None => Ok(()),
        }
    }
}

/// Build the final node of a creation, applying the collaborative-directory
/// rule to files.
fn leaf_node(kind: NodeKind, parent: &Node, creds: &Credentials) -> Node {
    let (group, mode) = match &kind {
        NodeKind::File { .. } if parent.is_collaborative() => {
            (parent.group.clone(), COLLABORATIVE_FILE_MODE)
        },
        NodeKind::File { .. } => (creds.primary_group.clone(), DEFAULT_FILE_MODE),
        NodeKind::Directory { .. } => (creds.primary_group.clone(), DEFAULT_DIR_MODE),
        NodeKind::Symlink { .. } => (creds.primary_group.clone(), crate::node::SYMLINK_MODE),
    };
    let mut node = Node::directory(&creds.user, &group, mode);
    node.kind = kind;
    node
}

/// Contents of `/etc/sudoers` on a fresh install.
pub const DEFAULT_SUDOERS: &str = "# /etc/sudoers\n#\n# This file MUST be edited with the 'visudo' command as root.\n\nroot ALL=(ALL) ALL\n%root ALL=(ALL) ALL\n";
