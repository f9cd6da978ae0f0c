//! Two-phase copy and move.
//!
//! [`Vfs::prepare_file_operation`] validates a whole batch without touching
//! the tree. Only a plan that fully validated can be committed.

use std::collections::BTreeSet;

use kestrel_types::error::{KernelError, Result};

use crate::node::Node;
use crate::path::{basename, is_descendant, join, normalize, parent};
use crate::permissions::{Access, Credentials, can_access};
use crate::tree::Vfs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Copy,
    Move,
}

impl TransferKind {
    fn verb(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Move => "move",
        }
    }
}

/// One source-to-destination step of a plan. Both paths are physical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOp {
    pub source: String,
    pub destination: String,
    /// The destination is an existing file that will be replaced.
    pub overwrite: bool,
}

/// A validated batch, ready for [`Vfs::commit`].
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub kind: TransferKind,
    pub ops: Vec<TransferOp>,
    creds: Credentials,
}

impl Vfs {
    /// Validate moving or copying every source to `dest`.
    ///
    /// With several sources `dest` must be an existing directory. An existing
    /// directory destination receives each source under its own name.
    pub fn prepare_file_operation(
        &self,
        sources: &[&str],
        dest: &str,
        creds: &Credentials,
        kind: TransferKind,
        recursive: bool,
    ) -> Result<TransferPlan> {
        if sources.is_empty() {
            return Err(KernelError::InvalidArgument(format!(
                "{}: missing file operand",
                kind.verb()
            )));
        }
        let dest = normalize(dest).into_owned();
        let (dest_phys, dest_exists) = self.walk_physical(&dest, true, Some(creds))?;
        let dest_is_dir = dest_exists && self.node(&dest_phys).is_some_and(Node::is_dir);
        if sources.len() > 1 && !dest_is_dir {
            return Err(KernelError::NotADirectory(dest));
        }

        let verb = kind.verb();
        let mut targets = BTreeSet::new();
        let mut moved: Vec<String> = Vec::new();
        let mut ops = Vec::with_capacity(sources.len());

        for &src in sources {
            let src = normalize(src).into_owned();
            if src == "/" {
                return Err(KernelError::InvalidArgument(format!(
                    "cannot {verb} the root directory"
                )));
            }
            // A moved symlink travels as itself; a copied one is dereferenced.
            let follow = kind == TransferKind::Copy;
            let (src_phys, exists) = self.walk_physical(&src, follow, Some(creds))?;
            if !exists {
                return Err(KernelError::NotFound(src));
            }
            let node = self
                .node(&src_phys)
                .ok_or_else(|| KernelError::NotFound(src.clone()))?;

            match kind {
                TransferKind::Copy => {
                    if node.is_dir() && !recursive {
                        return Err(KernelError::InvalidArgument(format!(
                            "-r not specified; omitting directory '{src}'"
                        )));
                    }
                    if let Some(p) = first_unreadable(node, &src_phys, creds) {
                        return Err(KernelError::denied(format!("cannot read '{p}'")));
                    }
                },
                TransferKind::Move => {
                    let src_parent = self
                        .node(parent(&src_phys))
                        .ok_or_else(|| KernelError::NotFound(src.clone()))?;
                    if !can_access(src_parent, creds, Access::Write) {
                        return Err(KernelError::denied(format!("cannot move '{src}'")));
                    }
                },
            }

            let target = if dest_is_dir {
                join(&dest_phys, basename(&src_phys))
            } else {
                dest_phys.clone()
            };
            if target == src_phys {
                return Err(KernelError::InvalidArgument(format!(
                    "'{src}' and '{dest}' are the same file"
                )));
            }
            if node.is_dir() && is_descendant(&target, &src_phys) {
                return Err(KernelError::InvalidArgument(format!(
                    "cannot {verb} '{src}' to a subdirectory of itself, '{dest}'"
                )));
            }
            if !targets.insert(target.clone()) {
                return Err(KernelError::InvalidArgument(format!(
                    "will not overwrite just-created '{target}' with '{src}'"
                )));
            }

            let overwrite = match self.node(&target) {
                None => false,
                Some(existing) if existing.is_dir() || node.is_dir() => {
                    return Err(KernelError::AlreadyExists(target));
                },
                Some(existing) => {
                    if !can_access(existing, creds, Access::Write) {
                        return Err(KernelError::denied(format!("cannot overwrite '{target}'")));
                    }
                    true
                },
            };
            let target_parent = self
                .node(parent(&target))
                .ok_or_else(|| KernelError::NotFound(parent(&target).to_string()))?;
            if !can_access(target_parent, creds, Access::Write) {
                return Err(KernelError::denied(format!("cannot create '{target}'")));
            }

            if kind == TransferKind::Move {
                moved.push(src_phys.clone());
            }
            ops.push(TransferOp {
                source: src_phys,
                destination: target,
                overwrite,
            });
        }

        // Moving a node together with one of its ancestors would detach it twice.
        for a in &moved {
            if let Some(b) = moved.iter().find(|b| is_descendant(b, a)) {
                return Err(KernelError::InvalidArgument(format!(
                    "cannot move '{b}' together with its parent '{a}'"
                )));
            }
        }

        Ok(TransferPlan {
            kind,
            ops,
            creds: creds.clone(),
        })
    }

    /// Apply a validated plan.
    pub fn commit(&mut self, plan: TransferPlan) -> Result<()> {
        let creds = plan.creds;
        for op in &plan.ops {
            let node = match plan.kind {
                TransferKind::Move => self
                    .detach(&op.source)
                    .ok_or_else(|| KernelError::NotFound(op.source.clone()))?,
                TransferKind::Copy => {
                    let mut copy = self
                        .node(&op.source)
                        .cloned()
                        .ok_or_else(|| KernelError::NotFound(op.source.clone()))?;
                    copy.for_each_mut(&mut |n| {
                        n.owner = creds.user.clone();
                        n.group = creds.primary_group.clone();
                        n.touch();
                    });
                    copy
                },
            };
            if op.overwrite {
                self.detach(&op.destination);
            }
            self.attach(&op.destination, node)?;
            log::debug!(
                "{} {} -> {} as {}",
                plan.kind.verb(),
                op.source,
                op.destination,
                creds.user
            );
        }
        self.mark_changed();
        Ok(())
    }

    /// Move a single node, as `mv from to` would.
    pub fn rename(&mut self, from: &str, to: &str, creds: &Credentials) -> Result<()> {
        let plan = self.prepare_file_operation(&[from], to, creds, TransferKind::Move, false)?;
        self.commit(plan)
    }
}

/// First node in the subtree the caller cannot read (or, for directories,
/// list and enter).
fn first_unreadable(node: &Node, path: &str, creds: &Credentials) -> Option<String> {
    let mut found = None;
    node.walk(path, &mut |p, n| {
        if found.is_some() || n.is_symlink() {
            return;
        }
        let readable = can_access(n, creds, Access::Read)
            && (!n.is_dir() || can_access(n, creds, Access::Execute));
        if !readable {
            found = Some(p.to_string());
        }
    });
    found
}
