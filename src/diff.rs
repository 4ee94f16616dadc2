//! Tree differencer
//!
//! Walks an ancestor tree and a modified tree of the same outward shape and
//! produces the ordered list of [`Change`]s that turns one into the other.
//! Changes are emitted in pre-order, left before right, arguments in
//! position order; the application engine relies on that order.
//!
//! Every change is a self-contained value. The `replacement` of a
//! modification carries the position's identity chain extended by the
//! edit's own identifier and the edit's commit time, so the same change-set
//! can be applied locally and merged on another replica.

use std::fmt;

use crate::ast::{FormulaTree, Node, NodeKind};
use crate::error::ChangeError;

/// Slot of a new root that receives the surviving subtree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    /// Left operand of a `Binary`
    Left,
    /// Right operand of a `Binary`
    Right,
    /// Operand of a `Unary`
    Operand,
    /// Argument position of a `Function`
    Argument(usize),
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Left => f.write_str("left"),
            Direction::Right => f.write_str("right"),
            Direction::Operand => f.write_str("operand"),
            Direction::Argument(i) => write!(f, "argument {i}"),
        }
    }
}

/// One edit between two trees
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Change {
    /// Same variant, different own content
    NodeModification { original: Node, replacement: Node },
    /// A child appears under `parent`.
    ///
    /// `index` is the argument position on the modified side; `Binary`
    /// parents fill their first empty slot instead.
    ChildAddition {
        parent: Node,
        child: Node,
        index: usize,
    },
    ChildDeletion { parent: Node, child: Node },
    /// An ancestor subtree became one operand of a new wrapper
    RootAddition {
        new_root: Node,
        child: Node,
        direction: Direction,
    },
    /// A wrapper was removed; `child` is the operand that takes its place
    RootDeletion { new_root: Node, child: Node },
    /// Top-level scalar swapped for a scalar of another variant
    RootNodeModification { original: Node, replacement: Node },
    /// Type mismatch the differencer could not classify
    StructuralChange { original: Node, replacement: Node },
}

/// Ordered change list; order is significant
pub type ChangeSet = Vec<Change>;

impl Change {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Change::NodeModification { .. } => "NodeModification",
            Change::ChildAddition { .. } => "ChildAddition",
            Change::ChildDeletion { .. } => "ChildDeletion",
            Change::RootAddition { .. } => "RootAddition",
            Change::RootDeletion { .. } => "RootDeletion",
            Change::RootNodeModification { .. } => "RootNodeModification",
            Change::StructuralChange { .. } => "StructuralChange",
        }
    }

    /// Node whose position the change is resolved against
    pub fn anchor(&self) -> &Node {
        match self {
            Change::NodeModification { original, .. }
            | Change::RootNodeModification { original, .. }
            | Change::StructuralChange { original, .. } => original,
            Change::ChildAddition { parent, .. } | Change::ChildDeletion { parent, .. } => parent,
            Change::RootAddition { child, .. } | Change::RootDeletion { child, .. } => child,
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::NodeModification {
                original,
                replacement,
            }
            | Change::RootNodeModification {
                original,
                replacement,
            }
            | Change::StructuralChange {
                original,
                replacement,
            } => write!(f, "{} {} -> {}", self.kind_name(), original.label(), replacement.label()),
            Change::ChildAddition {
                parent,
                child,
                index,
            } => write!(f, "ChildAddition {child} into {} at {index}", parent.label()),
            Change::ChildDeletion { parent, child } => {
                write!(f, "ChildDeletion {child} from {}", parent.label())
            }
            Change::RootAddition {
                new_root,
                child,
                direction,
            } => write!(f, "RootAddition {} around {child} as {direction}", new_root.label()),
            Change::RootDeletion { new_root, child } => {
                write!(f, "RootDeletion {} kept as {new_root}", child.label())
            }
        }
    }
}

/// Compute the changes that turn `ancestor` into `modified`.
///
/// Fails with [`ChangeError::IrreducibleStructuralChange`] when a `Binary`
/// root is replaced by something that matches neither of its operands.
pub fn diff_trees(ancestor: &FormulaTree, modified: &FormulaTree) -> Result<ChangeSet, ChangeError> {
    let mut changes = Vec::new();
    diff_nodes(ancestor.root(), modified.root(), &mut changes)?;
    Ok(changes)
}

/// Replacement for `original`: `modified`'s content on `original`'s
/// position, one write further along.
fn stamped(original: &Node, modified: &Node) -> Node {
    let identity = original.identity().extended_with(modified.identity().latest());
    modified
        .clone()
        .with_meta(identity, modified.author(), modified.committed_at())
}

fn emit(changes: &mut ChangeSet, change: Change) {
    tracing::trace!(
        kind = change.kind_name(),
        position = %change.anchor().identity(),
        "change emitted"
    );
    changes.push(change);
}

fn diff_nodes(n1: &Node, n2: &Node, changes: &mut ChangeSet) -> Result<(), ChangeError> {
    if n1.node_type() != n2.node_type() {
        return diff_mismatched(n1, n2, changes);
    }

    if !n1.content_eq(n2) {
        emit(
            changes,
            Change::NodeModification {
                original: n1.clone(),
                replacement: stamped(n1, n2),
            },
        );
    }

    match (n1.kind(), n2.kind()) {
        (
            NodeKind::Binary {
                left: l1,
                right: r1,
                ..
            },
            NodeKind::Binary {
                left: l2,
                right: r2,
                ..
            },
        ) => {
            diff_slot(n1, l1.as_deref(), l2.as_deref(), 0, changes)?;
            diff_slot(n1, r1.as_deref(), r2.as_deref(), 1, changes)?;
        }
        (NodeKind::Function { arguments: a1, .. }, NodeKind::Function { arguments: a2, .. }) => {
            for i in 0..a1.len().max(a2.len()) {
                diff_slot(n1, a1.get(i), a2.get(i), i, changes)?;
            }
        }
        (NodeKind::Unary { operand: o1, .. }, NodeKind::Unary { operand: o2, .. }) => {
            diff_nodes(o1, o2, changes)?;
        }
        _ => {}
    }
    Ok(())
}

/// One child position of a composite: recurse on matching variants,
/// otherwise delete the old child and add the new one.
fn diff_slot(
    parent: &Node,
    old: Option<&Node>,
    new: Option<&Node>,
    index: usize,
    changes: &mut ChangeSet,
) -> Result<(), ChangeError> {
    match (old, new) {
        (Some(old), Some(new)) if old.node_type() == new.node_type() => {
            diff_nodes(old, new, changes)?;
        }
        (old, new) => {
            if let Some(old) = old {
                emit(
                    changes,
                    Change::ChildDeletion {
                        parent: parent.clone(),
                        child: old.clone(),
                    },
                );
            }
            if let Some(new) = new {
                emit(
                    changes,
                    Change::ChildAddition {
                        parent: parent.clone(),
                        child: new.clone(),
                        index,
                    },
                );
            }
        }
    }
    Ok(())
}

fn structural(n1: &Node, n2: &Node) -> Change {
    Change::StructuralChange {
        original: n1.clone(),
        replacement: n2.clone(),
    }
}

/// Variants differ. A scalar swap is only recognized between two roots;
/// wrapping and unwrapping are classified at any depth.
fn diff_mismatched(n1: &Node, n2: &Node, changes: &mut ChangeSet) -> Result<(), ChangeError> {
    if n1.is_root() && n2.is_root() && !n1.is_composite() && !n2.is_composite() {
        emit(
            changes,
            Change::RootNodeModification {
                original: n1.clone(),
                replacement: stamped(n1, n2),
            },
        );
        return Ok(());
    }

    // Wrapped in a new binary operator
    if let NodeKind::Binary { left, right, .. } = n2.kind() {
        let candidates = [(left, Direction::Left), (right, Direction::Right)];
        for (slot, direction) in candidates {
            if let Some(operand) = slot.as_deref().filter(|o| n1.shallow_matches(o)) {
                return root_addition(n1, n2, operand, direction, changes);
            }
        }
        emit(changes, structural(n1, n2));
        return Ok(());
    }

    // Unwrapped from a binary operator
    if let NodeKind::Binary { left, right, .. } = n1.kind() {
        for operand in [left, right].into_iter().flatten() {
            if operand.shallow_matches(n2) {
                return root_deletion(operand, n2, changes);
            }
        }
        return Err(ChangeError::IrreducibleStructuralChange {
            original: n1.to_string(),
            replacement: n2.to_string(),
        });
    }

    if let NodeKind::Unary { operand, .. } = n1.kind() {
        if operand.shallow_matches(n2) {
            return root_deletion(operand, n2, changes);
        }
    }
    if let NodeKind::Unary { operand, .. } = n2.kind() {
        if n1.shallow_matches(operand) {
            return root_addition(n1, n2, operand, Direction::Operand, changes);
        }
    }
    if let NodeKind::Function { arguments, .. } = n2.kind() {
        if let Some(i) = arguments.iter().position(|a| n1.shallow_matches(a)) {
            return root_addition(n1, n2, &arguments[i], Direction::Argument(i), changes);
        }
    }
    if let NodeKind::Function { arguments, .. } = n1.kind() {
        if let Some(arg) = arguments.iter().find(|a| a.shallow_matches(n2)) {
            return root_deletion(arg, n2, changes);
        }
    }

    emit(changes, structural(n1, n2));
    Ok(())
}

fn root_addition(
    n1: &Node,
    n2: &Node,
    operand: &Node,
    direction: Direction,
    changes: &mut ChangeSet,
) -> Result<(), ChangeError> {
    emit(
        changes,
        Change::RootAddition {
            new_root: n2.clone(),
            child: n1.clone(),
            direction,
        },
    );
    // The match is single-level; edits below it are ordinary changes
    diff_nodes(n1, operand, changes)
}

fn root_deletion(kept: &Node, n2: &Node, changes: &mut ChangeSet) -> Result<(), ChangeError> {
    emit(
        changes,
        Change::RootDeletion {
            new_root: n2.clone(),
            child: kept.clone(),
        },
    );
    diff_nodes(kept, n2, changes)
}
