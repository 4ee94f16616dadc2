//! CRDT merge engine
//!
//! Folds another collaborator's change-set into a local tree. Both change-sets
//! were computed against the same ancestor, so foreign changes are
//! re-anchored by identity-chain prefix match instead of by position.
//!
//! Same-position rewrites are settled by how far each side has moved past
//! their shared history: a foreign rewrite ahead of the local node applies,
//! two rewrites of equal depth go to the last writer, and a foreign rewrite
//! behind the local node is dropped. Two concurrent rewrites of a cell range
//! are unioned instead of raced.
//!
//! Anchors that no longer exist locally are skipped, never fatal.

use std::cmp::Ordering;
use std::fmt;

use crate::apply::{add_child, locate_mut, modify, promote_subtree, remove_child, replace_in_place, wrap_subtree};
use crate::ast::{CellRef, FormulaTree, Node, NodeKind};
use crate::diff::Change;
use crate::error::ChangeError;
use crate::identity::IdentityChain;

/// Author stamped on nodes rewritten by a merge
pub const MERGE_AUTHOR: &str = "merged";

/// Which side won a same-position race
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Foreign,
}

/// Same-position modification settled by last-writer-wins
#[derive(Debug, Clone)]
pub struct Conflict {
    /// Position both sides rewrote
    pub position: IdentityChain,
    /// Local content before the merge
    pub local: String,
    /// Foreign content
    pub foreign: String,
    pub winner: Side,
}

/// Why a foreign change was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No local node shares history with the change's anchor
    AnchorNotFound,
    /// The local node is further along than the foreign rewrite
    Superseded,
    /// The change is already reflected locally
    AlreadyApplied,
    /// The change no longer fits the local tree
    Rejected(ChangeError),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AnchorNotFound => f.write_str("anchor not found"),
            SkipReason::Superseded => f.write_str("superseded by local history"),
            SkipReason::AlreadyApplied => f.write_str("already applied"),
            SkipReason::Rejected(err) => write!(f, "rejected: {err}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Skipped {
    pub kind: &'static str,
    pub position: IdentityChain,
    pub reason: SkipReason,
}

/// Merge report
#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    /// Foreign changes that altered the local tree
    pub applied: usize,
    pub skipped: Vec<Skipped>,
    /// Same-position races, whichever side won
    pub conflicts: Vec<Conflict>,
}

impl MergeResult {
    /// True if no same-position race had to be settled
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Foreign rewrites past the shared prefix minus local rewrites past it.
///
/// `None` when the chains share no history at all.
pub fn conflict_depth(local: &IdentityChain, foreign: &IdentityChain) -> Option<isize> {
    let shared = local.common_prefix_len(foreign);
    if shared == 0 {
        return None;
    }
    Some(foreign.len() as isize - local.len() as isize)
}

/// Last-writer-wins: the later commit wins, exact ties go to the greater
/// tie-break hash. Returns true if `foreign` beats `local`.
pub fn foreign_wins(local: &Node, foreign: &Node) -> bool {
    match foreign.committed_at().cmp(&local.committed_at()) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => foreign.tie_break() > local.tie_break(),
    }
}

fn min_cell(a: &CellRef, b: &CellRef) -> CellRef {
    let col = if a.column_number() <= b.column_number() { &a.col } else { &b.col };
    CellRef::new(col, a.row.min(b.row))
}

fn max_cell(a: &CellRef, b: &CellRef) -> CellRef {
    let col = if a.column_number() >= b.column_number() { &a.col } else { &b.col };
    CellRef::new(col, a.row.max(b.row))
}

/// Component-wise union of two ranges: minimum start, maximum end.
///
/// `None` unless both nodes are cell ranges.
pub fn merge_ranges(a: &Node, b: &Node) -> Option<Node> {
    match (a.kind(), b.kind()) {
        (
            NodeKind::CellRange { start: s1, end: e1 },
            NodeKind::CellRange { start: s2, end: e2 },
        ) => Some(Node::range(min_cell(s1, s2), max_cell(e1, e2))),
        _ => None,
    }
}

/// Merge `foreign` into `tree`.
///
/// Only a foreign [`Change::StructuralChange`] is an error; the tree is then
/// left untouched.
pub fn merge_changes(tree: &mut FormulaTree, foreign: &[Change]) -> Result<MergeResult, ChangeError> {
    let mut work = tree.clone();
    let mut result = MergeResult::default();
    for change in foreign {
        match merge_change(&mut work, change, &mut result)? {
            Outcome::Applied => {
                result.applied += 1;
                tracing::debug!(
                    kind = change.kind_name(),
                    position = %change.anchor().identity(),
                    "foreign change merged"
                );
            }
            Outcome::Kept => {}
            Outcome::Skipped(reason) => {
                tracing::debug!(
                    kind = change.kind_name(),
                    position = %change.anchor().identity(),
                    %reason,
                    "foreign change skipped"
                );
                result.skipped.push(Skipped {
                    kind: change.kind_name(),
                    position: change.anchor().identity().clone(),
                    reason,
                });
            }
        }
    }
    *tree = work;
    Ok(result)
}

enum Outcome {
    Applied,
    /// Lost a last-writer-wins race; already recorded as a conflict
    Kept,
    Skipped(SkipReason),
}

impl From<Result<(), ChangeError>> for Outcome {
    fn from(result: Result<(), ChangeError>) -> Self {
        match result {
            Ok(()) => Outcome::Applied,
            Err(ChangeError::NodeNotFound { .. }) => Outcome::Skipped(SkipReason::AnchorNotFound),
            Err(err) => Outcome::Skipped(SkipReason::Rejected(err)),
        }
    }
}

fn merge_change(tree: &mut FormulaTree, change: &Change, result: &mut MergeResult) -> Result<Outcome, ChangeError> {
    let outcome: Outcome = match change {
        Change::NodeModification { replacement, .. } => merge_modification(tree, replacement, result),
        Change::RootNodeModification { replacement, .. } => {
            if tree.root().identity().shares_prefix_with(replacement.identity()) {
                merge_modification(tree, replacement, result)
            } else {
                Outcome::Skipped(SkipReason::AnchorNotFound)
            }
        }
        Change::ChildAddition {
            parent,
            child,
            index,
        } => match tree.find_mut(parent.identity()) {
            None => Outcome::Skipped(SkipReason::AnchorNotFound),
            Some(local) => {
                let present = local
                    .children()
                    .iter()
                    .any(|c| c.identity().shares_prefix_with(child.identity()));
                if present {
                    Outcome::Skipped(SkipReason::AlreadyApplied)
                } else {
                    add_child(local, child.clone(), *index, MERGE_AUTHOR).into()
                }
            }
        },
        Change::ChildDeletion { parent, child } => match tree.find_mut(parent.identity()) {
            None => Outcome::Skipped(SkipReason::AnchorNotFound),
            Some(local) => remove_child(local, child.identity()).map(drop).into(),
        },
        Change::RootAddition {
            new_root,
            child,
            direction,
        } => {
            if tree.find(new_root.identity()).is_some() {
                Outcome::Skipped(SkipReason::AlreadyApplied)
            } else {
                wrap_subtree(tree, child.identity(), new_root, *direction, MERGE_AUTHOR).into()
            }
        }
        Change::RootDeletion { child, .. } => match promote_subtree(tree, child) {
            Ok(true) => Outcome::Applied,
            Ok(false) => Outcome::Skipped(SkipReason::AlreadyApplied),
            Err(err) => Err::<(), _>(err).into(),
        },
        Change::StructuralChange { .. } => {
            return Err(ChangeError::UnhandledChange {
                kind: change.kind_name(),
            })
        }
    };
    Ok(outcome)
}

/// Modification of the position `replacement` descends from
fn merge_modification(tree: &mut FormulaTree, replacement: &Node, result: &mut MergeResult) -> Outcome {
    let position = replacement.identity();
    let local = match tree.find_mut(position) {
        Some(local) => local,
        None => return Outcome::Skipped(SkipReason::AnchorNotFound),
    };

    if local.identity().ids().contains(&position.latest()) {
        return Outcome::Skipped(SkipReason::AlreadyApplied);
    }

    let Some(depth) = conflict_depth(local.identity(), position) else {
        return Outcome::Skipped(SkipReason::AnchorNotFound);
    };
    match depth.cmp(&0) {
        Ordering::Less => Outcome::Skipped(SkipReason::Superseded),
        Ordering::Greater => rewrite(tree, replacement),
        Ordering::Equal => {
            // Union only for concurrent range rewrites. A one-sided rewrite
            // took the depth > 0 path above, so a shrunk range is never
            // widened back to the ancestor range (DESIGN.md, decision 4).
            if let Some(union) = merge_ranges(local, replacement) {
                let union = union.with_meta(position.clone(), MERGE_AUTHOR, replacement.committed_at());
                return modify(local, &union, MERGE_AUTHOR).into();
            }

            let winner = if foreign_wins(local, replacement) {
                Side::Foreign
            } else {
                Side::Local
            };
            tracing::debug!(
                position = %position,
                local = %local.label(),
                foreign = %replacement.label(),
                ?winner,
                "same-position rewrite settled"
            );
            result.conflicts.push(Conflict {
                position: local.identity().clone(),
                local: local.label(),
                foreign: replacement.label(),
                winner,
            });
            match winner {
                Side::Foreign => rewrite(tree, replacement),
                Side::Local => Outcome::Kept,
            }
        }
    }
}

/// Take the foreign content at its position; a variant change swaps the
/// node wholesale.
fn rewrite(tree: &mut FormulaTree, replacement: &Node) -> Outcome {
    let position = replacement.identity();
    let (local_type, is_root) = match tree.find(position) {
        Some(local) => (local.node_type(), local.is_root()),
        None => return Outcome::Skipped(SkipReason::AnchorNotFound),
    };
    if local_type == replacement.node_type() {
        return locate_mut(tree, position)
            .and_then(|local| modify(local, replacement, MERGE_AUTHOR))
            .into();
    }
    if is_root {
        return replace_in_place(tree, position, replacement, MERGE_AUTHOR).into();
    }
    Outcome::Skipped(SkipReason::Rejected(ChangeError::VariantMismatch {
        expected: local_type,
        found: replacement.node_type(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::apply_changes;
    use crate::diff::diff_trees;
    use crate::identity::Timestamp;
    use crate::parser::parse;
    use pretty_assertions::assert_eq;

    fn range(start: &str, start_row: u32, end: &str, end_row: u32) -> Node {
        Node::range(CellRef::new(start, start_row), CellRef::new(end, end_row))
    }

    /// Apply `local` on a copy of `ancestor`, then merge `foreign`
    fn converge(ancestor: &str, local: &str, foreign: &str) -> (String, MergeResult) {
        let a = parse(ancestor).unwrap();
        let c_local = diff_trees(&a, &parse(local).unwrap()).unwrap();
        let c_foreign = diff_trees(&a, &parse(foreign).unwrap()).unwrap();
        let mut tree = a.clone();
        apply_changes(&mut tree, &c_local, "user_1").unwrap();
        let result = merge_changes(&mut tree, &c_foreign).unwrap();
        (tree.to_formula(), result)
    }

    // ── Range union ────────────────────────────────────────────────────

    #[test]
    fn test_merge_ranges_union() {
        let merged = merge_ranges(&range("A", 1, "A", 9), &range("A", 2, "A", 10)).unwrap();
        assert_eq!(merged.to_string(), "A1:A10");
        let merged = merge_ranges(&range("A", 2, "A", 10), &range("A", 1, "A", 9)).unwrap();
        assert_eq!(merged.to_string(), "A1:A10");
    }

    #[test]
    fn test_merge_ranges_by_column_rank() {
        let merged = merge_ranges(&range("Z", 5, "AA", 6), &range("B", 7, "C", 8)).unwrap();
        assert_eq!(merged.to_string(), "B5:AA8");
    }

    #[test]
    fn test_merge_ranges_idempotent() {
        let r = range("B", 2, "D", 4);
        assert_eq!(merge_ranges(&r, &r).unwrap().to_string(), "B2:D4");
    }

    #[test]
    fn test_merge_ranges_requires_ranges() {
        assert!(merge_ranges(&Node::cell("A", 1), &range("A", 1, "A", 2)).is_none());
    }

    // ── Depth and last-writer-wins ─────────────────────────────────────

    #[test]
    fn test_conflict_depth() {
        let base = IdentityChain::new();
        let local = base.extended_with(crate::identity::NodeId::new());
        let foreign = base.extended_with(crate::identity::NodeId::new());
        assert_eq!(conflict_depth(&base, &foreign), Some(1));
        assert_eq!(conflict_depth(&local, &foreign), Some(0));
        assert_eq!(conflict_depth(&local, &base), Some(-1));
        assert_eq!(conflict_depth(&local, &IdentityChain::new()), None);
    }

    #[test]
    fn test_foreign_wins_by_timestamp() {
        let early = Node::cell("A", 1).with_meta(IdentityChain::new(), "u1", Timestamp::from_micros(10));
        let late = Node::cell("A", 2).with_meta(IdentityChain::new(), "u2", Timestamp::from_micros(20));
        assert!(foreign_wins(&early, &late));
        assert!(!foreign_wins(&late, &early));
    }

    #[test]
    fn test_foreign_wins_tie_break_is_antisymmetric() {
        let ts = Timestamp::from_micros(42);
        let a = Node::cell("A", 1).with_meta(IdentityChain::new(), "u1", ts);
        let b = Node::cell("A", 2).with_meta(IdentityChain::new(), "u2", ts);
        assert_ne!(foreign_wins(&a, &b), foreign_wins(&b, &a));
        // Identical writes never displace each other
        assert!(!foreign_wins(&a, &a.clone()));
    }

    // ── Merge ──────────────────────────────────────────────────────────

    #[test]
    fn test_merge_foreign_only_modification() {
        let (formula, result) = converge("SUM(A1)", "SUM(A1)", "AVERAGE(A1)");
        assert_eq!(formula, "AVERAGE(A1)");
        assert_eq!(result.applied, 1);
        assert!(result.is_clean());
    }

    #[test]
    fn test_merge_same_position_later_wins() {
        // Foreign text is parsed after local text, so it is the later write
        let (formula, result) = converge("A1", "A2", "A3");
        assert_eq!(formula, "A3");
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].winner, Side::Foreign);
    }

    #[test]
    fn test_merge_same_position_local_wins() {
        let a = parse("A1").unwrap();
        let c_foreign = diff_trees(&a, &parse("A3").unwrap()).unwrap();
        let c_local = diff_trees(&a, &parse("A2").unwrap()).unwrap();
        let mut tree = a.clone();
        apply_changes(&mut tree, &c_local, "user_1").unwrap();
        let result = merge_changes(&mut tree, &c_foreign).unwrap();
        assert_eq!(tree.to_formula(), "A2");
        assert_eq!(result.conflicts[0].winner, Side::Local);
        assert!(!result.is_clean());
    }

    #[test]
    fn test_merge_one_sided_range_edit_is_taken_as_is() {
        // Shrinking is not undone by a union with the ancestor range
        let (formula, result) = converge("SUM(A1:B5)", "SUM(A1:B5)", "SUM(A1:A3)");
        assert_eq!(formula, "SUM(A1:A3)");
        assert!(result.is_clean());
    }

    #[test]
    fn test_merge_concurrent_range_edits_are_unioned() {
        let (formula, _) = converge("SUM(A2:A8)", "SUM(A3:A10)", "SUM(A1:A8)");
        assert_eq!(formula, "SUM(A1:A10)");
    }

    #[test]
    fn test_merge_child_addition_and_deletion() {
        let (formula, _) = converge("SUM(A1:A10, B1:B10)", "SUM(A1:A10)", "SUM(A1:A10, B1:B10, C1:C10)");
        assert_eq!(formula, "SUM(A1:A10, C1:C10)");
    }

    #[test]
    fn test_merge_deletion_of_missing_child_is_skipped() {
        let (formula, result) = converge("SUM(A1, B1)", "SUM(A1)", "SUM(A1)");
        assert_eq!(formula, "SUM(A1)");
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].reason, SkipReason::AnchorNotFound);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let a = parse("SUM(A1)").unwrap();
        let changes = diff_trees(&a, &parse("AVERAGE(A1, B1)").unwrap()).unwrap();
        let mut tree = a.clone();
        merge_changes(&mut tree, &changes).unwrap();
        let once = tree.to_formula();
        let again = merge_changes(&mut tree, &changes).unwrap();
        assert_eq!(tree.to_formula(), once);
        assert_eq!(again.applied, 0);
        assert!(again.skipped.iter().any(|s| s.reason == SkipReason::AlreadyApplied));
    }

    #[test]
    fn test_merge_root_addition_and_deletion() {
        let (formula, _) = converge("SUM(A1)", "SUM(A1)", "SUM(A1)*2");
        assert_eq!(formula, "SUM(A1)*2");
        let (formula, _) = converge("SUM(A1)*2", "SUM(A1)*2", "SUM(A1)");
        assert_eq!(formula, "SUM(A1)");
    }

    #[test]
    fn test_merge_nested_wrap_and_unwrap() {
        let (formula, _) = converge("-A1", "-A2", "-SUM(A1)");
        assert_eq!(formula, "-SUM(A2)");
        let (formula, _) = converge("-(A1+B1)", "-(A1+B2)", "-A1");
        assert_eq!(formula, "-A1");
    }

    #[test]
    fn test_merge_nested_unwrap_is_idempotent() {
        let a = parse("-(A1+B1)").unwrap();
        let changes = diff_trees(&a, &parse("-A1").unwrap()).unwrap();
        let mut tree = a.clone();
        merge_changes(&mut tree, &changes).unwrap();
        let again = merge_changes(&mut tree, &changes).unwrap();
        assert_eq!(tree.to_formula(), "-A1");
        assert_eq!(again.applied, 0);
        assert_eq!(again.skipped[0].reason, SkipReason::AlreadyApplied);
    }

    #[test]
    fn test_merge_root_node_modification() {
        let (formula, _) = converge("A1", "A1", "42");
        assert_eq!(formula, "42");
    }

    #[test]
    fn test_merged_nodes_carry_merge_author() {
        let a = parse("SUM(A1)").unwrap();
        let changes = diff_trees(&a, &parse("MAX(A1)").unwrap()).unwrap();
        let mut tree = a.clone();
        merge_changes(&mut tree, &changes).unwrap();
        assert_eq!(tree.root().author(), MERGE_AUTHOR);
    }

    #[test]
    fn test_merge_structural_change_is_unhandled() {
        let a = parse("SUM(A1:A10)").unwrap();
        let changes = diff_trees(&a, &parse("A1+A2+A3").unwrap()).unwrap();
        let mut tree = a.clone();
        let err = merge_changes(&mut tree, &changes).unwrap_err();
        assert_eq!(err, ChangeError::UnhandledChange { kind: "StructuralChange" });
        assert_eq!(tree.to_formula(), "SUM(A1:A10)");
    }
}
