//! Change application engine
//!
//! Applies a change-set to a tree in list order. Every node a change touches
//! has its identity chain extended, which is how the merge engine later
//! recognizes that a position was already rewritten locally.
//!
//! Application is all-or-nothing: the tree is only replaced once every
//! change has applied.

use crate::ast::{FormulaTree, Node, NodeKind};
use crate::diff::{Change, Direction};
use crate::error::ChangeError;
use crate::identity::IdentityChain;

/// Apply `changes` to `tree` on behalf of `author`.
///
/// Fails on the first change that cannot be applied; `tree` is then left as
/// it was.
pub fn apply_changes(tree: &mut FormulaTree, changes: &[Change], author: &str) -> Result<(), ChangeError> {
    let mut work = tree.clone();
    for change in changes {
        apply_change(&mut work, change, author)?;
        tracing::debug!(
            kind = change.kind_name(),
            position = %change.anchor().identity(),
            author,
            "change applied"
        );
    }
    *tree = work;
    Ok(())
}

fn apply_change(tree: &mut FormulaTree, change: &Change, author: &str) -> Result<(), ChangeError> {
    match change {
        Change::NodeModification {
            original,
            replacement,
        } => {
            let node = locate_mut(tree, original.identity())?;
            modify(node, replacement, author)
        }
        Change::ChildAddition {
            parent,
            child,
            index,
        } => {
            let node = locate_mut(tree, parent.identity())?;
            add_child(node, child.clone(), *index, author)
        }
        Change::ChildDeletion { parent, child } => {
            let node = locate_mut(tree, parent.identity())?;
            remove_child(node, child.identity()).map(drop)
        }
        Change::RootAddition {
            new_root,
            child,
            direction,
        } => wrap_subtree(tree, child.identity(), new_root, *direction, author),
        Change::RootDeletion { child, .. } => {
            promote_subtree(tree, child)?;
            Ok(())
        }
        Change::RootNodeModification {
            original,
            replacement,
        } => {
            if !tree.root().identity().shares_prefix_with(original.identity()) {
                return Err(ChangeError::NodeNotFound {
                    identity: original.identity().clone(),
                });
            }
            replace_in_place(tree, original.identity(), replacement, author)
        }
        Change::StructuralChange {
            original,
            replacement,
        } => Err(ChangeError::UnsupportedStructuralChange {
            original: original.to_string(),
            replacement: replacement.to_string(),
        }),
    }
}

pub(crate) fn locate_mut<'t>(tree: &'t mut FormulaTree, chain: &IdentityChain) -> Result<&'t mut Node, ChangeError> {
    tree.find_mut(chain).ok_or_else(|| ChangeError::NodeNotFound {
        identity: chain.clone(),
    })
}

/// Copy `replacement`'s own content onto `node` and record the write
pub(crate) fn modify(node: &mut Node, replacement: &Node, author: &str) -> Result<(), ChangeError> {
    node.assign_content(replacement)?;
    node.advance_to(replacement, author);
    Ok(())
}

/// Swap the node at `chain` for a copy of `replacement`, keeping its place
pub(crate) fn replace_in_place(
    tree: &mut FormulaTree,
    chain: &IdentityChain,
    replacement: &Node,
    author: &str,
) -> Result<(), ChangeError> {
    let slot = locate_mut(tree, chain)?;
    let parent = slot.parent();
    let mut node = replacement.clone();
    node.advance_to(replacement, author);
    node.set_parent(parent);
    *slot = node;
    Ok(())
}

/// Append to a function's arguments (at `index` when in range) or fill the
/// first empty slot of a binary node.
pub(crate) fn add_child(parent: &mut Node, mut child: Node, index: usize, author: &str) -> Result<(), ChangeError> {
    let parent_type = parent.node_type();
    child.refresh(author);
    match parent.kind_mut() {
        NodeKind::Function { arguments, .. } => {
            let at = index.min(arguments.len());
            arguments.insert(at, child);
        }
        NodeKind::Binary { left, right, .. } => {
            let slot = if left.is_none() {
                left
            } else if right.is_none() {
                right
            } else {
                return Err(ChangeError::InvalidArity {
                    parent: parent_type,
                    reason: String::from("both operands are already present"),
                });
            };
            *slot = Some(Box::new(child));
        }
        _ => {
            return Err(ChangeError::InvalidArity {
                parent: parent_type,
                reason: String::from("node does not accept added children"),
            })
        }
    }
    parent.adopt_children();
    Ok(())
}

/// Detach the direct child of `parent` at position `chain`
pub(crate) fn remove_child(parent: &mut Node, chain: &IdentityChain) -> Result<Node, ChangeError> {
    let parent_type = parent.node_type();
    let not_found = || ChangeError::NodeNotFound {
        identity: chain.clone(),
    };
    let mut removed = match parent.kind_mut() {
        NodeKind::Function { arguments, .. } => {
            let i = arguments
                .iter()
                .position(|a| a.identity().shares_prefix_with(chain))
                .ok_or_else(not_found)?;
            arguments.remove(i)
        }
        NodeKind::Binary { left, right, .. } => {
            let matches = |slot: &Option<Box<Node>>| {
                slot.as_ref()
                    .is_some_and(|n| n.identity().shares_prefix_with(chain))
            };
            let slot = if matches(&*left) {
                left
            } else if matches(&*right) {
                right
            } else {
                return Err(not_found());
            };
            *slot.take().ok_or_else(not_found)?
        }
        _ => {
            return Err(ChangeError::InvalidArity {
                parent: parent_type,
                reason: String::from("node has no removable children"),
            })
        }
    };
    removed.set_parent(None);
    Ok(removed)
}

/// Put `child` into the `direction` slot of `wrapper`
fn attach(wrapper: &mut Node, child: Node, direction: Direction) -> Result<(), ChangeError> {
    let wrapper_type = wrapper.node_type();
    let invalid = || ChangeError::InvalidDirection {
        direction: direction.to_string(),
        parent: wrapper_type,
    };
    match (wrapper.kind_mut(), direction) {
        (NodeKind::Binary { left, .. }, Direction::Left) => *left = Some(Box::new(child)),
        (NodeKind::Binary { right, .. }, Direction::Right) => *right = Some(Box::new(child)),
        (NodeKind::Unary { operand, .. }, Direction::Operand) => *operand = Box::new(child),
        (NodeKind::Function { arguments, .. }, Direction::Argument(i)) => {
            let slot = arguments.get_mut(i).ok_or_else(invalid)?;
            *slot = child;
        }
        _ => return Err(invalid()),
    }
    wrapper.adopt_children();
    Ok(())
}

/// Wrap the subtree at `chain` in a copy of `new_root`.
///
/// When the subtree is the tree's root, the wrapper becomes the new root.
pub(crate) fn wrap_subtree(
    tree: &mut FormulaTree,
    chain: &IdentityChain,
    new_root: &Node,
    direction: Direction,
    author: &str,
) -> Result<(), ChangeError> {
    let slot = locate_mut(tree, chain)?;
    let parent = slot.parent();
    let mut wrapper = new_root.clone();
    attach(&mut wrapper, slot.clone(), direction)?;
    wrapper.refresh(author);
    wrapper.set_parent(parent);
    *slot = wrapper;
    Ok(())
}

/// Replace the wrapper recorded as `kept`'s parent with the local subtree at
/// `kept`'s position.
///
/// Returns false when that wrapper no longer encloses the subtree locally.
pub(crate) fn promote_subtree(tree: &mut FormulaTree, kept: &Node) -> Result<bool, ChangeError> {
    let Some(parent_origin) = kept.parent() else {
        return Ok(false);
    };
    let local = locate_mut(tree, kept.identity())?;
    if local.parent() != Some(parent_origin) {
        return Ok(false);
    }
    let mut promoted = local.clone();
    let slot = locate_mut(tree, &IdentityChain::starting_at(parent_origin))?;
    promoted.set_parent(slot.parent());
    *slot = promoted;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::diff_trees;
    use crate::parser::parse;
    use pretty_assertions::assert_eq;

    fn apply_text(ancestor: &str, modified: &str) -> FormulaTree {
        let mut tree = parse(ancestor).unwrap();
        let target = parse(modified).unwrap();
        let changes = diff_trees(&tree, &target).unwrap();
        apply_changes(&mut tree, &changes, "user_1").unwrap();
        tree
    }

    #[test]
    fn test_apply_after_diff_reproduces_target() {
        let cases = [
            ("SUM(A1)", "AVERAGE(A1)"),
            ("SUM(A1)", "SUM(A1, B1)"),
            ("SUM(A1, B1)", "SUM(A1)"),
            ("SUM(A1)", "SUM(A1:B1)"),
            ("SUM(A1, B1)", "SUM(A1:A2, B1)"),
            ("A1+B1", "A1*B2"),
            ("A1+B1", "A1+SUM(B1)"),
            ("-A1", "+A2"),
            ("A1", "42"),
            ("SUM(A1)", "SUM(A2)+B1"),
            ("A1", "2*A1"),
            ("A1", "-A1"),
            ("A1", "ROUND(2, A1)"),
            ("SUM(A1)+B1", "SUM(A1)"),
            ("-A1", "A1"),
            ("ABS(A1)", "A1"),
            ("TRUE", "FALSE"),
        ];
        for (ancestor, modified) in cases {
            assert_eq!(
                apply_text(ancestor, modified).to_formula(),
                parse(modified).unwrap().to_formula(),
                "{ancestor} -> {modified}"
            );
        }
    }

    #[test]
    fn test_modification_extends_chain_and_stamps_author() {
        let tree = apply_text("SUM(A1)", "AVERAGE(A1)");
        let root = tree.root();
        assert_eq!(root.identity().len(), 2);
        assert_eq!(root.author(), "user_1");
        // Untouched argument keeps its single identifier
        assert_eq!(root.children()[0].identity().len(), 1);
    }

    #[test]
    fn test_added_child_is_refreshed_and_adopted() {
        let tree = apply_text("SUM(A1)", "SUM(A1, B1)");
        let added = tree.root().children()[1];
        assert_eq!(added.identity().len(), 2);
        assert_eq!(added.author(), "user_1");
        assert_eq!(added.parent(), Some(tree.root().identity().origin()));
    }

    #[test]
    fn test_root_addition_keeps_existing_root_identity() {
        let ancestor = parse("A1").unwrap();
        let origin = ancestor.root().identity().origin();
        let mut tree = ancestor.clone();
        let changes = diff_trees(&ancestor, &parse("A1*2").unwrap()).unwrap();
        apply_changes(&mut tree, &changes, "user_1").unwrap();
        let left = tree.root().children()[0];
        assert_eq!(left.identity().origin(), origin);
        assert!(!left.is_root());
        assert!(tree.root().is_root());
    }

    #[test]
    fn test_missing_node_aborts_whole_apply() {
        let mut tree = parse("SUM(A1)").unwrap();
        let other = parse("AVERAGE(B1)").unwrap();
        let changes = diff_trees(&other, &parse("MAX(B1)").unwrap()).unwrap();
        let err = apply_changes(&mut tree, &changes, "user_1").unwrap_err();
        assert!(matches!(err, ChangeError::NodeNotFound { .. }));
        assert_eq!(tree.to_formula(), "SUM(A1)");
    }

    #[test]
    fn test_structural_change_is_rejected() {
        let mut tree = parse("SUM(A1:A10)").unwrap();
        let changes = diff_trees(&tree, &parse("A1+A2+A3").unwrap()).unwrap();
        let err = apply_changes(&mut tree, &changes, "user_1").unwrap_err();
        assert!(matches!(err, ChangeError::UnsupportedStructuralChange { .. }));
        assert_eq!(tree.to_formula(), "SUM(A1:A10)");
    }

    #[test]
    fn test_binary_rejects_third_operand() {
        let mut node = parse("A1+B1").unwrap().into_root();
        let err = add_child(&mut node, Node::cell("C", 1), 0, "user_1").unwrap_err();
        assert!(matches!(err, ChangeError::InvalidArity { .. }));
    }

    #[test]
    fn test_binary_fills_first_empty_slot() {
        let mut node = parse("A1+B1").unwrap().into_root();
        let left = node.children()[0].identity().clone();
        remove_child(&mut node, &left).unwrap();
        assert_eq!(node.children().len(), 1);
        add_child(&mut node, Node::cell("C", 1), 1, "user_1").unwrap();
        assert_eq!(node.to_string(), "C1+B1");
    }

    #[test]
    fn test_scalar_rejects_child() {
        let mut node = Node::cell("A", 1);
        let err = add_child(&mut node, Node::number(1.0), 0, "user_1").unwrap_err();
        assert!(matches!(err, ChangeError::InvalidArity { .. }));
    }

    #[test]
    fn test_invalid_direction() {
        let mut wrapper = parse("ROUND(A1, 2)").unwrap().into_root();
        let err = attach(&mut wrapper, Node::cell("B", 1), Direction::Left).unwrap_err();
        assert!(matches!(err, ChangeError::InvalidDirection { .. }));
        let err = attach(&mut wrapper, Node::cell("B", 1), Direction::Argument(5)).unwrap_err();
        assert!(matches!(err, ChangeError::InvalidDirection { .. }));
    }

    #[test]
    fn test_promote_root_is_noop() {
        let mut tree = parse("A1").unwrap();
        let root = tree.root().clone();
        assert!(!promote_subtree(&mut tree, &root).unwrap());
        assert_eq!(tree.to_formula(), "A1");
    }

    #[test]
    fn test_nested_wrap_and_unwrap_under_unary() {
        let cases = [
            ("-A1", "-SUM(A1)"),
            ("-A1", "-(A1+B1)"),
            ("-A1", "-(2*A1)"),
            ("-(A1+B1)", "-A1"),
            ("-(A1+B1)", "-B1"),
            ("-ABS(A1)", "-A1"),
            ("-ABS(SUM(A1))", "-SUM(A2)"),
            ("+-A1", "+-ROUND(A1, 2)"),
        ];
        for (ancestor, modified) in cases {
            assert_eq!(
                apply_text(ancestor, modified).to_formula(),
                parse(modified).unwrap().to_formula(),
                "{ancestor} -> {modified}"
            );
        }
    }

    #[test]
    fn test_nested_wrapper_is_adopted_by_unary() {
        let tree = apply_text("-A1", "-SUM(A1)");
        let wrapper = tree.root().children()[0];
        assert_eq!(wrapper.parent(), Some(tree.root().identity().origin()));
        assert_eq!(wrapper.children()[0].parent(), Some(wrapper.identity().origin()));
    }

    #[test]
    fn test_nested_unwrap_applied_twice_keeps_outer_node() {
        let ancestor = parse("-(A1+B1)").unwrap();
        let changes = diff_trees(&ancestor, &parse("-A1").unwrap()).unwrap();
        let mut tree = ancestor.clone();
        apply_changes(&mut tree, &changes, "user_1").unwrap();
        apply_changes(&mut tree, &changes, "user_1").unwrap();
        assert_eq!(tree.to_formula(), "-A1");
    }

    #[test]
    fn test_modification_variant_mismatch() {
        let mut node = Node::cell("A", 1);
        let err = modify(&mut node, &Node::name("RATE"), "user_1").unwrap_err();
        assert!(matches!(err, ChangeError::VariantMismatch { .. }));
    }
}
