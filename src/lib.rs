//! formula-crdt: Collaborative Spreadsheet Formulas
//!
//! Don't diff formula text, diff the expression tree.
//!
//! Conflict-free merging of concurrently edited spreadsheet formulas:
//! - Excel-style formula parser with canonical re-printing
//! - Node-level diff against a shared ancestor (modifications, argument
//!   additions/deletions, root wrapping/unwrapping)
//! - Persistent node identity through append-only identity chains
//! - CRDT merge with last-writer-wins per position and semantic union of
//!   cell ranges
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`identity`] | Node identifiers, identity chains, monotonic commit timestamps |
//! | [`ast`] | Formula node model, shallow content equality, canonical printer |
//! | [`parser`] | Tokenizer and precedence-folding formula parser |
//! | [`diff`] | `Change` values and the tree differencer |
//! | [`apply`] | Ordered, all-or-nothing change application |
//! | [`merge`] | CRDT merge of a foreign change-set with a merge report |
//! | [`replica`] | A collaborator's working copy with a revision log |
//! | [`error`] | Parse and change errors |
//!
//! # Feature flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `serde` | `Serialize`/`Deserialize` for trees and change-sets |
//!
//! # Quick Start
//!
//! ```
//! use formula_crdt::{apply_changes, diff_trees, merge_changes, parse};
//!
//! let ancestor = parse("SUM(A2:A8)").unwrap();
//!
//! // Two collaborators edit the same range concurrently
//! let local = diff_trees(&ancestor, &parse("SUM(A3:A10)").unwrap()).unwrap();
//! let foreign = diff_trees(&ancestor, &parse("SUM(A1:A8)").unwrap()).unwrap();
//!
//! let mut tree = ancestor.clone();
//! apply_changes(&mut tree, &local, "alice").unwrap();
//! merge_changes(&mut tree, &foreign).unwrap();
//!
//! // Ranges are unioned instead of overwritten
//! assert_eq!(tree.to_formula(), "SUM(A1:A10)");
//! ```

pub mod apply;
pub mod ast;
pub mod diff;
pub mod error;
pub mod identity;
pub mod merge;
pub mod parser;
pub mod replica;

pub use apply::apply_changes;
pub use ast::{BinaryOp, CellRef, FormulaTree, Node, NodeKind, NodeType, UnaryOp, DEFAULT_AUTHOR};
pub use diff::{diff_trees, Change, ChangeSet, Direction};
pub use error::{ChangeError, EmptyIdentityChain, Error, FormulaParseError};
pub use identity::{IdentityChain, NodeId, Timestamp};
pub use merge::{merge_changes, Conflict, MergeResult, Side, SkipReason, Skipped, MERGE_AUTHOR};
pub use parser::parse;
pub use replica::{Replica, Revision, RevisionKind};
