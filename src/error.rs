//! Error types
//!
//! Parse failures, change-application failures, and an umbrella error for
//! the collaborator-facing [`Replica`](crate::Replica) API.

use thiserror::Error;

use crate::ast::NodeType;
use crate::identity::IdentityChain;

pub type ParseResult<T> = Result<T, FormulaParseError>;

/// Malformed formula text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormulaParseError {
    #[error("Expression cannot be empty")]
    Empty,

    #[error("Unexpected end-of-formula {context}")]
    UnexpectedEnd { context: String },

    #[error("Unsupported character '{ch}' at {pos}")]
    UnsupportedCharacter { ch: char, pos: usize },

    #[error("Absolute and relative reference markers ($) are not supported (at {pos})")]
    AbsoluteReference { pos: usize },

    #[error("Unknown operator {operator}")]
    UnknownOperator { operator: String },

    #[error("Expected a number, a boolean, a cell, a range, or a function call, found {found}")]
    ExpectedOperand { found: String },

    #[error("Expected cell after colon, found {found}")]
    ExpectedCellAfterColon { found: String },

    #[error("Expected closed parenthesis or comma after argument of function {function}, found {found}")]
    ExpectedArgumentSeparator { function: String, found: String },

    #[error("Closed parenthesis expected")]
    UnmatchedParenthesis,

    #[error("Multiple formulas provided (trailing {found})")]
    MultipleFormulas { found: String },
}

/// A change could not be computed, applied or merged
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChangeError {
    #[error("Node not found for identity {identity}")]
    NodeNotFound { identity: IdentityChain },

    #[error("Unsupported structural change from {original} to {replacement}")]
    UnsupportedStructuralChange { original: String, replacement: String },

    #[error("Irreducible structural change: no operand of {original} matches {replacement}")]
    IrreducibleStructuralChange { original: String, replacement: String },

    #[error("Invalid arity for {parent}: {reason}")]
    InvalidArity { parent: NodeType, reason: String },

    #[error("Invalid direction {direction} for root addition under {parent}")]
    InvalidDirection { direction: String, parent: NodeType },

    #[error("Cannot modify a {expected} node with {found} content")]
    VariantMismatch { expected: NodeType, found: NodeType },

    #[error("Unhandled change type {kind}")]
    UnhandledChange { kind: &'static str },
}

/// An identity chain must hold at least one identifier
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Identity chain cannot be empty")]
pub struct EmptyIdentityChain;

/// Errors surfaced by the [`Replica`](crate::Replica) API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] FormulaParseError),

    #[error(transparent)]
    Change(#[from] ChangeError),
}
