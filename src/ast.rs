//! Formula expression tree
//!
//! Tagged node variants for the Excel-like formula language. Each node owns
//! its children and carries an identity chain, the author of its last write
//! and the commit timestamp of that write. Children keep a non-owning
//! back-reference (the parent's origin identifier) used only for root
//! detection.

use std::fmt;

use crate::error::ChangeError;
use crate::identity::{IdentityChain, NodeId, Timestamp};

/// Author stamped on nodes built by the parser
pub const DEFAULT_AUTHOR: &str = "default_user";

/// Highest Excel column (`XFD`)
pub const MAX_COLUMN: u32 = 16_384;

/// Highest Excel row
pub const MAX_ROW: u32 = 1_048_576;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Alphabetic rank of a column name: `A` → 1, `Z` → 26, `AA` → 27
pub fn column_number(letters: &str) -> u32 {
    letters.bytes().fold(0u32, |acc, b| {
        acc.saturating_mul(26)
            .saturating_add(u32::from(b.to_ascii_uppercase().wrapping_sub(b'A')) + 1)
    })
}

/// Cell reference such as `B12`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CellRef {
    /// Upper-case column letters
    pub col: String,
    /// One-based row
    pub row: u32,
}

impl CellRef {
    pub fn new(col: &str, row: u32) -> Self {
        Self {
            col: col.to_ascii_uppercase(),
            row,
        }
    }

    pub fn column_number(&self) -> u32 {
        column_number(&self.col)
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.col, self.row)
    }
}

/// Infix operators, from tightest to loosest binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BinaryOp {
    Percent,
    Power,
    Multiply,
    Divide,
    Add,
    Subtract,
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Percent => "%",
            BinaryOp::Power => "^",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Equal => "=",
            BinaryOp::NotEqual => "<>",
            BinaryOp::Less => "<",
            BinaryOp::Greater => ">",
            BinaryOp::LessEqual => "<=",
            BinaryOp::GreaterEqual => ">=",
        }
    }

    /// Folding level; lower levels are folded into `Binary` nodes first
    pub fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Percent => 0,
            BinaryOp::Power => 1,
            BinaryOp::Multiply | BinaryOp::Divide => 2,
            BinaryOp::Add | BinaryOp::Subtract => 3,
            BinaryOp::Equal
            | BinaryOp::NotEqual
            | BinaryOp::Less
            | BinaryOp::Greater
            | BinaryOp::LessEqual
            | BinaryOp::GreaterEqual => 4,
        }
    }
}

/// Prefix sign operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UnaryOp {
    Plus,
    Minus,
}

impl UnaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Plus => "+",
            UnaryOp::Minus => "-",
        }
    }
}

/// Variant tag of a node, without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum NodeType {
    Cell = 0,
    CellRange = 1,
    Name = 2,
    Number = 3,
    Logical = 4,
    Function = 5,
    Binary = 6,
    Unary = 7,
}

impl NodeType {
    /// Function, Binary and Unary own child nodes
    pub fn is_composite(&self) -> bool {
        matches!(self, NodeType::Function | NodeType::Binary | NodeType::Unary)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Cell => "Cell",
            NodeType::CellRange => "CellRange",
            NodeType::Name => "Name",
            NodeType::Number => "Number",
            NodeType::Logical => "Logical",
            NodeType::Function => "Function",
            NodeType::Binary => "Binary",
            NodeType::Unary => "Unary",
        };
        f.write_str(name)
    }
}

/// Node payload
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NodeKind {
    Cell(CellRef),
    CellRange { start: CellRef, end: CellRef },
    Name(String),
    Number(f64),
    Logical(bool),
    Function { name: String, arguments: Vec<Node> },
    /// Both slots exist; a slot is `None` only between a deletion and the
    /// addition that refills it
    Binary {
        left: Option<Box<Node>>,
        op: BinaryOp,
        right: Option<Box<Node>>,
    },
    Unary { op: UnaryOp, operand: Box<Node> },
}

/// Expression tree node
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Node {
    identity: IdentityChain,
    author: String,
    committed_at: Timestamp,
    /// Origin identifier of the enclosing node, `None` at the root
    parent: Option<NodeId>,
    kind: NodeKind,
}

impl Node {
    /// Fresh node: single-identifier chain, default author, current time
    pub fn new(kind: NodeKind) -> Self {
        let mut node = Self {
            identity: IdentityChain::new(),
            author: String::from(DEFAULT_AUTHOR),
            committed_at: Timestamp::now(),
            parent: None,
            kind,
        };
        node.adopt_children();
        node
    }

    pub fn cell(col: &str, row: u32) -> Self {
        Self::new(NodeKind::Cell(CellRef::new(col, row)))
    }

    pub fn range(start: CellRef, end: CellRef) -> Self {
        Self::new(NodeKind::CellRange { start, end })
    }

    pub fn name(identifier: &str) -> Self {
        Self::new(NodeKind::Name(identifier.to_ascii_uppercase()))
    }

    pub fn number(value: f64) -> Self {
        Self::new(NodeKind::Number(value))
    }

    pub fn logical(value: bool) -> Self {
        Self::new(NodeKind::Logical(value))
    }

    pub fn function(name: &str, arguments: Vec<Node>) -> Self {
        Self::new(NodeKind::Function {
            name: name.to_ascii_uppercase(),
            arguments,
        })
    }

    pub fn binary(left: Node, op: BinaryOp, right: Node) -> Self {
        Self::new(NodeKind::Binary {
            left: Some(Box::new(left)),
            op,
            right: Some(Box::new(right)),
        })
    }

    pub fn unary(op: UnaryOp, operand: Node) -> Self {
        Self::new(NodeKind::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    /// Rebuild a node with explicit metadata
    pub fn with_meta(mut self, identity: IdentityChain, author: &str, committed_at: Timestamp) -> Self {
        self.identity = identity;
        self.author = String::from(author);
        self.committed_at = committed_at;
        self.adopt_children();
        self
    }

    pub fn identity(&self) -> &IdentityChain {
        &self.identity
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn committed_at(&self) -> Timestamp {
        self.committed_at
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::Cell(_) => NodeType::Cell,
            NodeKind::CellRange { .. } => NodeType::CellRange,
            NodeKind::Name(_) => NodeType::Name,
            NodeKind::Number(_) => NodeType::Number,
            NodeKind::Logical(_) => NodeType::Logical,
            NodeKind::Function { .. } => NodeType::Function,
            NodeKind::Binary { .. } => NodeType::Binary,
            NodeKind::Unary { .. } => NodeType::Unary,
        }
    }

    pub fn is_composite(&self) -> bool {
        self.node_type().is_composite()
    }

    /// True iff no parent back-reference is set
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Record a new write: append a fresh identifier, stamp author and time
    pub fn refresh(&mut self, author: &str) {
        self.identity.push(NodeId::new());
        self.author = String::from(author);
        self.committed_at = Timestamp::now();
    }

    /// Record the write described by `stamp` (a replacement produced by the
    /// differencer): adopt its latest identifier and commit time.
    ///
    /// The commit time never moves backwards.
    pub(crate) fn advance_to(&mut self, stamp: &Node, author: &str) {
        let latest = stamp.identity.latest();
        if self.identity.latest() != latest {
            self.identity.push(latest);
        }
        self.author = String::from(author);
        self.committed_at = self.committed_at.max(stamp.committed_at);
    }

    /// Stamp `author` on this node and every descendant
    pub(crate) fn assign_author(&mut self, author: &str) {
        self.author = String::from(author);
        match &mut self.kind {
            NodeKind::Function { arguments, .. } => {
                for arg in arguments {
                    arg.assign_author(author);
                }
            }
            NodeKind::Binary { left, right, .. } => {
                for child in [left, right].into_iter().flatten() {
                    child.assign_author(author);
                }
            }
            NodeKind::Unary { operand, .. } => operand.assign_author(author),
            _ => {}
        }
    }

    /// Shallow, type-specific comparison of this node's own fields.
    ///
    /// Never looks at children: two `Binary` nodes with the same operator are
    /// content-equal whatever their operands are.
    pub fn content_eq(&self, other: &Node) -> bool {
        match (&self.kind, &other.kind) {
            (NodeKind::Cell(a), NodeKind::Cell(b)) => a == b,
            (
                NodeKind::CellRange { start: s1, end: e1 },
                NodeKind::CellRange { start: s2, end: e2 },
            ) => s1 == s2 && e1 == e2,
            (NodeKind::Name(a), NodeKind::Name(b)) => a == b,
            (NodeKind::Number(a), NodeKind::Number(b)) => a == b,
            (NodeKind::Logical(a), NodeKind::Logical(b)) => a == b,
            (NodeKind::Function { name: a, .. }, NodeKind::Function { name: b, .. }) => a == b,
            (NodeKind::Binary { op: a, .. }, NodeKind::Binary { op: b, .. }) => a == b,
            (NodeKind::Unary { op: a, .. }, NodeKind::Unary { op: b, .. }) => a == b,
            _ => false,
        }
    }

    /// Single-level match used to classify root wrapping and unwrapping
    pub fn shallow_matches(&self, other: &Node) -> bool {
        self.node_type() == other.node_type() && self.content_eq(other)
    }

    /// Serialized own content, e.g. `Func[SUM]` or `Range[A1][B2]`
    pub fn label(&self) -> String {
        match &self.kind {
            NodeKind::Cell(cell) => format!("Cell[{cell}]"),
            NodeKind::CellRange { start, end } => format!("Range[{start}][{end}]"),
            NodeKind::Name(name) => format!("Name[{name}]"),
            NodeKind::Number(value) => format!("Num[{value}]"),
            NodeKind::Logical(value) => format!("Bool[{value}]"),
            NodeKind::Function { name, .. } => format!("Func[{name}]"),
            NodeKind::Binary { op, .. } => format!("Binary[{}]", op.symbol()),
            NodeKind::Unary { op, .. } => format!("Unary[{}]", op.symbol()),
        }
    }

    /// Stable FNV-1a hash over (content, author); breaks exact timestamp ties
    pub fn tie_break(&self) -> u64 {
        let mut h = FNV_OFFSET;
        for &b in self.label().as_bytes() {
            h ^= u64::from(b);
            h = h.wrapping_mul(FNV_PRIME);
        }
        h ^= 0xff;
        h = h.wrapping_mul(FNV_PRIME);
        for &b in self.author.as_bytes() {
            h ^= u64::from(b);
            h = h.wrapping_mul(FNV_PRIME);
        }
        h
    }

    /// Direct children in print order
    pub fn children(&self) -> Vec<&Node> {
        match &self.kind {
            NodeKind::Function { arguments, .. } => arguments.iter().collect(),
            NodeKind::Binary { left, right, .. } => {
                left.iter().chain(right.iter()).map(|b| &**b).collect()
            }
            NodeKind::Unary { operand, .. } => vec![&**operand],
            _ => Vec::new(),
        }
    }

    /// Nodes in this subtree, including `self`
    pub fn node_count(&self) -> usize {
        1 + self.children().iter().map(|c| c.node_count()).sum::<usize>()
    }

    /// Pre-order search for the first node sharing a prefix with `chain`
    pub fn find(&self, chain: &IdentityChain) -> Option<&Node> {
        if self.identity.shares_prefix_with(chain) {
            return Some(self);
        }
        self.children().into_iter().find_map(|c| c.find(chain))
    }

    pub(crate) fn find_mut(&mut self, chain: &IdentityChain) -> Option<&mut Node> {
        if self.identity.shares_prefix_with(chain) {
            return Some(self);
        }
        match &mut self.kind {
            NodeKind::Function { arguments, .. } => {
                arguments.iter_mut().find_map(|a| a.find_mut(chain))
            }
            NodeKind::Binary { left, right, .. } => left
                .as_deref_mut()
                .and_then(|n| n.find_mut(chain))
                .or_else(|| right.as_deref_mut().and_then(|n| n.find_mut(chain))),
            NodeKind::Unary { operand, .. } => operand.find_mut(chain),
            _ => None,
        }
    }

    pub(crate) fn kind_mut(&mut self) -> &mut NodeKind {
        &mut self.kind
    }

    pub(crate) fn set_parent(&mut self, parent: Option<NodeId>) {
        self.parent = parent;
    }

    /// Point every direct child's back-reference at this node
    pub(crate) fn adopt_children(&mut self) {
        let origin = self.identity.origin();
        match &mut self.kind {
            NodeKind::Function { arguments, .. } => {
                for arg in arguments {
                    arg.parent = Some(origin);
                }
            }
            NodeKind::Binary { left, right, .. } => {
                for slot in [left, right] {
                    if let Some(child) = slot {
                        child.parent = Some(origin);
                    }
                }
            }
            NodeKind::Unary { operand, .. } => operand.parent = Some(origin),
            _ => {}
        }
    }

    /// Copy the type-appropriate own fields of `from` onto this node.
    ///
    /// Children are left untouched.
    pub(crate) fn assign_content(&mut self, from: &Node) -> Result<(), ChangeError> {
        match (&mut self.kind, &from.kind) {
            (NodeKind::Cell(dst), NodeKind::Cell(src)) => *dst = src.clone(),
            (
                NodeKind::CellRange { start, end },
                NodeKind::CellRange {
                    start: new_start,
                    end: new_end,
                },
            ) => {
                *start = new_start.clone();
                *end = new_end.clone();
            }
            (NodeKind::Name(dst), NodeKind::Name(src)) => *dst = src.clone(),
            (NodeKind::Number(dst), NodeKind::Number(src)) => *dst = *src,
            (NodeKind::Logical(dst), NodeKind::Logical(src)) => *dst = *src,
            (NodeKind::Function { name, .. }, NodeKind::Function { name: src, .. }) => {
                *name = src.clone()
            }
            (NodeKind::Binary { op, .. }, NodeKind::Binary { op: src, .. }) => *op = *src,
            (NodeKind::Unary { op, .. }, NodeKind::Unary { op: src, .. }) => *op = *src,
            _ => {
                return Err(ChangeError::VariantMismatch {
                    expected: self.node_type(),
                    found: from.node_type(),
                })
            }
        }
        Ok(())
    }

    fn write_formula(&self, f: &mut fmt::Formatter<'_>, top_level: bool) -> fmt::Result {
        match &self.kind {
            NodeKind::Cell(cell) => write!(f, "{cell}"),
            NodeKind::CellRange { start, end } => write!(f, "{start}:{end}"),
            NodeKind::Name(name) => f.write_str(name),
            NodeKind::Number(value) => write!(f, "{value}"),
            NodeKind::Logical(value) => f.write_str(if *value { "TRUE" } else { "FALSE" }),
            NodeKind::Function { name, arguments } => {
                write!(f, "{name}(")?;
                for (i, arg) in arguments.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    arg.write_formula(f, false)?;
                }
                f.write_str(")")
            }
            NodeKind::Binary { left, op, right } => {
                if !top_level {
                    f.write_str("(")?;
                }
                if let Some(left) = left {
                    left.write_formula(f, false)?;
                }
                f.write_str(op.symbol())?;
                if let Some(right) = right {
                    right.write_formula(f, false)?;
                }
                if !top_level {
                    f.write_str(")")?;
                }
                Ok(())
            }
            NodeKind::Unary { op, operand } => {
                f.write_str(op.symbol())?;
                operand.write_formula(f, false)
            }
        }
    }
}

/// Canonical formula text, printed as if this node were the tree root
impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_formula(f, true)
    }
}

/// One collaborator's formula: an exclusively owned root node
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FormulaTree {
    root: Node,
}

impl FormulaTree {
    pub fn new(mut root: Node) -> Self {
        root.set_parent(None);
        Self { root }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub(crate) fn root_mut(&mut self) -> &mut Node {
        &mut self.root
    }

    pub fn into_root(self) -> Node {
        self.root
    }

    /// Node at the same logical position as `chain`
    pub fn find(&self, chain: &IdentityChain) -> Option<&Node> {
        self.root.find(chain)
    }

    pub(crate) fn find_mut(&mut self, chain: &IdentityChain) -> Option<&mut Node> {
        self.root.find_mut(chain)
    }

    pub fn node_count(&self) -> usize {
        self.root.node_count()
    }

    /// Canonical formula text
    pub fn to_formula(&self) -> String {
        self.root.to_string()
    }
}

impl fmt::Display for FormulaTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.write_formula(f, true)
    }
}
