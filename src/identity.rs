//! Node identity and commit time
//!
//! Every tree position owns an append-only chain of identifiers. Two nodes
//! occupy the same logical position when their chains share a non-empty
//! common prefix, which tolerates any number of rewrites on either side.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::error::EmptyIdentityChain;

/// Globally unique identifier minted for each write to a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for NodeId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 hex digits are plenty for logs and error messages
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// Append-only identity chain of a tree position
///
/// Never empty: a chain is created with one identifier and only grows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "SmallVec<[NodeId; 4]>"))]
pub struct IdentityChain(SmallVec<[NodeId; 4]>);

impl IdentityChain {
    /// New chain holding a single fresh identifier
    pub fn new() -> Self {
        Self::starting_at(NodeId::new())
    }

    pub fn starting_at(id: NodeId) -> Self {
        let mut ids = SmallVec::new();
        ids.push(id);
        Self(ids)
    }

    /// Build a chain from explicit identifiers; `None` if `ids` is empty
    pub fn from_ids(ids: impl IntoIterator<Item = NodeId>) -> Option<Self> {
        let ids: SmallVec<[NodeId; 4]> = ids.into_iter().collect();
        Self::try_from(ids).ok()
    }

    /// Identifier the position was created with
    pub fn origin(&self) -> NodeId {
        self.0[0]
    }

    /// Identifier of the most recent write
    pub fn latest(&self) -> NodeId {
        self.0[self.0.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; present for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.0
    }

    pub(crate) fn push(&mut self, id: NodeId) {
        self.0.push(id);
    }

    /// Copy of this chain with `id` appended
    pub fn extended_with(&self, id: NodeId) -> Self {
        let mut next = self.clone();
        next.push(id);
        next
    }

    /// Number of leading identifiers both chains have in common
    pub fn common_prefix_len(&self, other: &IdentityChain) -> usize {
        self.0
            .iter()
            .zip(other.0.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Same logical position: a non-empty common prefix
    pub fn shares_prefix_with(&self, other: &IdentityChain) -> bool {
        self.common_prefix_len(other) > 0
    }

    /// True if `other` starts with every identifier of `self`
    pub fn is_prefix_of(&self, other: &IdentityChain) -> bool {
        self.common_prefix_len(other) == self.len()
    }
}

impl TryFrom<SmallVec<[NodeId; 4]>> for IdentityChain {
    type Error = EmptyIdentityChain;

    fn try_from(ids: SmallVec<[NodeId; 4]>) -> Result<Self, Self::Error> {
        if ids.is_empty() {
            Err(EmptyIdentityChain)
        } else {
            Ok(Self(ids))
        }
    }
}

impl Default for IdentityChain {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IdentityChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(">")?;
            }
            write!(f, "{id}")?;
        }
        Ok(())
    }
}

/// Commit timestamp in microseconds since the Unix epoch
///
/// [`Timestamp::now`] is strictly monotonic within a process, so two writes
/// only tie when a caller builds timestamps explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timestamp(i64);

static HIGH_WATER: AtomicI64 = AtomicI64::new(i64::MIN);

impl Timestamp {
    pub fn now() -> Self {
        let wall = Utc::now().timestamp_micros();
        let mut prev = HIGH_WATER.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev.saturating_add(1));
            match HIGH_WATER.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return Self(next),
                Err(actual) => prev = actual,
            }
        }
    }

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn as_micros(&self) -> i64 {
        self.0
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.6fZ")),
            None => write!(f, "{}us", self.0),
        }
    }
}
