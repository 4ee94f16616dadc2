//! Collaborator working copy
//!
//! A replica owns one collaborator's tree, deep-copied from a shared
//! ancestor, and keeps a revision log of the edits, applied change-sets and
//! merges it went through. Change-sets are the only thing replicas exchange.

use crate::apply::apply_changes;
use crate::ast::FormulaTree;
use crate::diff::{diff_trees, Change, ChangeSet};
use crate::error::Error;
use crate::identity::Timestamp;
use crate::merge::{merge_changes, MergeResult};
use crate::parser::parse;

/// How a revision came about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionKind {
    /// Local text edit
    Edit,
    /// Change-set applied as-is
    Apply,
    /// Foreign change-set merged
    Merge,
}

/// An entry in the revision log
#[derive(Debug, Clone)]
pub struct Revision {
    /// Sequence number, starting at 1
    pub number: u64,
    pub kind: RevisionKind,
    pub author: String,
    /// Changes that produced this revision
    pub changes: ChangeSet,
    /// Formula text after the revision
    pub formula: String,
    pub recorded_at: Timestamp,
}

/// One collaborator's working copy
#[derive(Debug, Clone)]
pub struct Replica {
    author: String,
    tree: FormulaTree,
    log: Vec<Revision>,
}

impl Replica {
    /// Deep copy of `ancestor` owned by `author`
    pub fn new(author: &str, ancestor: &FormulaTree) -> Self {
        Self {
            author: String::from(author),
            tree: ancestor.clone(),
            log: Vec::new(),
        }
    }

    /// Parse `text` as the shared ancestor
    pub fn from_formula(author: &str, text: &str) -> Result<Self, Error> {
        Ok(Self::new(author, &parse(text)?))
    }

    /// New replica for `author` starting from this replica's current tree
    pub fn fork(&self, author: &str) -> Self {
        Self::new(author, &self.tree)
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn tree(&self) -> &FormulaTree {
        &self.tree
    }

    /// Current formula text
    pub fn formula(&self) -> String {
        self.tree.to_formula()
    }

    /// Revision history, oldest first
    pub fn log(&self) -> &[Revision] {
        &self.log
    }

    pub fn head(&self) -> Option<&Revision> {
        self.log.last()
    }

    /// Changes that would turn the current tree into `text`
    pub fn changes_to(&self, text: &str) -> Result<ChangeSet, Error> {
        let mut target = parse(text)?;
        target.root_mut().assign_author(&self.author);
        Ok(diff_trees(&self.tree, &target)?)
    }

    /// Replace the formula with `text`; returns the change-set to share
    pub fn edit(&mut self, text: &str) -> Result<ChangeSet, Error> {
        let changes = self.changes_to(text)?;
        apply_changes(&mut self.tree, &changes, &self.author)?;
        self.record(RevisionKind::Edit, changes.clone());
        Ok(changes)
    }

    /// Apply a change-set under this replica's author
    pub fn apply(&mut self, changes: &[Change]) -> Result<(), Error> {
        apply_changes(&mut self.tree, changes, &self.author)?;
        self.record(RevisionKind::Apply, changes.to_vec());
        Ok(())
    }

    /// Merge another collaborator's change-set
    pub fn merge(&mut self, foreign: &[Change]) -> Result<MergeResult, Error> {
        let result = merge_changes(&mut self.tree, foreign)?;
        tracing::debug!(
            author = %self.author,
            applied = result.applied,
            skipped = result.skipped.len(),
            conflicts = result.conflicts.len(),
            "merged foreign change-set"
        );
        self.record(RevisionKind::Merge, foreign.to_vec());
        Ok(result)
    }

    fn record(&mut self, kind: RevisionKind, changes: ChangeSet) {
        let number = self.log.len() as u64 + 1;
        self.log.push(Revision {
            number,
            kind,
            author: self.author.clone(),
            changes,
            formula: self.tree.to_formula(),
            recorded_at: Timestamp::now(),
        });
    }
}
