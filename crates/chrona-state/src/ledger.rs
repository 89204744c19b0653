//! Operation ledger - the undo stack of one convergence run
//!
//! A `HalfCycleMarker` is pushed right before every forward execution of the
//! code block, so popping back to the nearest marker yields exactly one
//! half-cycle. The ledger lives behind its own lock inside the registry;
//! transactions buffer their entries and append them once per commit id.

use std::collections::HashSet;
use std::sync::Arc;

use chrona_core::{ChronaResult, CommitId, ReversibleOp, ValueSet, VarId};
use tracing::debug;

use crate::{Mutation, MutationEffect, MutationGuard, Variable, WriteOrigin};

/// One ledger entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerEntry {
    /// Start of a forward half-cycle
    HalfCycleMarker,
    /// A slice was pushed on the variable's timeline
    Append { var: VarId, added: ValueSet },
    /// Slices were removed from the end and `added` took their place
    Replace {
        var: VarId,
        added: ValueSet,
        replaced: Vec<ValueSet>,
    },
    /// An arithmetic update with forward and inverse maps
    Reversible { var: VarId, op: ReversibleOp },
}

impl LedgerEntry {
    /// Build the snapshot entry describing a timeline write
    pub fn from_effect(var: VarId, effect: MutationEffect) -> Option<Self> {
        let added = effect.added?;
        if effect.replaced.is_empty() {
            Some(LedgerEntry::Append { var, added })
        } else {
            Some(LedgerEntry::Replace {
                var,
                added,
                replaced: effect.replaced,
            })
        }
    }

    pub fn var(&self) -> Option<VarId> {
        match self {
            LedgerEntry::HalfCycleMarker => None,
            LedgerEntry::Append { var, .. }
            | LedgerEntry::Replace { var, .. }
            | LedgerEntry::Reversible { var, .. } => Some(*var),
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, LedgerEntry::HalfCycleMarker)
    }

    /// Append or replace: entries that carry a restorable snapshot
    pub fn is_snapshot(&self) -> bool {
        matches!(self, LedgerEntry::Append { .. } | LedgerEntry::Replace { .. })
    }

    /// The timeline mutation restoring the pre-write state
    pub fn inverse_snapshot(&self) -> Option<Mutation> {
        match self {
            LedgerEntry::Append { .. } => Some(Mutation::Restore {
                remove: 1,
                reinstate: Vec::new(),
            }),
            LedgerEntry::Replace { replaced, .. } => Some(Mutation::Restore {
                remove: 1,
                reinstate: replaced.clone(),
            }),
            LedgerEntry::HalfCycleMarker | LedgerEntry::Reversible { .. } => None,
        }
    }
}

/// Single-run operation log
#[derive(Debug, Default)]
pub struct OperationLedger {
    entries: Vec<LedgerEntry>,
    applied_commits: HashSet<CommitId>,
}

impl OperationLedger {
    pub fn new() -> Self {
        OperationLedger::default()
    }

    pub fn push(&mut self, entry: LedgerEntry) {
        self.entries.push(entry);
    }

    pub fn push_marker(&mut self) {
        self.entries.push(LedgerEntry::HalfCycleMarker);
    }

    pub fn peek(&self) -> Option<&LedgerEntry> {
        self.entries.last()
    }

    pub fn pop(&mut self) -> Option<LedgerEntry> {
        self.entries.pop()
    }

    /// Drop every entry; applied commit ids are kept
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop entries and forget applied commit ids
    pub fn reset(&mut self) {
        self.entries.clear();
        self.applied_commits.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter()
    }

    pub fn marker_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_marker()).count()
    }

    /// Pop newest to oldest up to and including the nearest marker. Returns
    /// the non-marker entries in pop order (newest first). Never reads past
    /// the marker.
    pub fn pop_half_cycle(&mut self) -> Vec<LedgerEntry> {
        let mut popped = Vec::new();
        while let Some(entry) = self.entries.pop() {
            if entry.is_marker() {
                break;
            }
            popped.push(entry);
        }
        popped
    }

    /// Append the buffered entries of one commit. Re-submitting a commit id
    /// is a no-op; returns whether the entries were appended.
    pub fn append_commit(&mut self, commit: CommitId, entries: Vec<LedgerEntry>) -> bool {
        if !self.applied_commits.insert(commit) {
            debug!(%commit, "duplicate ledger append ignored");
            return false;
        }
        self.entries.extend(entries);
        true
    }

    pub fn has_commit(&self, commit: CommitId) -> bool {
        self.applied_commits.contains(&commit)
    }
}

impl Extend<LedgerEntry> for OperationLedger {
    fn extend<I: IntoIterator<Item = LedgerEntry>>(&mut self, iter: I) {
        for entry in iter {
            self.push(entry);
        }
    }
}

/// Restore the pre-write snapshot of every entry, in the given order. Pass
/// entries newest first (pop order). Reversible and marker entries carry no
/// snapshot and are skipped; entries for unknown variables are skipped.
pub fn undo_from(
    entries: &[LedgerEntry],
    guard: &MutationGuard,
    resolve: impl Fn(VarId) -> Option<Arc<Variable>>,
) -> ChronaResult<usize> {
    let mut undone = 0;
    for entry in entries {
        let (Some(var), Some(restore)) = (entry.var(), entry.inverse_snapshot()) else {
            continue;
        };
        let Some(variable) = resolve(var) else {
            continue;
        };
        variable.mutate(guard, WriteOrigin::Engine, restore)?;
        undone += 1;
    }
    Ok(undone)
}
