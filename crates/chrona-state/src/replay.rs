//! Reversal replayer
//!
//! When time runs backward the replayer consumes the newest half-cycle of the
//! ledger and rebuilds, per variable, the value set a prior read must have
//! produced for the forward writes to be self-consistent.
//!
//! The rebuild is a fixed sequence of named branches:
//! - `classify`: split the variable's entries into closing write and ops
//! - `scalar_close`: the half-cycle ended in a single-valued overwrite
//! - `seed_values`: the antecedent guesses
//! - `residue_class_shortcut`: `x = (x + k) mod d`
//! - `rebuild`: push every seed through the forward maps
//! - `persist`: choose how the rebuilt slice lands on the timeline
//!
//! Replay writes go through the mutation gateway but are never logged.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrona_core::{ChronaResult, ReversibleOp, Value, ValueSet, VarId};
use tracing::{debug, trace};

use crate::{undo_from, LedgerEntry, Mutation, Registry, Variable, WriteOrigin};

/// Largest divisor for which the residue-class shortcut materializes
/// `{0 .. d-1}`; larger divisors fall through to the general rebuild.
pub const RESIDUE_CLASS_LIMIT: Value = 4096;

/// The entries of one variable within a popped half-cycle
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HalfCycleHistory {
    /// Newest snapshot entry seen before any reversible op
    pub closing: Option<LedgerEntry>,
    /// Reversible ops found after crossing the closing write, newest first
    pub ops: Vec<ReversibleOp>,
    /// Union of every value written this half-cycle
    pub forward_values: ValueSet,
    /// Values the closing write displaced
    pub replaced_values: ValueSet,
    /// At least one append happened this half-cycle
    pub has_append: bool,
}

impl HalfCycleHistory {
    pub fn has_arithmetic(&self) -> bool {
        !self.ops.is_empty()
    }
}

/// What a reverse half-cycle did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Non-marker entries popped
    pub popped: usize,
    /// Snapshot entries undone
    pub undone: usize,
    /// Rebuilt slice per variable
    pub rebuilt: BTreeMap<VarId, ValueSet>,
}

/// Split `entries` (pop order) into the history of `var`
pub fn classify(var: VarId, entries: &[LedgerEntry]) -> HalfCycleHistory {
    let mut history = HalfCycleHistory::default();

    for entry in entries.iter().filter(|e| e.var() == Some(var)) {
        match entry {
            LedgerEntry::Append { added, .. } => {
                history.forward_values.extend(added.iter());
                history.has_append = true;
            }
            LedgerEntry::Replace { added, .. } => {
                history.forward_values.extend(added.iter());
            }
            LedgerEntry::Reversible { op, .. } => {
                if history.closing.is_some() {
                    history.ops.push(*op);
                }
                continue;
            }
            LedgerEntry::HalfCycleMarker => continue,
        }

        if history.closing.is_none() && history.ops.is_empty() {
            if let LedgerEntry::Replace { replaced, .. } = entry {
                for slice in replaced {
                    history.replaced_values.extend(slice.iter());
                }
            }
            history.closing = Some(entry.clone());
        }
    }

    history
}

/// At least one op, and the closing write was a replace or a single-valued
/// append
pub fn scalar_close(history: &HalfCycleHistory) -> bool {
    if !history.has_arithmetic() {
        return false;
    }
    match &history.closing {
        Some(LedgerEntry::Replace { .. }) => true,
        Some(LedgerEntry::Append { added, .. }) => added.is_single(),
        _ => false,
    }
}

/// Antecedent guesses for the rebuild. Never empty unless `incoming` is.
pub fn seed_values(
    history: &HalfCycleHistory,
    scalar: bool,
    incoming: &ValueSet,
    bootstrap: &ValueSet,
) -> ValueSet {
    let degenerate = bootstrap.is_single();

    let seeds = if scalar {
        if history.has_append {
            incoming
                .without(bootstrap)
                .without(&history.replaced_values)
        } else {
            incoming.union(&history.replaced_values)
        }
    } else if history.has_arithmetic() {
        incoming.clone()
    } else if degenerate {
        history
            .forward_values
            .without(bootstrap)
            .union(&incoming.without(bootstrap))
    } else {
        history.forward_values.union(incoming)
    };

    if seeds.is_empty() {
        incoming.clone()
    } else {
        seeds
    }
}

/// The full residue class when the ops are exactly `[Mod(d), Add(k)]`
/// newest first
pub fn residue_class_shortcut(ops: &[ReversibleOp]) -> Option<ValueSet> {
    match ops {
        [ReversibleOp::Mod(d), ReversibleOp::Add(_)] if *d > 0 && *d <= RESIDUE_CLASS_LIMIT => {
            Some((0..*d).collect())
        }
        _ => None,
    }
}

/// Apply every op's forward map, in list order, to each seed
pub fn rebuild(history: &HalfCycleHistory, seeds: &ValueSet, bootstrap: &ValueSet) -> ValueSet {
    if let Some(class) = residue_class_shortcut(&history.ops) {
        return class;
    }

    let mut rebuilt = seeds.map(|seed| history.ops.iter().fold(seed, |acc, op| op.forward(acc)));

    // A no-op history never narrows the value set
    if !history.has_arithmetic() {
        let forward = if bootstrap.is_single() {
            history.forward_values.without(bootstrap)
        } else {
            history.forward_values.clone()
        };
        rebuilt.extend(forward.iter());
    }

    rebuilt
}

/// How the rebuilt slice lands on the timeline
pub fn persist(
    scalar: bool,
    history: &HalfCycleHistory,
    slice_count: usize,
    rebuilt: ValueSet,
) -> Mutation {
    match (scalar, slice_count > 1) {
        (true, true) => Mutation::ReplaceForwardHistory(rebuilt),
        (true, false) => Mutation::Append(rebuilt),
        (false, _) if !history.has_append => Mutation::ReplaceLast(rebuilt),
        (false, _) => Mutation::Append(rebuilt),
    }
}

/// Drives reverse half-cycles against one registry
#[derive(Debug)]
pub struct ReversalReplayer<'a> {
    registry: &'a Registry,
}

impl<'a> ReversalReplayer<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        ReversalReplayer { registry }
    }

    /// Pop the newest half-cycle, undo its snapshots and rebuild every
    /// variable that has an entry in it. `incoming` supplies the value set
    /// captured when time flipped; a variable missing from it uses its
    /// current slice.
    pub fn reverse_half_cycle(
        &self,
        incoming: &BTreeMap<VarId, ValueSet>,
    ) -> ChronaResult<ReplaySummary> {
        self.replay(incoming, None)
    }

    /// Same as [`reverse_half_cycle`](Self::reverse_half_cycle) but only
    /// `var` is rebuilt; every popped snapshot is still undone
    pub fn reverse_variable(&self, var: VarId, incoming: ValueSet) -> ChronaResult<ReplaySummary> {
        let incoming = BTreeMap::from([(var, incoming)]);
        self.replay(&incoming, Some(var))
    }

    fn replay(
        &self,
        incoming: &BTreeMap<VarId, ValueSet>,
        only: Option<VarId>,
    ) -> ChronaResult<ReplaySummary> {
        let popped = self.registry.ledger().pop_half_cycle();

        let mut targets: Vec<VarId> = popped.iter().filter_map(LedgerEntry::var).collect();
        targets.sort_unstable();
        targets.dedup();
        if let Some(only) = only {
            targets.retain(|id| *id == only);
        }

        // Incoming sets are captured before any undo
        let incoming: BTreeMap<VarId, ValueSet> = targets
            .iter()
            .filter_map(|id| {
                let fallback = || self.registry.variable(*id).map(|v| v.current());
                incoming
                    .get(id)
                    .cloned()
                    .or_else(fallback)
                    .map(|set| (*id, set))
            })
            .collect();

        let undone = undo_from(&popped, self.registry.guard(), |id| {
            self.registry.variable(id)
        })?;

        let mut summary = ReplaySummary {
            popped: popped.len(),
            undone,
            rebuilt: BTreeMap::new(),
        };

        for (id, incoming) in incoming {
            let Some(variable) = self.registry.variable(id) else {
                continue;
            };
            let rebuilt = self.rebuild_variable(&variable, &popped, &incoming)?;
            summary.rebuilt.insert(id, rebuilt);
        }

        debug!(
            popped = summary.popped,
            undone = summary.undone,
            rebuilt = summary.rebuilt.len(),
            "reverse half-cycle replayed"
        );
        Ok(summary)
    }

    fn rebuild_variable(
        &self,
        variable: &Arc<Variable>,
        popped: &[LedgerEntry],
        incoming: &ValueSet,
    ) -> ChronaResult<ValueSet> {
        let history = classify(variable.id(), popped);
        let scalar = scalar_close(&history);
        let (bootstrap, slice_count) = variable.with_timeline(|t| (t.bootstrap().clone(), t.len()));

        let seeds = seed_values(&history, scalar, incoming, &bootstrap);
        let rebuilt = rebuild(&history, &seeds, &bootstrap);
        let mutation = persist(scalar, &history, slice_count, rebuilt.clone());

        trace!(
            var = %variable.id(),
            scalar,
            ops = history.ops.len(),
            seeds = %seeds,
            rebuilt = %rebuilt,
            mutation = mutation.name(),
            "variable rebuilt"
        );

        variable.mutate(self.registry.guard(), WriteOrigin::Engine, mutation)?;
        self.registry.mark_write();
        Ok(rebuilt)
    }
}
