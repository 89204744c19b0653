//! Transaction - explicit handle carrying read-set, write-set and buffered
//! ledger entries
//!
//! A transaction is opened by [`Stm::begin`](crate::Stm::begin) and closed by
//! a commit or by being dropped. Nested scopes flatten into the open
//! transaction; only the outermost commit is real.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrona_core::{ChronaError, ChronaResult, CommitId, ReversibleOp, TxnId, ValueSet, VarId};
use chrona_state::{LedgerEntry, Mutation, Registry, Var, Variable};
use tracing::{debug, trace};

use crate::Telemetry;

/// How a staged write lands on the timeline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationKind {
    Append,
    ReplaceLast,
    OverwriteBootstrap,
}

impl MutationKind {
    pub fn into_mutation(self, slice: ValueSet) -> Mutation {
        match self {
            MutationKind::Append => Mutation::Append(slice),
            MutationKind::ReplaceLast => Mutation::ReplaceLast(slice),
            MutationKind::OverwriteBootstrap => Mutation::OverwriteBootstrap(slice),
        }
    }
}

/// Version observed by the first read of a variable
#[derive(Clone, Debug)]
pub(crate) struct ReadEntry {
    pub(crate) variable: Arc<Variable>,
    pub(crate) version: u64,
}

/// A write waiting for commit
#[derive(Clone, Debug)]
pub(crate) struct StagedWrite {
    pub(crate) variable: Arc<Variable>,
    pub(crate) slice: ValueSet,
    pub(crate) kind: MutationKind,
}

/// Result of `Stm::commit`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing written; every read validated without taking locks
    ReadOnly,
    /// Writes applied under `commit`
    Committed { commit: CommitId, writes: usize },
    /// Inner scope of a nested transaction; the outer commit is pending
    Flattened,
}

/// An open optimistic transaction
pub struct Transaction {
    id: TxnId,
    registry: Arc<Registry>,
    telemetry: Arc<Telemetry>,
    pub(crate) reads: BTreeMap<VarId, ReadEntry>,
    pub(crate) writes: BTreeMap<VarId, StagedWrite>,
    /// Reversible entries buffered for the ledger, chronological
    pub(crate) logged: Vec<LedgerEntry>,
    depth: u32,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(id: TxnId, registry: Arc<Registry>, telemetry: Arc<Telemetry>) -> Self {
        registry.guard().transaction_started();
        trace!(txn = %id, "transaction opened");
        Transaction {
            id,
            registry,
            telemetry,
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
            logged: Vec::new(),
            depth: 0,
            finished: false,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Nesting depth; 0 for the outermost scope
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn read_count(&self) -> usize {
        self.reads.len()
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    fn ensure_open(&self) -> ChronaResult<()> {
        if self.finished {
            Err(ChronaError::TransactionFinished)
        } else {
            Ok(())
        }
    }

    /// Read the current value set. The version seen first is recorded; a
    /// later read that observes a newer version fails immediately. Staged
    /// writes of this transaction are visible to it.
    pub fn read(&mut self, var: &Var) -> ChronaResult<ValueSet> {
        self.ensure_open()?;
        if let Some(staged) = self.writes.get(&var.id()) {
            return Ok(staged.slice.clone());
        }

        let (slice, version) = var.variable().read_versioned();
        match self.reads.get(&var.id()) {
            Some(entry) if entry.version != version => {
                self.telemetry.record_validation_failure(var.id());
                debug!(
                    txn = %self.id,
                    var = %var.id(),
                    seen = entry.version,
                    now = version,
                    "re-read saw a newer version"
                );
                return Err(ChronaError::ValidationConflict { var: var.id() });
            }
            Some(_) => {}
            None => {
                self.reads.insert(
                    var.id(),
                    ReadEntry {
                        variable: Arc::clone(var.variable()),
                        version,
                    },
                );
            }
        }
        Ok(slice)
    }

    /// Stage a write; the last write per variable wins
    pub fn stage_write(
        &mut self,
        var: &Var,
        slice: impl Into<ValueSet>,
        kind: MutationKind,
    ) -> ChronaResult<()> {
        self.ensure_open()?;
        self.writes.insert(
            var.id(),
            StagedWrite {
                variable: Arc::clone(var.variable()),
                slice: slice.into(),
                kind,
            },
        );
        Ok(())
    }

    /// Stage an append
    pub fn write(&mut self, var: &Var, slice: impl Into<ValueSet>) -> ChronaResult<()> {
        self.stage_write(var, slice, MutationKind::Append)
    }

    /// Read, map every value through `ops` and stage the result as an
    /// append. The ops are buffered for the ledger.
    pub fn apply(
        &mut self,
        var: &Var,
        ops: impl IntoIterator<Item = ReversibleOp>,
    ) -> ChronaResult<ValueSet> {
        let ops = ops
            .into_iter()
            .map(ReversibleOp::validate)
            .collect::<ChronaResult<Vec<_>>>()?;

        let current = self.read(var)?;
        let next = current.map(|x| ops.iter().fold(x, |acc, op| op.forward(acc)));
        self.stage_write(var, next.clone(), MutationKind::Append)?;

        let id = var.id();
        self.logged
            .extend(ops.into_iter().map(|op| LedgerEntry::Reversible { var: id, op }));
        Ok(next)
    }

    /// Open a nested scope that flattens into this transaction
    pub fn begin_nested(&mut self) -> &mut Self {
        self.depth += 1;
        self
    }

    /// Run `body` as a nested scope of this transaction
    pub fn nested<R>(
        &mut self,
        body: impl FnOnce(&mut Transaction) -> ChronaResult<R>,
    ) -> ChronaResult<R> {
        self.ensure_open()?;
        let outer = self.depth;
        self.depth += 1;
        let result = body(self);
        self.depth = outer;
        result
    }

    /// Leave one nested scope; false at the outermost scope
    pub(crate) fn leave_nested(&mut self) -> bool {
        if self.depth == 0 {
            return false;
        }
        self.depth -= 1;
        true
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Close the transaction; idempotent
    pub(crate) fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.registry.guard().transaction_finished();
            trace!(txn = %self.id, "transaction closed");
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("reads", &self.reads.keys().collect::<Vec<_>>())
            .field("writes", &self.writes.keys().collect::<Vec<_>>())
            .field("depth", &self.depth)
            .field("finished", &self.finished)
            .finish()
    }
}
