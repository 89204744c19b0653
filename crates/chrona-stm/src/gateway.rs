//! Transactional mutation gateway
//!
//! Optimistic concurrency over registry variables:
//! - reads record the version they observed
//! - writes are staged and applied at commit under per-variable locks
//! - locks are always taken in ascending id order and released in reverse
//! - validation conflicts are retried with capped exponential backoff

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrona_core::{AbortReason, ChronaError, ChronaResult, CommitId, TxnId, VarId};
use chrona_state::{CommitLock, LedgerEntry, MutationGuard, Registry, Variable, WriteOrigin};
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::{
    Backoff, CommitHook, CommitOutcome, CommitRecord, RetryPolicy, Telemetry, Transaction,
};

/// Commit locks of one transaction, released newest first on drop
struct LockSet<'a> {
    held: Vec<(VarId, CommitLock<'a>)>,
}

impl<'a> LockSet<'a> {
    /// Lock `variables` in the given order, which must be ascending by id
    fn acquire(variables: &'a [Arc<Variable>], guard: &MutationGuard) -> ChronaResult<Self> {
        let mut set = LockSet {
            held: Vec::with_capacity(variables.len()),
        };
        for variable in variables {
            let previous = set.held.last().map(|(id, _)| *id);
            guard.check_lock_order(previous, variable.id())?;
            set.held.push((variable.id(), variable.lock_for_commit()));
        }
        Ok(set)
    }
}

impl Drop for LockSet<'_> {
    fn drop(&mut self) {
        while let Some((_, lock)) = self.held.pop() {
            drop(lock);
        }
    }
}

/// The STM gateway of one runtime
pub struct Stm {
    registry: Arc<Registry>,
    telemetry: Arc<Telemetry>,
    hooks: RwLock<Vec<Arc<dyn CommitHook>>>,
    next_txn: AtomicU64,
    next_commit: AtomicU64,
}

impl Stm {
    pub fn new(registry: Arc<Registry>, telemetry: Arc<Telemetry>) -> Self {
        Stm {
            registry,
            telemetry,
            hooks: RwLock::new(Vec::new()),
            next_txn: AtomicU64::new(1),
            next_commit: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn add_hook(&self, hook: Arc<dyn CommitHook>) {
        self.hooks.write().push(hook);
    }

    /// Open a transaction
    pub fn begin(&self) -> Transaction {
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed));
        Transaction::new(id, Arc::clone(&self.registry), Arc::clone(&self.telemetry))
    }

    /// Commit `tx`. Inside a nested scope this only leaves the scope.
    ///
    /// On a validation conflict the transaction stays open and nothing is
    /// applied; the caller retries with a fresh transaction.
    pub fn commit(&self, tx: &mut Transaction) -> ChronaResult<CommitOutcome> {
        if tx.is_finished() {
            return Err(ChronaError::TransactionFinished);
        }
        if tx.leave_nested() {
            trace!(txn = %tx.id(), depth = tx.depth(), "nested commit flattened");
            return Ok(CommitOutcome::Flattened);
        }
        if !Arc::ptr_eq(tx.registry(), &self.registry) {
            return Err(ChronaError::InvalidOperation(
                "transaction belongs to another runtime".to_string(),
            ));
        }

        if tx.is_read_only() {
            self.validate_reads(tx)?;
            self.telemetry.record_commit(&[], Duration::ZERO);
            tx.finish();
            trace!(txn = %tx.id(), reads = tx.read_count(), "read-only commit");
            return Ok(CommitOutcome::ReadOnly);
        }

        self.commit_writes(tx)
    }

    /// A read is stale when its version moved, or when another commit is
    /// applying to it right now and the value seen may be half of that commit
    fn validate_reads(&self, tx: &Transaction) -> ChronaResult<()> {
        for (id, read) in &tx.reads {
            let in_flight = !tx.writes.contains_key(id) && read.variable.is_commit_locked();
            if in_flight || read.variable.version() != read.version {
                self.telemetry.record_validation_failure(*id);
                debug!(
                    txn = %tx.id(),
                    var = %id,
                    seen = read.version,
                    now = read.variable.version(),
                    "validation failed"
                );
                return Err(ChronaError::ValidationConflict { var: *id });
            }
        }
        Ok(())
    }

    fn commit_writes(&self, tx: &mut Transaction) -> ChronaResult<CommitOutcome> {
        let guard = self.registry.guard();
        let variables: Vec<Arc<Variable>> =
            tx.writes.values().map(|w| Arc::clone(&w.variable)).collect();

        let locks = LockSet::acquire(&variables, guard)?;
        let locked_at = Instant::now();

        self.validate_reads(tx)?;
        Self::check_writes(tx, guard)?;

        let commit = CommitId(self.next_commit.fetch_add(1, Ordering::Relaxed));
        let mut snapshots = Vec::with_capacity(tx.writes.len());
        for (id, write) in &tx.writes {
            let mutation = write.kind.into_mutation(write.slice.clone());
            let effect = write
                .variable
                .mutate(guard, WriteOrigin::TransactionApply, mutation)?;
            snapshots.extend(LedgerEntry::from_effect(*id, effect));
        }

        let lock_hold = locked_at.elapsed();
        drop(locks);

        if self.registry.records_history() {
            let mut entries = std::mem::take(&mut tx.logged);
            entries.extend(snapshots);
            self.registry.ledger().append_commit(commit, entries);
            self.registry.mark_write();
        }

        let written: Vec<VarId> = tx.writes.keys().copied().collect();
        self.telemetry.record_commit(&written, lock_hold);
        tx.finish();

        debug!(
            txn = %tx.id(),
            %commit,
            writes = written.len(),
            lock_hold_us = lock_hold.as_micros() as u64,
            "transaction committed"
        );

        self.run_hooks(CommitRecord {
            commit,
            txn: tx.id(),
            written: variables,
        });

        Ok(CommitOutcome::Committed {
            commit,
            writes: written.len(),
        })
    }

    /// Every guard check of the apply loop, run before the first write so
    /// a rejected commit leaves no variable half-applied
    fn check_writes(tx: &Transaction, guard: &MutationGuard) -> ChronaResult<()> {
        for (id, write) in &tx.writes {
            guard.check_write(
                *id,
                WriteOrigin::TransactionApply,
                write.variable.holds_commit_lock(),
            )?;
        }
        Ok(())
    }

    fn run_hooks(&self, record: CommitRecord) {
        let hooks = self.hooks.read().clone();
        for hook in hooks {
            if let Err(err) = hook.after_commit(&record) {
                warn!(commit = %record.commit, error = %err, "commit hook failed");
            }
        }
    }

    /// Run `body` in a transaction and commit it, retrying the whole body
    /// on validation conflicts according to `policy`
    pub fn atomically<R>(
        &self,
        policy: &RetryPolicy,
        mut body: impl FnMut(&mut Transaction) -> ChronaResult<R>,
    ) -> ChronaResult<R> {
        let started = Instant::now();
        let mut backoff = Backoff::new(policy);

        loop {
            let mut tx = self.begin();
            let result = body(&mut tx).and_then(|value| self.commit(&mut tx).map(|_| value));
            drop(tx);

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };

            let delay = backoff.next_delay();
            if !backoff.can_retry() {
                return Err(self.abort(backoff.failures(), AbortReason::RetriesExhausted, &err));
            }
            if let Some(deadline) = policy.deadline {
                if started.elapsed() + delay >= deadline {
                    return Err(self.abort(backoff.failures(), AbortReason::DeadlineExceeded, &err));
                }
            }

            self.telemetry.record_retry();
            trace!(
                attempt = backoff.failures() + 1,
                delay_us = delay.as_micros() as u64,
                "retrying transaction"
            );
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
    }

    fn abort(&self, attempts: u32, reason: AbortReason, last: &ChronaError) -> ChronaError {
        self.telemetry.record_abort();
        warn!(attempts, %reason, last_error = %last, "transaction aborted");
        ChronaError::TransactionAborted { attempts, reason }
    }
}

impl std::fmt::Debug for Stm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stm")
            .field("hooks", &self.hooks.read().len())
            .field("next_txn", &self.next_txn.load(Ordering::Relaxed))
            .field("next_commit", &self.next_commit.load(Ordering::Relaxed))
            .finish()
    }
}
