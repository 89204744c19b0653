//! Runtime registry - live variables plus the state of the current run
//!
//! The registry is an explicit context object: one per runtime, shared by the
//! scheduler, the replayer and the STM gateway. Several registries can coexist
//! in one process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI8, Ordering};
use std::sync::Arc;

use chrona_core::{ChronaError, ChronaResult, TimeDirection, ValueSet, VarId};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, trace};

use crate::{
    GuardConfig, LedgerEntry, Mutation, MutationGuard, OperationLedger, Var, Variable, WriteOrigin,
};

/// Registry of variables and run-scoped state
#[derive(Debug)]
pub struct Registry {
    variables: RwLock<BTreeMap<VarId, Arc<Variable>>>,
    /// Variables referenced by the active run
    participants: Mutex<BTreeSet<VarId>>,
    entropy: AtomicI8,
    converged: AtomicBool,
    run_active: AtomicBool,
    saw_write: AtomicBool,
    ledger: Mutex<OperationLedger>,
    guard: MutationGuard,
}

impl Registry {
    pub fn new(config: GuardConfig) -> Self {
        Registry {
            variables: RwLock::new(BTreeMap::new()),
            participants: Mutex::new(BTreeSet::new()),
            entropy: AtomicI8::new(TimeDirection::Forward.entropy()),
            converged: AtomicBool::new(false),
            run_active: AtomicBool::new(false),
            saw_write: AtomicBool::new(false),
            ledger: Mutex::new(OperationLedger::new()),
            guard: MutationGuard::new(config),
        }
    }

    pub fn guard(&self) -> &MutationGuard {
        &self.guard
    }

    /// Create the variable on first reference, otherwise return it. On the
    /// engine thread of an active run the variable also joins the run.
    pub fn create_or_get(
        self: &Arc<Self>,
        id: VarId,
        initial: impl Into<ValueSet>,
    ) -> ChronaResult<Var> {
        let variable = {
            let existing = self.variables.read().get(&id).cloned();
            match existing {
                Some(variable) => variable,
                None => {
                    let mut variables = self.variables.write();
                    Arc::clone(variables.entry(id).or_insert_with(|| {
                        debug!(var = %id, "variable created");
                        Arc::new(Variable::new(id, initial.into()))
                    }))
                }
            }
        };

        self.enroll(&variable)?;
        Ok(Var::new(variable, Arc::clone(self)))
    }

    /// Handle to an existing variable
    pub fn get(self: &Arc<Self>, id: VarId) -> ChronaResult<Var> {
        let variable = self.variable(id).ok_or(ChronaError::VariableNotFound(id))?;
        Ok(Var::new(variable, Arc::clone(self)))
    }

    pub fn variable(&self, id: VarId) -> Option<Arc<Variable>> {
        self.variables.read().get(&id).cloned()
    }

    /// All live variables in ascending id order
    pub fn variables(&self) -> Vec<Arc<Variable>> {
        self.variables.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.variables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.read().is_empty()
    }

    // ------------------------------------------------------------------
    // Run state
    // ------------------------------------------------------------------

    /// Claim the registry for a convergence run on the calling thread
    pub fn begin_run(&self) -> ChronaResult<()> {
        if self
            .run_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ChronaError::RunInProgress);
        }

        self.guard.enter_engine();
        self.set_direction(TimeDirection::Forward);
        self.set_converged(false);
        self.saw_write.store(false, Ordering::Release);
        self.ledger.lock().reset();
        self.participants.lock().clear();
        trace!("run claimed");
        Ok(())
    }

    /// Release the registry at the end of a run
    pub fn end_run(&self) {
        // Commit ids are never reused, so the applied set can go too
        self.ledger.lock().reset();
        self.participants.lock().clear();
        self.set_direction(TimeDirection::Forward);
        self.guard.leave_engine();
        self.run_active.store(false, Ordering::Release);
        trace!("run released");
    }

    pub fn is_run_active(&self) -> bool {
        self.run_active.load(Ordering::Acquire)
    }

    /// Ledger history is recorded only by the thread that owns the run
    pub fn records_history(&self) -> bool {
        self.is_run_active() && self.guard.is_engine_thread()
    }

    pub fn direction(&self) -> TimeDirection {
        TimeDirection::from_entropy(self.entropy.load(Ordering::Acquire))
    }

    pub fn set_direction(&self, direction: TimeDirection) {
        self.entropy.store(direction.entropy(), Ordering::Release);
    }

    /// Flip the entropy sign, returning the new direction
    pub fn flip_direction(&self) -> TimeDirection {
        let next = self.direction().flipped();
        self.set_direction(next);
        next
    }

    pub fn is_converged(&self) -> bool {
        self.converged.load(Ordering::Acquire)
    }

    pub fn set_converged(&self, converged: bool) {
        self.converged.store(converged, Ordering::Release);
    }

    pub fn mark_write(&self) {
        self.saw_write.store(true, Ordering::Release);
    }

    pub fn clear_write(&self) {
        self.saw_write.store(false, Ordering::Release);
    }

    pub fn saw_write(&self) -> bool {
        self.saw_write.load(Ordering::Acquire)
    }

    /// Join the active run: first reference rebases the timeline onto its
    /// current slice so earlier history cannot leak into this run
    fn enroll(&self, variable: &Arc<Variable>) -> ChronaResult<()> {
        if !self.records_history() {
            return Ok(());
        }
        if self.participants.lock().insert(variable.id()) {
            variable.mutate(&self.guard, WriteOrigin::Engine, Mutation::Rebase)?;
            trace!(var = %variable.id(), "variable joined run");
        }
        Ok(())
    }

    /// Variables of the active run in ascending id order
    pub fn participants(&self) -> Vec<Arc<Variable>> {
        let ids: Vec<VarId> = self.participants.lock().iter().copied().collect();
        let variables = self.variables.read();
        ids.iter().filter_map(|id| variables.get(id).cloned()).collect()
    }

    /// Every participant is individually converged
    pub fn all_converged(&self) -> bool {
        self.participants().iter().all(|v| v.is_converged())
    }

    /// Deep copy of every participant's current slice
    pub fn snapshot_participants(&self) -> BTreeMap<VarId, ValueSet> {
        self.participants()
            .iter()
            .map(|v| (v.id(), v.snapshot()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Ledger
    // ------------------------------------------------------------------

    pub fn ledger(&self) -> MutexGuard<'_, OperationLedger> {
        self.ledger.lock()
    }

    pub fn ledger_len(&self) -> usize {
        self.ledger.lock().len()
    }

    /// Record entries if this thread is recording run history
    pub fn record(&self, entries: impl IntoIterator<Item = LedgerEntry>) {
        if self.records_history() {
            self.ledger.lock().extend(entries);
        }
    }

    /// Engine-path write: mutate, flag the write and record the snapshot
    pub fn direct_write(
        &self,
        variable: &Variable,
        mutation: Mutation,
        preceding: Vec<LedgerEntry>,
    ) -> ChronaResult<()> {
        let effect = variable.mutate(&self.guard, WriteOrigin::Engine, mutation)?;
        self.mark_write();
        let snapshot = LedgerEntry::from_effect(variable.id(), effect);
        self.record(preceding.into_iter().chain(snapshot));
        Ok(())
    }

    /// Destroy every variable and forget all history
    pub fn teardown(&self) {
        self.variables.write().clear();
        self.participants.lock().clear();
        self.ledger.lock().reset();
        self.set_converged(false);
        debug!("registry torn down");
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(GuardConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrona_core::CommitId;

    #[test]
    fn test_create_or_get_is_idempotent() {
        let registry = Arc::new(Registry::default());
        let a = registry.create_or_get(VarId(1), 5).unwrap();
        let b = registry.create_or_get(VarId(1), 99).unwrap();

        assert_eq!(a.get(), ValueSet::single(5));
        assert_eq!(b.get(), ValueSet::single(5));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_single_run_per_registry() {
        let registry = Registry::default();
        registry.begin_run().unwrap();
        assert!(matches!(registry.begin_run(), Err(ChronaError::RunInProgress)));
        registry.end_run();
        assert!(registry.begin_run().is_ok());
        registry.end_run();
    }

    #[test]
    fn test_history_recorded_only_during_run() {
        let registry = Arc::new(Registry::default());
        registry.record([LedgerEntry::HalfCycleMarker]);
        assert_eq!(registry.ledger_len(), 0);

        registry.begin_run().unwrap();
        registry.record([LedgerEntry::HalfCycleMarker]);
        assert_eq!(registry.ledger_len(), 1);
        registry.end_run();
        assert_eq!(registry.ledger_len(), 0);
    }

    #[test]
    fn test_end_run_forgets_applied_commits() {
        let registry = Registry::default();
        registry.begin_run().unwrap();
        assert!(registry.ledger().append_commit(CommitId(1), Vec::new()));
        assert!(!registry.ledger().append_commit(CommitId(1), Vec::new()));
        registry.end_run();

        assert!(!registry.ledger().has_commit(CommitId(1)));
    }

    #[test]
    fn test_enrollment_rebases() {
        let registry = Arc::new(Registry::new(GuardConfig::relaxed()));
        let var = registry.create_or_get(VarId(3), 0).unwrap();
        var.assign(1).unwrap();
        var.assign(2).unwrap();
        assert_eq!(var.timeline().len(), 3);

        registry.begin_run().unwrap();
        let var = registry.create_or_get(VarId(3), 0).unwrap();
        assert_eq!(var.timeline().slices(), &[ValueSet::single(2)]);
        assert_eq!(registry.participants().len(), 1);
        registry.end_run();
    }

    #[test]
    fn test_direction_flip() {
        let registry = Registry::default();
        assert_eq!(registry.direction(), TimeDirection::Forward);
        assert_eq!(registry.flip_direction(), TimeDirection::Reverse);
        assert_eq!(registry.flip_direction(), TimeDirection::Forward);
    }

    #[test]
    fn test_teardown() {
        let registry = Arc::new(Registry::default());
        registry.create_or_get(VarId(1), 0).unwrap();
        registry.teardown();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get(VarId(1)),
            Err(ChronaError::VariableNotFound(_))
        ));
    }
}
