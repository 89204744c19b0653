//! Variable - identity, timeline, version and commit lock
//!
//! Every timeline change goes through [`Variable::mutate`]. The version is
//! bumped inside the data lock, so a `(slice, version)` pair read under the
//! same lock is always consistent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use chrona_core::{ChronaResult, ValueSet, VarId};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use tracing::trace;

use crate::{Mutation, MutationEffect, MutationGuard, Timeline, WriteOrigin};

/// Immutable, detached copy of a timeline for diagnostics
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TimelineArchive {
    pub id: VarId,
    pub version: u64,
    pub slices: Arc<[ValueSet]>,
}

/// A held commit lock. The holding thread is recorded so the mutation
/// guard can tell the holder apart from everyone else.
pub struct CommitLock<'a> {
    holder: &'a Mutex<Option<ThreadId>>,
    _lock: MutexGuard<'a, ()>,
}

impl Drop for CommitLock<'_> {
    fn drop(&mut self) {
        // Cleared before the lock itself is released
        *self.holder.lock() = None;
    }
}

impl std::fmt::Debug for CommitLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLock")
            .field("holder", &*self.holder.lock())
            .finish()
    }
}

/// A shared variable
#[derive(Debug)]
pub struct Variable {
    id: VarId,
    timeline: RwLock<Timeline>,
    version: AtomicU64,
    commit_lock: Mutex<()>,
    commit_holder: Mutex<Option<ThreadId>>,
}

impl Variable {
    pub fn new(id: VarId, bootstrap: ValueSet) -> Self {
        Variable {
            id,
            timeline: RwLock::new(Timeline::new(bootstrap)),
            version: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
            commit_holder: Mutex::new(None),
        }
    }

    #[inline]
    pub fn id(&self) -> VarId {
        self.id
    }

    /// Committed version; strictly increases with every write
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Current slice
    pub fn current(&self) -> ValueSet {
        self.timeline.read().current().clone()
    }

    /// Current slice and the version it belongs to
    pub fn read_versioned(&self) -> (ValueSet, u64) {
        let timeline = self.timeline.read();
        (timeline.current().clone(), self.version())
    }

    /// Deep copy of the current slice
    pub fn snapshot(&self) -> ValueSet {
        self.current()
    }

    /// Copy of the whole timeline
    pub fn timeline(&self) -> Timeline {
        self.timeline.read().clone()
    }

    pub fn slice_count(&self) -> usize {
        self.timeline.read().len()
    }

    pub fn bootstrap(&self) -> ValueSet {
        self.timeline.read().bootstrap().clone()
    }

    pub fn is_converged(&self) -> bool {
        self.timeline.read().is_converged()
    }

    pub fn is_unified(&self) -> bool {
        self.timeline.read().is_unified()
    }

    /// Run `f` against the timeline under the read lock
    pub fn with_timeline<R>(&self, f: impl FnOnce(&Timeline) -> R) -> R {
        f(&self.timeline.read())
    }

    /// Take the commit lock. Held only while a commit applies its writes.
    pub fn lock_for_commit(&self) -> CommitLock<'_> {
        let lock = self.commit_lock.lock();
        *self.commit_holder.lock() = Some(thread::current().id());
        CommitLock {
            holder: &self.commit_holder,
            _lock: lock,
        }
    }

    /// Held by any thread
    pub fn is_commit_locked(&self) -> bool {
        self.commit_lock.is_locked()
    }

    /// Held by the calling thread
    pub fn holds_commit_lock(&self) -> bool {
        *self.commit_holder.lock() == Some(thread::current().id())
    }

    /// The single mutation gateway
    pub fn mutate(
        &self,
        guard: &MutationGuard,
        origin: WriteOrigin,
        mutation: Mutation,
    ) -> ChronaResult<MutationEffect> {
        guard.check_write(self.id, origin, self.holds_commit_lock())?;

        let name = mutation.name();
        let mut timeline = self.timeline.write();
        let effect = timeline.apply(mutation);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(var = %self.id, mutation = name, version, slices = timeline.len(), "timeline mutated");
        Ok(effect)
    }

    /// Detached copy of the timeline
    pub fn export(&self) -> TimelineArchive {
        let timeline = self.timeline.read();
        TimelineArchive {
            id: self.id,
            version: self.version(),
            slices: timeline.slices().to_vec().into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GuardConfig;
    use chrona_core::ChronaError;

    #[test]
    fn test_version_increases_on_every_write() {
        let guard = MutationGuard::new(GuardConfig::relaxed());
        let var = Variable::new(VarId(1), ValueSet::single(0));
        assert_eq!(var.version(), 0);

        var.mutate(&guard, WriteOrigin::Engine, Mutation::Append(ValueSet::single(1)))
            .unwrap();
        var.mutate(&guard, WriteOrigin::Engine, Mutation::UnifyAll).unwrap();

        assert_eq!(var.version(), 2);
        assert_eq!(var.current(), ValueSet::from([0, 1]));
    }

    #[test]
    fn test_strict_gateway_rejects_outside_context() {
        let guard = MutationGuard::default();
        let var = Variable::new(VarId(1), ValueSet::single(0));

        let result = var.mutate(&guard, WriteOrigin::Engine, Mutation::Append(ValueSet::single(1)));
        assert!(result.is_err());
        assert_eq!(var.version(), 0);
        assert_eq!(var.slice_count(), 1);
    }

    #[test]
    fn test_transaction_apply_under_commit_lock() {
        let guard = MutationGuard::default();
        let var = Variable::new(VarId(1), ValueSet::single(0));

        let lock = var.lock_for_commit();
        var.mutate(
            &guard,
            WriteOrigin::TransactionApply,
            Mutation::ReplaceLast(ValueSet::single(1)),
        )
        .unwrap();
        drop(lock);

        assert_eq!(var.current(), ValueSet::single(1));
        assert!(!var.is_commit_locked());
        assert!(!var.holds_commit_lock());
    }

    #[test]
    fn test_commit_lock_of_another_thread_does_not_authorise() {
        let guard = MutationGuard::new(GuardConfig::strict());
        let var = Arc::new(Variable::new(VarId(1), ValueSet::single(0)));
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let holder = {
            let var = Arc::clone(&var);
            thread::spawn(move || {
                let _lock = var.lock_for_commit();
                locked_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        };
        locked_rx.recv().unwrap();

        assert!(var.is_commit_locked());
        assert!(!var.holds_commit_lock());
        let result = var.mutate(
            &guard,
            WriteOrigin::TransactionApply,
            Mutation::Append(ValueSet::single(99)),
        );
        assert!(matches!(result, Err(ChronaError::UnsafeMutationContext { .. })));
        assert_eq!(var.current(), ValueSet::single(0));
        assert_eq!(var.version(), 0);

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(!var.is_commit_locked());
    }

    #[test]
    fn test_export_is_detached() {
        let guard = MutationGuard::new(GuardConfig::relaxed());
        let var = Variable::new(VarId(4), ValueSet::single(0));
        let archive = var.export();

        var.mutate(&guard, WriteOrigin::Engine, Mutation::Append(ValueSet::single(1)))
            .unwrap();

        assert_eq!(archive.slices.len(), 1);
        assert_eq!(archive.version, 0);
        assert_eq!(var.export().slices.len(), 2);
    }
}
