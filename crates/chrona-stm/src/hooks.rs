//! Post-commit hooks
//!
//! Hooks run after the locks of a commit are released. They are diagnostics
//! and archival, not part of the transaction: a failing hook is logged and
//! the commit still stands.

use std::collections::VecDeque;
use std::sync::Arc;

use chrona_core::{ChronaResult, CommitId, TxnId, VarId};
use chrona_state::{TimelineArchive, Variable};
use parking_lot::Mutex;

/// What a hook sees of a finished commit
#[derive(Clone, Debug)]
pub struct CommitRecord {
    pub commit: CommitId,
    pub txn: TxnId,
    /// Variables written, ascending id order
    pub written: Vec<Arc<Variable>>,
}

impl CommitRecord {
    pub fn written_ids(&self) -> Vec<VarId> {
        self.written.iter().map(|v| v.id()).collect()
    }
}

/// Called once per successful writing commit
pub trait CommitHook: Send + Sync {
    fn after_commit(&self, record: &CommitRecord) -> ChronaResult<()>;
}

impl<F> CommitHook for F
where
    F: Fn(&CommitRecord) -> ChronaResult<()> + Send + Sync,
{
    fn after_commit(&self, record: &CommitRecord) -> ChronaResult<()> {
        self(record)
    }
}

/// Keeps detached timeline copies of recently written variables
#[derive(Debug)]
pub struct ArchiveHook {
    capacity: usize,
    archives: Mutex<VecDeque<TimelineArchive>>,
}

impl ArchiveHook {
    pub fn new(capacity: usize) -> Self {
        ArchiveHook {
            capacity: capacity.max(1),
            archives: Mutex::new(VecDeque::new()),
        }
    }

    /// Archives oldest first
    pub fn archives(&self) -> Vec<TimelineArchive> {
        self.archives.lock().iter().cloned().collect()
    }

    /// Newest archive of `var`
    pub fn latest(&self, var: VarId) -> Option<TimelineArchive> {
        self.archives.lock().iter().rev().find(|a| a.id == var).cloned()
    }

    pub fn len(&self) -> usize {
        self.archives.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.lock().is_empty()
    }
}

impl Default for ArchiveHook {
    fn default() -> Self {
        Self::new(256)
    }
}

impl CommitHook for ArchiveHook {
    fn after_commit(&self, record: &CommitRecord) -> ChronaResult<()> {
        let mut archives = self.archives.lock();
        for variable in &record.written {
            if archives.len() == self.capacity {
                archives.pop_front();
            }
            archives.push_back(variable.export());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrona_core::ValueSet;

    fn record(ids: &[u64]) -> CommitRecord {
        CommitRecord {
            commit: CommitId(1),
            txn: TxnId(1),
            written: ids
                .iter()
                .map(|id| Arc::new(Variable::new(VarId(*id), ValueSet::single(*id as i64))))
                .collect(),
        }
    }

    #[test]
    fn test_archive_hook_is_bounded() {
        let hook = ArchiveHook::new(2);
        hook.after_commit(&record(&[1, 2, 3])).unwrap();

        assert_eq!(hook.len(), 2);
        assert!(hook.latest(VarId(1)).is_none());
        assert_eq!(
            hook.latest(VarId(3)).map(|a| a.slices.to_vec()),
            Some(vec![ValueSet::single(3)])
        );
    }

    #[test]
    fn test_closure_hook() {
        let hook = |record: &CommitRecord| -> ChronaResult<()> {
            assert_eq!(record.written_ids(), vec![VarId(4)]);
            Ok(())
        };
        assert!(hook.after_commit(&record(&[4])).is_ok());
    }
}
