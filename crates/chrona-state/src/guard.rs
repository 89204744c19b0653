//! Mutation guard - who may write a timeline, and when
//!
//! In strict mode a timeline mutation is accepted only when it is a
//! transactional apply holding the variable's commit lock, or when it runs on
//! the thread that owns the active convergence run, or on the coordinator's
//! worker thread. The same flag is checked in debug and release builds.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use chrona_core::{ChronaError, ChronaResult, VarId};
use parking_lot::RwLock;
use tracing::warn;

/// Where a timeline write comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOrigin {
    /// Applied by an STM commit on the thread holding the variable's commit lock
    TransactionApply,
    /// Direct path used by the scheduler, the replayer and code blocks
    Engine,
}

/// Guard configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardConfig {
    /// Reject writes outside a safe context
    pub strict: bool,
    /// Verify ascending lock order on every multi-variable commit
    pub paranoid_lock_order: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        GuardConfig {
            strict: true,
            paranoid_lock_order: false,
        }
    }
}

impl GuardConfig {
    /// Every check enabled
    pub fn strict() -> Self {
        GuardConfig {
            strict: true,
            paranoid_lock_order: true,
        }
    }

    /// No context checks; misuse silently corrupts history
    pub fn relaxed() -> Self {
        GuardConfig {
            strict: false,
            paranoid_lock_order: false,
        }
    }
}

/// Tracks privileged contexts and active transactions
#[derive(Debug)]
pub struct MutationGuard {
    strict: AtomicBool,
    paranoid_lock_order: AtomicBool,
    engine_thread: RwLock<Option<ThreadId>>,
    coordinator_thread: RwLock<Option<ThreadId>>,
    active_transactions: AtomicUsize,
}

impl MutationGuard {
    pub fn new(config: GuardConfig) -> Self {
        MutationGuard {
            strict: AtomicBool::new(config.strict),
            paranoid_lock_order: AtomicBool::new(config.paranoid_lock_order),
            engine_thread: RwLock::new(None),
            coordinator_thread: RwLock::new(None),
            active_transactions: AtomicUsize::new(0),
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict.load(Ordering::Acquire)
    }

    pub fn set_strict(&self, strict: bool) {
        self.strict.store(strict, Ordering::Release);
    }

    pub fn paranoid_lock_order(&self) -> bool {
        self.paranoid_lock_order.load(Ordering::Acquire)
    }

    pub fn set_paranoid_lock_order(&self, enabled: bool) {
        self.paranoid_lock_order.store(enabled, Ordering::Release);
    }

    /// Mark the calling thread as the owner of the active run
    pub fn enter_engine(&self) {
        *self.engine_thread.write() = Some(thread::current().id());
    }

    pub fn leave_engine(&self) {
        *self.engine_thread.write() = None;
    }

    /// True when the calling thread owns the active run
    pub fn is_engine_thread(&self) -> bool {
        *self.engine_thread.read() == Some(thread::current().id())
    }

    /// Tag the calling thread as the coordinator's privileged worker
    pub fn register_coordinator(&self) {
        *self.coordinator_thread.write() = Some(thread::current().id());
    }

    pub fn unregister_coordinator(&self) {
        *self.coordinator_thread.write() = None;
    }

    pub fn is_coordinator_thread(&self) -> bool {
        *self.coordinator_thread.read() == Some(thread::current().id())
    }

    /// Engine or coordinator context
    pub fn is_privileged(&self) -> bool {
        self.is_engine_thread() || self.is_coordinator_thread()
    }

    pub fn transaction_started(&self) {
        self.active_transactions.fetch_add(1, Ordering::AcqRel);
    }

    pub fn transaction_finished(&self) {
        self.active_transactions.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn active_transactions(&self) -> usize {
        self.active_transactions.load(Ordering::Acquire)
    }

    /// Check a timeline write. `lock_held` reports whether the calling
    /// thread holds the variable's commit lock.
    pub fn check_write(&self, var: VarId, origin: WriteOrigin, lock_held: bool) -> ChronaResult<()> {
        if !self.is_strict() {
            return Ok(());
        }

        let allowed = match origin {
            WriteOrigin::TransactionApply => lock_held,
            WriteOrigin::Engine => self.is_privileged(),
        };

        if allowed {
            Ok(())
        } else {
            let context = match origin {
                WriteOrigin::TransactionApply => "transactional apply without the commit lock",
                WriteOrigin::Engine => "direct write outside the engine and coordinator context",
            };
            warn!(%var, context, "rejected timeline mutation");
            Err(ChronaError::UnsafeMutationContext {
                var: Some(var),
                context: context.to_string(),
            })
        }
    }

    /// Check that a convergence run may start on the calling thread
    pub fn check_run_start(&self) -> ChronaResult<()> {
        if !self.is_strict() {
            return Ok(());
        }

        let active = self.active_transactions();
        if active > 0 && !self.is_coordinator_thread() {
            warn!(active, "convergence run requested while transactions are active");
            return Err(ChronaError::UnsafeMutationContext {
                var: None,
                context: format!("convergence run started with {active} active transactions"),
            });
        }
        Ok(())
    }

    /// Check that locks are taken in strictly ascending id order
    pub fn check_lock_order(&self, previous: Option<VarId>, next: VarId) -> ChronaResult<()> {
        if !self.paranoid_lock_order() {
            return Ok(());
        }
        match previous {
            Some(previous) if previous >= next => {
                Err(ChronaError::LockOrderingViolation { previous, next })
            }
            _ => Ok(()),
        }
    }
}

impl Default for MutationGuard {
    fn default() -> Self {
        Self::new(GuardConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_rejects_unprivileged_engine_write() {
        let guard = MutationGuard::new(GuardConfig::strict());
        let err = guard.check_write(VarId(1), WriteOrigin::Engine, false);
        assert!(matches!(err, Err(ChronaError::UnsafeMutationContext { .. })));

        guard.enter_engine();
        assert!(guard.check_write(VarId(1), WriteOrigin::Engine, false).is_ok());
        guard.leave_engine();
    }

    #[test]
    fn test_transaction_apply_requires_lock() {
        let guard = MutationGuard::default();
        assert!(guard
            .check_write(VarId(1), WriteOrigin::TransactionApply, false)
            .is_err());
        assert!(guard
            .check_write(VarId(1), WriteOrigin::TransactionApply, true)
            .is_ok());
    }

    #[test]
    fn test_relaxed_allows_everything() {
        let guard = MutationGuard::new(GuardConfig::relaxed());
        assert!(guard.check_write(VarId(1), WriteOrigin::Engine, false).is_ok());
        guard.transaction_started();
        assert!(guard.check_run_start().is_ok());
    }

    #[test]
    fn test_run_start_with_active_transactions() {
        let guard = MutationGuard::default();
        guard.transaction_started();
        assert!(guard.check_run_start().is_err());

        guard.register_coordinator();
        assert!(guard.check_run_start().is_ok());
        guard.unregister_coordinator();

        guard.transaction_finished();
        assert!(guard.check_run_start().is_ok());
    }

    #[test]
    fn test_engine_thread_is_per_thread() {
        let guard = std::sync::Arc::new(MutationGuard::default());
        guard.enter_engine();

        let other = std::sync::Arc::clone(&guard);
        let privileged_elsewhere = std::thread::spawn(move || other.is_engine_thread())
            .join()
            .unwrap();

        assert!(guard.is_engine_thread());
        assert!(!privileged_elsewhere);
    }

    #[test]
    fn test_lock_order_check() {
        let guard = MutationGuard::new(GuardConfig::strict());
        assert!(guard.check_lock_order(None, VarId(1)).is_ok());
        assert!(guard.check_lock_order(Some(VarId(1)), VarId(2)).is_ok());
        assert!(matches!(
            guard.check_lock_order(Some(VarId(2)), VarId(1)),
            Err(ChronaError::LockOrderingViolation { .. })
        ));

        let lenient = MutationGuard::default();
        assert!(lenient.check_lock_order(Some(VarId(2)), VarId(1)).is_ok());
    }
}
