//! Runtime - the engine behind one handle

use std::sync::Arc;

use chrona_core::{ChronaError, ChronaResult, ValueSet, VarId};
use chrona_state::{Registry, Var};
use chrona_stm::{
    CommitHook, CommitOutcome, HotspotAggregator, Mitigation, MitigationStrategy, RetryPolicy, Stm,
    Telemetry, TelemetrySnapshot, Transaction,
};
use chrona_time::{RunOptions, RunReport, RunScope};
use parking_lot::RwLock;
use tracing::info;

use crate::{Coordinator, RuntimeConfig};

/// Variables, transactions, convergence runs and telemetry of one engine
/// instance
pub struct Runtime {
    config: RuntimeConfig,
    registry: Arc<Registry>,
    telemetry: Arc<Telemetry>,
    stm: Stm,
    coordinator: Coordinator,
    mitigation: RwLock<HotspotAggregator>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> ChronaResult<Self> {
        config.validate()?;
        let registry = Arc::new(Registry::new(config.guard.clone()));
        let telemetry = Arc::new(Telemetry::new(config.hotspot_top_n));
        let stm = Stm::new(Arc::clone(&registry), Arc::clone(&telemetry));
        let coordinator = Coordinator::start(Arc::clone(&registry), &config.coordinator)?;

        info!(
            strict = config.guard.strict,
            max_attempts = config.retry.max_attempts,
            queue = config.coordinator.queue_capacity,
            "runtime started"
        );

        Ok(Runtime {
            config,
            registry,
            telemetry,
            stm,
            coordinator,
            mitigation: RwLock::new(HotspotAggregator::new()),
        })
    }

    /// Runtime configured from `CHRONA_*` environment variables
    pub fn from_env() -> ChronaResult<Self> {
        Self::new(RuntimeConfig::from_env()?)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn stm(&self) -> &Stm {
        &self.stm
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Create the variable on first reference, otherwise return it
    pub fn create_or_get_variable(
        &self,
        id: VarId,
        initial: impl Into<ValueSet>,
    ) -> ChronaResult<Var> {
        self.registry.create_or_get(id, initial)
    }

    pub fn variable(&self, id: VarId) -> ChronaResult<Var> {
        self.registry.get(id)
    }

    /// Run `block` to a fixed point on the coordinator thread
    pub fn run_convergence<B>(&self, block: B, options: RunOptions) -> ChronaResult<RunReport>
    where
        B: FnMut(&RunScope<'_>) -> ChronaResult<()> + Send + 'static,
    {
        self.coordinator.submit(block, options)
    }

    pub async fn run_convergence_async<B>(
        &self,
        block: B,
        options: RunOptions,
    ) -> ChronaResult<RunReport>
    where
        B: FnMut(&RunScope<'_>) -> ChronaResult<()> + Send + 'static,
    {
        self.coordinator.submit_async(block, options).await
    }

    /// Run `body` atomically, retrying conflicts according to `policy`
    pub fn run_transaction<R>(
        &self,
        body: impl FnMut(&mut Transaction) -> ChronaResult<R>,
        policy: &RetryPolicy,
    ) -> ChronaResult<R> {
        self.stm.atomically(policy, body)
    }

    /// [`run_transaction`](Self::run_transaction) with the configured policy
    pub fn transact<R>(&self, body: impl FnMut(&mut Transaction) -> ChronaResult<R>) -> ChronaResult<R> {
        self.stm.atomically(&self.config.retry, body)
    }

    /// Open a transaction for manual commit
    pub fn begin_transaction(&self) -> Transaction {
        self.stm.begin()
    }

    pub fn commit(&self, tx: &mut Transaction) -> ChronaResult<CommitOutcome> {
        self.stm.commit(tx)
    }

    /// Wait until every queued convergence run has finished
    pub fn flush_coordinator(&self) -> ChronaResult<()> {
        self.coordinator.flush()
    }

    pub fn add_commit_hook(&self, hook: Arc<dyn CommitHook>) {
        self.stm.add_hook(hook);
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Human-readable contention report
    pub fn telemetry_report(&self) -> String {
        self.telemetry.report()
    }

    pub fn telemetry_json(&self) -> ChronaResult<String> {
        serde_json::to_string_pretty(&self.telemetry.snapshot())
            .map_err(|e| ChronaError::InvalidOperation(format!("telemetry export: {e}")))
    }

    pub fn add_mitigation_strategy(&self, strategy: Box<dyn MitigationStrategy>) {
        self.mitigation.write().add_strategy(strategy);
    }

    /// Run every registered mitigation strategy against current telemetry
    pub fn evaluate_hotspots(&self) -> Vec<Mitigation> {
        self.mitigation.read().evaluate(&self.telemetry)
    }

    /// Wait for queued runs, then destroy every variable and its history
    pub fn teardown(&self) -> ChronaResult<()> {
        self.coordinator.flush()?;
        self.registry.teardown();
        info!("runtime torn down");
        Ok(())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("variables", &self.registry.len())
            .field("coordinator", &self.coordinator)
            .field("commits", &self.telemetry.commits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrona_core::{AbortReason, ReversibleOp};
    use chrona_state::GuardConfig;
    use chrona_stm::{ArchiveHook, CommitRecord, PromoteToSingleWriter};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn test_create_or_get_returns_same_variable() {
        let rt = runtime();
        let a = rt.create_or_get_variable(VarId(1), 5).unwrap();
        let b = rt.create_or_get_variable(VarId(1), 99).unwrap();
        assert_eq!(b.value(), Some(5));
        assert!(Arc::ptr_eq(a.variable(), b.variable()));
        assert!(matches!(
            rt.variable(VarId(2)),
            Err(ChronaError::VariableNotFound(VarId(2)))
        ));
    }

    #[test]
    fn test_run_convergence_oscillator() {
        let rt = runtime();
        let report = rt
            .run_convergence(
                |scope: &RunScope<'_>| {
                    let a = scope.var(VarId(1), -1)?;
                    a.apply([ReversibleOp::Mul(-1)])?;
                    scope.emit(format!("{a}"));
                    Ok(())
                },
                RunOptions::default(),
            )
            .unwrap();

        assert!(report.converged);
        assert_eq!(
            rt.variable(VarId(1)).unwrap().get(),
            ValueSet::from([-1, 1])
        );
    }

    #[test]
    fn test_direct_write_outside_engine_rejected() {
        let rt = runtime();
        let x = rt.create_or_get_variable(VarId(1), 0).unwrap();
        assert!(matches!(
            x.assign(1),
            Err(ChronaError::UnsafeMutationContext { .. })
        ));
        assert_eq!(x.value(), Some(0));
    }

    #[test]
    fn test_parallel_increments_are_exact() {
        let rt = Arc::new(runtime());
        let counter = rt.create_or_get_variable(VarId(1), 0).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let rt = Arc::clone(&rt);
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        rt.run_transaction(
                            |tx| tx.apply(&counter, [ReversibleOp::Add(1)]),
                            &RetryPolicy::contended().with_max_attempts(10_000),
                        )
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.value(), Some(400));
        assert_eq!(rt.telemetry().commits(), 400);
        assert!(rt.telemetry_report().contains("=== Transaction Telemetry ==="));
    }

    #[test]
    fn test_transact_uses_configured_policy() {
        let config = RuntimeConfig {
            retry: RetryPolicy::no_retry(),
            ..RuntimeConfig::default()
        };
        let rt = Runtime::new(config).unwrap();
        let x = rt.create_or_get_variable(VarId(1), 0).unwrap();

        let result: ChronaResult<()> =
            rt.transact(|_tx| Err(ChronaError::ValidationConflict { var: x.id() }));
        assert!(matches!(
            result,
            Err(ChronaError::TransactionAborted {
                attempts: 1,
                reason: AbortReason::RetriesExhausted
            })
        ));
        assert_eq!(rt.telemetry().aborts(), 1);
    }

    #[test]
    fn test_hooks_and_archives() {
        let rt = runtime();
        let archive = Arc::new(ArchiveHook::new(8));
        let calls = Arc::new(AtomicUsize::new(0));
        rt.add_commit_hook(archive.clone());
        {
            let calls = Arc::clone(&calls);
            rt.add_commit_hook(Arc::new(move |_: &CommitRecord| -> ChronaResult<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        let x = rt.create_or_get_variable(VarId(4), 1).unwrap();
        rt.transact(|tx| tx.write(&x, 2)).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let latest = archive.latest(VarId(4)).unwrap();
        assert_eq!(latest.slices.last(), Some(&ValueSet::single(2)));
    }

    #[test]
    fn test_manual_commit() {
        let rt = runtime();
        let x = rt.create_or_get_variable(VarId(1), 3).unwrap();

        let mut tx = rt.begin_transaction();
        assert_eq!(tx.read(&x).unwrap(), ValueSet::single(3));
        assert_eq!(rt.commit(&mut tx).unwrap(), CommitOutcome::ReadOnly);
        assert!(tx.is_finished());
    }

    #[test]
    fn test_telemetry_json_export() {
        let rt = runtime();
        let x = rt.create_or_get_variable(VarId(9), 0).unwrap();
        rt.transact(|tx| tx.write(&x, 1)).unwrap();

        let json = rt.telemetry_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_object());
        assert!(json.contains("\"commits\": 1"));
    }

    #[test]
    fn test_mitigation_strategy_sees_contention() {
        let rt = runtime();
        rt.add_mitigation_strategy(Box::new(PromoteToSingleWriter::new(1, 0.0)));
        let x = rt.create_or_get_variable(VarId(1), 0).unwrap();
        rt.transact(|tx| tx.write(&x, 1)).unwrap();

        let mitigations = rt.evaluate_hotspots();
        assert_eq!(mitigations.len(), 1);
        assert_eq!(mitigations[0].var, VarId(1));
    }

    #[test]
    fn test_teardown_destroys_variables() {
        let rt = runtime();
        rt.create_or_get_variable(VarId(1), 0).unwrap();
        rt.teardown().unwrap();
        assert!(rt.registry().is_empty());
    }

    #[test]
    fn test_run_rejected_while_transaction_open() {
        let rt = Runtime::new(RuntimeConfig {
            guard: GuardConfig::strict(),
            ..RuntimeConfig::default()
        })
        .unwrap();
        let tx = rt.begin_transaction();

        // The coordinator thread is exempt from the active-transaction check
        let report = rt
            .run_convergence(|_scope: &RunScope<'_>| Ok(()), RunOptions::default())
            .unwrap();
        assert!(report.converged);
        drop(tx);

        let mut scheduler = chrona_time::ConvergenceScheduler::new(Arc::clone(rt.registry()));
        let _open = rt.begin_transaction();
        assert!(matches!(
            scheduler.run(|_| Ok(()), &RunOptions::default()),
            Err(ChronaError::UnsafeMutationContext { .. })
        ));
    }

    #[test]
    fn test_deadline_bounds_retries() {
        let rt = runtime();
        let policy = RetryPolicy::default()
            .with_max_attempts(u32::MAX)
            .with_deadline(Duration::from_millis(20));
        let result: ChronaResult<()> = rt.run_transaction(
            |_| Err(ChronaError::ValidationConflict { var: VarId(1) }),
            &policy,
        );
        assert!(matches!(
            result,
            Err(ChronaError::TransactionAborted {
                reason: AbortReason::DeadlineExceeded,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_run_convergence_async() {
        let rt = runtime();
        let report = rt
            .run_convergence_async(
                |scope: &RunScope<'_>| {
                    scope.var(VarId(1), 0)?.apply([ReversibleOp::Add(1), ReversibleOp::Mod(3)])?;
                    Ok(())
                },
                RunOptions::default(),
            )
            .await
            .unwrap();

        assert!(report.converged);
        assert_eq!(report.iterations, 4);
        assert_eq!(
            rt.variable(VarId(1)).unwrap().get(),
            ValueSet::from([0, 1, 2])
        );
    }
}
