//! Reference scenarios
//!
//! - A: oscillator, `a = -a` from `-1`, converges to `{-1, 1}`
//! - B: residue class, `x = (x + 1) mod 3` from `0`, converges to `{0, 1, 2}`
//! - C: many concurrent `+1` transactions on one counter
//! - D: a nested transaction scope commits exactly once

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrona_core::{ChronaError, ChronaResult, ReversibleOp, ValueSet, VarId};
use chrona_runtime::{Runtime, RuntimeConfig};
use chrona_stm::{CommitOutcome, RetryPolicy, TelemetrySnapshot};
use chrona_time::{RunOptions, RunReport, RunScope};
use tracing::info;

/// Result of a convergence scenario
#[derive(Clone, Debug)]
pub struct ConvergenceOutcome {
    pub report: RunReport,
    /// Value set of the scenario variable after the run
    pub value: ValueSet,
    pub expected: ValueSet,
}

impl ConvergenceOutcome {
    pub fn passed(&self) -> bool {
        self.report.converged && self.value == self.expected
    }
}

/// Scenario A
pub fn oscillator(runtime: &Runtime) -> ChronaResult<ConvergenceOutcome> {
    let id = VarId(1);
    let report = runtime.run_convergence(
        move |scope: &RunScope<'_>| {
            let a = scope.var(id, -1)?;
            a.apply([ReversibleOp::Mul(-1)])?;
            scope.emit(format!("{a}"));
            Ok(())
        },
        RunOptions::default(),
    )?;

    Ok(ConvergenceOutcome {
        report,
        value: runtime.variable(id)?.get(),
        expected: ValueSet::from([-1, 1]),
    })
}

/// Scenario B, generalised to any positive modulus
pub fn residue_class(runtime: &Runtime, modulus: i64) -> ChronaResult<ConvergenceOutcome> {
    ReversibleOp::Mod(modulus).validate()?;
    let id = VarId(2);
    let report = runtime.run_convergence(
        move |scope: &RunScope<'_>| {
            let x = scope.var(id, 0)?;
            x.apply([ReversibleOp::Add(1), ReversibleOp::Mod(modulus)])?;
            scope.emit(format!("{x}"));
            Ok(())
        },
        RunOptions::default(),
    )?;

    Ok(ConvergenceOutcome {
        report,
        value: runtime.variable(id)?.get(),
        expected: (0..modulus).collect(),
    })
}

/// Result of scenario C
#[derive(Clone, Debug)]
pub struct ContentionOutcome {
    pub transactions: usize,
    pub final_value: Option<i64>,
    pub telemetry: TelemetrySnapshot,
    pub elapsed: Duration,
}

impl ContentionOutcome {
    /// Counter equals the number of transactions, and every transaction
    /// committed
    pub fn passed(&self) -> bool {
        self.final_value == Some(self.transactions as i64)
            && self.telemetry.commits.saturating_sub(self.telemetry.aborts)
                >= self.transactions as u64
    }
}

/// Scenario C: `transactions` threads each add 1 to a shared counter
pub fn shared_counter(
    runtime: Arc<Runtime>,
    transactions: usize,
    policy: RetryPolicy,
) -> ChronaResult<ContentionOutcome> {
    let counter = runtime.create_or_get_variable(VarId(3), 0)?;
    let started = Instant::now();

    let handles: Vec<_> = (0..transactions)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            let counter = counter.clone();
            let policy = policy.clone();
            thread::spawn(move || {
                runtime.run_transaction(|tx| tx.apply(&counter, [ReversibleOp::Add(1)]), &policy)
            })
        })
        .collect();

    for handle in handles {
        handle
            .join()
            .map_err(|_| ChronaError::InvalidOperation("contention thread panicked".to_string()))??;
    }

    Ok(ContentionOutcome {
        transactions,
        final_value: counter.value(),
        telemetry: runtime.telemetry_snapshot(),
        elapsed: started.elapsed(),
    })
}

/// Result of scenario D
#[derive(Clone, Debug)]
pub struct NestedOutcome {
    pub inner: CommitOutcome,
    pub outer: CommitOutcome,
    /// Ledger entries after the outer commit
    pub ledger_entries: usize,
    /// Re-submitting the outer commit id was ignored
    pub resubmit_ignored: bool,
    pub final_value: Option<i64>,
    pub commits: u64,
}

impl NestedOutcome {
    pub fn passed(&self) -> bool {
        self.inner == CommitOutcome::Flattened
            && matches!(self.outer, CommitOutcome::Committed { writes: 1, .. })
            && self.resubmit_ignored
            && self.commits == 1
    }
}

/// Releases a run claimed outside the scheduler
struct RunClaim<'a>(&'a Runtime);

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        self.0.registry().end_run();
    }
}

/// Scenario D: an inner scope opened while the outer transaction is live
/// flattens into it. Executed with ledger recording on, as inside a run.
pub fn nested_flattening(runtime: &Runtime) -> ChronaResult<NestedOutcome> {
    let x = runtime.create_or_get_variable(VarId(4), 10)?;
    let registry = Arc::clone(runtime.registry());

    registry.begin_run()?;
    let _claim = RunClaim(runtime);

    let mut tx = runtime.begin_transaction();
    tx.apply(&x, [ReversibleOp::Add(1)])?;
    let inner = tx.nested(|inner| {
        inner.apply(&x, [ReversibleOp::Mul(2)])?;
        runtime.commit(inner)
    })?;
    let outer = runtime.commit(&mut tx)?;

    let ledger_entries = registry.ledger_len();
    let resubmit_ignored = match outer {
        CommitOutcome::Committed { commit, .. } => {
            !registry.ledger().append_commit(commit, Vec::new())
                && registry.ledger_len() == ledger_entries
        }
        _ => false,
    };

    Ok(NestedOutcome {
        inner,
        outer,
        ledger_entries,
        resubmit_ignored,
        final_value: x.value(),
        commits: runtime.telemetry().commits(),
    })
}

/// One line of a scenario run
#[derive(Clone, Debug)]
pub struct ScenarioSummary {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl fmt::Display for ScenarioSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed { "PASS" } else { "FAIL" };
        write!(f, "[{status}] {}: {}", self.name, self.detail)
    }
}

/// Run A to D, each on a fresh runtime built from `config`
pub fn run_all(config: &RuntimeConfig) -> ChronaResult<Vec<ScenarioSummary>> {
    let mut summaries = Vec::with_capacity(4);

    let a = oscillator(&Runtime::new(config.clone())?)?;
    summaries.push(ScenarioSummary {
        name: "oscillator",
        passed: a.passed(),
        detail: format!("value {} after {} iterations", a.value, a.report.iterations),
    });

    let b = residue_class(&Runtime::new(config.clone())?, 3)?;
    summaries.push(ScenarioSummary {
        name: "residue-class",
        passed: b.passed(),
        detail: format!("value {} after {} iterations", b.value, b.report.iterations),
    });

    let policy = RetryPolicy::contended().with_max_attempts(10_000);
    let c = match shared_counter(Arc::new(Runtime::new(config.clone())?), 100, policy) {
        Ok(outcome) => ScenarioSummary {
            name: "contention",
            passed: outcome.passed(),
            detail: format!(
                "counter {:?}, {} retries in {:?}",
                outcome.final_value, outcome.telemetry.retries, outcome.elapsed
            ),
        },
        Err(ChronaError::TransactionAborted { attempts, reason }) => ScenarioSummary {
            name: "contention",
            passed: false,
            detail: format!("aborted after {attempts} attempts ({reason})"),
        },
        Err(err) => return Err(err),
    };
    summaries.push(c);

    let d = nested_flattening(&Runtime::new(config.clone())?)?;
    summaries.push(ScenarioSummary {
        name: "nested-flattening",
        passed: d.passed(),
        detail: format!("{} ledger entries, {} commit(s)", d.ledger_entries, d.commits),
    });

    for summary in &summaries {
        info!(%summary, "scenario finished");
    }
    Ok(summaries)
}
