//! Chrona Bench - shared fixtures for the criterion benches
//!
//! - `StmFixture`: a gateway over a pool of counters
//! - `transfer_plan`: seeded transfer workload
//! - `converge`: one convergence run of a reversible-op block

use std::sync::Arc;

use chrona_core::{ChronaResult, ReversibleOp, VarId};
use chrona_state::{GuardConfig, Registry, Var};
use chrona_stm::{RetryPolicy, Stm, Telemetry, DEFAULT_TOP_N};
use chrona_time::{ConvergenceScheduler, RunOptions, RunReport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Gateway plus a pool of counters starting at zero
pub struct StmFixture {
    pub stm: Stm,
    pub vars: Vec<Var>,
}

impl StmFixture {
    pub fn new(variables: usize) -> ChronaResult<Self> {
        let registry = Arc::new(Registry::new(GuardConfig::default()));
        let stm = Stm::new(Arc::clone(&registry), Arc::new(Telemetry::new(DEFAULT_TOP_N)));
        let vars = (1..=variables as u64)
            .map(|id| registry.create_or_get(VarId(id), 0))
            .collect::<ChronaResult<_>>()?;
        Ok(StmFixture { stm, vars })
    }

    /// Move `amount` between two pool entries in one transaction
    pub fn transfer(&self, from: usize, to: usize, amount: i64) -> ChronaResult<()> {
        self.stm.atomically(&RetryPolicy::contended(), |tx| {
            tx.apply(&self.vars[from], [ReversibleOp::Sub(amount)])?;
            tx.apply(&self.vars[to], [ReversibleOp::Add(amount)])?;
            Ok(())
        })
    }

    /// Read every pool entry in one read-only transaction
    pub fn audit(&self) -> ChronaResult<i64> {
        self.stm.atomically(&RetryPolicy::contended(), |tx| {
            let mut sum = 0;
            for var in &self.vars {
                sum += tx.read(var)?.iter().sum::<i64>();
            }
            Ok(sum)
        })
    }
}

/// Seeded `(from, to, amount)` transfers over `variables` entries
pub fn transfer_plan(seed: u64, count: usize, variables: usize) -> Vec<(usize, usize, i64)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let from = rng.gen_range(0..variables);
            let to = (from + rng.gen_range(1..variables.max(2))) % variables;
            (from, to, rng.gen_range(1..=10))
        })
        .collect()
}

/// Converge `x = ops(x)` from `init` on a fresh registry
pub fn converge(init: i64, ops: &[ReversibleOp], options: &RunOptions) -> ChronaResult<RunReport> {
    let registry = Arc::new(Registry::new(GuardConfig::default()));
    let mut scheduler = ConvergenceScheduler::new(registry);
    scheduler.run(
        |scope| {
            scope.var(VarId(1), init)?.apply(ops.iter().copied())?;
            Ok(())
        },
        options,
    )
}
