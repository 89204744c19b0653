//! Contention simulator - seeded random transfers over a shared pool
//!
//! Every thread draws its transactions from its own `StdRng`, so the
//! workload is reproducible even though the interleaving is not. Transfers
//! move an amount between two variables; the pool total must survive any
//! interleaving, retry pattern or abort.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrona_core::{ChronaError, ChronaResult, ReversibleOp, VarId};
use chrona_runtime::{Runtime, RuntimeConfig};
use chrona_state::Var;
use chrona_stm::{RetryPolicy, TelemetrySnapshot};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Simulator configuration
#[derive(Clone, Debug)]
pub struct ContentionConfig {
    /// Worker threads
    pub threads: usize,
    /// Transactions issued by each thread
    pub transactions_per_thread: usize,
    /// Size of the shared variable pool
    pub variables: usize,
    /// Starting value of every variable
    pub initial_balance: i64,
    /// Largest amount moved by one transfer
    pub max_amount: i64,
    /// Probability that a transaction only reads (0.0 - 1.0)
    pub read_only_prob: f64,
    pub policy: RetryPolicy,
    /// Random seed
    pub seed: u64,
}

impl Default for ContentionConfig {
    fn default() -> Self {
        ContentionConfig {
            threads: 8,
            transactions_per_thread: 200,
            variables: 16,
            initial_balance: 1_000,
            max_amount: 50,
            read_only_prob: 0.2,
            policy: RetryPolicy::contended().with_max_attempts(1_000),
            seed: 42,
        }
    }
}

impl ContentionConfig {
    /// Quick run for unit tests
    pub fn light() -> Self {
        ContentionConfig {
            threads: 4,
            transactions_per_thread: 50,
            variables: 8,
            ..Default::default()
        }
    }

    /// Few variables, many writers
    pub fn hotspot() -> Self {
        ContentionConfig {
            threads: 16,
            transactions_per_thread: 100,
            variables: 2,
            read_only_prob: 0.0,
            policy: RetryPolicy::contended().with_max_attempts(100_000),
            ..Default::default()
        }
    }

    /// Long run over a larger pool
    pub fn heavy() -> Self {
        ContentionConfig {
            threads: 32,
            transactions_per_thread: 1_000,
            variables: 64,
            ..Default::default()
        }
    }
}

/// One generated transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimOp {
    /// Move `amount` from `from` to `to`
    Transfer { from: usize, to: usize, amount: i64 },
    /// Read every variable and sum them
    Audit,
}

/// Simulation result
#[derive(Clone, Debug)]
pub struct ContentionResult {
    pub committed: u64,
    pub aborted: u64,
    pub audits: u64,
    /// Audits whose sum differed from the pool total
    pub torn_audits: u64,
    pub total_before: i64,
    pub total_after: i64,
    pub elapsed: Duration,
    pub telemetry: TelemetrySnapshot,
}

impl ContentionResult {
    /// Pool total conserved and every audit saw a consistent snapshot
    pub fn is_valid(&self) -> bool {
        self.total_before == self.total_after && self.torn_audits == 0
    }

    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.committed as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Default)]
struct ThreadTally {
    committed: u64,
    aborted: u64,
    audits: u64,
    torn_audits: u64,
}

/// Contention simulator
pub struct ContentionSimulator {
    config: ContentionConfig,
    runtime: Arc<Runtime>,
    pool: Arc<Vec<Var>>,
}

impl ContentionSimulator {
    /// Simulator on a fresh default runtime
    pub fn new(config: ContentionConfig) -> ChronaResult<Self> {
        Self::with_runtime(config, Arc::new(Runtime::new(RuntimeConfig::default())?))
    }

    pub fn with_runtime(config: ContentionConfig, runtime: Arc<Runtime>) -> ChronaResult<Self> {
        if config.variables < 2 {
            return Err(ChronaError::Config(
                "contention pool needs at least two variables".to_string(),
            ));
        }
        let pool = (0..config.variables)
            .map(|i| runtime.create_or_get_variable(VarId(i as u64 + 1), config.initial_balance))
            .collect::<ChronaResult<Vec<_>>>()?;

        Ok(ContentionSimulator {
            config,
            runtime,
            pool: Arc::new(pool),
        })
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// The workload of one thread
    pub fn workload(config: &ContentionConfig, thread_index: usize) -> Vec<SimOp> {
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(thread_index as u64));
        (0..config.transactions_per_thread)
            .map(|_| {
                if rng.gen::<f64>() < config.read_only_prob {
                    return SimOp::Audit;
                }
                let from = rng.gen_range(0..config.variables);
                let mut to = rng.gen_range(0..config.variables - 1);
                if to >= from {
                    to += 1;
                }
                SimOp::Transfer {
                    from,
                    to,
                    amount: rng.gen_range(1..=config.max_amount.max(1)),
                }
            })
            .collect()
    }

    /// Run every thread's workload to completion
    pub fn run(&self) -> ChronaResult<ContentionResult> {
        let total_before = self.pool_total();
        let started = Instant::now();

        let handles: Vec<_> = (0..self.config.threads)
            .map(|index| {
                let runtime = Arc::clone(&self.runtime);
                let pool = Arc::clone(&self.pool);
                let config = self.config.clone();
                thread::Builder::new()
                    .name(format!("contention-{index}"))
                    .spawn(move || Self::drive(&runtime, &pool, &config, index, total_before))
                    .map_err(|e| ChronaError::InvalidOperation(format!("spawn failed: {e}")))
            })
            .collect::<ChronaResult<_>>()?;

        let mut tally = ThreadTally::default();
        for handle in handles {
            let thread_tally = handle.join().map_err(|_| {
                ChronaError::InvalidOperation("contention thread panicked".to_string())
            })??;
            tally.committed += thread_tally.committed;
            tally.aborted += thread_tally.aborted;
            tally.audits += thread_tally.audits;
            tally.torn_audits += thread_tally.torn_audits;
        }

        let result = ContentionResult {
            committed: tally.committed,
            aborted: tally.aborted,
            audits: tally.audits,
            torn_audits: tally.torn_audits,
            total_before,
            total_after: self.pool_total(),
            elapsed: started.elapsed(),
            telemetry: self.runtime.telemetry_snapshot(),
        };
        debug!(
            committed = result.committed,
            aborted = result.aborted,
            retries = result.telemetry.retries,
            "contention simulation finished"
        );
        Ok(result)
    }

    fn drive(
        runtime: &Runtime,
        pool: &[Var],
        config: &ContentionConfig,
        index: usize,
        expected_total: i64,
    ) -> ChronaResult<ThreadTally> {
        let mut tally = ThreadTally::default();
        for op in Self::workload(config, index) {
            let result = match op {
                SimOp::Transfer { from, to, amount } => runtime
                    .run_transaction(
                        |tx| {
                            tx.apply(&pool[from], [ReversibleOp::Sub(amount)])?;
                            tx.apply(&pool[to], [ReversibleOp::Add(amount)])?;
                            Ok(())
                        },
                        &config.policy,
                    )
                    .map(|()| None),
                SimOp::Audit => runtime
                    .run_transaction(
                        |tx| {
                            let mut sum = 0i64;
                            for var in pool {
                                sum += tx.read(var)?.iter().sum::<i64>();
                            }
                            Ok(sum)
                        },
                        &config.policy,
                    )
                    .map(Some),
            };

            match result {
                Ok(audit) => {
                    tally.committed += 1;
                    if let Some(sum) = audit {
                        tally.audits += 1;
                        if sum != expected_total {
                            tally.torn_audits += 1;
                        }
                    }
                }
                Err(ChronaError::TransactionAborted { .. }) => tally.aborted += 1,
                Err(err) => return Err(err),
            }
        }
        Ok(tally)
    }

    fn pool_total(&self) -> i64 {
        self.pool.iter().map(|var| var.get().iter().sum::<i64>()).sum()
    }
}
