//! Ledger and convergence fuzzer
//!
//! Tests:
//! - Half-cycle pops never cross a marker
//! - Random reversible-op blocks always finish a run with a clean registry
//! - Runs are deterministic for a given program

use std::collections::BTreeMap;
use std::sync::Arc;

use chrona_core::{ChronaResult, ReversibleOp, Value, ValueSet, VarId};
use chrona_state::{GuardConfig, LedgerEntry, Mutation, OperationLedger, Registry, Timeline};
use chrona_time::{ConvergenceScheduler, RunOptions, RunReport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Fuzzer configuration
#[derive(Clone, Debug)]
pub struct FuzzerConfig {
    /// Programs generated per run
    pub programs: usize,
    /// Variables a program may touch
    pub variables: u64,
    /// Statements per program
    pub max_statements: usize,
    /// Magnitude bound of generated constants
    pub max_constant: Value,
    /// Iteration cap handed to every run
    pub max_iterations: usize,
    /// Random seed
    pub seed: u64,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        FuzzerConfig {
            programs: 200,
            variables: 3,
            max_statements: 4,
            max_constant: 5,
            max_iterations: 16,
            seed: 42,
        }
    }
}

impl FuzzerConfig {
    /// Light fuzzing for quick tests
    pub fn light() -> Self {
        FuzzerConfig {
            programs: 40,
            ..Default::default()
        }
    }

    /// Heavy fuzzing for thorough testing
    pub fn heavy() -> Self {
        FuzzerConfig {
            programs: 5_000,
            variables: 6,
            max_statements: 8,
            max_iterations: 64,
            ..Default::default()
        }
    }
}

/// `var = ops(var)`, one line of a generated block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
    pub var: VarId,
    pub ops: Vec<ReversibleOp>,
}

/// A generated code block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Program {
    /// Bootstrap value of every variable the program touches
    pub initial: BTreeMap<VarId, Value>,
    pub statements: Vec<Statement>,
    pub options: RunOptions,
}

/// Outcome of one program
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramRun {
    pub report: RunReport,
    pub values: BTreeMap<VarId, ValueSet>,
}

/// A broken invariant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    pub program: usize,
    pub invariant: &'static str,
    pub detail: String,
}

/// Fuzzing result
#[derive(Clone, Debug, Default)]
pub struct FuzzResult {
    pub programs: usize,
    pub converged: usize,
    pub bailed: usize,
    pub violations: Vec<Violation>,
}

impl FuzzResult {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Convergence fuzzer
pub struct ReplayFuzzer {
    config: FuzzerConfig,
    rng: StdRng,
}

impl ReplayFuzzer {
    pub fn new(config: FuzzerConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        ReplayFuzzer { config, rng }
    }

    /// Generate a random op; constants are never zero
    fn generate_op(&mut self) -> ReversibleOp {
        let bound = self.config.max_constant.max(2);
        let mut k = self.rng.gen_range(1..=bound);
        if self.rng.gen_bool(0.5) {
            k = -k;
        }
        match self.rng.gen_range(0..7) {
            0 => ReversibleOp::Add(k),
            1 => ReversibleOp::Sub(k),
            2 => ReversibleOp::Mul(k),
            3 => ReversibleOp::Div(k),
            4 => ReversibleOp::Mod(k.abs()),
            5 => ReversibleOp::Neg,
            _ => ReversibleOp::Xor(k.abs()),
        }
    }

    /// Generate a random program
    pub fn generate_program(&mut self) -> Program {
        let variables = self.config.variables.max(1);
        let initial = (1..=variables)
            .map(|id| (VarId(id), self.rng.gen_range(-10..=10)))
            .collect();

        let count = self.rng.gen_range(1..=self.config.max_statements.max(1));
        let statements = (0..count)
            .map(|_| {
                let var = VarId(self.rng.gen_range(1..=variables));
                let ops = (0..self.rng.gen_range(1..=2)).map(|_| self.generate_op()).collect();
                Statement { var, ops }
            })
            .collect();

        let options = RunOptions {
            run_final_iteration: self.rng.gen_bool(0.8),
            unify_on_convergence: self.rng.gen_bool(0.8),
            bail_on_first_reverse_when_idle: self.rng.gen_bool(0.2),
            skip_first_forward: self.rng.gen_bool(0.1),
            max_iterations: Some(self.config.max_iterations),
        };

        Program {
            initial,
            statements,
            options,
        }
    }

    /// Run `program` on a fresh registry
    pub fn execute(program: &Program) -> ChronaResult<(ProgramRun, Arc<Registry>)> {
        let registry = Arc::new(Registry::new(GuardConfig::strict()));
        let mut scheduler = ConvergenceScheduler::new(Arc::clone(&registry));

        let report = scheduler.run(
            |scope| {
                for statement in &program.statements {
                    let init = program.initial.get(&statement.var).copied().unwrap_or(0);
                    let var = scope.var(statement.var, init)?;
                    var.apply(statement.ops.iter().copied())?;
                }
                Ok(())
            },
            &program.options,
        )?;

        let values = registry
            .variables()
            .iter()
            .map(|v| (v.id(), v.current()))
            .collect();
        Ok((ProgramRun { report, values }, registry))
    }

    /// Generate and run every program, collecting invariant violations
    pub fn run(&mut self) -> FuzzResult {
        let mut result = FuzzResult::default();

        for index in 0..self.config.programs {
            let program = self.generate_program();
            result.programs += 1;

            let (run, registry) = match Self::execute(&program) {
                Ok(outcome) => outcome,
                Err(err) => {
                    result.violations.push(Violation {
                        program: index,
                        invariant: "run-succeeds",
                        detail: err.to_string(),
                    });
                    continue;
                }
            };

            if run.report.converged {
                result.converged += 1;
            }
            if run.report.bailed {
                result.bailed += 1;
            }
            result
                .violations
                .extend(Self::check_invariants(index, &program, &run, &registry));

            match Self::execute(&program) {
                Ok((again, _)) if again == run => {}
                Ok(_) => result.violations.push(Violation {
                    program: index,
                    invariant: "deterministic",
                    detail: format!("{program:?}"),
                }),
                Err(err) => result.violations.push(Violation {
                    program: index,
                    invariant: "run-succeeds",
                    detail: err.to_string(),
                }),
            }
        }

        debug!(
            programs = result.programs,
            converged = result.converged,
            violations = result.violations.len(),
            "replay fuzzing finished"
        );
        result
    }

    fn check_invariants(
        index: usize,
        program: &Program,
        run: &ProgramRun,
        registry: &Registry,
    ) -> Vec<Violation> {
        let mut violations = Vec::new();
        let mut violate = |invariant: &'static str, detail: String| {
            violations.push(Violation {
                program: index,
                invariant,
                detail,
            })
        };

        if registry.is_run_active() {
            violate("run-released", String::new());
        }
        if registry.ledger_len() != 0 {
            violate("ledger-cleared", format!("{} entries left", registry.ledger_len()));
        }
        for variable in registry.variables() {
            if variable.slice_count() != 1 {
                violate(
                    "single-slice",
                    format!("{} has {} slices", variable.id(), variable.slice_count()),
                );
            }
            if variable.current().is_empty() {
                violate("non-empty", format!("{} is empty", variable.id()));
            }
        }
        if run.report.iterations > program.options.iteration_cap() {
            violate("iteration-cap", format!("{} iterations", run.report.iterations));
        }
        if run.report.converged && run.report.bailed {
            violate("converged-xor-bailed", String::new());
        }
        if run.report.final_pass && !program.options.run_final_iteration {
            violate("final-pass-optional", String::new());
        }
        if run.report.converged != registry.is_converged() {
            violate(
                "converged-flag",
                format!("report {} registry {}", run.report.converged, registry.is_converged()),
            );
        }
        violations
    }
}

/// Ledger fuzzing: random entries and markers, then half-cycle pops
pub struct LedgerFuzzer {
    rng: StdRng,
}

impl LedgerFuzzer {
    pub fn new(seed: u64) -> Self {
        LedgerFuzzer {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn random_entry(&mut self) -> LedgerEntry {
        let var = VarId(self.rng.gen_range(1..=4));
        match self.rng.gen_range(0..3) {
            0 => LedgerEntry::Append {
                var,
                added: ValueSet::single(self.rng.gen_range(-5..=5)),
            },
            1 => LedgerEntry::Reversible {
                var,
                op: ReversibleOp::Add(self.rng.gen_range(1..=5)),
            },
            _ => LedgerEntry::Replace {
                var,
                added: ValueSet::single(self.rng.gen_range(-5..=5)),
                replaced: vec![ValueSet::single(0)],
            },
        }
    }

    /// Build a ledger of `len` operations and pop every half-cycle, checking
    /// each pop against a shadow stack. Returns the number of violations.
    pub fn run(&mut self, len: usize) -> usize {
        let mut ledger = OperationLedger::new();
        let mut shadow: Vec<Vec<LedgerEntry>> = Vec::new();
        let mut leading: Vec<LedgerEntry> = Vec::new();

        for _ in 0..len {
            if self.rng.gen_bool(0.2) {
                ledger.push_marker();
                shadow.push(Vec::new());
            } else {
                let entry = self.random_entry();
                ledger.push(entry.clone());
                match shadow.last_mut() {
                    Some(half_cycle) => half_cycle.push(entry),
                    None => leading.push(entry),
                }
            }
        }

        let mut violations = 0;
        while let Some(mut expected) = shadow.pop() {
            expected.reverse();
            let markers = ledger.marker_count();
            if ledger.pop_half_cycle() != expected || ledger.marker_count() + 1 != markers {
                violations += 1;
            }
        }

        leading.reverse();
        if ledger.pop_half_cycle() != leading || !ledger.is_empty() {
            violations += 1;
        }
        violations
    }
}

/// Property-based test helpers
pub mod properties {
    use super::*;

    /// Property: unification is idempotent
    pub fn unify_idempotent(bootstrap: &ValueSet, slices: &[ValueSet]) -> bool {
        let mut timeline = Timeline::new(bootstrap.clone());
        for slice in slices {
            timeline.apply(Mutation::Append(slice.clone()));
        }
        timeline.apply(Mutation::UnifyAll);
        let once = timeline.clone();
        timeline.apply(Mutation::UnifyAll);
        timeline == once && timeline.len() == 1
    }

    /// Property: an op undoes cleanly. Integer division only round-trips
    /// from the inverse side; modulus has no inverse.
    pub fn op_round_trip(op: ReversibleOp, x: Value) -> bool {
        match op {
            ReversibleOp::Mod(_) => op.inverse(op.forward(x)) == op.forward(x),
            ReversibleOp::Mul(_) => op.inverse(op.forward(x)) == x,
            ReversibleOp::Div(_) => op.forward(op.inverse(x)) == x,
            _ => op.inverse(op.forward(x)) == x && op.forward(op.inverse(x)) == x,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fuzzer_light() {
        let mut fuzzer = ReplayFuzzer::new(FuzzerConfig::light());
        let result = fuzzer.run();

        assert_eq!(result.programs, 40);
        assert!(result.is_valid(), "{:?}", result.violations);
    }

    #[test]
    fn test_program_generation_is_seeded() {
        let mut a = ReplayFuzzer::new(FuzzerConfig::default());
        let mut b = ReplayFuzzer::new(FuzzerConfig::default());
        for _ in 0..10 {
            let program = a.generate_program();
            assert_eq!(program, b.generate_program());
            for statement in &program.statements {
                for op in &statement.ops {
                    assert!(op.validate().is_ok(), "{op}");
                }
            }
        }
    }

    #[test]
    fn test_execute_known_program() {
        let program = Program {
            initial: [(VarId(1), -1)].into_iter().collect(),
            statements: vec![Statement {
                var: VarId(1),
                ops: vec![ReversibleOp::Neg],
            }],
            options: RunOptions::default(),
        };
        let (run, _) = ReplayFuzzer::execute(&program).unwrap();
        assert!(run.report.converged);
        assert_eq!(run.values[&VarId(1)], ValueSet::from([-1, 1]));
    }

    #[test]
    fn test_ledger_fuzzer() {
        for seed in 0..20 {
            assert_eq!(LedgerFuzzer::new(seed).run(200), 0, "seed {seed}");
        }
    }

    proptest! {
        #[test]
        fn prop_unify_idempotent(
            bootstrap in prop::collection::vec(-20i64..20, 1..4),
            slices in prop::collection::vec(prop::collection::vec(-20i64..20, 1..4), 0..6),
        ) {
            let bootstrap: ValueSet = bootstrap.into_iter().collect();
            let slices: Vec<ValueSet> = slices.into_iter().map(|s| s.into_iter().collect()).collect();
            prop_assert!(properties::unify_idempotent(&bootstrap, &slices));
        }

        #[test]
        fn prop_op_round_trip(x in -1_000_000_000i64..1_000_000_000, k in 1i64..1_000, negate in any::<bool>()) {
            let k = if negate { -k } else { k };
            for op in [
                ReversibleOp::Add(k),
                ReversibleOp::Sub(k),
                ReversibleOp::Mul(k),
                ReversibleOp::Div(k),
                ReversibleOp::Mod(k.abs()),
                ReversibleOp::Neg,
                ReversibleOp::Xor(k),
            ] {
                prop_assert!(properties::op_round_trip(op, x), "{op} at {x}");
            }
        }
    }
}
