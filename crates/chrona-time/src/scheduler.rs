//! Convergence scheduler
//!
//! Alternates forward executions of a code block with reverse replays of
//! the ledger until every variable the block touches reaches a fixed point,
//! then runs the block once more so observable effects reflect only the
//! converged state.
//!
//! States: `Idle -> Forward <-> Reverse -> Converged -> FinalPass -> Idle`

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrona_core::{ChronaResult, TimeDirection, ValueSet, VarId};
use chrona_state::{undo_from, Mutation, Registry, ReversalReplayer, WriteOrigin};
use tracing::{debug, info, trace, warn};

use crate::{RunOptions, RunReport, RunScope};

/// Scheduler state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    ForwardHalfCycle,
    ReverseHalfCycle,
    Converged,
    FinalPass,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::ForwardHalfCycle => "forward",
            SchedulerState::ReverseHalfCycle => "reverse",
            SchedulerState::Converged => "converged",
            SchedulerState::FinalPass => "final-pass",
        };
        f.write_str(name)
    }
}

/// Releases the registry on every exit path
struct ActiveRun<'a> {
    registry: &'a Registry,
}

impl<'a> ActiveRun<'a> {
    fn claim(registry: &'a Registry) -> ChronaResult<Self> {
        registry.guard().check_run_start()?;
        registry.begin_run()?;
        Ok(ActiveRun { registry })
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.registry.end_run();
    }
}

/// Drives convergence runs against one registry. Not reentrant: one run at
/// a time per registry.
#[derive(Debug)]
pub struct ConvergenceScheduler {
    registry: Arc<Registry>,
    state: SchedulerState,
    runs: u64,
}

impl ConvergenceScheduler {
    pub fn new(registry: Arc<Registry>) -> Self {
        ConvergenceScheduler {
            registry,
            state: SchedulerState::Idle,
            runs: 0,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Completed runs
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Run `block` to a fixed point
    pub fn run<B>(&mut self, mut block: B, options: &RunOptions) -> ChronaResult<RunReport>
    where
        B: FnMut(&RunScope<'_>) -> ChronaResult<()>,
    {
        let registry = Arc::clone(&self.registry);
        let active = ActiveRun::claim(&registry)?;

        let result = self.drive(&mut block, options);
        self.state = SchedulerState::Idle;
        drop(active);

        if result.is_ok() {
            self.runs += 1;
        }
        result
    }

    fn drive<B>(&mut self, block: &mut B, options: &RunOptions) -> ChronaResult<RunReport>
    where
        B: FnMut(&RunScope<'_>) -> ChronaResult<()>,
    {
        let registry = Arc::clone(&self.registry);
        let cap = options.iteration_cap();
        let output = RefCell::new(Vec::new());
        let mut snapshots: BTreeMap<VarId, ValueSet> = BTreeMap::new();
        let mut report = RunReport::default();
        let mut forward_runs = 0usize;

        debug!(cap, unify = options.unify_on_convergence, "convergence run started");

        for iteration in 0..cap {
            report.iterations = iteration + 1;
            registry.clear_write();
            let direction = registry.direction();

            if direction.is_forward() {
                if iteration == 0 && options.skip_first_forward {
                    trace!("probe: first forward half-cycle skipped");
                } else {
                    self.state = SchedulerState::ForwardHalfCycle;
                    registry.ledger().push_marker();
                    output.borrow_mut().clear();
                    block(&RunScope::new(&registry, &output, iteration, false))?;
                    forward_runs += 1;
                }
            } else {
                self.state = SchedulerState::ReverseHalfCycle;
                ReversalReplayer::new(&registry).reverse_half_cycle(&snapshots)?;

                if options.bail_on_first_reverse_when_idle && !registry.saw_write() {
                    info!(iteration, "reverse half-cycle was idle, bailing");
                    report.bailed = true;
                    break;
                }
            }

            trace!(iteration, %direction, ledger = registry.ledger_len(), "half-cycle done");

            if forward_runs > 0 && direction.is_reverse() && registry.all_converged() {
                registry.ledger().clear();
                if options.unify_on_convergence {
                    self.unify_participants()?;
                }
                registry.set_converged(true);
                report.converged = true;
                self.state = SchedulerState::Converged;
                info!(iterations = report.iterations, "fixed point reached");
                break;
            }

            if registry.flip_direction().is_reverse() {
                snapshots = registry.snapshot_participants();
            }
        }

        if !report.converged && !report.bailed {
            warn!(iterations = report.iterations, "iteration cap reached without a fixed point");
        }

        let fallback = !report.converged && !report.bailed && options.unify_on_convergence;
        if options.run_final_iteration && (report.converged || fallback) {
            self.final_pass(block, &output, report.iterations, report.converged)?;
            report.final_pass = true;
        }

        self.cleanup()?;
        report.output = output.into_inner();
        Ok(report)
    }

    /// Undo the last forward half-cycle, then execute the block once in
    /// forward time
    fn final_pass<B>(
        &mut self,
        block: &mut B,
        output: &RefCell<Vec<String>>,
        iteration: usize,
        converged: bool,
    ) -> ChronaResult<()>
    where
        B: FnMut(&RunScope<'_>) -> ChronaResult<()>,
    {
        let registry = Arc::clone(&self.registry);
        self.state = SchedulerState::FinalPass;

        if registry.ledger().marker_count() > 0 {
            let popped = registry.ledger().pop_half_cycle();
            let undone = undo_from(&popped, registry.guard(), |id| registry.variable(id))?;
            trace!(undone, "last forward half-cycle undone");
        }

        registry.set_direction(TimeDirection::Forward);
        output.borrow_mut().clear();
        registry.ledger().push_marker();
        block(&RunScope::new(&registry, output, iteration, true))?;
        registry.set_converged(converged);
        debug!(converged, "final pass done");
        Ok(())
    }

    fn unify_participants(&self) -> ChronaResult<()> {
        for variable in self.registry.participants() {
            variable.mutate(self.registry.guard(), WriteOrigin::Engine, Mutation::UnifyAll)?;
        }
        Ok(())
    }

    /// Clear the ledger, re-unify anything the final pass grew and collapse
    /// every domain to its current slice
    fn cleanup(&self) -> ChronaResult<()> {
        let guard = self.registry.guard();
        self.registry.ledger().clear();
        for variable in self.registry.participants() {
            if variable.slice_count() > 1 {
                variable.mutate(guard, WriteOrigin::Engine, Mutation::UnifyAll)?;
            }
            variable.mutate(guard, WriteOrigin::Engine, Mutation::CollapseDomain)?;
        }
        Ok(())
    }
}
