//! Run options and run report

/// Iteration cap when unification is requested
pub const UNIFY_ITERATION_CAP: usize = 1000;

/// Iteration cap without unification
pub const PLAIN_ITERATION_CAP: usize = 2;

/// Options of one convergence run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOptions {
    /// Execute the block once more after the loop
    pub run_final_iteration: bool,
    /// Collapse every variable to the union of its values on convergence
    pub unify_on_convergence: bool,
    /// Give up when a reverse half-cycle finds nothing to replay
    pub bail_on_first_reverse_when_idle: bool,
    /// Probe mode: skip the very first forward half-cycle
    pub skip_first_forward: bool,
    /// Overrides the default iteration cap
    pub max_iterations: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            run_final_iteration: true,
            unify_on_convergence: true,
            bail_on_first_reverse_when_idle: false,
            skip_first_forward: false,
            max_iterations: None,
        }
    }
}

impl RunOptions {
    /// No unification and the short iteration cap
    pub fn plain() -> Self {
        RunOptions {
            unify_on_convergence: false,
            ..Default::default()
        }
    }

    /// Let variables register before anything is read, and stop early when
    /// nothing happens
    pub fn probe() -> Self {
        RunOptions {
            skip_first_forward: true,
            bail_on_first_reverse_when_idle: true,
            ..Default::default()
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn iteration_cap(&self) -> usize {
        self.max_iterations.unwrap_or(if self.unify_on_convergence {
            UNIFY_ITERATION_CAP
        } else {
            PLAIN_ITERATION_CAP
        })
    }
}

/// Outcome of a convergence run. A run that never reaches a fixed point is
/// reported here, not as an error.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Fixed point reached
    pub converged: bool,
    /// Loop iterations executed (half-cycles, skipped probe included)
    pub iterations: usize,
    /// Stopped by the idle bail
    pub bailed: bool,
    /// The final pass was executed
    pub final_pass: bool,
    /// Lines emitted by the last execution of the block
    pub output: Vec<String>,
}
