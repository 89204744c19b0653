//! RunScope - what a code block sees while it executes

use std::cell::RefCell;
use std::sync::Arc;

use chrona_core::{ChronaResult, TimeDirection, ValueSet, VarId};
use chrona_state::{Registry, Var};

/// Execution context handed to the block on every forward execution
pub struct RunScope<'a> {
    registry: &'a Arc<Registry>,
    output: &'a RefCell<Vec<String>>,
    iteration: usize,
    final_pass: bool,
}

impl<'a> RunScope<'a> {
    pub(crate) fn new(
        registry: &'a Arc<Registry>,
        output: &'a RefCell<Vec<String>>,
        iteration: usize,
        final_pass: bool,
    ) -> Self {
        RunScope {
            registry,
            output,
            iteration,
            final_pass,
        }
    }

    /// Create or fetch a variable and enrol it in the run
    pub fn var(&self, id: VarId, initial: impl Into<ValueSet>) -> ChronaResult<Var> {
        self.registry.create_or_get(id, initial)
    }

    /// Capture an output line. Only the lines of the last execution are
    /// reported.
    pub fn emit(&self, line: impl Into<String>) {
        self.output.borrow_mut().push(line.into());
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn direction(&self) -> TimeDirection {
        self.registry.direction()
    }

    pub fn is_final_pass(&self) -> bool {
        self.final_pass
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.registry
    }
}
