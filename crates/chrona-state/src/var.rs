//! Var - the handle user code holds on a variable
//!
//! Writes made through a handle take the direct engine path: they are only
//! accepted inside a convergence run (or the coordinator) when the guard is
//! strict. Concurrent callers go through the STM gateway instead.

use std::fmt;
use std::sync::Arc;

use chrona_core::{ChronaResult, ReversibleOp, Value, ValueSet, VarId};

use crate::{LedgerEntry, Mutation, Registry, Timeline, TimelineArchive, Variable};

/// Shared handle to a registered variable
#[derive(Clone)]
pub struct Var {
    variable: Arc<Variable>,
    registry: Arc<Registry>,
}

impl Var {
    pub(crate) fn new(variable: Arc<Variable>, registry: Arc<Registry>) -> Self {
        Var { variable, registry }
    }

    #[inline]
    pub fn id(&self) -> VarId {
        self.variable.id()
    }

    /// Current value set
    pub fn get(&self) -> ValueSet {
        self.variable.current()
    }

    /// The single value, if the current slice holds exactly one
    pub fn value(&self) -> Option<Value> {
        self.variable.current().as_single()
    }

    pub fn version(&self) -> u64 {
        self.variable.version()
    }

    pub fn timeline(&self) -> Timeline {
        self.variable.timeline()
    }

    pub fn is_converged(&self) -> bool {
        self.variable.is_converged()
    }

    pub fn variable(&self) -> &Arc<Variable> {
        &self.variable
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn export(&self) -> TimelineArchive {
        self.variable.export()
    }

    /// Push a new slice
    pub fn assign(&self, value: impl Into<ValueSet>) -> ChronaResult<()> {
        self.registry
            .direct_write(&self.variable, Mutation::Append(value.into()), Vec::new())
    }

    /// Overwrite the current slice without growing the timeline
    pub fn replace(&self, value: impl Into<ValueSet>) -> ChronaResult<()> {
        self.registry
            .direct_write(&self.variable, Mutation::ReplaceLast(value.into()), Vec::new())
    }

    /// Apply reversible operations, in order, to every current value and
    /// push the result. Each operation is logged so reverse replay can
    /// reconstruct what a prior read must have produced.
    pub fn apply(&self, ops: impl IntoIterator<Item = ReversibleOp>) -> ChronaResult<ValueSet> {
        let ops = ops
            .into_iter()
            .map(ReversibleOp::validate)
            .collect::<ChronaResult<Vec<_>>>()?;

        let next = self
            .variable
            .current()
            .map(|x| ops.iter().fold(x, |acc, op| op.forward(acc)));

        let id = self.id();
        let logged = ops
            .iter()
            .map(|&op| LedgerEntry::Reversible { var: id, op })
            .collect();
        self.registry
            .direct_write(&self.variable, Mutation::Append(next.clone()), logged)?;
        Ok(next)
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Var")
            .field("id", &self.id())
            .field("current", &self.get())
            .field("version", &self.version())
            .finish()
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.id(), self.get())
    }
}
