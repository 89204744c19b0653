//! Timeline - the ordered slices of one variable
//!
//! Slice 0 is the bootstrap value set. The timeline is never empty. Next to
//! the slices it keeps the ever-seen domain: every value any slice has held
//! since the domain was last collapsed, including slices later undone.

use chrona_core::ValueSet;
use serde::Serialize;

/// One change to a timeline
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    /// Push a new slice
    Append(ValueSet),
    /// Overwrite the current slice in place
    ReplaceLast(ValueSet),
    /// Keep slice 0, discard everything after it, then append
    ReplaceForwardHistory(ValueSet),
    /// Timeline becomes exactly `[slice]`
    OverwriteBootstrap(ValueSet),
    /// Collapse every slice and the domain into one slice
    UnifyAll,
    /// Timeline becomes `[current]` and the domain is collapsed to it
    Rebase,
    /// Domain becomes the current slice
    CollapseDomain,
    /// Undo of a snapshot entry: drop `remove` slices from the end, then put
    /// `reinstate` back
    Restore {
        remove: usize,
        reinstate: Vec<ValueSet>,
    },
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::Append(_) => "append",
            Mutation::ReplaceLast(_) => "replace-last",
            Mutation::ReplaceForwardHistory(_) => "replace-forward-history",
            Mutation::OverwriteBootstrap(_) => "overwrite-bootstrap",
            Mutation::UnifyAll => "unify-all",
            Mutation::Rebase => "rebase",
            Mutation::CollapseDomain => "collapse-domain",
            Mutation::Restore { .. } => "restore",
        }
    }
}

/// What a mutation did, in the shape the ledger needs to undo it
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MutationEffect {
    /// Slice pushed on top, if any
    pub added: Option<ValueSet>,
    /// Slices removed from the end, oldest first
    pub replaced: Vec<ValueSet>,
}

/// Ordered sequence of value-set slices
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Timeline {
    slices: Vec<ValueSet>,
    domain: ValueSet,
    unified: bool,
}

impl Timeline {
    /// Create a timeline holding only the bootstrap slice
    pub fn new(bootstrap: ValueSet) -> Self {
        Timeline {
            domain: bootstrap.clone(),
            slices: vec![bootstrap],
            unified: false,
        }
    }

    /// Bootstrap slice (slice 0)
    pub fn bootstrap(&self) -> &ValueSet {
        &self.slices[0]
    }

    /// Current slice (the last one)
    pub fn current(&self) -> &ValueSet {
        &self.slices[self.slices.len() - 1]
    }

    pub fn slices(&self) -> &[ValueSet] {
        &self.slices
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// Always false; kept for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Every value observed since the domain was last collapsed
    pub fn domain(&self) -> &ValueSet {
        &self.domain
    }

    pub fn is_unified(&self) -> bool {
        self.unified
    }

    /// A single slice is stable; otherwise some earlier slice must equal the
    /// current one
    pub fn is_converged(&self) -> bool {
        let (current, earlier) = match self.slices.split_last() {
            Some(parts) => parts,
            None => return true,
        };
        earlier.is_empty() || earlier.iter().any(|slice| slice == current)
    }

    /// Apply a mutation. The timeline is never left empty.
    pub fn apply(&mut self, mutation: Mutation) -> MutationEffect {
        match mutation {
            Mutation::Append(slice) => {
                self.observe(&slice);
                self.slices.push(slice.clone());
                self.unified = false;
                MutationEffect {
                    added: Some(slice),
                    replaced: Vec::new(),
                }
            }
            Mutation::ReplaceLast(slice) => {
                self.observe(&slice);
                let last = self.slices.len() - 1;
                let replaced = std::mem::replace(&mut self.slices[last], slice.clone());
                self.unified = false;
                MutationEffect {
                    added: Some(slice),
                    replaced: vec![replaced],
                }
            }
            Mutation::ReplaceForwardHistory(slice) => {
                self.observe(&slice);
                let replaced = self.slices.split_off(1);
                self.slices.push(slice.clone());
                self.unified = false;
                MutationEffect {
                    added: Some(slice),
                    replaced,
                }
            }
            Mutation::OverwriteBootstrap(slice) => {
                self.observe(&slice);
                let replaced = std::mem::replace(&mut self.slices, vec![slice.clone()]);
                self.unified = false;
                MutationEffect {
                    added: Some(slice),
                    replaced,
                }
            }
            Mutation::UnifyAll => {
                let mut merged = self.domain.clone();
                for slice in &self.slices {
                    merged.extend(slice.iter());
                }
                let replaced = std::mem::replace(&mut self.slices, vec![merged.clone()]);
                self.domain = merged.clone();
                self.unified = true;
                MutationEffect {
                    added: Some(merged),
                    replaced,
                }
            }
            Mutation::Rebase => {
                let current = self.current().clone();
                let replaced = std::mem::replace(&mut self.slices, vec![current.clone()]);
                self.domain = current.clone();
                MutationEffect {
                    added: Some(current),
                    replaced,
                }
            }
            Mutation::CollapseDomain => {
                self.domain = self.current().clone();
                MutationEffect::default()
            }
            Mutation::Restore { remove, reinstate } => {
                let remaining = self.slices.len().saturating_sub(remove);
                if remaining + reinstate.len() == 0 {
                    return MutationEffect::default();
                }
                let replaced = self.slices.split_off(remaining);
                self.slices.extend(reinstate);
                self.unified = false;
                MutationEffect {
                    added: None,
                    replaced,
                }
            }
        }
    }

    fn observe(&mut self, slice: &ValueSet) {
        self.domain.extend(slice.iter());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_timeline() {
        let t = Timeline::new(ValueSet::single(-1));
        assert_eq!(t.len(), 1);
        assert_eq!(t.current(), &ValueSet::single(-1));
        assert_eq!(t.bootstrap(), t.current());
        assert!(t.is_converged());
    }

    #[test]
    fn test_append_and_convergence() {
        let mut t = Timeline::new(ValueSet::single(0));
        t.apply(Mutation::Append(ValueSet::single(1)));
        assert!(!t.is_converged());

        t.apply(Mutation::Append(ValueSet::from([1, 0])));
        assert!(!t.is_converged());

        t.apply(Mutation::Append(ValueSet::from([0, 1])));
        assert!(t.is_converged());
    }

    #[test]
    fn test_replace_last_reports_replaced() {
        let mut t = Timeline::new(ValueSet::single(0));
        t.apply(Mutation::Append(ValueSet::single(1)));
        let effect = t.apply(Mutation::ReplaceLast(ValueSet::single(2)));

        assert_eq!(effect.replaced, vec![ValueSet::single(1)]);
        assert_eq!(t.slices(), &[ValueSet::single(0), ValueSet::single(2)]);
        assert_eq!(t.domain(), &ValueSet::from([0, 1, 2]));
    }

    #[test]
    fn test_replace_forward_history_keeps_bootstrap() {
        let mut t = Timeline::new(ValueSet::single(0));
        t.apply(Mutation::Append(ValueSet::single(1)));
        t.apply(Mutation::Append(ValueSet::single(2)));
        let effect = t.apply(Mutation::ReplaceForwardHistory(ValueSet::single(9)));

        assert_eq!(effect.replaced, vec![ValueSet::single(1), ValueSet::single(2)]);
        assert_eq!(t.slices(), &[ValueSet::single(0), ValueSet::single(9)]);
    }

    #[test]
    fn test_overwrite_bootstrap() {
        let mut t = Timeline::new(ValueSet::single(0));
        t.apply(Mutation::Append(ValueSet::single(1)));
        let effect = t.apply(Mutation::OverwriteBootstrap(ValueSet::single(5)));

        assert_eq!(effect.replaced.len(), 2);
        assert_eq!(t.slices(), &[ValueSet::single(5)]);
    }

    #[test]
    fn test_restore_undoes_replace() {
        let mut t = Timeline::new(ValueSet::single(0));
        t.apply(Mutation::Append(ValueSet::single(1)));
        let effect = t.apply(Mutation::ReplaceForwardHistory(ValueSet::single(7)));

        t.apply(Mutation::Restore {
            remove: 1,
            reinstate: effect.replaced,
        });
        assert_eq!(t.slices(), &[ValueSet::single(0), ValueSet::single(1)]);
    }

    #[test]
    fn test_restore_never_empties() {
        let mut t = Timeline::new(ValueSet::single(3));
        t.apply(Mutation::Restore {
            remove: 1,
            reinstate: Vec::new(),
        });
        assert_eq!(t.len(), 1);
        assert_eq!(t.current(), &ValueSet::single(3));
    }

    #[test]
    fn test_unify_includes_undone_values() {
        let mut t = Timeline::new(ValueSet::single(-1));
        t.apply(Mutation::Append(ValueSet::single(1)));
        t.apply(Mutation::Restore {
            remove: 1,
            reinstate: Vec::new(),
        });
        t.apply(Mutation::Append(ValueSet::single(-1)));
        t.apply(Mutation::UnifyAll);

        assert!(t.is_unified());
        assert_eq!(t.slices(), &[ValueSet::from([-1, 1])]);
    }

    #[test]
    fn test_rebase_and_collapse() {
        let mut t = Timeline::new(ValueSet::single(0));
        t.apply(Mutation::Append(ValueSet::single(4)));
        t.apply(Mutation::Rebase);
        assert_eq!(t.slices(), &[ValueSet::single(4)]);
        assert_eq!(t.domain(), &ValueSet::single(4));

        t.apply(Mutation::Append(ValueSet::single(5)));
        t.apply(Mutation::CollapseDomain);
        assert_eq!(t.domain(), &ValueSet::single(5));
        assert_eq!(t.len(), 2);
    }

    fn slices_strategy() -> impl Strategy<Value = Vec<Vec<i64>>> {
        prop::collection::vec(prop::collection::vec(-5i64..5, 1..4), 0..6)
    }

    proptest! {
        #[test]
        fn unify_is_idempotent(bootstrap in -5i64..5, slices in slices_strategy()) {
            let mut t = Timeline::new(ValueSet::single(bootstrap));
            for slice in slices {
                t.apply(Mutation::Append(ValueSet::from(slice)));
            }

            t.apply(Mutation::UnifyAll);
            let once = t.clone();
            t.apply(Mutation::UnifyAll);

            prop_assert_eq!(t.slices(), once.slices());
            prop_assert_eq!(t.len(), 1);
            prop_assert!(t.is_unified());
        }

        #[test]
        fn timeline_never_empty(ops in prop::collection::vec(0u8..6, 0..20)) {
            let mut t = Timeline::new(ValueSet::single(0));
            for (i, op) in ops.into_iter().enumerate() {
                let slice = ValueSet::single(i as i64);
                let mutation = match op {
                    0 => Mutation::Append(slice),
                    1 => Mutation::ReplaceLast(slice),
                    2 => Mutation::ReplaceForwardHistory(slice),
                    3 => Mutation::OverwriteBootstrap(slice),
                    4 => Mutation::UnifyAll,
                    _ => Mutation::Restore { remove: 2, reinstate: Vec::new() },
                };
                t.apply(mutation);
                prop_assert!(t.len() >= 1);
            }
        }
    }
}
