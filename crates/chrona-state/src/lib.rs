//! Chrona State - timelines, ledger and reverse replay
//!
//! This crate owns everything a convergence run mutates:
//! - Timelines of value-set slices (`Timeline`, `Variable`)
//! - The mutation guard enforcing safe write contexts
//! - The runtime registry (variables, entropy sign, run state)
//! - The operation ledger with half-cycle markers
//! - The reversal replayer

pub mod guard;
pub mod ledger;
pub mod registry;
pub mod replay;
pub mod timeline;
pub mod var;
pub mod variable;

pub use guard::*;
pub use ledger::*;
pub use registry::*;
pub use replay::*;
pub use timeline::*;
pub use var::*;
pub use variable::*;
