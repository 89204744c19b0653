//! Chrona Time - Convergence scheduler
//!
//! This crate drives convergence runs:
//! - Forward executions of the code block, one half-cycle each
//! - Reverse half-cycles replayed from the ledger
//! - Fixed-point detection, unification and the final pass
//! - Probe mode and the idle bail

pub mod options;
pub mod scheduler;
pub mod scope;

pub use options::*;
pub use scheduler::*;
pub use scope::*;
