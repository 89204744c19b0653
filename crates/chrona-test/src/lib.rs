//! Chrona Test Harness - Scenario runners and randomized validation
//!
//! This crate provides:
//! - Reference scenarios (oscillator, residue class, contention, nested flattening)
//! - Seeded contention simulation over a shared variable pool
//! - Ledger and convergence-run fuzzing
//! - Property helpers for reversible ops and timeline unification

pub mod contention;
pub mod fuzzer;
pub mod scenarios;

pub use contention::*;
pub use fuzzer::*;
pub use scenarios::*;
