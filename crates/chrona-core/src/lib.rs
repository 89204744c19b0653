//! Chrona Core - Fundamental types and primitives
//!
//! This crate defines the core types used throughout Chrona:
//! - Identifiers (VarId, TxnId, CommitId)
//! - Value sets (the multi-valued container a variable holds)
//! - Reversible operations with forward and inverse maps
//! - Time direction (entropy sign)
//! - The error taxonomy

pub mod error;
pub mod id;
pub mod op;
pub mod time;
pub mod value;

pub use error::*;
pub use id::*;
pub use op::*;
pub use time::*;
pub use value::*;
