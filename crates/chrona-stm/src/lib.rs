//! Chrona STM - Transactional mutation gateway
//!
//! Optimistic, versioned transactions over registry variables:
//! - Explicit transaction handles with flat nesting
//! - Ascending-id lock order at commit, read-only fast path
//! - Retry with exponential backoff and jitter
//! - Post-commit hooks and timeline archival
//! - Contention telemetry and hotspot mitigation

pub mod backoff;
pub mod gateway;
pub mod hooks;
pub mod telemetry;
pub mod transaction;

pub use backoff::*;
pub use gateway::*;
pub use hooks::*;
pub use telemetry::*;
pub use transaction::*;
