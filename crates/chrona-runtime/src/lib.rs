//! Chrona Runtime - public surface of the engine
//!
//! This crate wires the lower layers together:
//! - `Coordinator`: single-writer worker that runs convergence blocks in FIFO order
//! - `Runtime`: variables, transactions, convergence runs and telemetry behind one handle
//! - `RuntimeConfig`: configuration with environment overrides
//! - `observability`: `tracing-subscriber` initialisation

pub mod config;
pub mod coordinator;
pub mod observability;
pub mod runtime;

pub use config::*;
pub use coordinator::*;
pub use observability::{init_logging, LogFormat, LoggingConfig};
pub use runtime::*;
