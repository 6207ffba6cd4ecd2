//! EDL Runtime – interpreter and process supervisor for an experiment-description language
//!
//! This crate implements:
//! - A flat, index-linked program buffer built from the token stream
//! - Control-flow linking of loops, conditionals, `break`/`next` and `else` chains
//! - A side-effect-free syntax check, a simulated test run and a real run sharing one dispatcher
//! - Isolation of the real run in a worker process with a started/finished/permission-to-die handshake
//! - A plugin registry for instrument modules and their life-cycle hooks

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runner configuration
pub mod config;

/// Device modules and their life-cycle hooks
pub mod device;

/// Diagnostic severities and counts
pub mod diagnostics;

/// Error taxonomy
pub mod error;

/// The load → check → test → run pipeline
pub mod experiment;

/// Token dispatcher and the three execution phases
pub mod interpreter;

/// Worker process supervision
pub mod orchestrator;

/// Program buffer, lexer, store and linker
pub mod program;

// Re-export key types for convenience
pub use config::RunnerConfig;
pub use error::{Error, Result};
pub use experiment::{Execution, Experiment, compile};
pub use orchestrator::{Orchestrator, RunOutcome, RunReport};

/// Current version of the EDL runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version for supervisor/worker communication
pub const PROTOCOL_VERSION: &str = "1.0.0";
