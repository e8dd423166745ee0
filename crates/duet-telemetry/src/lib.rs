//! Logging set-up for duet binaries and tests.
//!
//! Everything in the engine logs through `tracing` with structured fields;
//! this crate only decides where those events go and in which format.

pub mod logging;

pub use logging::{init, init_logging, init_logging_json, LogFormat};
