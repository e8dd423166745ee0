//! Data model, configuration and session persistence for duet.
//!
//! - **types**: Task, TaskAction, TaskResult, TaskRecord, ExecutionHandle and
//!   the failure taxonomy
//! - **session**: Session and its bounded context summary
//! - **session_store**: the only owner of Sessions; file-backed or in-memory
//! - **config**: TOML configuration with validation

pub mod config;
pub mod session;
pub mod session_store;
pub mod types;

pub use config::{Config, ConfigError};
pub use session::Session;
pub use session_store::{SessionStore, SessionStoreError};
pub use types::{
    DeliveryState, ExecutionHandle, Failure, FailureKind, SessionId, Task, TaskAction, TaskError,
    TaskRecord, TaskResult, TokenUsage,
};
