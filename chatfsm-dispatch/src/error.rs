//! Dispatch error types.

use crate::config::ConfigError;
use chatfsm_core::CoreError;
use thiserror::Error;

/// Dispatch errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A committed envelope was no longer queued.
    #[error("message {seq} is not queued")]
    NotQueued { seq: u64 },

    #[error("dispatcher is closed")]
    Closed,

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// A worker task panicked or was cancelled.
    #[error("worker {slot} aborted: {reason}")]
    WorkerAborted { slot: usize, reason: String },
}

impl DispatchError {
    /// Returns whether a worker hitting this error must stop.
    pub fn is_fatal(&self) -> bool {
        match self {
            DispatchError::NotQueued { .. } => true,
            DispatchError::WorkerAborted { .. } => true,
            DispatchError::Core(e) => e.is_fatal(),
            DispatchError::Closed | DispatchError::Config(_) => false,
        }
    }

    /// Returns whether retrying the same message may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Core(e) if !e.is_fatal())
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            DispatchError::NotQueued { .. } => "NOT_QUEUED",
            DispatchError::Closed => "CLOSED",
            DispatchError::Core(e) => e.error_code(),
            DispatchError::Config(_) => "CONFIG",
            DispatchError::WorkerAborted { .. } => "WORKER_ABORTED",
        }
    }
}
