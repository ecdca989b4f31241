//! Core error types.

use std::fmt;
use thiserror::Error;

/// Error type returned by user hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Which hook of a state failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Enter,
    Leave,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::Enter => f.write_str("enter"),
            HookPhase::Leave => f.write_str("leave"),
        }
    }
}

/// Errors from a persistence adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the state machine engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("state id '{state}' is in use")]
    DuplicateState { state: String },

    #[error("state not found: '{state}'")]
    StateNotFound { state: String },

    #[error("initial state cannot have enter/leave hooks")]
    InitialStateHooks,

    #[error("no matching transitor in state '{state}'")]
    NoMatch { state: String },

    #[error("{phase} hook of state '{state}' failed: {source}")]
    HookFailed {
        state: String,
        phase: HookPhase,
        #[source]
        source: HookError,
    },

    #[error("cannot load state '{state}' of {key}")]
    CorruptedState { key: String, state: String },

    #[error("transition limit of {limit} exceeded in state '{state}'")]
    TooManyHops { state: String, limit: usize },

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
}

impl CoreError {
    /// Returns whether this error should stop the worker that hit it.
    ///
    /// Everything else is handled by rolling the message back so it can be
    /// retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::CorruptedState { .. })
    }

    /// Returns whether this error is a setup-time wiring mistake.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CoreError::DuplicateState { .. }
                | CoreError::StateNotFound { .. }
                | CoreError::InitialStateHooks
        )
    }

    /// Returns a stable error code suitable for logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::DuplicateState { .. } => "DUPLICATE_STATE",
            CoreError::StateNotFound { .. } => "STATE_NOT_FOUND",
            CoreError::InitialStateHooks => "INITIAL_STATE_HOOKS",
            CoreError::NoMatch { .. } => "NO_MATCH",
            CoreError::HookFailed { .. } => "HOOK_FAILED",
            CoreError::CorruptedState { .. } => "CORRUPTED_STATE",
            CoreError::TooManyHops { .. } => "TOO_MANY_HOPS",
            CoreError::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let corrupted = CoreError::CorruptedState {
            key: "42".to_string(),
            state: "gone".to_string(),
        };
        assert!(corrupted.is_fatal());
        assert_eq!(corrupted.error_code(), "CORRUPTED_STATE");

        let no_match = CoreError::NoMatch {
            state: String::new(),
        };
        assert!(!no_match.is_fatal());
        assert!(!no_match.is_configuration());
    }

    #[test]
    fn test_hook_error_message() {
        let err = CoreError::HookFailed {
            state: "ask_name".to_string(),
            phase: HookPhase::Leave,
            source: "boom".into(),
        };
        assert_eq!(
            err.to_string(),
            "leave hook of state 'ask_name' failed: boom"
        );
    }

    #[test]
    fn test_store_error_converts() {
        let err: CoreError = StoreError::Unavailable("db down".to_string()).into();
        assert_eq!(err.error_code(), "PERSISTENCE_ERROR");
        assert!(!err.is_configuration());
    }
}
