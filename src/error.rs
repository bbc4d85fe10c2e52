// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replay engine.
//!
//! Errors are classified at the boundary where they enter the engine, so
//! callers can decide between a client-facing rejection and an internal
//! failure without inspecting messages.
//!
//! # Error Categories
//!
//! | Error Type | Client error | Retryable | Description |
//! |------------|--------------|-----------|-------------|
//! | `Validation` | Yes | No | Bad operation, empty replay id, kind without active records |
//! | `NotFound` | Yes | No | Unknown replay id |
//! | `InvalidCursor` | Yes | No | Cursor expired, evicted, or issued for another ordering |
//! | `InvalidTransition` | No | No | Progress row state machine violation |
//! | `Backend` | Depends | Depends | Record repository / publisher failure |
//! | `Timeout` | No | Yes | Backend call exceeded its deadline |
//! | `Store` | No | No | Local SQLite error |
//! | `Config` | No | No | Configuration invalid |
//! | `Shutdown` | No | No | Coordinator is draining |
//! | `Internal` | No | No | Unexpected internal error |
//!
//! # Background Paths
//!
//! Errors raised inside dispatch or discovery tasks never reach the original
//! caller. They are logged and reflected as `FAILED` progress rows.

use crate::backend::BackendError;
use crate::model::ReplayState;
use thiserror::Error;

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Errors that can occur while triggering, dispatching or querying replays.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// Request rejected before any side effect.
    #[error("{0}")]
    Validation(String),

    /// No progress rows exist for the requested replay id.
    #[error("{0}")]
    NotFound(String),

    /// Cursor could not be resolved to a continuation position.
    ///
    /// TTL eviction lands here too. Never treated as "start from the beginning".
    #[error("Cursor invalid: {0}")]
    InvalidCursor(String),

    /// Attempted to move a progress row along an edge the state machine forbids.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: ReplayState, to: ReplayState },

    /// A collaborator (record repository, publisher) failed.
    #[error("Backend error ({operation}): {message}")]
    Backend {
        operation: String,
        message: String,
        /// True when the backend rejected the request because of its content.
        client_caused: bool,
        retryable: bool,
    },

    /// A backend call did not finish within its deadline.
    #[error("Timed out waiting for {operation}")]
    Timeout { operation: String },

    /// SQLite error in the durable progress store.
    #[error("Progress store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Coordinator is shutting down and no longer accepts work.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Catch-all for errors that shouldn't happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplayError {
    /// Wrap a collaborator error, tagging it with the operation that failed.
    pub fn backend(operation: impl Into<String>, source: BackendError) -> Self {
        let (client_caused, retryable) = match &source {
            BackendError::Rejected(_) => (true, false),
            BackendError::Unavailable(_) => (false, true),
            BackendError::Internal(_) => (false, false),
        };
        Self::Backend {
            operation: operation.into(),
            message: source.to_string(),
            client_caused,
            retryable,
        }
    }

    /// Create a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Check if this error was caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::Validation(_) => true,
            Self::NotFound(_) => true,
            Self::InvalidCursor(_) => true,
            Self::Backend { client_caused, .. } => *client_caused,
            Self::InvalidTransition { .. } => false,
            Self::Timeout { .. } => false,
            Self::Store(_) => false,
            Self::Config(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            Self::Validation(_) => false,
            Self::NotFound(_) => false,
            Self::InvalidCursor(_) => false,
            Self::InvalidTransition { .. } => false,
            Self::Store(_) => false, // Local DB issues need attention
            Self::Config(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_is_client_error() {
        let err = ReplayError::Validation("Replay ID cannot be null or empty".to_string());
        assert!(err.is_client_error());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Replay ID cannot be null or empty");
    }

    #[test]
    fn test_invalid_cursor_is_client_error() {
        let err = ReplayError::InvalidCursor("unknown token".to_string());
        assert!(err.is_client_error());
        assert!(err.to_string().starts_with("Cursor invalid"));
    }

    #[test]
    fn test_backend_rejected_is_client_error() {
        let err = ReplayError::backend("count_active", BackendError::Rejected("bad kind".into()));
        assert!(err.is_client_error());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("count_active"));
    }

    #[test]
    fn test_backend_unavailable_is_retryable() {
        let err = ReplayError::backend("publish", BackendError::Unavailable("broker down".into()));
        assert!(!err.is_client_error());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_backend_internal_not_retryable() {
        let err = ReplayError::backend("list_active_ids", BackendError::Internal("bug".into()));
        assert!(!err.is_client_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = ReplayError::timeout("list_active_ids");
        assert!(err.is_retryable());
        assert!(!err.is_client_error());
        assert!(err.to_string().contains("list_active_ids"));
    }

    #[test]
    fn test_invalid_transition_formatting() {
        let err = ReplayError::InvalidTransition {
            from: ReplayState::Completed,
            to: ReplayState::InProgress,
        };
        let msg = err.to_string();
        assert!(msg.contains("COMPLETED"));
        assert!(msg.contains("IN_PROGRESS"));
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_not_retryable_internal() {
        let err = ReplayError::Internal("unexpected panic".to_string());
        assert!(!err.is_retryable());
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_store_error_from_sqlx() {
        let err: ReplayError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, ReplayError::Store(_)));
        assert!(!err.is_retryable());
    }
}
