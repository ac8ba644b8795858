//! Error types for the call coordinator
//!
//! Errors fall into the categories the coordinator reacts to differently:
//!
//! - **Invariant violations** - logged and traced, the caller self-corrects
//! - **Native faults** - raised by the OS telephony layer, always non-fatal
//! - **Backend failures** - signal store writes, swallowed with a warning
//! - **Payload errors** - malformed native or push payloads, dropped at the boundary
//! - **Configuration / lifecycle errors** - misuse of the API
//!
//! Duplicate events are never errors; they are resolved by the de-dup sets.
//!
//! ```rust
//! use callsync_call_coordinator::{CoordinatorError, NativeError};
//!
//! let err = CoordinatorError::native("display_incoming_call", NativeError::AlreadyEnded);
//! assert_eq!(err.category(), "native");
//! assert!(err.is_recoverable());
//! ```

use thiserror::Error;

use crate::call::CallPhase;

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Faults reported by the OS telephony integration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NativeError {
    #[error("permission denied: {permission}")]
    PermissionDenied { permission: String },

    #[error("call already ended")]
    AlreadyEnded,

    #[error("unknown call: {uuid}")]
    UnknownCall { uuid: String },

    #[error("telephony not set up")]
    NotSetUp,

    #[error("platform error: {message}")]
    Platform { message: String },
}

impl NativeError {
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform { message: message.into() }
    }

    /// Whether the fault only says the call is already gone
    pub fn is_already_ended(&self) -> bool {
        matches!(self, NativeError::AlreadyEnded | NativeError::UnknownCall { .. })
    }
}

/// Errors surfaced by the coordinator
#[derive(Error, Debug, Clone)]
pub enum CoordinatorError {
    #[error("Invalid phase transition: {from:?} -> {to:?}")]
    InvalidTransition { from: CallPhase, to: CallPhase },

    #[error("Invariant violated: {detail}")]
    InvariantViolation { detail: String },

    #[error("Native telephony error during {operation}: {source}")]
    Native {
        operation: String,
        #[source]
        source: NativeError,
    },

    #[error("Malformed payload: {reason}")]
    MalformedPayload { reason: String },

    #[error("No session mapped to call {uuid}")]
    MappingNotFound { uuid: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Storage error: {reason}")]
    Storage { reason: String },

    #[error("Navigation failed: {reason}")]
    Navigation { reason: String },

    #[error("Signal channel error: {reason}")]
    Signal { reason: String },

    #[error("Push delivery error: {reason}")]
    Push { reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Coordinator not initialized")]
    NotInitialized,

    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CoordinatorError {
    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::InvariantViolation { detail: detail.into() }
    }

    pub fn native(operation: impl Into<String>, source: NativeError) -> Self {
        Self::Native { operation: operation.into(), source }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload { reason: reason.into() }
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage { reason: reason.into() }
    }

    pub fn navigation(reason: impl Into<String>) -> Self {
        Self::Navigation { reason: reason.into() }
    }

    pub fn signal(reason: impl Into<String>) -> Self {
        Self::Signal { reason: reason.into() }
    }

    pub fn push(reason: impl Into<String>) -> Self {
        Self::Push { reason: reason.into() }
    }

    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration { field: field.into(), reason: reason.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            CoordinatorError::Native { .. }
            | CoordinatorError::Storage { .. }
            | CoordinatorError::Navigation { .. }
            | CoordinatorError::Signal { .. }
            | CoordinatorError::Push { .. } => true,

            CoordinatorError::InvalidTransition { .. }
            | CoordinatorError::InvariantViolation { .. }
            | CoordinatorError::MalformedPayload { .. }
            | CoordinatorError::InvalidConfiguration { .. } => false,

            _ => false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            CoordinatorError::InvalidTransition { .. }
            | CoordinatorError::InvariantViolation { .. } => "state",
            CoordinatorError::Native { .. } => "native",
            CoordinatorError::MalformedPayload { .. }
            | CoordinatorError::Serialization { .. } => "payload",
            CoordinatorError::MappingNotFound { .. }
            | CoordinatorError::SessionNotFound { .. }
            | CoordinatorError::Storage { .. } => "storage",
            CoordinatorError::Navigation { .. } => "navigation",
            CoordinatorError::Signal { .. } | CoordinatorError::Push { .. } => "backend",
            CoordinatorError::NotInitialized
            | CoordinatorError::InvalidConfiguration { .. } => "lifecycle",
            CoordinatorError::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization { reason: err.to_string() }
    }
}

impl From<toml::de::Error> for CoordinatorError {
    fn from(err: toml::de::Error) -> Self {
        Self::InvalidConfiguration { field: "toml".to_string(), reason: err.to_string() }
    }
}
