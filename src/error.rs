//! Error types for rust-lwm2m

use thiserror::Error;

use crate::callback::{HandlerResult, Operation};

/// Main error type for LWM2M core operations
#[derive(Debug, Error)]
pub enum Lwm2mError {
    /// Operation not valid in the current state (e.g. reconfiguring after start)
    #[error("Operation invalid: {0}")]
    OperationInvalid(String),

    /// Required configuration is missing
    #[error("Not configured: {0}")]
    NotConfigured(String),

    /// Object, instance, resource or endpoint does not exist (maps to CoAP 4.04)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate create or duplicate definition
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Value, name or count exceeds a fixed limit (maps to CoAP 4.13)
    #[error("{what} exceeds capacity of {capacity}")]
    Capacity {
        /// What overflowed
        what: String,
        /// The limit that was exceeded
        capacity: usize,
    },

    /// Operation not permitted by the resource definition (maps to CoAP 4.05)
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Malformed wire payload (maps to CoAP 4.00)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unsupported content type (maps to CoAP 4.15)
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(u16),

    /// Socket send/receive failure or timeout after retransmission
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error (socket and file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing/serialization error (configuration files)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Application handler returned a non-success result
    #[error("Handler returned {result:?} for {operation}")]
    Handler {
        /// The operation the handler was invoked for
        operation: Operation,
        /// The result code it returned
        result: HandlerResult,
    },

    /// Unexpected internal state
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error classes, independent of the payload each variant carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    NotFound,
    AlreadyExists,
    Capacity,
    Permission,
    Protocol,
    Transport,
    Internal,
}

impl Lwm2mError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OperationInvalid(_) | Self::NotConfigured(_) => ErrorKind::Configuration,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Capacity { .. } => ErrorKind::Capacity,
            Self::Permission(_) => ErrorKind::Permission,
            Self::Protocol(_) | Self::UnsupportedContentType(_) | Self::Json(_) => {
                ErrorKind::Protocol
            }
            Self::Transport(_) | Self::Io(_) => ErrorKind::Transport,
            Self::Handler { result, .. } => match result {
                HandlerResult::NotFound => ErrorKind::NotFound,
                HandlerResult::AlreadyExists => ErrorKind::AlreadyExists,
                HandlerResult::MethodNotAllowed | HandlerResult::Unauthorized => {
                    ErrorKind::Permission
                }
                HandlerResult::BadRequest => ErrorKind::Protocol,
                HandlerResult::OutOfMemory => ErrorKind::Capacity,
                _ => ErrorKind::Internal,
            },
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn capacity(what: impl Into<String>, capacity: usize) -> Self {
        Self::Capacity {
            what: what.into(),
            capacity,
        }
    }
}

/// Result type alias for LWM2M operations
pub type Result<T> = std::result::Result<T, Lwm2mError>;
