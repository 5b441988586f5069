//! Error types for envctl

use std::io;

use thiserror::Error;

/// Result type alias for envctl
pub type Result<T> = std::result::Result<T, Error>;

/// envctl errors
#[derive(Error, Debug)]
pub enum Error {
    /// Service label unknown
    #[error("Service not found: {0}")]
    NotFound(String),

    /// Duplicate service label
    #[error("Service already registered: {0}")]
    AlreadyRegistered(String),

    /// ServiceClass is missing required tools in the aggregator catalog
    #[error("ServiceClass '{class}' unavailable, missing tools: {}", missing.join(", "))]
    ClassUnavailable {
        /// Class name
        class: String,
        /// Tool names the catalog does not currently provide
        missing: Vec<String>,
    },

    /// A lifecycle transition is already in progress on this service
    #[error("Transition already in flight for service: {0}")]
    TransitionInFlight(String),

    /// An upstream dependency failed during a cascaded start
    #[error("Dependency '{label}' failed: {reason}")]
    DependencyFailed {
        /// Label of the failed dependency
        label: String,
        /// Failure description
        reason: String,
    },

    /// Service cannot be deleted in its current state
    #[error("Service '{0}' is busy; stop it before deleting")]
    ServiceBusy(String),

    /// Dispatch target upstream is not running
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Destructive tool invoked without yolo mode
    #[error("Tool '{0}' is blocked; enable yolo mode to call destructive tools")]
    Blocked(String),

    /// Tool call or transition exceeded its timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Caller-driven cancellation
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Parameter or class validation failure
    #[error("Validation failed for '{field}': {reason}")]
    Validation {
        /// Offending field or parameter name
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// Network or JSON-RPC transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON-RPC error
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
        /// Optional data
        data: Option<serde_json::Value>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a JSON-RPC error
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::Protocol(_) => rpc_codes::INVALID_REQUEST,
            Self::Validation { .. } => rpc_codes::INVALID_PARAMS,
            Self::NotFound(_) => -32001,
            Self::Blocked(_) => -32002,
            Self::UpstreamUnavailable(_) | Self::Timeout(_) | Self::Transport(_) => -32000,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }
}

/// Standard JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server error range start
    pub const SERVER_ERROR_START: i32 = -32000;
    /// Server error range end
    pub const SERVER_ERROR_END: i32 = -32099;
}
