//! Error types shared by the site resource manager crates.
//!
//! Every error can be rendered into the structured `{errType, errNo, errMsg}`
//! body returned by the REST layer and recorded in the service state table.

use serde::{Deserialize, Serialize};
use srm_types::ParseError;
use std::io;
use thiserror::Error;

/// Result type alias for common operations.
pub type SrmResult<T> = Result<T, SrmError>;

/// Errors that can occur in the site resource manager.
#[derive(Debug, Error)]
pub enum SrmError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Shell command did not finish in time.
    #[error("Shell command timed out after {seconds}s: '{command}'")]
    Timeout {
        /// The command that timed out.
        command: String,
        /// The configured timeout.
        seconds: u64,
    },

    /// Database operation failed.
    #[error("Database operation failed: {operation}: {message}")]
    Database {
        /// The operation that failed (e.g., "insert", "update").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// Filesystem error.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The path being accessed.
        path: String,
        #[source]
        source: io::Error,
    },

    /// Two requests claim the same resource at the same time.
    #[error("{message}")]
    Overlap {
        message: String,
    },

    /// A requested address lies outside the configured pools.
    #[error("{message}")]
    WrongIpAddress {
        message: String,
    },

    /// The request is malformed.
    #[error("{message}")]
    BadRequest {
        message: String,
    },

    /// An object with the same identity already exists.
    #[error("{message}")]
    Conflict {
        message: String,
    },

    /// The requested lifecycle transition is not allowed from the current state.
    #[error("{message}")]
    WrongTransition {
        message: String,
    },

    /// The named object does not exist (yet).
    #[error("{what} not found: {id}")]
    NotFound {
        /// Kind of object (delta, model, host...).
        what: String,
        id: String,
    },

    /// Authentication or authorization failure.
    #[error("Authentication failed: {message}")]
    Auth {
        message: String,
    },

    /// A request that requires a client certificate arrived without one.
    #[error("Request without certificate")]
    RequestWithoutCert,

    /// Remote HTTP call failed.
    #[error("HTTP request to {url} failed (status {status}): {message}")]
    Http {
        url: String,
        /// HTTP status, 0 when no response was received.
        status: u16,
        message: String,
    },

    /// Requested bandwidth exceeds what the interface can carry.
    #[error("Node is oversubscribed: {message}")]
    OverSubscribe {
        message: String,
    },

    /// A switch backend failed.
    #[error("Switch plugin failure on {device}: {message}")]
    Plugin {
        device: String,
        message: String,
    },

    /// Value parsing failed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// JSON or YAML (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Non-critical issue reported by a worker.
    #[error("Warning: {message}")]
    Warning {
        message: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

/// Coarse classification used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller sent something invalid; never retried.
    Validation,
    NotFound,
    Auth,
    /// May succeed on retry.
    Transient,
    /// The process cannot continue.
    Fatal,
    /// Recorded and ignored.
    Warning,
}

/// Structured error body shared by REST responses and service states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "errType")]
    pub err_type: String,
    #[serde(rename = "errNo")]
    pub err_no: i32,
    #[serde(rename = "errMsg")]
    pub err_msg: String,
}

impl ErrorInfo {
    pub fn new(err_type: impl Into<String>, err_no: i32, err_msg: impl Into<String>) -> Self {
        Self {
            err_type: err_type.into(),
            err_no,
            err_msg: err_msg.into(),
        }
    }
}

impl SrmError {
    /// Creates a database error.
    pub fn database(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an IO error bound to a path.
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn overlap(message: impl Into<String>) -> Self {
        Self::Overlap {
            message: message.into(),
        }
    }

    pub fn wrong_ip(message: impl Into<String>) -> Self {
        Self::WrongIpAddress {
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn wrong_transition(message: impl Into<String>) -> Self {
        Self::WrongTransition {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            what: what.into(),
            id: id.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    pub fn plugin(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Plugin {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the recovery class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SrmError::Overlap { .. }
            | SrmError::WrongIpAddress { .. }
            | SrmError::BadRequest { .. }
            | SrmError::Conflict { .. }
            | SrmError::WrongTransition { .. }
            | SrmError::Parse(_)
            | SrmError::Serialization(_)
            | SrmError::OverSubscribe { .. } => ErrorKind::Validation,
            SrmError::NotFound { .. } => ErrorKind::NotFound,
            SrmError::Auth { .. } | SrmError::RequestWithoutCert => ErrorKind::Auth,
            SrmError::ShellExec { .. }
            | SrmError::ShellCommandFailed { .. }
            | SrmError::Timeout { .. }
            | SrmError::Database { .. }
            | SrmError::Http { .. }
            | SrmError::Plugin { .. }
            | SrmError::Io { .. } => ErrorKind::Transient,
            SrmError::InvalidConfig { .. } | SrmError::Internal { .. } => ErrorKind::Fatal,
            SrmError::Warning { .. } => ErrorKind::Warning,
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            SrmError::Http { status, .. } => *status == 0 || *status >= 500,
            other => other.kind() == ErrorKind::Transient,
        }
    }

    /// HTTP status code for REST responses.
    pub fn http_status(&self) -> u16 {
        match self {
            SrmError::Http { status, .. } if *status >= 400 => *status,
            SrmError::Conflict { .. } => 409,
            other => match other.kind() {
                ErrorKind::Validation => 400,
                ErrorKind::NotFound => 404,
                ErrorKind::Auth => 401,
                ErrorKind::Transient | ErrorKind::Fatal | ErrorKind::Warning => 500,
            },
        }
    }

    /// Error type name and number as reported to clients.
    pub fn code(&self) -> (&'static str, i32) {
        match self {
            SrmError::Io { .. } | SrmError::ShellExec { .. } => ("IOError", -1),
            SrmError::NotFound { .. } => ("NotFound", -10),
            SrmError::Parse(_) => ("ValueError", -5),
            SrmError::Serialization(_) => ("BadSyntax", -6),
            SrmError::Overlap { .. } => ("OverlapException", -7),
            SrmError::WrongIpAddress { .. } => ("WrongIPAddress", -8),
            SrmError::BadRequest { .. } => ("BadRequestError", -9),
            SrmError::Conflict { .. } => ("ConflictEntries", -9),
            SrmError::WrongTransition { .. } => ("WrongDeltaStatusTransition", -9),
            SrmError::Auth { .. } => ("IssuesWithAuth", -11),
            SrmError::RequestWithoutCert => ("RequestWithoutCert", -11),
            SrmError::OverSubscribe { .. } => ("OverSubscribeException", -12),
            SrmError::InvalidConfig { .. } => ("KeyError", -2),
            SrmError::ShellCommandFailed { .. } => ("FailedCommand", -100),
            SrmError::Timeout { .. } => ("Timeout", -100),
            SrmError::Database { .. } => ("DatabaseError", -100),
            SrmError::Http { .. } => ("HTTPError", -100),
            SrmError::Plugin { .. } => ("PluginException", -100),
            SrmError::Warning { .. } => ("ServiceWarning", -100),
            SrmError::Internal { .. } => ("Exception", -100),
        }
    }

    /// Structured representation for clients.
    pub fn info(&self) -> ErrorInfo {
        let (err_type, err_no) = self.code();
        ErrorInfo::new(err_type, err_no, self.to_string())
    }
}

impl From<serde_json::Error> for SrmError {
    fn from(e: serde_json::Error) -> Self {
        SrmError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for SrmError {
    fn from(e: serde_yaml::Error) -> Self {
        SrmError::Serialization(e.to_string())
    }
}
