//! Agent errors.

use srm_common::{Retryable, SrmError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The frontend answered with an error status, or did not answer
    /// (`status` 0).
    #[error("Frontend request {url} failed ({status}): {message}")]
    Http {
        url: String,
        status: u16,
        message: String,
    },

    #[error("Cannot decode the answer of {url}: {message}")]
    Decode { url: String, message: String },

    #[error("Cannot parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("Node is oversubscribed on {interface}: max rate {max} mbit, requested {requested} mbit")]
    OverSubscribe {
        interface: String,
        max: u64,
        requested: u64,
    },

    #[error("Credentials: {0}")]
    Credentials(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Common(#[from] SrmError),
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

impl AgentError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(what: impl Into<String>, message: impl ToString) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.to_string(),
        }
    }

    /// HTTP status of the failed call, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            AgentError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl Retryable for AgentError {
    fn is_retryable(&self) -> bool {
        match self {
            AgentError::Http { status, .. } => *status == 0 || *status >= 500,
            AgentError::Common(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<AgentError> for SrmError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Http {
                url,
                status,
                message,
            } => SrmError::Http {
                url,
                status,
                message,
            },
            AgentError::OverSubscribe { .. } => SrmError::OverSubscribe {
                message: err.to_string(),
            },
            AgentError::Io { path, source } => SrmError::io(path, source),
            AgentError::Credentials(message) => SrmError::invalid_config("general.cert", message),
            AgentError::Common(e) => e,
            other => SrmError::Serialization(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        let unreachable = AgentError::Http {
            url: "https://fe/api".into(),
            status: 0,
            message: "connection refused".into(),
        };
        assert!(unreachable.is_retryable());
        let missing = AgentError::Http {
            url: "https://fe/api".into(),
            status: 404,
            message: "not found".into(),
        };
        assert!(!missing.is_retryable());
        assert!(!AgentError::parse("ip rule", "garbage").is_retryable());
    }

    #[test]
    fn test_oversubscribe_maps_to_errno() {
        let err: SrmError = AgentError::OverSubscribe {
            interface: "eth0".into(),
            max: 9000,
            requested: 10000,
        }
        .into();
        assert_eq!(err.code(), ("OverSubscribeException", -12));
    }
}
