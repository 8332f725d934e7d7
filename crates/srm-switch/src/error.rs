//! Switch backend errors.

use srm_common::{Retryable, SrmError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Unsupported network OS '{0}'")]
    UnknownVendor(String),

    #[error("Backend for {device} is not configured: {message}")]
    NotConfigured { device: String, message: String },

    #[error("Automation run '{playbook}' failed: {message}")]
    Run { playbook: String, message: String },

    #[error("Automation run '{playbook}' timed out after {seconds}s")]
    Timeout { playbook: String, seconds: u64 },

    #[error("Cannot parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

impl BackendError {
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
}

impl Retryable for BackendError {
    fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Run { .. } | BackendError::Timeout { .. })
    }
}

impl From<BackendError> for SrmError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotConfigured { device, message } => SrmError::plugin(device, message),
            BackendError::UnknownVendor(os) => {
                SrmError::invalid_config("switches.network_os", format!("unsupported {}", os))
            }
            other => SrmError::plugin("switch", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        let timeout = BackendError::Timeout {
            playbook: "getfacts.yaml".into(),
            seconds: 120,
        };
        assert!(timeout.is_retryable());
        assert!(!BackendError::parse("facts", "bad json").is_retryable());
        let err: SrmError = BackendError::UnknownVendor("junos".into()).into();
        assert_eq!(err.code().1, -2);
    }
}
