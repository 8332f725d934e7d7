//! Errors raised while decoding graphs or turning them into active deltas.

use srm_common::SrmError;
use srm_types::ParseError;
use thiserror::Error;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    /// Text could not be parsed in the given serialization.
    #[error("{format} syntax error at line {line}: {message}")]
    Syntax {
        format: &'static str,
        line: usize,
        message: String,
    },

    /// A node carries a value the parser cannot use.
    #[error("invalid value on {uri}: {message}")]
    InvalidValue { uri: String, message: String },

    /// A node lacks a predicate the parser needs.
    #[error("{uri} has no {predicate}")]
    MissingNode { uri: String, predicate: String },

    /// Delta content is neither valid base64 nor text.
    #[error("content encoding error: {0}")]
    Encoding(String),
}

impl ModelError {
    pub fn syntax(format: &'static str, line: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            format,
            line,
            message: message.into(),
        }
    }

    pub fn invalid_value(uri: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            uri: uri.into(),
            message: message.into(),
        }
    }

    pub fn missing(uri: impl Into<String>, predicate: impl Into<String>) -> Self {
        Self::MissingNode {
            uri: uri.into(),
            predicate: predicate.into(),
        }
    }

    /// Attaches a node URI to a value parse failure.
    pub(crate) fn from_parse(uri: &str, err: ParseError) -> Self {
        Self::invalid_value(uri, err.to_string())
    }
}

impl From<ModelError> for SrmError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Syntax { .. } | ModelError::Encoding(_) => {
                SrmError::Serialization(err.to_string())
            }
            ModelError::InvalidValue { .. } | ModelError::MissingNode { .. } => {
                SrmError::bad_request(err.to_string())
            }
        }
    }
}
