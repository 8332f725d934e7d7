use srm_common::SrmError;
use srm_store::DbError;
use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Auth setting {path}: {message}")]
    Key { path: String, message: String },

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token lacks the {0} permission")]
    Forbidden(String),

    #[error("Invalid certificate: {0}")]
    Certificate(String),

    #[error("Unknown or expired challenge {0}")]
    UnknownChallenge(String),

    #[error("Challenge signature does not verify: {0}")]
    BadSignature(String),

    #[error("Subject {0} is not allowed")]
    NotAllowed(String),

    #[error("Refresh token is invalid or expired")]
    InvalidRefresh,

    #[error(transparent)]
    Database(#[from] DbError),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        AuthError::InvalidToken(err.to_string())
    }
}

impl From<AuthError> for SrmError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Database(db) => db.into(),
            AuthError::Key { path, message } => SrmError::invalid_config("auth", format!("{}: {}", path, message)),
            other => SrmError::auth(other.to_string()),
        }
    }
}
