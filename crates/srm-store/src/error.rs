//! Storage errors.

use srm_common::SrmError;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Maps unique-constraint violations onto [`DbError::Conflict`].
    pub(crate) fn from_insert(err: sqlx::Error, what: &str) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DbError::Conflict(format!("{} already exists", what))
            }
            _ => DbError::Sqlx(err),
        }
    }
}

impl From<DbError> for SrmError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(id) => SrmError::not_found("record", id),
            DbError::Conflict(message) => SrmError::conflict(message),
            DbError::Serialization(e) => SrmError::Serialization(e.to_string()),
            DbError::Sqlx(e) => SrmError::database("query", e.to_string()),
            DbError::Internal(message) => SrmError::database("internal", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_keeps_kind() {
        let err: SrmError = DbError::Conflict("delta abc already exists".into()).into();
        assert_eq!(err.http_status(), 409);
        let err: SrmError = DbError::NotFound("abc".into()).into();
        assert_eq!(err.http_status(), 404);
        let err: SrmError = DbError::Internal("locked".into()).into();
        assert!(err.is_retryable());
    }
}
