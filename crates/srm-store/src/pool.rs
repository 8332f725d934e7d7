//! Connection pool and schema bootstrap.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;

use crate::error::DbError;

/// Tables of the site resource manager. Created on startup when missing.
const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS models (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uid TEXT NOT NULL UNIQUE,
        insertdate INTEGER NOT NULL,
        fileloc TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS deltas (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uid TEXT NOT NULL UNIQUE,
        insertdate INTEGER NOT NULL,
        updatedate INTEGER NOT NULL,
        state TEXT NOT NULL,
        deltat TEXT NOT NULL,
        content TEXT NOT NULL,
        modelid TEXT NOT NULL,
        modadd TEXT NOT NULL,
        error TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS delta_connections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        deltaid TEXT NOT NULL,
        connectionid TEXT NOT NULL,
        state TEXT NOT NULL,
        UNIQUE (deltaid, connectionid)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS states (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        deltaid TEXT NOT NULL,
        state TEXT NOT NULL,
        insertdate INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS hoststates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        deltaid TEXT NOT NULL,
        state TEXT NOT NULL,
        insertdate INTEGER NOT NULL,
        updatedate INTEGER NOT NULL,
        hostname TEXT NOT NULL,
        UNIQUE (deltaid, hostname)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS hoststateshistory (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        deltaid TEXT NOT NULL,
        state TEXT NOT NULL,
        insertdate INTEGER NOT NULL,
        hostname TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS hosts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ip TEXT NOT NULL,
        hostname TEXT NOT NULL UNIQUE,
        insertdate INTEGER NOT NULL,
        updatedate INTEGER NOT NULL,
        hostinfo TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS services (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        hostname TEXT NOT NULL,
        servicename TEXT NOT NULL,
        insertdate INTEGER NOT NULL,
        updatedate INTEGER NOT NULL,
        serviceinfo TEXT NOT NULL,
        UNIQUE (hostname, servicename)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS switch (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sitename TEXT NOT NULL,
        device TEXT NOT NULL,
        insertdate INTEGER NOT NULL,
        updatedate INTEGER NOT NULL,
        output TEXT NOT NULL,
        error TEXT,
        UNIQUE (sitename, device)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS servicestates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        hostname TEXT NOT NULL,
        servicename TEXT NOT NULL,
        servicestate TEXT NOT NULL,
        version TEXT NOT NULL,
        runtime INTEGER NOT NULL,
        exc TEXT,
        insertdate INTEGER NOT NULL,
        updatedate INTEGER NOT NULL,
        UNIQUE (hostname, servicename)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS activeDeltas (
        id INTEGER PRIMARY KEY,
        insertdate INTEGER NOT NULL,
        updatedate INTEGER NOT NULL,
        output TEXT NOT NULL,
        version INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS snmpmon (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        hostname TEXT NOT NULL,
        mon_id TEXT NOT NULL,
        insertdate INTEGER NOT NULL,
        updatedate INTEGER NOT NULL,
        output TEXT NOT NULL,
        UNIQUE (hostname, mon_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS deltatimestates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        insertdate INTEGER NOT NULL,
        uuid TEXT NOT NULL,
        uuidtype TEXT NOT NULL,
        hostname TEXT NOT NULL,
        hostport TEXT NOT NULL,
        uuidstate TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS serviceaction (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        hostname TEXT NOT NULL,
        servicename TEXT NOT NULL,
        serviceaction TEXT NOT NULL,
        insertdate INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS forceapplyuuid (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS instancestartend (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        instanceid TEXT NOT NULL,
        insertdate INTEGER NOT NULL,
        starttimestamp INTEGER NOT NULL,
        endtimestamp INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS debugrequests (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        hostname TEXT NOT NULL,
        state TEXT NOT NULL,
        requestdict TEXT NOT NULL,
        output TEXT,
        insertdate INTEGER NOT NULL,
        updatedate INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        permissions TEXT NOT NULL,
        disabled INTEGER NOT NULL DEFAULT 0,
        insertdate INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS refresh_tokens (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        token_hash TEXT NOT NULL UNIQUE,
        session_id TEXT NOT NULL,
        subject TEXT NOT NULL,
        permissions TEXT NOT NULL,
        expires_at INTEGER NOT NULL,
        revoked INTEGER NOT NULL DEFAULT 0,
        insertdate INTEGER NOT NULL
    )"#,
];

/// Create a SqlitePool with WAL mode and common settings.
///
/// # Arguments
/// * `database_url` - SQLite connection string (e.g., "sqlite:///opt/siterm/siterm.db")
///
/// # Errors
/// Returns `DbError::Internal` if the URL is invalid or connection fails.
#[tracing::instrument(skip(database_url))]
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, DbError> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| DbError::Internal(format!("Invalid database URL: {e}")))?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(options).await?;

    tracing::debug!("database pool created");
    Ok(pool)
}

/// Single-connection in-memory pool. Every connection to `:memory:` is a
/// separate database, so the pool must never open a second one.
pub async fn create_memory_pool() -> Result<SqlitePool, DbError> {
    let options = SqliteConnectOptions::from_str(":memory:")
        .map_err(|e| DbError::Internal(format!("Invalid database URL: {e}")))?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Creates every table that does not exist yet.
#[tracing::instrument(skip(pool))]
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<(), DbError> {
    for statement in SCHEMA {
        sqlx::query(*statement).execute(pool).await?;
    }
    tracing::debug!(tables = SCHEMA.len(), "database schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let pool = create_memory_pool().await.unwrap();
        bootstrap_schema(&pool).await.unwrap();
        bootstrap_schema(&pool).await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(tables.len(), SCHEMA.len());
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let result = create_pool("postgres://nope").await;
        assert!(matches!(result, Err(DbError::Internal(_))));
    }
}
