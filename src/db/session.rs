//! Single-connection database session over sqlx (PostgreSQL or SQLite).
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection, Database, Encode, Row, Type};
use std::str::FromStr;

use crate::config::{CONNECT_TIMEOUT, QUERY_TIMEOUT};

/// A value bound into a statement parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Text(Option<String>),
    Integer(Option<i64>),
    Boolean(Option<bool>),
}

impl SqlValue {
    pub fn text(value: impl Into<String>) -> Self {
        SqlValue::Text(Some(value.into()))
    }
}

/// SQL text plus its bound parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Dialect differences the rest of the crate needs to know about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

impl Backend {
    /// Positional placeholder for the `n`th parameter (1-based)
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Backend::Postgres => format!("${}", n),
            Backend::Sqlite => format!("?{}", n),
        }
    }

    /// Maximum number of bind parameters in one statement
    pub fn max_bind_params(&self) -> usize {
        match self {
            Backend::Postgres => 65_535,
            Backend::Sqlite => 32_766,
        }
    }
}

/// The narrow surface the loader and ledger use to reach the store
#[async_trait]
pub trait Session: Send {
    fn backend(&self) -> Backend;

    /// Execute one statement, returning the number of affected rows
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, sqlx::Error>;

    /// Execute statements in order inside a single transaction
    async fn execute_many(&mut self, statements: &[Statement]) -> Result<u64, sqlx::Error>;

    /// Run a query and return every column of every row as text
    async fn fetch_rows(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Vec<Option<String>>>, sqlx::Error>;
}

/// A live connection to one of the supported backends
pub enum DbSession {
    Postgres(PgConnection),
    Sqlite(SqliteConnection),
}

impl DbSession {
    /// Connect based on the URL scheme (`postgres://`, `postgresql://`, `sqlite:`)
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            let options = PgConnectOptions::from_str(url)?;
            let conn = tokio::time::timeout(CONNECT_TIMEOUT, options.connect())
                .await
                .map_err(|_| sqlx::Error::PoolTimedOut)??;
            Ok(DbSession::Postgres(conn))
        } else if url.starts_with("sqlite:") {
            let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
            let conn = tokio::time::timeout(CONNECT_TIMEOUT, options.connect())
                .await
                .map_err(|_| sqlx::Error::PoolTimedOut)??;
            Ok(DbSession::Sqlite(conn))
        } else {
            Err(sqlx::Error::Configuration(
                format!("unsupported database URL scheme: {}", redact(url)).into(),
            ))
        }
    }

    /// Create an in-memory SQLite session for testing
    #[cfg(test)]
    pub async fn sqlite_in_memory() -> Result<Self, sqlx::Error> {
        Self::connect("sqlite::memory:").await
    }

    pub async fn close(self) -> Result<(), sqlx::Error> {
        match self {
            DbSession::Postgres(conn) => conn.close().await,
            DbSession::Sqlite(conn) => conn.close().await,
        }
    }
}

/// Everything before the first ':' of a URL, so credentials never reach logs
fn redact(url: &str) -> &str {
    url.split(':').next().unwrap_or_default()
}

fn bind_params<'q, DB>(
    mut query: Query<'q, DB, <DB as Database>::Arguments<'q>>,
    params: &[SqlValue],
) -> Query<'q, DB, <DB as Database>::Arguments<'q>>
where
    DB: Database,
    Option<String>: Encode<'q, DB> + Type<DB>,
    Option<i64>: Encode<'q, DB> + Type<DB>,
    Option<bool>: Encode<'q, DB> + Type<DB>,
{
    for param in params {
        query = match param {
            SqlValue::Text(value) => query.bind(value.clone()),
            SqlValue::Integer(value) => query.bind(*value),
            SqlValue::Boolean(value) => query.bind(*value),
        };
    }
    query
}

async fn with_timeout<T>(
    fut: impl std::future::Future<Output = Result<T, sqlx::Error>>,
) -> Result<T, sqlx::Error> {
    tokio::time::timeout(QUERY_TIMEOUT, fut)
        .await
        .map_err(|_| sqlx::Error::PoolTimedOut)?
}

#[async_trait]
impl Session for DbSession {
    fn backend(&self) -> Backend {
        match self {
            DbSession::Postgres(_) => Backend::Postgres,
            DbSession::Sqlite(_) => Backend::Sqlite,
        }
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, sqlx::Error> {
        match self {
            DbSession::Postgres(conn) => {
                let query = bind_params(sqlx::query(sql), params);
                Ok(with_timeout(query.execute(&mut *conn)).await?.rows_affected())
            }
            DbSession::Sqlite(conn) => {
                let query = bind_params(sqlx::query(sql), params);
                Ok(with_timeout(query.execute(&mut *conn)).await?.rows_affected())
            }
        }
    }

    async fn execute_many(&mut self, statements: &[Statement]) -> Result<u64, sqlx::Error> {
        let mut affected = 0;
        match self {
            DbSession::Postgres(conn) => {
                let mut tx = conn.begin().await?;
                for statement in statements {
                    let query = bind_params(sqlx::query(&statement.sql), &statement.params);
                    affected += with_timeout(query.execute(&mut *tx)).await?.rows_affected();
                }
                tx.commit().await?;
            }
            DbSession::Sqlite(conn) => {
                let mut tx = conn.begin().await?;
                for statement in statements {
                    let query = bind_params(sqlx::query(&statement.sql), &statement.params);
                    affected += with_timeout(query.execute(&mut *tx)).await?.rows_affected();
                }
                tx.commit().await?;
            }
        }
        Ok(affected)
    }

    async fn fetch_rows(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Vec<Option<String>>>, sqlx::Error> {
        match self {
            DbSession::Postgres(conn) => {
                let query = bind_params(sqlx::query(sql), params);
                let rows = with_timeout(query.fetch_all(&mut *conn)).await?;
                rows.iter()
                    .map(|row| {
                        (0..row.len())
                            .map(|i| row.try_get::<Option<String>, _>(i))
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .collect()
            }
            DbSession::Sqlite(conn) => {
                let query = bind_params(sqlx::query(sql), params);
                let rows = with_timeout(query.fetch_all(&mut *conn)).await?;
                rows.iter()
                    .map(|row| {
                        (0..row.len())
                            .map(|i| row.try_get::<Option<String>, _>(i))
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .collect()
            }
        }
    }
}

/// Test session that passes everything through to `inner` except statements
/// starting with `reject_prefix`, which fail as if the connection dropped
#[cfg(test)]
pub(crate) struct FailingSession {
    pub inner: DbSession,
    reject_prefix: String,
}

#[cfg(test)]
impl FailingSession {
    pub fn new(inner: DbSession, reject_prefix: &str) -> Self {
        Self {
            inner,
            reject_prefix: reject_prefix.to_string(),
        }
    }

    fn rejects(&self, sql: &str) -> bool {
        sql.starts_with(&self.reject_prefix)
    }
}

#[cfg(test)]
#[async_trait]
impl Session for FailingSession {
    fn backend(&self) -> Backend {
        self.inner.backend()
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, sqlx::Error> {
        if self.rejects(sql) {
            return Err(sqlx::Error::Protocol("connection reset".into()));
        }
        self.inner.execute(sql, params).await
    }

    async fn execute_many(&mut self, statements: &[Statement]) -> Result<u64, sqlx::Error> {
        if statements.iter().any(|s| self.rejects(&s.sql)) {
            return Err(sqlx::Error::Protocol("connection reset".into()));
        }
        self.inner.execute_many(statements).await
    }

    async fn fetch_rows(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Vec<Option<String>>>, sqlx::Error> {
        self.inner.fetch_rows(sql, params).await
    }
}
