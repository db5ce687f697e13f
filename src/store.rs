//! Pooled SQLite access layer.
//!
//! Every statement goes through this module so that parameter binding,
//! operation timeouts and error classification stay uniform. Connection-level
//! failures surface as the distinct store-unavailable error instead of
//! masquerading as statement or validation errors.

use crate::error::AppError;
use futures::future::BoxFuture;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteQueryResult, SqliteRow,
};
use sqlx::SqliteConnection;
use std::str::FromStr;
use std::time::Duration;

/// Outcome of a multi-row insert.
#[derive(Debug, Clone, Copy)]
pub struct BulkInsert {
    pub affected: u64,
    pub first_insert_id: i64,
}

/// Shared handle to the connection pool. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    op_timeout: Duration,
}

impl Store {
    /// Open the pool (min 2 / max 10 connections, sized for shared-hosting
    /// connection limits) and run pending migrations.
    pub async fn connect(db_url: &str, op_timeout: Duration) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(2)
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool, op_timeout })
    }

    /// Execute a parameter-bound statement.
    pub async fn exec<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<SqliteQueryResult, AppError> {
        match tokio::time::timeout(self.op_timeout, query.execute(&self.pool)).await {
            Err(_) => Err(AppError::QueryFailed("statement timed out".to_string())),
            Ok(Err(e)) => Err(classify(e, ErrorKind::Query)),
            Ok(Ok(result)) => Ok(result),
        }
    }

    /// Execute a single-row insert. Identical to [`exec`](Self::exec) apart
    /// from the error code it reports.
    pub async fn insert<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<SqliteQueryResult, AppError> {
        match tokio::time::timeout(self.op_timeout, query.execute(&self.pool)).await {
            Err(_) => Err(AppError::InsertFailed("statement timed out".to_string())),
            Ok(Err(e)) => Err(classify(e, ErrorKind::Insert)),
            Ok(Ok(result)) => Ok(result),
        }
    }

    /// Fetch at most one row.
    pub async fn query_one<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<Option<SqliteRow>, AppError> {
        match tokio::time::timeout(self.op_timeout, query.fetch_optional(&self.pool)).await {
            Err(_) => Err(AppError::QueryFailed("statement timed out".to_string())),
            Ok(Err(e)) => Err(classify(e, ErrorKind::Query)),
            Ok(Ok(row)) => Ok(row),
        }
    }

    /// Fetch all rows.
    pub async fn query<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<Vec<SqliteRow>, AppError> {
        match tokio::time::timeout(self.op_timeout, query.fetch_all(&self.pool)).await {
            Err(_) => Err(AppError::QueryFailed("statement timed out".to_string())),
            Ok(Err(e)) => Err(classify(e, ErrorKind::Query)),
            Ok(Ok(rows)) => Ok(rows),
        }
    }

    /// Insert `rows` with a single multi-row `VALUES` clause.
    ///
    /// `prefix` is the statement up to and excluding the `VALUES` keyword,
    /// e.g. `"INSERT INTO logs (a, b) "`. `bind` pushes one row's values
    /// onto the builder. Empty row sets are rejected.
    pub async fn bulk_insert<'a, T, F>(
        &self,
        prefix: &str,
        rows: &'a [T],
        bind: F,
    ) -> Result<BulkInsert, AppError>
    where
        F: FnMut(sqlx::query_builder::Separated<'_, 'a, Sqlite, &'static str>, &'a T),
    {
        if rows.is_empty() {
            return Err(AppError::BulkInsertFailed(
                "bulk insert requires at least one row".to_string(),
            ));
        }

        let mut builder = sqlx::QueryBuilder::<Sqlite>::new(prefix);
        builder.push_values(rows.iter(), bind);

        let result =
            match tokio::time::timeout(self.op_timeout, builder.build().execute(&self.pool)).await
            {
                Err(_) => {
                    return Err(AppError::BulkInsertFailed("statement timed out".to_string()))
                }
                Ok(Err(e)) => return Err(classify(e, ErrorKind::BulkInsert)),
                Ok(Ok(result)) => result,
            };

        let affected = result.rows_affected();
        // last_insert_rowid reports the final row of the statement; ids are
        // assigned contiguously within a single multi-row insert.
        let first_insert_id = result.last_insert_rowid() - affected as i64 + 1;

        Ok(BulkInsert {
            affected,
            first_insert_id,
        })
    }

    /// Run `f` inside a transaction: commit on success, roll back on any
    /// error.
    pub async fn with_tx<T, F>(&self, f: F) -> Result<T, AppError>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, AppError>>,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify(e, ErrorKind::Query))?;

        match f(&mut *tx).await {
            Ok(value) => {
                tx.commit()
                    .await
                    .map_err(|e| classify(e, ErrorKind::Query))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!(error = %rollback_err, "transaction rollback failed");
                }
                Err(e)
            }
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(Clone, Copy)]
enum ErrorKind {
    Query,
    Insert,
    BulkInsert,
}

/// Connection loss is reported as store-unavailable; everything else keeps
/// the failing operation's code.
fn classify(err: sqlx::Error, kind: ErrorKind) -> AppError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            AppError::StoreUnavailable(err.to_string())
        }
        _ => match kind {
            ErrorKind::Query => AppError::QueryFailed(err.to_string()),
            ErrorKind::Insert => AppError::InsertFailed(err.to_string()),
            ErrorKind::BulkInsert => AppError::BulkInsertFailed(err.to_string()),
        },
    }
}
