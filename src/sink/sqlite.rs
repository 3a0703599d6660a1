//! SQLite-backed sink
//!
//! Each batch is committed in a single transaction, so a failed append
//! leaves nothing behind and the whole batch can be retried.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use super::{schema, Sink, SinkError, SinkErrorKind};
use crate::config::DatabaseConfig;
use crate::stream::Record;

/// Rows per INSERT statement; two bound parameters each keeps us well under
/// SQLite's variable limit.
const MAX_ROWS_PER_STATEMENT: usize = 5000;

#[derive(Clone)]
pub struct SqliteSink {
    pool: Pool<Sqlite>,
}

impl SqliteSink {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.url)).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        // WAL lets exports read while batches are being committed
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        sqlx::query(schema::CREATE_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_INGESTED_AT)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

#[async_trait]
impl Sink for SqliteSink {
    async fn append(&self, batch: &[Record]) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let ingested_at = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await.map_err(sink_error)?;

        for chunk in batch.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO records (ingested_at, payload) ");
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(ingested_at).push_bind(record.to_vec());
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(sink_error)?;
        }

        tx.commit().await.map_err(sink_error)?;
        debug!("Committed {} records to SQLite", batch.len());
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.pool.close().await;
        Ok(())
    }
}

/// Map a sqlx error onto the sink error taxonomy
fn sink_error(err: sqlx::Error) -> SinkError {
    let kind = match &err {
        sqlx::Error::Database(db_err) => match db_err.kind() {
            sqlx::error::ErrorKind::UniqueViolation
            | sqlx::error::ErrorKind::ForeignKeyViolation
            | sqlx::error::ErrorKind::NotNullViolation
            | sqlx::error::ErrorKind::CheckViolation => SinkErrorKind::InvalidArgument,
            _ => db_err
                .code()
                .map(|code| kind_for_sqlite_code(&code))
                .unwrap_or(SinkErrorKind::Unknown),
        },
        sqlx::Error::Io(_) => SinkErrorKind::Unavailable,
        sqlx::Error::PoolTimedOut => SinkErrorKind::ResourceExhausted,
        sqlx::Error::PoolClosed => SinkErrorKind::FailedPrecondition,
        sqlx::Error::WorkerCrashed | sqlx::Error::Protocol(_) => SinkErrorKind::Internal,
        sqlx::Error::Configuration(_) | sqlx::Error::Encode(_) => SinkErrorKind::InvalidArgument,
        _ => SinkErrorKind::Unknown,
    };
    SinkError::new(kind, err.to_string())
}

/// Classify an SQLite result code. Extended codes carry the primary code in
/// their low byte (e.g. 517 SQLITE_BUSY_SNAPSHOT -> 5 SQLITE_BUSY).
fn kind_for_sqlite_code(code: &str) -> SinkErrorKind {
    let Ok(code) = code.parse::<i32>() else {
        return SinkErrorKind::Unknown;
    };
    match code & 0xff {
        5 | 6 | 10 | 15 => SinkErrorKind::Unavailable, // BUSY, LOCKED, IOERR, PROTOCOL
        7 | 13 => SinkErrorKind::ResourceExhausted,    // NOMEM, FULL
        3 | 8 | 23 => SinkErrorKind::PermissionDenied, // PERM, READONLY, AUTH
        1 | 17 => SinkErrorKind::FailedPrecondition,   // ERROR (e.g. no such table), SCHEMA
        14 => SinkErrorKind::NotFound,                 // CANTOPEN
        18 | 19 | 20 | 25 => SinkErrorKind::InvalidArgument, // TOOBIG, CONSTRAINT, MISMATCH, RANGE
        4 => SinkErrorKind::Aborted,                   // ABORT
        2 | 11 | 26 => SinkErrorKind::Internal,        // INTERNAL, CORRUPT, NOTADB
        _ => SinkErrorKind::Unknown,
    }
}
