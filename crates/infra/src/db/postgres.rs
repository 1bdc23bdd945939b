//! Postgres-backed database boundary.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | DbError |
//! |------------|----------------------|---------|
//! | Database (unique violation) | `23505` | `UniqueViolation { constraint }` |
//! | Database (other) | Any other | `Query` |
//! | RowNotFound | N/A | `NotFound` |
//! | PoolTimedOut / PoolClosed / Io / Tls | N/A | `Unavailable` |
//! | Other | N/A | `Query` |
//!
//! ## Outbox
//!
//! `task_outbox` rows are inserted inside the caller's transaction and read by
//! the relay afterwards with plain pooled queries, so no transaction is ever
//! held open while the relay talks to the broker.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row};
use tracing::instrument;
use uuid::Uuid;

use visitrack_core::{NewUser, Role, TaskId, User, UserId};

use super::{Database, DbError, OutboxId, OutboxRecord, Transaction, TxScope};
use crate::config::DatabaseConfig;
use crate::tasks::types::{QueueName, TaskMessage};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL PRIMARY KEY,
    phone_number TEXT NOT NULL,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'user',
    appointments_booked INTEGER NOT NULL DEFAULT 0,
    appointments_hosted INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT users_phone_number_key UNIQUE (phone_number)
);

CREATE TABLE IF NOT EXISTS task_outbox (
    id BIGSERIAL PRIMARY KEY,
    task_id UUID NOT NULL,
    task_type TEXT NOT NULL,
    payload BYTEA NOT NULL,
    queue TEXT NOT NULL,
    max_retry INTEGER NOT NULL,
    process_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    relayed_at TIMESTAMPTZ,
    relay_attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    CONSTRAINT task_outbox_task_id_key UNIQUE (task_id)
);

CREATE INDEX IF NOT EXISTS task_outbox_unrelayed_idx
    ON task_outbox (id)
    WHERE relayed_at IS NULL;
"#;

const USER_COLUMNS: &str =
    "id, phone_number, first_name, last_name, role, created_at, appointments_booked, appointments_hosted";

/// Postgres [`Database`] over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the tables this crate owns if they are missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), DbError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError> {
        let tx = self.pool.begin().await.map_err(|e| map_sqlx_error("begin", e))?;
        Ok(Box::new(PgTransaction { tx }))
    }

    #[instrument(skip(self), fields(user_id = %id), err)]
    async fn get_user(&self, id: UserId) -> Result<User, DbError> {
        let row: UserRow = sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id.get())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_user", e))?;
        Ok(row.0)
    }

    #[instrument(skip(self), err)]
    async fn pending_outbox(&self, limit: usize, max_attempts: u32) -> Result<Vec<OutboxRecord>, DbError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            r#"
            SELECT id, task_id, task_type, payload, queue, max_retry, process_at,
                   created_at, relay_attempts, last_error
            FROM task_outbox
            WHERE relayed_at IS NULL AND relay_attempts < $2
            ORDER BY id ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_outbox", e))?;

        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn mark_outbox_relayed(&self, ids: &[OutboxId]) -> Result<(), DbError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = ids.iter().map(OutboxId::get).collect();
        sqlx::query("UPDATE task_outbox SET relayed_at = now() WHERE id = ANY($1) AND relayed_at IS NULL")
            .bind(&ids)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_outbox_relayed", e))?;
        Ok(())
    }

    #[instrument(skip(self, error), fields(outbox_id = %id), err)]
    async fn record_outbox_failure(&self, id: OutboxId, error: &str) -> Result<(), DbError> {
        let result = sqlx::query(
            "UPDATE task_outbox SET relay_attempts = relay_attempts + 1, last_error = $2 WHERE id = $1",
        )
        .bind(id.get())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_outbox_failure", e))?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }
}

/// An open Postgres transaction. Dropping it without commit rolls back.
struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl TxScope for PgTransaction {
    async fn create_user(&mut self, user: &NewUser) -> Result<User, DbError> {
        let row: UserRow = sqlx::query_as(&format!(
            "INSERT INTO users (phone_number, first_name, last_name, role) \
             VALUES ($1, $2, $3, $4) RETURNING {USER_COLUMNS}"
        ))
        .bind(&user.phone_number)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.role.as_str())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("create_user", e))?;
        Ok(row.0)
    }

    async fn get_user(&mut self, id: UserId) -> Result<User, DbError> {
        let row: UserRow = sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id.get())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("get_user", e))?;
        Ok(row.0)
    }

    async fn insert_outbox(&mut self, message: &TaskMessage) -> Result<OutboxId, DbError> {
        let row = sqlx::query(
            r#"
            INSERT INTO task_outbox (task_id, task_type, payload, queue, max_retry, process_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(&message.kind)
        .bind(&message.payload)
        .bind(message.queue.as_str())
        .bind(i32::try_from(message.max_retry).unwrap_or(i32::MAX))
        .bind(message.process_at)
        .bind(message.enqueued_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_outbox", e))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| map_sqlx_error("insert_outbox", e))?;
        Ok(OutboxId::new(id))
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    fn as_scope(&mut self) -> &mut dyn TxScope {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        self.tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Map SQLx errors to [`DbError`].
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DbError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.code().as_deref() == Some("23505") {
                DbError::UniqueViolation {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                }
            } else {
                DbError::Query(format!("database error in {}: {}", operation, db_err.message()))
            }
        }
        sqlx::Error::RowNotFound => DbError::NotFound,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            DbError::Unavailable(format!("connection pool unavailable in {}", operation))
        }
        sqlx::Error::Io(e) => DbError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => DbError::Unavailable(format!("tls error in {}: {}", operation, e)),
        other => DbError::Query(format!("error in {}: {}", operation, other)),
    }
}

// SQLx row types

struct UserRow(User);

impl<'r> FromRow<'r, PgRow> for UserRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let role: String = row.try_get("role")?;
        let role: Role = role.parse().map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let id: i64 = row.try_get("id")?;

        Ok(Self(User {
            id: UserId::new(id),
            phone_number: row.try_get("phone_number")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            role,
            created_at: row.try_get("created_at")?,
            appointments_booked: row.try_get("appointments_booked")?,
            appointments_hosted: row.try_get("appointments_hosted")?,
        }))
    }
}

struct OutboxRow(OutboxRecord);

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: i64 = row.try_get("id")?;
        let task_id: Uuid = row.try_get("task_id")?;
        let queue: String = row.try_get("queue")?;
        let max_retry: i32 = row.try_get("max_retry")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let relay_attempts: i32 = row.try_get("relay_attempts")?;

        Ok(Self(OutboxRecord {
            id: OutboxId::new(id),
            message: TaskMessage {
                id: TaskId::from_uuid(task_id),
                kind: row.try_get("task_type")?,
                payload: row.try_get("payload")?,
                queue: QueueName::new(queue),
                max_retry: u32::try_from(max_retry).unwrap_or(0),
                retried: 0,
                process_at: row.try_get("process_at")?,
                enqueued_at: created_at,
                last_error: None,
                last_failed_at: None,
            },
            created_at,
            relay_attempts: u32::try_from(relay_attempts).unwrap_or(0),
            last_error: row.try_get("last_error")?,
        }))
    }
}
