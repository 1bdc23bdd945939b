//! Database boundary.
//!
//! All writes go through a [`Transaction`]; the unit of work only ever sees the
//! transaction-scoped accessor [`TxScope`], so it cannot accidentally bypass
//! the transaction with a pooled connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use visitrack_core::{NewUser, User, UserId};

use crate::tasks::types::TaskMessage;

pub mod composite;
pub mod error;
pub mod in_memory;
pub mod postgres;
pub mod transaction;

pub use composite::{CompositeError, CompositeWrite, CreateUserTxResult, HookError, create_user_tx};
pub use error::{DbError, TxError};
pub use in_memory::InMemoryDatabase;
pub use postgres::PgDatabase;
pub use transaction::TransactionRunner;

/// Row id in the task outbox.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxId(i64);

impl OutboxId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl core::fmt::Display for OutboxId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A committed task waiting to be relayed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    pub id: OutboxId,
    pub message: TaskMessage,
    pub created_at: DateTime<Utc>,
    pub relay_attempts: u32,
    pub last_error: Option<String>,
}

/// Transaction-scoped accessor. Everything a unit of work reads or writes goes through here.
#[async_trait]
pub trait TxScope: Send {
    /// Insert a user; a taken phone number is `DbError::UniqueViolation`.
    async fn create_user(&mut self, user: &NewUser) -> Result<User, DbError>;

    async fn get_user(&mut self, id: UserId) -> Result<User, DbError>;

    /// Stage a task for the relay; visible to it only once the transaction commits.
    async fn insert_outbox(&mut self, message: &TaskMessage) -> Result<OutboxId, DbError>;
}

/// An open transaction.
#[async_trait]
pub trait Transaction: TxScope {
    fn as_scope(&mut self) -> &mut dyn TxScope;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}

/// Database handle shared across the process.
#[async_trait]
pub trait Database: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError>;

    /// Non-transactional read, used by task handlers.
    async fn get_user(&self, id: UserId) -> Result<User, DbError>;

    /// Oldest unrelayed outbox rows first, skipping rows that already failed
    /// `max_attempts` relay attempts.
    async fn pending_outbox(&self, limit: usize, max_attempts: u32) -> Result<Vec<OutboxRecord>, DbError>;

    async fn mark_outbox_relayed(&self, ids: &[OutboxId]) -> Result<(), DbError>;

    async fn record_outbox_failure(&self, id: OutboxId, error: &str) -> Result<(), DbError>;
}
