//! In-memory database for tests/dev.
//!
//! Transactions are serialised: `begin` takes the state lock and works on a
//! staged copy that replaces the state on commit. Faults can be injected to
//! exercise commit, rollback and connectivity failures.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use visitrack_core::{NewUser, User, UserId};

use super::{Database, DbError, OutboxId, OutboxRecord, Transaction, TxScope};
use crate::tasks::types::TaskMessage;

const USERS_PHONE_KEY: &str = "users_phone_number_key";
const OUTBOX_TASK_KEY: &str = "task_outbox_task_id_key";

#[derive(Debug, Clone)]
struct OutboxRow {
    record: OutboxRecord,
    relayed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct DbState {
    users: BTreeMap<UserId, User>,
    last_user_id: i64,
    outbox: BTreeMap<OutboxId, OutboxRow>,
    last_outbox_id: i64,
}

#[derive(Debug, Default)]
struct Faults {
    fail_next_commit: AtomicBool,
    fail_next_rollback: AtomicBool,
    unavailable: AtomicBool,
}

impl Faults {
    fn check_available(&self) -> Result<(), DbError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(DbError::Unavailable("in-memory database marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

/// In-memory [`Database`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<DbState>>,
    faults: Arc<Faults>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next commit fails and its changes are discarded.
    pub fn fail_next_commit(&self) {
        self.faults.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// The next rollback reports an error (changes are still discarded).
    pub fn fail_next_rollback(&self) {
        self.faults.fail_next_rollback.store(true, Ordering::SeqCst);
    }

    /// While set, `begin` and every read fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn users(&self) -> Vec<User> {
        self.state.lock().await.users.values().cloned().collect()
    }

    pub async fn user_count(&self) -> usize {
        self.state.lock().await.users.len()
    }

    /// Every outbox row, relayed or not, in insertion order.
    pub async fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.state
            .lock()
            .await
            .outbox
            .values()
            .map(|row| row.record.clone())
            .collect()
    }

    pub async fn unrelayed_count(&self) -> usize {
        self.state
            .lock()
            .await
            .outbox
            .values()
            .filter(|row| row.relayed_at.is_none())
            .count()
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError> {
        self.faults.check_available()?;
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(InMemoryTransaction {
            guard,
            staged,
            faults: self.faults.clone(),
        }))
    }

    async fn get_user(&self, id: UserId) -> Result<User, DbError> {
        self.faults.check_available()?;
        self.state
            .lock()
            .await
            .users
            .get(&id)
            .cloned()
            .ok_or(DbError::NotFound)
    }

    async fn pending_outbox(&self, limit: usize, max_attempts: u32) -> Result<Vec<OutboxRecord>, DbError> {
        self.faults.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .outbox
            .values()
            .filter(|row| row.relayed_at.is_none() && row.record.relay_attempts < max_attempts)
            .take(limit)
            .map(|row| row.record.clone())
            .collect())
    }

    async fn mark_outbox_relayed(&self, ids: &[OutboxId]) -> Result<(), DbError> {
        self.faults.check_available()?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        for id in ids {
            if let Some(row) = state.outbox.get_mut(id) {
                row.relayed_at.get_or_insert(now);
            }
        }
        Ok(())
    }

    async fn record_outbox_failure(&self, id: OutboxId, error: &str) -> Result<(), DbError> {
        self.faults.check_available()?;
        let mut state = self.state.lock().await;
        let row = state.outbox.get_mut(&id).ok_or(DbError::NotFound)?;
        row.record.relay_attempts += 1;
        row.record.last_error = Some(error.to_string());
        Ok(())
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<DbState>,
    staged: DbState,
    faults: Arc<Faults>,
}

#[async_trait]
impl TxScope for InMemoryTransaction {
    async fn create_user(&mut self, user: &NewUser) -> Result<User, DbError> {
        if self
            .staged
            .users
            .values()
            .any(|existing| existing.phone_number == user.phone_number)
        {
            return Err(DbError::unique(USERS_PHONE_KEY));
        }

        self.staged.last_user_id += 1;
        let created = User {
            id: UserId::new(self.staged.last_user_id),
            phone_number: user.phone_number.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            role: user.role,
            created_at: Utc::now(),
            appointments_booked: 0,
            appointments_hosted: 0,
        };
        self.staged.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_user(&mut self, id: UserId) -> Result<User, DbError> {
        self.staged.users.get(&id).cloned().ok_or(DbError::NotFound)
    }

    async fn insert_outbox(&mut self, message: &TaskMessage) -> Result<OutboxId, DbError> {
        if self
            .staged
            .outbox
            .values()
            .any(|row| row.record.message.id == message.id)
        {
            return Err(DbError::unique(OUTBOX_TASK_KEY));
        }

        self.staged.last_outbox_id += 1;
        let id = OutboxId::new(self.staged.last_outbox_id);
        self.staged.outbox.insert(
            id,
            OutboxRow {
                record: OutboxRecord {
                    id,
                    message: message.clone(),
                    created_at: Utc::now(),
                    relay_attempts: 0,
                    last_error: None,
                },
                relayed_at: None,
            },
        );
        Ok(id)
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    fn as_scope(&mut self) -> &mut dyn TxScope {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        let InMemoryTransaction {
            mut guard,
            staged,
            faults,
        } = *self;
        if faults.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(DbError::Unavailable("injected commit failure".into()));
        }
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        if self.faults.fail_next_rollback.swap(false, Ordering::SeqCst) {
            return Err(DbError::Unavailable("injected rollback failure".into()));
        }
        Ok(())
    }
}
