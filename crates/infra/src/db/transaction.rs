//! Transaction runner.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::error;

use super::{Database, TxError, TxScope};

/// Runs units of work inside a database transaction.
///
/// Commits when the work succeeds, rolls back when it fails. No retries here:
/// transient errors go back to the caller, which decides whether to run the
/// whole operation again.
#[derive(Clone)]
pub struct TransactionRunner {
    db: Arc<dyn Database>,
}

impl TransactionRunner {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Run `work` inside a transaction.
    ///
    /// `work` only gets the transaction-scoped accessor. If the work fails and
    /// the rollback fails too, the result is [`TxError::Rollback`] carrying both.
    pub async fn run_in_transaction<T, E, F>(&self, work: F) -> Result<T, TxError<E>>
    where
        F: for<'t> FnOnce(&'t mut dyn TxScope) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: Send + std::fmt::Display,
    {
        let mut tx = self.db.begin().await.map_err(TxError::Begin)?;

        match work(tx.as_scope()).await {
            Ok(value) => {
                tx.commit().await.map_err(|err| {
                    error!(error = %err, "transaction commit failed");
                    TxError::Commit(err)
                })?;
                Ok(value)
            }
            Err(work_err) => match tx.rollback().await {
                Ok(()) => Err(TxError::Work(work_err)),
                Err(rollback) => {
                    error!(error = %work_err, rollback_error = %rollback, "transaction rollback failed");
                    Err(TxError::Rollback {
                        work: work_err,
                        rollback,
                    })
                }
            },
        }
    }
}

impl std::fmt::Debug for TransactionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRunner").finish_non_exhaustive()
    }
}
