//! Composite writes: a primary database write plus a post-write hook that
//! succeed or fail as one transaction.

use futures::future::BoxFuture;
use tracing::{debug, warn};

use visitrack_core::{NewUser, User};

use super::{DbError, TransactionRunner, TxError, TxScope};
use crate::tasks::distributor::DistributeError;
use crate::tasks::types::TaskError;

/// Failure reported by a post-write hook.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error(transparent)]
    Distribute(#[from] DistributeError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Error from a [`CompositeWrite`].
#[derive(Debug, thiserror::Error)]
pub enum CompositeError {
    /// The primary write hit a uniqueness constraint.
    #[error("{operation}: already exists ({message})")]
    AlreadyExists { operation: &'static str, message: String },

    /// The primary write succeeded but the hook failed; nothing was committed.
    #[error("{operation}: post-write hook failed: {source}")]
    Hook {
        operation: &'static str,
        #[source]
        source: HookError,
    },

    #[error("{operation}: internal error: {message}")]
    Internal { operation: &'static str, message: String },
}

impl CompositeError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, CompositeError::AlreadyExists { .. })
    }

    pub fn operation(&self) -> &'static str {
        match self {
            CompositeError::AlreadyExists { operation, .. }
            | CompositeError::Hook { operation, .. }
            | CompositeError::Internal { operation, .. } => operation,
        }
    }
}

/// Which step of the composite write failed.
#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error("primary write failed: {0}")]
    Primary(DbError),

    #[error("post-write hook failed: {0}")]
    Hook(HookError),
}

/// A named transactional operation: primary write, then a hook that sees its
/// result, both inside one transaction.
#[derive(Debug, Clone, Copy)]
pub struct CompositeWrite {
    name: &'static str,
}

impl CompositeWrite {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run `primary`, then `hook` with its result, and commit only if both succeed.
    ///
    /// A failing primary write aborts before the hook runs. A failing hook
    /// rolls back the primary write.
    pub async fn execute<T, M, P, H>(
        &self,
        runner: &TransactionRunner,
        primary: P,
        hook: H,
    ) -> Result<(T, M), CompositeError>
    where
        T: Send + Sync + 'static,
        M: Send + 'static,
        P: for<'t> FnOnce(&'t mut dyn TxScope) -> BoxFuture<'t, Result<T, DbError>> + Send + 'static,
        H: for<'t> FnOnce(&'t mut dyn TxScope, &'t T) -> BoxFuture<'t, Result<M, HookError>> + Send + 'static,
    {
        let result = runner
            .run_in_transaction(move |tx| {
                Box::pin(async move {
                    let record = primary(&mut *tx).await.map_err(StepError::Primary)?;
                    let meta = hook(&mut *tx, &record).await.map_err(StepError::Hook)?;
                    Ok::<_, StepError>((record, meta))
                })
            })
            .await;

        match result {
            Ok(value) => {
                debug!(operation = self.name, "composite write committed");
                Ok(value)
            }
            Err(err) => Err(self.classify(err)),
        }
    }

    fn classify(&self, err: TxError<StepError>) -> CompositeError {
        let operation = self.name;
        match err {
            TxError::Work(StepError::Primary(DbError::UniqueViolation { constraint })) => {
                CompositeError::AlreadyExists {
                    operation,
                    message: format!("unique constraint {constraint}"),
                }
            }
            TxError::Work(StepError::Primary(db)) => CompositeError::Internal {
                operation,
                message: db.to_string(),
            },
            TxError::Work(StepError::Hook(source)) => {
                warn!(operation, error = %source, "post-write hook failed; rolled back");
                CompositeError::Hook { operation, source }
            }
            TxError::Begin(db) | TxError::Commit(db) => CompositeError::Internal {
                operation,
                message: db.to_string(),
            },
            rollback @ TxError::Rollback { .. } => CompositeError::Internal {
                operation,
                message: rollback.to_string(),
            },
        }
    }
}

/// Result of [`create_user_tx`].
#[derive(Debug, Clone)]
pub struct CreateUserTxResult<M> {
    pub user: User,
    pub task: M,
}

/// Create a user and run `after_create` with it in the same transaction.
///
/// A duplicate phone number is [`CompositeError::AlreadyExists`] and
/// `after_create` never runs.
pub async fn create_user_tx<M, H>(
    runner: &TransactionRunner,
    new_user: NewUser,
    after_create: H,
) -> Result<CreateUserTxResult<M>, CompositeError>
where
    M: Send + 'static,
    H: for<'t> FnOnce(&'t mut dyn TxScope, &'t User) -> BoxFuture<'t, Result<M, HookError>> + Send + 'static,
{
    let (user, task) = CompositeWrite::new("create_user")
        .execute(
            runner,
            move |tx| Box::pin(async move { tx.create_user(&new_user).await }),
            after_create,
        )
        .await?;
    Ok(CreateUserTxResult { user, task })
}
