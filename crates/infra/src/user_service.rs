//! User creation with its follow-up verification task.

use std::sync::Arc;

use tracing::info;

use visitrack_core::NewUser;

use crate::config::DeliverySettings;
use crate::db::{CompositeError, CreateUserTxResult, HookError, TransactionRunner, create_user_tx};
use crate::handlers::send_verify_email_task;
use crate::outbox;
use crate::tasks::distributor::TaskDistributor;
use crate::tasks::types::{TaskDefaults, TaskInfo, TaskOptions};

/// How the write path hands the verification task over.
#[derive(Clone)]
pub enum DispatchMode {
    /// Stage the task in the outbox within the user transaction; the relay enqueues it after commit.
    Outbox,
    /// Enqueue on the broker from inside the transaction; a broker failure rolls the user back.
    Direct(Arc<dyn TaskDistributor>),
}

impl std::fmt::Debug for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchMode::Outbox => f.write_str("Outbox"),
            DispatchMode::Direct(_) => f.write_str("Direct"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserService {
    runner: TransactionRunner,
    mode: DispatchMode,
    delivery: DeliverySettings,
    defaults: TaskDefaults,
}

impl UserService {
    pub fn new(runner: TransactionRunner, mode: DispatchMode, delivery: DeliverySettings, defaults: TaskDefaults) -> Self {
        Self {
            runner,
            mode,
            delivery,
            defaults,
        }
    }

    /// Create a user and schedule its verification message atomically.
    ///
    /// The task uses the configured delivery options with `overrides` layered
    /// on top. Either both the user and the task exist afterwards, or neither.
    pub async fn create_user(
        &self,
        new_user: NewUser,
        overrides: TaskOptions,
    ) -> Result<CreateUserTxResult<TaskInfo>, CompositeError> {
        let options = self.delivery.options().merged(overrides);
        let mode = self.mode.clone();
        let defaults = self.defaults.clone();

        let result = create_user_tx(&self.runner, new_user, move |tx, user| {
            let user_id = user.id;
            Box::pin(async move {
                let task = send_verify_email_task(user_id, options)?;
                let info = match mode {
                    DispatchMode::Outbox => outbox::stage(tx, task, &defaults).await?,
                    DispatchMode::Direct(distributor) => distributor.enqueue(task).await?,
                };
                Ok::<_, HookError>(info)
            })
        })
        .await?;

        info!(
            user_id = %result.user.id,
            task_id = %result.task.id,
            queue = %result.task.queue,
            mode = ?self.mode,
            "created user"
        );
        Ok(result)
    }
}
