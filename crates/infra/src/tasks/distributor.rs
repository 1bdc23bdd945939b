//! Producer side: turn a [`Task`] into a broker record and enqueue it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::broker::{Broker, BrokerError};
use crate::tasks::types::{Task, TaskDefaults, TaskError, TaskInfo};

#[derive(Debug, thiserror::Error)]
pub enum DistributeError {
    /// The payload could not be serialized. Permanent: a caller bug.
    #[error(transparent)]
    Serialization(#[from] TaskError),

    #[error("failed to enqueue task: {0}")]
    Broker(#[from] BrokerError),
}

impl DistributeError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DistributeError::Broker(BrokerError::Unavailable(_) | BrokerError::Command(_))
        )
    }
}

/// Enqueues tasks for background processing.
#[async_trait]
pub trait TaskDistributor: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<TaskInfo, DistributeError>;
}

/// [`TaskDistributor`] that enqueues straight onto a [`Broker`].
#[derive(Clone)]
pub struct BrokerDistributor {
    broker: Arc<dyn Broker>,
    defaults: TaskDefaults,
}

impl BrokerDistributor {
    pub fn new(broker: Arc<dyn Broker>, defaults: TaskDefaults) -> Self {
        Self { broker, defaults }
    }

    pub fn defaults(&self) -> &TaskDefaults {
        &self.defaults
    }
}

impl std::fmt::Debug for BrokerDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerDistributor")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TaskDistributor for BrokerDistributor {
    async fn enqueue(&self, task: Task) -> Result<TaskInfo, DistributeError> {
        let kind = task.kind();
        let message = task.into_message(&self.defaults);
        let task_id = message.id;

        match self.broker.enqueue(message).await {
            Ok(info) => {
                info!(
                    task_id = %info.id,
                    task_type = %kind,
                    queue = %info.queue,
                    max_retry = info.max_retry,
                    process_at = %info.process_at,
                    "enqueued task"
                );
                Ok(info)
            }
            Err(err) => {
                error!(task_id = %task_id, task_type = %kind, error = %err, "failed to enqueue task");
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::tasks::types::{QueueName, TaskKind, TaskOptions, TaskState};

    #[tokio::test]
    async fn unset_options_take_distributor_defaults() {
        let broker = Arc::new(InMemoryBroker::new());
        let distributor = BrokerDistributor::new(
            broker.clone(),
            TaskDefaults {
                queue: QueueName::default(),
                max_retry: 3,
            },
        );

        let info = distributor
            .enqueue(Task::from_bytes(TaskKind::SendVerifyEmail, b"{}".to_vec()))
            .await
            .unwrap();
        assert_eq!(info.queue, QueueName::default());
        assert_eq!(info.max_retry, 3);
        assert_eq!(info.remaining_retries(), 3);
        assert_eq!(info.state, TaskState::Pending);
        assert_eq!(broker.len().await, 1);
    }

    #[tokio::test]
    async fn explicit_options_win() {
        let broker = Arc::new(InMemoryBroker::new());
        let distributor = BrokerDistributor::new(broker, TaskDefaults::default());

        let task = Task::from_bytes(TaskKind::SendVerifyEmail, b"{}".to_vec()).with_options(
            TaskOptions::new()
                .queue("critical")
                .max_retry(10)
                .process_in(std::time::Duration::from_secs(10)),
        );
        let info = distributor.enqueue(task).await.unwrap();
        assert_eq!(info.queue, QueueName::critical());
        assert_eq!(info.max_retry, 10);
        assert_eq!(info.state, TaskState::Scheduled);
    }

    #[tokio::test]
    async fn broker_outage_is_retryable_error() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_available(false);
        let distributor = BrokerDistributor::new(broker.clone(), TaskDefaults::default());

        let err = distributor
            .enqueue(Task::from_bytes(TaskKind::SendVerifyEmail, b"{}".to_vec()))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        broker.set_available(true);
        assert_eq!(broker.len().await, 0);
    }
}
