//! `task:send_verify_email`: send a verification message to a newly created user.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use visitrack_core::{User, UserId};

use crate::db::{Database, DbError};
use crate::tasks::registry::TaskHandler;
use crate::tasks::types::{Task, TaskContext, TaskError, TaskKind, TaskOptions, TaskOutcome};

/// Task payload. The id travels as a decimal string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendVerifyEmailPayload {
    pub user_id: String,
}

impl SendVerifyEmailPayload {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id: user_id.to_string(),
        }
    }
}

/// Build the verification task for `user_id`.
pub fn send_verify_email_task(user_id: UserId, options: TaskOptions) -> Result<Task, TaskError> {
    Ok(Task::new(TaskKind::SendVerifyEmail, &SendVerifyEmailPayload::new(user_id))?.with_options(options))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Worth retrying (provider timeout, rate limit, ...).
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// The provider refused the message; retrying will not help.
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

/// Delivers verification messages. Constructed explicitly and injected into the handler.
#[async_trait]
pub trait VerificationSender: Send + Sync {
    async fn send_verification(&self, user: &User) -> Result<(), SendError>;

    /// Release provider resources at shutdown.
    async fn close(&self) -> Result<(), SendError> {
        Ok(())
    }
}

/// Sender that only logs. Default until a provider integration is configured.
#[derive(Debug, Clone, Default)]
pub struct LogVerificationSender;

#[async_trait]
impl VerificationSender for LogVerificationSender {
    async fn send_verification(&self, user: &User) -> Result<(), SendError> {
        info!(user_id = %user.id, "verification message sent (log only)");
        Ok(())
    }
}

/// Handler for [`TaskKind::SendVerifyEmail`].
///
/// Re-running it re-sends the message and never touches the user row, so
/// duplicate deliveries are harmless.
pub struct SendVerifyEmailHandler {
    db: Arc<dyn Database>,
    sender: Arc<dyn VerificationSender>,
}

impl SendVerifyEmailHandler {
    pub fn new(db: Arc<dyn Database>, sender: Arc<dyn VerificationSender>) -> Self {
        Self { db, sender }
    }
}

#[async_trait]
impl TaskHandler for SendVerifyEmailHandler {
    async fn handle(&self, ctx: &TaskContext, payload: &[u8]) -> TaskOutcome {
        let payload: SendVerifyEmailPayload = match serde_json::from_slice(payload) {
            Ok(payload) => payload,
            Err(err) => {
                error!(task_id = %ctx.task_id, error = %err, "failed to decode task payload");
                return TaskOutcome::permanent(format!("malformed payload: {err}"));
            }
        };

        let user_id: UserId = match payload.user_id.parse() {
            Ok(id) => id,
            Err(err) => {
                error!(task_id = %ctx.task_id, user_id = %payload.user_id, error = %err, "invalid user id");
                return TaskOutcome::permanent(err);
            }
        };

        let user = match self.db.get_user(user_id).await {
            Ok(user) => user,
            Err(DbError::NotFound) => {
                warn!(task_id = %ctx.task_id, user_id = %user_id, "user no longer exists");
                return TaskOutcome::permanent(format!("user {user_id} not found"));
            }
            Err(err) => return TaskOutcome::retry(format!("failed to load user {user_id}: {err}")),
        };

        match self.sender.send_verification(&user).await {
            Ok(()) => {
                info!(task_id = %ctx.task_id, user_id = %user_id, "processed verification task");
                TaskOutcome::Success
            }
            Err(err @ SendError::Transient(_)) => TaskOutcome::retry(err),
            Err(err @ SendError::Rejected(_)) => TaskOutcome::permanent(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Mutex;
    use visitrack_core::{NewUser, TaskId};

    use super::*;
    use crate::db::InMemoryDatabase;
    use crate::tasks::types::QueueName;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<UserId>>,
        fail_with: Mutex<Option<SendError>>,
    }

    #[async_trait]
    impl VerificationSender for RecordingSender {
        async fn send_verification(&self, user: &User) -> Result<(), SendError> {
            if let Some(err) = self.fail_with.lock().await.clone() {
                return Err(err);
            }
            self.sent.lock().await.push(user.id);
            Ok(())
        }
    }

    fn ctx() -> TaskContext {
        TaskContext {
            task_id: TaskId::new(),
            kind: TaskKind::SendVerifyEmail,
            queue: QueueName::critical(),
            retried: 0,
            max_retry: 10,
            deadline: tokio::time::Instant::now() + Duration::from_secs(30),
        }
    }

    async fn seeded() -> (Arc<InMemoryDatabase>, User) {
        let db = Arc::new(InMemoryDatabase::new());
        let mut tx = db.begin().await.unwrap();
        let user = tx.create_user(&NewUser::new("+15550001", "Ada", "Lovelace")).await.unwrap();
        tx.commit().await.unwrap();
        (db, user)
    }

    fn payload(user_id: &str) -> Vec<u8> {
        serde_json::to_vec(&SendVerifyEmailPayload {
            user_id: user_id.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn task_carries_decimal_user_id() {
        let task = send_verify_email_task(UserId::new(42), TaskOptions::new()).unwrap();
        assert_eq!(task.kind(), TaskKind::SendVerifyEmail);
        assert_eq!(task.payload(), br#"{"user_id":"42"}"#);
    }

    #[tokio::test]
    async fn existing_user_succeeds() {
        let (db, user) = seeded().await;
        let sender = Arc::new(RecordingSender::default());
        let handler = SendVerifyEmailHandler::new(db, sender.clone());

        let outcome = handler.handle(&ctx(), &payload(&user.id.to_string())).await;
        assert_eq!(outcome, TaskOutcome::Success);
        assert_eq!(*sender.sent.lock().await, vec![user.id]);
    }

    #[tokio::test]
    async fn malformed_payload_and_bad_ids_are_permanent() {
        let (db, _) = seeded().await;
        let handler = SendVerifyEmailHandler::new(db, Arc::new(LogVerificationSender));

        for raw in [b"not json".to_vec(), payload("abc"), payload("-3")] {
            let outcome = handler.handle(&ctx(), &raw).await;
            assert!(matches!(outcome, TaskOutcome::Permanent(_)), "{outcome:?}");
        }
    }

    #[tokio::test]
    async fn missing_user_is_permanent() {
        let (db, _) = seeded().await;
        let handler = SendVerifyEmailHandler::new(db, Arc::new(LogVerificationSender));

        let outcome = handler.handle(&ctx(), &payload("999")).await;
        assert!(matches!(outcome, TaskOutcome::Permanent(reason) if reason.contains("not found")));
    }

    #[tokio::test]
    async fn database_outage_is_retryable() {
        let (db, user) = seeded().await;
        db.set_unavailable(true);
        let handler = SendVerifyEmailHandler::new(db, Arc::new(LogVerificationSender));

        let outcome = handler.handle(&ctx(), &payload(&user.id.to_string())).await;
        assert!(matches!(outcome, TaskOutcome::Retry(_)));
    }

    #[tokio::test]
    async fn sender_errors_map_to_outcomes() {
        let (db, user) = seeded().await;
        let sender = Arc::new(RecordingSender::default());
        let handler = SendVerifyEmailHandler::new(db, sender.clone());
        let raw = payload(&user.id.to_string());

        *sender.fail_with.lock().await = Some(SendError::Transient("provider timeout".into()));
        assert!(matches!(handler.handle(&ctx(), &raw).await, TaskOutcome::Retry(_)));

        *sender.fail_with.lock().await = Some(SendError::Rejected("invalid number".into()));
        assert!(matches!(handler.handle(&ctx(), &raw).await, TaskOutcome::Permanent(_)));
    }
}
