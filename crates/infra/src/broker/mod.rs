//! Durable task broker boundary.
//!
//! A broker stores enqueued tasks, leases them to workers, and decides what
//! happens after each attempt:
//!
//! ```text
//! enqueue ──► Scheduled ──(process_at)──► Pending ──dequeue──► Active (lease)
//!                                            ▲                    │
//!                                            │     ack ───────────┼──► Completed (removed)
//!                       Retry ◄── fail(retryable, budget left) ◄──┤
//!                                          fail(otherwise) ◄──────┴──► Dead (kept)
//! ```
//!
//! Leases expire after the lease timeout; `recover_expired` treats an expired
//! lease as a retryable failure so a crashed worker never strands a task.
//! Every state change checks the lease token, so a late `ack` from a worker
//! whose lease was already recovered is rejected instead of clobbering the
//! new owner.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use visitrack_core::TaskId;

use crate::tasks::types::{QueueName, TaskInfo, TaskMessage, TaskState};

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryBroker;
#[cfg(feature = "redis")]
pub use redis::RedisBroker;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker command failed: {0}")]
    Command(String),

    #[error("task record could not be decoded: {0}")]
    Codec(String),

    #[error("task already enqueued: {0}")]
    Duplicate(TaskId),

    #[error("lease no longer held for task {0}")]
    LeaseLost(TaskId),

    #[error("task not found: {0}")]
    NotFound(TaskId),
}

/// Temporary ownership of a task by one worker.
#[derive(Debug, Clone)]
pub struct Lease {
    pub message: TaskMessage,
    pub token: Uuid,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(message: TaskMessage, lease_timeout: Duration) -> Self {
        let now = Utc::now();
        Self {
            message,
            token: Uuid::now_v7(),
            leased_at: now,
            expires_at: now + chrono::Duration::from_std(lease_timeout).unwrap_or_default(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.message.id
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Failure report for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub retryable: bool,
    pub error: String,
}

impl Failure {
    pub fn retryable(error: impl Into<String>) -> Self {
        Self {
            retryable: true,
            error: error.into(),
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        Self {
            retryable: false,
            error: error.into(),
        }
    }
}

/// Entry in the dead-letter set.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub message: TaskMessage,
    pub dead_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(message: TaskMessage, reason: String) -> Self {
        Self {
            message,
            dead_at: Utc::now(),
            reason,
        }
    }
}

/// Per-queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub scheduled: usize,
    pub active: usize,
    pub retry: usize,
    pub dead: usize,
    /// Tasks acknowledged since the broker started tracking.
    pub completed: u64,
}

/// Broker abstraction.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Store a task. Fails with `Duplicate` if a task with the same id is still held.
    async fn enqueue(&self, message: TaskMessage) -> Result<TaskInfo, BrokerError>;

    /// Lease the next ready task, trying `queues` in order.
    ///
    /// Waits up to `wait` for work to become ready; `Ok(None)` means nothing
    /// was ready in that window.
    async fn dequeue(
        &self,
        queues: &[QueueName],
        wait: Duration,
        lease_timeout: Duration,
    ) -> Result<Option<Lease>, BrokerError>;

    /// Mark the leased task completed and remove it.
    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError>;

    /// Record a failed attempt; returns the resulting state (`Retry` or `Dead`).
    async fn fail(&self, lease: &Lease, failure: Failure) -> Result<TaskState, BrokerError>;

    /// Give a lease back without consuming an attempt.
    async fn requeue(&self, lease: &Lease) -> Result<(), BrokerError>;

    /// Fail every lease past its deadline as retryable; returns how many were recovered.
    async fn recover_expired(&self) -> Result<usize, BrokerError>;

    /// Most recent dead letters of a queue, newest first.
    async fn dead_letters(
        &self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, BrokerError>;

    /// Move a dead task back to pending with a fresh retry budget.
    async fn requeue_dead(&self, queue: &QueueName, id: TaskId) -> Result<TaskInfo, BrokerError>;

    async fn stats(&self, queue: &QueueName) -> Result<QueueStats, BrokerError>;
}

/// Apply a failed attempt to a message: bump the retry counter while budget
/// remains, otherwise leave it for the dead-letter set.
///
/// Shared by broker implementations so the retry decision is identical
/// whatever the storage.
pub(crate) fn apply_failure(
    message: &mut TaskMessage,
    failure: &Failure,
    policy: &crate::tasks::retry::RetryPolicy,
    now: DateTime<Utc>,
) -> TaskState {
    message.last_error = Some(failure.error.clone());
    message.last_failed_at = Some(now);

    if failure.retryable && message.can_retry() {
        message.retried += 1;
        let delay = policy.delay_for_retry(message.retried);
        message.process_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
        TaskState::Retry
    } else {
        TaskState::Dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::retry::RetryPolicy;
    use crate::tasks::types::{Task, TaskDefaults, TaskKind, TaskOptions};

    fn message(max_retry: u32) -> TaskMessage {
        Task::from_bytes(TaskKind::SendVerifyEmail, b"{}".to_vec())
            .with_options(TaskOptions::new().max_retry(max_retry))
            .into_message(&TaskDefaults::default())
    }

    #[test]
    fn retryable_failure_consumes_budget() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5));
        let now = Utc::now();
        let mut msg = message(1);

        assert_eq!(apply_failure(&mut msg, &Failure::retryable("boom"), &policy, now), TaskState::Retry);
        assert_eq!(msg.retried, 1);
        assert_eq!(msg.process_at, now + chrono::Duration::seconds(5));
        assert_eq!(msg.last_error.as_deref(), Some("boom"));

        assert_eq!(apply_failure(&mut msg, &Failure::retryable("boom"), &policy, now), TaskState::Dead);
        assert_eq!(msg.retried, 1);
    }

    #[test]
    fn permanent_failure_ignores_budget() {
        let mut msg = message(10);
        let state = apply_failure(&mut msg, &Failure::permanent("gone"), &RetryPolicy::default(), Utc::now());
        assert_eq!(state, TaskState::Dead);
        assert_eq!(msg.retried, 0);
    }
}
