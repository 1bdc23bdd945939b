//! Core task types: kinds, delivery options, broker records and outcomes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use visitrack_core::TaskId;

/// Logical priority class a task is delivered through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    pub const CRITICAL: &'static str = "critical";
    pub const DEFAULT: &'static str = "default";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn critical() -> Self {
        Self::new(Self::CRITICAL)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for QueueName {
    fn default() -> Self {
        Self::new(Self::DEFAULT)
    }
}

impl core::fmt::Display for QueueName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Known task types.
///
/// The wire tag is what travels through the broker; unknown tags stay plain
/// strings in [`TaskMessage`] so the processor can dead-letter them instead of
/// failing to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    SendVerifyEmail,
}

impl TaskKind {
    pub const ALL: &'static [TaskKind] = &[TaskKind::SendVerifyEmail];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::SendVerifyEmail => "task:send_verify_email",
        }
    }
}

impl core::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task type: {0}")]
pub struct UnknownTaskKind(pub String);

impl core::str::FromStr for TaskKind {
    type Err = UnknownTaskKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownTaskKind(s.to_string()))
    }
}

/// Task construction error. Always permanent: retrying cannot fix a payload
/// that does not serialize.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("failed to serialize task payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Composable delivery options. Anything left unset takes the broker default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOptions {
    pub queue: Option<QueueName>,
    pub max_retry: Option<u32>,
    pub process_at: Option<DateTime<Utc>>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<QueueName>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self
    }

    /// Delay delivery relative to now.
    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    /// Layer `overrides` on top of `self`; set fields in `overrides` win.
    pub fn merged(self, overrides: TaskOptions) -> Self {
        Self {
            queue: overrides.queue.or(self.queue),
            max_retry: overrides.max_retry.or(self.max_retry),
            process_at: overrides.process_at.or(self.process_at),
        }
    }
}

/// Broker defaults applied to unset [`TaskOptions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefaults {
    pub queue: QueueName,
    pub max_retry: u32,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            queue: QueueName::default(),
            max_retry: 25,
        }
    }
}

/// An immutable unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    kind: TaskKind,
    payload: Vec<u8>,
    options: TaskOptions,
}

impl Task {
    /// Serialize `payload` as JSON and build a task with default options.
    pub fn new<P: Serialize>(kind: TaskKind, payload: &P) -> Result<Self, TaskError> {
        Ok(Self {
            kind,
            payload: serde_json::to_vec(payload)?,
            options: TaskOptions::default(),
        })
    }

    pub fn from_bytes(kind: TaskKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            options: TaskOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    /// Resolve options against broker defaults into a storable record.
    pub fn into_message(self, defaults: &TaskDefaults) -> TaskMessage {
        let now = Utc::now();
        TaskMessage {
            id: TaskId::new(),
            kind: self.kind.as_str().to_string(),
            payload: self.payload,
            queue: self.options.queue.unwrap_or_else(|| defaults.queue.clone()),
            max_retry: self.options.max_retry.unwrap_or(defaults.max_retry),
            retried: 0,
            process_at: self.options.process_at.unwrap_or(now),
            enqueued_at: now,
            last_error: None,
            last_failed_at: None,
        }
    }
}

/// Broker-level task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: TaskId,
    /// Wire tag, see [`TaskKind::as_str`].
    pub kind: String,
    pub payload: Vec<u8>,
    pub queue: QueueName,
    pub max_retry: u32,
    /// Redeliveries so far; the first attempt runs with `retried == 0`.
    pub retried: u32,
    pub process_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub last_failed_at: Option<DateTime<Utc>>,
}

impl TaskMessage {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.process_at <= now
    }

    /// Whether another redelivery fits in the retry budget.
    pub fn can_retry(&self) -> bool {
        self.retried < self.max_retry
    }

    /// Attempts made once the current one finishes.
    pub fn attempts(&self) -> u32 {
        self.retried + 1
    }
}

/// Lifecycle state of a task inside the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Ready, waiting for a worker
    Pending,
    /// Waiting for its first `process_at`
    Scheduled,
    /// Leased by a worker
    Active,
    /// Failed, waiting for its next attempt
    Retry,
    /// Finished and removed
    Completed,
    /// Exhausted or permanently failed, kept for inspection
    Dead,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Scheduled => "scheduled",
            TaskState::Active => "active",
            TaskState::Retry => "retry",
            TaskState::Completed => "completed",
            TaskState::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Dead)
    }
}

impl core::fmt::Display for TaskState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enqueue metadata returned to producers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub kind: String,
    pub queue: QueueName,
    pub max_retry: u32,
    pub retried: u32,
    pub process_at: DateTime<Utc>,
    pub state: TaskState,
}

impl TaskInfo {
    pub fn from_message(message: &TaskMessage, state: TaskState) -> Self {
        Self {
            id: message.id,
            kind: message.kind.clone(),
            queue: message.queue.clone(),
            max_retry: message.max_retry,
            retried: message.retried,
            process_at: message.process_at,
            state,
        }
    }

    /// Redeliveries still available.
    pub fn remaining_retries(&self) -> u32 {
        self.max_retry.saturating_sub(self.retried)
    }
}

/// Result a handler reports for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Done; the task is removed.
    Success,
    /// Transient failure; redelivered while the retry budget lasts.
    Retry(String),
    /// Retrying cannot help; dead-lettered immediately.
    Permanent(String),
}

impl TaskOutcome {
    pub fn retry(reason: impl core::fmt::Display) -> Self {
        Self::Retry(reason.to_string())
    }

    pub fn permanent(reason: impl core::fmt::Display) -> Self {
        Self::Permanent(reason.to_string())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success)
    }
}

/// Per-attempt context handed to handlers.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub queue: QueueName,
    pub retried: u32,
    pub max_retry: u32,
    /// Handlers running past this are cancelled and the attempt counts as a retryable failure.
    pub deadline: tokio::time::Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_wire_tag() {
        let kind: TaskKind = "task:send_verify_email".parse().unwrap();
        assert_eq!(kind, TaskKind::SendVerifyEmail);
        assert!("task:unknown".parse::<TaskKind>().is_err());
    }

    #[test]
    fn unset_options_take_defaults() {
        let task = Task::new(TaskKind::SendVerifyEmail, &serde_json::json!({"user_id": "1"})).unwrap();
        let before = Utc::now();
        let message = task.into_message(&TaskDefaults::default());

        assert_eq!(message.queue, QueueName::default());
        assert_eq!(message.max_retry, 25);
        assert_eq!(message.retried, 0);
        assert!(message.process_at >= before);
        assert!(message.is_due(Utc::now()));
    }

    #[test]
    fn options_are_independent() {
        let at = Utc::now() + chrono::Duration::hours(1);
        let options = TaskOptions::new().max_retry(3);
        let merged = options.clone().merged(TaskOptions::new().process_at(at));

        assert_eq!(merged.max_retry, Some(3));
        assert_eq!(merged.process_at, Some(at));
        assert_eq!(merged.queue, None);

        let overridden = options.merged(TaskOptions::new().max_retry(7).queue("critical"));
        assert_eq!(overridden.max_retry, Some(7));
        assert_eq!(overridden.queue, Some(QueueName::critical()));
    }

    #[test]
    fn payload_serialization_is_deterministic() {
        #[derive(Serialize)]
        struct Payload {
            user_id: String,
            attempt: u8,
        }
        let p = Payload { user_id: "9".into(), attempt: 1 };
        let a = Task::new(TaskKind::SendVerifyEmail, &p).unwrap();
        let b = Task::new(TaskKind::SendVerifyEmail, &p).unwrap();
        assert_eq!(a.payload(), b.payload());
        assert_eq!(a.payload(), br#"{"user_id":"9","attempt":1}"#);
    }

    #[test]
    fn retry_budget() {
        let mut message = Task::from_bytes(TaskKind::SendVerifyEmail, vec![])
            .with_options(TaskOptions::new().max_retry(1))
            .into_message(&TaskDefaults::default());
        assert!(message.can_retry());
        message.retried = 1;
        assert!(!message.can_retry());
        assert_eq!(message.attempts(), 2);
    }
}
