//! In-memory broker for tests/dev.
//!
//! Same state machine as the Redis broker, held behind one async mutex. Waiting
//! dequeues park on a [`Notify`] and wake on enqueue, requeue or the next due
//! `process_at`, whichever comes first.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use visitrack_core::TaskId;

use super::{Broker, BrokerError, DeadLetterEntry, Failure, Lease, QueueStats, apply_failure};
use crate::tasks::retry::RetryPolicy;
use crate::tasks::types::{QueueName, TaskInfo, TaskMessage, TaskState};

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<TaskId>,
    scheduled: BTreeSet<(DateTime<Utc>, TaskId)>,
    retry: BTreeSet<(DateTime<Utc>, TaskId)>,
    dead: Vec<DeadLetterEntry>,
    completed: u64,
}

impl QueueState {
    /// Move every scheduled or retry entry whose time has come to pending.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        for set in [&mut self.scheduled, &mut self.retry] {
            while let Some(&(at, id)) = set.first() {
                if at > now {
                    break;
                }
                set.pop_first();
                self.pending.push_back(id);
            }
        }
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        let scheduled = self.scheduled.first().map(|(at, _)| *at);
        let retry = self.retry.first().map(|(at, _)| *at);
        match (scheduled, retry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn holds_dead(&self, id: TaskId) -> bool {
        self.dead.iter().any(|entry| entry.message.id == id)
    }
}

#[derive(Debug)]
struct ActiveEntry {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    /// Every task not yet completed or dead.
    tasks: HashMap<TaskId, TaskMessage>,
    active: HashMap<TaskId, ActiveEntry>,
    queues: HashMap<QueueName, QueueState>,
}

impl State {
    fn queue(&mut self, name: &QueueName) -> &mut QueueState {
        self.queues.entry(name.clone()).or_default()
    }

    fn lease_next(
        &mut self,
        queues: &[QueueName],
        now: DateTime<Utc>,
        lease_timeout: Duration,
    ) -> Option<Lease> {
        for name in queues {
            let queue = self.queue(name);
            queue.promote_due(now);
            let Some(id) = queue.pending.pop_front() else {
                continue;
            };
            let Some(message) = self.tasks.get(&id).cloned() else {
                continue;
            };
            let lease = Lease::new(message, lease_timeout);
            self.active.insert(
                id,
                ActiveEntry {
                    token: lease.token,
                    expires_at: lease.expires_at,
                },
            );
            return Some(lease);
        }
        None
    }

    fn next_due(&self, queues: &[QueueName]) -> Option<DateTime<Utc>> {
        queues
            .iter()
            .filter_map(|name| self.queues.get(name).and_then(QueueState::next_due))
            .min()
    }

    /// Release the active entry if `lease` still owns it.
    fn release(&mut self, lease: &Lease) -> Result<TaskMessage, BrokerError> {
        let id = lease.task_id();
        match self.active.get(&id) {
            Some(entry) if entry.token == lease.token => {}
            _ => return Err(BrokerError::LeaseLost(id)),
        }
        self.active.remove(&id);
        self.tasks.get(&id).cloned().ok_or(BrokerError::NotFound(id))
    }

    fn settle_failure(
        &mut self,
        mut message: TaskMessage,
        failure: &Failure,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> TaskState {
        let state = apply_failure(&mut message, failure, policy, now);
        let id = message.id;
        let queue_name = message.queue.clone();
        match state {
            TaskState::Retry => {
                let at = message.process_at;
                self.tasks.insert(id, message);
                self.queue(&queue_name).retry.insert((at, id));
            }
            _ => {
                self.tasks.remove(&id);
                self.queue(&queue_name)
                    .dead
                    .push(DeadLetterEntry::new(message, failure.error.clone()));
            }
        }
        state
    }
}

/// In-memory [`Broker`].
#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    notify: Notify,
    policy: RetryPolicy,
    available: AtomicBool,
    reject_enqueues: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }

    pub fn with_retry_policy(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            policy,
            available: AtomicBool::new(true),
            reject_enqueues: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` until restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make `enqueue` fail with a `Command` error while the broker stays reachable.
    pub fn set_reject_enqueues(&self, reject: bool) {
        self.reject_enqueues.store(reject, Ordering::SeqCst);
    }

    /// Tasks currently held in a queue (pending, scheduled, retry or active).
    pub async fn messages(&self, queue: &QueueName) -> Vec<TaskMessage> {
        let state = self.state.lock().await;
        let mut messages: Vec<TaskMessage> = state
            .tasks
            .values()
            .filter(|m| &m.queue == queue)
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.enqueued_at, m.id));
        messages
    }

    /// Total tasks held across all queues.
    pub async fn len(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    fn ensure_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("in-memory broker marked unavailable".into()))
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, message: TaskMessage) -> Result<TaskInfo, BrokerError> {
        self.ensure_available()?;
        if self.reject_enqueues.load(Ordering::SeqCst) {
            return Err(BrokerError::Command("enqueue rejected".into()));
        }
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let id = message.id;
        if state.tasks.contains_key(&id) || state.queue(&message.queue).holds_dead(id) {
            return Err(BrokerError::Duplicate(id));
        }

        let task_state = if message.is_due(now) {
            state.queue(&message.queue).pending.push_back(id);
            TaskState::Pending
        } else {
            let at = message.process_at;
            state.queue(&message.queue).scheduled.insert((at, id));
            TaskState::Scheduled
        };
        let info = TaskInfo::from_message(&message, task_state);
        state.tasks.insert(id, message);
        drop(state);

        self.notify.notify_waiters();
        Ok(info)
    }

    async fn dequeue(
        &self,
        queues: &[QueueName],
        wait: Duration,
        lease_timeout: Duration,
    ) -> Result<Option<Lease>, BrokerError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_available()?;
            let next_due = {
                let mut state = self.state.lock().await;
                if let Some(lease) = state.lease_next(queues, Utc::now(), lease_timeout) {
                    return Ok(Some(lease));
                }
                state.next_due(queues)
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut wake_at = deadline;
            if let Some(due) = next_due {
                let until_due = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                wake_at = wake_at.min(now + until_due);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let message = state.release(lease)?;
        state.tasks.remove(&message.id);
        state.queue(&message.queue).completed += 1;
        Ok(())
    }

    async fn fail(&self, lease: &Lease, failure: Failure) -> Result<TaskState, BrokerError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let message = state.release(lease)?;
        let task_state = state.settle_failure(message, &failure, &self.policy, Utc::now());
        drop(state);

        if task_state == TaskState::Retry {
            self.notify.notify_waiters();
        }
        Ok(task_state)
    }

    async fn requeue(&self, lease: &Lease) -> Result<(), BrokerError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let message = state.release(lease)?;
        state.queue(&message.queue).pending.push_front(message.id);
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn recover_expired(&self) -> Result<usize, BrokerError> {
        self.ensure_available()?;
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let expired: Vec<TaskId> = state
            .active
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        let failure = Failure::retryable("lease expired");
        for id in &expired {
            state.active.remove(id);
            if let Some(message) = state.tasks.get(id).cloned() {
                state.settle_failure(message, &failure, &self.policy, now);
            }
        }
        drop(state);

        if !expired.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(expired.len())
    }

    async fn dead_letters(
        &self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, BrokerError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .queues
            .get(queue)
            .map(|q| q.dead.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn requeue_dead(&self, queue: &QueueName, id: TaskId) -> Result<TaskInfo, BrokerError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let q = state.queue(queue);
        let position = q
            .dead
            .iter()
            .position(|entry| entry.message.id == id)
            .ok_or(BrokerError::NotFound(id))?;
        let mut message = q.dead.remove(position).message;
        message.retried = 0;
        message.process_at = Utc::now();
        q.pending.push_back(id);

        let info = TaskInfo::from_message(&message, TaskState::Pending);
        state.tasks.insert(id, message);
        drop(state);

        self.notify.notify_waiters();
        Ok(info)
    }

    async fn stats(&self, queue: &QueueName) -> Result<QueueStats, BrokerError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let active = state
            .active
            .keys()
            .filter(|id| state.tasks.get(*id).is_some_and(|m| &m.queue == queue))
            .count();
        Ok(state
            .queues
            .get(queue)
            .map(|q| QueueStats {
                pending: q.pending.len(),
                scheduled: q.scheduled.len(),
                active,
                retry: q.retry.len(),
                dead: q.dead.len(),
                completed: q.completed,
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::tasks::types::{Task, TaskDefaults, TaskKind, TaskOptions};

    const LEASE: Duration = Duration::from_secs(30);

    fn message(options: TaskOptions) -> TaskMessage {
        Task::from_bytes(TaskKind::SendVerifyEmail, br#"{"user_id":"1"}"#.to_vec())
            .with_options(options)
            .into_message(&TaskDefaults::default())
    }

    fn queues() -> Vec<QueueName> {
        vec![QueueName::critical(), QueueName::default()]
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_then_ack() {
        let broker = InMemoryBroker::new();
        let info = broker.enqueue(message(TaskOptions::new())).await.unwrap();
        assert_eq!(info.state, TaskState::Pending);

        let lease = broker
            .dequeue(&queues(), Duration::ZERO, LEASE)
            .await
            .unwrap()
            .expect("task ready");
        assert_eq!(lease.task_id(), info.id);
        assert_eq!(broker.stats(&QueueName::default()).await.unwrap().active, 1);

        broker.ack(&lease).await.unwrap();
        let stats = broker.stats(&QueueName::default()).await.unwrap();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.completed, 1);
        assert_eq!(broker.len().await, 0);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let broker = InMemoryBroker::new();
        let msg = message(TaskOptions::new());
        broker.enqueue(msg.clone()).await.unwrap();
        assert_eq!(broker.enqueue(msg.clone()).await, Err(BrokerError::Duplicate(msg.id)));
    }

    #[tokio::test]
    async fn higher_priority_queue_is_served_first() {
        let broker = InMemoryBroker::new();
        broker.enqueue(message(TaskOptions::new())).await.unwrap();
        let critical = broker
            .enqueue(message(TaskOptions::new().queue("critical")))
            .await
            .unwrap();

        let lease = broker.dequeue(&queues(), Duration::ZERO, LEASE).await.unwrap().unwrap();
        assert_eq!(lease.task_id(), critical.id);
    }

    #[tokio::test]
    async fn scheduled_task_is_not_delivered_early() {
        let broker = InMemoryBroker::new();
        let info = broker
            .enqueue(message(TaskOptions::new().process_in(Duration::from_secs(60))))
            .await
            .unwrap();
        assert_eq!(info.state, TaskState::Scheduled);

        let lease = broker
            .dequeue(&queues(), Duration::from_millis(20), LEASE)
            .await
            .unwrap();
        assert!(lease.is_none());
        assert_eq!(broker.stats(&QueueName::default()).await.unwrap().scheduled, 1);
    }

    #[tokio::test]
    async fn waiting_dequeue_wakes_on_enqueue() {
        let broker = Arc::new(InMemoryBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.dequeue(&queues(), Duration::from_secs(5), LEASE).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let info = broker.enqueue(message(TaskOptions::new())).await.unwrap();

        let lease = waiter.await.unwrap().unwrap().expect("woken by enqueue");
        assert_eq!(lease.task_id(), info.id);
    }

    #[tokio::test]
    async fn retryable_failures_exhaust_into_dead_letters() {
        let broker = InMemoryBroker::with_retry_policy(RetryPolicy::immediate());
        broker.enqueue(message(TaskOptions::new().max_retry(1))).await.unwrap();

        let first = broker.dequeue(&queues(), Duration::ZERO, LEASE).await.unwrap().unwrap();
        assert_eq!(broker.fail(&first, Failure::retryable("flaky")).await.unwrap(), TaskState::Retry);

        let second = broker.dequeue(&queues(), Duration::ZERO, LEASE).await.unwrap().unwrap();
        assert_eq!(second.message.retried, 1);
        assert_eq!(broker.fail(&second, Failure::retryable("flaky")).await.unwrap(), TaskState::Dead);

        let dead = broker.dead_letters(&QueueName::default(), 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "flaky");
        assert!(broker.dequeue(&queues(), Duration::ZERO, LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_lease_cannot_settle() {
        let broker = InMemoryBroker::with_retry_policy(RetryPolicy::immediate());
        broker.enqueue(message(TaskOptions::new())).await.unwrap();

        let stale = broker
            .dequeue(&queues(), Duration::ZERO, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(broker.recover_expired().await.unwrap(), 1);

        let fresh = broker.dequeue(&queues(), Duration::ZERO, LEASE).await.unwrap().unwrap();
        assert_eq!(fresh.message.retried, 1);
        assert_eq!(broker.ack(&stale).await, Err(BrokerError::LeaseLost(stale.task_id())));
        broker.ack(&fresh).await.unwrap();
    }

    #[tokio::test]
    async fn requeue_keeps_retry_budget() {
        let broker = InMemoryBroker::new();
        broker.enqueue(message(TaskOptions::new())).await.unwrap();

        let lease = broker.dequeue(&queues(), Duration::ZERO, LEASE).await.unwrap().unwrap();
        broker.requeue(&lease).await.unwrap();

        let again = broker.dequeue(&queues(), Duration::ZERO, LEASE).await.unwrap().unwrap();
        assert_eq!(again.task_id(), lease.task_id());
        assert_eq!(again.message.retried, 0);
    }

    #[tokio::test]
    async fn dead_task_can_be_requeued() {
        let broker = InMemoryBroker::new();
        let info = broker.enqueue(message(TaskOptions::new())).await.unwrap();
        let lease = broker.dequeue(&queues(), Duration::ZERO, LEASE).await.unwrap().unwrap();
        broker.fail(&lease, Failure::permanent("bad payload")).await.unwrap();

        let revived = broker.requeue_dead(&QueueName::default(), info.id).await.unwrap();
        assert_eq!(revived.state, TaskState::Pending);
        assert_eq!(broker.stats(&QueueName::default()).await.unwrap().dead, 0);
        assert!(broker.dequeue(&queues(), Duration::ZERO, LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unavailable_broker_rejects_enqueue() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let err = broker.enqueue(message(TaskOptions::new())).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
        assert_eq!(broker.len().await, 0);
    }
}
