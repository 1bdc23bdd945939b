//! Task processor: a pool of async workers that lease tasks from the broker,
//! dispatch them through the [`HandlerRegistry`] and settle the outcome.
//!
//! - Queues are polled in declaration order, so `critical` wins over `default`
//!   whenever both have ready work.
//! - Each handler call is bounded by `task_timeout`. A timeout or a panic is a
//!   retryable failure; an unregistered task type is permanent.
//! - A recoverer task periodically fails expired leases back into the retry
//!   set, so a crashed worker never strands a task.
//! - Shutdown lets in-flight tasks finish within `shutdown_timeout`; leases
//!   still held after that are requeued without consuming an attempt.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::broker::{Broker, BrokerError, Failure, Lease};
use crate::tasks::registry::HandlerRegistry;
use crate::tasks::types::{QueueName, TaskContext, TaskOutcome, TaskState};

/// Shortest tick the background loops accept.
pub(crate) const MIN_TICK: Duration = Duration::from_millis(1);

/// Task processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Name for logging
    pub name: String,
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Queues in priority order
    pub queues: Vec<QueueName>,
    /// Longest a worker blocks waiting for a task before re-checking for shutdown
    pub dequeue_wait: Duration,
    /// Per-task handler deadline
    pub task_timeout: Duration,
    /// Lease length; must exceed `task_timeout` or healthy tasks get redelivered
    pub lease_timeout: Duration,
    /// Grace period for in-flight tasks at shutdown
    pub shutdown_timeout: Duration,
    /// How often expired leases are recovered
    pub recover_interval: Duration,
    /// Pause after a broker error before the worker polls again
    pub error_backoff: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: "task-processor".to_string(),
            concurrency: 4,
            queues: vec![QueueName::critical(), QueueName::default()],
            dequeue_wait: Duration::from_secs(1),
            task_timeout: Duration::from_secs(30),
            lease_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
            recover_interval: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl ProcessorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_queues(mut self, queues: Vec<QueueName>) -> Self {
        self.queues = queues;
        self
    }
}

/// Processor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_retried: u64,
    pub tasks_dead_lettered: u64,
    pub settle_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    settle_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ProcessorStats {
        ProcessorStats {
            tasks_processed: self.processed.load(Ordering::Relaxed),
            tasks_succeeded: self.succeeded.load(Ordering::Relaxed),
            tasks_retried: self.retried.load(Ordering::Relaxed),
            tasks_dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            settle_errors: self.settle_errors.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    config: ProcessorConfig,
    counters: Counters,
}

/// Background task processor.
#[derive(Clone)]
pub struct TaskProcessor {
    inner: Arc<Inner>,
}

impl TaskProcessor {
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<HandlerRegistry>, config: ProcessorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                registry,
                config,
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> ProcessorStats {
        self.inner.counters.snapshot()
    }

    /// Spawn the workers and the lease recoverer on the current runtime.
    pub fn start(self) -> ProcessorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let in_flight: Arc<Mutex<HashMap<usize, Lease>>> = Arc::default();
        let concurrency = self.inner.config.concurrency.max(1);

        info!(
            processor = %self.inner.config.name,
            concurrency,
            queues = ?self.inner.config.queues,
            "task processor started"
        );

        let workers = (0..concurrency)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    self.clone(),
                    worker,
                    shutdown_rx.clone(),
                    in_flight.clone(),
                ))
            })
            .collect();
        let recoverer = tokio::spawn(recover_loop(self.clone(), shutdown_rx));

        ProcessorHandle {
            processor: self,
            shutdown: shutdown_tx,
            workers,
            recoverer,
            in_flight,
        }
    }

    /// Run the handler for one leased task and settle the outcome with the broker.
    ///
    /// Returns the state the task ended up in.
    pub async fn process_one(&self, lease: Lease) -> Result<TaskState, BrokerError> {
        let message = &lease.message;
        let span = info_span!(
            "task",
            processor = %self.inner.config.name,
            task_id = %message.id,
            task_type = %message.kind,
            queue = %message.queue,
            retried = message.retried,
            max_retry = message.max_retry,
        );

        async {
            let outcome = self.run_handler(&lease).await;
            self.inner.counters.processed.fetch_add(1, Ordering::Relaxed);
            let result = self.settle(&lease, outcome).await;
            if result.is_err() {
                self.inner.counters.settle_errors.fetch_add(1, Ordering::Relaxed);
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_handler(&self, lease: &Lease) -> TaskOutcome {
        let message = &lease.message;
        let Some((kind, handler)) = self.inner.registry.resolve(&message.kind) else {
            return TaskOutcome::permanent(format!("no handler registered for task type {}", message.kind));
        };

        let timeout = self.inner.config.task_timeout;
        let ctx = TaskContext {
            task_id: message.id,
            kind,
            queue: message.queue.clone(),
            retried: message.retried,
            max_retry: message.max_retry,
            deadline: tokio::time::Instant::now() + timeout,
        };

        let attempt = AssertUnwindSafe(handler.handle(&ctx, &message.payload)).catch_unwind();
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => TaskOutcome::retry(format!("handler panicked: {}", panic_message(&*panic))),
            Err(_) => TaskOutcome::retry(format!("handler timed out after {timeout:?}")),
        }
    }

    async fn settle(&self, lease: &Lease, outcome: TaskOutcome) -> Result<TaskState, BrokerError> {
        let broker = &self.inner.broker;
        let counters = &self.inner.counters;

        match outcome {
            TaskOutcome::Success => {
                broker.ack(lease).await?;
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!("task completed");
                Ok(TaskState::Completed)
            }
            TaskOutcome::Retry(reason) => {
                let state = broker.fail(lease, Failure::retryable(reason.clone())).await?;
                if state == TaskState::Dead {
                    counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %reason, "task dead-lettered: retries exhausted");
                } else {
                    counters.retried.fetch_add(1, Ordering::Relaxed);
                    info!(error = %reason, "task failed; scheduled for retry");
                }
                Ok(state)
            }
            TaskOutcome::Permanent(reason) => {
                let state = broker.fail(lease, Failure::permanent(reason.clone())).await?;
                counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                warn!(error = %reason, "task dead-lettered: permanent failure");
                Ok(state)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn worker_loop(
    processor: TaskProcessor,
    worker: usize,
    shutdown: watch::Receiver<bool>,
    in_flight: Arc<Mutex<HashMap<usize, Lease>>>,
) {
    let config = &processor.inner.config;
    debug!(processor = %config.name, worker, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match processor
            .inner
            .broker
            .dequeue(&config.queues, config.dequeue_wait, config.lease_timeout)
            .await
        {
            Ok(Some(lease)) => {
                let task_id = lease.task_id();
                in_flight.lock().await.insert(worker, lease.clone());
                let result = processor.process_one(lease).await;
                in_flight.lock().await.remove(&worker);

                if let Err(err) = result {
                    // The lease expires and the recoverer redelivers the task.
                    error!(processor = %config.name, worker, task_id = %task_id, error = %err, "failed to settle task");
                }
            }
            Ok(None) => continue,
            Err(err) => {
                error!(processor = %config.name, worker, error = %err, "failed to dequeue task");
                let mut shutdown = shutdown.clone();
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(config.error_backoff) => {}
                }
            }
        }
    }

    debug!(processor = %config.name, worker, "worker stopped");
}

async fn recover_loop(processor: TaskProcessor, mut shutdown: watch::Receiver<bool>) {
    let config = &processor.inner.config;
    // A zero period panics inside `interval`.
    let mut ticker = tokio::time::interval(config.recover_interval.max(MIN_TICK));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => match processor.inner.broker.recover_expired().await {
                Ok(0) => {}
                Ok(recovered) => warn!(processor = %config.name, recovered, "recovered expired leases"),
                Err(err) => error!(processor = %config.name, error = %err, "lease recovery failed"),
            },
        }
    }
}

/// Outcome of [`ProcessorHandle::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that had to be aborted after the grace period
    pub aborted_workers: usize,
    /// Leases handed back to the broker
    pub requeued: usize,
}

/// Handle to control a running processor.
pub struct ProcessorHandle {
    processor: TaskProcessor,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    recoverer: JoinHandle<()>,
    in_flight: Arc<Mutex<HashMap<usize, Lease>>>,
}

impl ProcessorHandle {
    pub fn stats(&self) -> ProcessorStats {
        self.processor.stats()
    }

    /// Stop the processor.
    ///
    /// Workers finish their current task if they can within the grace period;
    /// the rest are aborted and their leases requeued for another worker.
    pub async fn shutdown(self) -> ShutdownReport {
        let config = &self.processor.inner.config;
        let _ = self.shutdown.send(true);

        let deadline = tokio::time::Instant::now() + config.shutdown_timeout;
        let mut report = ShutdownReport::default();
        for mut worker in self.workers {
            if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                worker.abort();
                let _ = worker.await;
                report.aborted_workers += 1;
            }
        }
        self.recoverer.abort();
        if let Err(err) = self.recoverer.await {
            if err.is_panic() {
                error!(processor = %config.name, error = %err, "lease recoverer panicked");
            }
        }

        let leases: Vec<Lease> = self.in_flight.lock().await.drain().map(|(_, lease)| lease).collect();
        for lease in leases {
            match self.processor.inner.broker.requeue(&lease).await {
                Ok(()) => {
                    report.requeued += 1;
                    info!(processor = %config.name, task_id = %lease.task_id(), "requeued in-flight task");
                }
                Err(err) => warn!(
                    processor = %config.name,
                    task_id = %lease.task_id(),
                    error = %err,
                    "could not requeue in-flight task; it is redelivered once its lease expires"
                ),
            }
        }

        info!(
            processor = %config.name,
            aborted_workers = report.aborted_workers,
            requeued = report.requeued,
            "task processor stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::tasks::registry::handler_fn;
    use crate::tasks::retry::RetryPolicy;
    use crate::tasks::types::{Task, TaskDefaults, TaskKind, TaskOptions};

    const LEASE: Duration = Duration::from_secs(30);

    fn processor(broker: Arc<InMemoryBroker>, outcome: TaskOutcome) -> TaskProcessor {
        let registry = HandlerRegistry::new().with(
            TaskKind::SendVerifyEmail,
            handler_fn(move |_, _| {
                let outcome = outcome.clone();
                async move { outcome }
            }),
        );
        TaskProcessor::new(broker, Arc::new(registry), ProcessorConfig::default())
    }

    async fn lease_one(broker: &InMemoryBroker, kind: &str, max_retry: u32) -> Lease {
        let mut message = Task::from_bytes(TaskKind::SendVerifyEmail, b"{}".to_vec())
            .with_options(TaskOptions::new().max_retry(max_retry))
            .into_message(&TaskDefaults::default());
        message.kind = kind.to_string();
        broker.enqueue(message).await.unwrap();
        broker
            .dequeue(&[QueueName::default()], Duration::ZERO, LEASE)
            .await
            .unwrap()
            .expect("task ready")
    }

    #[tokio::test]
    async fn success_acks_task() {
        let broker = Arc::new(InMemoryBroker::new());
        let processor = processor(broker.clone(), TaskOutcome::Success);
        let lease = lease_one(&broker, "task:send_verify_email", 3).await;

        assert_eq!(processor.process_one(lease).await.unwrap(), TaskState::Completed);
        assert_eq!(broker.stats(&QueueName::default()).await.unwrap().completed, 1);
        assert_eq!(processor.stats().tasks_succeeded, 1);
    }

    #[tokio::test]
    async fn unknown_type_is_dead_lettered_without_retry() {
        let broker = Arc::new(InMemoryBroker::new());
        let processor = processor(broker.clone(), TaskOutcome::Success);
        let lease = lease_one(&broker, "task:unknown", 5).await;

        assert_eq!(processor.process_one(lease).await.unwrap(), TaskState::Dead);
        let dead = broker.dead_letters(&QueueName::default(), 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.contains("no handler"));
        assert_eq!(dead[0].message.retried, 0);
    }

    #[tokio::test]
    async fn retry_outcome_reschedules() {
        let broker = Arc::new(InMemoryBroker::with_retry_policy(RetryPolicy::immediate()));
        let processor = processor(broker.clone(), TaskOutcome::retry("smtp timeout"));
        let lease = lease_one(&broker, "task:send_verify_email", 2).await;

        assert_eq!(processor.process_one(lease).await.unwrap(), TaskState::Retry);
        assert_eq!(broker.stats(&QueueName::default()).await.unwrap().retry, 1);
        assert_eq!(processor.stats().tasks_retried, 1);
    }

    fn explode() -> TaskOutcome {
        panic!("handler bug")
    }

    #[tokio::test]
    async fn panicking_handler_is_retryable() {
        let broker = Arc::new(InMemoryBroker::with_retry_policy(RetryPolicy::immediate()));
        let registry = HandlerRegistry::new().with(
            TaskKind::SendVerifyEmail,
            handler_fn(|_, _| async { explode() }),
        );
        let processor = TaskProcessor::new(broker.clone(), Arc::new(registry), ProcessorConfig::default());
        let lease = lease_one(&broker, "task:send_verify_email", 1).await;

        assert_eq!(processor.process_one(lease).await.unwrap(), TaskState::Retry);
        let retry = broker
            .dequeue(&[QueueName::default()], Duration::ZERO, LEASE)
            .await
            .unwrap()
            .unwrap();
        assert!(retry.message.last_error.unwrap().contains("handler bug"));
    }

    #[tokio::test]
    async fn slow_handler_times_out_as_retryable() {
        let broker = Arc::new(InMemoryBroker::with_retry_policy(RetryPolicy::immediate()));
        let registry = HandlerRegistry::new().with(
            TaskKind::SendVerifyEmail,
            handler_fn(|_, _| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                TaskOutcome::Success
            }),
        );
        let config = ProcessorConfig {
            task_timeout: Duration::from_millis(20),
            ..ProcessorConfig::default()
        };
        let processor = TaskProcessor::new(broker.clone(), Arc::new(registry), config);
        let lease = lease_one(&broker, "task:send_verify_email", 1).await;

        assert_eq!(processor.process_one(lease).await.unwrap(), TaskState::Retry);
    }

    #[tokio::test]
    async fn running_pool_drains_queue_and_stops() {
        let broker = Arc::new(InMemoryBroker::new());
        for _ in 0..5 {
            broker
                .enqueue(
                    Task::from_bytes(TaskKind::SendVerifyEmail, b"{}".to_vec())
                        .into_message(&TaskDefaults::default()),
                )
                .await
                .unwrap();
        }
        let config = ProcessorConfig {
            dequeue_wait: Duration::from_millis(20),
            ..ProcessorConfig::default()
        }
        .with_concurrency(2);
        let registry = HandlerRegistry::new().with(
            TaskKind::SendVerifyEmail,
            handler_fn(|_, _| async { TaskOutcome::Success }),
        );
        let handle = TaskProcessor::new(broker.clone(), Arc::new(registry), config).start();

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.stats().tasks_succeeded < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue drained");

        assert_eq!(broker.len().await, 0);
        let report = handle.shutdown().await;
        assert_eq!(report, ShutdownReport::default());
    }

    #[tokio::test]
    async fn zero_recover_interval_still_reclaims_expired_leases() {
        let broker = Arc::new(InMemoryBroker::with_retry_policy(RetryPolicy::immediate()));
        broker
            .enqueue(Task::from_bytes(TaskKind::SendVerifyEmail, b"{}".to_vec()).into_message(&TaskDefaults::default()))
            .await
            .unwrap();
        let abandoned = broker
            .dequeue(&[QueueName::default()], Duration::ZERO, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(abandoned.is_some());

        let config = ProcessorConfig {
            dequeue_wait: Duration::from_millis(20),
            recover_interval: Duration::ZERO,
            ..ProcessorConfig::default()
        }
        .with_concurrency(1);
        let registry = HandlerRegistry::new().with(
            TaskKind::SendVerifyEmail,
            handler_fn(|_, _| async { TaskOutcome::Success }),
        );
        let handle = TaskProcessor::new(broker.clone(), Arc::new(registry), config).start();

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.stats().tasks_succeeded < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("expired lease recovered and processed");

        handle.shutdown().await;
        assert_eq!(broker.len().await, 0);
    }
}
