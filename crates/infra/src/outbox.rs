//! Transactional outbox.
//!
//! The write path stages tasks in `task_outbox` inside its own transaction
//! ([`stage`]), so a task exists if and only if the write that produced it
//! committed. The [`OutboxRelay`] later moves committed rows to the broker
//! under the same task id, without holding a transaction open across broker
//! calls.
//!
//! Delivery is at-least-once: a crash between enqueue and marking the row
//! relayed re-sends the row, and the broker reports it as a duplicate if it
//! still holds the task.
//!
//! A row the broker keeps rejecting is parked after `max_relay_attempts`
//! failures so it cannot block the rows behind it. Parked rows stay in the
//! table with their last error. Broker outages do not count as attempts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError};
use crate::db::{Database, DbError, TxScope};
use crate::tasks::processor::MIN_TICK;
use crate::tasks::types::{Task, TaskDefaults, TaskInfo, TaskState};

/// Write `task` to the outbox inside the caller's transaction.
pub async fn stage(tx: &mut dyn TxScope, task: Task, defaults: &TaskDefaults) -> Result<TaskInfo, DbError> {
    let kind = task.kind();
    let message = task.into_message(defaults);
    let outbox_id = tx.insert_outbox(&message).await?;

    debug!(
        outbox_id = %outbox_id,
        task_id = %message.id,
        task_type = %kind,
        queue = %message.queue,
        max_retry = message.max_retry,
        "staged task in outbox"
    );

    let state = if message.is_due(Utc::now()) {
        TaskState::Pending
    } else {
        TaskState::Scheduled
    };
    Ok(TaskInfo::from_message(&message, state))
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct OutboxRelayConfig {
    /// Rows read per pass
    pub batch_size: usize,
    /// Pause between passes when the outbox is drained
    pub poll_interval: Duration,
    /// Rejected relays after which a row is parked
    pub max_relay_attempts: u32,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            max_relay_attempts: 10,
        }
    }
}

/// Result of one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub relayed: usize,
    /// Rows the broker already held; marked relayed all the same
    pub duplicates: usize,
    pub failed: usize,
    /// Failed rows that reached the attempt ceiling in this pass
    pub parked: usize,
}

impl RelayReport {
    fn handled(&self) -> usize {
        self.relayed + self.duplicates
    }
}

/// Moves committed outbox rows onto the broker.
#[derive(Clone)]
pub struct OutboxRelay {
    db: Arc<dyn Database>,
    broker: Arc<dyn Broker>,
    config: OutboxRelayConfig,
}

impl OutboxRelay {
    pub fn new(db: Arc<dyn Database>, broker: Arc<dyn Broker>, config: OutboxRelayConfig) -> Self {
        Self { db, broker, config }
    }

    /// Relay up to one batch of rows.
    ///
    /// Stops early if the broker is unavailable; the remaining rows are picked
    /// up by the next pass.
    pub async fn run_once(&self) -> Result<RelayReport, DbError> {
        let records = self
            .db
            .pending_outbox(self.config.batch_size, self.config.max_relay_attempts)
            .await?;
        let mut report = RelayReport::default();
        let mut relayed = Vec::with_capacity(records.len());

        for record in records {
            match self.broker.enqueue(record.message.clone()).await {
                Ok(info) => {
                    info!(
                        task_id = %info.id,
                        task_type = %info.kind,
                        queue = %info.queue,
                        max_retry = info.max_retry,
                        "enqueued task"
                    );
                    relayed.push(record.id);
                    report.relayed += 1;
                }
                Err(BrokerError::Duplicate(task_id)) => {
                    debug!(task_id = %task_id, outbox_id = %record.id, "task already enqueued");
                    relayed.push(record.id);
                    report.duplicates += 1;
                }
                Err(BrokerError::Unavailable(reason)) => {
                    report.failed += 1;
                    warn!(outbox_id = %record.id, task_id = %record.message.id, error = %reason, "broker unavailable; pausing relay");
                    break;
                }
                Err(err) => {
                    report.failed += 1;
                    let attempts = record.relay_attempts + 1;
                    if let Err(db_err) = self.db.record_outbox_failure(record.id, &err.to_string()).await {
                        error!(outbox_id = %record.id, error = %db_err, "failed to record relay failure");
                        continue;
                    }
                    if attempts >= self.config.max_relay_attempts {
                        report.parked += 1;
                        error!(
                            outbox_id = %record.id,
                            task_id = %record.message.id,
                            attempts,
                            error = %err,
                            "task rejected by broker too many times; parked in outbox"
                        );
                    } else {
                        warn!(
                            outbox_id = %record.id,
                            task_id = %record.message.id,
                            attempts,
                            error = %err,
                            "failed to relay task"
                        );
                    }
                }
            }
        }

        if !relayed.is_empty() {
            self.db.mark_outbox_relayed(&relayed).await?;
        }
        Ok(report)
    }

    /// Run the relay loop on the current runtime until shut down.
    pub fn spawn(self) -> RelayHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            info!(batch_size = self.config.batch_size, "outbox relay started");
            let mut ticker = tokio::time::interval(self.config.poll_interval.max(MIN_TICK));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => self.drain().await,
                }
            }
            info!("outbox relay stopped");
        });

        RelayHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    /// Relay full batches back to back until the backlog is gone or a pass fails.
    async fn drain(&self) {
        loop {
            match self.run_once().await {
                Ok(report) if report.failed == 0 && report.handled() == self.config.batch_size => continue,
                Ok(_) => break,
                Err(err) => {
                    error!(error = %err, "outbox relay pass failed");
                    break;
                }
            }
        }
    }
}

/// Handle to a spawned relay.
#[derive(Debug)]
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl RelayHandle {
    /// Request shutdown and wait for the current pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            error!(error = %err, "outbox relay task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::db::InMemoryDatabase;
    use crate::tasks::types::{QueueName, TaskKind, TaskOptions};

    fn task() -> Task {
        Task::from_bytes(TaskKind::SendVerifyEmail, br#"{"user_id":"1"}"#.to_vec())
            .with_options(TaskOptions::new().queue("critical"))
    }

    async fn stage_committed(db: &InMemoryDatabase, count: usize) {
        let mut tx = db.begin().await.unwrap();
        for _ in 0..count {
            stage(tx.as_scope(), task(), &TaskDefaults::default()).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn relays_committed_rows_once() {
        let db = Arc::new(InMemoryDatabase::new());
        let broker = Arc::new(InMemoryBroker::new());
        stage_committed(&db, 2).await;

        let relay = OutboxRelay::new(db.clone(), broker.clone(), OutboxRelayConfig::default());
        assert_eq!(relay.run_once().await.unwrap().relayed, 2);
        assert_eq!(broker.messages(&QueueName::critical()).await.len(), 2);
        assert_eq!(db.unrelayed_count().await, 0);

        assert_eq!(relay.run_once().await.unwrap(), RelayReport::default());
        assert_eq!(broker.len().await, 2);
    }

    #[tokio::test]
    async fn rolled_back_rows_are_never_relayed() {
        let db = Arc::new(InMemoryDatabase::new());
        let broker = Arc::new(InMemoryBroker::new());
        let mut tx = db.begin().await.unwrap();
        stage(tx.as_scope(), task(), &TaskDefaults::default()).await.unwrap();
        tx.rollback().await.unwrap();

        let relay = OutboxRelay::new(db.clone(), broker.clone(), OutboxRelayConfig::default());
        assert_eq!(relay.run_once().await.unwrap(), RelayReport::default());
        assert_eq!(broker.len().await, 0);
    }

    #[tokio::test]
    async fn broker_outage_keeps_rows_for_next_pass() {
        let db = Arc::new(InMemoryDatabase::new());
        let broker = Arc::new(InMemoryBroker::new());
        stage_committed(&db, 3).await;
        let relay = OutboxRelay::new(db.clone(), broker.clone(), OutboxRelayConfig::default());

        broker.set_available(false);
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.relayed, 0);
        assert_eq!(db.unrelayed_count().await, 3);
        assert_eq!(db.outbox_records().await[0].relay_attempts, 0);

        broker.set_available(true);
        assert_eq!(relay.run_once().await.unwrap().relayed, 3);
        assert_eq!(db.unrelayed_count().await, 0);
    }

    #[tokio::test]
    async fn already_enqueued_task_counts_as_relayed() {
        let db = Arc::new(InMemoryDatabase::new());
        let broker = Arc::new(InMemoryBroker::new());
        stage_committed(&db, 1).await;
        let record = db.pending_outbox(1, 10).await.unwrap().remove(0);
        broker.enqueue(record.message).await.unwrap();

        let relay = OutboxRelay::new(db.clone(), broker.clone(), OutboxRelayConfig::default());
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(db.unrelayed_count().await, 0);
        assert_eq!(broker.len().await, 1);
    }

    #[tokio::test]
    async fn spawned_relay_drains_backlog_and_stops() {
        let db = Arc::new(InMemoryDatabase::new());
        let broker = Arc::new(InMemoryBroker::new());
        stage_committed(&db, 5).await;

        let config = OutboxRelayConfig {
            batch_size: 2,
            poll_interval: Duration::from_millis(10),
            ..OutboxRelayConfig::default()
        };
        let handle = OutboxRelay::new(db.clone(), broker.clone(), config).spawn();

        tokio::time::timeout(Duration::from_secs(5), async {
            while db.unrelayed_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("outbox drained");

        handle.shutdown().await;
        assert_eq!(broker.len().await, 5);
    }

    #[tokio::test]
    async fn rejected_rows_are_parked_and_stop_blocking_the_batch() {
        let db = Arc::new(InMemoryDatabase::new());
        let broker = Arc::new(InMemoryBroker::new());
        stage_committed(&db, 2).await;
        let config = OutboxRelayConfig {
            batch_size: 2,
            max_relay_attempts: 2,
            ..OutboxRelayConfig::default()
        };
        let relay = OutboxRelay::new(db.clone(), broker.clone(), config);

        broker.set_reject_enqueues(true);
        assert_eq!(relay.run_once().await.unwrap().parked, 0);
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.parked, 2);
        assert!(
            db.outbox_records()
                .await
                .iter()
                .all(|r| r.relay_attempts == 2 && r.last_error.is_some())
        );

        broker.set_reject_enqueues(false);
        stage_committed(&db, 1).await;
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.relayed, 1);
        assert_eq!(broker.len().await, 1);
        assert_eq!(db.unrelayed_count().await, 2);
    }

    #[tokio::test]
    async fn zero_poll_interval_does_not_kill_the_relay() {
        let db = Arc::new(InMemoryDatabase::new());
        let broker = Arc::new(InMemoryBroker::new());
        stage_committed(&db, 3).await;

        let config = OutboxRelayConfig {
            poll_interval: Duration::ZERO,
            ..OutboxRelayConfig::default()
        };
        let handle = OutboxRelay::new(db.clone(), broker.clone(), config).spawn();

        tokio::time::timeout(Duration::from_secs(5), async {
            while db.unrelayed_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("outbox drained");
        handle.shutdown().await;
        assert_eq!(broker.len().await, 3);
    }
}
