//! Redis-backed task broker (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Task record**: `{ns}:t:{id}` hash with `msg` (JSON [`TaskMessage`]),
//!   `state`, `queue`, `token` (current lease) and, once dead, `dead_at`/`reason`
//! - **Pending**: `{ns}:q:{queue}:pending` list (LPUSH in, RPOP out)
//! - **Scheduled / retry**: `{ns}:q:{queue}:scheduled|retry` zsets scored by due time (ms)
//! - **Active**: `{ns}:q:{queue}:active` zset scored by lease expiry (ms)
//! - **Dead**: `{ns}:q:{queue}:dead` zset scored by death time (ms)
//! - **Known queues**: `{ns}:queues` set, used by lease recovery
//!
//! Every transition runs as a Lua script so a task is never visible in two
//! sets at once, and every lease-bound transition checks the lease token.
//! The retry decision itself (`apply_failure`) runs in Rust so it matches the
//! in-memory broker exactly; the scripts only commit its result.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::MultiplexedConnection;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use visitrack_core::TaskId;

use super::{Broker, BrokerError, DeadLetterEntry, Failure, Lease, QueueStats, apply_failure};
use crate::config::RedisConfig;
use crate::tasks::retry::RetryPolicy;
use crate::tasks::types::{QueueName, TaskInfo, TaskMessage, TaskState};

/// Poll interval while waiting for work; bounded by the caller's wait.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Due entries promoted per queue per dequeue.
const PROMOTE_BATCH: usize = 100;

// KEYS: task, pending, scheduled, queues
// ARGV: id, msg, queue, process_at_ms, now_ms
const ENQUEUE: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
  return 0
end
local state
if tonumber(ARGV[4]) <= tonumber(ARGV[5]) then
  redis.call("HSET", KEYS[1], "msg", ARGV[2], "state", "pending", "queue", ARGV[3])
  redis.call("LPUSH", KEYS[2], ARGV[1])
  state = 1
else
  redis.call("HSET", KEYS[1], "msg", ARGV[2], "state", "scheduled", "queue", ARGV[3])
  redis.call("ZADD", KEYS[3], ARGV[4], ARGV[1])
  state = 2
end
redis.call("SADD", KEYS[4], ARGV[3])
return state
"#;

// KEYS: pending, scheduled, retry, active
// ARGV: now_ms, expires_ms, token, task key prefix, promote batch
const DEQUEUE: &str = r#"
for _, zkey in ipairs({KEYS[2], KEYS[3]}) do
  local due = redis.call("ZRANGEBYSCORE", zkey, "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[5]))
  for _, id in ipairs(due) do
    redis.call("ZREM", zkey, id)
    redis.call("LPUSH", KEYS[1], id)
    redis.call("HSET", ARGV[4] .. id, "state", "pending")
  end
end
local id = redis.call("RPOP", KEYS[1])
if not id then
  return false
end
local key = ARGV[4] .. id
redis.call("HSET", key, "state", "active", "token", ARGV[3])
redis.call("ZADD", KEYS[4], ARGV[2], id)
return redis.call("HGET", key, "msg")
"#;

// KEYS: task, active, completed
// ARGV: id, token
const ACK: &str = r#"
if redis.call("HGET", KEYS[1], "token") ~= ARGV[2] or not redis.call("ZSCORE", KEYS[2], ARGV[1]) then
  return 0
end
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("DEL", KEYS[1])
redis.call("INCR", KEYS[3])
return 1
"#;

// KEYS: task, active, retry
// ARGV: id, token, msg, process_at_ms
const RETRY: &str = r#"
if redis.call("HGET", KEYS[1], "token") ~= ARGV[2] or not redis.call("ZSCORE", KEYS[2], ARGV[1]) then
  return 0
end
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("HSET", KEYS[1], "msg", ARGV[3], "state", "retry")
redis.call("HDEL", KEYS[1], "token")
redis.call("ZADD", KEYS[3], ARGV[4], ARGV[1])
return 1
"#;

// KEYS: task, active, dead
// ARGV: id, token, msg, now_ms, reason
const KILL: &str = r#"
if redis.call("HGET", KEYS[1], "token") ~= ARGV[2] or not redis.call("ZSCORE", KEYS[2], ARGV[1]) then
  return 0
end
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("HSET", KEYS[1], "msg", ARGV[3], "state", "dead", "dead_at", ARGV[4], "reason", ARGV[5])
redis.call("HDEL", KEYS[1], "token")
redis.call("ZADD", KEYS[3], ARGV[4], ARGV[1])
return 1
"#;

// KEYS: task, active, pending
// ARGV: id, token
const REQUEUE: &str = r#"
if redis.call("HGET", KEYS[1], "token") ~= ARGV[2] or not redis.call("ZSCORE", KEYS[2], ARGV[1]) then
  return 0
end
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("HSET", KEYS[1], "state", "pending")
redis.call("HDEL", KEYS[1], "token")
redis.call("RPUSH", KEYS[3], ARGV[1])
return 1
"#;

// KEYS: task, dead, pending
// ARGV: id, msg
const REVIVE: &str = r#"
if redis.call("ZREM", KEYS[2], ARGV[1]) == 0 then
  return 0
end
redis.call("HSET", KEYS[1], "msg", ARGV[2], "state", "pending")
redis.call("HDEL", KEYS[1], "dead_at", "reason")
redis.call("LPUSH", KEYS[3], ARGV[1])
return 1
"#;

struct Scripts {
    enqueue: Script,
    dequeue: Script,
    ack: Script,
    retry: Script,
    kill: Script,
    requeue: Script,
    revive: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            dequeue: Script::new(DEQUEUE),
            ack: Script::new(ACK),
            retry: Script::new(RETRY),
            kill: Script::new(KILL),
            requeue: Script::new(REQUEUE),
            revive: Script::new(REVIVE),
        }
    }
}

/// Key layout under a namespace: `{ns}:t:{id}` holds a task hash,
/// `{ns}:q:{queue}:{set}` the per-queue sets, `{ns}:queues` the known queues.
#[derive(Debug, Clone)]
struct Keys {
    namespace: String,
}

impl Keys {
    fn new(namespace: &str) -> Self {
        Self { namespace: namespace.to_owned() }
    }

    fn task_prefix(&self) -> String {
        format!("{}:t:", self.namespace)
    }

    fn task_key(&self, id: TaskId) -> String {
        format!("{}{}", self.task_prefix(), id)
    }

    fn queue_key(&self, queue: &QueueName, suffix: &str) -> String {
        format!("{}:q:{}:{}", self.namespace, queue, suffix)
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.namespace)
    }
}

/// Redis [`Broker`].
pub struct RedisBroker {
    conn: MultiplexedConnection,
    keys: Keys,
    policy: RetryPolicy,
    scripts: Scripts,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("namespace", &self.keys.namespace)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Map Redis errors: connection-level failures become `Unavailable`.
fn map_redis_error(err: redis::RedisError) -> BrokerError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        BrokerError::Unavailable(err.to_string())
    } else {
        BrokerError::Command(err.to_string())
    }
}

fn encode(message: &TaskMessage) -> Result<String, BrokerError> {
    serde_json::to_string(message).map_err(|e| BrokerError::Codec(e.to_string()))
}

fn decode(raw: &str) -> Result<TaskMessage, BrokerError> {
    serde_json::from_str(raw).map_err(|e| BrokerError::Codec(e.to_string()))
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

impl RedisBroker {
    /// Connect and build a broker using the given retry policy.
    pub async fn connect(config: &RedisConfig, policy: RetryPolicy) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;

        Ok(Self {
            conn,
            keys: Keys::new(&config.namespace),
            policy,
            scripts: Scripts::load(),
        })
    }

    async fn try_dequeue(
        &self,
        queue: &QueueName,
        lease_timeout: Duration,
    ) -> Result<Option<Lease>, BrokerError> {
        let now = Utc::now();
        let token = Uuid::now_v7();
        let expires_at = now + chrono::Duration::from_std(lease_timeout).unwrap_or_default();

        let mut conn = self.conn.clone();
        let raw: Option<String> = self
            .scripts
            .dequeue
            .key(self.keys.queue_key(queue, "pending"))
            .key(self.keys.queue_key(queue, "scheduled"))
            .key(self.keys.queue_key(queue, "retry"))
            .key(self.keys.queue_key(queue, "active"))
            .arg(millis(now))
            .arg(millis(expires_at))
            .arg(token.to_string())
            .arg(self.keys.task_prefix())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        raw.map(|raw| {
            Ok(Lease {
                message: decode(&raw)?,
                token,
                leased_at: now,
                expires_at,
            })
        })
        .transpose()
    }

    /// Commit a failure decision for the holder of `token`. Returns `None` if
    /// the token no longer owns the task.
    async fn settle_failure(
        &self,
        mut message: TaskMessage,
        token: &str,
        failure: &Failure,
    ) -> Result<Option<TaskState>, BrokerError> {
        let now = Utc::now();
        let state = apply_failure(&mut message, failure, &self.policy, now);
        let id = message.id;
        let encoded = encode(&message)?;
        let mut conn = self.conn.clone();

        let applied: i64 = match state {
            TaskState::Retry => {
                self.scripts
                    .retry
                    .key(self.keys.task_key(id))
                    .key(self.keys.queue_key(&message.queue, "active"))
                    .key(self.keys.queue_key(&message.queue, "retry"))
                    .arg(id.to_string())
                    .arg(token)
                    .arg(encoded)
                    .arg(millis(message.process_at))
                    .invoke_async::<_, i64>(&mut conn)
                    .await
            }
            _ => {
                self.scripts
                    .kill
                    .key(self.keys.task_key(id))
                    .key(self.keys.queue_key(&message.queue, "active"))
                    .key(self.keys.queue_key(&message.queue, "dead"))
                    .arg(id.to_string())
                    .arg(token)
                    .arg(encoded)
                    .arg(millis(now))
                    .arg(&failure.error)
                    .invoke_async::<_, i64>(&mut conn)
                    .await
            }
        }
        .map_err(map_redis_error)?;

        Ok((applied == 1).then_some(state))
    }
}

#[async_trait]
impl Broker for RedisBroker {
    #[instrument(skip(self, message), fields(task_id = %message.id, queue = %message.queue), err)]
    async fn enqueue(&self, message: TaskMessage) -> Result<TaskInfo, BrokerError> {
        let encoded = encode(&message)?;
        let mut conn = self.conn.clone();
        let result: i64 = self
            .scripts
            .enqueue
            .key(self.keys.task_key(message.id))
            .key(self.keys.queue_key(&message.queue, "pending"))
            .key(self.keys.queue_key(&message.queue, "scheduled"))
            .key(self.keys.queues_key())
            .arg(message.id.to_string())
            .arg(encoded)
            .arg(message.queue.as_str())
            .arg(millis(message.process_at))
            .arg(millis(Utc::now()))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let state = match result {
            0 => return Err(BrokerError::Duplicate(message.id)),
            1 => TaskState::Pending,
            _ => TaskState::Scheduled,
        };
        Ok(TaskInfo::from_message(&message, state))
    }

    async fn dequeue(
        &self,
        queues: &[QueueName],
        wait: Duration,
        lease_timeout: Duration,
    ) -> Result<Option<Lease>, BrokerError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            for queue in queues {
                if let Some(lease) = self.try_dequeue(queue, lease_timeout).await? {
                    debug!(task_id = %lease.task_id(), queue = %queue, "leased task");
                    return Ok(Some(lease));
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError> {
        let id = lease.task_id();
        let queue = &lease.message.queue;
        let mut conn = self.conn.clone();
        let applied: i64 = self
            .scripts
            .ack
            .key(self.keys.task_key(id))
            .key(self.keys.queue_key(queue, "active"))
            .key(self.keys.queue_key(queue, "completed"))
            .arg(id.to_string())
            .arg(lease.token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if applied == 1 {
            Ok(())
        } else {
            Err(BrokerError::LeaseLost(id))
        }
    }

    async fn fail(&self, lease: &Lease, failure: Failure) -> Result<TaskState, BrokerError> {
        self.settle_failure(lease.message.clone(), &lease.token.to_string(), &failure)
            .await?
            .ok_or(BrokerError::LeaseLost(lease.task_id()))
    }

    async fn requeue(&self, lease: &Lease) -> Result<(), BrokerError> {
        let id = lease.task_id();
        let queue = &lease.message.queue;
        let mut conn = self.conn.clone();
        let applied: i64 = self
            .scripts
            .requeue
            .key(self.keys.task_key(id))
            .key(self.keys.queue_key(queue, "active"))
            .key(self.keys.queue_key(queue, "pending"))
            .arg(id.to_string())
            .arg(lease.token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if applied == 1 {
            Ok(())
        } else {
            Err(BrokerError::LeaseLost(id))
        }
    }

    async fn recover_expired(&self) -> Result<usize, BrokerError> {
        let mut conn = self.conn.clone();
        let queues: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.queues_key())
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let failure = Failure::retryable("lease expired");
        let mut recovered = 0;
        for queue in queues.into_iter().map(QueueName::new) {
            let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(self.keys.queue_key(&queue, "active"))
                .arg("-inf")
                .arg(millis(Utc::now()))
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;

            for id in expired {
                let (raw, token): (Option<String>, Option<String>) = redis::cmd("HMGET")
                    .arg(format!("{}{}", self.keys.task_prefix(), id))
                    .arg("msg")
                    .arg("token")
                    .query_async(&mut conn)
                    .await
                    .map_err(map_redis_error)?;
                let (Some(raw), Some(token)) = (raw, token) else {
                    continue;
                };
                let message = match decode(&raw) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(task_id = %id, error = %err, "skipping undecodable task during lease recovery");
                        continue;
                    }
                };
                if self.settle_failure(message, &token, &failure).await?.is_some() {
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }

    async fn dead_letters(
        &self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, BrokerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(self.keys.queue_key(queue, "dead"))
            .arg(0)
            .arg(limit as isize - 1)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let (raw, dead_at, reason): (Option<String>, Option<i64>, Option<String>) =
                redis::cmd("HMGET")
                    .arg(format!("{}{}", self.keys.task_prefix(), id))
                    .arg("msg")
                    .arg("dead_at")
                    .arg("reason")
                    .query_async(&mut conn)
                    .await
                    .map_err(map_redis_error)?;
            let Some(raw) = raw else {
                continue;
            };
            entries.push(DeadLetterEntry {
                message: decode(&raw)?,
                dead_at: dead_at
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .unwrap_or_else(Utc::now),
                reason: reason.unwrap_or_default(),
            });
        }
        Ok(entries)
    }

    async fn requeue_dead(&self, queue: &QueueName, id: TaskId) -> Result<TaskInfo, BrokerError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.keys.task_key(id))
            .arg("msg")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        let mut message = decode(&raw.ok_or(BrokerError::NotFound(id))?)?;
        message.retried = 0;
        message.process_at = Utc::now();

        let applied: i64 = self
            .scripts
            .revive
            .key(self.keys.task_key(id))
            .key(self.keys.queue_key(queue, "dead"))
            .key(self.keys.queue_key(queue, "pending"))
            .arg(id.to_string())
            .arg(encode(&message)?)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if applied == 1 {
            Ok(TaskInfo::from_message(&message, TaskState::Pending))
        } else {
            Err(BrokerError::NotFound(id))
        }
    }

    async fn stats(&self, queue: &QueueName) -> Result<QueueStats, BrokerError> {
        let mut conn = self.conn.clone();
        let (pending, scheduled, active, retry, dead, completed): (
            usize,
            usize,
            usize,
            usize,
            usize,
            Option<u64>,
        ) = redis::pipe()
            .cmd("LLEN")
            .arg(self.keys.queue_key(queue, "pending"))
            .cmd("ZCARD")
            .arg(self.keys.queue_key(queue, "scheduled"))
            .cmd("ZCARD")
            .arg(self.keys.queue_key(queue, "active"))
            .cmd("ZCARD")
            .arg(self.keys.queue_key(queue, "retry"))
            .cmd("ZCARD")
            .arg(self.keys.queue_key(queue, "dead"))
            .cmd("GET")
            .arg(self.keys.queue_key(queue, "completed"))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(QueueStats {
            pending,
            scheduled,
            active,
            retry,
            dead,
            completed: completed.unwrap_or(0),
        })
    }
}
