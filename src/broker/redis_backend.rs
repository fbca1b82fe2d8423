//! Redis-backed queue broker.
//!
//! Layout under `{prefix}`:
//! - `:waiting` sorted set scored by `priority * 1e13 + enqueue_ms`
//! - `:delayed` sorted set scored by ready time in ms
//! - `:active` sorted set scored by visibility deadline in ms
//! - `:entry:{id}` hash with `job_id`, `priority`, `attempts`
//! - `:index` hash `job_id -> id` for every live entry
//! - `:dead` sorted set scored by failure time, details in `:dead:{id}`,
//!   trimmed to the newest `dead_letter_limit` entries
//! - `:completed` counter
//!
//! Every state change is a single Lua script so concurrent workers never
//! observe an entry in two sets at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use crate::redis::RedisPool;

use super::{
    waiting_score, BrokerError, BrokerResult, DeadLetter, Delivery, EnqueueOptions, Pointer,
    QueueBroker, QueueCounts, DEFAULT_DEAD_LETTER_LIMIT, MAX_PRIORITY,
};

const ENQUEUE: &str = r#"
local existing = redis.call('HGET', KEYS[1], ARGV[1])
if existing then
    return existing
end
local id = ARGV[2]
redis.call('HSET', ARGV[7] .. id, 'job_id', ARGV[1], 'priority', ARGV[3], 'attempts', 0)
redis.call('HSET', KEYS[1], ARGV[1], id)
if tonumber(ARGV[5]) > tonumber(ARGV[6]) then
    redis.call('ZADD', KEYS[3], ARGV[5], id)
else
    redis.call('ZADD', KEYS[2], ARGV[4], id)
end
return id
"#;

const RESERVE: &str = r#"
local now = tonumber(ARGV[1])
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now, 'LIMIT', 0, 100)
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    local p = tonumber(redis.call('HGET', ARGV[3] .. id, 'priority') or '255')
    redis.call('ZADD', KEYS[1], string.format('%.0f', p * 1e13 + now), id)
end
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
    return false
end
local id = popped[1]
local key = ARGV[3] .. id
local job_id = redis.call('HGET', key, 'job_id')
if not job_id then
    return false
end
local attempts = redis.call('HINCRBY', key, 'attempts', 1)
redis.call('ZADD', KEYS[3], ARGV[2], id)
local priority = redis.call('HGET', key, 'priority') or '255'
return {id, job_id, tostring(attempts), priority}
"#;

const COMPLETE: &str = r#"
local key = ARGV[2] .. ARGV[1]
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
local job_id = redis.call('HGET', key, 'job_id')
if not job_id then
    return 0
end
if redis.call('HGET', KEYS[4], job_id) == ARGV[1] then
    redis.call('HDEL', KEYS[4], job_id)
end
redis.call('DEL', key)
redis.call('INCR', KEYS[5])
return 1
"#;

const RETRY: &str = r#"
local key = ARGV[5] .. ARGV[1]
if redis.call('HGET', key, 'attempts') ~= ARGV[2] then
    return 0
end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
    return 0
end
local ready = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
if ready > now then
    redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
else
    local p = tonumber(redis.call('HGET', key, 'priority') or '255')
    redis.call('ZADD', KEYS[2], string.format('%.0f', p * 1e13 + now), ARGV[1])
end
return 1
"#;

const DEAD_LETTER: &str = r#"
local key = ARGV[6] .. ARGV[1]
local attempts = redis.call('HGET', key, 'attempts') or ARGV[3]
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
if redis.call('HGET', KEYS[4], ARGV[2]) == ARGV[1] then
    redis.call('HDEL', KEYS[4], ARGV[2])
end
redis.call('DEL', key)
redis.call('HSET', ARGV[7] .. ARGV[1], 'job_id', ARGV[2], 'attempts', attempts,
    'reason', ARGV[4], 'failed_at', ARGV[5])
redis.call('ZADD', KEYS[5], ARGV[5], ARGV[1])
local excess = redis.call('ZCARD', KEYS[5]) - tonumber(ARGV[8])
if excess > 0 then
    local oldest = redis.call('ZRANGE', KEYS[5], 0, excess - 1)
    for _, old_id in ipairs(oldest) do
        redis.call('DEL', ARGV[7] .. old_id)
    end
    redis.call('ZREMRANGEBYRANK', KEYS[5], 0, excess - 1)
end
return 1
"#;

const EXTEND: &str = r#"
if redis.call('HGET', ARGV[3] .. ARGV[1], 'attempts') ~= ARGV[2] then
    return 0
end
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
    return 0
end
redis.call('ZADD', KEYS[1], 'XX', ARGV[4], ARGV[1])
return 1
"#;

const REQUEUE_EXPIRED: &str = r#"
local now = tonumber(ARGV[1])
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'LIMIT', 0, 500)
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[1], id)
    local p = tonumber(redis.call('HGET', ARGV[2] .. id, 'priority') or '255')
    redis.call('ZADD', KEYS[2], string.format('%.0f', p * 1e13 + now), id)
end
return #expired
"#;

struct Scripts {
    enqueue: Script,
    reserve: Script,
    complete: Script,
    retry: Script,
    dead_letter: Script,
    extend: Script,
    requeue_expired: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            reserve: Script::new(RESERVE),
            complete: Script::new(COMPLETE),
            retry: Script::new(RETRY),
            dead_letter: Script::new(DEAD_LETTER),
            extend: Script::new(EXTEND),
            requeue_expired: Script::new(REQUEUE_EXPIRED),
        }
    }
}

/// Redis implementation of `QueueBroker`; safe to share between processes.
pub struct RedisBroker {
    pool: Arc<RedisPool>,
    prefix: String,
    scripts: Scripts,
    dead_letter_limit: usize,
}

impl RedisBroker {
    pub fn new(pool: Arc<RedisPool>, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            scripts: Scripts::load(),
            dead_letter_limit: DEFAULT_DEAD_LETTER_LIMIT,
        }
    }

    pub fn with_dead_letter_limit(mut self, limit: usize) -> Self {
        self.dead_letter_limit = limit.max(1);
        self
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn entry_prefix(&self) -> String {
        self.key("entry:")
    }

    fn dead_prefix(&self) -> String {
        self.key("dead:")
    }

    fn parse_delivery(fields: Vec<String>) -> BrokerResult<Delivery> {
        let [broker_id, job_id, attempt, priority]: [String; 4] = fields
            .try_into()
            .map_err(|f: Vec<String>| BrokerError::Malformed(format!("{} fields", f.len())))?;

        let job_id = Uuid::parse_str(&job_id)
            .map_err(|e| BrokerError::Malformed(format!("job_id {}: {}", job_id, e)))?;
        let attempt = attempt
            .parse()
            .map_err(|_| BrokerError::Malformed(format!("attempts {}", attempt)))?;
        let priority = priority.parse().unwrap_or(MAX_PRIORITY);

        Ok(Delivery {
            broker_id,
            pointer: Pointer { job_id },
            attempt,
            priority,
        })
    }

    fn parse_dead_letter(broker_id: String, fields: HashMap<String, String>) -> Option<DeadLetter> {
        let job_id = Uuid::parse_str(fields.get("job_id")?).ok()?;
        let failed_ms: i64 = fields.get("failed_at")?.parse().ok()?;
        Some(DeadLetter {
            broker_id,
            job_id,
            attempts: fields
                .get("attempts")
                .and_then(|a| a.parse().ok())
                .unwrap_or(0),
            reason: fields.get("reason").cloned().unwrap_or_default(),
            failed_at: DateTime::from_timestamp_millis(failed_ms)?,
        })
    }
}

fn millis_from_now(delay: Duration) -> i64 {
    let delay_ms = delay.as_millis().min(i64::MAX as u128) as i64;
    Utc::now().timestamp_millis().saturating_add(delay_ms)
}

#[async_trait]
impl QueueBroker for RedisBroker {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(&self, pointer: Pointer, options: EnqueueOptions) -> BrokerResult<String> {
        let now_ms = Utc::now().timestamp_millis();
        let priority = options.priority.clamp(0, MAX_PRIORITY);
        let ready_ms = options.delay_until.map(|t| t.timestamp_millis()).unwrap_or(0);
        let score = format!("{:.0}", waiting_score(priority, now_ms));

        let keys = [self.key("index"), self.key("waiting"), self.key("delayed")];
        let entry_prefix = self.entry_prefix();
        let new_id = Uuid::new_v4().simple().to_string();
        let script = &self.scripts.enqueue;

        let id: String = self
            .pool
            .execute(|mut conn| async move {
                script
                    .key(&keys[0])
                    .key(&keys[1])
                    .key(&keys[2])
                    .arg(pointer.job_id.to_string())
                    .arg(new_id)
                    .arg(priority)
                    .arg(score)
                    .arg(ready_ms)
                    .arg(now_ms)
                    .arg(entry_prefix)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        tracing::debug!(job_id = %pointer.job_id, broker_id = %id, priority, "Pointer enqueued");
        Ok(id)
    }

    async fn reserve(&self, visibility_timeout: Duration) -> BrokerResult<Option<Delivery>> {
        let now_ms = Utc::now().timestamp_millis();
        let deadline_ms = millis_from_now(visibility_timeout);
        let keys = [self.key("waiting"), self.key("delayed"), self.key("active")];
        let entry_prefix = self.entry_prefix();
        let script = &self.scripts.reserve;

        let fields: Option<Vec<String>> = self
            .pool
            .execute(|mut conn| async move {
                script
                    .key(&keys[0])
                    .key(&keys[1])
                    .key(&keys[2])
                    .arg(now_ms)
                    .arg(deadline_ms)
                    .arg(entry_prefix)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        fields.map(Self::parse_delivery).transpose()
    }

    async fn extend(
        &self,
        delivery: &Delivery,
        visibility_timeout: Duration,
    ) -> BrokerResult<bool> {
        let active = self.key("active");
        let entry_prefix = self.entry_prefix();
        let id = delivery.broker_id.clone();
        let attempt = delivery.attempt;
        let deadline_ms = millis_from_now(visibility_timeout);
        let script = &self.scripts.extend;

        let extended: i64 = self
            .pool
            .execute(|mut conn| async move {
                script
                    .key(&active)
                    .arg(id)
                    .arg(attempt)
                    .arg(entry_prefix)
                    .arg(deadline_ms)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(extended == 1)
    }

    async fn complete(&self, delivery: &Delivery) -> BrokerResult<()> {
        let keys = [
            self.key("active"),
            self.key("waiting"),
            self.key("delayed"),
            self.key("index"),
            self.key("completed"),
        ];
        let entry_prefix = self.entry_prefix();
        let id = delivery.broker_id.clone();
        let script = &self.scripts.complete;

        let _: i64 = self
            .pool
            .execute(|mut conn| async move {
                let mut invocation = script.prepare_invoke();
                for key in &keys {
                    invocation.key(key);
                }
                invocation
                    .arg(id)
                    .arg(entry_prefix)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> BrokerResult<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let ready_ms = millis_from_now(delay);
        let keys = [self.key("active"), self.key("waiting"), self.key("delayed")];
        let entry_prefix = self.entry_prefix();
        let id = delivery.broker_id.clone();
        let attempt = delivery.attempt;
        let script = &self.scripts.retry;

        let moved: i64 = self
            .pool
            .execute(|mut conn| async move {
                script
                    .key(&keys[0])
                    .key(&keys[1])
                    .key(&keys[2])
                    .arg(id)
                    .arg(attempt)
                    .arg(ready_ms)
                    .arg(now_ms)
                    .arg(entry_prefix)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(moved == 1)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> BrokerResult<()> {
        let keys = [
            self.key("active"),
            self.key("waiting"),
            self.key("delayed"),
            self.key("index"),
            self.key("dead"),
        ];
        let entry_prefix = self.entry_prefix();
        let dead_prefix = self.dead_prefix();
        let id = delivery.broker_id.clone();
        let job_id = delivery.pointer.job_id.to_string();
        let attempt = delivery.attempt;
        let reason = reason.to_string();
        let failed_ms = Utc::now().timestamp_millis();
        let limit = self.dead_letter_limit;
        let script = &self.scripts.dead_letter;

        let _: i64 = self
            .pool
            .execute(|mut conn| async move {
                let mut invocation = script.prepare_invoke();
                for key in &keys {
                    invocation.key(key);
                }
                invocation
                    .arg(id)
                    .arg(job_id)
                    .arg(attempt)
                    .arg(reason)
                    .arg(failed_ms)
                    .arg(entry_prefix)
                    .arg(dead_prefix)
                    .arg(limit)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(())
    }

    async fn requeue_expired(&self) -> BrokerResult<u64> {
        let now_ms = Utc::now().timestamp_millis();
        let keys = [self.key("active"), self.key("waiting")];
        let entry_prefix = self.entry_prefix();
        let script = &self.scripts.requeue_expired;

        let moved: u64 = self
            .pool
            .execute(|mut conn| async move {
                script
                    .key(&keys[0])
                    .key(&keys[1])
                    .arg(now_ms)
                    .arg(entry_prefix)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(moved)
    }

    async fn is_tracked(&self, job_id: Uuid) -> BrokerResult<bool> {
        let index = self.key("index");
        let tracked: bool = self
            .pool
            .execute(|mut conn| async move { conn.hexists(index, job_id.to_string()).await })
            .await?;
        Ok(tracked)
    }

    async fn counts(&self) -> BrokerResult<QueueCounts> {
        let keys = [
            self.key("waiting"),
            self.key("delayed"),
            self.key("active"),
            self.key("dead"),
            self.key("completed"),
        ];

        let (waiting, delayed, active, failed, completed): (u64, u64, u64, u64, Option<u64>) =
            self.pool
                .execute(|mut conn| async move {
                    redis::pipe()
                        .zcard(&keys[0])
                        .zcard(&keys[1])
                        .zcard(&keys[2])
                        .zcard(&keys[3])
                        .get(&keys[4])
                        .query_async(&mut conn)
                        .await
                })
                .await?;

        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            completed: completed.unwrap_or(0),
            failed,
        })
    }

    async fn dead_letters(&self, limit: usize) -> BrokerResult<Vec<DeadLetter>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let dead = self.key("dead");
        let dead_prefix = self.dead_prefix();
        let stop = limit as isize - 1;

        let (ids, details): (Vec<String>, Vec<HashMap<String, String>>) = self
            .pool
            .execute(|mut conn| async move {
                let ids: Vec<String> = conn.zrevrange(&dead, 0, stop).await?;
                let mut pipe = redis::pipe();
                for id in &ids {
                    pipe.hgetall(format!("{}{}", dead_prefix, id));
                }
                let details: Vec<HashMap<String, String>> = if ids.is_empty() {
                    Vec::new()
                } else {
                    pipe.query_async(&mut conn).await?
                };
                Ok::<_, redis::RedisError>((ids, details))
            })
            .await?;

        Ok(ids
            .into_iter()
            .zip(details)
            .filter_map(|(id, fields)| Self::parse_dead_letter(id, fields))
            .collect())
    }
}
