//! Durable task queue with Redis backend.
//!
//! Producers submit `(function name, args)` envelopes with optional dedup
//! keys, delayed execution times, concurrency keys, and retry policies. The
//! queue owns four structures per logical queue name: a ready sorted set, a
//! scheduled sorted set (score = run-at time), a claims sorted set (score =
//! claim time, feeding the stale-claim reaper), and one envelope hash per
//! job. Concurrency slots are tracked in per-key sorted sets guarded by a
//! small Lua script so acquisition stays atomic across workers.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SreError, SreResult};
use crate::keys::RedisKeys;

/// Dedup tokens expire after this many seconds.
pub const DEDUP_TTL_SECS: u64 = 300;

/// Retry policy for a submitted job: bounded attempts with exponential
/// backoff from `initial_delay_secs`, capped at `max_delay_secs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay_secs: 5,
            max_delay_secs: 300,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial_delay_secs: u64) -> Self {
        Self {
            attempts,
            initial_delay_secs,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based): initial * 2^(n-1),
    /// capped.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.initial_delay_secs.saturating_mul(1u64 << exponent);
        delay.min(self.max_delay_secs)
    }
}

/// Persisted job envelope. Only `(fn_name, args)` cross the wire, never
/// closures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: String,
    pub fn_name: String,
    pub args: Value,
    pub queue: String,
    /// Completed execution attempts so far
    pub attempt: u32,
    pub retry: RetryPolicy,
    #[serde(default)]
    pub concurrency_key: Option<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default)]
    pub dedup_key: Option<String>,
    /// SRE task record driven by this job, when one exists at submit time
    #[serde(default)]
    pub task_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
}

fn default_max_concurrent() -> u32 {
    1
}

/// Submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Claim this slot before enqueueing; losers get [`SubmitOutcome::Duplicate`]
    pub dedup_key: Option<String>,
    /// Earliest execution time
    pub when: Option<DateTime<Utc>>,
    /// At most `max_concurrent` in-flight jobs share this key
    pub concurrency_key: Option<String>,
    pub max_concurrent: u32,
    pub retry: Option<RetryPolicy>,
    /// SRE task record the worker should drive through its lifecycle
    pub task_id: Option<String>,
}

impl SubmitOptions {
    /// Per-thread serialization: `concurrency_key = thread_id, max_concurrent = 1`.
    pub fn serialized_on(thread_id: &str) -> Self {
        Self {
            concurrency_key: Some(thread_id.to_string()),
            max_concurrent: 1,
            ..Self::default()
        }
    }

    pub fn at(mut self, when: DateTime<Utc>) -> Self {
        self.when = Some(when);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Result of a submission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted(String),
    /// Another producer already claimed the dedup slot
    Duplicate,
}

impl SubmitOutcome {
    /// Job id, or the `already_running` sentinel on dedup collision.
    pub fn job_id(&self) -> &str {
        match self {
            SubmitOutcome::Submitted(id) => id,
            SubmitOutcome::Duplicate => "already_running",
        }
    }

    pub fn was_submitted(&self) -> bool {
        matches!(self, SubmitOutcome::Submitted(_))
    }
}

/// Configuration for the task queue.
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// Logical queue name (`TASK_QUEUE_NAME`)
    pub queue_name: String,
    /// Maximum runtime of one task execution, in seconds
    pub max_task_runtime_secs: u64,
    /// Failed envelope retention
    pub failed_ttl_secs: u64,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "sre_tasks".to_string(),
            max_task_runtime_secs: 300,
            failed_ttl_secs: 604800,
        }
    }
}

impl TaskQueueConfig {
    /// Claims older than this are considered abandoned and reaped.
    pub fn claim_grace_secs(&self) -> u64 {
        self.max_task_runtime_secs * 5
    }

    /// Slot entries older than this are pruned during acquisition.
    pub fn slot_stale_secs(&self) -> u64 {
        self.max_task_runtime_secs * 2
    }
}

/// Redis-backed task queue.
#[derive(Clone)]
pub struct TaskQueue {
    conn: ConnectionManager,
    config: TaskQueueConfig,
    acquire_slot: Script,
}

impl TaskQueue {
    pub fn new(conn: ConnectionManager, config: TaskQueueConfig) -> Self {
        // Prune stale slot holders, then admit the job only while the slot
        // count stays under the limit. KEYS[1] = slots zset; ARGV = stale
        // cutoff, max concurrent, now, job id.
        let acquire_slot = Script::new(
            r#"
            redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
            if redis.call('ZCARD', KEYS[1]) < tonumber(ARGV[2]) then
                redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
                return 1
            end
            return 0
            "#,
        );
        Self {
            conn,
            config,
            acquire_slot,
        }
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    /// Atomically claim a dedup slot. Returns false when another producer
    /// holds it.
    pub async fn claim_dedup(&self, dedup_key: &str) -> SreResult<bool> {
        let mut conn = self.conn.clone();
        let outcome: Option<String> = redis::cmd("SET")
            .arg(RedisKeys::task_dedup(dedup_key))
            .arg("submitted")
            .arg("NX")
            .arg("EX")
            .arg(DEDUP_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        Ok(outcome.is_some())
    }

    /// Submit a job. With a dedup key, only the SETNX winner enqueues;
    /// losers receive [`SubmitOutcome::Duplicate`].
    pub async fn submit(
        &self,
        fn_name: &str,
        args: Value,
        options: SubmitOptions,
    ) -> SreResult<SubmitOutcome> {
        if let Some(dedup_key) = &options.dedup_key {
            if !self.claim_dedup(dedup_key).await? {
                debug!(fn_name, dedup_key, "dedup collision, job not enqueued");
                return Ok(SubmitOutcome::Duplicate);
            }
        }

        let envelope = JobEnvelope {
            id: Uuid::now_v7().to_string(),
            fn_name: fn_name.to_string(),
            args,
            queue: self.config.queue_name.clone(),
            attempt: 0,
            retry: options.retry.unwrap_or_default(),
            concurrency_key: options.concurrency_key,
            max_concurrent: options.max_concurrent.max(1),
            dedup_key: options.dedup_key,
            task_id: options.task_id,
            submitted_at: Utc::now(),
            not_before: options.when,
        };
        self.save_envelope(&envelope).await?;

        let mut conn = self.conn.clone();
        match envelope.not_before {
            Some(when) if when > Utc::now() => {
                let _: () = conn
                    .zadd(
                        RedisKeys::queue_scheduled(&self.config.queue_name),
                        &envelope.id,
                        when.timestamp(),
                    )
                    .await?;
            }
            _ => {
                let _: () = conn
                    .zadd(
                        RedisKeys::queue_ready(&self.config.queue_name),
                        &envelope.id,
                        Utc::now().timestamp(),
                    )
                    .await?;
            }
        }

        debug!(fn_name, job_id = %envelope.id, "submitted job");
        Ok(SubmitOutcome::Submitted(envelope.id))
    }

    /// Persist the envelope hash (also used to bump attempt counters).
    pub async fn save_envelope(&self, envelope: &JobEnvelope) -> SreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(
                RedisKeys::queue_job(&envelope.id),
                "data",
                serde_json::to_string(envelope)?,
            )
            .await?;
        Ok(())
    }

    pub async fn load_envelope(&self, job_id: &str) -> SreResult<Option<JobEnvelope>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(RedisKeys::queue_job(job_id), "data").await?;
        raw.map(|data| serde_json::from_str(&data).map_err(SreError::from))
            .transpose()
    }

    /// Claim the next ready job, if any. The `ZREM` race decides ownership:
    /// only the poller that removes the member proceeds.
    pub async fn pop_ready(&self) -> SreResult<Option<JobEnvelope>> {
        let mut conn = self.conn.clone();
        let ready_key = RedisKeys::queue_ready(&self.config.queue_name);
        let now = Utc::now().timestamp();

        let candidates: Vec<String> = conn
            .zrangebyscore_limit(&ready_key, "-inf", now, 0, 4)
            .await?;
        for job_id in candidates {
            let removed: i64 = conn.zrem(&ready_key, &job_id).await?;
            if removed == 0 {
                continue;
            }
            let _: () = conn
                .zadd(
                    RedisKeys::queue_claims(&self.config.queue_name),
                    &job_id,
                    Utc::now().timestamp(),
                )
                .await?;
            match self.load_envelope(&job_id).await? {
                Some(envelope) => return Ok(Some(envelope)),
                None => {
                    warn!(job_id, "claimed job with no envelope, dropping claim");
                    let _: () = conn
                        .zrem(RedisKeys::queue_claims(&self.config.queue_name), &job_id)
                        .await?;
                }
            }
        }
        Ok(None)
    }

    /// Move due scheduled jobs into the ready set. Returns how many moved.
    pub async fn promote_scheduled(&self) -> SreResult<u64> {
        let mut conn = self.conn.clone();
        let scheduled_key = RedisKeys::queue_scheduled(&self.config.queue_name);
        let ready_key = RedisKeys::queue_ready(&self.config.queue_name);
        let now = Utc::now().timestamp();

        let due: Vec<String> = conn.zrangebyscore(&scheduled_key, "-inf", now).await?;
        let mut promoted = 0;
        for job_id in due {
            let removed: i64 = conn.zrem(&scheduled_key, &job_id).await?;
            if removed == 1 {
                let _: () = conn.zadd(&ready_key, &job_id, now).await?;
                promoted += 1;
            }
        }
        if promoted > 0 {
            debug!(promoted, "promoted scheduled jobs");
        }
        Ok(promoted)
    }

    /// Acquire a concurrency slot for the job. Atomic via Lua.
    pub async fn acquire_slot(
        &self,
        concurrency_key: &str,
        max_concurrent: u32,
        job_id: &str,
    ) -> SreResult<bool> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp();
        let stale_cutoff = now - self.config.slot_stale_secs() as i64;
        let admitted: i64 = self
            .acquire_slot
            .key(RedisKeys::queue_slots(concurrency_key))
            .arg(stale_cutoff)
            .arg(max_concurrent)
            .arg(now)
            .arg(job_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(admitted == 1)
    }

    pub async fn release_slot(&self, concurrency_key: &str, job_id: &str) -> SreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zrem(RedisKeys::queue_slots(concurrency_key), job_id)
            .await?;
        Ok(())
    }

    /// Return a claimed job to the scheduled set after `delay` seconds.
    /// Used for retries and for contended concurrency slots.
    pub async fn requeue_with_delay(&self, envelope: &JobEnvelope, delay_secs: u64) -> SreResult<()> {
        self.save_envelope(envelope).await?;
        let mut conn = self.conn.clone();
        let run_at = (Utc::now() + ChronoDuration::seconds(delay_secs as i64)).timestamp();
        let _: () = conn
            .zrem(
                RedisKeys::queue_claims(&self.config.queue_name),
                &envelope.id,
            )
            .await?;
        let _: () = conn
            .zadd(
                RedisKeys::queue_scheduled(&self.config.queue_name),
                &envelope.id,
                run_at,
            )
            .await?;
        debug!(job_id = %envelope.id, delay_secs, "requeued job");
        Ok(())
    }

    /// Drop the claim and envelope for a finished job.
    pub async fn complete_job(&self, job_id: &str) -> SreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zrem(RedisKeys::queue_claims(&self.config.queue_name), job_id)
            .await?;
        let _: () = conn.del(RedisKeys::queue_job(job_id)).await?;
        Ok(())
    }

    /// Retire a job that exhausted its retries, retaining the envelope for
    /// inspection under a TTL.
    pub async fn fail_job(&self, envelope: &JobEnvelope, error: &str) -> SreResult<()> {
        let mut conn = self.conn.clone();
        let mut record = serde_json::to_value(envelope)?;
        if let Some(map) = record.as_object_mut() {
            map.insert("error".to_string(), Value::String(error.to_string()));
        }
        let _: () = redis::cmd("SET")
            .arg(RedisKeys::queue_failed(&envelope.id))
            .arg(serde_json::to_string(&record)?)
            .arg("EX")
            .arg(self.config.failed_ttl_secs)
            .query_async(&mut conn)
            .await?;
        let _: () = conn
            .zrem(
                RedisKeys::queue_claims(&self.config.queue_name),
                &envelope.id,
            )
            .await?;
        let _: () = conn.del(RedisKeys::queue_job(&envelope.id)).await?;
        Ok(())
    }

    /// Return abandoned claims (older than the grace period) to the ready
    /// set. Invoked by workers on startup and on a timer.
    pub async fn reap_stale_claims(&self) -> SreResult<u64> {
        let mut conn = self.conn.clone();
        let claims_key = RedisKeys::queue_claims(&self.config.queue_name);
        let ready_key = RedisKeys::queue_ready(&self.config.queue_name);
        let cutoff = Utc::now().timestamp() - self.config.claim_grace_secs() as i64;

        let stale: Vec<String> = conn.zrangebyscore(&claims_key, "-inf", cutoff).await?;
        let mut reaped = 0;
        for job_id in stale {
            let removed: i64 = conn.zrem(&claims_key, &job_id).await?;
            if removed == 1 {
                let _: () = conn
                    .zadd(&ready_key, &job_id, Utc::now().timestamp())
                    .await?;
                reaped += 1;
                warn!(job_id, "reaped abandoned claim back to queue");
            }
        }
        if reaped > 0 {
            info!(reaped, "stale-claim reaper returned jobs to the queue");
        }
        Ok(reaped)
    }

    /// Depths of the ready, scheduled, and claimed sets.
    pub async fn queue_depths(&self) -> SreResult<(u64, u64, u64)> {
        let mut conn = self.conn.clone();
        let ready: u64 = conn
            .zcard(RedisKeys::queue_ready(&self.config.queue_name))
            .await?;
        let scheduled: u64 = conn
            .zcard(RedisKeys::queue_scheduled(&self.config.queue_name))
            .await?;
        let claimed: u64 = conn
            .zcard(RedisKeys::queue_claims(&self.config.queue_name))
            .await?;
        Ok((ready, scheduled, claimed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay_for(1), 5);
        assert_eq!(retry.delay_for(2), 10);
        assert_eq!(retry.delay_for(3), 20);
        assert_eq!(retry.delay_for(10), 300);
    }

    #[test]
    fn zero_attempt_backoff_is_initial_delay() {
        let retry = RetryPolicy::new(3, 7);
        assert_eq!(retry.delay_for(0), 7);
        assert_eq!(retry.delay_for(1), 7);
    }

    #[test]
    fn duplicate_outcome_reports_sentinel_id() {
        assert_eq!(SubmitOutcome::Duplicate.job_id(), "already_running");
        assert!(!SubmitOutcome::Duplicate.was_submitted());
        assert!(SubmitOutcome::Submitted("j1".into()).was_submitted());
    }

    #[test]
    fn claim_grace_is_five_times_max_runtime() {
        let config = TaskQueueConfig::default();
        assert_eq!(config.claim_grace_secs(), 1500);
    }

    #[test]
    fn serialized_options_pin_the_thread() {
        let options = SubmitOptions::serialized_on("th-9");
        assert_eq!(options.concurrency_key.as_deref(), Some("th-9"));
        assert_eq!(options.max_concurrent, 1);
    }
}
