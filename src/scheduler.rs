//! Schedules and the scheduler loop.
//!
//! A schedule is a cron-like recurring directive persisted in a single hash
//! (`sre_schedules:{id}`) that doubles as its FT document. The scheduler tick
//! is a perpetual task: each pass finds due schedules, materializes a thread
//! per run, submits an agent turn with a minute-slot dedup key, and advances
//! the schedule clock whether or not the submission won the slot.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::agent::PROCESS_AGENT_TURN;
use crate::error::{SreError, SreResult};
use crate::keys::RedisKeys;
use crate::queue::{RetryPolicy, SubmitOptions, SubmitOutcome, TaskQueue};
use crate::search::{IndexName, SearchIndexes, SearchOptions};
use crate::threads::{derive_subject, CreateThread, ThreadManager};
use crate::worker::Registration;

/// Registered name of the scheduler tick function.
pub const SCHEDULER_TICK: &str = "scheduler_tick";

/// Shared concurrency key keeping the tick a singleton across workers.
pub const SCHEDULER_SENTINEL: &str = "sentinel";

/// Cadence of the perpetual scheduler tick.
pub const SCHEDULER_EVERY: StdDuration = StdDuration::from_secs(30);

/// Calendar-agnostic interval units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalType {
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl IntervalType {
    pub fn seconds(&self) -> u64 {
        match self {
            IntervalType::Minutes => 60,
            IntervalType::Hours => 3600,
            IntervalType::Days => 86400,
            IntervalType::Weeks => 604800,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalType::Minutes => "minutes",
            IntervalType::Hours => "hours",
            IntervalType::Days => "days",
            IntervalType::Weeks => "weeks",
        }
    }
}

impl FromStr for IntervalType {
    type Err = SreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "minutes" => Ok(IntervalType::Minutes),
            "hours" => Ok(IntervalType::Hours),
            "days" => Ok(IntervalType::Days),
            "weeks" => Ok(IntervalType::Weeks),
            other => Err(SreError::validation(format!(
                "invalid interval_type '{other}', expected minutes|hours|days|weeks"
            ))),
        }
    }
}

/// A recurring directive against a Redis instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub interval_type: IntervalType,
    pub interval_value: u64,
    pub instructions: String,
    pub redis_instance_id: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn interval(&self) -> Duration {
        Duration::seconds((self.interval_type.seconds() * self.interval_value) as i64)
    }

    /// Next run strictly after `from`.
    pub fn calculate_next_run(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from + self.interval()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|next| next <= now)
    }
}

/// Minute-precision slot used for scheduler dedup keys.
pub fn minute_slot(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M").to_string()
}

/// Second-precision slot used for manual trigger dedup keys.
pub fn second_slot(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

/// Dedup key for a schedule's minute slot.
pub fn schedule_dedup_key(schedule_id: &str, at: DateTime<Utc>) -> String {
    format!("schedule_{}_{}", schedule_id, minute_slot(at))
}

#[derive(Debug, Clone)]
pub struct CreateSchedule {
    pub name: String,
    pub description: String,
    pub interval_type: IntervalType,
    pub interval_value: u64,
    pub instructions: String,
    pub redis_instance_id: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateSchedule {
    pub name: Option<String>,
    pub description: Option<String>,
    pub interval_type: Option<IntervalType>,
    pub interval_value: Option<u64>,
    pub instructions: Option<String>,
    pub redis_instance_id: Option<Option<String>>,
    pub enabled: Option<bool>,
}

/// Persistence for schedules. The backing hash is also the FT document, so
/// numeric fields are stored as epoch seconds.
#[derive(Clone)]
pub struct ScheduleStore {
    conn: ConnectionManager,
    search: SearchIndexes,
}

impl ScheduleStore {
    pub fn new(conn: ConnectionManager, search: SearchIndexes) -> Self {
        Self { conn, search }
    }

    pub async fn create(&self, request: CreateSchedule) -> SreResult<Schedule> {
        if request.interval_value < 1 {
            return Err(SreError::validation("interval_value must be >= 1"));
        }
        let now = Utc::now();
        let mut schedule = Schedule {
            id: Uuid::now_v7().to_string(),
            name: request.name,
            description: request.description,
            interval_type: request.interval_type,
            interval_value: request.interval_value,
            instructions: request.instructions,
            redis_instance_id: request.redis_instance_id,
            enabled: request.enabled,
            created_at: now,
            updated_at: now,
            next_run_at: None,
            last_run_at: None,
        };
        schedule.next_run_at = Some(schedule.calculate_next_run(now));
        self.save(&schedule).await?;
        info!(schedule_id = %schedule.id, name = %schedule.name, "created schedule");
        Ok(schedule)
    }

    pub async fn save(&self, schedule: &Schedule) -> SreResult<()> {
        let mut conn = self.conn.clone();
        let fields = vec![
            ("id", schedule.id.clone()),
            ("name", schedule.name.clone()),
            ("description", schedule.description.clone()),
            ("interval_type", schedule.interval_type.as_str().to_string()),
            ("interval_value", schedule.interval_value.to_string()),
            ("instructions", schedule.instructions.clone()),
            (
                "redis_instance_id",
                schedule.redis_instance_id.clone().unwrap_or_default(),
            ),
            ("enabled", schedule.enabled.to_string()),
            ("created_at", schedule.created_at.to_rfc3339()),
            ("updated_at", schedule.updated_at.to_rfc3339()),
            (
                "next_run_at",
                schedule
                    .next_run_at
                    .map(|t| t.timestamp().to_string())
                    .unwrap_or_default(),
            ),
            (
                "last_run_at",
                schedule
                    .last_run_at
                    .map(|t| t.timestamp().to_string())
                    .unwrap_or_default(),
            ),
        ];
        let pairs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let _: () = conn
            .hset_multiple(RedisKeys::schedule(&schedule.id), &pairs)
            .await?;
        let _: () = conn
            .zadd(
                RedisKeys::schedules_index(),
                &schedule.id,
                schedule.created_at.timestamp(),
            )
            .await?;
        if let Err(e) = self.search.ensure_index(IndexName::Schedules).await {
            tracing::warn!(error = %e, "failed to ensure schedules index");
        }
        Ok(())
    }

    pub async fn get(&self, schedule_id: &str) -> SreResult<Option<Schedule>> {
        let mut conn = self.conn.clone();
        let raw: std::collections::HashMap<String, String> =
            conn.hgetall(RedisKeys::schedule(schedule_id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(schedule_from_hash(schedule_id, &raw)?))
    }

    pub async fn list(&self) -> SreResult<Vec<Schedule>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrange(RedisKeys::schedules_index(), 0, -1).await?;
        let mut schedules = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(schedule) = self.get(&id).await? {
                schedules.push(schedule);
            }
        }
        Ok(schedules)
    }

    pub async fn update(&self, schedule_id: &str, patch: UpdateSchedule) -> SreResult<Schedule> {
        let mut schedule = self
            .get(schedule_id)
            .await?
            .ok_or_else(|| SreError::not_found("schedule", schedule_id))?;

        let interval_changed = patch.interval_type.is_some() || patch.interval_value.is_some();
        if let Some(name) = patch.name {
            schedule.name = name;
        }
        if let Some(description) = patch.description {
            schedule.description = description;
        }
        if let Some(interval_type) = patch.interval_type {
            schedule.interval_type = interval_type;
        }
        if let Some(interval_value) = patch.interval_value {
            if interval_value < 1 {
                return Err(SreError::validation("interval_value must be >= 1"));
            }
            schedule.interval_value = interval_value;
        }
        if let Some(instructions) = patch.instructions {
            schedule.instructions = instructions;
        }
        if let Some(instance) = patch.redis_instance_id {
            schedule.redis_instance_id = instance;
        }
        if let Some(enabled) = patch.enabled {
            schedule.enabled = enabled;
        }
        schedule.updated_at = Utc::now();
        if interval_changed {
            schedule.next_run_at = Some(schedule.calculate_next_run(Utc::now()));
        }
        self.save(&schedule).await?;
        Ok(schedule)
    }

    /// Deletion removes the schedule only; threads and tasks it produced
    /// keep their weak `context.schedule_id` reference.
    pub async fn delete(&self, schedule_id: &str) -> SreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(RedisKeys::schedule(schedule_id)).await?;
        let _: () = conn.zrem(RedisKeys::schedules_index(), schedule_id).await?;
        Ok(removed > 0)
    }

    /// Enabled schedules with `next_run_at <= now`. Index-first; falls back
    /// to a KV scan over the id set.
    pub async fn find_due(&self, now: DateTime<Utc>) -> SreResult<Vec<Schedule>> {
        let query = format!("@enabled:{{true}} @next_run_at:[-inf {}]", now.timestamp());
        let options = SearchOptions {
            return_fields: vec!["id"],
            sort_by: Some(("next_run_at", true)),
            limit: 200,
            offset: 0,
        };
        match self.search.search(IndexName::Schedules, &query, &options).await {
            Ok(hits) => {
                let mut due = Vec::with_capacity(hits.len());
                for hit in hits {
                    let id = hit.doc_id(IndexName::Schedules);
                    if let Some(schedule) = self.get(&id).await? {
                        if schedule.is_due(now) {
                            due.push(schedule);
                        }
                    }
                }
                Ok(due)
            }
            Err(e) => {
                debug!(error = %e, "schedules index query failed, scanning KV");
                Ok(self
                    .list()
                    .await?
                    .into_iter()
                    .filter(|s| s.is_due(now))
                    .collect())
            }
        }
    }

    pub async fn update_last_run(&self, schedule_id: &str, at: DateTime<Utc>) -> SreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(
                RedisKeys::schedule(schedule_id),
                "last_run_at",
                at.timestamp().to_string(),
            )
            .await?;
        let _: () = conn
            .hset(
                RedisKeys::schedule(schedule_id),
                "updated_at",
                Utc::now().to_rfc3339(),
            )
            .await?;
        Ok(())
    }

    pub async fn update_next_run(&self, schedule_id: &str, at: DateTime<Utc>) -> SreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(
                RedisKeys::schedule(schedule_id),
                "next_run_at",
                at.timestamp().to_string(),
            )
            .await?;
        Ok(())
    }
}

fn schedule_from_hash(
    schedule_id: &str,
    raw: &std::collections::HashMap<String, String>,
) -> SreResult<Schedule> {
    let get = |key: &str| raw.get(key).cloned().unwrap_or_default();
    let parse_epoch = |key: &str| -> Option<DateTime<Utc>> {
        raw.get(key)
            .filter(|v| !v.is_empty())
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    };
    let parse_iso = |key: &str| -> DateTime<Utc> {
        raw.get(key)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now)
    };
    Ok(Schedule {
        id: schedule_id.to_string(),
        name: get("name"),
        description: get("description"),
        interval_type: IntervalType::from_str(raw.get("interval_type").map(String::as_str).unwrap_or("minutes"))?,
        interval_value: raw
            .get("interval_value")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1),
        instructions: get("instructions"),
        redis_instance_id: raw
            .get("redis_instance_id")
            .filter(|v| !v.is_empty())
            .cloned(),
        enabled: raw.get("enabled").map(String::as_str) == Some("true"),
        created_at: parse_iso("created_at"),
        updated_at: parse_iso("updated_at"),
        next_run_at: parse_epoch("next_run_at"),
        last_run_at: parse_epoch("last_run_at"),
    })
}

/// Summary returned by one scheduler pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickSummary {
    pub processed_schedules: usize,
    pub submitted_tasks: usize,
    pub timestamp: String,
}

/// Fan-out service: one pass per tick, plus manual triggers.
pub struct SchedulerService {
    store: ScheduleStore,
    threads: ThreadManager,
    queue: Arc<TaskQueue>,
}

impl SchedulerService {
    pub fn new(store: ScheduleStore, threads: ThreadManager, queue: Arc<TaskQueue>) -> Self {
        Self {
            store,
            threads,
            queue,
        }
    }

    pub fn store(&self) -> &ScheduleStore {
        &self.store
    }

    /// One scheduler pass: materialize every due schedule into a thread and
    /// a dedup-guarded agent turn, then advance the schedule clock.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> SreResult<TickSummary> {
        let due = self.store.find_due(now).await?;
        if due.is_empty() {
            debug!("no schedules due");
            return Ok(TickSummary {
                processed_schedules: 0,
                submitted_tasks: 0,
                timestamp: now.to_rfc3339(),
            });
        }
        info!(count = due.len(), "schedules due for materialization");

        let mut submitted = 0;
        for schedule in &due {
            let scheduled_time = schedule.next_run_at.unwrap_or(now);
            match self.materialize(schedule, scheduled_time).await {
                Ok(true) => submitted += 1,
                Ok(false) => {
                    debug!(schedule_id = %schedule.id, "run already claimed for this slot");
                }
                Err(e) => {
                    error!(schedule_id = %schedule.id, error = %e, "failed to materialize schedule");
                }
            }

            // Advance the clock regardless of the submission outcome; missed
            // slots are skipped, never replayed in a storm.
            if let Err(e) = self.store.update_last_run(&schedule.id, scheduled_time).await {
                error!(schedule_id = %schedule.id, error = %e, "failed to update last_run_at");
            }
            let next = schedule.calculate_next_run(scheduled_time);
            if let Err(e) = self.store.update_next_run(&schedule.id, next).await {
                error!(schedule_id = %schedule.id, error = %e, "failed to update next_run_at");
            }
        }

        let summary = TickSummary {
            processed_schedules: due.len(),
            submitted_tasks: submitted,
            timestamp: now.to_rfc3339(),
        };
        info!(
            processed = summary.processed_schedules,
            submitted = summary.submitted_tasks,
            "scheduler pass complete"
        );
        Ok(summary)
    }

    /// Claim the minute slot, and only on the claim create the thread and
    /// submit the turn. Returns whether this pass won the slot.
    async fn materialize(
        &self,
        schedule: &Schedule,
        scheduled_time: DateTime<Utc>,
    ) -> SreResult<bool> {
        let dedup_key = schedule_dedup_key(&schedule.id, scheduled_time);
        if !self.queue.claim_dedup(&dedup_key).await? {
            return Ok(false);
        }

        let mut context = Map::new();
        context.insert("schedule_id".into(), Value::String(schedule.id.clone()));
        context.insert("schedule_name".into(), Value::String(schedule.name.clone()));
        context.insert("automated".into(), Value::Bool(true));
        context.insert(
            "original_query".into(),
            Value::String(schedule.instructions.clone()),
        );
        context.insert(
            "scheduled_at".into(),
            Value::String(scheduled_time.to_rfc3339()),
        );
        if let Some(instance_id) = &schedule.redis_instance_id {
            context.insert("instance_id".into(), Value::String(instance_id.clone()));
        }
        context.insert("messages".into(), Value::Array(Vec::new()));

        let thread_id = self
            .threads
            .create_thread(CreateThread {
                user_id: Some("scheduler".into()),
                session_id: Some(format!(
                    "schedule_{}_{}",
                    schedule.id,
                    minute_slot(scheduled_time)
                )),
                initial_context: Some(context.clone()),
                tags: vec!["automated".into(), "scheduled".into()],
            })
            .await?;
        self.threads
            .set_thread_subject(&thread_id, &derive_subject(&schedule.name))
            .await?;

        let args = json!({
            "thread_id": thread_id,
            "message": schedule.instructions,
            "context": context,
        });
        // The slot is already claimed above, so the submission itself does
        // not carry the dedup key.
        let options = SubmitOptions::serialized_on(&thread_id)
            .at(scheduled_time)
            .with_retry(RetryPolicy::new(3, 5));
        let outcome = self.queue.submit(PROCESS_AGENT_TURN, args, options).await?;
        if let SubmitOutcome::Submitted(job_id) = &outcome {
            info!(
                schedule_id = %schedule.id,
                thread_id,
                job_id,
                %scheduled_time,
                "submitted scheduled agent turn"
            );
        }
        Ok(outcome.was_submitted())
    }

    /// Manual fan-out for one schedule, equivalent to a single-schedule tick
    /// with a second-precision dedup key. Never touches the schedule clock.
    pub async fn trigger_schedule(&self, schedule_id: &str) -> SreResult<SubmitOutcome> {
        let schedule = self
            .store
            .get(schedule_id)
            .await?
            .ok_or_else(|| SreError::not_found("schedule", schedule_id))?;
        let now = Utc::now();
        let dedup_key = format!("manual_schedule_{}_{}", schedule.id, second_slot(now));
        if !self.queue.claim_dedup(&dedup_key).await? {
            return Ok(SubmitOutcome::Duplicate);
        }

        let mut context = Map::new();
        context.insert("schedule_id".into(), Value::String(schedule.id.clone()));
        context.insert("schedule_name".into(), Value::String(schedule.name.clone()));
        context.insert("automated".into(), Value::Bool(true));
        context.insert("manual_trigger".into(), Value::Bool(true));
        context.insert(
            "original_query".into(),
            Value::String(schedule.instructions.clone()),
        );
        context.insert("scheduled_at".into(), Value::String(now.to_rfc3339()));
        if let Some(instance_id) = &schedule.redis_instance_id {
            context.insert("instance_id".into(), Value::String(instance_id.clone()));
        }
        context.insert("messages".into(), Value::Array(Vec::new()));

        let thread_id = self
            .threads
            .create_thread(CreateThread {
                user_id: Some("scheduler".into()),
                session_id: Some(format!("manual_schedule_{}_{}", schedule.id, second_slot(now))),
                initial_context: Some(context.clone()),
                tags: vec![
                    "automated".into(),
                    "scheduled".into(),
                    "manual_trigger".into(),
                ],
            })
            .await?;
        self.threads
            .set_thread_subject(&thread_id, &derive_subject(&schedule.name))
            .await?;

        let args = json!({
            "thread_id": thread_id,
            "message": schedule.instructions,
            "context": context,
        });
        let options = SubmitOptions::serialized_on(&thread_id).with_retry(RetryPolicy::new(3, 5));
        let outcome = self.queue.submit(PROCESS_AGENT_TURN, args, options).await?;
        info!(schedule_id, job_id = outcome.job_id(), "manually triggered schedule");
        Ok(outcome)
    }

    /// One-shot enqueue of the scheduler tick with a per-second dedup key.
    pub async fn trigger_scheduler(&self) -> SreResult<SubmitOutcome> {
        let options = SubmitOptions {
            dedup_key: Some(format!("scheduler_task_manual_{}", second_slot(Utc::now()))),
            concurrency_key: Some(SCHEDULER_SENTINEL.to_string()),
            max_concurrent: 1,
            retry: Some(RetryPolicy::new(3, 5)),
            ..SubmitOptions::default()
        };
        self.queue.submit(SCHEDULER_TICK, json!({}), options).await
    }
}

/// Worker registration for the perpetual scheduler tick.
pub fn scheduler_registration(service: Arc<SchedulerService>) -> Registration {
    Registration::new(SCHEDULER_TICK, move |_ctx, _args| {
        let service = service.clone();
        async move {
            let summary = service.run_tick(Utc::now()).await?;
            Ok(serde_json::to_value(summary)?)
        }
    })
    .with_retry(RetryPolicy::new(3, 5))
    .with_concurrency(SCHEDULER_SENTINEL, 1)
    .perpetual(SCHEDULER_EVERY, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(interval_type: IntervalType, interval_value: u64) -> Schedule {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 9, 30, 0).unwrap();
        Schedule {
            id: "s1".into(),
            name: "Memory check".into(),
            description: String::new(),
            interval_type,
            interval_value,
            instructions: "Check Redis memory".into(),
            redis_instance_id: None,
            enabled: true,
            created_at: now,
            updated_at: now,
            next_run_at: Some(now),
            last_run_at: None,
        }
    }

    #[test]
    fn interval_arithmetic_is_calendar_agnostic() {
        assert_eq!(schedule(IntervalType::Minutes, 30).interval().num_seconds(), 1800);
        assert_eq!(schedule(IntervalType::Hours, 1).interval().num_seconds(), 3600);
        assert_eq!(schedule(IntervalType::Days, 2).interval().num_seconds(), 172800);
        assert_eq!(schedule(IntervalType::Weeks, 1).interval().num_seconds(), 604800);
    }

    #[test]
    fn next_run_advances_from_the_scheduled_slot() {
        let s = schedule(IntervalType::Hours, 1);
        let scheduled_time = s.next_run_at.unwrap();
        let next = s.calculate_next_run(scheduled_time);
        assert_eq!(next - scheduled_time, Duration::hours(1));
        assert!(s.last_run_at.map_or(true, |last| next > last));
    }

    #[test]
    fn disabled_schedules_are_never_due() {
        let mut s = schedule(IntervalType::Minutes, 5);
        s.enabled = false;
        assert!(!s.is_due(Utc::now()));
    }

    #[test]
    fn past_next_run_makes_a_schedule_due() {
        let s = schedule(IntervalType::Minutes, 5);
        let now = s.next_run_at.unwrap() + Duration::seconds(30);
        assert!(s.is_due(now));
        assert!(!s.is_due(s.next_run_at.unwrap() - Duration::seconds(1)));
    }

    #[test]
    fn dedup_keys_use_minute_slots() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 9, 30, 45).unwrap();
        assert_eq!(minute_slot(at), "20250101_0930");
        assert_eq!(schedule_dedup_key("s1", at), "schedule_s1_20250101_0930");
        // Same minute, different second: same slot.
        let later = Utc.with_ymd_and_hms(2025, 1, 1, 9, 30, 59).unwrap();
        assert_eq!(schedule_dedup_key("s1", later), "schedule_s1_20250101_0930");
    }

    #[test]
    fn second_slots_distinguish_manual_triggers() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 9, 30, 45).unwrap();
        assert_eq!(second_slot(at), "20250101_093045");
    }

    #[test]
    fn interval_type_parsing_rejects_unknown_units() {
        assert_eq!(IntervalType::from_str("hours").unwrap(), IntervalType::Hours);
        assert!(IntervalType::from_str("fortnights").is_err());
    }

    #[test]
    fn hash_round_trip_preserves_schedule_fields() {
        let s = schedule(IntervalType::Hours, 2);
        let mut raw = std::collections::HashMap::new();
        raw.insert("name".to_string(), s.name.clone());
        raw.insert("interval_type".to_string(), "hours".to_string());
        raw.insert("interval_value".to_string(), "2".to_string());
        raw.insert("instructions".to_string(), s.instructions.clone());
        raw.insert("enabled".to_string(), "true".to_string());
        raw.insert("created_at".to_string(), s.created_at.to_rfc3339());
        raw.insert("updated_at".to_string(), s.updated_at.to_rfc3339());
        raw.insert(
            "next_run_at".to_string(),
            s.next_run_at.unwrap().timestamp().to_string(),
        );
        let parsed = schedule_from_hash("s1", &raw).unwrap();
        assert_eq!(parsed.interval_type, IntervalType::Hours);
        assert_eq!(parsed.interval_value, 2);
        assert!(parsed.enabled);
        assert_eq!(parsed.next_run_at, s.next_run_at);
        assert!(parsed.last_run_at.is_none());
    }
}
