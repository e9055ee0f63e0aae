//! Task store: per-turn task records, their status state machine, and
//! linkage to the owning thread.
//!
//! A task belongs to exactly one thread for its whole life. Status moves
//! forward only: `queued -> in_progress -> {done|failed|cancelled}` (queued
//! tasks may also be cancelled directly). Re-asserting the current status is
//! a no-op so retried deliveries stay idempotent.

use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{SreError, SreResult};
use crate::keys::RedisKeys;
use crate::search::{escape_tag, IndexName, SearchIndexes, SearchOptions, SEARCH_DOC_TTL_SECS};
use crate::threads::{iso_to_epoch, now_iso, ThreadUpdate, MAX_UPDATES};

/// Task execution status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue
    Queued,
    /// Claimed by a worker and executing
    InProgress,
    /// Completed successfully
    Done,
    /// Terminated with an error
    Failed,
    /// Cancelled before completion
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> SreResult<TaskStatus> {
        match value {
            "queued" => Ok(TaskStatus::Queued),
            "in_progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(SreError::validation(format!("unknown task status: {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Allowed transition matrix. Same-state transitions are idempotent
    /// no-ops; everything else moving backwards or across terminals is
    /// rejected.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            TaskStatus::Queued => matches!(
                next,
                TaskStatus::InProgress | TaskStatus::Cancelled
            ),
            TaskStatus::InProgress => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskMetadata {
    pub created_at: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
}

/// Fully assembled task state.
#[derive(Debug, Clone)]
pub struct TaskState {
    pub task_id: String,
    pub thread_id: String,
    pub status: TaskStatus,
    pub updates: Vec<ThreadUpdate>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub metadata: TaskMetadata,
}

/// Listing row for tasks.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub thread_id: Option<String>,
    pub status: TaskStatus,
    pub subject: String,
    pub user_id: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListTasks {
    pub user_id: Option<String>,
    pub status: Option<TaskStatus>,
    /// Include terminal tasks; without this only `{queued, in_progress}`
    /// are listed unless an explicit status filter is set.
    pub show_all: bool,
    pub limit: usize,
}

#[derive(Clone)]
pub struct TaskManager {
    conn: ConnectionManager,
    search: SearchIndexes,
}

impl TaskManager {
    pub fn new(conn: ConnectionManager, search: SearchIndexes) -> Self {
        Self { conn, search }
    }

    /// Create a task record in `queued`, link it under its thread, and
    /// project the FT doc. Returns the new task id (time-ordered).
    pub async fn create_task(
        &self,
        thread_id: &str,
        user_id: Option<&str>,
        subject: Option<&str>,
    ) -> SreResult<String> {
        let task_id = Uuid::now_v7().to_string();
        let now = now_iso();
        let mut conn = self.conn.clone();

        let _: () = conn
            .set(RedisKeys::task_status(&task_id), TaskStatus::Queued.as_str())
            .await?;
        let fields = vec![
            ("created_at", now),
            ("user_id", user_id.unwrap_or("system").to_string()),
            ("thread_id", thread_id.to_string()),
            ("subject", subject.unwrap_or_default().to_string()),
        ];
        let pairs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let _: () = conn
            .hset_multiple(RedisKeys::task_metadata(&task_id), &pairs)
            .await?;
        let _: () = conn
            .zadd(
                RedisKeys::thread_tasks_index(thread_id),
                &task_id,
                chrono::Utc::now().timestamp(),
            )
            .await?;

        self.upsert_task_doc(&task_id).await;
        debug!(task_id, thread_id, "created task");
        Ok(task_id)
    }

    /// Transition the task status, enforcing the matrix. Rejected transitions
    /// return [`SreError::InvalidTransition`] and leave state unchanged.
    pub async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> SreResult<()> {
        let mut conn = self.conn.clone();
        let current_raw: Option<String> = conn.get(RedisKeys::task_status(task_id)).await?;
        let current = match current_raw {
            Some(raw) => TaskStatus::parse(&raw)?,
            None => return Err(SreError::not_found("task", task_id)),
        };
        if !current.can_transition_to(status) {
            return Err(SreError::InvalidTransition {
                from: current.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        let _: () = conn
            .set(RedisKeys::task_status(task_id), status.as_str())
            .await?;
        self.touch(task_id).await?;
        self.upsert_task_doc(task_id).await;
        Ok(())
    }

    /// Append a progress update to the task's own log.
    pub async fn add_task_update(
        &self,
        task_id: &str,
        message: &str,
        update_type: &str,
        metadata: Option<Value>,
    ) -> SreResult<()> {
        let update = ThreadUpdate {
            timestamp: now_iso(),
            message: message.to_string(),
            update_type: update_type.to_string(),
            metadata,
        };
        let mut conn = self.conn.clone();
        let updates_key = RedisKeys::task_updates(task_id);
        let _: () = conn
            .rpush(&updates_key, serde_json::to_string(&update)?)
            .await?;
        let _: () = conn
            .ltrim(&updates_key, -(MAX_UPDATES as isize), -1)
            .await?;
        self.touch(task_id).await?;
        self.upsert_task_doc(task_id).await;
        Ok(())
    }

    pub async fn set_task_result(&self, task_id: &str, result: &Value) -> SreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(
                RedisKeys::task_result(task_id),
                serde_json::to_string(result)?,
            )
            .await?;
        self.touch(task_id).await?;
        self.upsert_task_doc(task_id).await;
        Ok(())
    }

    /// Record the error message and transition to `failed`.
    pub async fn set_task_error(&self, task_id: &str, message: &str) -> SreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(RedisKeys::task_error(task_id), message).await?;
        self.touch(task_id).await?;
        self.update_task_status(task_id, TaskStatus::Failed).await?;
        Ok(())
    }

    /// Reassemble status, updates, result, error, and metadata.
    pub async fn get_task_state(&self, task_id: &str) -> SreResult<Option<TaskState>> {
        let mut conn = self.conn.clone();
        let status_raw: Option<String> = conn.get(RedisKeys::task_status(task_id)).await?;
        let status = match status_raw {
            Some(raw) => TaskStatus::parse(&raw)?,
            None => return Ok(None),
        };

        let updates_raw: Vec<String> =
            conn.lrange(RedisKeys::task_updates(task_id), 0, -1).await?;
        let updates = updates_raw
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect();

        let result_raw: Option<String> = conn.get(RedisKeys::task_result(task_id)).await?;
        let result = result_raw.and_then(|raw| serde_json::from_str(&raw).ok());
        let error_message: Option<String> = conn.get(RedisKeys::task_error(task_id)).await?;

        let metadata_raw: HashMap<String, String> =
            conn.hgetall(RedisKeys::task_metadata(task_id)).await?;
        let thread_id = metadata_raw.get("thread_id").cloned().unwrap_or_default();
        let metadata = TaskMetadata {
            created_at: metadata_raw
                .get("created_at")
                .cloned()
                .unwrap_or_else(now_iso),
            updated_at: metadata_raw.get("updated_at").cloned(),
            user_id: metadata_raw.get("user_id").filter(|v| !v.is_empty()).cloned(),
            subject: metadata_raw.get("subject").filter(|v| !v.is_empty()).cloned(),
        };

        Ok(Some(TaskState {
            task_id: task_id.to_string(),
            thread_id,
            status,
            updates,
            result,
            error_message,
            metadata,
        }))
    }

    /// Index-first listing sorted by `updated_at DESC`. Default filter is
    /// `{queued, in_progress}` unless `show_all` or an explicit status filter
    /// is given. Falls back to resolving through thread sorted sets when the
    /// index is unavailable.
    pub async fn list_tasks(&self, request: &ListTasks) -> SreResult<Vec<TaskSummary>> {
        let limit = if request.limit == 0 { 50 } else { request.limit };
        let query = build_task_filter(request);
        let options = SearchOptions {
            return_fields: vec![
                "status",
                "subject",
                "user_id",
                "thread_id",
                "created_at",
                "updated_at",
            ],
            sort_by: Some(("updated_at", false)),
            limit,
            offset: 0,
        };
        match self.search.search(IndexName::Tasks, &query, &options).await {
            Ok(hits) => Ok(hits
                .into_iter()
                .filter_map(|hit| {
                    let status = TaskStatus::parse(hit.field("status")?).ok()?;
                    Some(TaskSummary {
                        task_id: hit.doc_id(IndexName::Tasks),
                        thread_id: hit.field("thread_id").map(str::to_string),
                        status,
                        subject: hit.field("subject").unwrap_or("Untitled").to_string(),
                        user_id: hit.field("user_id").map(str::to_string),
                        created_at: hit.field("created_at").map(str::to_string),
                        updated_at: hit.field("updated_at").map(str::to_string),
                    })
                })
                .collect()),
            Err(e) => {
                warn!(error = %e, "task index query failed, resolving via thread sets");
                self.scan_tasks(request, limit).await
            }
        }
    }

    async fn scan_tasks(&self, request: &ListTasks, limit: usize) -> SreResult<Vec<TaskSummary>> {
        let mut conn = self.conn.clone();
        let thread_ids: Vec<String> = conn
            .zrevrange(RedisKeys::threads_index(), 0, (limit * 10) as isize)
            .await?;
        let mut summaries = Vec::new();
        'outer: for thread_id in thread_ids {
            let task_ids: Vec<String> = conn
                .zrevrange(RedisKeys::thread_tasks_index(&thread_id), 0, -1)
                .await?;
            for task_id in task_ids {
                if let Some(state) = self.get_task_state(&task_id).await? {
                    if !matches_filter(request, state.status, state.metadata.user_id.as_deref()) {
                        continue;
                    }
                    summaries.push(TaskSummary {
                        task_id: state.task_id,
                        thread_id: Some(state.thread_id),
                        status: state.status,
                        subject: state
                            .metadata
                            .subject
                            .unwrap_or_else(|| "Untitled".into()),
                        user_id: state.metadata.user_id,
                        created_at: Some(state.metadata.created_at),
                        updated_at: state.metadata.updated_at,
                    });
                    if summaries.len() >= limit {
                        break 'outer;
                    }
                }
            }
        }
        Ok(summaries)
    }

    /// Remove all task keys, the thread linkage, and the FT doc.
    pub async fn delete_task(&self, task_id: &str) -> SreResult<()> {
        let mut conn = self.conn.clone();
        let thread_id: Option<String> = conn
            .hget(RedisKeys::task_metadata(task_id), "thread_id")
            .await?;

        let task_keys = vec![
            RedisKeys::task_status(task_id),
            RedisKeys::task_metadata(task_id),
            RedisKeys::task_updates(task_id),
            RedisKeys::task_result(task_id),
            RedisKeys::task_error(task_id),
        ];
        let _: () = conn.del(task_keys).await?;

        if let Some(thread_id) = thread_id {
            if !thread_id.is_empty() {
                let _: () = conn
                    .zrem(RedisKeys::thread_tasks_index(&thread_id), task_id)
                    .await?;
            }
        }
        self.search.delete_doc(&RedisKeys::task_doc(task_id)).await?;
        debug!(task_id, "deleted task");
        Ok(())
    }

    /// Re-project the FT document from primary KV; best-effort.
    pub async fn upsert_task_doc(&self, task_id: &str) -> bool {
        let mut conn = self.conn.clone();
        let status: Option<String> = match conn.get(RedisKeys::task_status(task_id)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(task_id, error = %e, "task doc projection read failed");
                return false;
            }
        };
        let metadata: HashMap<String, String> = conn
            .hgetall(RedisKeys::task_metadata(task_id))
            .await
            .unwrap_or_default();

        let created = metadata.get("created_at").map(|v| iso_to_epoch(v)).unwrap_or(0.0);
        let updated = metadata
            .get("updated_at")
            .map(|v| iso_to_epoch(v))
            .filter(|ts| *ts > 0.0)
            .unwrap_or_else(|| chrono::Utc::now().timestamp() as f64);

        let fields = vec![
            ("status", status.unwrap_or_default()),
            ("subject", metadata.get("subject").cloned().unwrap_or_default()),
            ("user_id", metadata.get("user_id").cloned().unwrap_or_default()),
            (
                "thread_id",
                metadata.get("thread_id").cloned().unwrap_or_default(),
            ),
            ("created_at", created.to_string()),
            ("updated_at", updated.to_string()),
        ];
        self.search
            .upsert_doc(
                IndexName::Tasks,
                &RedisKeys::task_doc(task_id),
                &fields,
                Some(SEARCH_DOC_TTL_SECS),
            )
            .await
    }

    async fn touch(&self, task_id: &str) -> SreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(RedisKeys::task_metadata(task_id), "updated_at", now_iso())
            .await?;
        Ok(())
    }
}

/// FT filter expression for a listing request.
fn build_task_filter(request: &ListTasks) -> String {
    let mut clauses = Vec::new();
    if request.show_all {
        // No status clause.
    } else if let Some(status) = request.status {
        clauses.push(format!("@status:{{{}}}", status.as_str()));
    } else {
        clauses.push("@status:{queued|in_progress}".to_string());
    }
    if let Some(user_id) = &request.user_id {
        clauses.push(format!("@user_id:{{{}}}", escape_tag(user_id)));
    }
    if clauses.is_empty() {
        "*".to_string()
    } else {
        clauses.join(" ")
    }
}

fn matches_filter(request: &ListTasks, status: TaskStatus, user_id: Option<&str>) -> bool {
    if let Some(filter_user) = &request.user_id {
        if user_id != Some(filter_user.as_str()) {
            return false;
        }
    }
    if request.show_all {
        return true;
    }
    match request.status {
        Some(wanted) => status == wanted,
        None => matches!(status, TaskStatus::Queued | TaskStatus::InProgress),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_are_allowed() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Done));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn backward_and_cross_terminal_transitions_are_rejected() {
        assert!(!TaskStatus::InProgress.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Done.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Done.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Done));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Done));
    }

    #[test]
    fn same_state_transition_is_an_idempotent_noop() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::InProgress,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert!(status.can_transition_to(status));
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::InProgress,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(TaskStatus::parse("bogus").is_err());
    }

    #[test]
    fn default_listing_filters_to_active_statuses() {
        let request = ListTasks::default();
        assert_eq!(build_task_filter(&request), "@status:{queued|in_progress}");
        assert!(matches_filter(&request, TaskStatus::Queued, None));
        assert!(matches_filter(&request, TaskStatus::InProgress, None));
        assert!(!matches_filter(&request, TaskStatus::Done, None));
    }

    #[test]
    fn explicit_status_and_user_filters_compose() {
        let request = ListTasks {
            user_id: Some("u-1".into()),
            status: Some(TaskStatus::Failed),
            ..ListTasks::default()
        };
        assert_eq!(
            build_task_filter(&request),
            "@status:{failed} @user_id:{u\\-1}"
        );
        assert!(matches_filter(&request, TaskStatus::Failed, Some("u-1")));
        assert!(!matches_filter(&request, TaskStatus::Failed, Some("u-2")));
    }

    #[test]
    fn show_all_lists_terminal_tasks() {
        let request = ListTasks {
            show_all: true,
            ..ListTasks::default()
        };
        assert_eq!(build_task_filter(&request), "*");
        assert!(matches_filter(&request, TaskStatus::Done, None));
    }
}
