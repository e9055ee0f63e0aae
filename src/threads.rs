//! Thread store: durable CRUD and append operations for conversation threads.
//!
//! A thread owns its metadata, a free-form context bag (including the
//! persisted transcript), an append-only updates log, and terminal
//! result/error artifacts. Every write keeps the `sre:threads` sorted set and
//! the threads FT index in step, and fans live updates out to an optional
//! stream channel.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SreResult;
use crate::keys::RedisKeys;
use crate::search::{escape_tag, IndexName, SearchIndexes, SearchOptions, SEARCH_DOC_TTL_SECS};

/// Updates lists are trimmed to this many most-recent entries.
pub const MAX_UPDATES: usize = 1000;

/// Maximum subject length in characters, ellipsis included.
pub const MAX_SUBJECT_CHARS: usize = 80;

pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn iso_to_epoch(value: &str) -> f64 {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp() as f64)
        .unwrap_or_else(|_| value.parse::<f64>().unwrap_or(0.0))
}

/// One append-only progress entry on a thread or task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadUpdate {
    pub timestamp: String,
    pub message: String,
    #[serde(default = "default_update_type")]
    pub update_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

fn default_update_type() -> String {
    "progress".to_string()
}

impl ThreadUpdate {
    pub fn new(message: impl Into<String>, update_type: impl Into<String>) -> Self {
        Self {
            timestamp: now_iso(),
            message: message.into(),
            update_type: update_type.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ThreadMetadata {
    pub created_at: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: i64,
}

/// Fully assembled thread state.
#[derive(Debug, Clone)]
pub struct ThreadState {
    pub thread_id: String,
    pub metadata: ThreadMetadata,
    pub context: Map<String, Value>,
    pub updates: Vec<ThreadUpdate>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
}

/// Listing row for threads.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub subject: String,
    pub user_id: Option<String>,
    pub tags: Vec<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// Event published for live clients on every thread update.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadEvent {
    pub thread_id: String,
    pub message: String,
    pub update_type: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Optional live-streaming port. When absent, streaming is silently disabled.
#[async_trait]
pub trait StreamChannel: Send + Sync {
    async fn publish(&self, thread_id: &str, event: &ThreadEvent);
}

#[derive(Debug, Clone, Default)]
pub struct CreateThread {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub initial_context: Option<Map<String, Value>>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListThreads {
    pub user_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

/// Seed a subject from free text: first line, capped at
/// [`MAX_SUBJECT_CHARS`] with a trailing ellipsis when truncated.
pub fn derive_subject(seed: &str) -> String {
    let first_line = seed.lines().next().unwrap_or("").trim();
    let chars: Vec<char> = first_line.chars().collect();
    if chars.len() <= MAX_SUBJECT_CHARS {
        first_line.to_string()
    } else {
        let mut subject: String = chars[..MAX_SUBJECT_CHARS - 1].iter().collect();
        subject.push('…');
        subject
    }
}

#[derive(Clone)]
pub struct ThreadManager {
    conn: ConnectionManager,
    search: SearchIndexes,
    stream: Option<Arc<dyn StreamChannel>>,
}

impl ThreadManager {
    pub fn new(conn: ConnectionManager, search: SearchIndexes) -> Self {
        Self {
            conn,
            search,
            stream: None,
        }
    }

    pub fn with_stream(mut self, stream: Arc<dyn StreamChannel>) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Create a thread and return its id. Ids are time-ordered (UUIDv7).
    pub async fn create_thread(&self, request: CreateThread) -> SreResult<String> {
        let thread_id = Uuid::now_v7().to_string();
        let now = now_iso();
        let mut conn = self.conn.clone();

        let fields: Vec<(&str, String)> = vec![
            ("created_at", now.clone()),
            (
                "user_id",
                request.user_id.clone().unwrap_or_else(|| "system".into()),
            ),
            ("session_id", request.session_id.clone().unwrap_or_default()),
            ("subject", String::new()),
            ("tags", serde_json::to_string(&request.tags)?),
            ("priority", "0".to_string()),
        ];
        let pairs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let _: () = conn
            .hset_multiple(RedisKeys::thread_metadata(&thread_id), &pairs)
            .await?;

        if let Some(context) = &request.initial_context {
            self.write_context_fields(&thread_id, context).await?;
        }

        let _: () = conn
            .zadd(
                RedisKeys::threads_index(),
                &thread_id,
                Utc::now().timestamp(),
            )
            .await?;

        self.upsert_thread_doc(&thread_id).await;
        debug!(thread_id, "created thread");
        Ok(thread_id)
    }

    /// Read all parts of a thread and assemble the typed state.
    pub async fn get_thread(&self, thread_id: &str) -> SreResult<Option<ThreadState>> {
        let mut conn = self.conn.clone();
        let metadata_raw: std::collections::HashMap<String, String> =
            conn.hgetall(RedisKeys::thread_metadata(thread_id)).await?;
        if metadata_raw.is_empty() {
            return Ok(None);
        }

        let metadata = ThreadMetadata {
            created_at: metadata_raw
                .get("created_at")
                .cloned()
                .unwrap_or_else(now_iso),
            updated_at: metadata_raw.get("updated_at").cloned(),
            user_id: non_empty(metadata_raw.get("user_id")),
            session_id: non_empty(metadata_raw.get("session_id")),
            subject: non_empty(metadata_raw.get("subject")),
            tags: metadata_raw
                .get("tags")
                .and_then(|t| serde_json::from_str(t).ok())
                .unwrap_or_default(),
            priority: metadata_raw
                .get("priority")
                .and_then(|p| p.parse().ok())
                .unwrap_or(0),
        };

        let context_raw: std::collections::HashMap<String, String> =
            conn.hgetall(RedisKeys::thread_context(thread_id)).await?;
        let mut context = Map::new();
        for (key, raw) in context_raw {
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            context.insert(key, value);
        }

        let updates_raw: Vec<String> = conn
            .lrange(RedisKeys::thread_updates(thread_id), 0, -1)
            .await?;
        let updates = updates_raw
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect();

        let result_raw: Option<String> = conn.get(RedisKeys::thread_result(thread_id)).await?;
        let result = result_raw.and_then(|raw| serde_json::from_str(&raw).ok());
        let error_message: Option<String> = conn.get(RedisKeys::thread_error(thread_id)).await?;

        Ok(Some(ThreadState {
            thread_id: thread_id.to_string(),
            metadata,
            context,
            updates,
            result,
            error_message,
        }))
    }

    /// Append a progress update. Bumps `updated_at`, trims the log, refreshes
    /// the FT doc, and publishes to the stream channel when one is wired.
    pub async fn add_thread_update(
        &self,
        thread_id: &str,
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
        let updates_key = RedisKeys::thread_updates(thread_id);
        let _: () = conn
            .rpush(&updates_key, serde_json::to_string(&update)?)
            .await?;
        let _: () = conn
            .ltrim(&updates_key, -(MAX_UPDATES as isize), -1)
            .await?;
        self.touch(thread_id).await?;
        self.upsert_thread_doc(thread_id).await;

        if let Some(stream) = &self.stream {
            let event = ThreadEvent {
                thread_id: thread_id.to_string(),
                message: update.message.clone(),
                update_type: update.update_type.clone(),
                timestamp: update.timestamp.clone(),
                metadata: update.metadata.clone(),
            };
            stream.publish(thread_id, &event).await;
        }
        Ok(())
    }

    /// Merge (or replace) keys in the thread's context hash.
    pub async fn update_thread_context(
        &self,
        thread_id: &str,
        patch: &Map<String, Value>,
        merge: bool,
    ) -> SreResult<()> {
        let mut conn = self.conn.clone();
        if !merge {
            let _: () = conn.del(RedisKeys::thread_context(thread_id)).await?;
        }
        self.write_context_fields(thread_id, patch).await?;
        self.touch(thread_id).await?;
        Ok(())
    }

    pub async fn set_thread_result(&self, thread_id: &str, value: &Value) -> SreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(
                RedisKeys::thread_result(thread_id),
                serde_json::to_string(value)?,
            )
            .await?;
        self.touch(thread_id).await?;
        Ok(())
    }

    pub async fn set_thread_error(&self, thread_id: &str, message: &str) -> SreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(RedisKeys::thread_error(thread_id), message).await?;
        self.touch(thread_id).await?;
        Ok(())
    }

    pub async fn set_thread_subject(&self, thread_id: &str, subject: &str) -> SreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(RedisKeys::thread_metadata(thread_id), "subject", subject)
            .await?;
        self.upsert_thread_doc(thread_id).await;
        Ok(())
    }

    /// Seed the subject from the first line of `seed` (≤ 80 chars).
    pub async fn update_thread_subject(&self, thread_id: &str, seed: &str) -> SreResult<()> {
        let subject = derive_subject(seed);
        self.set_thread_subject(thread_id, &subject).await
    }

    /// Index-first listing, newest first; falls back to the `sre:threads`
    /// sorted set when the FT index is unavailable.
    pub async fn list_threads(&self, request: &ListThreads) -> SreResult<Vec<ThreadSummary>> {
        let limit = if request.limit == 0 { 50 } else { request.limit };
        let query = match &request.user_id {
            Some(user_id) => format!("@user_id:{{{}}}", escape_tag(user_id)),
            None => "*".to_string(),
        };
        let options = SearchOptions {
            return_fields: vec!["subject", "user_id", "tags", "created_at", "updated_at"],
            sort_by: Some(("updated_at", false)),
            limit,
            offset: request.offset,
        };
        match self.search.search(IndexName::Threads, &query, &options).await {
            Ok(hits) => Ok(hits
                .into_iter()
                .map(|hit| ThreadSummary {
                    thread_id: hit.doc_id(IndexName::Threads),
                    subject: hit.field("subject").unwrap_or("Untitled").to_string(),
                    user_id: hit.field("user_id").map(str::to_string),
                    tags: hit
                        .field("tags")
                        .map(|t| t.split(',').map(str::to_string).collect())
                        .unwrap_or_default(),
                    created_at: hit.field("created_at").map(str::to_string),
                    updated_at: hit.field("updated_at").map(str::to_string),
                })
                .collect()),
            Err(e) => {
                warn!(error = %e, "thread index query failed, scanning KV");
                self.scan_threads(request.offset, limit).await
            }
        }
    }

    async fn scan_threads(&self, offset: usize, limit: usize) -> SreResult<Vec<ThreadSummary>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrevrange(
                RedisKeys::threads_index(),
                offset as isize,
                (offset + limit - 1) as isize,
            )
            .await?;
        let mut summaries = Vec::with_capacity(ids.len());
        for thread_id in ids {
            if let Some(state) = self.get_thread(&thread_id).await? {
                summaries.push(ThreadSummary {
                    thread_id,
                    subject: state.metadata.subject.unwrap_or_else(|| "Untitled".into()),
                    user_id: state.metadata.user_id,
                    tags: state.metadata.tags,
                    created_at: Some(state.metadata.created_at),
                    updated_at: state.metadata.updated_at,
                });
            }
        }
        Ok(summaries)
    }

    /// All thread ids, oldest update first. Used by purge and reindex tools.
    pub async fn all_thread_ids(&self) -> SreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrange(RedisKeys::threads_index(), 0, -1).await?;
        Ok(ids)
    }

    /// Task ids owned by a thread, most recent first.
    pub async fn thread_task_ids(&self, thread_id: &str) -> SreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrevrange(RedisKeys::thread_tasks_index(thread_id), 0, -1)
            .await?;
        Ok(ids)
    }

    /// Delete all thread keys and index entries; optionally cascade into the
    /// thread's tasks (primary KV plus FT docs).
    pub async fn delete_thread(&self, thread_id: &str, cascade_tasks: bool) -> SreResult<usize> {
        let mut conn = self.conn.clone();
        let mut tasks_deleted = 0;

        if cascade_tasks {
            let task_ids = self.thread_task_ids(thread_id).await?;
            for task_id in task_ids {
                let task_keys = vec![
                    RedisKeys::task_status(&task_id),
                    RedisKeys::task_metadata(&task_id),
                    RedisKeys::task_updates(&task_id),
                    RedisKeys::task_result(&task_id),
                    RedisKeys::task_error(&task_id),
                ];
                let _: () = conn.del(task_keys).await?;
                let _ = self.search.delete_doc(&RedisKeys::task_doc(&task_id)).await;
                tasks_deleted += 1;
            }
        }

        let thread_keys = vec![
            RedisKeys::thread_metadata(thread_id),
            RedisKeys::thread_context(thread_id),
            RedisKeys::thread_updates(thread_id),
            RedisKeys::thread_result(thread_id),
            RedisKeys::thread_error(thread_id),
            RedisKeys::thread_tasks_index(thread_id),
        ];
        let _: () = conn.del(thread_keys).await?;
        let _: () = conn.zrem(RedisKeys::threads_index(), thread_id).await?;
        let _ = self
            .search
            .delete_doc(&RedisKeys::thread_doc(thread_id))
            .await;
        debug!(thread_id, tasks_deleted, "deleted thread");
        Ok(tasks_deleted)
    }

    /// Re-project the FT document from primary KV. Used after writes and by
    /// the reindex/backfill CLI.
    pub async fn upsert_thread_doc(&self, thread_id: &str) -> bool {
        let mut conn = self.conn.clone();
        let metadata: std::collections::HashMap<String, String> = match conn
            .hgetall(RedisKeys::thread_metadata(thread_id))
            .await
        {
            Ok(m) => m,
            Err(e) => {
                warn!(thread_id, error = %e, "thread doc projection read failed");
                return false;
            }
        };
        if metadata.is_empty() {
            return false;
        }
        let instance_raw: Option<String> = conn
            .hget(RedisKeys::thread_context(thread_id), "instance_id")
            .await
            .unwrap_or(None);
        let instance_id =
            instance_raw.map(|raw| serde_json::from_str::<String>(&raw).unwrap_or(raw));

        let created = metadata.get("created_at").map(|v| iso_to_epoch(v)).unwrap_or(0.0);
        let updated = metadata
            .get("updated_at")
            .map(|v| iso_to_epoch(v))
            .filter(|ts| *ts > 0.0)
            .unwrap_or_else(|| Utc::now().timestamp() as f64);
        let tags: Vec<String> = metadata
            .get("tags")
            .and_then(|t| serde_json::from_str(t).ok())
            .unwrap_or_default();

        let fields = vec![
            ("user_id", metadata.get("user_id").cloned().unwrap_or_default()),
            ("instance_id", instance_id.unwrap_or_default()),
            ("subject", metadata.get("subject").cloned().unwrap_or_default()),
            ("tags", tags.join(",")),
            ("created_at", created.to_string()),
            ("updated_at", updated.to_string()),
        ];
        self.search
            .upsert_doc(
                IndexName::Threads,
                &RedisKeys::thread_doc(thread_id),
                &fields,
                Some(SEARCH_DOC_TTL_SECS),
            )
            .await
    }

    async fn write_context_fields(
        &self,
        thread_id: &str,
        fields: &Map<String, Value>,
    ) -> SreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pairs = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            pairs.push((key.clone(), serde_json::to_string(value)?));
        }
        let borrowed: Vec<(&str, &str)> = pairs
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let _: () = conn
            .hset_multiple(RedisKeys::thread_context(thread_id), &borrowed)
            .await?;
        Ok(())
    }

    /// Bump `updated_at` and the global ordering score.
    async fn touch(&self, thread_id: &str) -> SreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(
                RedisKeys::thread_metadata(thread_id),
                "updated_at",
                now_iso(),
            )
            .await?;
        let _: () = conn
            .zadd(RedisKeys::threads_index(), thread_id, Utc::now().timestamp())
            .await?;
        Ok(())
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_takes_first_line() {
        let seed = "Check Redis memory usage\nand report back";
        assert_eq!(derive_subject(seed), "Check Redis memory usage");
    }

    #[test]
    fn subject_is_capped_at_eighty_chars() {
        let seed = "x".repeat(200);
        let subject = derive_subject(&seed);
        assert_eq!(subject.chars().count(), MAX_SUBJECT_CHARS);
        assert!(subject.ends_with('…'));
    }

    #[test]
    fn short_subject_is_untouched() {
        assert_eq!(derive_subject("hello"), "hello");
        assert_eq!(derive_subject("  padded  \nrest"), "padded");
    }

    #[test]
    fn updates_deserialize_with_defaults() {
        let update: ThreadUpdate =
            serde_json::from_str(r#"{"timestamp":"t","message":"m"}"#).unwrap();
        assert_eq!(update.update_type, "progress");
        assert!(update.metadata.is_none());
    }

    #[test]
    fn iso_epoch_conversion_tolerates_raw_floats() {
        assert_eq!(iso_to_epoch("1700000000"), 1700000000.0);
        assert!(iso_to_epoch("2023-11-14T22:13:20+00:00") > 0.0);
        assert_eq!(iso_to_epoch("garbage"), 0.0);
    }
}
