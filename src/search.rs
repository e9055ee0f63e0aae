//! RediSearch secondary index management.
//!
//! Index maintenance is optimistic: writers update primary KV first, then
//! push a projected hash document here. Upsert failures are logged and
//! swallowed so they never fail a primary write; readers fall back to KV
//! scans when an index is missing or empty.

use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::Value;
use tracing::{debug, info, warn};

use crate::error::{SreError, SreResult};
use crate::keys::{
    INSTANCES_INDEX, KNOWLEDGE_INDEX, QA_INDEX, SCHEDULES_INDEX, TASKS_INDEX, THREADS_INDEX,
};

/// TTL applied to task/thread FT documents (primary KV has no TTL).
pub const SEARCH_DOC_TTL_SECS: usize = 86400;

/// The secondary indices owned by the index manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexName {
    Tasks,
    Threads,
    Schedules,
    Qa,
    Instances,
    Knowledge,
}

impl IndexName {
    pub const ALL: [IndexName; 6] = [
        IndexName::Tasks,
        IndexName::Threads,
        IndexName::Schedules,
        IndexName::Qa,
        IndexName::Instances,
        IndexName::Knowledge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexName::Tasks => TASKS_INDEX,
            IndexName::Threads => THREADS_INDEX,
            IndexName::Schedules => SCHEDULES_INDEX,
            IndexName::Qa => QA_INDEX,
            IndexName::Instances => INSTANCES_INDEX,
            IndexName::Knowledge => KNOWLEDGE_INDEX,
        }
    }

    pub fn prefix(&self) -> String {
        format!("{}:", self.as_str())
    }

    pub fn parse(name: &str) -> Option<IndexName> {
        IndexName::ALL.iter().copied().find(|i| i.as_str() == name)
    }

    /// SCHEMA clause arguments for FT.CREATE.
    fn schema_args(&self, vector_dim: usize) -> Vec<String> {
        let s = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let vector_field = |name: &str| {
            vec![
                name.to_string(),
                "VECTOR".to_string(),
                "FLAT".to_string(),
                "6".to_string(),
                "TYPE".to_string(),
                "FLOAT32".to_string(),
                "DIM".to_string(),
                vector_dim.to_string(),
                "DISTANCE_METRIC".to_string(),
                "COSINE".to_string(),
            ]
        };
        match self {
            IndexName::Tasks => s(&[
                "status", "TAG", "user_id", "TAG", "thread_id", "TAG", "subject", "TEXT",
                "created_at", "NUMERIC", "SORTABLE", "updated_at", "NUMERIC", "SORTABLE",
            ]),
            IndexName::Threads => s(&[
                "user_id", "TAG", "instance_id", "TAG", "subject", "TEXT", "tags", "TEXT",
                "created_at", "NUMERIC", "SORTABLE", "updated_at", "NUMERIC", "SORTABLE",
            ]),
            IndexName::Schedules => s(&[
                "id", "TAG", "enabled", "TAG", "next_run_at", "NUMERIC", "SORTABLE",
                "last_run_at", "NUMERIC", "SORTABLE",
            ]),
            IndexName::Qa => {
                let mut args = s(&[
                    "user_id", "TAG", "thread_id", "TAG", "task_id", "TAG", "question", "TEXT",
                    "answer", "TEXT", "created_at", "NUMERIC", "updated_at", "NUMERIC",
                ]);
                args.extend(vector_field("question_vector"));
                args.extend(vector_field("answer_vector"));
                args
            }
            IndexName::Instances => s(&[
                "id", "TAG", "environment", "TAG", "usage", "TAG", "instance_type", "TAG",
                "name", "TEXT",
            ]),
            IndexName::Knowledge => {
                let mut args = s(&[
                    "source", "TAG", "category", "TAG", "severity", "TAG", "title", "TEXT",
                    "content", "TEXT", "created_at", "NUMERIC",
                ]);
                args.extend(vector_field("vector"));
                args
            }
        }
    }
}

/// Options for an FT.SEARCH issued through [`SearchIndexes::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub return_fields: Vec<&'static str>,
    /// `(field, ascending)`
    pub sort_by: Option<(&'static str, bool)>,
    pub limit: usize,
    pub offset: usize,
}

/// One matched document: its Redis key and the returned fields.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub key: String,
    pub fields: HashMap<String, String>,
}

impl SearchHit {
    /// Document id with the index prefix stripped.
    pub fn doc_id(&self, index: IndexName) -> String {
        self.key
            .strip_prefix(&index.prefix())
            .unwrap_or(&self.key)
            .to_string()
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Index manager for all FT secondary indices.
#[derive(Clone)]
pub struct SearchIndexes {
    conn: ConnectionManager,
    vector_dim: usize,
}

impl SearchIndexes {
    pub fn new(conn: ConnectionManager, vector_dim: usize) -> Self {
        Self { conn, vector_dim }
    }

    /// Create the index if absent. Idempotent; never drops existing data.
    pub async fn ensure_index(&self, index: IndexName) -> SreResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("FT.CREATE");
        cmd.arg(index.as_str())
            .arg("ON")
            .arg("HASH")
            .arg("PREFIX")
            .arg(1)
            .arg(index.prefix())
            .arg("SCHEMA");
        for arg in index.schema_args(self.vector_dim) {
            cmd.arg(arg);
        }
        match cmd.query_async::<_, ()>(&mut conn).await {
            Ok(()) => {
                info!(index = index.as_str(), "created search index");
                Ok(())
            }
            Err(e) if e.to_string().contains("Index already exists") => Ok(()),
            Err(e) => Err(SreError::Redis(e)),
        }
    }

    /// Drop (best-effort, keeping document hashes) and re-create the index.
    /// Callers re-backfill from KV if they need immediate coverage.
    pub async fn recreate_index(&self, index: IndexName) -> SreResult<()> {
        let mut conn = self.conn.clone();
        // No DD flag: the underlying hashes must survive.
        if let Err(e) = redis::cmd("FT.DROPINDEX")
            .arg(index.as_str())
            .query_async::<_, ()>(&mut conn)
            .await
        {
            debug!(index = index.as_str(), error = %e, "drop index skipped");
        }
        self.ensure_index(index).await
    }

    /// Ensure every index exists; returns `(name, ok)` per index so health
    /// checks can report degraded search instead of failing silently.
    pub async fn ensure_all(&self) -> Vec<(&'static str, bool)> {
        let mut statuses = Vec::with_capacity(IndexName::ALL.len());
        for index in IndexName::ALL {
            let ok = match self.ensure_index(index).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(index = index.as_str(), error = %e, "failed to ensure search index");
                    false
                }
            };
            statuses.push((index.as_str(), ok));
        }
        statuses
    }

    /// Names of indices currently present on the server.
    pub async fn list_indices(&self) -> SreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let names: Vec<String> = redis::cmd("FT._LIST").query_async(&mut conn).await?;
        Ok(names)
    }

    /// Best-effort projected-document upsert. Ensures the index exists,
    /// writes the hash, applies the TTL. Failure is logged, never propagated.
    pub async fn upsert_doc(
        &self,
        index: IndexName,
        doc_key: &str,
        fields: &[(&str, String)],
        ttl_secs: Option<usize>,
    ) -> bool {
        if let Err(e) = self.ensure_index(index).await {
            warn!(index = index.as_str(), error = %e, "ensure index failed during upsert");
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        let pairs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        pipe.hset_multiple(doc_key, &pairs).ignore();
        if let Some(ttl) = ttl_secs {
            pipe.expire(doc_key, ttl as i64).ignore();
        }
        match pipe.query_async::<_, ()>(&mut conn).await {
            Ok(()) => true,
            Err(e) => {
                warn!(doc_key, error = %e, "search doc upsert failed");
                false
            }
        }
    }

    /// Best-effort upsert of a binary (vector) field on an existing doc.
    pub async fn set_vector_field(&self, doc_key: &str, field: &str, vector: &[f32]) -> bool {
        let bytes: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();
        let mut conn = self.conn.clone();
        match redis::cmd("HSET")
            .arg(doc_key)
            .arg(field)
            .arg(bytes)
            .query_async::<_, ()>(&mut conn)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(doc_key, field, error = %e, "vector field upsert failed");
                false
            }
        }
    }

    pub async fn delete_doc(&self, doc_key: &str) -> SreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(doc_key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Run an FT.SEARCH and parse the reply into hits. Errors propagate so
    /// callers can fall back to KV scans.
    pub async fn search(
        &self,
        index: IndexName,
        query: &str,
        options: &SearchOptions,
    ) -> SreResult<Vec<SearchHit>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("FT.SEARCH");
        cmd.arg(index.as_str()).arg(query);
        if !options.return_fields.is_empty() {
            cmd.arg("RETURN").arg(options.return_fields.len());
            for f in &options.return_fields {
                cmd.arg(*f);
            }
        }
        if let Some((field, ascending)) = options.sort_by {
            cmd.arg("SORTBY")
                .arg(field)
                .arg(if ascending { "ASC" } else { "DESC" });
        }
        let limit = if options.limit == 0 { 10 } else { options.limit };
        cmd.arg("LIMIT").arg(options.offset).arg(limit);
        cmd.arg("DIALECT").arg(2);

        let reply: Value = cmd.query_async(&mut conn).await?;
        Ok(parse_search_reply(&reply))
    }
}

/// Parse an FT.SEARCH reply: `[total, key1, [f, v, ...], key2, ...]`.
fn parse_search_reply(reply: &Value) -> Vec<SearchHit> {
    let items = match reply {
        Value::Bulk(items) => items,
        _ => return Vec::new(),
    };
    let mut hits = Vec::new();
    let mut iter = items.iter();
    // First element is the total count.
    let _total = iter.next();
    while let Some(key_value) = iter.next() {
        let key = match value_to_string(key_value) {
            Some(k) => k,
            None => continue,
        };
        let mut fields = HashMap::new();
        if let Some(Value::Bulk(pairs)) = iter.next() {
            let mut pair_iter = pairs.iter();
            while let (Some(field), Some(value)) = (pair_iter.next(), pair_iter.next()) {
                if let (Some(f), Some(v)) = (value_to_string(field), value_to_string(value)) {
                    fields.insert(f, v);
                }
            }
        }
        hits.push(SearchHit { key, fields });
    }
    hits
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Status(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Escape characters RediSearch treats specially inside TAG filters.
pub fn escape_tag(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if !c.is_alphanumeric() && c != '_' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_search_reply_with_hits() {
        let reply = Value::Bulk(vec![
            Value::Int(2),
            Value::Data(b"sre_tasks:t1".to_vec()),
            Value::Bulk(vec![
                Value::Data(b"status".to_vec()),
                Value::Data(b"queued".to_vec()),
                Value::Data(b"subject".to_vec()),
                Value::Data(b"check memory".to_vec()),
            ]),
            Value::Data(b"sre_tasks:t2".to_vec()),
            Value::Bulk(vec![
                Value::Data(b"status".to_vec()),
                Value::Data(b"done".to_vec()),
            ]),
        ]);
        let hits = parse_search_reply(&reply);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].doc_id(IndexName::Tasks), "t1");
        assert_eq!(hits[0].field("status"), Some("queued"));
        assert_eq!(hits[1].field("status"), Some("done"));
    }

    #[test]
    fn empty_reply_yields_no_hits() {
        let hits = parse_search_reply(&Value::Bulk(vec![Value::Int(0)]));
        assert!(hits.is_empty());
    }

    #[test]
    fn tag_escaping_handles_dashes() {
        assert_eq!(escape_tag("user-1"), "user\\-1");
        assert_eq!(escape_tag("plain_id9"), "plain_id9");
    }

    #[test]
    fn every_index_has_a_schema() {
        for index in IndexName::ALL {
            assert!(!index.schema_args(8).is_empty());
        }
    }
}
