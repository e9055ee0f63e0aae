//! QA records: one artifact per completed turn, searchable by text and
//! (when an embedder is wired) by vector similarity.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SreResult;
use crate::keys::RedisKeys;
use crate::llm::Embedder;
use crate::search::{IndexName, SearchIndexes};
use crate::threads::now_iso;
use std::sync::Arc;

/// Artifact of one completed agent turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaRecord {
    pub id: String,
    pub thread_id: String,
    pub task_id: String,
    pub user_id: Option<String>,
    pub question: String,
    pub answer: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Store writing QA hashes into the `sre_qa` FT prefix.
#[derive(Clone)]
pub struct QaStore {
    conn: ConnectionManager,
    search: SearchIndexes,
    embedder: Option<Arc<dyn Embedder>>,
}

impl QaStore {
    pub fn new(conn: ConnectionManager, search: SearchIndexes) -> Self {
        Self {
            conn,
            search,
            embedder: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Write the QA record for a finished turn. Embedding is best-effort and
    /// skipped entirely when no embedder is configured.
    pub async fn record_turn(
        &self,
        thread_id: &str,
        task_id: &str,
        user_id: Option<&str>,
        question: &str,
        answer: &str,
    ) -> SreResult<QaRecord> {
        let now = now_iso();
        let record = QaRecord {
            id: Uuid::now_v7().to_string(),
            thread_id: thread_id.to_string(),
            task_id: task_id.to_string(),
            user_id: user_id.map(str::to_string),
            question: question.to_string(),
            answer: answer.to_string(),
            created_at: now.clone(),
            updated_at: now,
        };

        if let Err(e) = self.search.ensure_index(IndexName::Qa).await {
            warn!(error = %e, "failed to ensure qa index");
        }

        let doc_key = RedisKeys::qa_doc(&record.id);
        let epoch = chrono::Utc::now().timestamp().to_string();
        let fields = vec![
            ("thread_id", record.thread_id.clone()),
            ("task_id", record.task_id.clone()),
            ("user_id", record.user_id.clone().unwrap_or_default()),
            ("question", record.question.clone()),
            ("answer", record.answer.clone()),
            ("created_at", epoch.clone()),
            ("updated_at", epoch),
        ];
        let mut conn = self.conn.clone();
        let pairs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let _: () = conn.hset_multiple(&doc_key, &pairs).await?;

        if let Some(embedder) = &self.embedder {
            match embedder
                .embed_many(&[record.question.clone(), record.answer.clone()])
                .await
            {
                Ok(vectors) if vectors.len() == 2 => {
                    self.search
                        .set_vector_field(&doc_key, "question_vector", &vectors[0])
                        .await;
                    self.search
                        .set_vector_field(&doc_key, "answer_vector", &vectors[1])
                        .await;
                }
                Ok(_) => warn!("embedder returned an unexpected vector count"),
                Err(e) => warn!(error = %e, "qa embedding failed"),
            }
        }

        debug!(qa_id = %record.id, thread_id, "recorded qa artifact");
        Ok(record)
    }
}
