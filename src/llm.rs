//! Conversation message model and the LLM/embedding ports.
//!
//! Messages are a tagged sum; only user/assistant variants are persisted
//! between turns. System and tool messages are loop-local.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SreResult;
use crate::tools::ToolSpec;

/// One conversation message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Tool {
        call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage::User {
            content: content.into(),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage::Assistant {
            content: content.into(),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
            metadata: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage::Tool {
            call_id: call_id.into(),
            content: content.into(),
        }
    }

    pub fn content(&self) -> &str {
        match self {
            ChatMessage::System { content }
            | ChatMessage::User { content, .. }
            | ChatMessage::Assistant { content, .. }
            | ChatMessage::Tool { content, .. } => content,
        }
    }

    /// Whether this message survives into the persisted transcript.
    pub fn is_persistable(&self) -> bool {
        matches!(
            self,
            ChatMessage::User { .. } | ChatMessage::Assistant { .. }
        )
    }
}

/// Drop loop-local messages, keeping the user/assistant transcript.
pub fn filter_transcript(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .filter(|m| m.is_persistable())
        .cloned()
        .collect()
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// One model reply: either content-only (final) or a batch of tool calls.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl LlmResponse {
    pub fn content_only(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    /// A content-only reply ends the tool loop.
    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

/// Primary and nano model port. Implementations are stateless per call and
/// must honor the supplied timeout.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        timeout: Duration,
    ) -> SreResult<LlmResponse>;

    /// Router / fact-check model.
    async fn invoke_nano(
        &self,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> SreResult<LlmResponse>;
}

/// Embedding port, used when projecting QA records into vector fields.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_many(&self, texts: &[String]) -> SreResult<Vec<Vec<f32>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_filter_drops_system_and_tool_messages() {
        let messages = vec![
            ChatMessage::system("you are an SRE agent"),
            ChatMessage::user("check memory"),
            ChatMessage::Tool {
                call_id: "c1".into(),
                content: "{}".into(),
            },
            ChatMessage::assistant("memory looks fine"),
        ];
        let persisted = filter_transcript(&messages);
        assert_eq!(persisted.len(), 2);
        assert!(matches!(persisted[0], ChatMessage::User { .. }));
        assert!(matches!(persisted[1], ChatMessage::Assistant { .. }));
    }

    #[test]
    fn messages_round_trip_with_role_tags() {
        let message = ChatMessage::user("hello");
        let raw = serde_json::to_value(&message).unwrap();
        assert_eq!(raw["role"], "user");
        let back: ChatMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(back.content(), "hello");
    }

    #[test]
    fn content_only_reply_is_final() {
        assert!(LlmResponse::content_only("done").is_final());
        let reply = LlmResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "c1".into(),
                name: "check_service_health".into(),
                arguments: serde_json::json!({}),
            }],
        };
        assert!(!reply.is_final());
    }
}
