//! Agent routing: picks one of three agent strategies per turn.
//!
//! Routing uses the nano model for categorization. Without a bound Redis
//! instance everything lands on the knowledge agent; with one, the router
//! distinguishes a full triage from a quick diagnostic chat. Routing
//! failures always fall back to a safe default.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::SreResult;
use crate::llm::{ChatMessage, LlmClient};

/// The three agent strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Deep diagnostic sweep against a bound instance
    RedisTriage,
    /// Quick Q&A with diagnostic tools
    RedisChat,
    /// No instance required, knowledge base only
    KnowledgeOnly,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::RedisTriage => "redis_triage",
            AgentKind::RedisChat => "redis_chat",
            AgentKind::KnowledgeOnly => "knowledge_only",
        }
    }

    pub fn parse(value: &str) -> Option<AgentKind> {
        match value {
            "redis_triage" | "triage" => Some(AgentKind::RedisTriage),
            "redis_chat" | "chat" => Some(AgentKind::RedisChat),
            "knowledge_only" | "knowledge" => Some(AgentKind::KnowledgeOnly),
            _ => None,
        }
    }
}

/// User preferences that can pin the agent selection.
#[derive(Debug, Clone, Default)]
pub struct RoutePreferences {
    pub preferred_agent: Option<AgentKind>,
}

/// Routing port.
#[async_trait]
pub trait Router: Send + Sync {
    async fn route(
        &self,
        query: &str,
        context: &Map<String, Value>,
        preferences: Option<&RoutePreferences>,
    ) -> AgentKind;
}

const INSTANCE_NEED_PROMPT: &str = "You are a query categorization system for a Redis SRE agent.

Categorize if this query requires access to a live Redis instance or is just seeking general knowledge.

1. NEEDS_INSTANCE: Queries that require access to a specific Redis instance for diagnostics, monitoring, or troubleshooting.
   Examples: \"Check my Redis memory\", \"Why is Redis slow?\", \"Show me the slowlog\"

2. KNOWLEDGE_ONLY: Queries seeking general knowledge, best practices, or guidance.
   Examples: \"What are Redis best practices?\", \"How does Redis replication work?\"

Respond with ONLY one word: either \"NEEDS_INSTANCE\" or \"KNOWLEDGE_ONLY\".";

const TRIAGE_OR_CHAT_PROMPT: &str = "You are a query categorization system for a Redis SRE agent.

The user has a Redis instance available. Determine what kind of agent should handle their query:

1. TRIAGE: Full health check, comprehensive diagnostics, or in-depth analysis.
   Trigger words: \"full health check\", \"triage\", \"comprehensive\", \"full analysis\", \"complete diagnostic\", \"thorough check\", \"audit\"

2. CHAT: Quick questions, specific lookups, or targeted queries.
   Examples: \"Check the memory usage\", \"Show me the slowlog\", \"Is replication working?\"

Respond with ONLY one word: either \"TRIAGE\" or \"CHAT\".";

/// Nano-model router.
pub struct LlmRouter {
    llm: std::sync::Arc<dyn LlmClient>,
    timeout: Duration,
}

impl LlmRouter {
    pub fn new(llm: std::sync::Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    async fn categorize(&self, system_prompt: &str, query: &str) -> SreResult<String> {
        let messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(format!("Categorize this query: {query}")),
        ];
        let response = self.llm.invoke_nano(&messages, self.timeout).await?;
        Ok(response.content.trim().to_uppercase())
    }
}

#[async_trait]
impl Router for LlmRouter {
    async fn route(
        &self,
        query: &str,
        context: &Map<String, Value>,
        preferences: Option<&RoutePreferences>,
    ) -> AgentKind {
        let has_instance = context
            .get("instance_id")
            .and_then(Value::as_str)
            .is_some_and(|id| !id.is_empty());

        // Without an instance every query lands on the knowledge agent; the
        // categorization only informs logging.
        if !has_instance {
            match self.categorize(INSTANCE_NEED_PROMPT, query).await {
                Ok(category) if category.contains("NEEDS_INSTANCE") => {
                    info!("query needs an instance but none is bound, routing to knowledge agent");
                }
                Ok(_) => info!("query categorized as knowledge-only"),
                Err(e) => warn!(error = %e, "router categorization failed, defaulting to knowledge agent"),
            }
            return AgentKind::KnowledgeOnly;
        }

        if let Some(preferred) = preferences.and_then(|p| p.preferred_agent) {
            info!(agent = preferred.as_str(), "using preferred agent");
            return preferred;
        }

        match self.categorize(TRIAGE_OR_CHAT_PROMPT, query).await {
            Ok(category) if category.contains("TRIAGE") => {
                info!("query categorized as full triage");
                AgentKind::RedisTriage
            }
            Ok(_) => {
                info!("query categorized as quick chat");
                AgentKind::RedisChat
            }
            Err(e) => {
                warn!(error = %e, "router categorization failed, defaulting to chat agent");
                AgentKind::RedisChat
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmResponse;
    use crate::tools::ToolSpec;
    use std::sync::Arc;

    struct ScriptedLlm {
        reply: Result<&'static str, &'static str>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn invoke(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolSpec],
            _timeout: Duration,
        ) -> SreResult<LlmResponse> {
            unreachable!("router only uses the nano model")
        }

        async fn invoke_nano(
            &self,
            _messages: &[ChatMessage],
            _timeout: Duration,
        ) -> SreResult<LlmResponse> {
            match self.reply {
                Ok(content) => Ok(LlmResponse::content_only(content)),
                Err(message) => Err(crate::error::SreError::llm(message)),
            }
        }
    }

    fn router(reply: Result<&'static str, &'static str>) -> LlmRouter {
        LlmRouter::new(Arc::new(ScriptedLlm { reply }), Duration::from_secs(10))
    }

    fn context_with_instance() -> Map<String, Value> {
        let mut context = Map::new();
        context.insert("instance_id".into(), Value::String("inst-1".into()));
        context
    }

    #[tokio::test]
    async fn no_instance_routes_to_knowledge() {
        let kind = router(Ok("NEEDS_INSTANCE"))
            .route("check my redis memory", &Map::new(), None)
            .await;
        assert_eq!(kind, AgentKind::KnowledgeOnly);
    }

    #[tokio::test]
    async fn triage_wording_routes_to_triage() {
        let kind = router(Ok("TRIAGE"))
            .route("run a full health check", &context_with_instance(), None)
            .await;
        assert_eq!(kind, AgentKind::RedisTriage);
    }

    #[tokio::test]
    async fn quick_questions_route_to_chat() {
        let kind = router(Ok("CHAT"))
            .route("how many connections?", &context_with_instance(), None)
            .await;
        assert_eq!(kind, AgentKind::RedisChat);
    }

    #[tokio::test]
    async fn routing_failure_defaults_to_chat_with_instance() {
        let kind = router(Err("nano model down"))
            .route("anything", &context_with_instance(), None)
            .await;
        assert_eq!(kind, AgentKind::RedisChat);
    }

    #[tokio::test]
    async fn preferences_override_categorization() {
        let preferences = RoutePreferences {
            preferred_agent: Some(AgentKind::RedisTriage),
        };
        let kind = router(Ok("CHAT"))
            .route("quick one", &context_with_instance(), Some(&preferences))
            .await;
        assert_eq!(kind, AgentKind::RedisTriage);
    }

    #[test]
    fn agent_kind_parses_cli_aliases() {
        assert_eq!(AgentKind::parse("triage"), Some(AgentKind::RedisTriage));
        assert_eq!(AgentKind::parse("redis_chat"), Some(AgentKind::RedisChat));
        assert_eq!(AgentKind::parse("knowledge"), Some(AgentKind::KnowledgeOnly));
        assert_eq!(AgentKind::parse("bogus"), None);
    }
}
