//! Typed tool registry.
//!
//! Tool names map to a spec (JSON-schema parameters, validated at
//! registration), a provider implementation, a per-tool timeout, and the set
//! of agent kinds allowed to call it. The dispatcher only ever executes
//! tools through this registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{SreError, SreResult};
use crate::router::AgentKind;

/// Tool description handed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the arguments
    pub parameters: Value,
}

/// Execution port for tool implementations (Redis diagnostics, knowledge
/// search, health checks, ...).
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn execute(
        &self,
        tool_name: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> SreResult<Value>;
}

#[derive(Clone)]
struct ToolEntry {
    spec: ToolSpec,
    provider: Arc<dyn ToolProvider>,
    timeout: Duration,
    kinds: Vec<AgentKind>,
}

/// Registry of callable tools keyed by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    entries: HashMap<String, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. The parameters schema must be a JSON object; anything
    /// else is a registration-time validation error.
    pub fn register(
        &mut self,
        spec: ToolSpec,
        provider: Arc<dyn ToolProvider>,
        timeout: Duration,
        kinds: &[AgentKind],
    ) -> SreResult<()> {
        if !spec.parameters.is_object() {
            return Err(SreError::validation(format!(
                "tool '{}' parameters must be a JSON object schema",
                spec.name
            )));
        }
        self.entries.insert(
            spec.name.clone(),
            ToolEntry {
                spec,
                provider,
                timeout,
                kinds: kinds.to_vec(),
            },
        );
        Ok(())
    }

    /// Specs visible to an agent kind; this is the tool set bound to the LLM.
    pub fn specs_for(&self, kind: AgentKind) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .entries
            .values()
            .filter(|e| e.kinds.contains(&kind))
            .map(|e| e.spec.clone())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Execute a tool under its timeout, surfacing cancellation cooperatively.
    pub async fn execute(
        &self,
        tool_name: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> SreResult<Value> {
        let entry = self.entries.get(tool_name).ok_or_else(|| {
            SreError::validation(format!("unknown tool: {tool_name}"))
        })?;
        debug!(tool = tool_name, "executing tool");
        let run = entry.provider.execute(tool_name, args, cancel);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SreError::Cancelled),
            result = tokio::time::timeout(entry.timeout, run) => match result {
                Ok(inner) => inner,
                Err(_) => Err(SreError::timeout(format!("tool {tool_name}"))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoProvider;

    #[async_trait]
    impl ToolProvider for EchoProvider {
        async fn execute(
            &self,
            _tool_name: &str,
            args: Value,
            _cancel: &CancellationToken,
        ) -> SreResult<Value> {
            Ok(json!({"echo": args}))
        }
    }

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            description: "test tool".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    #[test]
    fn registration_rejects_non_object_schemas() {
        let mut registry = ToolRegistry::new();
        let bad = ToolSpec {
            name: "bad".into(),
            description: String::new(),
            parameters: json!("not a schema"),
        };
        assert!(registry
            .register(bad, Arc::new(EchoProvider), Duration::from_secs(5), &[])
            .is_err());
    }

    #[test]
    fn specs_are_scoped_to_agent_kinds() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                spec("check_service_health"),
                Arc::new(EchoProvider),
                Duration::from_secs(5),
                &[AgentKind::RedisTriage, AgentKind::RedisChat],
            )
            .unwrap();
        registry
            .register(
                spec("search_knowledge_base"),
                Arc::new(EchoProvider),
                Duration::from_secs(5),
                &[
                    AgentKind::RedisTriage,
                    AgentKind::RedisChat,
                    AgentKind::KnowledgeOnly,
                ],
            )
            .unwrap();

        let knowledge = registry.specs_for(AgentKind::KnowledgeOnly);
        assert_eq!(knowledge.len(), 1);
        assert_eq!(knowledge[0].name, "search_knowledge_base");
        assert_eq!(registry.specs_for(AgentKind::RedisTriage).len(), 2);
    }

    #[tokio::test]
    async fn execution_routes_through_the_provider() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                spec("echo"),
                Arc::new(EchoProvider),
                Duration::from_secs(5),
                &[AgentKind::RedisChat],
            )
            .unwrap();
        let cancel = CancellationToken::new();
        let result = registry
            .execute("echo", json!({"x": 1}), &cancel)
            .await
            .unwrap();
        assert_eq!(result["echo"]["x"], 1);
    }

    #[tokio::test]
    async fn unknown_tools_fail_fast() {
        let registry = ToolRegistry::new();
        let cancel = CancellationToken::new();
        let err = registry.execute("nope", json!({}), &cancel).await;
        assert!(matches!(err, Err(SreError::Validation { .. })));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_execution() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                spec("echo"),
                Arc::new(EchoProvider),
                Duration::from_secs(5),
                &[AgentKind::RedisChat],
            )
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = registry.execute("echo", json!({}), &cancel).await;
        assert!(matches!(err, Err(SreError::Cancelled)));
    }
}
