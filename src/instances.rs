//! Redis instance metadata: the resolver port, a Redis-backed resolver, and
//! connection-detail extraction from free-form user messages.
//!
//! Instances are produced by an external admin service; the core only reads
//! them. Credential encryption/decryption stays with the producer.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SreResult;
use crate::keys::RedisKeys;

/// Connection metadata for a target Redis instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub connection_url: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub usage: String,
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub description: String,
}

/// Resolver port: returns connection details ready for use.
#[async_trait]
pub trait InstanceResolver: Send + Sync {
    async fn get_by_id(&self, instance_id: &str) -> SreResult<Option<Instance>>;

    /// Register an instance from connection details a user typed into a
    /// message. Resolvers that cannot mint instances return `None` and the
    /// turn proceeds unbound.
    async fn register_from_message(
        &self,
        _extracted: &ExtractedInstance,
        _created_by: &str,
    ) -> SreResult<Option<Instance>> {
        Ok(None)
    }
}

/// Resolver reading `sre_instances:{id}` hashes.
#[derive(Clone)]
pub struct RedisInstanceResolver {
    conn: ConnectionManager,
}

impl RedisInstanceResolver {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl InstanceResolver for RedisInstanceResolver {
    async fn get_by_id(&self, instance_id: &str) -> SreResult<Option<Instance>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> =
            conn.hgetall(RedisKeys::instance_doc(instance_id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        let get = |key: &str| raw.get(key).cloned().unwrap_or_default();
        Ok(Some(Instance {
            id: instance_id.to_string(),
            name: get("name"),
            connection_url: get("connection_url"),
            environment: get("environment"),
            usage: get("usage"),
            instance_type: get("instance_type"),
            description: get("description"),
        }))
    }

    async fn register_from_message(
        &self,
        extracted: &ExtractedInstance,
        created_by: &str,
    ) -> SreResult<Option<Instance>> {
        let instance = Instance {
            id: uuid::Uuid::now_v7().to_string(),
            name: extracted.name.clone(),
            connection_url: extracted.connection_url.clone(),
            environment: "unknown".to_string(),
            usage: "adhoc".to_string(),
            instance_type: "oss".to_string(),
            description: format!("Created by agent from details provided by {created_by}"),
        };
        let mut conn = self.conn.clone();
        let fields = vec![
            ("id", instance.id.clone()),
            ("name", instance.name.clone()),
            ("connection_url", instance.connection_url.clone()),
            ("environment", instance.environment.clone()),
            ("usage", instance.usage.clone()),
            ("instance_type", instance.instance_type.clone()),
            ("description", instance.description.clone()),
        ];
        let pairs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let _: () = conn
            .hset_multiple(RedisKeys::instance_doc(&instance.id), &pairs)
            .await?;
        Ok(Some(instance))
    }
}

/// Connection details pulled out of a user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedInstance {
    pub name: String,
    pub connection_url: String,
}

/// Look for a redis:// / rediss:// URL or a bare `host:port` pair in a
/// message. Returns the first match, suitable for creating an ad-hoc
/// instance binding.
pub fn extract_instance_from_message(message: &str) -> Option<ExtractedInstance> {
    // Full URLs first; they carry the most information.
    let url_re = Regex::new(r#"rediss?://[^\s,;'"]+"#).expect("static regex");
    if let Some(found) = url_re.find(message) {
        let url = found.as_str().trim_end_matches(['.', ')', ']']);
        return Some(ExtractedInstance {
            name: name_from_url(url),
            connection_url: url.to_string(),
        });
    }

    // Bare host:port, e.g. "my redis at 10.0.0.5:6380".
    let host_re =
        Regex::new(r"\b([a-zA-Z0-9][a-zA-Z0-9.\-]*):([0-9]{2,5})\b").expect("static regex");
    for captures in host_re.captures_iter(message) {
        let host = &captures[1];
        let port: u32 = captures[2].parse().ok()?;
        if !(1..=65535).contains(&port) {
            continue;
        }
        // Hostname heuristics: require a dot or the literal "localhost" so
        // times like "12:30" don't bind an instance.
        if host != "localhost" && !host.contains('.') {
            continue;
        }
        return Some(ExtractedInstance {
            name: host.to_string(),
            connection_url: format!("redis://{host}:{port}"),
        });
    }
    None
}

fn name_from_url(url: &str) -> String {
    url.trim_start_matches("rediss://")
        .trim_start_matches("redis://")
        .rsplit('@')
        .next()
        .unwrap_or(url)
        .split([':', '/'])
        .next()
        .filter(|host| !host.is_empty())
        .unwrap_or("extracted")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_redis_urls() {
        let found =
            extract_instance_from_message("please look at redis://10.1.2.3:6379/0 for me").unwrap();
        assert_eq!(found.connection_url, "redis://10.1.2.3:6379/0");
        assert_eq!(found.name, "10.1.2.3");
    }

    #[test]
    fn extracts_tls_urls_with_credentials() {
        let found = extract_instance_from_message(
            "instance is rediss://user:pw@cache.example.com:6380, thanks",
        )
        .unwrap();
        assert_eq!(
            found.connection_url,
            "rediss://user:pw@cache.example.com:6380"
        );
        assert_eq!(found.name, "cache.example.com");
    }

    #[test]
    fn extracts_bare_host_port() {
        let found = extract_instance_from_message("check prod-cache.internal:6379 please").unwrap();
        assert_eq!(found.connection_url, "redis://prod-cache.internal:6379");
    }

    #[test]
    fn ignores_clock_times_and_plain_text() {
        assert!(extract_instance_from_message("meet at 12:30 to discuss").is_none());
        assert!(extract_instance_from_message("why is redis slow?").is_none());
    }

    #[test]
    fn localhost_counts_as_a_host() {
        let found = extract_instance_from_message("use localhost:6379").unwrap();
        assert_eq!(found.connection_url, "redis://localhost:6379");
    }
}
