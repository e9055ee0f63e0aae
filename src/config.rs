//! Process configuration sourced from environment variables and CLI flags

use clap::Args;

/// Runtime settings for the execution substrate.
///
/// Every field can be supplied as a flag or through the environment variable
/// named in its attribute; the binary flattens this into its CLI.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Optional Redis password, merged into the connection URL when set
    #[arg(long, env = "REDIS_PASSWORD")]
    pub redis_password: Option<String>,

    /// OpenAI-compatible API key for the LLM provider
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Primary model used for agent turns
    #[arg(long, env = "OPENAI_MODEL", default_value = "gpt-4o")]
    pub model_primary: String,

    /// Mini model used for cheaper synthesis steps
    #[arg(long, env = "OPENAI_MODEL_MINI", default_value = "gpt-4o-mini")]
    pub model_mini: String,

    /// Nano model used for routing and fact-checking
    #[arg(long, env = "OPENAI_MODEL_NANO", default_value = "gpt-4o-mini")]
    pub model_nano: String,

    /// Upper bound on agent tool-loop iterations per turn
    #[arg(long, env = "MAX_ITERATIONS", default_value_t = 10)]
    pub max_iterations: u32,

    /// Call-level timeout for primary model invocations, in seconds
    #[arg(long, env = "LLM_TIMEOUT", default_value_t = 60)]
    pub llm_timeout_secs: u64,

    /// Call-level timeout for nano model invocations, in seconds
    #[arg(long, env = "LLM_NANO_TIMEOUT", default_value_t = 10)]
    pub llm_nano_timeout_secs: u64,

    /// Logical queue name for the worker runtime
    #[arg(long, env = "TASK_QUEUE_NAME", default_value = "sre_tasks")]
    pub task_queue_name: String,

    /// Number of concurrent workers in the pool
    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 2)]
    pub worker_concurrency: usize,

    /// Maximum runtime for a single task execution, in seconds
    #[arg(long, env = "MAX_TASK_RUNTIME", default_value_t = 300)]
    pub max_task_runtime_secs: u64,

    /// Embedding dimension for QA/knowledge vector fields
    #[arg(long, env = "VECTOR_DIM", default_value_t = 1536)]
    pub vector_dim: usize,

    /// Master key for instance credential encryption; consumed by the
    /// instance-producing service, carried here so collaborators share config
    #[arg(long, env = "REDIS_SRE_MASTER_KEY", hide_env_values = true)]
    pub master_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_password: None,
            openai_api_key: None,
            model_primary: "gpt-4o".to_string(),
            model_mini: "gpt-4o-mini".to_string(),
            model_nano: "gpt-4o-mini".to_string(),
            max_iterations: 10,
            llm_timeout_secs: 60,
            llm_nano_timeout_secs: 10,
            task_queue_name: "sre_tasks".to_string(),
            worker_concurrency: 2,
            max_task_runtime_secs: 300,
            vector_dim: 1536,
            master_key: None,
        }
    }
}

impl Settings {
    /// Connection URL with the password folded in when one is configured.
    pub fn effective_redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) if !password.is_empty() => {
                // redis://host:port -> redis://:password@host:port
                if let Some(rest) = self.redis_url.strip_prefix("redis://") {
                    if rest.contains('@') {
                        self.redis_url.clone()
                    } else {
                        format!("redis://:{password}@{rest}")
                    }
                } else {
                    self.redis_url.clone()
                }
            }
            _ => self.redis_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_folded_into_url() {
        let settings = Settings {
            redis_password: Some("hunter2".into()),
            ..Settings::default()
        };
        assert_eq!(
            settings.effective_redis_url(),
            "redis://:hunter2@127.0.0.1:6379"
        );
    }

    #[test]
    fn url_with_credentials_is_left_alone() {
        let settings = Settings {
            redis_url: "redis://:pw@example.com:6379".into(),
            redis_password: Some("other".into()),
            ..Settings::default()
        };
        assert_eq!(settings.effective_redis_url(), "redis://:pw@example.com:6379");
    }
}
