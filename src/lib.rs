//! # Redis SRE Agent execution substrate
//!
//! A Redis-backed automation core that runs an AI SRE agent against Redis
//! instances. Operators create schedules (recurring directives) and threads
//! (multi-turn conversations); the substrate materializes due schedules into
//! thread + task pairs, executes each task through a pluggable agent
//! pipeline, and streams progress updates while persisting every artifact in
//! Redis with RediSearch secondary indices.
//!
//! ## Features
//!
//! - Durable task queue with dedup keys, delayed execution, per-key
//!   concurrency limits, retries, and perpetual (self-rescheduling) tasks
//! - Scheduler loop fanning due schedules into agent-turn tasks, at most one
//!   per `(schedule, minute-slot)`
//! - Thread and task state machines with append-only progress logs and
//!   typed results, mirrored into FT indices with KV fallback
//! - Agent dispatch: routing across triage/chat/knowledge strategies, a
//!   bounded tool loop, and fact-check post-processing
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use redis_sre_agent::{SearchIndexes, TaskQueue, TaskQueueConfig, Worker, WorkerConfig};
//! use redis_sre_agent::{TaskManager, TaskRegistry};
//! use std::sync::Arc;
//!
//! # async fn compose() -> redis_sre_agent::SreResult<()> {
//! let client = redis::Client::open("redis://127.0.0.1:6379")?;
//! let conn = client.get_connection_manager().await?;
//! let search = SearchIndexes::new(conn.clone(), 1536);
//! let queue = Arc::new(TaskQueue::new(conn.clone(), TaskQueueConfig::default()));
//! let tasks = TaskManager::new(conn, search);
//! let registry = Arc::new(TaskRegistry::new());
//! let worker = Worker::new(WorkerConfig::default(), queue, registry, tasks);
//! worker.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod instances;
pub mod keys;
pub mod llm;
pub mod qa;
pub mod queue;
pub mod router;
pub mod scheduler;
pub mod search;
pub mod tasks;
pub mod threads;
pub mod tools;
pub mod worker;

// Re-export commonly used types
pub use agent::{
    create_agent_task, agent_turn_registration, AgentConfig, AgentDispatcher, AgentTurnArgs,
    CreateTaskResponse, PROCESS_AGENT_TURN,
};
pub use config::Settings;
pub use error::{SreError, SreResult};
pub use instances::{Instance, InstanceResolver, RedisInstanceResolver};
pub use keys::RedisKeys;
pub use llm::{ChatMessage, Embedder, LlmClient, LlmResponse, ToolCall};
pub use qa::{QaRecord, QaStore};
pub use queue::{
    JobEnvelope, RetryPolicy, SubmitOptions, SubmitOutcome, TaskQueue, TaskQueueConfig,
};
pub use router::{AgentKind, LlmRouter, RoutePreferences, Router};
pub use scheduler::{
    scheduler_registration, IntervalType, Schedule, ScheduleStore, SchedulerService, TickSummary,
    SCHEDULER_TICK,
};
pub use search::{IndexName, SearchIndexes};
pub use tasks::{TaskManager, TaskState, TaskStatus, TaskSummary};
pub use threads::{
    StreamChannel, ThreadEvent, ThreadManager, ThreadState, ThreadSummary, ThreadUpdate,
};
pub use tools::{ToolProvider, ToolRegistry, ToolSpec};
pub use worker::{Registration, TaskContext, TaskRegistry, Worker, WorkerConfig};

/// Version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
