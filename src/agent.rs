//! Agent dispatcher: consumes one message for a thread and runs one agent
//! turn end to end.
//!
//! The turn binds a Redis instance (client-supplied beats thread-persisted
//! beats extracted-from-message), routes to one of the three agent
//! strategies, drives the bounded tool loop, fact-checks the draft with the
//! nano model (running one corrective loop when errors are found), persists
//! the filtered transcript plus results, and records a QA artifact.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::{SreError, SreResult};
use crate::instances::{extract_instance_from_message, InstanceResolver};
use crate::llm::{filter_transcript, ChatMessage, LlmClient};
use crate::qa::QaStore;
use crate::queue::RetryPolicy;
use crate::router::{AgentKind, RoutePreferences, Router};
use crate::tasks::{TaskManager, TaskStatus};
use crate::threads::ThreadManager;
use crate::tools::ToolRegistry;
use crate::worker::{Registration, TaskContext};

/// Registered name of the agent-turn task function.
pub const PROCESS_AGENT_TURN: &str = "process_agent_turn";

const TRIAGE_PROMPT: &str = "You are a Redis SRE agent performing a comprehensive triage. \
Investigate the bound Redis instance thoroughly: start with a health check, then follow every \
concerning signal with further diagnostics and knowledge-base research. Cite tool results for \
every technical claim and end with a structured investigation summary.";

const CHAT_PROMPT: &str = "You are a Redis SRE agent answering a targeted question about a bound \
Redis instance. Use diagnostic tools to ground your answer, keep it focused, and cite the tool \
results you relied on.";

const KNOWLEDGE_PROMPT: &str = "You are a Redis SRE agent answering from general knowledge and \
the knowledge base. No live instance is available; do not claim to have inspected one. Search \
the knowledge base for authoritative material before answering.";

const FACT_CHECKER_PROMPT: &str = r#"You are a Redis technical fact-checker. Review the provided SRE agent response and identify statements that are technically incorrect about Redis internals, misleading interpretations of metrics, unsupported claims, or contradictions with the diagnostic data shown.

If you find factual errors, respond with JSON:
{"has_errors": true, "errors": [{"claim": "...", "issue": "...", "category": "redis_internals|metrics_interpretation|configuration|other"}], "suggested_research": ["topics to research"]}

If no errors are found, respond with JSON:
{"has_errors": false, "validation_notes": "brief note about what was verified"}

Be strict but fair - flag clear technical inaccuracies, not wording choices."#;

/// Arguments carried in the queue envelope for one agent turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTurnArgs {
    pub thread_id: String,
    pub message: String,
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
    #[serde(default)]
    pub task_id: Option<String>,
}

/// Dispatcher tuning derived from [`Settings`].
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_iterations: u32,
    pub llm_timeout: Duration,
    pub nano_timeout: Duration,
    /// Persisted messages handed to the knowledge agent
    pub compact_history: usize,
}

impl AgentConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_iterations: settings.max_iterations,
            llm_timeout: Duration::from_secs(settings.llm_timeout_secs),
            nano_timeout: Duration::from_secs(settings.llm_nano_timeout_secs),
            compact_history: 6,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Fan-out target for progress updates produced inside the loop.
#[async_trait]
pub trait ProgressEmitter: Send + Sync {
    async fn emit(&self, message: &str, update_type: &str, metadata: Option<Value>);
}

/// No-op emitter.
pub struct NullProgress;

#[async_trait]
impl ProgressEmitter for NullProgress {
    async fn emit(&self, _message: &str, _update_type: &str, _metadata: Option<Value>) {}
}

/// Emitter that mirrors every update into both the thread and task stores;
/// thread-level entries carry the task id so the UI can group them.
pub struct ProgressSink {
    threads: ThreadManager,
    tasks: TaskManager,
    thread_id: String,
    task_id: String,
}

#[async_trait]
impl ProgressEmitter for ProgressSink {
    async fn emit(&self, message: &str, update_type: &str, metadata: Option<Value>) {
        let mut thread_metadata = match &metadata {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        thread_metadata
            .entry("task_id".to_string())
            .or_insert(Value::String(self.task_id.clone()));
        if let Err(e) = self
            .threads
            .add_thread_update(
                &self.thread_id,
                message,
                update_type,
                Some(Value::Object(thread_metadata)),
            )
            .await
        {
            warn!(error = %e, "thread progress update failed");
        }
        if let Err(e) = self
            .tasks
            .add_task_update(&self.task_id, message, update_type, metadata)
            .await
        {
            // Per-task update logging never fails the turn.
            debug!(error = %e, "task progress update failed");
        }
    }
}

/// Fact-check verdict parsed from the nano model.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FactCheckReport {
    #[serde(default)]
    pub has_errors: bool,
    #[serde(default)]
    pub errors: Vec<FactCheckIssue>,
    #[serde(default)]
    pub suggested_research: Vec<String>,
    #[serde(default)]
    pub validation_notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactCheckIssue {
    pub claim: String,
    pub issue: String,
    #[serde(default)]
    pub category: Option<String>,
}

/// Parse a fact-checker reply, tolerating ```json fences. Unparseable
/// replies count as "no errors" so a flaky checker never fails a turn.
pub fn parse_fact_check(raw: &str) -> FactCheckReport {
    let mut text = raw.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        text = stripped;
    } else if let Some(stripped) = text.strip_prefix("```") {
        text = stripped;
    }
    if let Some(stripped) = text.strip_suffix("```") {
        text = stripped;
    }
    match serde_json::from_str(text.trim()) {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "fact-checker returned invalid JSON, treating as clean");
            FactCheckReport::default()
        }
    }
}

/// Corrective research query built from the fact-checker's topics.
fn build_research_query(original_query: &str, topics: &[String]) -> String {
    let bullet_list = topics
        .iter()
        .map(|t| format!("- {t}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "I need to correct my previous response. Please help me research these specific topics \
to provide accurate information:\n\n{bullet_list}\n\nMy original query was: {original_query}\n\n\
Use the knowledge search tools extensively to find authoritative information about these Redis \
concepts, then provide a corrected and more accurate response."
    )
}

fn build_corrected_response(corrected: &str) -> String {
    format!(
        "## Corrected Response\n\n{corrected}\n\n---\n*Note: This response has been fact-checked \
and corrected to ensure technical accuracy.*"
    )
}

fn system_prompt_for(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::RedisTriage => TRIAGE_PROMPT,
        AgentKind::RedisChat => CHAT_PROMPT,
        AgentKind::KnowledgeOnly => KNOWLEDGE_PROMPT,
    }
}

/// Outcome of one bounded tool loop.
#[derive(Debug, Clone)]
pub struct ToolLoopOutcome {
    pub content: String,
    pub iterations: u32,
    pub tool_call_count: u32,
    pub limit_reached: bool,
}

/// Drive the LLM/tool cycle until a content-only reply or the iteration cap.
/// Tool results are applied in submission order; every step is cancellable.
pub async fn run_tool_loop(
    llm: &dyn LlmClient,
    tools: &ToolRegistry,
    kind: AgentKind,
    messages: &mut Vec<ChatMessage>,
    max_iterations: u32,
    llm_timeout: Duration,
    cancel: &CancellationToken,
    progress: &dyn ProgressEmitter,
) -> SreResult<ToolLoopOutcome> {
    let specs = tools.specs_for(kind);
    let mut iterations = 0;
    let mut tool_call_count = 0;
    let mut last_content = String::new();
    let mut limit_reached = false;

    loop {
        if cancel.is_cancelled() {
            return Err(SreError::Cancelled);
        }
        if iterations >= max_iterations {
            limit_reached = true;
            warn!(max_iterations, "tool loop reached iteration cap");
            progress
                .emit(
                    &format!("Reached tool iteration limit ({max_iterations})"),
                    "iteration_limit",
                    None,
                )
                .await;
            break;
        }
        iterations += 1;

        let response = llm.invoke(messages, &specs, llm_timeout).await?;
        if response.is_final() {
            last_content = response.content;
            break;
        }
        if !response.content.is_empty() {
            last_content = response.content.clone();
        }

        messages.push(ChatMessage::Assistant {
            content: response.content.clone(),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
            metadata: Some(json!({
                "tool_calls": response.tool_calls,
            })),
        });

        for call in response.tool_calls {
            if cancel.is_cancelled() {
                return Err(SreError::Cancelled);
            }
            progress
                .emit(
                    &format!("Running tool {}", call.name),
                    "tool_call",
                    Some(json!({"tool": call.name, "iteration": iterations})),
                )
                .await;
            tool_call_count += 1;
            let content = match tools.execute(&call.name, call.arguments, cancel).await {
                Ok(result) => serde_json::to_string(&result)?,
                Err(SreError::Cancelled) => return Err(SreError::Cancelled),
                Err(e) => {
                    // Tool failures are data for the model, not turn failures.
                    warn!(tool = %call.name, error = %e, "tool execution failed");
                    json!({"error": e.to_string()}).to_string()
                }
            };
            messages.push(ChatMessage::tool(call.id, content));
        }
    }

    if limit_reached && last_content.is_empty() {
        // Best-available content: one synthesis call with no tools bound.
        last_content = match llm.invoke(messages, &[], llm_timeout).await {
            Ok(response) if !response.content.is_empty() => response.content,
            _ => "The investigation hit the tool iteration limit before completing; partial \
findings are recorded in the progress updates above."
                .to_string(),
        };
    }

    Ok(ToolLoopOutcome {
        content: last_content,
        iterations,
        tool_call_count,
        limit_reached,
    })
}

/// Persisted transcript parsed back into typed messages.
fn history_from_context(context: &Map<String, Value>) -> Vec<ChatMessage> {
    match context.get("messages") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| serde_json::from_value::<ChatMessage>(item.clone()).ok())
            .filter(ChatMessage::is_persistable)
            .collect(),
        _ => Vec::new(),
    }
}

fn compact_history(history: Vec<ChatMessage>, keep: usize) -> Vec<ChatMessage> {
    let len = history.len();
    if len <= keep {
        history
    } else {
        history.into_iter().skip(len - keep).collect()
    }
}

/// The per-task orchestrator.
pub struct AgentDispatcher {
    threads: ThreadManager,
    tasks: TaskManager,
    router: Arc<dyn Router>,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    instances: Arc<dyn InstanceResolver>,
    qa: Option<QaStore>,
    config: AgentConfig,
}

impl AgentDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        threads: ThreadManager,
        tasks: TaskManager,
        router: Arc<dyn Router>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        instances: Arc<dyn InstanceResolver>,
        qa: Option<QaStore>,
        config: AgentConfig,
    ) -> Self {
        Self {
            threads,
            tasks,
            router,
            llm,
            tools,
            instances,
            qa,
            config,
        }
    }

    /// Run one agent turn. Errors are recorded on both the task and thread
    /// before propagating so the worker can apply its retry policy;
    /// cancellation propagates untouched.
    pub async fn process_agent_turn(
        &self,
        ctx: TaskContext,
        args: AgentTurnArgs,
    ) -> SreResult<Value> {
        info!(thread_id = %args.thread_id, attempt = ctx.attempt, "processing agent turn");

        let thread = self.threads.get_thread(&args.thread_id).await?;
        let task_id = match &args.task_id {
            Some(task_id) => task_id.clone(),
            None => {
                let user_id = thread
                    .as_ref()
                    .and_then(|t| t.metadata.user_id.clone());
                self.tasks
                    .create_task(&args.thread_id, user_id.as_deref(), Some(&args.message))
                    .await?
            }
        };

        let thread = match thread {
            Some(thread) => thread,
            None => {
                let err = SreError::not_found("thread", args.thread_id.clone());
                self.record_failure(&args.thread_id, &task_id, &err).await;
                return Err(err);
            }
        };

        match self
            .tasks
            .update_task_status(&task_id, TaskStatus::InProgress)
            .await
        {
            Ok(()) | Err(SreError::InvalidTransition { .. }) => {}
            Err(e) => warn!(error = %e, "could not mark task in progress"),
        }
        let progress = ProgressSink {
            threads: self.threads.clone(),
            tasks: self.tasks.clone(),
            thread_id: args.thread_id.clone(),
            task_id: task_id.clone(),
        };
        progress
            .emit(&format!("Started task {task_id}"), "task_start", None)
            .await;

        match self.run_turn(&ctx, &args, &task_id, thread, &progress).await {
            Ok(result) => Ok(result),
            Err(SreError::Cancelled) => Err(SreError::Cancelled),
            Err(e) => {
                self.record_failure(&args.thread_id, &task_id, &e).await;
                Err(e)
            }
        }
    }

    async fn run_turn(
        &self,
        ctx: &TaskContext,
        args: &AgentTurnArgs,
        task_id: &str,
        thread: crate::threads::ThreadState,
        progress: &ProgressSink,
    ) -> SreResult<Value> {
        let thread_id = &args.thread_id;

        // Instance binding: client-supplied > thread-persisted > extracted.
        let client_instance = args
            .context
            .as_ref()
            .and_then(|c| c.get("instance_id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let thread_instance = thread
            .context
            .get("instance_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        let active_instance_id = if let Some(instance_id) = client_instance {
            progress
                .emit(
                    &format!("Using Redis instance: {instance_id}"),
                    "instance_context",
                    None,
                )
                .await;
            Some(instance_id)
        } else if let Some(instance_id) = thread_instance {
            progress
                .emit(
                    &format!("Continuing with Redis instance: {instance_id}"),
                    "instance_context",
                    None,
                )
                .await;
            Some(instance_id)
        } else if let Some(extracted) = extract_instance_from_message(&args.message) {
            match self
                .instances
                .register_from_message(&extracted, thread.metadata.user_id.as_deref().unwrap_or("unknown"))
                .await
            {
                Ok(Some(instance)) => {
                    progress
                        .emit(
                            &format!("Created Redis instance: {} ({})", instance.name, instance.id),
                            "instance_created",
                            None,
                        )
                        .await;
                    Some(instance.id)
                }
                Ok(None) => None,
                Err(e) => {
                    progress
                        .emit(
                            &format!("Could not create instance from provided details: {e}"),
                            "instance_error",
                            None,
                        )
                        .await;
                    None
                }
            }
        } else {
            None
        };

        if let Some(instance_id) = &active_instance_id {
            let mut patch = Map::new();
            patch.insert("instance_id".into(), Value::String(instance_id.clone()));
            self.threads
                .update_thread_context(thread_id, &patch, true)
                .await?;
        }

        // Merged context drives routing: thread context under client context.
        let mut routing_context = thread.context.clone();
        if let Some(extra) = &args.context {
            for (key, value) in extra {
                routing_context.insert(key.clone(), value.clone());
            }
        }
        if let Some(instance_id) = &active_instance_id {
            routing_context.insert("instance_id".into(), Value::String(instance_id.clone()));
        }

        let preferences = routing_context
            .get("preferred_agent")
            .and_then(Value::as_str)
            .and_then(AgentKind::parse)
            .map(|preferred_agent| RoutePreferences {
                preferred_agent: Some(preferred_agent),
            });
        let kind = self
            .router
            .route(&args.message, &routing_context, preferences.as_ref())
            .await;
        info!(agent = kind.as_str(), thread_id, "routed agent turn");
        progress
            .emit(
                &format!("Processing query with {} agent", kind.as_str()),
                "agent_processing",
                None,
            )
            .await;

        // Knowledge agents get a compact history; Redis agents the full
        // rolling transcript.
        let full_history = history_from_context(&thread.context);
        let history = match kind {
            AgentKind::KnowledgeOnly => {
                compact_history(full_history, self.config.compact_history)
            }
            _ => full_history,
        };

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(system_prompt_for(kind)));
        messages.extend(history);
        messages.push(ChatMessage::user(args.message.clone()));

        let outcome = run_tool_loop(
            self.llm.as_ref(),
            &self.tools,
            kind,
            &mut messages,
            self.config.max_iterations,
            self.config.llm_timeout,
            &ctx.cancel,
            progress,
        )
        .await?;

        // Fact-check the draft; on errors run one corrective loop.
        let mut final_response = outcome.content.clone();
        let mut fact_checked = false;
        let report = self.fact_check(&final_response).await;
        if report.has_errors && !report.suggested_research.is_empty() {
            warn!(
                errors = report.errors.len(),
                "fact-check flagged the draft, running corrective turn"
            );
            progress
                .emit(
                    "Fact-check found issues, researching corrections",
                    "fact_check",
                    Some(json!({"errors": report.errors.len()})),
                )
                .await;
            let research_query = build_research_query(&args.message, &report.suggested_research);
            messages.push(ChatMessage::user(research_query));
            let corrective = run_tool_loop(
                self.llm.as_ref(),
                &self.tools,
                kind,
                &mut messages,
                self.config.max_iterations,
                self.config.llm_timeout,
                &ctx.cancel,
                progress,
            )
            .await?;
            final_response = build_corrected_response(&corrective.content);
            fact_checked = true;
        }

        // Persist the transcript: user/assistant only, tool messages are
        // loop-local.
        messages.push(ChatMessage::assistant(final_response.clone()));
        let persisted = filter_transcript(&messages);
        let mut patch = Map::new();
        patch.insert("messages".into(), serde_json::to_value(&persisted)?);
        patch.insert(
            "last_updated".into(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        self.threads
            .update_thread_context(thread_id, &patch, true)
            .await?;

        let result = json!({
            "response": final_response,
            "metadata": {
                "agent_type": kind.as_str(),
                "iterations": outcome.iterations,
                "tool_calls": outcome.tool_call_count,
                "iteration_limit_reached": outcome.limit_reached,
                "fact_check_corrected": fact_checked,
            },
            "thread_id": thread_id,
            "task_id": task_id,
            "turn_completed_at": chrono::Utc::now().to_rfc3339(),
        });

        self.tasks.set_task_result(task_id, &result).await?;
        match self.tasks.update_task_status(task_id, TaskStatus::Done).await {
            Ok(()) | Err(SreError::InvalidTransition { .. }) => {}
            Err(e) => warn!(error = %e, "could not mark task done"),
        }
        self.threads.set_thread_result(thread_id, &result).await?;
        progress
            .emit(
                &format!("Task {task_id} completed successfully"),
                "turn_complete",
                None,
            )
            .await;

        if let Some(qa) = &self.qa {
            if let Err(e) = qa
                .record_turn(
                    thread_id,
                    task_id,
                    thread.metadata.user_id.as_deref(),
                    &args.message,
                    &final_response,
                )
                .await
            {
                warn!(error = %e, "QA record write failed");
            }
        }

        info!(thread_id, task_id, "agent turn completed");
        Ok(result)
    }

    async fn fact_check(&self, draft: &str) -> FactCheckReport {
        let messages = vec![
            ChatMessage::system(FACT_CHECKER_PROMPT),
            ChatMessage::user(format!(
                "## Agent Response to Fact-Check:\n{draft}\n\nPlease review this Redis SRE agent \
response for factual accuracy and provide your assessment."
            )),
        ];
        match self
            .llm
            .invoke_nano(&messages, self.config.nano_timeout)
            .await
        {
            Ok(response) => parse_fact_check(&response.content),
            Err(e) => {
                // A broken fact-checker never blocks the turn.
                warn!(error = %e, "fact-check call failed");
                FactCheckReport::default()
            }
        }
    }

    async fn record_failure(&self, thread_id: &str, task_id: &str, error: &SreError) {
        let message = format!("Agent turn failed: {error}");
        error!(thread_id, task_id, %error, "agent turn failed");
        if let Err(e) = self.threads.set_thread_error(thread_id, &message).await {
            warn!(error = %e, "failed to record thread error");
        }
        if let Err(e) = self
            .threads
            .add_thread_update(thread_id, &format!("Error: {message}"), "error", None)
            .await
        {
            warn!(error = %e, "failed to append error update");
        }
        if let Err(e) = self.tasks.set_task_error(task_id, &message).await {
            warn!(error = %e, "failed to record task error");
        }
    }
}

/// Response of the exposed task-creation operation.
#[derive(Debug, Clone, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: String,
    pub thread_id: String,
    pub status: TaskStatus,
}

/// Exposed operation: create (or reuse) a thread, create the per-turn task
/// record, and enqueue the agent turn serialized on the thread. This is the
/// single entry point for producing agent-turn tasks from the API and CLI.
pub async fn create_agent_task(
    threads: &ThreadManager,
    tasks: &TaskManager,
    queue: &crate::queue::TaskQueue,
    message: &str,
    thread_id: Option<String>,
    context: Option<Map<String, Value>>,
    user_id: Option<&str>,
) -> SreResult<CreateTaskResponse> {
    let thread_id = match thread_id {
        Some(existing) => existing,
        None => {
            let mut initial_context = context.clone().unwrap_or_default();
            initial_context
                .entry("messages".to_string())
                .or_insert(Value::Array(Vec::new()));
            initial_context
                .entry("original_query".to_string())
                .or_insert(Value::String(message.to_string()));
            let thread_id = threads
                .create_thread(crate::threads::CreateThread {
                    user_id: user_id.map(str::to_string),
                    session_id: None,
                    initial_context: Some(initial_context),
                    tags: Vec::new(),
                })
                .await?;
            threads.update_thread_subject(&thread_id, message).await?;
            thread_id
        }
    };

    let thread_user = match threads.get_thread(&thread_id).await? {
        Some(state) => state.metadata.user_id,
        None => return Err(SreError::not_found("thread", thread_id)),
    };
    let task_id = tasks
        .create_task(
            &thread_id,
            user_id.or(thread_user.as_deref()),
            Some(message),
        )
        .await?;

    let args = serde_json::to_value(AgentTurnArgs {
        thread_id: thread_id.clone(),
        message: message.to_string(),
        context,
        task_id: Some(task_id.clone()),
    })?;
    let options = crate::queue::SubmitOptions::serialized_on(&thread_id)
        .with_retry(RetryPolicy::new(3, 5))
        .with_task_id(task_id.clone());
    queue.submit(PROCESS_AGENT_TURN, args, options).await?;

    Ok(CreateTaskResponse {
        task_id,
        thread_id,
        status: TaskStatus::Queued,
    })
}

/// Worker registration for the agent-turn function. Per-thread serialization
/// is enforced at submission time (`concurrency_key = thread_id`).
pub fn agent_turn_registration(dispatcher: Arc<AgentDispatcher>) -> Registration {
    Registration::new(PROCESS_AGENT_TURN, move |ctx, args| {
        let dispatcher = dispatcher.clone();
        async move {
            let args: AgentTurnArgs = serde_json::from_value(args)
                .map_err(|e| SreError::validation(format!("bad agent turn args: {e}")))?;
            dispatcher.process_agent_turn(ctx, args).await
        }
    })
    .with_retry(RetryPolicy::new(3, 5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, ToolCall};
    use crate::tools::{ToolProvider, ToolSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SequencedLlm {
        replies: Vec<LlmResponse>,
        cursor: AtomicUsize,
    }

    impl SequencedLlm {
        fn new(replies: Vec<LlmResponse>) -> Self {
            Self {
                replies,
                cursor: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmClient for SequencedLlm {
        async fn invoke(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolSpec],
            _timeout: Duration,
        ) -> SreResult<LlmResponse> {
            let i = self.cursor.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .replies
                .get(i)
                .cloned()
                .unwrap_or_else(|| self.replies.last().cloned().unwrap_or_default()))
        }

        async fn invoke_nano(
            &self,
            _messages: &[ChatMessage],
            _timeout: Duration,
        ) -> SreResult<LlmResponse> {
            Ok(LlmResponse::content_only(r#"{"has_errors": false}"#))
        }
    }

    struct StaticTool;

    #[async_trait]
    impl ToolProvider for StaticTool {
        async fn execute(
            &self,
            _tool_name: &str,
            _args: Value,
            _cancel: &CancellationToken,
        ) -> SreResult<Value> {
            Ok(json!({"used_memory": "12mb"}))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolSpec {
                    name: "check_service_health".into(),
                    description: "health check".into(),
                    parameters: json!({"type": "object", "properties": {}}),
                },
                Arc::new(StaticTool),
                Duration::from_secs(5),
                &[AgentKind::RedisTriage, AgentKind::RedisChat],
            )
            .unwrap();
        registry
    }

    fn tool_call_reply() -> LlmResponse {
        LlmResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "c1".into(),
                name: "check_service_health".into(),
                arguments: json!({}),
            }],
        }
    }

    #[tokio::test]
    async fn loop_exits_on_content_only_reply() {
        let llm = SequencedLlm::new(vec![
            tool_call_reply(),
            tool_call_reply(),
            LlmResponse::content_only("memory is healthy"),
        ]);
        let tools = registry();
        let mut messages = vec![ChatMessage::user("check memory")];
        let outcome = run_tool_loop(
            &llm,
            &tools,
            AgentKind::RedisChat,
            &mut messages,
            10,
            Duration::from_secs(60),
            &CancellationToken::new(),
            &NullProgress,
        )
        .await
        .unwrap();
        assert_eq!(outcome.content, "memory is healthy");
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.tool_call_count, 2);
        assert!(!outcome.limit_reached);
        // Tool results landed in the transcript in order.
        let tool_messages: Vec<_> = messages
            .iter()
            .filter(|m| matches!(m, ChatMessage::Tool { .. }))
            .collect();
        assert_eq!(tool_messages.len(), 2);
    }

    #[tokio::test]
    async fn iteration_cap_yields_content_and_flag() {
        // The model never stops calling tools.
        let llm = SequencedLlm::new(vec![tool_call_reply()]);
        let tools = registry();
        let mut messages = vec![ChatMessage::user("check memory")];
        let outcome = run_tool_loop(
            &llm,
            &tools,
            AgentKind::RedisChat,
            &mut messages,
            3,
            Duration::from_secs(60),
            &CancellationToken::new(),
            &NullProgress,
        )
        .await
        .unwrap();
        assert!(outcome.limit_reached);
        assert_eq!(outcome.iterations, 3);
        assert!(!outcome.content.is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_aborts_the_loop() {
        let llm = SequencedLlm::new(vec![tool_call_reply()]);
        let tools = registry();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut messages = vec![ChatMessage::user("check memory")];
        let result = run_tool_loop(
            &llm,
            &tools,
            AgentKind::RedisChat,
            &mut messages,
            10,
            Duration::from_secs(60),
            &cancel,
            &NullProgress,
        )
        .await;
        assert!(matches!(result, Err(SreError::Cancelled)));
    }

    #[test]
    fn fact_check_parsing_handles_fenced_json() {
        let raw = "```json\n{\"has_errors\": true, \"errors\": [{\"claim\": \"redis reads from \
disk\", \"issue\": \"redis serves reads from memory\"}], \"suggested_research\": \
[\"maxmemory-policy\"]}\n```";
        let report = parse_fact_check(raw);
        assert!(report.has_errors);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.suggested_research, vec!["maxmemory-policy"]);
    }

    #[test]
    fn fact_check_parsing_tolerates_garbage() {
        let report = parse_fact_check("I could not assess this response.");
        assert!(!report.has_errors);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn corrected_responses_carry_the_banner() {
        let corrected = build_corrected_response("Redis serves all reads from memory.");
        assert!(corrected.starts_with("## Corrected Response"));
        assert!(corrected.contains("Redis serves all reads from memory."));
    }

    #[test]
    fn research_queries_list_the_topics() {
        let query = build_research_query(
            "why is redis hitting disk?",
            &["maxmemory-policy".into(), "keyspace hit rate".into()],
        );
        assert!(query.contains("- maxmemory-policy"));
        assert!(query.contains("- keyspace hit rate"));
        assert!(query.contains("why is redis hitting disk?"));
    }

    #[test]
    fn history_parsing_skips_malformed_entries() {
        let mut context = Map::new();
        context.insert(
            "messages".into(),
            json!([
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"bogus": true},
                {"role": "tool", "call_id": "c", "content": "x"}
            ]),
        );
        let history = history_from_context(&context);
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn compact_history_keeps_the_tail() {
        let history: Vec<ChatMessage> = (0..10)
            .map(|i| ChatMessage::user(format!("message {i}")))
            .collect();
        let compacted = compact_history(history, 4);
        assert_eq!(compacted.len(), 4);
        assert_eq!(compacted[0].content(), "message 6");
        assert_eq!(compacted[3].content(), "message 9");
    }

    #[test]
    fn turn_args_deserialize_with_optional_fields() {
        let args: AgentTurnArgs = serde_json::from_value(json!({
            "thread_id": "th1",
            "message": "check memory"
        }))
        .unwrap();
        assert!(args.context.is_none());
        assert!(args.task_id.is_none());
    }
}
