//! `sre` command-line surface: thread/task administration, index
//! maintenance, schedule triggers, and one-shot queries submitted through
//! the task queue.
//!
//! Exit codes: 0 success, 1 generic failure, 2 not-found.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use redis::aio::ConnectionManager;
use serde_json::{Map, Value};

use crate::agent::create_agent_task;
use crate::config::Settings;
use crate::error::{SreError, SreResult};
use crate::instances::{InstanceResolver, RedisInstanceResolver};
use crate::queue::{TaskQueue, TaskQueueConfig};
use crate::router::AgentKind;
use crate::scheduler::{ScheduleStore, SchedulerService};
use crate::search::{IndexName, SearchIndexes};
use crate::tasks::{ListTasks, TaskManager, TaskStatus};
use crate::threads::{derive_subject, iso_to_epoch, ListThreads, ThreadManager};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_NOT_FOUND: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "sre", about = "Redis SRE agent execution substrate", version)]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Thread administration
    Thread {
        #[command(subcommand)]
        command: ThreadCommand,
    },
    /// Task administration
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Search index administration
    Index {
        #[command(subcommand)]
        command: IndexCommand,
    },
    /// Submit a query as an agent turn and wait for the result
    Query(QueryArgs),
    /// Manually fan out one schedule
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },
    /// Scheduler controls
    Scheduler {
        #[command(subcommand)]
        command: SchedulerCommand,
    },
    /// Queue introspection
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    /// Show ready/scheduled/claimed depths
    Stats,
}

#[derive(Subcommand, Debug)]
pub enum ThreadCommand {
    /// List recent threads
    List {
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },
    /// Show one thread
    Get {
        thread_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Show knowledge sources cited in a thread
    Sources {
        thread_id: String,
        #[arg(long)]
        task_id: Option<String>,
    },
    /// Recreate the threads index and backfill docs from KV
    Reindex {
        #[arg(long)]
        drop: bool,
    },
    /// Re-project FT docs for all threads from primary KV
    Backfill,
    /// Seed empty subjects from each thread's original query
    BackfillEmptySubjects {
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete threads (and optionally their tasks) older than a window
    Purge {
        /// e.g. 7d, 24h, 3600s
        #[arg(long)]
        older_than: Option<String>,
        /// Purge ALL threads
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        include_tasks: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    /// List tasks (active by default)
    List {
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        status: Option<String>,
        /// Include terminal tasks
        #[arg(long)]
        all: bool,
        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },
    /// Show one task
    Get {
        task_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Delete tasks older than a window
    Purge {
        #[arg(long)]
        older_than: Option<String>,
        #[arg(long)]
        all: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum IndexCommand {
    /// List search indices present on the server
    List,
    /// Create any missing indices and report per-index status
    Ensure,
    /// Drop and re-create indices (document hashes survive)
    Recreate {
        /// One index name; all when omitted
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    /// The query text
    pub text: String,
    #[arg(long)]
    pub redis_instance_id: Option<String>,
    #[arg(long)]
    pub thread_id: Option<String>,
    /// auto|triage|chat|knowledge
    #[arg(long, default_value = "auto")]
    pub agent: String,
    /// Seconds to wait for a worker to finish the turn
    #[arg(long, default_value_t = 120)]
    pub timeout: u64,
}

#[derive(Subcommand, Debug)]
pub enum ScheduleCommand {
    /// Trigger one schedule immediately
    Trigger { schedule_id: String },
}

#[derive(Subcommand, Debug)]
pub enum SchedulerCommand {
    /// Enqueue one scheduler pass
    Trigger,
}

/// Parse durations like `7d`, `24h`, `90m`, `3600s`.
pub fn parse_duration(value: &str) -> SreResult<Duration> {
    let value = value.trim();
    let (number, unit) = value.split_at(value.len().saturating_sub(1));
    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        "w" => 604800,
        _ => {
            return Err(SreError::validation(format!(
                "invalid duration '{value}', expected e.g. 7d, 24h, 3600s"
            )))
        }
    };
    let amount: u64 = number
        .parse()
        .map_err(|_| SreError::validation(format!("invalid duration '{value}'")))?;
    Ok(Duration::from_secs(amount * multiplier))
}

struct App {
    threads: ThreadManager,
    tasks: TaskManager,
    queue: Arc<TaskQueue>,
    search: SearchIndexes,
    scheduler: SchedulerService,
    instances: RedisInstanceResolver,
}

async fn connect(settings: &Settings) -> SreResult<App> {
    let client = redis::Client::open(settings.effective_redis_url())?;
    let conn: ConnectionManager = client.get_connection_manager().await?;
    let search = SearchIndexes::new(conn.clone(), settings.vector_dim);
    let threads = ThreadManager::new(conn.clone(), search.clone());
    let tasks = TaskManager::new(conn.clone(), search.clone());
    let queue = Arc::new(TaskQueue::new(
        conn.clone(),
        TaskQueueConfig {
            queue_name: settings.task_queue_name.clone(),
            max_task_runtime_secs: settings.max_task_runtime_secs,
            ..TaskQueueConfig::default()
        },
    ));
    let scheduler = SchedulerService::new(
        ScheduleStore::new(conn.clone(), search.clone()),
        threads.clone(),
        queue.clone(),
    );
    let instances = RedisInstanceResolver::new(conn);
    Ok(App {
        threads,
        tasks,
        queue,
        search,
        scheduler,
        instances,
    })
}

/// Run the CLI and return the process exit code.
pub async fn run(cli: Cli) -> i32 {
    match dispatch(cli).await {
        Ok(code) => code,
        Err(SreError::NotFound { kind, id }) => {
            eprintln!("{kind} not found: {id}");
            EXIT_NOT_FOUND
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> SreResult<i32> {
    let app = connect(&cli.settings).await?;
    match cli.command {
        Command::Thread { command } => thread_command(&app, command).await,
        Command::Task { command } => task_command(&app, command).await,
        Command::Index { command } => index_command(&app, command).await,
        Command::Query(args) => query_command(&app, args).await,
        Command::Schedule { command } => match command {
            ScheduleCommand::Trigger { schedule_id } => {
                let outcome = app.scheduler.trigger_schedule(&schedule_id).await?;
                println!("triggered schedule {schedule_id}: job {}", outcome.job_id());
                Ok(EXIT_OK)
            }
        },
        Command::Scheduler { command } => match command {
            SchedulerCommand::Trigger => {
                let outcome = app.scheduler.trigger_scheduler().await?;
                println!("scheduler pass enqueued: job {}", outcome.job_id());
                Ok(EXIT_OK)
            }
        },
        Command::Queue { command } => match command {
            QueueCommand::Stats => {
                let (ready, scheduled, claimed) = app.queue.queue_depths().await?;
                println!("ready:     {ready}");
                println!("scheduled: {scheduled}");
                println!("claimed:   {claimed}");
                Ok(EXIT_OK)
            }
        },
    }
}

async fn thread_command(app: &App, command: ThreadCommand) -> SreResult<i32> {
    match command {
        ThreadCommand::List { user_id, limit } => {
            let summaries = app
                .threads
                .list_threads(&ListThreads {
                    user_id,
                    limit,
                    offset: 0,
                })
                .await?;
            for summary in &summaries {
                println!(
                    "{}  {:<40}  user={}  tags={}",
                    summary.thread_id,
                    summary.subject,
                    summary.user_id.as_deref().unwrap_or("-"),
                    summary.tags.join(",")
                );
            }
            println!("{} thread(s)", summaries.len());
            Ok(EXIT_OK)
        }
        ThreadCommand::Get { thread_id, json } => {
            let state = app
                .threads
                .get_thread(&thread_id)
                .await?
                .ok_or_else(|| SreError::not_found("thread", thread_id.clone()))?;
            if json {
                let doc = serde_json::json!({
                    "thread_id": state.thread_id,
                    "metadata": state.metadata,
                    "context": state.context,
                    "updates": state.updates,
                    "result": state.result,
                    "error": state.error_message,
                });
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                println!("thread:  {}", state.thread_id);
                println!(
                    "subject: {}",
                    state.metadata.subject.as_deref().unwrap_or("-")
                );
                println!(
                    "user:    {}",
                    state.metadata.user_id.as_deref().unwrap_or("-")
                );
                println!("updates: {}", state.updates.len());
                for update in state.updates.iter().rev().take(10).rev() {
                    println!("  [{}] {} {}", update.timestamp, update.update_type, update.message);
                }
                if let Some(error) = &state.error_message {
                    println!("error:   {error}");
                }
            }
            Ok(EXIT_OK)
        }
        ThreadCommand::Sources { thread_id, task_id } => {
            let state = app
                .threads
                .get_thread(&thread_id)
                .await?
                .ok_or_else(|| SreError::not_found("thread", thread_id.clone()))?;
            let mut count = 0;
            for update in &state.updates {
                if update.update_type != "knowledge_sources" {
                    continue;
                }
                if let Some(wanted) = &task_id {
                    let from_task = update
                        .metadata
                        .as_ref()
                        .and_then(|m| m.get("task_id"))
                        .and_then(Value::as_str);
                    if from_task != Some(wanted.as_str()) {
                        continue;
                    }
                }
                println!("[{}] {}", update.timestamp, update.message);
                count += 1;
            }
            println!("{count} source update(s)");
            Ok(EXIT_OK)
        }
        ThreadCommand::Reindex { drop } => {
            if drop {
                app.search.recreate_index(IndexName::Threads).await?;
            } else {
                app.search.ensure_index(IndexName::Threads).await?;
            }
            let processed = backfill_thread_docs(app).await?;
            println!("reindexed and backfilled {processed} thread doc(s)");
            Ok(EXIT_OK)
        }
        ThreadCommand::Backfill => {
            let processed = backfill_thread_docs(app).await?;
            println!("backfilled {processed} thread doc(s)");
            Ok(EXIT_OK)
        }
        ThreadCommand::BackfillEmptySubjects { dry_run } => {
            let mut seeded = 0;
            for thread_id in app.threads.all_thread_ids().await? {
                let Some(state) = app.threads.get_thread(&thread_id).await? else {
                    continue;
                };
                if state.metadata.subject.as_deref().is_some_and(|s| !s.is_empty()) {
                    continue;
                }
                let seed = state
                    .context
                    .get("original_query")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let Some(seed) = seed else { continue };
                let subject = derive_subject(&seed);
                if subject.is_empty() {
                    continue;
                }
                if dry_run {
                    println!("would set subject of {thread_id} to '{subject}'");
                } else {
                    app.threads.set_thread_subject(&thread_id, &subject).await?;
                }
                seeded += 1;
            }
            println!(
                "{} subject(s) {}",
                seeded,
                if dry_run { "would be seeded" } else { "seeded" }
            );
            Ok(EXIT_OK)
        }
        ThreadCommand::Purge {
            older_than,
            all,
            include_tasks,
            dry_run,
            yes,
        } => {
            if !all && older_than.is_none() {
                eprintln!("refusing to purge without a scope; provide --older-than or --all");
                return Ok(EXIT_FAILURE);
            }
            if !dry_run && !yes {
                eprintln!("pass -y to confirm the purge (or --dry-run to preview)");
                return Ok(EXIT_FAILURE);
            }
            let cutoff = match older_than {
                Some(window) => Some(Utc::now() - chrono::Duration::seconds(parse_duration(&window)?.as_secs() as i64)),
                None => None,
            };
            let (purged, tasks_purged) = purge_threads(app, cutoff, include_tasks, dry_run).await?;
            println!(
                "{} thread(s) and {} task(s) {}",
                purged,
                tasks_purged,
                if dry_run { "would be purged" } else { "purged" }
            );
            Ok(EXIT_OK)
        }
    }
}

async fn backfill_thread_docs(app: &App) -> SreResult<usize> {
    let mut processed = 0;
    for thread_id in app.threads.all_thread_ids().await? {
        if app.threads.upsert_thread_doc(&thread_id).await {
            processed += 1;
        }
    }
    Ok(processed)
}

async fn purge_threads(
    app: &App,
    cutoff: Option<DateTime<Utc>>,
    include_tasks: bool,
    dry_run: bool,
) -> SreResult<(usize, usize)> {
    let mut purged = 0;
    let mut tasks_purged = 0;
    for thread_id in app.threads.all_thread_ids().await? {
        let Some(state) = app.threads.get_thread(&thread_id).await? else {
            continue;
        };
        if let Some(cutoff) = cutoff {
            let created = iso_to_epoch(&state.metadata.created_at);
            if created >= cutoff.timestamp() as f64 {
                continue;
            }
        }
        let task_count = app.threads.thread_task_ids(&thread_id).await?.len();
        if dry_run {
            println!(
                "would purge thread {} ({} task(s))",
                thread_id, task_count
            );
        } else {
            app.threads.delete_thread(&thread_id, include_tasks).await?;
        }
        purged += 1;
        if include_tasks {
            tasks_purged += task_count;
        }
    }
    Ok((purged, tasks_purged))
}

async fn task_command(app: &App, command: TaskCommand) -> SreResult<i32> {
    match command {
        TaskCommand::List {
            user_id,
            status,
            all,
            limit,
        } => {
            let status = status.as_deref().map(TaskStatus::parse).transpose()?;
            let summaries = app
                .tasks
                .list_tasks(&ListTasks {
                    user_id,
                    status,
                    show_all: all,
                    limit,
                })
                .await?;
            for summary in &summaries {
                println!(
                    "{}  {:<12}  {:<40}  thread={}",
                    summary.task_id,
                    summary.status,
                    summary.subject,
                    summary.thread_id.as_deref().unwrap_or("-")
                );
            }
            println!("{} task(s)", summaries.len());
            Ok(EXIT_OK)
        }
        TaskCommand::Get { task_id, json } => {
            let state = app
                .tasks
                .get_task_state(&task_id)
                .await?
                .ok_or_else(|| SreError::not_found("task", task_id.clone()))?;
            if json {
                let doc = serde_json::json!({
                    "task_id": state.task_id,
                    "thread_id": state.thread_id,
                    "status": state.status,
                    "updates": state.updates,
                    "result": state.result,
                    "error_message": state.error_message,
                    "metadata": state.metadata,
                });
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                println!("task:   {}", state.task_id);
                println!("thread: {}", state.thread_id);
                println!("status: {}", state.status);
                for update in &state.updates {
                    println!("  [{}] {} {}", update.timestamp, update.update_type, update.message);
                }
                if let Some(result) = &state.result {
                    println!("result: {}", serde_json::to_string_pretty(result)?);
                }
                if let Some(error) = &state.error_message {
                    println!("error:  {error}");
                }
            }
            Ok(EXIT_OK)
        }
        TaskCommand::Purge {
            older_than,
            all,
            dry_run,
            yes,
        } => {
            if !all && older_than.is_none() {
                eprintln!("refusing to purge without a scope; provide --older-than or --all");
                return Ok(EXIT_FAILURE);
            }
            if !dry_run && !yes {
                eprintln!("pass -y to confirm the purge (or --dry-run to preview)");
                return Ok(EXIT_FAILURE);
            }
            let cutoff = match older_than {
                Some(window) => Some(Utc::now() - chrono::Duration::seconds(parse_duration(&window)?.as_secs() as i64)),
                None => None,
            };
            let mut purged = 0;
            for thread_id in app.threads.all_thread_ids().await? {
                for task_id in app.threads.thread_task_ids(&thread_id).await? {
                    let Some(state) = app.tasks.get_task_state(&task_id).await? else {
                        continue;
                    };
                    if let Some(cutoff) = cutoff {
                        if iso_to_epoch(&state.metadata.created_at) >= cutoff.timestamp() as f64 {
                            continue;
                        }
                    }
                    if dry_run {
                        println!("would purge task {task_id}");
                    } else {
                        app.tasks.delete_task(&task_id).await?;
                    }
                    purged += 1;
                }
            }
            println!(
                "{} task(s) {}",
                purged,
                if dry_run { "would be purged" } else { "purged" }
            );
            Ok(EXIT_OK)
        }
    }
}

async fn index_command(app: &App, command: IndexCommand) -> SreResult<i32> {
    match command {
        IndexCommand::List => {
            let present = app.search.list_indices().await?;
            for index in IndexName::ALL {
                let status = if present.iter().any(|p| p == index.as_str()) {
                    "present"
                } else {
                    "missing"
                };
                println!("{:<16} {status}", index.as_str());
            }
            Ok(EXIT_OK)
        }
        IndexCommand::Ensure => {
            let mut degraded = false;
            for (name, ok) in app.search.ensure_all().await {
                println!("{:<16} {}", name, if ok { "ok" } else { "FAILED" });
                degraded |= !ok;
            }
            Ok(if degraded { EXIT_FAILURE } else { EXIT_OK })
        }
        IndexCommand::Recreate { name } => {
            match name {
                Some(name) => {
                    let index = IndexName::parse(&name)
                        .ok_or_else(|| SreError::not_found("index", name.clone()))?;
                    app.search.recreate_index(index).await?;
                    println!("recreated index {name}");
                }
                None => {
                    for index in IndexName::ALL {
                        app.search.recreate_index(index).await?;
                    }
                    println!("recreated all indices");
                }
            }
            Ok(EXIT_OK)
        }
    }
}

async fn query_command(app: &App, args: QueryArgs) -> SreResult<i32> {
    // Resolve references up front so bad ids exit 2 before any submission.
    if let Some(thread_id) = &args.thread_id {
        if app.threads.get_thread(thread_id).await?.is_none() {
            return Err(SreError::not_found("thread", thread_id.clone()));
        }
    }
    let mut context = Map::new();
    if let Some(instance_id) = &args.redis_instance_id {
        if app.instances.get_by_id(instance_id).await?.is_none() {
            return Err(SreError::not_found("instance", instance_id.clone()));
        }
        context.insert("instance_id".into(), Value::String(instance_id.clone()));
    }
    if args.agent != "auto" {
        let kind = AgentKind::parse(&args.agent).ok_or_else(|| {
            SreError::validation(format!(
                "invalid --agent '{}', expected auto|triage|chat|knowledge",
                args.agent
            ))
        })?;
        context.insert(
            "preferred_agent".into(),
            Value::String(kind.as_str().to_string()),
        );
    }

    let response = create_agent_task(
        &app.threads,
        &app.tasks,
        &app.queue,
        &args.text,
        args.thread_id.clone(),
        if context.is_empty() { None } else { Some(context) },
        None,
    )
    .await?;
    println!(
        "submitted task {} on thread {}",
        response.task_id, response.thread_id
    );

    // Poll until a worker finishes the turn.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout);
    let mut seen_updates = 0;
    loop {
        if tokio::time::Instant::now() >= deadline {
            eprintln!("timed out waiting for the turn to complete");
            return Ok(EXIT_FAILURE);
        }
        let Some(state) = app.tasks.get_task_state(&response.task_id).await? else {
            return Err(SreError::not_found("task", response.task_id.clone()));
        };
        for update in state.updates.iter().skip(seen_updates) {
            println!("  [{}] {}", update.update_type, update.message);
        }
        seen_updates = state.updates.len();
        match state.status {
            TaskStatus::Done => {
                if let Some(result) = &state.result {
                    let text = result
                        .get("response")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    println!("\n{text}");
                }
                return Ok(EXIT_OK);
            }
            TaskStatus::Failed => {
                eprintln!(
                    "turn failed: {}",
                    state.error_message.as_deref().unwrap_or("unknown error")
                );
                return Ok(EXIT_FAILURE);
            }
            TaskStatus::Cancelled => {
                eprintln!("turn was cancelled");
                return Ok(EXIT_FAILURE);
            }
            TaskStatus::Queued | TaskStatus::InProgress => {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_all_units() {
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604800));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("90m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("3600s").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2w").unwrap(), Duration::from_secs(1209600));
    }

    #[test]
    fn invalid_durations_are_rejected() {
        assert!(parse_duration("7").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("d7").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn cli_parses_query_with_flags() {
        let cli = Cli::try_parse_from([
            "sre",
            "query",
            "check redis memory",
            "--redis-instance-id",
            "inst-1",
            "--agent",
            "triage",
        ])
        .unwrap();
        match cli.command {
            Command::Query(args) => {
                assert_eq!(args.text, "check redis memory");
                assert_eq!(args.redis_instance_id.as_deref(), Some("inst-1"));
                assert_eq!(args.agent, "triage");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_parses_thread_purge_flags() {
        let cli = Cli::try_parse_from([
            "sre",
            "thread",
            "purge",
            "--older-than",
            "7d",
            "--include-tasks",
            "true",
            "-y",
        ])
        .unwrap();
        match cli.command {
            Command::Thread {
                command:
                    ThreadCommand::Purge {
                        older_than,
                        include_tasks,
                        yes,
                        ..
                    },
            } => {
                assert_eq!(older_than.as_deref(), Some("7d"));
                assert!(include_tasks);
                assert!(yes);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
