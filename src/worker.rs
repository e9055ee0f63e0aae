//! Worker runtime: a fixed pool of pollers that claim jobs, enforce
//! concurrency slots, drive registered task functions with retry and
//! cancellation, and keep linked task records honest.
//!
//! Task functions are registered by name; the queue persists only
//! `(name, args)`. Perpetual registrations are seeded on startup and
//! re-enqueued after every completion so a singleton loop (combined with a
//! sentinel concurrency key) stays scheduled while any worker is alive.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{SreError, SreResult};
use crate::queue::{JobEnvelope, RetryPolicy, SubmitOptions, TaskQueue};
use crate::tasks::{TaskManager, TaskStatus};

/// Execution context handed to every task function invocation.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Cooperative cancellation; checked at every suspension point
    pub cancel: CancellationToken,
}

pub type TaskFuture = BoxFuture<'static, SreResult<Value>>;
pub type TaskFn = Arc<dyn Fn(TaskContext, Value) -> TaskFuture + Send + Sync>;

/// Perpetual declaration: the runtime keeps one instance scheduled at
/// `every` cadence while a worker is running.
#[derive(Debug, Clone)]
pub struct Perpetual {
    pub every: Duration,
    pub automatic: bool,
}

/// A named task function plus its execution defaults.
#[derive(Clone)]
pub struct Registration {
    pub name: String,
    handler: TaskFn,
    pub retry: RetryPolicy,
    pub concurrency_key: Option<String>,
    pub max_concurrent: u32,
    pub perpetual: Option<Perpetual>,
}

impl Registration {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TaskContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SreResult<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(move |ctx, args| handler(ctx, args).boxed()),
            retry: RetryPolicy::default(),
            concurrency_key: None,
            max_concurrent: 1,
            perpetual: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Default concurrency applied to perpetual re-enqueues.
    pub fn with_concurrency(mut self, key: impl Into<String>, max_concurrent: u32) -> Self {
        self.concurrency_key = Some(key.into());
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn perpetual(mut self, every: Duration, automatic: bool) -> Self {
        self.perpetual = Some(Perpetual { every, automatic });
        self
    }

    pub fn invoke(&self, ctx: TaskContext, args: Value) -> TaskFuture {
        (self.handler)(ctx, args)
    }
}

/// Immutable registry of task functions, built once at composition time.
#[derive(Default)]
pub struct TaskRegistry {
    entries: HashMap<String, Registration>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: Registration) {
        if self
            .entries
            .insert(registration.name.clone(), registration)
            .is_some()
        {
            warn!("task function registered twice, keeping the later registration");
        }
    }

    pub fn get(&self, name: &str) -> Option<&Registration> {
        self.entries.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    fn automatic_perpetuals(&self) -> impl Iterator<Item = &Registration> {
        self.entries
            .values()
            .filter(|r| r.perpetual.as_ref().is_some_and(|p| p.automatic))
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: Uuid,
    /// Number of concurrent executor loops
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub reap_interval_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            concurrency: 2,
            poll_interval_ms: 1000,
            reap_interval_secs: 60,
            shutdown_grace_secs: 30,
        }
    }
}

/// Counters mirrored into logs; useful for tests and health endpoints.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
}

/// The worker runtime. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Worker {
    config: WorkerConfig,
    queue: Arc<TaskQueue>,
    registry: Arc<TaskRegistry>,
    tasks: TaskManager,
    stats: Arc<Mutex<WorkerStats>>,
    /// Stops the poll loops
    shutdown: CancellationToken,
    /// Parent of every per-job cancellation token
    cancel_root: CancellationToken,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<TaskQueue>,
        registry: Arc<TaskRegistry>,
        tasks: TaskManager,
    ) -> Self {
        Self {
            config,
            queue,
            registry,
            tasks,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            shutdown: CancellationToken::new(),
            cancel_root: CancellationToken::new(),
        }
    }

    pub async fn stats(&self) -> WorkerStats {
        self.stats.lock().await.clone()
    }

    /// Stop polling, wait out the grace period, then cancel in-flight jobs.
    pub async fn stop(&self) {
        info!(worker_id = %self.config.worker_id, "worker shutdown requested");
        self.shutdown.cancel();
        tokio::time::sleep(Duration::from_secs(self.config.shutdown_grace_secs)).await;
        self.cancel_root.cancel();
    }

    /// Run until shutdown: reap stale claims, seed perpetual tasks, then
    /// drive the promoter, reaper, and executor loops.
    pub async fn run(&self) -> SreResult<()> {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            functions = ?self.registry.names(),
            "starting worker"
        );

        if let Err(e) = self.queue.reap_stale_claims().await {
            warn!(error = %e, "startup reap failed");
        }
        self.seed_perpetuals().await;

        let mut handles = Vec::new();
        handles.push(tokio::spawn(self.clone().promoter_loop()));
        handles.push(tokio::spawn(self.clone().reaper_loop()));
        for slot in 0..self.config.concurrency.max(1) {
            handles.push(tokio::spawn(self.clone().executor_loop(slot)));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker loop panicked");
            }
        }
        info!(worker_id = %self.config.worker_id, "worker stopped");
        Ok(())
    }

    /// Ensure every automatic perpetual function has an instance scheduled.
    /// The dedup token keeps multiple workers from double-seeding.
    async fn seed_perpetuals(&self) {
        for registration in self.registry.automatic_perpetuals() {
            let options = SubmitOptions {
                dedup_key: Some(format!("perpetual_{}", registration.name)),
                concurrency_key: registration.concurrency_key.clone(),
                max_concurrent: registration.max_concurrent,
                retry: Some(registration.retry.clone()),
                ..SubmitOptions::default()
            };
            match self.queue.submit(&registration.name, json!({}), options).await {
                Ok(outcome) if outcome.was_submitted() => {
                    info!(function = %registration.name, "seeded perpetual task");
                }
                Ok(_) => {
                    debug!(function = %registration.name, "perpetual already seeded");
                }
                Err(e) => {
                    warn!(function = %registration.name, error = %e, "perpetual seeding failed");
                }
            }
        }
    }

    async fn promoter_loop(self) {
        let mut ticker = interval(Duration::from_millis(self.config.poll_interval_ms));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.queue.promote_scheduled().await {
                        error!(error = %e, "failed to promote scheduled jobs");
                    }
                }
            }
        }
    }

    async fn reaper_loop(self) {
        let mut ticker = interval(Duration::from_secs(self.config.reap_interval_secs));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.queue.reap_stale_claims().await {
                        error!(error = %e, "stale-claim reap failed");
                    }
                }
            }
        }
    }

    async fn executor_loop(self, slot: usize) {
        debug!(slot, "executor loop started");
        let mut ticker = interval(Duration::from_millis(self.config.poll_interval_ms));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.queue.pop_ready().await {
                        Ok(Some(envelope)) => self.execute(envelope).await,
                        Ok(None) => {}
                        Err(e) => error!(error = %e, "queue poll failed"),
                    }
                }
            }
        }
        debug!(slot, "executor loop stopped");
    }

    /// Run one claimed job through its full lifecycle.
    async fn execute(&self, mut envelope: JobEnvelope) {
        let registration = match self.registry.get(&envelope.fn_name) {
            Some(r) => r.clone(),
            None => {
                let err = SreError::UnknownTaskFunction {
                    name: envelope.fn_name.clone(),
                };
                error!(job_id = %envelope.id, function = %envelope.fn_name, "no such task function");
                self.finish_failed(&envelope, &err).await;
                return;
            }
        };

        // Concurrency slot; on contention, hand the job back with a short delay.
        if let Some(key) = envelope.concurrency_key.clone() {
            match self
                .queue
                .acquire_slot(&key, envelope.max_concurrent, &envelope.id)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = %envelope.id, concurrency_key = %key, "slot contended, delaying");
                    if let Err(e) = self.queue.requeue_with_delay(&envelope, 2).await {
                        error!(error = %e, "failed to requeue contended job");
                    }
                    return;
                }
                Err(e) => {
                    error!(error = %e, "slot acquisition failed");
                    let _ = self.queue.requeue_with_delay(&envelope, 2).await;
                    return;
                }
            }
        }

        envelope.attempt += 1;
        let attempt = envelope.attempt;
        self.mark_linked_task(&envelope, TaskStatus::InProgress).await;

        let ctx = TaskContext {
            job_id: envelope.id.clone(),
            attempt,
            cancel: self.cancel_root.child_token(),
        };
        let cancel = ctx.cancel.clone();
        let max_runtime = Duration::from_secs(self.queue.config().max_task_runtime_secs);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(SreError::Cancelled),
            run = tokio::time::timeout(max_runtime, registration.invoke(ctx, envelope.args.clone())) => {
                match run {
                    Ok(result) => result,
                    Err(_) => Err(SreError::timeout(format!(
                        "task {} exceeded {}s",
                        envelope.fn_name,
                        max_runtime.as_secs()
                    ))),
                }
            }
        };

        {
            let mut stats = self.stats.lock().await;
            stats.processed += 1;
        }

        match outcome {
            Ok(value) => {
                if let Some(task_id) = &envelope.task_id {
                    if let Err(e) = self.tasks.set_task_result(task_id, &value).await {
                        error!(task_id, error = %e, "failed to persist task result");
                    }
                    self.mark_linked_task(&envelope, TaskStatus::Done).await;
                }
                if let Err(e) = self.queue.complete_job(&envelope.id).await {
                    error!(error = %e, "failed to complete job");
                }
                self.release(&envelope).await;
                self.stats.lock().await.succeeded += 1;
                info!(job_id = %envelope.id, function = %envelope.fn_name, attempt, "job completed");
                self.reenqueue_perpetual(&registration).await;
            }
            Err(SreError::Cancelled) => {
                warn!(job_id = %envelope.id, function = %envelope.fn_name, "job cancelled");
                if let Some(task_id) = &envelope.task_id {
                    self.mark_linked_task(&envelope, TaskStatus::Cancelled).await;
                    let _ = self
                        .tasks
                        .add_task_update(task_id, "Task cancelled", "cancelled", None)
                        .await;
                }
                let _ = self.queue.complete_job(&envelope.id).await;
                self.release(&envelope).await;
                self.stats.lock().await.cancelled += 1;
            }
            Err(e) => {
                let retryable = e.is_retryable() && attempt < envelope.retry.attempts;
                error!(
                    job_id = %envelope.id,
                    function = %envelope.fn_name,
                    attempt,
                    retryable,
                    error = %e,
                    "job failed"
                );
                if retryable {
                    let delay = envelope.retry.delay_for(attempt);
                    if let Some(task_id) = &envelope.task_id {
                        let _ = self
                            .tasks
                            .add_task_update(
                                task_id,
                                &format!("Attempt {attempt} failed, retrying in {delay}s: {e}"),
                                "retry",
                                None,
                            )
                            .await;
                    }
                    if let Err(re) = self.queue.requeue_with_delay(&envelope, delay).await {
                        error!(error = %re, "failed to requeue job for retry");
                        self.finish_failed(&envelope, &e).await;
                    } else {
                        self.stats.lock().await.retried += 1;
                    }
                    self.release(&envelope).await;
                } else {
                    self.finish_failed(&envelope, &e).await;
                    self.release(&envelope).await;
                    self.reenqueue_perpetual(&registration).await;
                }
            }
        }
    }

    async fn finish_failed(&self, envelope: &JobEnvelope, error: &SreError) {
        if let Some(task_id) = &envelope.task_id {
            if let Err(e) = self.tasks.set_task_error(task_id, &error.to_string()).await {
                warn!(task_id, error = %e, "failed to record task error");
            }
        }
        if let Err(e) = self.queue.fail_job(envelope, &error.to_string()).await {
            error!(error = %e, "failed to retire job");
        }
        self.stats.lock().await.failed += 1;
    }

    async fn release(&self, envelope: &JobEnvelope) {
        if let Some(key) = &envelope.concurrency_key {
            if let Err(e) = self.queue.release_slot(key, &envelope.id).await {
                warn!(error = %e, "failed to release concurrency slot");
            }
        }
    }

    /// Transition a linked task record, tolerating idempotent re-assertions.
    async fn mark_linked_task(&self, envelope: &JobEnvelope, status: TaskStatus) {
        let Some(task_id) = &envelope.task_id else {
            return;
        };
        match self.tasks.update_task_status(task_id, status).await {
            Ok(()) => {}
            Err(SreError::InvalidTransition { from, to }) => {
                debug!(task_id, from, to, "skipping task transition");
            }
            Err(e) => warn!(task_id, error = %e, "task status update failed"),
        }
    }

    /// Keep an automatic perpetual function scheduled at its cadence.
    async fn reenqueue_perpetual(&self, registration: &Registration) {
        let Some(perpetual) = &registration.perpetual else {
            return;
        };
        if !perpetual.automatic || self.shutdown.is_cancelled() {
            return;
        }
        let when = chrono::Utc::now()
            + chrono::Duration::seconds(perpetual.every.as_secs() as i64);
        let options = SubmitOptions {
            when: Some(when),
            concurrency_key: registration.concurrency_key.clone(),
            max_concurrent: registration.max_concurrent,
            retry: Some(registration.retry.clone()),
            ..SubmitOptions::default()
        };
        if let Err(e) = self
            .queue
            .submit(&registration.name, json!({}), options)
            .await
        {
            error!(function = %registration.name, error = %e, "perpetual re-enqueue failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_registration(name: &str) -> Registration {
        Registration::new(name, |_ctx, _args| async { Ok(json!({"ok": true})) })
    }

    #[test]
    fn registry_resolves_by_name() {
        let mut registry = TaskRegistry::new();
        registry.register(noop_registration("scheduler_tick"));
        registry.register(
            noop_registration("process_agent_turn")
                .with_retry(RetryPolicy::new(3, 5)),
        );
        assert!(registry.get("scheduler_tick").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(
            registry.get("process_agent_turn").unwrap().retry.attempts,
            3
        );
    }

    #[test]
    fn automatic_perpetuals_are_discoverable() {
        let mut registry = TaskRegistry::new();
        registry.register(
            noop_registration("scheduler_tick")
                .with_concurrency("sentinel", 1)
                .perpetual(Duration::from_secs(30), true),
        );
        registry.register(noop_registration("one_shot"));
        let names: Vec<_> = registry
            .automatic_perpetuals()
            .map(|r| r.name.clone())
            .collect();
        assert_eq!(names, vec!["scheduler_tick".to_string()]);
    }

    #[tokio::test]
    async fn registered_handler_executes() {
        let registration = Registration::new("echo", |ctx, args| async move {
            Ok(json!({"attempt": ctx.attempt, "args": args}))
        });
        let ctx = TaskContext {
            job_id: "j1".into(),
            attempt: 2,
            cancel: CancellationToken::new(),
        };
        let value = registration.invoke(ctx, json!({"x": 1})).await.unwrap();
        assert_eq!(value["attempt"], 2);
        assert_eq!(value["args"]["x"], 1);
    }
}
