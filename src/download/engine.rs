//! Worker-pool transfer engine.
//!
//! The engine owns the run lifecycle: tasks are submitted against the
//! persisted status document (skipping artifacts that are already complete
//! and validated), then a bounded pool of workers drains the queue, driving
//! each task through [`TransferExecutor`](super::transfer::TransferExecutor)
//! attempts under the shared [`RetryPolicy`]. One task's failure never aborts
//! the run; the caller gets a [`RunSummary`] of terminal states.
//!
//! All shared state lives in one explicit [`EngineContext`]; there are no
//! module-level globals, so two engines in one process cannot interfere.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use coursegrab_core::{
//!     ContentCategory, DownloadEngine, DownloadTask, EngineConfig, EngineContext, NullSink,
//!     ResolverRegistry, StatusStore,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::default();
//! let store = StatusStore::open("status.json", config.flush_interval, config.flush_bytes)?;
//! let ctx = Arc::new(EngineContext::new(
//!     config,
//!     store,
//!     ResolverRegistry::new(),
//!     Arc::new(NullSink),
//! ));
//!
//! let engine = DownloadEngine::new(ctx)?;
//! engine
//!     .submit(vec![DownloadTask::new(
//!         "lesson-1",
//!         "https://example.com/lesson-1.mp4",
//!         "/courses/lesson-1.mp4",
//!         ContentCategory::Video,
//!     )])
//!     .await?;
//! let summary = engine.run().await;
//! println!("completed: {}", summary.completed);
//! # Ok(())
//! # }
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::events::{ProgressSink, TransferEvent};
use crate::resolver::ResolverRegistry;
use crate::status::{ResumeRecord, StatusStore, StoreError, TransferStatus};
use crate::task::DownloadTask;

use super::rate_limiter::RateLimiter;
use super::retry::{RetryDecision, RetryPolicy, classify_error, parse_retry_after};
use super::transfer::{AttemptOutcome, TransferExecutor};
use super::validator::Validator;
use super::{DownloadError, HttpClient};

/// Errors surfaced by engine setup and task submission.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    /// A submission contained the same task id twice.
    #[error("duplicate task id in submission: {id}")]
    DuplicateTaskId {
        /// The offending task id.
        id: String,
    },

    /// Status persistence failed during submission.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Shared state for one engine run.
///
/// Constructed once and handed to the engine behind an `Arc`; workers reach
/// every shared resource through it. The stop flag is the cooperative
/// cancellation signal: setting it makes workers stop dequeuing, in-flight
/// transfers pause at the next chunk boundary, and backoff waits wake
/// immediately instead of sleeping out their delay.
pub struct EngineContext {
    /// Validated engine configuration.
    pub config: EngineConfig,
    /// Category-keyed URL resolvers.
    pub resolvers: ResolverRegistry,
    /// Aggregate throughput ceiling shared by all workers.
    pub rate_limiter: RateLimiter,
    /// Post-transfer integrity checks.
    pub validator: Validator,
    /// Receiver for transition and progress events.
    pub sink: Arc<dyn ProgressSink>,
    store: Mutex<StatusStore>,
    stop: watch::Sender<bool>,
}

impl EngineContext {
    /// Builds a context from its parts; limiter and validator derive from
    /// the configuration.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        store: StatusStore,
        resolvers: ResolverRegistry,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        let rate_limiter = RateLimiter::from_config(config.rate_limit);
        let validator = Validator::new(config.validate_downloads);
        let (stop, _) = watch::channel(false);
        Self {
            config,
            resolvers,
            rate_limiter,
            validator,
            sink,
            store: Mutex::new(store),
            stop,
        }
    }

    /// Requests cooperative cancellation of the current run.
    ///
    /// Workers currently sleeping (backoff, start delay) wake immediately.
    pub fn request_stop(&self) {
        info!("stop requested");
        self.stop.send_replace(true);
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Waits up to `delay`, returning early if a stop request arrives.
    ///
    /// Returns whether a stop was requested. Retry backoff and start delays
    /// use this instead of a plain sleep so cancellation latency stays
    /// bounded even mid-wait.
    pub async fn stop_requested_within(&self, delay: Duration) -> bool {
        let mut stop_rx = self.stop.subscribe();
        if *stop_rx.borrow() {
            return true;
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => self.stop_requested(),
            _ = stop_rx.changed() => true,
        }
    }

    /// Locks the status store.
    ///
    /// A poisoned lock yields the inner guard: the store's on-disk protocol
    /// keeps the document consistent even if a worker panicked mid-update.
    pub fn lock_store(&self) -> MutexGuard<'_, StatusStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a record mutation, logging (not propagating) flush failures.
    ///
    /// Persistence failures degrade resume guarantees; the run continues on
    /// the in-memory state.
    fn update_record<F>(&self, task_id: &str, mutate: F)
    where
        F: FnOnce(&mut ResumeRecord),
    {
        if let Err(error) = self.lock_store().update(task_id, mutate) {
            warn!(task_id, error = %error, "status flush failed, continuing in memory");
        }
    }

    /// Emits a transition event carrying the record's current byte counts.
    fn emit_transition(&self, task_id: &str, status: TransferStatus) {
        let (bytes, total) = {
            let store = self.lock_store();
            store
                .get(task_id)
                .map_or((0, None), |r| (r.bytes_downloaded, r.total_bytes))
        };
        self.sink
            .emit(TransferEvent::now(task_id, status, bytes, total));
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("resolvers", &self.resolvers)
            .field("stop_requested", &self.stop_requested())
            .finish_non_exhaustive()
    }
}

/// Priority queue of pending tasks with single-lock dequeue.
///
/// Higher `priority` dequeues first; ties preserve submission order (stable
/// sort at enqueue time). Dequeue takes one lock and removes one task, so a
/// task is handed to exactly one worker.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<DownloadTask>>,
}

impl TaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a batch, re-sorting the whole queue by priority.
    pub fn push_all(&self, batch: Vec<DownloadTask>) {
        let mut tasks = self.lock();
        tasks.extend(batch);
        let mut sorted: Vec<DownloadTask> = std::mem::take(&mut *tasks).into();
        sorted.sort_by_key(|t| std::cmp::Reverse(t.priority));
        *tasks = sorted.into();
    }

    /// Removes and returns the highest-priority pending task.
    #[must_use]
    pub fn pop(&self) -> Option<DownloadTask> {
        self.lock().pop_front()
    }

    /// Returns the number of pending tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no tasks are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DownloadTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One task that ended the run in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTask {
    /// The task id.
    pub task_id: String,
    /// The last error observed for the task.
    pub error: String,
}

/// Terminal-state counts for one engine run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Tasks that streamed fully and validated.
    pub completed: usize,
    /// Tasks that exhausted retries or hit a non-retryable error.
    pub failed: usize,
    /// Tasks paused by cooperative cancellation.
    pub paused: usize,
    /// Tasks skipped at submission because a validated artifact existed.
    pub skipped: usize,
    /// Failed tasks with their last error, for reporting.
    pub failures: Vec<FailedTask>,
}

impl RunSummary {
    /// Total tasks accounted for by this summary.
    #[must_use]
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.paused + self.skipped
    }

    /// Returns true if nothing failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Parallel transfer engine: bounded workers over a shared task queue.
#[derive(Debug)]
pub struct DownloadEngine {
    ctx: Arc<EngineContext>,
    queue: Arc<TaskQueue>,
    client: HttpClient,
    policy: RetryPolicy,
    skipped: AtomicUsize,
}

impl DownloadEngine {
    /// Creates an engine over a shared context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the configuration is out of range,
    /// or [`EngineError::Client`] if the HTTP client cannot be built.
    pub fn new(ctx: Arc<EngineContext>) -> Result<Self, EngineError> {
        ctx.config.validate()?;
        let client = HttpClient::new(ctx.config.connect_timeout, ctx.config.read_timeout)?;
        let policy = RetryPolicy::with_max_attempts(ctx.config.retry_attempts);
        Ok(Self {
            ctx,
            queue: Arc::new(TaskQueue::new()),
            client,
            policy,
            skipped: AtomicUsize::new(0),
        })
    }

    /// Returns the shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Submits a batch of tasks, returning how many were enqueued.
    ///
    /// Per task: a prior `Completed` record whose artifact still validates is
    /// marked `Skipped` with zero network activity; anything else is enqueued
    /// as `Queued`. A stale `InProgress` or `Paused` record from a previous
    /// process keeps its attempt count; a resubmitted `Failed` task gets a
    /// fresh budget.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateTaskId`] if the batch repeats an id.
    /// Persistence failures during submission propagate as
    /// [`EngineError::Store`].
    #[instrument(skip(self, tasks), fields(task_count = tasks.len()))]
    pub async fn submit(&self, tasks: Vec<DownloadTask>) -> Result<usize, EngineError> {
        let mut seen = HashSet::new();
        for task in &tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(EngineError::DuplicateTaskId {
                    id: task.id.clone(),
                });
            }
        }

        let mut to_enqueue = Vec::with_capacity(tasks.len());
        for task in tasks {
            let prior = self.ctx.lock_store().get(&task.id).cloned();

            if let Some(record) = &prior {
                if self.ctx.validator.can_skip(&task, record).await {
                    debug!(task_id = %task.id, "prior artifact validated, skipping");
                    self.ctx.lock_store().update(&task.id, |r| {
                        r.status = TransferStatus::Skipped;
                    })?;
                    self.ctx.emit_transition(&task.id, TransferStatus::Skipped);
                    self.skipped.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
            }

            self.ctx.lock_store().update(&task.id, |r| {
                if r.status == TransferStatus::Failed {
                    // Resubmission of a failed task grants a fresh budget.
                    r.attempt_count = 0;
                    r.last_error = None;
                }
                r.status = TransferStatus::Queued;
            })?;
            self.ctx.emit_transition(&task.id, TransferStatus::Queued);
            to_enqueue.push(task);
        }

        let enqueued = to_enqueue.len();
        self.queue.push_all(to_enqueue);
        info!(
            enqueued,
            skipped = self.skipped.load(Ordering::SeqCst),
            "submission complete"
        );
        Ok(enqueued)
    }

    /// Removes status records not referenced by the given live task ids.
    ///
    /// # Errors
    ///
    /// Propagates the store's flush error.
    pub fn purge_unreferenced(&self, live_ids: &[&str]) -> Result<usize, EngineError> {
        Ok(self.ctx.lock_store().purge(live_ids)?)
    }

    /// Drains the queue with the configured number of workers.
    ///
    /// Returns when every submitted task reached a terminal state or the
    /// stop flag emptied the pool. Worker panics are logged and the run
    /// continues with the remaining workers.
    #[instrument(skip(self))]
    pub async fn run(&self) -> RunSummary {
        let summary = Arc::new(Mutex::new(RunSummary {
            skipped: self.skipped.swap(0, Ordering::SeqCst),
            ..RunSummary::default()
        }));

        let worker_count = self.ctx.config.concurrency;
        info!(worker_count, pending = self.queue.len(), "starting run");

        let handles: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|worker_id| {
                let ctx = Arc::clone(&self.ctx);
                let queue = Arc::clone(&self.queue);
                let summary = Arc::clone(&summary);
                let executor = TransferExecutor::new(Arc::clone(&self.ctx), self.client.clone());
                let policy = self.policy.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, &ctx, &queue, &executor, &policy, &summary).await;
                })
            })
            .collect();

        for handle in handles {
            if let Err(error) = handle.await {
                warn!(error = %error, "worker terminated abnormally");
            }
        }

        let summary = summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        info!(
            completed = summary.completed,
            failed = summary.failed,
            paused = summary.paused,
            skipped = summary.skipped,
            "run finished"
        );
        summary
    }
}

/// Dequeue-process loop for one worker.
#[instrument(skip(ctx, queue, executor, policy, summary))]
async fn worker_loop(
    worker_id: usize,
    ctx: &EngineContext,
    queue: &TaskQueue,
    executor: &TransferExecutor,
    policy: &RetryPolicy,
    summary: &Mutex<RunSummary>,
) {
    loop {
        if ctx.stop_requested() {
            debug!("stop flag set, worker exiting");
            break;
        }
        let Some(task) = queue.pop() else {
            debug!("queue drained, worker exiting");
            break;
        };

        if !ctx.config.start_delay.is_zero()
            && ctx.stop_requested_within(ctx.config.start_delay).await
        {
            debug!("stop flag set during start delay, worker exiting");
            queue.push_all(vec![task]);
            break;
        }

        let (status, error) = process_task(ctx, executor, policy, &task).await;

        let mut summary = summary.lock().unwrap_or_else(PoisonError::into_inner);
        match status {
            TransferStatus::Completed => summary.completed += 1,
            TransferStatus::Paused => summary.paused += 1,
            TransferStatus::Failed => {
                summary.failed += 1;
                summary.failures.push(FailedTask {
                    task_id: task.id.clone(),
                    error: error.unwrap_or_default(),
                });
            }
            // process_task only returns terminal states.
            TransferStatus::Queued | TransferStatus::InProgress | TransferStatus::Skipped => {}
        }
    }
}

/// Drives one task through attempts until it reaches a terminal state.
#[instrument(skip_all, fields(task_id = %task.id))]
async fn process_task(
    ctx: &EngineContext,
    executor: &TransferExecutor,
    policy: &RetryPolicy,
    task: &DownloadTask,
) -> (TransferStatus, Option<String>) {
    ctx.update_record(&task.id, |r| r.status = TransferStatus::InProgress);
    ctx.emit_transition(&task.id, TransferStatus::InProgress);

    let mut force_restart = false;
    loop {
        // The attempt is persisted before it runs, so a crash mid-attempt
        // still counts against the budget after restart.
        let attempt = {
            let prior = ctx
                .lock_store()
                .get(&task.id)
                .map_or(0, |r| r.attempt_count);
            prior + 1
        };
        ctx.update_record(&task.id, |r| r.attempt_count = attempt);
        debug!(attempt, force_restart, "starting attempt");

        match executor.attempt(task, force_restart).await {
            AttemptOutcome::Completed {
                bytes,
                total,
                checksum,
            } => {
                ctx.update_record(&task.id, |r| {
                    r.status = TransferStatus::Completed;
                    r.bytes_downloaded = bytes;
                    r.total_bytes = total;
                    r.checksum = checksum.clone();
                    r.last_error = None;
                });
                ctx.emit_transition(&task.id, TransferStatus::Completed);
                info!(bytes, "task completed");
                return (TransferStatus::Completed, None);
            }

            AttemptOutcome::Paused { bytes } => {
                ctx.update_record(&task.id, |r| {
                    r.status = TransferStatus::Paused;
                    r.bytes_downloaded = bytes;
                });
                ctx.emit_transition(&task.id, TransferStatus::Paused);
                info!(bytes, "task paused");
                return (TransferStatus::Paused, None);
            }

            AttemptOutcome::Fatal(error) => {
                let message = error.to_string();
                warn!(error = %message, "task failed (not retryable)");
                ctx.update_record(&task.id, |r| {
                    r.status = TransferStatus::Failed;
                    r.last_error = Some(message.clone());
                });
                ctx.emit_transition(&task.id, TransferStatus::Failed);
                return (TransferStatus::Failed, Some(message));
            }

            AttemptOutcome::Retryable(error) => {
                let failure = classify_error(&error);
                let message = error.to_string();
                ctx.update_record(&task.id, |r| r.last_error = Some(message.clone()));

                match policy.should_retry(failure, attempt) {
                    RetryDecision::Retry { delay, .. } => {
                        let delay = retry_after_override(&error).map_or(delay, |ra| ra.max(delay));
                        warn!(
                            attempt,
                            delay_ms = delay.as_millis(),
                            error = %message,
                            "attempt failed, retrying"
                        );
                        // A stop during backoff pauses the task instead of
                        // waiting out the delay and touching the network.
                        if ctx.stop_requested_within(delay).await {
                            ctx.update_record(&task.id, |r| r.status = TransferStatus::Paused);
                            ctx.emit_transition(&task.id, TransferStatus::Paused);
                            info!("stop requested during backoff, task paused");
                            return (TransferStatus::Paused, None);
                        }
                        force_restart = failure.forces_restart();
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        warn!(error = %message, reason = %reason, "task failed");
                        ctx.update_record(&task.id, |r| r.status = TransferStatus::Failed);
                        ctx.emit_transition(&task.id, TransferStatus::Failed);
                        return (TransferStatus::Failed, Some(message));
                    }
                }
            }
        }
    }
}

/// Extracts a Retry-After delay from a rate-limited error, when present.
fn retry_after_override(error: &DownloadError) -> Option<std::time::Duration> {
    match error {
        DownloadError::HttpStatus {
            status: 429,
            retry_after: Some(value),
            ..
        } => parse_retry_after(value),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::events::NullSink;
    use crate::task::ContentCategory;

    use super::*;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            concurrency: 2,
            retry_attempts: 2,
            ..EngineConfig::default()
        }
    }

    fn context_in(dir: &TempDir, config: EngineConfig) -> Arc<EngineContext> {
        let store = StatusStore::open(
            dir.path().join("status.json"),
            config.flush_interval,
            config.flush_bytes,
        )
        .unwrap();
        Arc::new(EngineContext::new(
            config,
            store,
            ResolverRegistry::new(),
            Arc::new(NullSink),
        ))
    }

    fn task(id: &str, url: String, dir: &TempDir, priority: i64) -> DownloadTask {
        let mut task = DownloadTask::new(
            id,
            url,
            dir.path().join(format!("{id}.bin")),
            ContentCategory::Document,
        );
        task.priority = priority;
        task
    }

    // ==================== TaskQueue Tests ====================

    #[test]
    fn test_queue_priority_order() {
        let dir = TempDir::new().unwrap();
        let queue = TaskQueue::new();
        queue.push_all(vec![
            task("low", "http://x/a".to_string(), &dir, 1),
            task("high", "http://x/b".to_string(), &dir, 10),
            task("mid", "http://x/c".to_string(), &dir, 5),
        ]);

        assert_eq!(queue.pop().unwrap().id, "high");
        assert_eq!(queue.pop().unwrap().id, "mid");
        assert_eq!(queue.pop().unwrap().id, "low");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_queue_ties_preserve_submission_order() {
        let dir = TempDir::new().unwrap();
        let queue = TaskQueue::new();
        queue.push_all(vec![
            task("first", "http://x/a".to_string(), &dir, 0),
            task("second", "http://x/b".to_string(), &dir, 0),
            task("third", "http://x/c".to_string(), &dir, 0),
        ]);

        assert_eq!(queue.pop().unwrap().id, "first");
        assert_eq!(queue.pop().unwrap().id, "second");
        assert_eq!(queue.pop().unwrap().id, "third");
    }

    // ==================== Stop Flag Tests ====================

    #[tokio::test]
    async fn test_stop_wakes_a_blocked_backoff_wait() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir, fast_config());

        let waiter = Arc::clone(&ctx);
        let handle = tokio::spawn(async move {
            waiter.stop_requested_within(Duration::from_secs(30)).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = std::time::Instant::now();
        ctx.request_stop();

        assert!(handle.await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_backoff_wait_elapses_without_stop() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir, fast_config());

        assert!(!ctx.stop_requested_within(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_backoff_wait_returns_immediately_when_already_stopped() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir, fast_config());
        ctx.request_stop();

        let started = std::time::Instant::now();
        assert!(ctx.stop_requested_within(Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    // ==================== Submission Tests ====================

    #[tokio::test]
    async fn test_submit_rejects_duplicate_ids() {
        let dir = TempDir::new().unwrap();
        let engine = DownloadEngine::new(context_in(&dir, fast_config())).unwrap();

        let result = engine
            .submit(vec![
                task("dup", "http://x/a".to_string(), &dir, 0),
                task("dup", "http://x/b".to_string(), &dir, 0),
            ])
            .await;
        assert!(matches!(
            result,
            Err(EngineError::DuplicateTaskId { ref id }) if id == "dup"
        ));
    }

    #[tokio::test]
    async fn test_submit_marks_queued_in_store() {
        let dir = TempDir::new().unwrap();
        let engine = DownloadEngine::new(context_in(&dir, fast_config())).unwrap();

        let enqueued = engine
            .submit(vec![task("t1", "http://x/a".to_string(), &dir, 0)])
            .await
            .unwrap();
        assert_eq!(enqueued, 1);
        assert_eq!(
            engine.context().lock_store().get("t1").unwrap().status,
            TransferStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_submit_resets_budget_for_resubmitted_failure() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir, fast_config());
        ctx.lock_store()
            .update("t1", |r| {
                r.status = TransferStatus::Failed;
                r.attempt_count = 2;
                r.last_error = Some("HTTP 503".to_string());
            })
            .unwrap();

        let engine = DownloadEngine::new(ctx).unwrap();
        engine
            .submit(vec![task("t1", "http://x/a".to_string(), &dir, 0)])
            .await
            .unwrap();

        let record = engine.context().lock_store().get("t1").cloned().unwrap();
        assert_eq!(record.status, TransferStatus::Queued);
        assert_eq!(record.attempt_count, 0);
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn test_submit_preserves_budget_for_stale_paused() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir, fast_config());
        ctx.lock_store()
            .update("t1", |r| {
                r.status = TransferStatus::Paused;
                r.attempt_count = 1;
                r.bytes_downloaded = 512;
            })
            .unwrap();

        let engine = DownloadEngine::new(ctx).unwrap();
        engine
            .submit(vec![task("t1", "http://x/a".to_string(), &dir, 0)])
            .await
            .unwrap();

        let record = engine.context().lock_store().get("t1").cloned().unwrap();
        assert_eq!(record.status, TransferStatus::Queued);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.bytes_downloaded, 512);
    }

    // ==================== Run Tests ====================

    #[tokio::test]
    async fn test_run_single_task_end_to_end() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/t1.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let engine = DownloadEngine::new(context_in(&dir, fast_config())).unwrap();
        let t = task("t1", format!("{}/t1.bin", server.uri()), &dir, 0);
        let dest = t.dest_path.clone();

        engine.submit(vec![t]).await.unwrap();
        let summary = engine.run().await;

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 0);
        assert!(summary.is_clean());
        assert_eq!(std::fs::read(dest).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_run_fatal_error_consumes_no_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let engine = DownloadEngine::new(context_in(&dir, fast_config())).unwrap();
        engine
            .submit(vec![task("t1", format!("{}/t1.bin", server.uri()), &dir, 0)])
            .await
            .unwrap();
        let summary = engine.run().await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures.len(), 1);
        assert!(summary.failures[0].error.contains("404"));
    }

    #[tokio::test]
    async fn test_purge_unreferenced() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir, fast_config());
        ctx.lock_store()
            .update("stale", |r| r.status = TransferStatus::Completed)
            .unwrap();
        ctx.lock_store()
            .update("live", |r| r.status = TransferStatus::Completed)
            .unwrap();

        let engine = DownloadEngine::new(ctx).unwrap();
        let removed = engine.purge_unreferenced(&["live"]).unwrap();
        assert_eq!(removed, 1);
        assert!(engine.context().lock_store().get("stale").is_none());
    }
}
