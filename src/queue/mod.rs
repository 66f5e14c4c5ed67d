//! Named job queues with delayed/priority admission, bounded concurrency,
//! rate limiting, retries and a per-queue circuit breaker.
//!
//! ## Execution model
//!
//! ```text
//! add_job ──► JobStore (delayed heap) ──promote_due──► ready heap
//!                                                        │
//!          dispatcher: permit (semaphore) ─► token (bucket) ─► spawn worker
//!                                                        │
//!             handler.handle ── Ok ──► completed, breaker.success
//!                            └─ Err ─► retry with backoff | failed, breaker.failure
//! ```
//!
//! The queue knows nothing about deliveries; payloads are any `JobPayload`
//! and the work is done by a registered `JobHandler`.

pub mod circuit;
pub mod rate_limiter;
pub mod store;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};

use self::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState};
use self::rate_limiter::{RateLimit, TokenBucket};
use self::store::{JobStore, MemoryJobStore, QueuedJob};

/// Window used for the throughput figure in `QueueMetrics`.
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

/// Number of recent completions averaged into the latency figure.
const LATENCY_SAMPLE: usize = 100;

/// Queues known at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// Advisor-submitted content
    Delivery,
    /// Fallback and emergency content
    FallbackDelivery,
}

impl QueueName {
    pub const ALL: [QueueName; 2] = [QueueName::Delivery, QueueName::FallbackDelivery];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Delivery => "message-delivery",
            QueueName::FallbackDelivery => "fallback-delivery",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// `delay × 2^(attempts_made − 1)`: the first retry waits `delay`
    Exponential {
        #[serde(with = "crate::config::duration_millis", rename = "delay_ms")]
        delay: Duration,
    },
    Fixed {
        #[serde(with = "crate::config::duration_millis", rename = "delay_ms")]
        delay: Duration,
    },
}

impl Backoff {
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { delay } => {
                let exponent = attempts_made.saturating_sub(1).min(16);
                delay.saturating_mul(1u32 << exponent)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::Exponential {
                delay: Duration::from_secs(2),
            },
        }
    }
}

/// Per-queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub rate_limit: Option<RateLimit>,
    pub retry: RetryPolicy,
    /// Upper bound for a single attempt; exceeding it is a transient failure
    #[serde(with = "crate::config::duration_secs", rename = "job_timeout_secs")]
    pub job_timeout: Duration,
    pub circuit: CircuitBreakerConfig,
    /// Finished jobs remembered for `clean` and throughput figures
    pub history_limit: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 100,
            rate_limit: Some(RateLimit::per_second(20)),
            retry: RetryPolicy::default(),
            job_timeout: Duration::from_secs(60),
            circuit: CircuitBreakerConfig::default(),
            history_limit: 5_000,
        }
    }
}

/// Admission options for a single job.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub delay: Duration,
    /// Higher values are dequeued first when due times coincide
    pub priority: u32,
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
}

/// One entry of a bulk admission.
#[derive(Debug, Clone)]
pub struct BulkJob<P> {
    pub name: String,
    pub payload: P,
    pub options: JobOptions,
}

/// Returned on successful admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: JobId,
    pub queue: QueueName,
    pub name: String,
}

impl JobHandle {
    /// Identifier unique across queues, used in SLA samples.
    pub fn key(&self) -> String {
        format!("{}:{}", self.queue, self.id)
    }
}

/// What a handler knows about the attempt it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub id: JobId,
    pub queue: QueueName,
    pub name: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
}

impl JobContext {
    pub fn job_key(&self) -> String {
        format!("{}:{}", self.queue, self.id)
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub message: String,
    pub retryable: bool,
}

impl JobFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Data carried by a job.
pub trait JobPayload: Clone + Send + Sync + 'static {
    /// Called before a retry is re-queued with the number of retries so far.
    fn on_retry(&mut self, _retry_count: u32) {}
}

#[async_trait]
pub trait JobHandler<P>: Send + Sync {
    async fn handle(&self, ctx: &JobContext, payload: &P) -> Result<(), JobFailure>;

    /// Called once when a job fails for good (permanent failure or
    /// attempts exhausted).
    async fn on_failed(&self, _ctx: &JobContext, _payload: &P, _failure: &JobFailure) {}
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("circuit breaker is open for queue {queue}")]
    CircuitOpen { queue: QueueName },

    #[error("queue {0} has not been created")]
    UnknownQueue(QueueName),

    #[error("queue {0} already has a worker")]
    WorkerAlreadyRegistered(QueueName),

    #[error("queue manager is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueMetrics {
    pub name: QueueName,
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub retries: u64,
    /// Completions per minute over the last minute
    pub throughput: f64,
    /// Average processing time of recent completions
    pub latency_ms: f64,
    /// Failed attempts / total attempts (0.0..=1.0)
    pub error_rate: f64,
    pub paused: bool,
    pub circuit: CircuitBreakerState,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    attempts: AtomicU64,
    attempt_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct FinishedJob {
    finished_at: Instant,
    succeeded: bool,
    latency: Duration,
}

struct Queue<P> {
    name: QueueName,
    settings: QueueSettings,
    store: Arc<dyn JobStore<P>>,
    breaker: Mutex<CircuitBreaker>,
    limiter: Option<Mutex<TokenBucket>>,
    semaphore: Arc<Semaphore>,
    counters: Counters,
    history: Mutex<VecDeque<FinishedJob>>,
    paused: AtomicBool,
    notify: Notify,
    next_id: AtomicU64,
    has_worker: AtomicBool,
}

impl<P: JobPayload> Queue<P> {
    fn new(name: QueueName, settings: QueueSettings, store: Arc<dyn JobStore<P>>) -> Self {
        let now = Instant::now();
        Self {
            name,
            breaker: Mutex::new(CircuitBreaker::new(name.as_str(), settings.circuit, now)),
            limiter: settings
                .rate_limit
                .map(|limit| Mutex::new(TokenBucket::new(limit, now))),
            semaphore: Arc::new(Semaphore::new(settings.concurrency.max(1))),
            counters: Counters::default(),
            history: Mutex::new(VecDeque::new()),
            paused: AtomicBool::new(false),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
            has_worker: AtomicBool::new(false),
            store,
            settings,
        }
    }

    fn ensure_admitting(&self) -> Result<(), QueueError> {
        if self.breaker.lock().is_open(Instant::now()) {
            warn!(queue = %self.name, "rejecting admission, circuit breaker open");
            return Err(QueueError::CircuitOpen { queue: self.name });
        }
        Ok(())
    }

    fn build_job(&self, name: String, payload: P, options: JobOptions, now: Instant) -> QueuedJob<P> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        QueuedJob {
            id: JobId(id),
            name,
            payload,
            priority: options.priority,
            due_at: now + options.delay,
            enqueued_at: now,
            attempts_made: 0,
            max_attempts: options
                .attempts
                .unwrap_or(self.settings.retry.attempts)
                .max(1),
            backoff: options.backoff.unwrap_or(self.settings.retry.backoff),
            seq: id,
        }
    }

    fn remember(&self, finished: FinishedJob) {
        let mut history = self.history.lock();
        history.push_back(finished);
        while history.len() > self.settings.history_limit {
            history.pop_front();
        }
    }

    async fn metrics(&self) -> QueueMetrics {
        let now = Instant::now();
        let (waiting, delayed) = self.store.counts().await;

        let (throughput, latency_ms) = {
            let history = self.history.lock();
            let recent = history
                .iter()
                .filter(|f| f.succeeded && now.saturating_duration_since(f.finished_at) <= THROUGHPUT_WINDOW)
                .count();
            let latencies: Vec<Duration> = history
                .iter()
                .rev()
                .filter(|f| f.succeeded)
                .take(LATENCY_SAMPLE)
                .map(|f| f.latency)
                .collect();
            let latency_ms = if latencies.is_empty() {
                0.0
            } else {
                latencies.iter().map(|l| l.as_secs_f64() * 1000.0).sum::<f64>() / latencies.len() as f64
            };
            let per_minute = recent as f64 * 60.0 / THROUGHPUT_WINDOW.as_secs_f64();
            (per_minute, latency_ms)
        };

        let attempts = self.counters.attempts.load(Ordering::Relaxed);
        let attempt_failures = self.counters.attempt_failures.load(Ordering::Relaxed);
        let error_rate = if attempts == 0 {
            0.0
        } else {
            attempt_failures as f64 / attempts as f64
        };

        QueueMetrics {
            name: self.name,
            waiting: waiting as u64,
            active: self.counters.active.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            delayed: delayed as u64,
            retries: self.counters.retries.load(Ordering::Relaxed),
            throughput,
            latency_ms,
            error_rate,
            paused: self.paused.load(Ordering::Acquire),
            circuit: self.breaker.lock().state(now),
        }
    }
}

/// Registry of named queues and their dispatchers.
pub struct QueueManager<P: JobPayload> {
    queues: RwLock<HashMap<QueueName, Arc<Queue<P>>>>,
    cancel: CancellationToken,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: JobPayload> QueueManager<P> {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            dispatchers: Mutex::new(Vec::new()),
        }
    }

    /// Register a queue backed by the in-memory job store.
    ///
    /// Idempotent: a second call for the same name keeps the existing queue.
    pub fn create_queue(&self, name: QueueName, settings: QueueSettings) {
        self.create_queue_with_store(name, settings, Arc::new(MemoryJobStore::new()));
    }

    pub fn create_queue_with_store(
        &self,
        name: QueueName,
        settings: QueueSettings,
        store: Arc<dyn JobStore<P>>,
    ) {
        let mut queues = self.queues.write();
        if queues.contains_key(&name) {
            trace!(queue = %name, "queue already exists");
            return;
        }
        debug!(
            queue = %name,
            concurrency = settings.concurrency,
            attempts = settings.retry.attempts,
            "creating queue"
        );
        queues.insert(name, Arc::new(Queue::new(name, settings, store)));
    }

    fn queue(&self, name: QueueName) -> Result<Arc<Queue<P>>, QueueError> {
        self.queues
            .read()
            .get(&name)
            .cloned()
            .ok_or(QueueError::UnknownQueue(name))
    }

    /// Bind `handler` to `name` and start dispatching.
    pub fn register_worker(
        &self,
        name: QueueName,
        handler: Arc<dyn JobHandler<P>>,
    ) -> Result<(), QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }
        let queue = self.queue(name)?;
        if queue.has_worker.swap(true, Ordering::AcqRel) {
            return Err(QueueError::WorkerAlreadyRegistered(name));
        }

        let task = tokio::spawn(run_dispatcher(queue, handler, self.cancel.clone()));
        self.dispatchers.lock().push(task);
        Ok(())
    }

    /// Admit a single job. Rejected while the queue's breaker is open.
    pub async fn add_job(
        &self,
        name: QueueName,
        job_name: impl Into<String>,
        payload: P,
        options: JobOptions,
    ) -> Result<JobHandle, QueueError> {
        let queue = self.queue(name)?;
        queue.ensure_admitting()?;

        let job = queue.build_job(job_name.into(), payload, options, Instant::now());
        let handle = JobHandle {
            id: job.id,
            queue: name,
            name: job.name.clone(),
        };
        trace!(queue = %name, job = %handle.id, "job admitted");

        queue.store.push_all(vec![job]).await;
        queue.notify.notify_one();
        Ok(handle)
    }

    /// Admit a batch. The breaker is checked once: all jobs are rejected or
    /// all are queued.
    pub async fn bulk_add_jobs(
        &self,
        name: QueueName,
        jobs: Vec<BulkJob<P>>,
    ) -> Result<Vec<JobHandle>, QueueError> {
        let queue = self.queue(name)?;
        queue.ensure_admitting()?;

        let now = Instant::now();
        let queued: Vec<QueuedJob<P>> = jobs
            .into_iter()
            .map(|job| queue.build_job(job.name, job.payload, job.options, now))
            .collect();
        let handles = queued
            .iter()
            .map(|job| JobHandle {
                id: job.id,
                queue: name,
                name: job.name.clone(),
            })
            .collect::<Vec<_>>();

        debug!(queue = %name, count = handles.len(), "bulk admission");
        queue.store.push_all(queued).await;
        queue.notify.notify_one();
        Ok(handles)
    }

    pub async fn metrics(&self, name: QueueName) -> Result<QueueMetrics, QueueError> {
        Ok(self.queue(name)?.metrics().await)
    }

    /// Metrics for every registered queue, in name order.
    pub async fn queue_stats(&self) -> Vec<QueueMetrics> {
        let mut queues: Vec<Arc<Queue<P>>> = self.queues.read().values().cloned().collect();
        queues.sort_by_key(|q| q.name);

        let mut stats = Vec::with_capacity(queues.len());
        for queue in queues {
            stats.push(queue.metrics().await);
        }
        stats
    }

    /// `(succeeded, failed)` final outcomes recorded within `window` of now.
    pub fn outcomes_within(
        &self,
        name: QueueName,
        window: Duration,
    ) -> Result<(u64, u64), QueueError> {
        let queue = self.queue(name)?;
        let now = Instant::now();
        let history = queue.history.lock();
        Ok(history
            .iter()
            .filter(|f| now.saturating_duration_since(f.finished_at) <= window)
            .fold((0, 0), |(ok, failed), f| {
                if f.succeeded {
                    (ok + 1, failed)
                } else {
                    (ok, failed + 1)
                }
            }))
    }

    pub fn is_circuit_open(&self, name: QueueName) -> Result<bool, QueueError> {
        Ok(self.queue(name)?.breaker.lock().is_open(Instant::now()))
    }

    /// Stop starting new jobs. In-flight jobs finish.
    pub fn pause(&self, name: QueueName) -> Result<(), QueueError> {
        let queue = self.queue(name)?;
        queue.paused.store(true, Ordering::Release);
        debug!(queue = %name, "queue paused");
        Ok(())
    }

    pub fn resume(&self, name: QueueName) -> Result<(), QueueError> {
        let queue = self.queue(name)?;
        queue.paused.store(false, Ordering::Release);
        queue.notify.notify_one();
        debug!(queue = %name, "queue resumed");
        Ok(())
    }

    /// Drop every waiting and delayed job.
    pub async fn drain(&self, name: QueueName) -> Result<usize, QueueError> {
        let removed = self.queue(name)?.store.drain().await;
        debug!(queue = %name, removed, "queue drained");
        Ok(removed)
    }

    /// Forget finished jobs older than `grace`.
    pub fn clean(&self, name: QueueName, grace: Duration) -> Result<usize, QueueError> {
        let queue = self.queue(name)?;
        let now = Instant::now();
        let mut history = queue.history.lock();
        let before = history.len();
        history.retain(|f| now.saturating_duration_since(f.finished_at) <= grace);
        let removed = before - history.len();
        debug!(queue = %name, removed, "cleaned finished jobs");
        Ok(removed)
    }

    /// Stop all dispatchers. Jobs already running are left to finish.
    pub async fn shutdown(&self) {
        debug!("shutting down queue manager");
        self.cancel.cancel();
        let dispatchers: Vec<JoinHandle<()>> = self.dispatchers.lock().drain(..).collect();
        for dispatcher in dispatchers {
            if let Err(e) = dispatcher.await {
                error!("queue dispatcher ended abnormally: {e}");
            }
        }
    }
}

impl<P: JobPayload> Default for QueueManager<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[instrument(skip_all, fields(queue = %queue.name))]
async fn run_dispatcher<P: JobPayload>(
    queue: Arc<Queue<P>>,
    handler: Arc<dyn JobHandler<P>>,
    cancel: CancellationToken,
) {
    debug!("starting dispatcher");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        if queue.paused.load(Ordering::Acquire) {
            tokio::select! {
                _ = queue.notify.notified() => continue,
                _ = cancel.cancelled() => break,
            }
        }

        queue.store.promote_due(Instant::now()).await;

        let permit = tokio::select! {
            permit = queue.semaphore.clone().acquire_owned() => permit,
            _ = cancel.cancelled() => break,
        };
        let Ok(permit) = permit else {
            break;
        };

        let Some(job) = queue.store.pop_ready().await else {
            drop(permit);
            let next_due = queue.store.next_due().await;
            let wake_at = next_due.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = queue.notify.notified() => {}
                _ = cancel.cancelled() => break,
            }
            continue;
        };

        if !wait_for_token(&queue, &cancel).await {
            // Put it back so the job is not lost on shutdown
            queue.store.push_all(vec![job]).await;
            break;
        }

        tokio::spawn(execute(queue.clone(), handler.clone(), job, permit));
    }

    debug!("dispatcher stopped");
}

/// Wait for a rate-limit token. Returns false when cancelled.
async fn wait_for_token<P: JobPayload>(queue: &Queue<P>, cancel: &CancellationToken) -> bool {
    let Some(limiter) = &queue.limiter else {
        return true;
    };

    loop {
        let wait = match limiter.lock().try_acquire(Instant::now()) {
            Ok(()) => return true,
            Err(wait) => wait,
        };
        trace!(wait = ?wait, "rate limited");
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => return false,
        }
    }
}

async fn execute<P: JobPayload>(
    queue: Arc<Queue<P>>,
    handler: Arc<dyn JobHandler<P>>,
    mut job: QueuedJob<P>,
    permit: OwnedSemaphorePermit,
) {
    job.attempts_made += 1;
    let ctx = JobContext {
        id: job.id,
        queue: queue.name,
        name: job.name.clone(),
        attempt: job.attempts_made,
        max_attempts: job.max_attempts,
    };

    queue.counters.active.fetch_add(1, Ordering::Relaxed);
    queue.counters.attempts.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();

    let attempt = tokio::time::timeout(queue.settings.job_timeout, handler.handle(&ctx, &job.payload));
    let outcome = match attempt.await {
        Ok(result) => result,
        Err(_) => Err(JobFailure::transient(format!(
            "attempt timed out after {:?}",
            queue.settings.job_timeout
        ))),
    };

    queue.counters.active.fetch_sub(1, Ordering::Relaxed);
    drop(permit);
    let now = Instant::now();

    match outcome {
        Ok(()) => {
            queue.counters.completed.fetch_add(1, Ordering::Relaxed);
            queue.breaker.lock().record_success(now);
            queue.remember(FinishedJob {
                finished_at: now,
                succeeded: true,
                latency: now.saturating_duration_since(started),
            });
            trace!(queue = %queue.name, job = %ctx.id, attempt = ctx.attempt, "job completed");
        }

        Err(failure) if failure.retryable && job.attempts_made < job.max_attempts => {
            queue.counters.attempt_failures.fetch_add(1, Ordering::Relaxed);
            queue.counters.retries.fetch_add(1, Ordering::Relaxed);

            let delay = job.backoff.delay_for(job.attempts_made);
            debug!(
                queue = %queue.name,
                job = %ctx.id,
                attempt = ctx.attempt,
                max_attempts = ctx.max_attempts,
                retry_in = ?delay,
                "job failed, scheduling retry: {}",
                failure.message
            );

            job.payload.on_retry(job.attempts_made);
            job.due_at = now + delay;
            queue.store.push_all(vec![job]).await;
            queue.notify.notify_one();
        }

        Err(failure) => {
            queue.counters.attempt_failures.fetch_add(1, Ordering::Relaxed);
            queue.counters.failed.fetch_add(1, Ordering::Relaxed);
            queue.breaker.lock().record_failure(now);
            queue.remember(FinishedJob {
                finished_at: now,
                succeeded: false,
                latency: now.saturating_duration_since(started),
            });
            warn!(
                queue = %queue.name,
                job = %ctx.id,
                attempt = ctx.attempt,
                "job failed permanently: {}",
                failure.message
            );
            handler.on_failed(&ctx, &job.payload, &failure).await;
        }
    }
}
