use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::models::delivery_job::{
    DeliveryJob, EnqueueOptions, JobId, JobRun, JobSnapshot, JobState, Priority, QueueMetrics,
};
use crate::models::notification_log::backoff_delay;
use crate::transport::SendError;
use crate::utils::ids::IdGenerator;
use crate::utils::time::{add_saturating, sub_saturating, Clock};

pub const DEGRADED_PREFIX: &str = "degraded-";

/// Upper bound on how long an idle worker sleeps before re-checking the delayed set.
const IDLE_POLL: Duration = Duration::from_millis(250);

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    async fn enqueue(&self, job: DeliveryJob, options: EnqueueOptions) -> Result<JobId>;

    async fn get_job(&self, job_id: &str) -> Result<Option<JobSnapshot>>;

    /// Best-effort removal. Active jobs are never removed.
    async fn remove(&self, job_id: &str) -> Result<bool>;

    fn is_available(&self) -> bool;

    async fn close(&self);

    async fn metrics(&self) -> Result<QueueMetrics>;

    /// Moves every failed job back to waiting with a fresh attempt budget.
    async fn retry_failed(&self) -> Result<usize>;

    /// Drops up to `limit` completed jobs that finished more than `older_than` ago.
    async fn clean_completed(&self, older_than: Duration, limit: usize) -> Result<usize>;
}

/// Worker-side seam: what to do with a job once it is taken off the queue.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, run: &JobRun, job: &DeliveryJob) -> std::result::Result<(), SendError>;

    /// Called once when a job has used its last queue-level attempt.
    async fn on_exhausted(&self, run: &JobRun, job: &DeliveryJob, error: &SendError);
}

/// Worker-side view of a queue backend.
#[async_trait]
pub trait WorkerQueue: Send + Sync {
    fn name(&self) -> &str;

    fn concurrency(&self) -> usize;

    fn is_closed(&self) -> bool;

    /// Takes at most one due job and runs it through `processor`.
    /// Returns `Ok(false)` when nothing was ready.
    async fn run_once(&self, processor: &dyn JobProcessor) -> Result<bool>;

    /// Parks an idle worker until work may be due.
    async fn wait_for_work(&self);

    /// Retention GC: completed jobs after the short window, failed after the long one.
    async fn prune(&self) -> Result<usize>;

    /// Hands jobs left active by a dead worker back to waiting.
    async fn recover_stalled(&self) -> Result<usize> {
        Ok(0)
    }
}

async fn run_worker(queue: Arc<dyn WorkerQueue>, processor: Arc<dyn JobProcessor>) {
    while !queue.is_closed() {
        match queue.run_once(processor.as_ref()).await {
            Ok(true) => {}
            Ok(false) => queue.wait_for_work().await,
            Err(e) => {
                error!(error = ?e, queue = %queue.name(), "Delivery worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    debug!(queue = %queue.name(), "Delivery worker stopped");
}

pub fn spawn_workers(queue: Arc<dyn WorkerQueue>, processor: Arc<dyn JobProcessor>) -> Vec<JoinHandle<()>> {
    let count = queue.concurrency().max(1);
    info!(queue = %queue.name(), workers = count, "Starting delivery workers");
    (0..count)
        .map(|_| tokio::spawn(run_worker(queue.clone(), processor.clone())))
        .collect()
}

/// Awaits every worker and returns how many of them ended in a panic.
pub async fn join_workers(workers: Vec<JoinHandle<()>>) -> usize {
    let mut panicked = 0;
    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = ?e, "Delivery worker panicked");
            panicked += 1;
        }
    }
    panicked
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub name: String,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub completed_retention: Duration,
    pub failed_retention: Duration,
    /// Active jobs older than this are handed back to waiting on worker startup.
    pub stall_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "notifications".to_string(),
            concurrency: 4,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            completed_retention: Duration::from_secs(3600),
            failed_retention: Duration::from_secs(7 * 24 * 3600),
            stall_timeout: Duration::from_secs(300),
        }
    }
}

struct Entry {
    job: DeliveryJob,
    priority: Priority,
    state: JobState,
    attempts_made: u32,
    created_at: DateTime<Utc>,
    run_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    failed_reason: Option<String>,
    revived: bool,
    /// Changes every time the entry is (re)inserted into the ready heap or delayed set;
    /// stale heap items are skipped on pop.
    seq: u64,
}

impl Entry {
    fn snapshot(&self, id: &str) -> JobSnapshot {
        JobSnapshot {
            id: id.to_string(),
            state: self.state,
            priority: self.priority,
            attempts_made: self.attempts_made,
            created_at: self.created_at,
            run_at: self.run_at,
            finished_at: self.finished_at,
            failed_reason: self.failed_reason.clone(),
            job: self.job.clone(),
        }
    }
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Entry>,
    ready: BinaryHeap<Reverse<(u8, u64, JobId)>>,
    delayed: BTreeSet<(DateTime<Utc>, u64, JobId)>,
    seq: u64,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn make_waiting(&mut self, id: &str) {
        let seq = self.next_seq();
        if let Some(entry) = self.jobs.get_mut(id) {
            entry.state = JobState::Waiting;
            entry.seq = seq;
            self.ready
                .push(Reverse((entry.priority.rank(), seq, id.to_string())));
        }
    }

    fn make_delayed(&mut self, id: &str, run_at: DateTime<Utc>) {
        let seq = self.next_seq();
        if let Some(entry) = self.jobs.get_mut(id) {
            entry.state = JobState::Delayed;
            entry.run_at = run_at;
            entry.seq = seq;
            self.delayed.insert((run_at, seq, id.to_string()));
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(first) = self.delayed.first().cloned() {
            if first.0 > now {
                break;
            }
            self.delayed.remove(&first);
            let (_, seq, id) = first;
            let current = self
                .jobs
                .get(&id)
                .map_or(false, |e| e.seq == seq && e.state == JobState::Delayed);
            if current {
                self.make_waiting(&id);
            }
        }
    }

    fn pop_ready(&mut self) -> Option<JobId> {
        while let Some(Reverse((_, seq, id))) = self.ready.pop() {
            let current = self
                .jobs
                .get(&id)
                .map_or(false, |e| e.seq == seq && e.state == JobState::Waiting);
            if current {
                return Some(id);
            }
        }
        None
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        self.delayed.first().map(|(at, _, _)| *at)
    }

    fn count(&self, state: JobState) -> usize {
        self.jobs.values().filter(|e| e.state == state).count()
    }

    /// Removes finished jobs of `state` that finished before `cutoff`, oldest first.
    fn sweep(&mut self, state: JobState, cutoff: DateTime<Utc>, limit: usize) -> usize {
        let mut doomed: Vec<(DateTime<Utc>, JobId)> = self
            .jobs
            .iter()
            .filter(|(_, e)| e.state == state)
            .filter_map(|(id, e)| e.finished_at.filter(|at| *at < cutoff).map(|at| (at, id.clone())))
            .collect();
        doomed.sort();
        doomed.truncate(limit);
        for (_, id) in &doomed {
            self.jobs.remove(id);
        }
        doomed.len()
    }
}

/// In-process priority queue with delayed jobs and queue-level retries.
///
/// Lower priority rank is served first; FIFO within a rank. Failed attempts are
/// re-delayed by `backoff_base * 2^(attempt - 1)` until `max_attempts` is used up.
pub struct MemoryQueue {
    settings: QueueSettings,
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl MemoryQueue {
    pub fn new(settings: QueueSettings, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            settings,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            clock,
            ids,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub async fn run_once(&self, processor: &dyn JobProcessor) -> Result<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let (run, job) = {
            let mut state = self.state.lock().await;
            state.promote_due(self.clock.now());
            let Some(id) = state.pop_ready() else {
                return Ok(false);
            };
            let Some(entry) = state.jobs.get_mut(&id) else {
                return Ok(false);
            };
            entry.state = JobState::Active;
            entry.attempts_made += 1;
            let run = JobRun::new(id, entry.attempts_made).revived(entry.revived);
            (run, entry.job.clone())
        };
        let id = run.id.as_str();

        debug!(job_id = %id, attempt = run.attempt, log_id = %job.log_id, "Processing delivery job");
        let outcome = processor.process(&run, &job).await;

        let exhausted = {
            let mut state = self.state.lock().await;
            let now = self.clock.now();
            let attempts = match state.jobs.get_mut(id) {
                Some(entry) => {
                    entry.failed_reason = outcome.as_ref().err().map(|e| e.message().to_string());
                    entry.attempts_made
                }
                None => return Ok(true),
            };
            match &outcome {
                Ok(()) => {
                    if let Some(entry) = state.jobs.get_mut(id) {
                        entry.state = JobState::Completed;
                        entry.finished_at = Some(now);
                    }
                    None
                }
                Err(e) if attempts < self.settings.max_attempts => {
                    let delay = backoff_delay(self.settings.backoff_base, attempts);
                    let run_at = add_saturating(now, delay);
                    warn!(
                        job_id = %id,
                        attempt = attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e.message(),
                        "Delivery attempt failed, retrying"
                    );
                    state.make_delayed(id, run_at);
                    None
                }
                Err(e) => {
                    if let Some(entry) = state.jobs.get_mut(id) {
                        entry.state = JobState::Failed;
                        entry.finished_at = Some(now);
                    }
                    Some(e.clone())
                }
            }
        };

        if let Some(err) = exhausted {
            error!(job_id = %id, log_id = %job.log_id, error = %err.message(), "Delivery job exhausted its attempts");
            processor.on_exhausted(&run, &job, &err).await;
        }
        Ok(true)
    }

    pub async fn wait_for_work(&self) {
        let wait = {
            let state = self.state.lock().await;
            state
                .next_due()
                .and_then(|at| (at - self.clock.now()).to_std().ok())
                .map_or(IDLE_POLL, |d| d.min(IDLE_POLL))
        };
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    pub async fn prune(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let completed = state.sweep(
            JobState::Completed,
            sub_saturating(now, self.settings.completed_retention),
            usize::MAX,
        );
        let failed = state.sweep(
            JobState::Failed,
            sub_saturating(now, self.settings.failed_retention),
            usize::MAX,
        );
        completed + failed
    }
}

#[async_trait]
impl WorkerQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn concurrency(&self) -> usize {
        self.settings.concurrency
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn run_once(&self, processor: &dyn JobProcessor) -> Result<bool> {
        MemoryQueue::run_once(self, processor).await
    }

    async fn wait_for_work(&self) {
        MemoryQueue::wait_for_work(self).await
    }

    async fn prune(&self) -> Result<usize> {
        Ok(MemoryQueue::prune(self).await)
    }
}

#[async_trait]
impl DeliveryQueue for MemoryQueue {
    async fn enqueue(&self, job: DeliveryJob, options: EnqueueOptions) -> Result<JobId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::QueueUnavailable(format!(
                "queue '{}' is closed",
                self.settings.name
            )));
        }
        let now = self.clock.now();
        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| self.ids.next_id().to_string());
        let run_at = options.scheduled_time.filter(|at| *at > now);

        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&id) {
            return Err(Error::Internal(format!("job '{}' already exists", id)));
        }
        state.jobs.insert(
            id.clone(),
            Entry {
                job,
                priority: options.priority,
                state: JobState::Waiting,
                attempts_made: 0,
                created_at: now,
                run_at: run_at.unwrap_or(now),
                finished_at: None,
                failed_reason: None,
                revived: false,
                seq: 0,
            },
        );
        match run_at {
            Some(at) => state.make_delayed(&id, at),
            None => state.make_waiting(&id),
        }
        drop(state);

        self.notify.notify_one();
        debug!(job_id = %id, priority = %options.priority, delayed = run_at.is_some(), "Job enqueued");
        Ok(id)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobSnapshot>> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(job_id).map(|e| e.snapshot(job_id)))
    }

    async fn remove(&self, job_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.jobs.get(job_id) else {
            return Ok(false);
        };
        if entry.state == JobState::Active {
            return Ok(false);
        }
        let key = (entry.run_at, entry.seq, job_id.to_string());
        state.delayed.remove(&key);
        state.jobs.remove(job_id);
        Ok(true)
    }

    fn is_available(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(queue = %self.settings.name, "Delivery queue closed");
        }
        self.notify.notify_waiters();
    }

    async fn metrics(&self) -> Result<QueueMetrics> {
        let state = self.state.lock().await;
        Ok(QueueMetrics {
            queue: self.settings.name.clone(),
            waiting: state.count(JobState::Waiting),
            delayed: state.count(JobState::Delayed),
            active: state.count(JobState::Active),
            completed: state.count(JobState::Completed),
            failed: state.count(JobState::Failed),
            degraded: 0,
        })
    }

    async fn retry_failed(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let failed: Vec<JobId> = state
            .jobs
            .iter()
            .filter(|(_, e)| e.state == JobState::Failed)
            .map(|(id, _)| id.clone())
            .collect();
        let now = self.clock.now();
        for id in &failed {
            if let Some(entry) = state.jobs.get_mut(id) {
                entry.attempts_made = 0;
                entry.finished_at = None;
                entry.failed_reason = None;
                entry.revived = true;
                entry.run_at = now;
            }
            state.make_waiting(id);
        }
        drop(state);
        for _ in 0..failed.len() {
            self.notify.notify_one();
        }
        Ok(failed.len())
    }

    async fn clean_completed(&self, older_than: Duration, limit: usize) -> Result<usize> {
        let cutoff = sub_saturating(self.clock.now(), older_than);
        let mut state = self.state.lock().await;
        Ok(state.sweep(JobState::Completed, cutoff, limit))
    }
}

/// Non-production fallback: an unavailable inner queue yields a synthetic
/// `degraded-…` job id instead of an error. Degraded jobs are logged, never sent.
pub struct DegradingQueue {
    inner: Arc<dyn DeliveryQueue>,
    ids: Arc<dyn IdGenerator>,
    degraded: AtomicU64,
}

impl DegradingQueue {
    pub fn new(inner: Arc<dyn DeliveryQueue>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            inner,
            ids,
            degraded: AtomicU64::new(0),
        }
    }

    pub fn degraded_count(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }
}

pub fn is_degraded_job_id(job_id: &str) -> bool {
    job_id.starts_with(DEGRADED_PREFIX)
}

#[async_trait]
impl DeliveryQueue for DegradingQueue {
    async fn enqueue(&self, job: DeliveryJob, options: EnqueueOptions) -> Result<JobId> {
        let log_id = job.log_id;
        match self.inner.enqueue(job, options).await {
            Err(Error::QueueUnavailable(reason)) => {
                self.degraded.fetch_add(1, Ordering::Relaxed);
                let id = format!("{}{}", DEGRADED_PREFIX, self.ids.next_id());
                warn!(
                    degraded = true,
                    job_id = %id,
                    log_id = %log_id,
                    reason = %reason,
                    "Queue unavailable; job logged but will not be delivered"
                );
                Ok(id)
            }
            other => other,
        }
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobSnapshot>> {
        if is_degraded_job_id(job_id) {
            return Ok(None);
        }
        self.inner.get_job(job_id).await
    }

    async fn remove(&self, job_id: &str) -> Result<bool> {
        if is_degraded_job_id(job_id) {
            return Ok(false);
        }
        self.inner.remove(job_id).await
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    async fn close(&self) {
        self.inner.close().await
    }

    async fn metrics(&self) -> Result<QueueMetrics> {
        let mut metrics = self.inner.metrics().await?;
        metrics.degraded = self.degraded_count();
        Ok(metrics)
    }

    async fn retry_failed(&self) -> Result<usize> {
        self.inner.retry_failed().await
    }

    async fn clean_completed(&self, older_than: Duration, limit: usize) -> Result<usize> {
        self.inner.clean_completed(older_than, limit).await
    }
}
