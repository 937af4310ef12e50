/// Concurrency Controller - Bounded Job Scheduling
///
/// **Model:**
/// - Fixed set of worker tasks, each taking one whole job at a time
/// - Jobs beyond the worker count wait in a FIFO queue with a hard depth limit
/// - Admission counts running plus waiting jobs; past
///   `workers + max_queue_depth` submissions fail fast with `BackPressure`
/// - Unknown languages are answered immediately, never queued
///
/// **Cancellation:**
/// - Queued job: removed from the queue, handle resolves to `Cancelled`
/// - Running job: its token fires, the supervisor kills the process group,
///   the workspace is released on the way out
///
/// **Isolation:**
/// Each job runs in its own spawned task so a panic surfaces as a
/// `JoinError` at the worker boundary and becomes an InternalError result.
use crate::error::JudgeError;
use crate::evaluator;
use crate::executor::JudgeEngine;
use judge_common::types::{Job, JobResult};
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Reply = oneshot::Sender<Result<JobResult, JudgeError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub active: usize,
    pub queued: usize,
    pub peak_active: usize,
    pub completed: u64,
    pub rejected: u64,
}

/// Caller's view of a submitted job
#[derive(Debug)]
pub struct JobHandle {
    ticket: u64,
    job_id: String,
    cancel: CancellationToken,
    receiver: oneshot::Receiver<Result<JobResult, JudgeError>>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.job_id
    }

    /// Wait for the job's final result
    pub async fn result(self) -> Result<JobResult, JudgeError> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(JudgeError::ShutDown),
        }
    }
}

struct QueuedJob {
    ticket: u64,
    job: Job,
    cancel: CancellationToken,
    reply: Reply,
}

/// Waiting and running jobs under one lock: an admitted job is always in
/// exactly one of the two until it settles
#[derive(Default)]
struct Backlog {
    waiting: VecDeque<QueuedJob>,
    running: HashMap<u64, CancellationToken>,
}

impl Backlog {
    fn admitted(&self) -> usize {
        self.waiting.len() + self.running.len()
    }
}

struct Shared {
    engine: Arc<JudgeEngine>,
    backlog: Mutex<Backlog>,
    work_available: Notify,
    stopping: CancellationToken,
    closed: AtomicBool,
    max_queue_depth: usize,
    workers: usize,
    next_ticket: AtomicU64,
    peak_active: AtomicUsize,
    completed: AtomicU64,
    rejected: AtomicU64,
}

pub struct JudgePool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JudgePool {
    /// Spawn `pool_size` workers on the current runtime
    pub fn start(engine: Arc<JudgeEngine>) -> Self {
        let workers = engine.config().pool_size.max(1);
        let shared = Arc::new(Shared {
            max_queue_depth: engine.config().max_queue_depth,
            engine,
            backlog: Mutex::new(Backlog::default()),
            work_available: Notify::new(),
            stopping: CancellationToken::new(),
            closed: AtomicBool::new(false),
            workers,
            next_ticket: AtomicU64::new(1),
            peak_active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        });

        let handles = (0..workers)
            .map(|worker_id| tokio::spawn(worker_loop(Arc::clone(&shared), worker_id)))
            .collect();

        info!(workers = workers, max_queue_depth = shared.max_queue_depth, "Judge pool started");

        Self {
            shared,
            handles: Mutex::new(handles),
        }
    }

    pub fn engine(&self) -> &Arc<JudgeEngine> {
        &self.shared.engine
    }

    /// Admit a job or reject it immediately
    pub fn submit(&self, job: Job) -> Result<JobHandle, JudgeError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(JudgeError::ShutDown);
        }
        if let Err(e) = shared.engine.validate_job(&job) {
            shared.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(e);
        }

        let ticket = shared.next_ticket.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let (reply, receiver) = oneshot::channel();
        let handle = JobHandle {
            ticket,
            job_id: job.id.clone(),
            cancel: cancel.clone(),
            receiver,
        };

        if shared.engine.registry().resolve(&job.language).is_err() {
            debug!(job_id = %job.id, language = %job.language, "Unsupported language, answering without queueing");
            let _ = reply.send(Ok(evaluator::unsupported_language(&job.id, &job.language)));
            shared.completed.fetch_add(1, Ordering::SeqCst);
            return Ok(handle);
        }

        {
            let mut backlog = lock(&shared.backlog);
            if backlog.admitted() >= shared.workers.saturating_add(shared.max_queue_depth) {
                let depth = backlog.waiting.len();
                shared.rejected.fetch_add(1, Ordering::SeqCst);
                warn!(job_id = %job.id, depth = depth, "Queue full, rejecting job");
                return Err(JudgeError::BackPressure { depth });
            }
            debug!(job_id = %job.id, position = backlog.waiting.len(), "Job queued");
            backlog.waiting.push_back(QueuedJob {
                ticket,
                job,
                cancel,
                reply,
            });
        }
        shared.work_available.notify_one();

        Ok(handle)
    }

    /// Cancel a queued or running job. Returns false if it already finished.
    pub fn cancel(&self, handle: &JobHandle) -> bool {
        handle.cancel.cancel();

        let (queued, running) = {
            let mut backlog = lock(&self.shared.backlog);
            let position = backlog.waiting.iter().position(|q| q.ticket == handle.ticket);
            let queued = position.and_then(|pos| backlog.waiting.remove(pos));
            let running = backlog.running.contains_key(&handle.ticket);
            (queued, running)
        };
        if let Some(queued) = queued {
            info!(job_id = %queued.job.id, "Cancelled queued job");
            let _ = queued.reply.send(Err(JudgeError::Cancelled));
            return true;
        }

        if running {
            info!(job_id = %handle.job_id, "Cancelling running job");
        }
        running
    }

    /// Cancel every queued and running job
    pub fn cancel_all(&self) {
        let drained: Vec<QueuedJob> = {
            let mut backlog = lock(&self.shared.backlog);
            for token in backlog.running.values() {
                token.cancel();
            }
            backlog.waiting.drain(..).collect()
        };
        for queued in drained {
            queued.cancel.cancel();
            let _ = queued.reply.send(Err(JudgeError::Cancelled));
        }
    }

    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        let (active, queued) = {
            let backlog = lock(&shared.backlog);
            (backlog.running.len(), backlog.waiting.len())
        };
        PoolStats {
            workers: shared.workers,
            active,
            queued,
            peak_active: shared.peak_active.load(Ordering::SeqCst),
            completed: shared.completed.load(Ordering::SeqCst),
            rejected: shared.rejected.load(Ordering::SeqCst),
        }
    }

    /// Stop admitting jobs, let workers drain the queue, then wait for them
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.stopping.cancel();

        let handles = std::mem::take(&mut *lock(&self.handles));
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Judge pool shut down");
    }
}

async fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
    debug!(worker_id = worker_id, "Worker started");
    loop {
        let next = shared.take_next();
        match next {
            Some(queued) => shared.run_job(queued, worker_id).await,
            None if shared.stopping.is_cancelled() => break,
            None => {
                tokio::select! {
                    _ = shared.work_available.notified() => {}
                    _ = shared.stopping.cancelled() => {}
                }
            }
        }
    }
    debug!(worker_id = worker_id, "Worker stopped");
}

impl Shared {
    /// Pop the oldest waiting job and mark it running in the same critical section
    fn take_next(&self) -> Option<QueuedJob> {
        let mut backlog = lock(&self.backlog);
        let queued = backlog.waiting.pop_front()?;
        backlog.running.insert(queued.ticket, queued.cancel.clone());
        self.peak_active.fetch_max(backlog.running.len(), Ordering::SeqCst);
        Some(queued)
    }

    async fn run_job(&self, queued: QueuedJob, worker_id: usize) {
        let QueuedJob {
            ticket,
            job,
            cancel,
            reply,
        } = queued;

        if cancel.is_cancelled() {
            lock(&self.backlog).running.remove(&ticket);
            let _ = reply.send(Err(JudgeError::Cancelled));
            return;
        }

        let job_id = job.id.clone();
        debug!(worker_id = worker_id, job_id = %job_id, "Job started");

        let engine = Arc::clone(&self.engine);
        let task = tokio::spawn(async move { engine.judge(&job, &cancel).await });
        let outcome = settle(&job_id, task.await);

        lock(&self.backlog).running.remove(&ticket);
        self.completed.fetch_add(1, Ordering::SeqCst);

        if reply.send(outcome).is_err() {
            debug!(job_id = %job_id, "Result dropped, handle no longer held");
        }
    }
}

/// Map a finished job task to its outcome; a panic becomes InternalError
fn settle(
    job_id: &str,
    joined: Result<Result<JobResult, JudgeError>, JoinError>,
) -> Result<JobResult, JudgeError> {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            error!(job_id = %job_id, panic = %message, "Job panicked");
            Ok(evaluator::internal_error(
                job_id,
                format!("judge panicked: {}", message),
            ))
        }
        Err(_) => Err(JudgeError::Cancelled),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
