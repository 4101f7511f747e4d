//! FIFO job scheduling with a concurrency cap.
//!
//! Every unit of outbound work (a request, a connection attempt) runs as
//! a job on a [`JobQueue`]. The queue admits jobs in arrival order and
//! keeps at most `limit` of them active at once; a job stays active
//! until its [`JobContext::complete`] is called, which is what lets a
//! request job remain "running" while the reply is still in flight.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type JobFn = Box<dyn FnOnce(JobContext) -> BoxFuture + Send>;

/// Callback fired whenever the queue empties out completely.
pub type DrainedFn = Arc<dyn Fn() + Send + Sync>;
/// Callback fired when the queue is aborted, with the reason.
pub type AbortFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Scheduler misuse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// [`JobQueue::start`] was called twice.
    #[error("queue already started")]
    AlreadyStarted,
    /// A concurrency limit of zero was requested.
    #[error("concurrency limit must be at least 1")]
    InvalidLimit,
    /// [`JobContext::complete`] was called twice for the same job.
    #[error("job completed more than once")]
    DoubleCompletion,
}

struct QueueState {
    pending: VecDeque<JobFn>,
    active: usize,
    /// 0 means unlimited.
    limit: usize,
    started: bool,
    aborted: bool,
    on_drained: Option<DrainedFn>,
    on_abort: Option<AbortFn>,
}

impl QueueState {
    fn can_dispatch(&self) -> bool {
        self.started
            && !self.aborted
            && !self.pending.is_empty()
            && (self.limit == 0 || self.active < self.limit)
    }
}

/// A started-once FIFO queue of async jobs.
///
/// Cloning is cheap and every clone addresses the same queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Mutex<QueueState>>,
}

impl JobQueue {
    /// An empty, not-yet-started queue with no concurrency limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueState {
                pending: VecDeque::new(),
                active: 0,
                limit: 0,
                started: false,
                aborted: false,
                on_drained: None,
                on_abort: None,
            })),
        }
    }

    /// Cap how many jobs may be active at once. Must be called before
    /// the cap matters; raising it later does not retroactively dispatch.
    pub fn set_limit(&self, limit: usize) -> Result<(), SchedulerError> {
        if limit == 0 {
            return Err(SchedulerError::InvalidLimit);
        }
        self.inner.lock().limit = limit;
        dispatch(&self.inner);
        Ok(())
    }

    /// Register the queue-drained callback.
    pub fn on_drained(&self, hook: DrainedFn) {
        self.inner.lock().on_drained = Some(hook);
    }

    /// Register the abort callback.
    pub fn on_abort(&self, hook: AbortFn) {
        self.inner.lock().on_abort = Some(hook);
    }

    /// Add a job. Runs immediately if the queue is started and below its
    /// limit, otherwise waits its turn. After an abort the job is still
    /// accepted but will never be dispatched.
    pub fn enqueue<F, Fut>(&self, job: F)
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        {
            let mut state = self.inner.lock();
            if state.aborted {
                debug!("job enqueued after abort; it will not run");
            }
            state.pending.push_back(Box::new(move |ctx| Box::pin(job(ctx))));
        }
        dispatch(&self.inner);
    }

    /// Begin running jobs. Starting an empty queue fires the drained
    /// callback on the next scheduler tick.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let drained = {
            let mut state = self.inner.lock();
            if state.started {
                return Err(SchedulerError::AlreadyStarted);
            }
            state.started = true;
            if state.pending.is_empty() && state.active == 0 {
                state.on_drained.clone()
            } else {
                None
            }
        };
        if let Some(hook) = drained {
            tokio::spawn(async move { hook() });
        } else {
            dispatch(&self.inner);
        }
        Ok(())
    }

    /// Halt all further dispatch. Idempotent; only the first call fires
    /// the abort callback. Pending jobs stay queued but never run, and
    /// jobs already running are left to finish.
    pub fn abort(&self, reason: &str) {
        abort_queue(&self.inner, reason);
    }

    /// Jobs waiting for a slot.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Jobs currently holding a slot.
    #[must_use]
    pub fn active_len(&self) -> usize {
        self.inner.lock().active
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn abort_queue(inner: &Arc<Mutex<QueueState>>, reason: &str) {
    let hook = {
        let mut state = inner.lock();
        if state.aborted {
            return;
        }
        state.aborted = true;
        debug!(stranded = state.pending.len(), reason, "queue aborted");
        state.on_abort.clone()
    };
    if let Some(hook) = hook {
        hook(reason);
    }
}

/// Spawn every job the queue is currently allowed to run.
fn dispatch(inner: &Arc<Mutex<QueueState>>) {
    let mut runnable = Vec::new();
    {
        let mut state = inner.lock();
        while state.can_dispatch() {
            if let Some(job) = state.pending.pop_front() {
                state.active += 1;
                runnable.push(job);
            }
        }
    }
    for job in runnable {
        let ctx = JobContext {
            queue: Arc::clone(inner),
            completed: Arc::new(AtomicBool::new(false)),
        };
        tokio::spawn(job(ctx));
    }
}

/// Handle a running job uses to release its slot.
#[derive(Clone)]
pub struct JobContext {
    queue: Arc<Mutex<QueueState>>,
    completed: Arc<AtomicBool>,
}

impl JobContext {
    /// Release this job's slot, letting the next pending job run. Fires
    /// the drained callback if this was the last job anywhere in the
    /// queue.
    pub fn complete(&self) -> Result<(), SchedulerError> {
        if self.completed.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::DoubleCompletion);
        }
        let drained = {
            let mut state = self.queue.lock();
            state.active = state.active.saturating_sub(1);
            if state.aborted {
                None
            } else if state.pending.is_empty() && state.active == 0 {
                state.on_drained.clone()
            } else {
                None
            }
        };
        if let Some(hook) = drained {
            hook();
        } else {
            dispatch(&self.queue);
        }
        Ok(())
    }

    /// Request a whole-queue abort on behalf of this job.
    pub fn abort(&self, reason: &str) {
        abort_queue(&self.queue, reason);
    }

    /// A context bound to a throwaway queue, for exercising code that
    /// needs one outside a real dispatch.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            queue: Arc::new(Mutex::new(QueueState {
                pending: VecDeque::new(),
                active: 1,
                limit: 0,
                started: false,
                aborted: false,
                on_drained: None,
                on_abort: None,
            })),
            completed: Arc::new(AtomicBool::new(false)),
        }
    }
}
