//! Single dedicated worker thread with a FIFO job queue.
//!
//! A `SerialWorker` runs exactly one job at a time, in submission order, on
//! one named thread. It is the admission-control primitive of the viewer:
//! every expensive decode goes through one of these, so no two of them ever
//! allocate at the same time.

use crate::CancellationToken;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, trace};

/// Unique identifier for a submitted job
pub type JobId = u64;

/// Errors returned by [`SerialWorker`].
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The worker thread could not be spawned
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
    /// The worker has been shut down and accepts no more jobs
    #[error("worker `{0}` has shut down")]
    ShutDown(String),
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueuedJob {
    id: JobId,
    task: Task,
}

struct QueueState {
    jobs: VecDeque<QueuedJob>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    available: Condvar,
    executed: AtomicU64,
}

/// A single worker thread draining a FIFO queue.
///
/// # Example
///
/// ```
/// use media_viewer_scheduler::SerialWorker;
///
/// let worker = SerialWorker::new("decode").unwrap();
/// let handle = worker.submit(|_token| 6 * 7).unwrap();
/// assert_eq!(handle.wait(), Some(42));
/// ```
pub struct SerialWorker {
    name: String,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl SerialWorker {
    /// Spawn the worker thread.
    pub fn new(name: impl Into<String>) -> Result<Self, SchedulerError> {
        let name = name.into();
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
            executed: AtomicU64::new(0),
        });

        let thread = {
            let shared = shared.clone();
            let name = name.clone();
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || Self::run(&name, &shared))?
        };
        let thread_id = thread.thread().id();
        debug!(worker = %name, "worker started");

        Ok(Self {
            name,
            shared,
            next_id: AtomicU64::new(1),
            thread: Mutex::new(Some(thread)),
            thread_id,
        })
    }

    /// Queue a job.
    ///
    /// The job receives its own cancellation token and always runs, even
    /// when cancelled before it was dequeued: it is expected to check the
    /// token and finish early.
    pub fn submit<F, T>(&self, job: F) -> Result<JobHandle<T>, SchedulerError>
    where
        F: FnOnce(&CancellationToken) -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let completion = Arc::new(Completion::new());

        let task: Task = {
            let token = token.clone();
            let mut guard = CompletionGuard(Some(completion.clone()));
            Box::new(move || {
                let value = job(&token);
                if let Some(completion) = guard.0.take() {
                    completion.finish(Some(value));
                }
            })
        };

        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(SchedulerError::ShutDown(self.name.clone()));
        }
        queue.jobs.push_back(QueuedJob { id, task });
        drop(queue);
        self.shared.available.notify_one();
        trace!(worker = %self.name, job_id = id, "job queued");

        Ok(JobHandle {
            id,
            token,
            completion,
        })
    }

    /// Name of the worker thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of jobs waiting to run.
    pub fn queued_jobs(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    /// Number of jobs taken off the queue so far.
    pub fn jobs_executed(&self) -> u64 {
        self.shared.executed.load(Ordering::Acquire)
    }

    /// Check if the worker has stopped accepting jobs.
    pub fn is_shut_down(&self) -> bool {
        self.shared.queue.lock().shutdown
    }

    /// Stop accepting jobs, run the ones already queued, then join the thread.
    ///
    /// Safe to call more than once. When called from the worker thread itself
    /// the join is skipped.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if !queue.shutdown {
                queue.shutdown = true;
                debug!(worker = %self.name, pending = queue.jobs.len(), "worker shutting down");
            }
        }
        self.shared.available.notify_all();

        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!(worker = %self.name, "worker thread terminated abnormally");
            }
        }
    }

    fn run(name: &str, shared: &Shared) {
        loop {
            let job = {
                let mut queue = shared.queue.lock();
                loop {
                    if let Some(job) = queue.jobs.pop_front() {
                        break job;
                    }
                    if queue.shutdown {
                        debug!(worker = %name, "worker stopped");
                        return;
                    }
                    shared.available.wait(&mut queue);
                }
            };

            shared.executed.fetch_add(1, Ordering::AcqRel);
            trace!(worker = %name, job_id = job.id, "job started");
            if panic::catch_unwind(AssertUnwindSafe(job.task)).is_err() {
                error!(worker = %name, job_id = job.id, "job panicked");
            }
        }
    }
}

impl Drop for SerialWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SerialWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialWorker")
            .field("name", &self.name)
            .field("queued_jobs", &self.queued_jobs())
            .field("jobs_executed", &self.jobs_executed())
            .finish()
    }
}

enum Slot<T> {
    Pending,
    Done(Option<T>),
    Taken,
}

struct Completion<T> {
    slot: Mutex<Slot<T>>,
    done: Condvar,
}

impl<T> Completion<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending),
            done: Condvar::new(),
        }
    }

    fn finish(&self, value: Option<T>) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Done(value);
            self.done.notify_all();
        }
    }
}

/// Completes the job with `None` if the task is dropped without finishing,
/// whether it panicked or was never run.
struct CompletionGuard<T>(Option<Arc<Completion<T>>>);

impl<T> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        if let Some(completion) = self.0.take() {
            completion.finish(None);
        }
    }
}

/// Handle to a submitted job.
pub struct JobHandle<T> {
    id: JobId,
    token: CancellationToken,
    completion: Arc<Completion<T>>,
}

impl<T> JobHandle<T> {
    /// Id of the job, unique per worker.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// The token the job observes.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Request cooperative cancellation of the job.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check if the job has finished (or will never run).
    pub fn is_finished(&self) -> bool {
        !matches!(*self.completion.slot.lock(), Slot::Pending)
    }

    /// Block until the job finishes and return its value.
    ///
    /// Returns `None` if the job panicked or was dropped without running.
    pub fn wait(self) -> Option<T> {
        let mut slot = self.completion.slot.lock();
        while matches!(*slot, Slot::Pending) {
            self.completion.done.wait(&mut slot);
        }
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Done(value) => value,
            Slot::Pending | Slot::Taken => None,
        }
    }
}

impl<T> std::fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("cancelled", &self.token.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    #[test]
    fn test_worker_runs_job_and_returns_value() {
        let worker = SerialWorker::new("test-worker").unwrap();
        assert_eq!(worker.name(), "test-worker");

        let handle = worker.submit(|_| String::from("done")).unwrap();
        assert_eq!(handle.wait().as_deref(), Some("done"));
        assert_eq!(worker.jobs_executed(), 1);
    }

    #[test]
    fn test_jobs_run_in_fifo_order_on_one_thread() {
        let worker = SerialWorker::new("fifo").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let order = order.clone();
                worker
                    .submit(move |_| {
                        order.lock().push(i);
                        thread::current().name().map(str::to_owned)
                    })
                    .unwrap()
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.wait().flatten().as_deref(), Some("fifo"));
        }
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_jobs_never_overlap() {
        let worker = SerialWorker::new("exclusive").unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = running.clone();
                let overlapped = overlapped.clone();
                worker
                    .submit(move |_| {
                        if running.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlapped.store(true, Ordering::SeqCst);
                        }
                        thread::sleep(Duration::from_millis(2));
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .unwrap()
            })
            .collect();

        for handle in handles {
            handle.wait();
        }
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancelled_job_still_runs_and_sees_token() {
        let worker = SerialWorker::new("cancel").unwrap();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));

        // Block the worker so the second job is cancelled while queued
        let blocker = {
            let gate = gate.clone();
            worker
                .submit(move |_| {
                    let (open, cvar) = &*gate;
                    let mut open = open.lock();
                    while !*open {
                        cvar.wait(&mut open);
                    }
                })
                .unwrap()
        };
        while worker.jobs_executed() == 0 {
            thread::yield_now();
        }
        let handle = worker.submit(|token| token.is_cancelled()).unwrap();
        handle.cancel();
        assert!(handle.token().is_cancelled());
        assert!(!handle.is_finished());
        assert_eq!(worker.queued_jobs(), 1);

        {
            let (open, cvar) = &*gate;
            *open.lock() = true;
            cvar.notify_all();
        }
        blocker.wait();
        assert_eq!(handle.wait(), Some(true));
    }

    #[test]
    fn test_panicking_job_is_contained() {
        let worker = SerialWorker::new("panics").unwrap();

        let failed = worker.submit(|_| -> u32 { panic!("boom") }).unwrap();
        assert_eq!(failed.wait(), None);

        let next = worker.submit(|_| 7).unwrap();
        assert_eq!(next.wait(), Some(7));
        assert_eq!(worker.jobs_executed(), 2);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let worker = SerialWorker::new("closed").unwrap();
        worker.shutdown();
        worker.shutdown();
        assert!(worker.is_shut_down());

        let result = worker.submit(|_| ());
        assert!(matches!(result, Err(SchedulerError::ShutDown(name)) if name == "closed"));
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let worker = SerialWorker::new("drain").unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let count = count.clone();
            worker
                .submit(move |_| {
                    thread::sleep(Duration::from_millis(1));
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        drop(worker);

        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_job_ids_are_unique() {
        let worker = SerialWorker::new("ids").unwrap();
        let a = worker.submit(|_| ()).unwrap();
        let b = worker.submit(|_| ()).unwrap();
        assert_ne!(a.id(), b.id());
        a.wait();
        b.wait();
    }
}
