//! [`WorkerLoop`] – the one thread that performs device I/O.
//!
//! The worker owns a Tokio current-thread runtime on a dedicated OS thread.
//! Any thread may [`submit`](WorkerLoop::submit) a future; it is shipped over
//! an unbounded queue, spawned on the worker, and its result comes back on a
//! one-shot completion channel read through a [`TaskHandle`].
//!
//! Every task is bound to a [`CancellationToken`] that is a child of the
//! loop's root token. [`WorkerLoop::stop`] cancels the root, which cancels
//! every task, waits for them to wind down and reports how many were still
//! pending. If the drain overruns its timeout the thread is detached rather
//! than joined.
//!
//! Never call [`TaskHandle::wait`] from inside a task: the worker is single
//! threaded, so the wait can only end by timing out.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use rollbot_runtime::worker::WorkerLoop;
//!
//! let worker = WorkerLoop::new("doc");
//! worker.start().unwrap();
//!
//! let handle = worker.submit(async { Ok(21 * 2) }).unwrap();
//! assert_eq!(handle.wait(Duration::from_secs(1)).unwrap(), 42);
//!
//! assert_eq!(worker.stop(Duration::from_secs(1)), 0);
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use rollbot_types::RollError;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

// ─────────────────────────────────────────────────────────────────────────────
// TaskHandle
// ─────────────────────────────────────────────────────────────────────────────

/// Caller-side view of one submitted task.
pub struct TaskHandle<T> {
    id: u64,
    token: CancellationToken,
    done: Receiver<Result<T, RollError>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the task finishes or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// The task's own error, [`RollError::Timeout`] if it is still running,
    /// or [`RollError::Cancelled`] if it was cancelled or dropped before
    /// producing a result.
    pub fn wait(&self, timeout: Duration) -> Result<T, RollError> {
        match self.done.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(RollError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(RollError::Cancelled),
        }
    }

    /// The result if the task has already finished.
    pub fn try_result(&self) -> Option<Result<T, RollError>> {
        match self.done.try_recv() {
            Ok(result) => Some(result),
            Err(crossbeam_channel::TryRecvError::Empty) => None,
            Err(crossbeam_channel::TryRecvError::Disconnected) => Some(Err(RollError::Cancelled)),
        }
    }

    /// Request cooperative cancellation. The task stops at its next await
    /// point and the handle resolves to [`RollError::Cancelled`].
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WorkerLoop
// ─────────────────────────────────────────────────────────────────────────────

struct Running {
    jobs: mpsc::UnboundedSender<Job>,
    root: CancellationToken,
    drained: Receiver<usize>,
    thread: JoinHandle<()>,
}

/// A dedicated I/O thread with a cooperative scheduler.
pub struct WorkerLoop {
    name: String,
    running: Mutex<Option<Running>>,
    next_id: AtomicU64,
    pending: Arc<AtomicUsize>,
}

impl WorkerLoop {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: Mutex::new(None),
            next_id: AtomicU64::new(1),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawn the worker thread. Calling it again while running is a no-op.
    ///
    /// # Errors
    ///
    /// [`RollError::WorkerUnavailable`] if the runtime or the thread cannot
    /// be created.
    pub fn start(&self) -> Result<(), RollError> {
        let mut running = lock(&self.running);
        if running.as_ref().is_some_and(|r| !r.thread.is_finished()) {
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                error!(error = %e, "failed to build worker runtime");
                RollError::WorkerUnavailable
            })?;

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel::<Job>();
        let (drained_tx, drained_rx) = bounded::<usize>(1);
        let root = CancellationToken::new();
        let loop_root = root.clone();
        let name = self.name.clone();

        let thread = thread::Builder::new()
            .name(format!("rollbot-worker-{name}"))
            .spawn(move || {
                let cancelled = runtime.block_on(primary_loop(jobs_rx, loop_root));
                debug!(worker = %name, cancelled, "worker drained");
                let _ = drained_tx.send(cancelled);
            })
            .map_err(|e| {
                error!(error = %e, "failed to spawn worker thread");
                RollError::WorkerUnavailable
            })?;

        info!(worker = %self.name, "worker started");
        *running = Some(Running {
            jobs: jobs_tx,
            root,
            drained: drained_rx,
            thread,
        });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running)
            .as_ref()
            .is_some_and(|r| !r.root.is_cancelled() && !r.thread.is_finished())
    }

    /// A token that is cancelled when the loop stops. Already cancelled if
    /// the loop is not running.
    pub fn child_token(&self) -> CancellationToken {
        match lock(&self.running).as_ref() {
            Some(r) => r.root.child_token(),
            None => {
                let t = CancellationToken::new();
                t.cancel();
                t
            }
        }
    }

    /// Tasks submitted but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Run `fut` on the worker under a fresh child token.
    ///
    /// # Errors
    ///
    /// [`RollError::WorkerUnavailable`] if the loop is not running.
    pub fn submit<F, T>(&self, fut: F) -> Result<TaskHandle<T>, RollError>
    where
        F: Future<Output = Result<T, RollError>> + Send + 'static,
        T: Send + 'static,
    {
        let token = self.child_token();
        self.submit_with_token(fut, token)
    }

    /// Run `fut` on the worker, cancelled when `token` is. Pass a token from
    /// [`child_token`](Self::child_token) so that stopping the loop cancels
    /// it too.
    pub fn submit_with_token<F, T>(
        &self,
        fut: F,
        token: CancellationToken,
    ) -> Result<TaskHandle<T>, RollError>
    where
        F: Future<Output = Result<T, RollError>> + Send + 'static,
        T: Send + 'static,
    {
        let running = lock(&self.running);
        let Some(r) = running.as_ref().filter(|r| !r.root.is_cancelled()) else {
            return Err(RollError::WorkerUnavailable);
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = bounded(1);
        let task_token = token.clone();
        self.pending.fetch_add(1, Ordering::AcqRel);
        let pending = PendingGuard(Arc::clone(&self.pending));

        let job: Job = Box::pin(async move {
            let _pending = pending;
            let result = tokio::select! {
                biased;
                _ = task_token.cancelled() => Err(RollError::Cancelled),
                r = fut => r,
            };
            let _ = done_tx.send(result);
        });

        // On failure the job is dropped here, and with it the pending guard
        // and the completion sender.
        r.jobs.send(job).map_err(|_| RollError::WorkerUnavailable)?;

        Ok(TaskHandle {
            id,
            token,
            done: done_rx,
        })
    }

    /// Cancel everything and wait up to `timeout` for the worker to drain.
    ///
    /// Returns the number of tasks that were still pending. Idle and
    /// never-started loops return `0` immediately.
    pub fn stop(&self, timeout: Duration) -> usize {
        let Some(running) = lock(&self.running).take() else {
            return 0;
        };
        running.root.cancel();
        drop(running.jobs);

        match running.drained.recv_timeout(timeout) {
            Ok(cancelled) => {
                if running.thread.join().is_err() {
                    warn!(worker = %self.name, "worker thread panicked");
                }
                info!(worker = %self.name, cancelled, "worker stopped");
                cancelled
            }
            Err(_) => {
                let stuck = self.pending();
                warn!(
                    worker = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    stuck,
                    "worker did not drain in time, detaching thread"
                );
                stuck
            }
        }
    }
}

impl Drop for WorkerLoop {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().ok().and_then(Option::take) {
            running.root.cancel();
        }
    }
}

/// Runs on the worker thread until the root token is cancelled or every
/// submitter is gone. Returns how many tasks were cancelled by the shutdown.
async fn primary_loop(mut jobs: mpsc::UnboundedReceiver<Job>, root: CancellationToken) -> usize {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = root.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => {
                    tasks.spawn(job);
                }
                None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if matches!(joined, Err(ref e) if e.is_panic()) {
                    error!("worker task panicked");
                }
            }
        }
    }

    // Queued jobs that never started count as cancelled.
    jobs.close();
    let mut cancelled = 0;
    while jobs.try_recv().is_ok() {
        cancelled += 1;
    }

    cancelled += tasks.len();
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    cancelled
}

struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
