//! This module provides the task pooling features movement attempts are executed on.

use std::any::Any;
use std::fmt;
use std::num::NonZeroU8;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{self, AbortHandle, Future, FutureExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::Instrument;

type Task = future::BoxFuture<'static, ()>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("task pool is not started")]
    Closed,
    #[error("task was aborted")]
    Aborted,
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// A task id, unique for the whole process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static TASK_ID: AtomicU64 = AtomicU64::new(0);
        Self(TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A handle on a task submitted to a [`Pool`].
///
/// It identifies the task among completions and allows to cancel it.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    abort: AbortHandle,
}

impl TaskHandle {
    pub(crate) fn new(abort: AbortHandle) -> Self {
        Self { id: TaskId::next(), abort }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Cancel the task.
    ///
    /// The task completes with an [`Error::Aborted`] outcome unless it already completed.
    #[inline]
    pub fn abort(&self) {
        self.abort.abort()
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }
}

/// A terminated task, as yielded by [`Completions`].
#[derive(Debug)]
pub struct Completed<T> {
    pub id: TaskId,
    pub outcome: Result<T, Error>,
}

/// The receiving part of a [`Pool`], yielding tasks in completion order, not submission order.
#[derive(Debug)]
pub struct Completions<T> {
    receiver: mpsc::UnboundedReceiver<Completed<T>>,
}

impl<T> Completions<T> {
    /// Wait for the next task to complete.
    ///
    /// Return `None` once the pool has been closed and all its tasks are exhausted.
    /// This method is cancel-safe.
    #[inline]
    pub async fn take(&mut self) -> Option<Completed<T>> {
        self.receiver.recv().await
    }
}

impl<T> From<mpsc::UnboundedReceiver<Completed<T>>> for Completions<T> {
    #[inline]
    fn from(receiver: mpsc::UnboundedReceiver<Completed<T>>) -> Self {
        Self { receiver }
    }
}

/// Create a task pool together with the queue its completed tasks are pushed to.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use mover::task;
/// let (mut pool, mut completions) = task::pool();
/// pool.start(3.try_into().unwrap());
///
/// let handle = pool.submit(async { "Hello world!" }).unwrap();
///
/// let completed = completions.take().await.unwrap();
/// assert_eq!(completed.id, handle.id());
/// assert_eq!(completed.outcome, Ok("Hello world!"));
///
/// pool.close().await;
/// assert!(completions.take().await.is_none());
/// # })
/// ```
pub fn pool<T: Send + 'static>() -> (Pool<T>, Completions<T>) {
    let (sender, receiver) = mpsc::unbounded_channel();

    let pool = Pool {
        workers: vec![],
        sender: None,
        completions: sender,
    };

    (pool, Completions { receiver })
}

/// A task pool executing asynchronous tasks in the background and reporting their outcome on completion.
#[derive(Debug)]
pub struct Pool<T> {
    /// The pool of workers.
    workers: Vec<Worker>,
    /// The sending part of a channel to push tasks to the workers.
    ///
    /// The next available worker will wait for a task to be received through the channel.
    sender: Option<mpsc::UnboundedSender<Task>>,
    /// The sending part of the completion queue, cloned into every submitted task.
    completions: mpsc::UnboundedSender<Completed<T>>,
}

impl<T: Send + 'static> Pool<T> {
    /// Start a pool with `size` workers.
    ///
    /// # Panics
    /// This method panics if the pool is already running, ie. when called more than once without stopping the pool in between.
    pub fn start(&mut self, size: NonZeroU8) {
        assert!(self.sender.is_none() && self.workers.is_empty());

        let (sender, receiver) = mpsc::unbounded_channel();

        let receiver = Arc::new(Mutex::new(receiver));

        static WORKER_ID: AtomicUsize = AtomicUsize::new(0);
        let size = size.get().into();
        let id = WORKER_ID.fetch_add(size, Ordering::Relaxed);

        self.workers = (0..size).map(|i| Worker::new(id.wrapping_add(i), Arc::clone(&receiver))).collect();
        self.sender = Some(sender);
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.sender.is_some()
    }

    /// Send a task and keep a handle on it.
    ///
    /// Whatever the way the task terminates (output, abort or panic), a [`Completed`] entry is pushed to the completion queue.
    pub fn submit(&self, future: impl Future<Output = T> + Send + 'static) -> Result<TaskHandle, Error> {
        let sender = self.sender.as_ref().ok_or(Error::Closed)?;

        let (abortable, abort_handle) = future::abortable(AssertUnwindSafe(future).catch_unwind());
        let handle = TaskHandle::new(abort_handle);

        let id = handle.id;
        let completions = self.completions.clone();

        let task = async move {
            let outcome = match abortable.await {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(panic)) => Err(Error::Panicked(panic_message(panic))),
                Err(future::Aborted) => Err(Error::Aborted),
            };

            // the completion queue may already be dropped when shutting down
            let _ = completions.send(Completed { id, outcome });
        };

        sender.send(task.boxed()).map_err(|_| Error::Closed)?;

        Ok(handle)
    }

    /// Stop current pool of workers, waiting for all pending tasks to complete.
    ///
    /// Once stopped, the pool can be started again with any number of workers.
    pub async fn stop(&mut self) {
        drop(self.sender.take());
        let workers = std::mem::take(&mut self.workers);

        future::join_all(workers.into_iter().inspect(|worker| {
            tracing::debug!("Stopping worker {}...", worker.id);
        }))
        .await;
    }

    /// Close current pool of workers, waiting for all pending tasks to complete.
    ///
    /// Once closed, the completion queue yields its remaining entries and then `None`.
    pub async fn close(mut self) {
        self.stop().await
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(msg) => *msg,
        Err(panic) => panic.downcast_ref::<&str>().map_or_else(|| "unknown panic".to_owned(), |msg| (*msg).to_owned()),
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: tokio::task::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>) -> Worker {
        tracing::debug!("Starting worker {id}...");

        Worker {
            id,
            handle: tokio::spawn(async move {
                loop {
                    let message = receiver.lock().await.recv().await;

                    match message {
                        Some(task) => {
                            tracing::trace!("Executing task on worker {id}...");

                            task.await;
                        }
                        None => {
                            tracing::debug!("All tasks exhausted, shutting down worker {id}.");
                            break;
                        }
                    }
                }
            }
            .in_current_span()),
        }
    }
}

impl Future for Worker {
    type Output = Result<(), tokio::task::JoinError>;

    #[inline]
    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        self.handle.poll_unpin(cx)
    }
}
