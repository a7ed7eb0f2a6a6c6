//! This module provides the tracking of block movement task completions.
//!
//! Movement attempts are executed concurrently by a task pool while a single tracker loop consumes their completions,
//! groups them by block and reports each group once all the attempts submitted for a block are finished.
//!
//! Two independent stores are shared between producers and the tracker loop:
//! - [`PendingTasks`]: the in-flight task handles per block, protected by a `RwLock`,
//! - [`MovementResults`]: the completed attempts per block, protected by a `Mutex`.
//!
//! Each store operation is atomic on its own, none of them is held across an `.await` point or a handler call.
//! Resets are sequenced with an [`Epoch`] counter bumped under the pending tasks lock, so that completions observed
//! before a reset are neither aggregated nor reported after it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::block::{ExtendedBlock, MovementAttemptFinished};
use crate::config::Config;
use crate::task::{self, Completed, Completions, TaskHandle, TaskId};

/// Reset counter of the tracked state.
pub type Epoch = u64;

#[derive(Debug, Error)]
pub enum Error {
    #[error("block movement tracker is stopped")]
    Stopped,
    #[error(transparent)]
    Task(#[from] task::Error),
}

/// A source of completed tasks, yielded in completion order.
pub trait CompletionSource: Send {
    type Output: Send;

    /// Wait for the next completed task, possibly forever.
    ///
    /// Return `None` once no more task can ever complete. The returned future must be cancel-safe since it is raced against
    /// the tracker stop request.
    fn take(&mut self) -> impl Future<Output = Option<Completed<Self::Output>>> + Send;
}

impl<T: Send> CompletionSource for Completions<T> {
    type Output = T;

    #[inline]
    fn take(&mut self) -> impl Future<Output = Option<Completed<T>>> + Send {
        Completions::take(self)
    }
}

/// A sink notified once per block with all the movement attempts completed for it.
///
/// It is called on the tracker loop itself, so it must not block for long.
pub trait MovementStatusHandler: Send {
    fn handle(&mut self, results: Vec<MovementAttemptFinished>);
}

impl<F> MovementStatusHandler for F
where
    F: FnMut(Vec<MovementAttemptFinished>) + Send,
{
    #[inline]
    fn handle(&mut self, results: Vec<MovementAttemptFinished>) {
        self(results)
    }
}

impl MovementStatusHandler for mpsc::UnboundedSender<Vec<MovementAttemptFinished>> {
    fn handle(&mut self, results: Vec<MovementAttemptFinished>) {
        if let Err(mpsc::error::SendError(results)) = self.send(results) {
            tracing::warn!("Movement results receiver dropped, discarding {} results", results.len());
        }
    }
}

/// State of a pending task group after one of its tasks completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Some tasks are still in flight for the block.
    Outstanding(usize),
    /// The last task completed, the block entry has been removed.
    Closed,
    /// Neither the block nor the task are tracked.
    Untracked,
}

#[derive(Debug, Default)]
struct PendingState {
    tasks: HashMap<ExtendedBlock, HashMap<TaskId, TaskHandle>>,
    /// Reverse index of `tasks`.
    owners: HashMap<TaskId, ExtendedBlock>,
    epoch: Epoch,
    closed: bool,
}

/// In-flight movement task handles per block.
///
/// A block is present if and only if at least one of the tasks submitted for it has not completed yet.
#[derive(Debug, Default)]
pub struct PendingTasks {
    state: RwLock<PendingState>,
}

impl PendingTasks {
    /// Register one in-flight task for `block`.
    ///
    /// Return `false` without registering anything once closed.
    pub fn insert(&self, block: ExtendedBlock, handle: TaskHandle) -> bool {
        let mut state = self.state.write().unwrap();

        if state.closed {
            return false;
        }

        state.register(block, handle);
        true
    }

    /// Submit a task and register it for `block` within the same critical section.
    ///
    /// The task cannot be observed as completed by [`PendingTasks::complete_one()`] before it is registered.
    pub fn insert_with<F>(&self, block: ExtendedBlock, submit: F) -> Result<TaskHandle, Error>
    where
        F: FnOnce() -> Result<TaskHandle, task::Error>,
    {
        let mut state = self.state.write().unwrap();

        if state.closed {
            return Err(Error::Stopped);
        }

        let handle = submit()?;
        state.register(block, handle.clone());

        Ok(handle)
    }

    /// Remove a completed task, and the whole block entry if it was the last in-flight one.
    ///
    /// The returned epoch is the one the completion was observed under.
    pub fn complete_one(&self, block: &ExtendedBlock, id: TaskId) -> (Completion, Epoch) {
        let mut state = self.state.write().unwrap();
        let epoch = state.epoch;

        let Some(tasks) = state.tasks.get_mut(block) else {
            return (Completion::Untracked, epoch);
        };

        if tasks.remove(&id).is_none() {
            return (Completion::Untracked, epoch);
        }
        let remaining = tasks.len();
        state.owners.remove(&id);

        if remaining == 0 {
            state.tasks.remove(block);
            (Completion::Closed, epoch)
        } else {
            (Completion::Outstanding(remaining), epoch)
        }
    }

    /// Find the block a task has been registered for.
    pub fn block_of(&self, id: TaskId) -> Option<ExtendedBlock> {
        self.state.read().unwrap().owners.get(&id).cloned()
    }

    /// Drop all in-flight tasks and start a new epoch.
    pub fn clear(&self) -> (Vec<TaskHandle>, Epoch) {
        self.drain(false)
    }

    /// Drop all in-flight tasks, start a new epoch and refuse any further registration.
    pub fn close(&self) -> (Vec<TaskHandle>, Epoch) {
        self.drain(true)
    }

    fn drain(&self, close: bool) -> (Vec<TaskHandle>, Epoch) {
        let mut state = self.state.write().unwrap();

        state.epoch += 1;
        state.closed |= close;
        state.owners.clear();

        let handles: Vec<_> = state.tasks.drain().flat_map(|(_, tasks)| tasks.into_values()).collect();

        (handles, state.epoch)
    }

    #[inline]
    pub fn epoch(&self) -> Epoch {
        self.state.read().unwrap().epoch
    }

    #[inline]
    pub fn contains(&self, block: &ExtendedBlock) -> bool {
        self.state.read().unwrap().tasks.contains_key(block)
    }

    /// Number of blocks with in-flight tasks.
    #[inline]
    pub fn len(&self) -> usize {
        self.state.read().unwrap().tasks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.state.read().unwrap().tasks.is_empty()
    }
}

impl PendingState {
    fn register(&mut self, block: ExtendedBlock, handle: TaskHandle) {
        self.owners.insert(handle.id(), block.clone());
        self.tasks.entry(block).or_default().insert(handle.id(), handle);
    }
}

#[derive(Debug, Default)]
struct ResultsState {
    /// Completed attempts per block, with the epoch they have been observed under.
    results: HashMap<ExtendedBlock, (Epoch, Vec<MovementAttemptFinished>)>,
    /// Epoch of the last reset, older completions are dropped.
    reset: Epoch,
}

/// Completed movement attempts per block, kept until the whole block group is reported.
#[derive(Debug, Default)]
pub struct MovementResults {
    state: Mutex<ResultsState>,
}

impl MovementResults {
    /// Append a completed attempt to its block list, in completion order.
    ///
    /// Return `false` when the attempt has been observed before the last reset, in which case it is dropped.
    pub fn append(&self, result: MovementAttemptFinished, epoch: Epoch) -> bool {
        let mut state = self.state.lock().unwrap();

        if epoch < state.reset {
            return false;
        }

        let (entry_epoch, results) = state.results.entry(result.block().clone()).or_default();

        if *entry_epoch > epoch {
            return false;
        }

        // leftovers of a group dropped by a reset not applied here yet
        if *entry_epoch < epoch {
            *entry_epoch = epoch;
            results.clear();
        }

        results.push(result);
        true
    }

    /// Remove and return all the attempts completed for `block`.
    pub fn take_and_clear(&self, block: &ExtendedBlock) -> Vec<MovementAttemptFinished> {
        self.state
            .lock()
            .unwrap()
            .results
            .remove(block)
            .map(|(_, results)| results)
            .unwrap_or_default()
    }

    /// Drop all the completed attempts observed before `epoch`.
    ///
    /// Attempts observed under `epoch` or later belong to groups submitted after the reset and are kept.
    pub fn clear(&self, epoch: Epoch) {
        let mut state = self.state.lock().unwrap();

        state.results.retain(|_, (entry_epoch, _)| *entry_epoch >= epoch);
        state.reset = state.reset.max(epoch);
    }

    /// Number of blocks with completed attempts not reported yet.
    #[inline]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().results.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().results.is_empty()
    }
}

/// State of a [`MovementTracker`], `Stopped` being terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Running,
    Stopped,
}

impl TrackerState {
    #[inline]
    pub fn is_stopped(&self) -> bool {
        matches!(self, TrackerState::Stopped)
    }
}

#[derive(Debug)]
struct Shared {
    pending: PendingTasks,
    results: MovementResults,
    /// Wakes up the idle tracker loop on new tasks.
    new_tasks: Notify,
    state: watch::Sender<TrackerState>,
}

/// Block movement completion tracker.
///
/// The tracker is cheaply cloneable: clones share the same state, so that tasks can be registered from any thread while a
/// single [`MovementTracker::run()`] loop consumes their completions.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use mover::*;
/// let (mut pool, completions) = task::pool();
/// pool.start(2.try_into().unwrap());
///
/// let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<Vec<MovementAttemptFinished>>();
/// let tracker = MovementTracker::new(&Config::default());
/// let join_handle = tracker.spawn(completions, sender);
///
/// let info = BlockMovingInfo::new(
///     ExtendedBlock::new("BP-1", 1, 1001),
///     StorageLocation::new("dn1", StorageType::Disk),
///     StorageLocation::new("dn2", StorageType::Archive),
/// );
/// let block = info.block.clone();
///
/// tracker
///     .track(block, || pool.submit(async move { MovementAttemptFinished::new(info, MovementStatus::Success) }))
///     .unwrap();
///
/// let results = receiver.recv().await.unwrap();
/// assert_eq!(results.len(), 1);
///
/// tracker.stop_tracking();
/// join_handle.await.unwrap();
/// pool.close().await;
/// # })
/// ```
#[derive(Debug, Clone)]
pub struct MovementTracker {
    shared: Arc<Shared>,
    idle_wait: Duration,
}

impl MovementTracker {
    pub fn new(config: &Config) -> Self {
        let (state, _) = watch::channel(TrackerState::Running);

        Self {
            shared: Arc::new(Shared {
                pending: PendingTasks::default(),
                results: MovementResults::default(),
                new_tasks: Notify::new(),
                state,
            }),
            idle_wait: config.idle_wait,
        }
    }

    #[inline]
    pub fn state(&self) -> TrackerState {
        *self.shared.state.borrow()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        !self.state().is_stopped()
    }

    /// Whether some movement tasks are still in flight for `block`.
    #[inline]
    pub fn is_tracking(&self, block: &ExtendedBlock) -> bool {
        self.shared.pending.contains(block)
    }

    /// Number of blocks with in-flight movement tasks.
    #[inline]
    pub fn pending_blocks(&self) -> usize {
        self.shared.pending.len()
    }

    /// Track an already submitted movement task for `block`.
    ///
    /// This is a no-op once the tracker is stopped.
    pub fn add_block(&self, block: ExtendedBlock, handle: TaskHandle) {
        let id = handle.id();

        if self.shared.pending.insert(block, handle) {
            self.shared.new_tasks.notify_one();
        } else {
            tracing::debug!("Tracker stopped, ignoring movement task {id}");
        }
    }

    /// Submit a movement task for `block` and track it.
    ///
    /// `submit` is not called at all once the tracker is stopped.
    pub fn track<F>(&self, block: ExtendedBlock, submit: F) -> Result<TaskHandle, Error>
    where
        F: FnOnce() -> Result<TaskHandle, task::Error>,
    {
        let handle = self.shared.pending.insert_with(block, submit)?;
        self.shared.new_tasks.notify_one();

        Ok(handle)
    }

    /// Clear all the in-flight tasks and completed attempts.
    ///
    /// In-flight tasks keep running but their completions are not reported anymore.
    pub fn remove_all(&self) {
        let (handles, epoch) = self.shared.pending.clear();
        self.shared.results.clear(epoch);

        tracing::debug!("Removed {} pending movement tasks", handles.len());
    }

    /// Stop tracking for good, aborting all the in-flight tasks.
    ///
    /// Once stopped, nothing is reported anymore and the tracker cannot be restarted.
    pub fn stop_tracking(&self) {
        if self.shared.state.send_replace(TrackerState::Stopped).is_stopped() {
            return;
        }

        let (handles, epoch) = self.shared.pending.close();
        self.shared.results.clear(epoch);

        tracing::debug!("Stopping block movement tracker, aborting {} movement tasks...", handles.len());

        handles.iter().for_each(TaskHandle::abort);
    }

    /// Spawn the tracker loop in the background.
    pub fn spawn<S, H>(&self, source: S, handler: H) -> JoinHandle<()>
    where
        S: CompletionSource<Output = MovementAttemptFinished> + 'static,
        H: MovementStatusHandler + 'static,
    {
        let tracker = self.clone();

        tokio::spawn(async move { tracker.run(source, handler).await }.in_current_span())
    }

    /// Run the tracker loop until stopped.
    pub async fn run<S, H>(&self, mut source: S, mut handler: H)
    where
        S: CompletionSource<Output = MovementAttemptFinished>,
        H: MovementStatusHandler,
    {
        let mut state = self.shared.state.subscribe();

        tracing::debug!("Starting block movement tracker...");

        while self.is_running() {
            if self.shared.pending.is_empty() {
                // wait for movement tasks
                tokio::select! {
                    _ = self.shared.new_tasks.notified() => {}
                    _ = tokio::time::sleep(self.idle_wait) => {}
                    _ = stopped(&mut state) => break,
                }
            }

            let completed = tokio::select! {
                biased;
                _ = stopped(&mut state) => break,
                completed = source.take() => completed,
            };

            match completed {
                Some(Completed { id, outcome }) => self.complete(id, outcome, &mut handler),
                None => {
                    if self.is_running() {
                        tracing::error!("Movement task completions exhausted while tracking, waiting for stop");

                        stopped(&mut state).await;
                    }
                    break;
                }
            }
        }

        tracing::debug!("Block movement tracker stopped.");
    }

    fn complete<H>(&self, id: TaskId, outcome: Result<MovementAttemptFinished, task::Error>, handler: &mut H)
    where
        H: MovementStatusHandler,
    {
        let (block, result) = match outcome {
            Ok(result) => {
                tracing::debug!("Completed block movement: {result}");

                (result.block().clone(), Some(result))
            }
            Err(err) => {
                if self.is_running() {
                    tracing::error!("Movement task {id} interrupted while moving block replica to target storage: {err}");
                }

                match self.shared.pending.block_of(id) {
                    Some(block) => (block, None),
                    None => {
                        if self.is_running() {
                            tracing::warn!("Movement task {id} doesn't exist for any block");
                        }
                        return;
                    }
                }
            }
        };

        let (completion, epoch) = self.shared.pending.complete_one(&block, id);

        match completion {
            Completion::Untracked => {
                if self.is_running() {
                    tracing::warn!("Movement task {id} doesn't exist for block {block}");
                }
            }
            Completion::Outstanding(count) => {
                tracing::trace!("{count} movement tasks still in flight for block {block}");

                if let Some(result) = result {
                    self.shared.results.append(result, epoch);
                }
            }
            Completion::Closed => {
                if let Some(result) = result {
                    self.shared.results.append(result, epoch);
                }

                let results = self.shared.results.take_and_clear(&block);

                // results must not be reported once stopped or reset in the meantime
                if !self.is_running() || self.shared.pending.epoch() != epoch {
                    return;
                }

                if results.is_empty() {
                    tracing::warn!("All movement tasks interrupted for block {block}, no result to report");
                } else {
                    tracing::debug!("Reporting {} movement results for block {block}", results.len());

                    handler.handle(results);
                }
            }
        }
    }
}

async fn stopped(state: &mut watch::Receiver<TrackerState>) {
    // the sender lives as long as the tracker itself
    let _ = state.wait_for(TrackerState::is_stopped).await;
}
