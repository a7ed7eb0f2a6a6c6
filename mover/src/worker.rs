//! This module provides the worker moving block replicas between storage locations in the background.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::block::{BlockMovingInfo, MovementAttemptFinished, MovementStatus};
use crate::config::Config;
use crate::task::{self, TaskHandle};
use crate::tracker::{self, MovementStatusHandler, MovementTracker};

/// Block transfer interface.
pub trait BlockMover: Send + Sync + 'static {
    type Error: std::error::Error + Send;

    /// Move one block replica from its source to its target storage location.
    fn move_block(&self, info: &BlockMovingInfo) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Block movement worker.
///
/// Movement attempts are executed by a task pool and tracked per block, the handler being notified once all the attempts
/// scheduled for a block are finished. Failed attempts are reported as such and never retried.
#[derive(Debug)]
pub struct MovementWorker<M> {
    mover: Arc<M>,
    pool: task::Pool<MovementAttemptFinished>,
    tracker: MovementTracker,
    tracker_handle: JoinHandle<()>,
}

impl<M: BlockMover> MovementWorker<M> {
    /// Start the movement task pool and its tracker loop.
    pub fn start<H>(mover: M, handler: H, config: &Config) -> Self
    where
        H: MovementStatusHandler + 'static,
    {
        let (mut pool, completions) = task::pool();
        pool.start(config.pool_size);

        let tracker = MovementTracker::new(config);
        let tracker_handle = tracker.spawn(completions, handler);

        Self {
            mover: Arc::new(mover),
            pool,
            tracker,
            tracker_handle,
        }
    }

    #[inline]
    pub fn tracker(&self) -> &MovementTracker {
        &self.tracker
    }

    /// Schedule block movements in the background.
    pub fn process_block_moves<I>(&self, moves: I) -> Result<Vec<TaskHandle>, tracker::Error>
    where
        I: IntoIterator<Item = BlockMovingInfo>,
    {
        moves.into_iter().map(|info| self.submit_move(info)).collect()
    }

    fn submit_move(&self, info: BlockMovingInfo) -> Result<TaskHandle, tracker::Error> {
        tracing::debug!("Scheduling block movement: {} from {} to {}", info.block, info.source, info.target);

        let mover = Arc::clone(&self.mover);
        let block = info.block.clone();

        self.tracker.track(block, || {
            self.pool.submit(async move {
                let status = match mover.move_block(&info).await {
                    Ok(()) => MovementStatus::Success,
                    Err(err) => {
                        tracing::warn!("Failed to move block {} from {} to {}: {err}", info.block, info.source, info.target);

                        MovementStatus::Failure(err.to_string())
                    }
                };

                MovementAttemptFinished::new(info, status)
            })
        })
    }

    /// Drop all scheduled movements, whose outcome will not be reported.
    pub fn drop_work(&self) {
        self.tracker.remove_all();
    }

    /// Stop tracking, abort in-flight movements and wait for the worker to shut down.
    pub async fn stop(self) {
        self.tracker.stop_tracking();
        self.pool.close().await;

        if let Err(err) = self.tracker_handle.await {
            tracing::error!("Block movement tracker failed: {err}");
        }
    }
}
