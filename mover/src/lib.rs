//! A crate providing block movement features for a storage node.
//!
//! Block replicas are moved between storage locations in the background by a pool of workers, while a single tracker
//! loop observes their completions and reports them per block:
//! - movement attempts are submitted to a task [`Pool`](task::Pool) and yielded back by its completion queue in
//!   completion order, not submission order,
//! - every attempt is registered against its block in the [`PendingTasks`] index,
//! - completed attempts are accumulated per block in the [`MovementResults`] aggregator,
//! - once the last attempt for a block completes, the whole group is handed over to a [`MovementStatusHandler`].
//!
//! Failed attempts are reported within their group with a [`MovementStatus::Failure`] status and are never retried here.
//!
//! The tracker can be reset, dropping all in-flight and partial state, or stopped for good. In both cases nothing submitted
//! before is reported anymore, even if its completion is observed afterwards.
//!
//! ```text
//!     submitter(s) ──track──▶ PendingTasks ◀──complete_one── tracker loop ──handle──▶ handler
//!          │                                                    ▲   │
//!          └──submit──▶ Pool workers ──completions (in order)───┘   └──append/take──▶ MovementResults
//! ```
//!
//! The crate also provides the [`endpoint`] version handshake a storage node runs against its container manager before
//! registering.

mod block;
pub use block::*;

mod config;
pub use config::*;

pub mod endpoint;
pub mod task;

pub mod tracker;
pub use tracker::{CompletionSource, MovementResults, MovementStatusHandler, MovementTracker, PendingTasks, TrackerState};

mod worker;
pub use worker::*;
