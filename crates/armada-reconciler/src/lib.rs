//! The reconciler: dequeues changesets, computes the delta between their
//! previous and current spec, and executes the minimum set of code-host
//! operations to realize it. Parallelism is across changesets; each
//! changeset is strictly sequential, with the database row lock as the
//! coordination point.

mod backoff;
mod executor;
mod gitserver;
mod plan;
mod worker;

use std::time::Duration;

pub use backoff::backoff_duration;
pub use executor::Executor;
pub use gitserver::{
    CommitInfo, CreateCommitFromPatchError, CreateCommitFromPatchRequest, FakeGitserverClient,
    GitserverClient, HttpGitserverClient,
};
pub use plan::{determine_plan, Operation, Plan};
pub use worker::run_reconciler;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub worker_count: usize,
    /// How long an idle worker sleeps before polling the queue again.
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stall_threshold: Duration,
    pub max_failures: i32,
    pub max_resets: i32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(15),
            stall_threshold: Duration::from_secs(60),
            max_failures: 60,
            max_resets: 60,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(3600),
        }
    }
}
