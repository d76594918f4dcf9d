//! The syncer keeps the local mirror of remote changesets eventually
//! consistent: it pulls state and event timelines from the code hosts on a
//! priority schedule, reduces review verdicts, and feeds the burndown
//! time series.

mod burndown;
mod events;
mod heap;
mod syncer;

use std::time::Duration;

pub use burndown::{calc_counts, ChangesetCounts};
pub use events::{aggregate_review_state, changeset_state_at};
pub use heap::{SyncPriority, SyncQueue};
pub use syncer::{next_sync_interval, run_syncer};

#[derive(Debug, Clone)]
pub struct SyncerConfig {
    pub worker_count: usize,
    /// How often the scheduler reloads due changesets from the store.
    pub refill_interval: Duration,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            refill_interval: Duration::from_secs(30),
        }
    }
}
