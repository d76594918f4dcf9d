use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use armada_core::ChangesetId;

/// High-priority syncs (just-mutated changesets, user requests) jump the
/// line regardless of their due time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncPriority {
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SyncItem {
    priority: SyncPriority,
    next_sync_at: DateTime<Utc>,
    changeset_id: ChangesetId,
}

// BinaryHeap is a max-heap; order so the "largest" item is the one to sync
// first: higher priority wins, then the earlier due time.
impl Ord for SyncItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.next_sync_at.cmp(&self.next_sync_at))
            .then_with(|| other.changeset_id.cmp(&self.changeset_id))
    }
}

impl PartialOrd for SyncItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Mutex-guarded priority heap shared by the scheduler (push) and the sync
/// workers (pop). Push and pop are O(log n); membership is tracked so a
/// changeset is never queued twice.
#[derive(Default)]
pub struct SyncQueue {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<SyncItem>,
    queued: HashSet<ChangesetId>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &self,
        changeset_id: ChangesetId,
        priority: SyncPriority,
        next_sync_at: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.queued.insert(changeset_id) {
            return;
        }
        inner.heap.push(SyncItem {
            priority,
            next_sync_at,
            changeset_id,
        });
    }

    /// Pop the most urgent changeset that is due at `now`. High-priority
    /// items are always due.
    pub fn pop_due(&self, now: DateTime<Utc>) -> Option<ChangesetId> {
        let mut inner = self.inner.lock().unwrap();
        let due = match inner.heap.peek() {
            Some(item) => item.priority == SyncPriority::High || item.next_sync_at <= now,
            None => false,
        };
        if !due {
            return None;
        }
        let item = inner.heap.pop()?;
        inner.queued.remove(&item.changeset_id);
        Some(item.changeset_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
