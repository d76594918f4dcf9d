use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, error, info};

use armada_core::{Actor, Changeset, ExternalState, RepoStore, Result};
use armada_sources::{SourceChangeset, SourceRegistry};
use armada_store::Store;

use crate::events::aggregate_review_state;
use crate::heap::{SyncPriority, SyncQueue};
use crate::SyncerConfig;

/// How soon a changeset should be looked at again, by the state it is in.
/// Open changesets move; merged and closed ones mostly accrete late events.
pub fn next_sync_interval(state: Option<ExternalState>) -> chrono::Duration {
    match state {
        Some(ExternalState::Open) | Some(ExternalState::Draft) | None => {
            chrono::Duration::hours(1)
        }
        Some(ExternalState::Closed) | Some(ExternalState::Merged) | Some(ExternalState::Deleted) => {
            chrono::Duration::hours(8)
        }
    }
}

/// Run the syncer until `shutdown` flips: one scheduler filling the shared
/// heap from the store, and a fixed pool of workers draining it. HTTP
/// transports and rate limiters are shared per base URL through the
/// registry, so concurrent workers hitting one host stay within its budget.
pub async fn run_syncer(
    store: Store,
    registry: Arc<SourceRegistry>,
    repos: Arc<dyn RepoStore>,
    config: SyncerConfig,
    shutdown: watch::Receiver<bool>,
) {
    let queue = Arc::new(SyncQueue::new());
    let mut handles = Vec::new();

    {
        let store = store.clone();
        let queue = queue.clone();
        let mut shutdown = shutdown.clone();
        let refill_interval = config.refill_interval;
        handles.push(tokio::spawn(async move {
            loop {
                if let Err(e) = refill(&store, &queue).await {
                    error!(error = %e, "syncer refill failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(refill_interval) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }));
    }

    // Consecutive failures per changeset, for backoff. In-memory is enough:
    // after a restart the schedule starts fresh anyway.
    let failures: Arc<Mutex<HashMap<i64, i32>>> = Arc::new(Mutex::new(HashMap::new()));

    for i in 0..config.worker_count {
        let store = store.clone();
        let registry = registry.clone();
        let repos = repos.clone();
        let queue = queue.clone();
        let failures = failures.clone();
        let mut shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    return;
                }
                match queue.pop_due(Utc::now()) {
                    Some(changeset_id) => {
                        match sync_one(&store, &registry, repos.as_ref(), changeset_id).await {
                            Ok(()) => {
                                failures.lock().unwrap().remove(&changeset_id);
                            }
                            Err(e) => {
                                error!(worker = i, changeset = changeset_id, error = %e, "sync failed");
                                let n = {
                                    let mut failures = failures.lock().unwrap();
                                    let n = failures.entry(changeset_id).or_insert(0);
                                    *n += 1;
                                    *n
                                };
                                let delay = retry_backoff(n);
                                if let Err(e) = push_back_sync(&store, changeset_id, delay).await {
                                    error!(changeset = changeset_id, error = %e, "failed to reschedule sync");
                                }
                            }
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            _ = shutdown.changed() => return,
                        }
                    }
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
    info!("syncer stopped");
}

/// Same shape as the reconciler's failure backoff: full jitter under an
/// exponential ceiling of `min(5s * 2^n, 1h)`.
fn retry_backoff(failures: i32) -> chrono::Duration {
    let exp = failures.clamp(0, 30) as u32;
    let ceiling_secs = 5u64.saturating_mul(2u64.saturating_pow(exp)).min(3600);
    let millis = rand::rng().random_range(0..=ceiling_secs * 1000);
    chrono::Duration::milliseconds(millis as i64)
}

async fn push_back_sync(store: &Store, changeset_id: i64, delay: chrono::Duration) -> Result<()> {
    let mut cs = store.get_changeset(changeset_id).await?;
    cs.next_sync_at = Some(Utc::now() + delay);
    store.update_changeset(&mut cs).await
}

async fn refill(store: &Store, queue: &SyncQueue) -> Result<()> {
    let now = Utc::now();
    for data in store.list_changeset_sync_data().await? {
        // Freshly tracked changesets have never been loaded; everyone else
        // queues at their due time.
        let priority = if data.unsynced {
            SyncPriority::High
        } else {
            SyncPriority::Normal
        };
        // Priority decides ordering among queued items; the due time decides
        // whether an item queues at all, so a failing import still backs off.
        let due = data.next_sync_at.unwrap_or(now);
        if due <= now {
            queue.push(data.changeset_id, priority, due);
        }
    }
    Ok(())
}

/// Pull remote state and the event timeline for one changeset and write
/// both through in a single transaction.
pub async fn sync_one(
    store: &Store,
    registry: &SourceRegistry,
    repos: &dyn RepoStore,
    changeset_id: i64,
) -> Result<()> {
    let mut cs: Changeset = store.get_changeset(changeset_id).await?;
    let repo = repos.get(&Actor::system(), cs.repo_id).await?;
    let source = registry.source_for_repo(&repo)?;

    // Sync needs no spec fields; loads only read identity off the changeset.
    let mut sc = SourceChangeset {
        repo: &repo,
        title: String::new(),
        body: String::new(),
        base_ref: String::new(),
        head_ref: String::new(),
        changeset: &mut cs,
    };
    source.load_changeset(&mut sc).await?;
    let mut events = source.load_events(&mut sc).await?;

    cs.external_review_state = Some(aggregate_review_state(events.iter()));
    cs.unsynced = false;
    cs.next_sync_at = Some(Utc::now() + next_sync_interval(cs.external_state));

    store.update_changeset_with_events(&mut cs, &mut events).await?;
    debug!(changeset = changeset_id, events = events.len(), "synced changeset");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_is_capped_at_an_hour() {
        for n in 0..50 {
            assert!(retry_backoff(n) <= chrono::Duration::hours(1));
        }
    }

    #[test]
    fn open_changesets_resync_sooner_than_closed() {
        assert!(
            next_sync_interval(Some(ExternalState::Open))
                < next_sync_interval(Some(ExternalState::Merged))
        );
        assert_eq!(
            next_sync_interval(None),
            next_sync_interval(Some(ExternalState::Draft))
        );
    }
}
