use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use armada_core::{
    Actor, Changeset, ChangesetSpec, Error, ReconcilerState, RepoStore, Result,
};
use armada_sources::SourceRegistry;
use armada_store::Store;

use crate::backoff::backoff_duration;
use crate::executor::{is_transient_error, Executor};
use crate::gitserver::GitserverClient;
use crate::ReconcilerConfig;

/// Run the reconciler pool until `shutdown` flips to true: N dequeue workers,
/// a stalled-row reset loop, and an errored-row reenqueue loop. Returns when
/// every task has wound down.
pub async fn run_reconciler(
    store: Store,
    registry: Arc<SourceRegistry>,
    gitserver: Arc<dyn GitserverClient>,
    repos: Arc<dyn RepoStore>,
    config: ReconcilerConfig,
    shutdown: watch::Receiver<bool>,
) {
    let mut handles = Vec::new();

    for i in 0..config.worker_count {
        let worker = Worker {
            id: format!("reconciler-{i}"),
            store: store.clone(),
            registry: registry.clone(),
            executor: Executor::new(gitserver.clone()),
            repos: repos.clone(),
            config: config.clone(),
        };
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    handles.push(tokio::spawn(run_reset_loop(
        store.clone(),
        config.clone(),
        shutdown.clone(),
    )));

    for handle in handles {
        let _ = handle.await;
    }
    info!("reconciler stopped");
}

/// Periodically requeue stalled rows and retry errored ones whose backoff
/// elapsed. Interval is half the stall threshold so a dead worker's rows
/// never wait more than 1.5 thresholds.
async fn run_reset_loop(store: Store, config: ReconcilerConfig, mut shutdown: watch::Receiver<bool>) {
    let interval = config.stall_threshold / 2;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }

        let threshold = chrono::Duration::from_std(config.stall_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        if let Err(e) = store
            .reset_stalled_changesets(threshold, config.max_resets)
            .await
        {
            error!(error = %e, "stalled-changeset reset pass failed");
        }
        if let Err(e) = store.reenqueue_errored_changesets(config.max_failures).await {
            error!(error = %e, "errored-changeset reenqueue pass failed");
        }
    }
}

struct Worker {
    id: String,
    store: Store,
    registry: Arc<SourceRegistry>,
    executor: Executor,
    repos: Arc<dyn RepoStore>,
    config: ReconcilerConfig,
}

impl Worker {
    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.id, "reconciler worker started");
        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.store.lock_and_get_next_changeset(&self.id).await {
                Ok(cs) => {
                    self.process(cs, &mut shutdown).await;
                }
                Err(Error::NoResults) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => return,
                    }
                }
                Err(e) => {
                    error!(worker = %self.id, error = %e, "dequeue failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }
    }

    async fn process(&self, mut cs: Changeset, shutdown: &mut watch::Receiver<bool>) {
        debug!(worker = %self.id, changeset = cs.id, "processing changeset");

        // Heartbeat on an interval shorter than the stall threshold. Loss of
        // the heartbeat means a reset pass reclaimed the row; the shared flag
        // tells us to abandon the result instead of double-writing.
        let lost = Arc::new(AtomicBool::new(false));
        let heartbeat = {
            let store = self.store.clone();
            let worker_id = self.id.clone();
            let changeset_id = cs.id;
            let interval = self.config.heartbeat_interval;
            let lost = lost.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if let Err(e) = store.heartbeat(changeset_id, &worker_id).await {
                        warn!(changeset = changeset_id, error = %e, "heartbeat lost");
                        lost.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            })
        };

        let result = tokio::select! {
            result = self.reconcile(&mut cs) => Some(result),
            _ = shutdown.changed() => None,
        };
        heartbeat.abort();

        if lost.load(Ordering::SeqCst) {
            warn!(changeset = cs.id, "abandoning result after heartbeat loss");
            return;
        }

        let Some(result) = result else {
            // Shutdown mid-flight: release the row so no local `processing`
            // leaks past our lifetime.
            cs.reconciler_state = ReconcilerState::Queued;
            cs.process_after = None;
            if let Err(e) = self.store.update_changeset(&mut cs).await {
                error!(changeset = cs.id, error = %e, "failed to release changeset on shutdown");
            }
            return;
        };

        match result {
            Ok(()) => {
                cs.reconciler_state = ReconcilerState::Completed;
                cs.previous_spec_id = None;
                cs.num_failures = 0;
                cs.failure_message = None;
                cs.process_after = None;
            }
            Err(e) => {
                cs.num_failures += 1;
                cs.failure_message = Some(e.to_string());
                let delay = backoff_duration(
                    self.config.backoff_base,
                    self.config.backoff_cap,
                    cs.num_failures,
                );
                cs.process_after = Some(
                    chrono::Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(5)),
                );

                if cs.num_failures >= self.config.max_failures {
                    cs.reconciler_state = ReconcilerState::Failed;
                    warn!(changeset = cs.id, failures = cs.num_failures, "changeset failed terminally");
                } else if is_transient_error(&e) {
                    cs.reconciler_state = ReconcilerState::Queued;
                    debug!(changeset = cs.id, error = %e, "transient failure, backing off");
                } else {
                    cs.reconciler_state = ReconcilerState::Errored;
                    warn!(changeset = cs.id, error = %e, "permanent failure");
                }
            }
        }

        if let Err(e) = self.store.update_changeset(&mut cs).await {
            error!(changeset = cs.id, error = %e, "failed to persist reconciler outcome");
        }
    }

    /// Load the spec pair, resolve the source, and run the plan. Any error
    /// here is classified by the caller.
    async fn reconcile(&self, cs: &mut Changeset) -> Result<()> {
        let current: ChangesetSpec = match cs.current_spec_id {
            Some(id) => self.store.get_changeset_spec(id).await?,
            None => {
                return Err(Error::Internal(format!(
                    "changeset {} has no current spec",
                    cs.id
                )))
            }
        };
        let previous = match cs.previous_spec_id {
            Some(id) => Some(self.store.get_changeset_spec(id).await?),
            None => None,
        };

        let repo = self.repos.get(&Actor::system(), cs.repo_id).await?;
        let source = self.registry.source_for_repo(&repo)?;

        let mut events = self
            .executor
            .execute(
                source.as_ref(),
                &repo,
                previous.as_ref().map(|s| &s.spec),
                &current.spec,
                cs,
            )
            .await?;

        if !events.is_empty() {
            self.store.upsert_changeset_events(&mut events).await?;
        }
        Ok(())
    }
}
