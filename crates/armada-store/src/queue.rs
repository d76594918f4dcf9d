use chrono::Duration;

use armada_core::{Changeset, ChangesetId, Error, Result};

use crate::changesets::{ChangesetRow, CHANGESET_COLUMNS};
use crate::store::Store;

impl Store {
    /// Dequeue the oldest eligible changeset for `worker_id`: the queued row
    /// with the earliest `updated_at` whose `process_after` is unset or past.
    /// `FOR UPDATE SKIP LOCKED` keeps concurrent workers from observing the
    /// same row; the winner transitions it to `processing` and stamps the
    /// first heartbeat. Returns `Error::NoResults` when the queue is empty.
    pub async fn lock_and_get_next_changeset(&self, worker_id: &str) -> Result<Changeset> {
        let row: Option<ChangesetRow> = sqlx::query_as(&format!(
            r#"UPDATE changesets
               SET reconciler_state = 'processing',
                   last_heartbeat_at = now(),
                   claimed_by = $1,
                   updated_at = now()
               WHERE id = (
                   SELECT id FROM changesets
                   WHERE reconciler_state = 'queued'
                     AND (process_after IS NULL OR process_after <= now())
                   ORDER BY updated_at ASC, id ASC
                   FOR UPDATE SKIP LOCKED
                   LIMIT 1
               )
               RETURNING {CHANGESET_COLUMNS}"#
        ))
        .bind(worker_id)
        .fetch_optional(&self.db)
        .await?;

        row.map(Changeset::try_from).transpose()?.ok_or(Error::NoResults)
    }

    /// Refresh the heartbeat on an in-flight changeset. Fails loudly with
    /// `HeartbeatLost` when the row is no longer `processing` under this
    /// worker (a stall reset reclaimed it); the worker must then abandon its
    /// work instead of writing a stale result.
    pub async fn heartbeat(&self, changeset_id: ChangesetId, worker_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"UPDATE changesets
               SET last_heartbeat_at = now()
               WHERE id = $1 AND reconciler_state = 'processing' AND claimed_by = $2"#,
        )
        .bind(changeset_id)
        .bind(worker_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::HeartbeatLost(changeset_id));
        }
        Ok(())
    }

    /// Return stalled rows (still `processing`, heartbeat older than the
    /// threshold) to the queue, incrementing `num_resets`. Rows reset more
    /// than `max_resets` times move to `errored` instead so a poisoned
    /// changeset cannot cycle forever. Returns the ids of requeued rows.
    pub async fn reset_stalled_changesets(
        &self,
        stall_threshold: Duration,
        max_resets: i32,
    ) -> Result<Vec<ChangesetId>> {
        let mut tx = self.db.begin().await?;

        let requeued: Vec<(i64,)> = sqlx::query_as(
            r#"UPDATE changesets
               SET reconciler_state = 'queued',
                   num_resets = num_resets + 1,
                   claimed_by = NULL,
                   last_heartbeat_at = NULL,
                   updated_at = now()
               WHERE reconciler_state = 'processing'
                 AND last_heartbeat_at < now() - $1::interval
               RETURNING id"#,
        )
        .bind(format!("{} seconds", stall_threshold.num_seconds()))
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            r#"UPDATE changesets
               SET reconciler_state = 'errored',
                   failure_message = 'changeset was processed too many times without success',
                   updated_at = now()
               WHERE reconciler_state = 'queued' AND num_resets > $1"#,
        )
        .bind(max_resets)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let ids: Vec<ChangesetId> = requeued.into_iter().map(|r| r.0).collect();
        if !ids.is_empty() {
            tracing::warn!(count = ids.len(), "reset stalled changesets");
        }
        Ok(ids)
    }

    /// Give errored changesets whose backoff elapsed another run, unless
    /// they exhausted their failure budget, in which case they leave the
    /// queue for good.
    pub async fn reenqueue_errored_changesets(&self, max_failures: i32) -> Result<u64> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            r#"UPDATE changesets
               SET reconciler_state = 'failed', updated_at = now()
               WHERE reconciler_state = 'errored' AND num_failures >= $1"#,
        )
        .bind(max_failures)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"UPDATE changesets
               SET reconciler_state = 'queued', updated_at = now()
               WHERE reconciler_state = 'errored'
                 AND (process_after IS NULL OR process_after <= now())"#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }
}
