use chrono::{DateTime, Utc};

use armada_core::{ChangesetEvent, ChangesetId, Result};

use crate::store::{parse_state, Store};

type EventRow = (
    i64,
    i64,
    String,
    String,
    serde_json::Value,
    DateTime<Utc>,
    DateTime<Utc>,
);

impl Store {
    /// Upsert a batch of events inside one transaction. Keyed on
    /// (changeset_id, kind, key) so repeated syncs refresh metadata instead
    /// of duplicating timeline entries.
    pub async fn upsert_changeset_events(&self, events: &mut [ChangesetEvent]) -> Result<()> {
        let mut tx = self.db.begin().await?;

        for ev in events.iter_mut() {
            let row: (i64, DateTime<Utc>, DateTime<Utc>) = sqlx::query_as(
                r#"INSERT INTO changeset_events (changeset_id, kind, key, metadata)
                   VALUES ($1, $2, $3, $4)
                   ON CONFLICT (changeset_id, kind, key) DO UPDATE SET
                       metadata = EXCLUDED.metadata,
                       updated_at = now()
                   RETURNING id, created_at, updated_at"#,
            )
            .bind(ev.changeset_id)
            .bind(ev.kind.to_string())
            .bind(&ev.key)
            .bind(&ev.metadata)
            .fetch_one(&mut *tx)
            .await?;

            ev.id = row.0;
            ev.created_at = row.1;
            ev.updated_at = row.2;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Write-through for one synced changeset: the refreshed mirror row and
    /// its new events land in a single transaction.
    pub async fn update_changeset_with_events(
        &self,
        cs: &mut armada_core::Changeset,
        events: &mut [ChangesetEvent],
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;

        crate::changesets::update_changeset_tx(&mut tx, cs).await?;

        for ev in events.iter_mut() {
            let row: (i64, DateTime<Utc>, DateTime<Utc>) = sqlx::query_as(
                r#"INSERT INTO changeset_events (changeset_id, kind, key, metadata)
                   VALUES ($1, $2, $3, $4)
                   ON CONFLICT (changeset_id, kind, key) DO UPDATE SET
                       metadata = EXCLUDED.metadata,
                       updated_at = now()
                   RETURNING id, created_at, updated_at"#,
            )
            .bind(ev.changeset_id)
            .bind(ev.kind.to_string())
            .bind(&ev.key)
            .bind(&ev.metadata)
            .fetch_one(&mut *tx)
            .await?;
            ev.id = row.0;
            ev.created_at = row.1;
            ev.updated_at = row.2;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Pull the given changesets' next sync forward to "now"; the syncer's
    /// next refill treats them as due immediately.
    pub async fn request_changeset_sync(&self, ids: &[ChangesetId]) -> Result<()> {
        sqlx::query("UPDATE changesets SET next_sync_at = now() WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn list_changeset_events(
        &self,
        changeset_ids: &[ChangesetId],
    ) -> Result<Vec<ChangesetEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"SELECT id, changeset_id, kind, key, metadata, created_at, updated_at
               FROM changeset_events
               WHERE changeset_id = ANY($1)
               ORDER BY changeset_id ASC, created_at ASC, id ASC"#,
        )
        .bind(changeset_ids)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(ChangesetEvent {
                    id: r.0,
                    changeset_id: r.1,
                    kind: parse_state("kind", &r.2)?,
                    key: r.3,
                    metadata: r.4,
                    created_at: r.5,
                    updated_at: r.6,
                })
            })
            .collect()
    }
}
