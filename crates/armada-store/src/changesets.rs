use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};

use armada_core::{
    CampaignId, Changeset, ChangesetId, DiffStat, Error, ExternalState, PublicationState,
    ReconcilerState, RepoId, Result,
};

use crate::store::{effective_limit, parse_state, parse_state_opt, Store};

pub(crate) const CHANGESET_COLUMNS: &str = "id, repo_id, external_service_type, external_id, external_branch, external_state, external_review_state, external_check_state, external_created_at, external_updated_at, campaign_ids, owned_by_campaign_id, current_spec_id, previous_spec_id, publication_state, reconciler_state, failure_message, num_failures, num_resets, process_after, last_heartbeat_at, closing, unsynced, next_sync_at, diff_stat_added, diff_stat_changed, diff_stat_deleted, metadata, created_at, updated_at";

#[derive(sqlx::FromRow)]
pub(crate) struct ChangesetRow {
    id: i64,
    repo_id: i64,
    external_service_type: String,
    external_id: String,
    external_branch: String,
    external_state: Option<String>,
    external_review_state: Option<String>,
    external_check_state: Option<String>,
    external_created_at: Option<DateTime<Utc>>,
    external_updated_at: Option<DateTime<Utc>>,
    campaign_ids: serde_json::Value,
    owned_by_campaign_id: Option<i64>,
    current_spec_id: Option<i64>,
    previous_spec_id: Option<i64>,
    publication_state: String,
    reconciler_state: String,
    failure_message: Option<String>,
    num_failures: i32,
    num_resets: i32,
    process_after: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    closing: bool,
    unsynced: bool,
    next_sync_at: Option<DateTime<Utc>>,
    diff_stat_added: i32,
    diff_stat_changed: i32,
    diff_stat_deleted: i32,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ChangesetRow> for Changeset {
    type Error = Error;

    fn try_from(r: ChangesetRow) -> Result<Self> {
        let campaign_ids: Vec<CampaignId> = serde_json::from_value(r.campaign_ids)?;
        Ok(Changeset {
            id: r.id,
            repo_id: r.repo_id,
            external_service_type: r.external_service_type,
            external_id: r.external_id,
            external_branch: r.external_branch,
            external_state: parse_state_opt("external_state", r.external_state.as_deref())?,
            external_review_state: parse_state_opt(
                "external_review_state",
                r.external_review_state.as_deref(),
            )?,
            external_check_state: parse_state_opt(
                "external_check_state",
                r.external_check_state.as_deref(),
            )?,
            external_created_at: r.external_created_at,
            external_updated_at: r.external_updated_at,
            campaign_ids,
            owned_by_campaign_id: r.owned_by_campaign_id,
            current_spec_id: r.current_spec_id,
            previous_spec_id: r.previous_spec_id,
            publication_state: parse_state("publication_state", &r.publication_state)?,
            reconciler_state: parse_state("reconciler_state", &r.reconciler_state)?,
            failure_message: r.failure_message,
            num_failures: r.num_failures,
            num_resets: r.num_resets,
            process_after: r.process_after,
            last_heartbeat_at: r.last_heartbeat_at,
            closing: r.closing,
            unsynced: r.unsynced,
            next_sync_at: r.next_sync_at,
            diff_stat: DiffStat {
                added: r.diff_stat_added,
                changed: r.diff_stat_changed,
                deleted: r.diff_stat_deleted,
            },
            metadata: r.metadata,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListChangesetsOpts {
    /// Attached to this campaign (member of `campaign_ids`).
    pub campaign_id: Option<CampaignId>,
    pub owned_by_campaign_id: Option<CampaignId>,
    pub ids: Vec<ChangesetId>,
    /// Restrict to repositories the actor may see. `None` skips the filter
    /// (admin progress reporting).
    pub repo_ids: Option<Vec<RepoId>>,
    pub reconciler_states: Vec<ReconcilerState>,
    pub publication_state: Option<PublicationState>,
    pub external_state: Option<ExternalState>,
    /// `-1` selects all rows.
    pub limit: i64,
    pub cursor: i64,
}

fn push_filters(qb: &mut sqlx::QueryBuilder<'_, Postgres>, opts: &ListChangesetsOpts) {
    if let Some(campaign) = opts.campaign_id {
        qb.push(" AND campaign_ids @> ");
        qb.push_bind(serde_json::json!([campaign]));
    }
    if let Some(owner) = opts.owned_by_campaign_id {
        qb.push(" AND owned_by_campaign_id = ");
        qb.push_bind(owner);
    }
    if !opts.ids.is_empty() {
        qb.push(" AND id = ANY(");
        qb.push_bind(opts.ids.clone());
        qb.push(")");
    }
    if let Some(repos) = &opts.repo_ids {
        qb.push(" AND repo_id = ANY(");
        qb.push_bind(repos.clone());
        qb.push(")");
    }
    if !opts.reconciler_states.is_empty() {
        let states: Vec<String> = opts
            .reconciler_states
            .iter()
            .map(|s| s.to_string())
            .collect();
        qb.push(" AND reconciler_state = ANY(");
        qb.push_bind(states);
        qb.push(")");
    }
    if let Some(state) = opts.publication_state {
        qb.push(" AND publication_state = ");
        qb.push_bind(state.to_string());
    }
    if let Some(state) = opts.external_state {
        qb.push(" AND external_state = ");
        qb.push_bind(state.to_string());
    }
}

pub(crate) async fn insert_changeset(
    tx: &mut Transaction<'_, Postgres>,
    cs: &mut Changeset,
) -> Result<()> {
    let row: (i64, DateTime<Utc>, DateTime<Utc>) = sqlx::query_as(
        r#"INSERT INTO changesets
               (repo_id, external_service_type, external_id, external_branch,
                external_state, external_review_state, external_check_state,
                external_created_at, external_updated_at, campaign_ids,
                owned_by_campaign_id, current_spec_id, previous_spec_id,
                publication_state, reconciler_state, failure_message,
                num_failures, num_resets, process_after, closing, unsynced,
                next_sync_at, diff_stat_added, diff_stat_changed,
                diff_stat_deleted, metadata)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                   $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26)
           RETURNING id, created_at, updated_at"#,
    )
    .bind(cs.repo_id)
    .bind(&cs.external_service_type)
    .bind(&cs.external_id)
    .bind(&cs.external_branch)
    .bind(cs.external_state.map(|s| s.to_string()))
    .bind(cs.external_review_state.map(|s| s.to_string()))
    .bind(cs.external_check_state.map(|s| s.to_string()))
    .bind(cs.external_created_at)
    .bind(cs.external_updated_at)
    .bind(serde_json::to_value(&cs.campaign_ids)?)
    .bind(cs.owned_by_campaign_id)
    .bind(cs.current_spec_id)
    .bind(cs.previous_spec_id)
    .bind(cs.publication_state.to_string())
    .bind(cs.reconciler_state.to_string())
    .bind(&cs.failure_message)
    .bind(cs.num_failures)
    .bind(cs.num_resets)
    .bind(cs.process_after)
    .bind(cs.closing)
    .bind(cs.unsynced)
    .bind(cs.next_sync_at)
    .bind(cs.diff_stat.added)
    .bind(cs.diff_stat.changed)
    .bind(cs.diff_stat.deleted)
    .bind(&cs.metadata)
    .fetch_one(&mut **tx)
    .await?;

    cs.id = row.0;
    cs.created_at = row.1;
    cs.updated_at = row.2;
    Ok(())
}

pub(crate) async fn update_changeset_tx(
    tx: &mut Transaction<'_, Postgres>,
    cs: &mut Changeset,
) -> Result<()> {
    let campaign_ids = serde_json::to_value(&cs.campaign_ids)?;
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        r#"UPDATE changesets
           SET external_id = $1, external_branch = $2, external_state = $3,
               external_review_state = $4, external_check_state = $5,
               external_created_at = $6, external_updated_at = $7, campaign_ids = $8,
               owned_by_campaign_id = $9, current_spec_id = $10, previous_spec_id = $11,
               publication_state = $12, reconciler_state = $13, failure_message = $14,
               num_failures = $15, num_resets = $16, process_after = $17, closing = $18,
               unsynced = $19, next_sync_at = $20, diff_stat_added = $21,
               diff_stat_changed = $22, diff_stat_deleted = $23, metadata = $24,
               updated_at = now()
           WHERE id = $25
           RETURNING updated_at"#,
    )
    .bind(&cs.external_id)
    .bind(&cs.external_branch)
    .bind(cs.external_state.map(|s| s.to_string()))
    .bind(cs.external_review_state.map(|s| s.to_string()))
    .bind(cs.external_check_state.map(|s| s.to_string()))
    .bind(cs.external_created_at)
    .bind(cs.external_updated_at)
    .bind(campaign_ids)
    .bind(cs.owned_by_campaign_id)
    .bind(cs.current_spec_id)
    .bind(cs.previous_spec_id)
    .bind(cs.publication_state.to_string())
    .bind(cs.reconciler_state.to_string())
    .bind(&cs.failure_message)
    .bind(cs.num_failures)
    .bind(cs.num_resets)
    .bind(cs.process_after)
    .bind(cs.closing)
    .bind(cs.unsynced)
    .bind(cs.next_sync_at)
    .bind(cs.diff_stat.added)
    .bind(cs.diff_stat.changed)
    .bind(cs.diff_stat.deleted)
    .bind(&cs.metadata)
    .bind(cs.id)
    .fetch_optional(&mut **tx)
    .await?;

    let row = row.ok_or(Error::ChangesetNotFound(cs.id))?;
    cs.updated_at = row.0;
    Ok(())
}

impl Store {
    pub async fn create_changeset(&self, cs: &mut Changeset) -> Result<()> {
        let mut tx = self.db.begin().await?;
        insert_changeset(&mut tx, cs).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn update_changeset(&self, cs: &mut Changeset) -> Result<()> {
        let mut tx = self.db.begin().await?;
        update_changeset_tx(&mut tx, cs).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Batched variant used by the rewirer persistence path and the syncer.
    pub async fn update_changeset_batch(&self, changesets: &mut [Changeset]) -> Result<()> {
        let mut tx = self.db.begin().await?;
        for cs in changesets.iter_mut() {
            update_changeset_tx(&mut tx, cs).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_changeset(&self, id: ChangesetId) -> Result<Changeset> {
        let row: Option<ChangesetRow> = sqlx::query_as(&format!(
            "SELECT {CHANGESET_COLUMNS} FROM changesets WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        row.map(Changeset::try_from).transpose()?.ok_or(Error::NoResults)
    }

    pub async fn get_changeset_by_external_id(
        &self,
        repo_id: RepoId,
        external_service_type: &str,
        external_id: &str,
    ) -> Result<Changeset> {
        let row: Option<ChangesetRow> = sqlx::query_as(&format!(
            r#"SELECT {CHANGESET_COLUMNS} FROM changesets
               WHERE repo_id = $1 AND external_service_type = $2 AND external_id = $3"#
        ))
        .bind(repo_id)
        .bind(external_service_type)
        .bind(external_id)
        .fetch_optional(&self.db)
        .await?;

        row.map(Changeset::try_from).transpose()?.ok_or(Error::NoResults)
    }

    pub async fn list_changesets(
        &self,
        opts: ListChangesetsOpts,
    ) -> Result<(Vec<Changeset>, Option<i64>)> {
        let mut qb = sqlx::QueryBuilder::new(format!(
            "SELECT {CHANGESET_COLUMNS} FROM changesets WHERE id >= "
        ));
        qb.push_bind(opts.cursor);
        push_filters(&mut qb, &opts);
        qb.push(" ORDER BY id ASC");
        if let Some(limit) = effective_limit(opts.limit) {
            qb.push(" LIMIT ");
            qb.push_bind(limit + 1);
        }

        let rows: Vec<ChangesetRow> = qb.build_query_as().fetch_all(&self.db).await?;
        let mut changesets = rows
            .into_iter()
            .map(Changeset::try_from)
            .collect::<Result<Vec<_>>>()?;

        let next = match effective_limit(opts.limit) {
            Some(limit) if changesets.len() as i64 > limit => {
                changesets.pop().map(|cs| cs.id)
            }
            _ => None,
        };
        Ok((changesets, next))
    }

    pub async fn count_changesets(&self, opts: ListChangesetsOpts) -> Result<i64> {
        let mut qb = sqlx::QueryBuilder::new("SELECT COUNT(*) FROM changesets WHERE id >= ");
        qb.push_bind(0i64);
        push_filters(&mut qb, &opts);

        let row: (i64,) = qb.build_query_as().fetch_one(&self.db).await?;
        Ok(row.0)
    }

    pub async fn delete_changeset(&self, id: ChangesetId) -> Result<()> {
        let result = sqlx::query("DELETE FROM changesets WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::ChangesetNotFound(id));
        }
        Ok(())
    }

    /// Scheduling inputs for the syncer: every changeset that mirrors a
    /// remote object, with its due time.
    pub async fn list_changeset_sync_data(&self) -> Result<Vec<ChangesetSyncData>> {
        let rows: Vec<(i64, String, Option<DateTime<Utc>>, bool)> = sqlx::query_as(
            r#"SELECT id, external_service_type, next_sync_at, unsynced
               FROM changesets
               WHERE external_id != ''
               ORDER BY id ASC"#,
        )
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ChangesetSyncData {
                changeset_id: r.0,
                external_service_type: r.1,
                next_sync_at: r.2,
                unsynced: r.3,
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct ChangesetSyncData {
    pub changeset_id: ChangesetId,
    pub external_service_type: String,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub unsynced: bool,
}
