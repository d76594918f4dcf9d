use chrono::{DateTime, Utc};

use armada_core::{
    CampaignSpecId, ChangesetSpec, ChangesetSpecFields, ChangesetSpecId, DiffStat, Error, RepoId,
    Result,
};

use crate::store::{effective_limit, Store};

#[derive(Debug, Clone, Default)]
pub struct ListChangesetSpecsOpts {
    pub campaign_spec_id: Option<CampaignSpecId>,
    pub ids: Vec<ChangesetSpecId>,
    /// Restrict to repositories the actor may see.
    pub repo_ids: Option<Vec<RepoId>>,
    /// `-1` selects all rows.
    pub limit: i64,
    pub cursor: i64,
}

type ChangesetSpecRow = (
    i64,
    String,
    i64,
    i64,
    i64,
    String,
    serde_json::Value,
    i32,
    i32,
    i32,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn row_to_spec(r: ChangesetSpecRow) -> Result<ChangesetSpec> {
    let spec: ChangesetSpecFields = serde_json::from_value(r.6)?;
    Ok(ChangesetSpec {
        id: r.0,
        rand_id: r.1,
        campaign_spec_id: r.2,
        repo_id: r.3,
        user_id: r.4,
        raw_spec: r.5,
        spec,
        diff_stat: DiffStat {
            added: r.7,
            changed: r.8,
            deleted: r.9,
        },
        created_at: r.10,
        updated_at: r.11,
    })
}

const SPEC_COLUMNS: &str = "id, rand_id, campaign_spec_id, repo_id, user_id, raw_spec, spec, diff_stat_added, diff_stat_changed, diff_stat_deleted, created_at, updated_at";

impl Store {
    pub async fn create_changeset_spec(&self, s: &mut ChangesetSpec) -> Result<()> {
        let row: (i64, DateTime<Utc>, DateTime<Utc>) = sqlx::query_as(
            r#"INSERT INTO changeset_specs
                   (rand_id, campaign_spec_id, repo_id, user_id, raw_spec, spec,
                    diff_stat_added, diff_stat_changed, diff_stat_deleted)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               RETURNING id, created_at, updated_at"#,
        )
        .bind(&s.rand_id)
        .bind(s.campaign_spec_id)
        .bind(s.repo_id)
        .bind(s.user_id)
        .bind(&s.raw_spec)
        .bind(serde_json::to_value(&s.spec)?)
        .bind(s.diff_stat.added)
        .bind(s.diff_stat.changed)
        .bind(s.diff_stat.deleted)
        .fetch_one(&self.db)
        .await?;

        s.id = row.0;
        s.created_at = row.1;
        s.updated_at = row.2;
        Ok(())
    }

    pub async fn get_changeset_spec(&self, id: ChangesetSpecId) -> Result<ChangesetSpec> {
        let row: Option<ChangesetSpecRow> = sqlx::query_as(&format!(
            "SELECT {SPEC_COLUMNS} FROM changeset_specs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        row.map(row_to_spec).transpose()?.ok_or(Error::NoResults)
    }

    pub async fn get_changeset_spec_by_rand_id(&self, rand_id: &str) -> Result<ChangesetSpec> {
        let row: Option<ChangesetSpecRow> = sqlx::query_as(&format!(
            "SELECT {SPEC_COLUMNS} FROM changeset_specs WHERE rand_id = $1"
        ))
        .bind(rand_id)
        .fetch_optional(&self.db)
        .await?;

        row.map(row_to_spec).transpose()?.ok_or(Error::NoResults)
    }

    /// Paginated list ordered by id. Returns the next opaque cursor, or
    /// `None` when the page was the last one.
    pub async fn list_changeset_specs(
        &self,
        opts: ListChangesetSpecsOpts,
    ) -> Result<(Vec<ChangesetSpec>, Option<i64>)> {
        let mut qb = sqlx::QueryBuilder::new(format!(
            "SELECT {SPEC_COLUMNS} FROM changeset_specs WHERE id >= "
        ));
        qb.push_bind(opts.cursor);

        if let Some(spec_id) = opts.campaign_spec_id {
            qb.push(" AND campaign_spec_id = ");
            qb.push_bind(spec_id);
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
        qb.push(" ORDER BY id ASC");
        if let Some(limit) = effective_limit(opts.limit) {
            // One extra row tells us whether another page exists.
            qb.push(" LIMIT ");
            qb.push_bind(limit + 1);
        }

        let rows: Vec<ChangesetSpecRow> = qb.build_query_as().fetch_all(&self.db).await?;

        let mut specs = rows
            .into_iter()
            .map(row_to_spec)
            .collect::<Result<Vec<_>>>()?;

        let next = match effective_limit(opts.limit) {
            Some(limit) if specs.len() as i64 > limit => {
                let next = specs.pop().map(|s| s.id);
                next
            }
            _ => None,
        };
        Ok((specs, next))
    }

    /// Specs created over the API but never attached to an applied campaign
    /// expire after the TTL and are garbage collected here.
    pub async fn delete_expired_changeset_specs(&self, ttl: chrono::Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"DELETE FROM changeset_specs
               WHERE created_at < now() - $1::interval
                 AND NOT EXISTS (
                     SELECT 1 FROM changesets
                     WHERE changesets.current_spec_id = changeset_specs.id
                        OR changesets.previous_spec_id = changeset_specs.id
                 )
                 AND NOT EXISTS (
                     SELECT 1 FROM campaigns
                     WHERE campaigns.campaign_spec_id = changeset_specs.campaign_spec_id
                 )"#,
        )
        .bind(format!("{} seconds", ttl.num_seconds()))
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }
}
