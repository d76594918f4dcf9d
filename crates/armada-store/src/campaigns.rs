use chrono::{DateTime, Utc};

use armada_core::{Campaign, CampaignId, ChangesetMutations, Error, OrgId, Result, UserId};

use crate::store::Store;

const CAMPAIGN_COLUMNS: &str = "id, name, description, branch, namespace_user_id, namespace_org_id, author_id, campaign_spec_id, closed_at, created_at, updated_at";

type CampaignRow = (
    i64,
    String,
    String,
    String,
    Option<i64>,
    Option<i64>,
    i64,
    i64,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn row_to_campaign(r: CampaignRow) -> Campaign {
    Campaign {
        id: r.0,
        name: r.1,
        description: r.2,
        branch: r.3,
        namespace_user_id: r.4,
        namespace_org_id: r.5,
        author_id: r.6,
        campaign_spec_id: r.7,
        closed_at: r.8,
        created_at: r.9,
        updated_at: r.10,
    }
}

impl Store {
    pub async fn create_campaign(&self, c: &mut Campaign) -> Result<()> {
        let row: (i64, DateTime<Utc>, DateTime<Utc>) = sqlx::query_as(
            r#"INSERT INTO campaigns
                   (name, description, branch, namespace_user_id, namespace_org_id,
                    author_id, campaign_spec_id, closed_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               RETURNING id, created_at, updated_at"#,
        )
        .bind(&c.name)
        .bind(&c.description)
        .bind(&c.branch)
        .bind(c.namespace_user_id)
        .bind(c.namespace_org_id)
        .bind(c.author_id)
        .bind(c.campaign_spec_id)
        .bind(c.closed_at)
        .fetch_one(&self.db)
        .await?;

        c.id = row.0;
        c.created_at = row.1;
        c.updated_at = row.2;
        Ok(())
    }

    pub async fn update_campaign(&self, c: &mut Campaign) -> Result<()> {
        let row: (DateTime<Utc>,) = sqlx::query_as(
            r#"UPDATE campaigns
               SET name = $1, description = $2, branch = $3, campaign_spec_id = $4,
                   closed_at = $5, updated_at = now()
               WHERE id = $6
               RETURNING updated_at"#,
        )
        .bind(&c.name)
        .bind(&c.description)
        .bind(&c.branch)
        .bind(c.campaign_spec_id)
        .bind(c.closed_at)
        .bind(c.id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(Error::CampaignNotFound(c.id))?;

        c.updated_at = row.0;
        Ok(())
    }

    pub async fn get_campaign(&self, id: CampaignId) -> Result<Campaign> {
        let row: Option<CampaignRow> = sqlx::query_as(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        row.map(row_to_campaign).ok_or(Error::NoResults)
    }

    /// Look up the campaign a spec applies to: same namespace, same name.
    pub async fn get_campaign_by_namespace_and_name(
        &self,
        namespace_user_id: Option<UserId>,
        namespace_org_id: Option<OrgId>,
        name: &str,
    ) -> Result<Campaign> {
        let row: Option<CampaignRow> = sqlx::query_as(&format!(
            r#"SELECT {CAMPAIGN_COLUMNS} FROM campaigns
               WHERE namespace_user_id IS NOT DISTINCT FROM $1
                 AND namespace_org_id IS NOT DISTINCT FROM $2
                 AND name = $3"#
        ))
        .bind(namespace_user_id)
        .bind(namespace_org_id)
        .bind(name)
        .fetch_optional(&self.db)
        .await?;

        row.map(row_to_campaign).ok_or(Error::NoResults)
    }

    pub async fn delete_campaign(&self, id: CampaignId) -> Result<()> {
        let result = sqlx::query("DELETE FROM campaigns WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::CampaignNotFound(id));
        }
        Ok(())
    }

    /// Persist the result of an apply in a single transaction: the campaign
    /// upsert plus every changeset mutation the rewirer emitted. Readers see
    /// either the full pre-apply or full post-apply state.
    pub async fn apply_campaign_mutations(
        &self,
        campaign: &mut Campaign,
        mutations: &mut ChangesetMutations,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;

        if campaign.id == 0 {
            let row: (i64, DateTime<Utc>, DateTime<Utc>) = sqlx::query_as(
                r#"INSERT INTO campaigns
                       (name, description, branch, namespace_user_id, namespace_org_id,
                        author_id, campaign_spec_id)
                   VALUES ($1, $2, $3, $4, $5, $6, $7)
                   RETURNING id, created_at, updated_at"#,
            )
            .bind(&campaign.name)
            .bind(&campaign.description)
            .bind(&campaign.branch)
            .bind(campaign.namespace_user_id)
            .bind(campaign.namespace_org_id)
            .bind(campaign.author_id)
            .bind(campaign.campaign_spec_id)
            .fetch_one(&mut *tx)
            .await?;
            campaign.id = row.0;
            campaign.created_at = row.1;
            campaign.updated_at = row.2;
        } else {
            sqlx::query(
                r#"UPDATE campaigns
                   SET name = $1, description = $2, branch = $3, campaign_spec_id = $4,
                       updated_at = now()
                   WHERE id = $5"#,
            )
            .bind(&campaign.name)
            .bind(&campaign.description)
            .bind(&campaign.branch)
            .bind(campaign.campaign_spec_id)
            .bind(campaign.id)
            .execute(&mut *tx)
            .await?;
        }

        // Changesets created by the rewirer reference the campaign id, which
        // for a fresh campaign only exists now.
        for cs in &mut mutations.create {
            if cs.owned_by_campaign_id == Some(0) {
                cs.owned_by_campaign_id = Some(campaign.id);
            }
            if let Some(slot) = cs.campaign_ids.iter_mut().find(|id| **id == 0) {
                *slot = campaign.id;
            }
            crate::changesets::insert_changeset(&mut tx, cs).await?;
        }
        for cs in &mut mutations.update {
            crate::changesets::update_changeset_tx(&mut tx, cs).await?;
        }
        for &id in &mutations.delete {
            sqlx::query("DELETE FROM changesets WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
