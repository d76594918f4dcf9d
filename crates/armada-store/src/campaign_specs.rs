use chrono::{DateTime, Utc};

use armada_core::{CampaignSpec, CampaignSpecFields, CampaignSpecId, Error, Result};

use crate::store::Store;

type CampaignSpecRow = (
    i64,
    String,
    String,
    serde_json::Value,
    Option<i64>,
    Option<i64>,
    i64,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn row_to_spec(r: CampaignSpecRow) -> Result<CampaignSpec> {
    let spec: CampaignSpecFields = serde_json::from_value(r.3)?;
    Ok(CampaignSpec {
        id: r.0,
        rand_id: r.1,
        raw_spec: r.2,
        spec,
        namespace_user_id: r.4,
        namespace_org_id: r.5,
        user_id: r.6,
        created_at: r.7,
        updated_at: r.8,
    })
}

impl Store {
    /// Campaign specs are immutable; there is no update path.
    pub async fn create_campaign_spec(&self, s: &mut CampaignSpec) -> Result<()> {
        let row: (i64, DateTime<Utc>, DateTime<Utc>) = sqlx::query_as(
            r#"INSERT INTO campaign_specs
                   (rand_id, raw_spec, spec, namespace_user_id, namespace_org_id, user_id)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING id, created_at, updated_at"#,
        )
        .bind(&s.rand_id)
        .bind(&s.raw_spec)
        .bind(serde_json::to_value(&s.spec)?)
        .bind(s.namespace_user_id)
        .bind(s.namespace_org_id)
        .bind(s.user_id)
        .fetch_one(&self.db)
        .await?;

        s.id = row.0;
        s.created_at = row.1;
        s.updated_at = row.2;
        Ok(())
    }

    pub async fn get_campaign_spec(&self, id: CampaignSpecId) -> Result<CampaignSpec> {
        let row: Option<CampaignSpecRow> = sqlx::query_as(
            r#"SELECT id, rand_id, raw_spec, spec, namespace_user_id, namespace_org_id,
                      user_id, created_at, updated_at
               FROM campaign_specs WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        row.map(row_to_spec).transpose()?.ok_or(Error::NoResults)
    }

    pub async fn get_campaign_spec_by_rand_id(&self, rand_id: &str) -> Result<CampaignSpec> {
        let row: Option<CampaignSpecRow> = sqlx::query_as(
            r#"SELECT id, rand_id, raw_spec, spec, namespace_user_id, namespace_org_id,
                      user_id, created_at, updated_at
               FROM campaign_specs WHERE rand_id = $1"#,
        )
        .bind(rand_id)
        .fetch_optional(&self.db)
        .await?;

        row.map(row_to_spec).transpose()?.ok_or(Error::NoResults)
    }

    /// Changeset specs cascade with their campaign spec.
    pub async fn delete_campaign_spec(&self, id: CampaignSpecId) -> Result<()> {
        let result = sqlx::query("DELETE FROM campaign_specs WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NoResults);
        }
        Ok(())
    }
}
