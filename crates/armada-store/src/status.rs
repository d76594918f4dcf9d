use armada_core::{CampaignId, DiffStat, RepoId, Result};

use crate::store::Store;

/// Aggregated reconciler progress for one campaign, used by the API layer
/// for progress reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignStatus {
    pub total: i64,
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub errored: i64,
    pub failed: i64,
    /// User-facing failure messages, already filtered for the actor.
    pub failure_messages: Vec<String>,
}

impl CampaignStatus {
    pub fn finished(&self) -> bool {
        self.queued == 0 && self.processing == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetCampaignStatusOpts {
    /// Hide every failure message (actor without admin rights).
    pub exclude_errors: bool,
    /// Hide failure messages originating in these repositories (admin actor,
    /// repos outside their permission set).
    pub exclude_errors_in_repos: Vec<RepoId>,
}

impl Store {
    pub async fn get_campaign_status(
        &self,
        campaign_id: CampaignId,
        opts: GetCampaignStatusOpts,
    ) -> Result<CampaignStatus> {
        let campaign_ref = serde_json::json!([campaign_id]);

        let counts: Vec<(String, i64)> = sqlx::query_as(
            r#"SELECT reconciler_state, COUNT(*)
               FROM changesets
               WHERE campaign_ids @> $1::jsonb
               GROUP BY reconciler_state"#,
        )
        .bind(&campaign_ref)
        .fetch_all(&self.db)
        .await?;

        let mut status = CampaignStatus::default();
        for (state, count) in counts {
            status.total += count;
            match state.as_str() {
                "queued" => status.queued = count,
                "processing" => status.processing = count,
                "completed" => status.completed = count,
                "errored" => status.errored = count,
                "failed" => status.failed = count,
                _ => {}
            }
        }

        if !opts.exclude_errors {
            let rows: Vec<(String,)> = sqlx::query_as(
                r#"SELECT failure_message
                   FROM changesets
                   WHERE campaign_ids @> $1::jsonb
                     AND reconciler_state IN ('errored', 'failed')
                     AND failure_message IS NOT NULL
                     AND NOT (repo_id = ANY($2))
                   ORDER BY repo_id ASC, id ASC"#,
            )
            .bind(&campaign_ref)
            .bind(&opts.exclude_errors_in_repos)
            .fetch_all(&self.db)
            .await?;
            status.failure_messages = rows.into_iter().map(|r| r.0).collect();
        }

        Ok(status)
    }

    /// Repositories with errored or failed changesets in this campaign,
    /// used to compute which failure messages the actor may see.
    pub async fn get_campaign_failed_repo_ids(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Vec<RepoId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"SELECT DISTINCT repo_id
               FROM changesets
               WHERE campaign_ids @> $1::jsonb
                 AND reconciler_state IN ('errored', 'failed')
               ORDER BY repo_id ASC"#,
        )
        .bind(serde_json::json!([campaign_id]))
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Summed diff stat over a campaign's changesets, restricted to the
    /// repositories the actor may see.
    pub async fn get_campaign_diff_stat(
        &self,
        campaign_id: CampaignId,
        repo_ids: &[RepoId],
    ) -> Result<DiffStat> {
        let row: (Option<i64>, Option<i64>, Option<i64>) = sqlx::query_as(
            r#"SELECT SUM(diff_stat_added), SUM(diff_stat_changed), SUM(diff_stat_deleted)
               FROM changesets
               WHERE campaign_ids @> $1::jsonb AND repo_id = ANY($2)"#,
        )
        .bind(serde_json::json!([campaign_id]))
        .bind(repo_ids)
        .fetch_one(&self.db)
        .await?;

        Ok(DiffStat {
            added: row.0.unwrap_or(0) as i32,
            changed: row.1.unwrap_or(0) as i32,
            deleted: row.2.unwrap_or(0) as i32,
        })
    }
}
