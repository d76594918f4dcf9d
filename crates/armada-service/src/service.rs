use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use armada_core::{
    Actor, AuthChecker, Campaign, CampaignId, CampaignSpec, ChangesetId, ChangesetSpec,
    ChangesetSpecFields, Error, OrgId, ReconcilerState, RepoId, RepoStore, Result, UserId,
};
use armada_sources::SourceRegistry;
use armada_store::{
    CampaignStatus, GetCampaignStatusOpts, ListChangesetSpecsOpts, ListChangesetsOpts, Store,
};

use crate::rewirer::{rewire, RewirerInput};
use crate::spec::{diff_stat_of, parse_spec_body, validate_branch};

/// The API the layer above builds on. Every read and write is permission
/// aware: repository visibility comes from the repo store, write rights
/// from the auth checker.
pub struct Service {
    store: Store,
    repos: Arc<dyn RepoStore>,
    auth: Arc<dyn AuthChecker>,
    registry: Arc<SourceRegistry>,
}

impl Service {
    pub fn new(
        store: Store,
        repos: Arc<dyn RepoStore>,
        auth: Arc<dyn AuthChecker>,
        registry: Arc<SourceRegistry>,
    ) -> Self {
        Self {
            store,
            repos,
            auth,
            registry,
        }
    }

    /// Validate and store a campaign spec. The raw body (JSON or YAML)
    /// stays authoritative; the parsed view is stored alongside for queries.
    pub async fn create_campaign_spec(
        &self,
        actor: &Actor,
        namespace_user_id: Option<UserId>,
        namespace_org_id: Option<OrgId>,
        raw_spec: &str,
    ) -> Result<CampaignSpec> {
        let fields: armada_core::CampaignSpecFields = parse_spec_body(raw_spec)?;
        if fields.name.trim().is_empty() {
            return Err(Error::CampaignNameBlank);
        }
        if !fields.changeset_template.branch.is_empty() {
            validate_branch(&fields.changeset_template.branch)?;
        }

        let mut spec = CampaignSpec {
            id: 0,
            rand_id: Uuid::new_v4().simple().to_string(),
            raw_spec: raw_spec.to_string(),
            spec: fields,
            namespace_user_id,
            namespace_org_id,
            user_id: actor.user_id,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.create_campaign_spec(&mut spec).await?;
        info!(rand_id = %spec.rand_id, name = %spec.spec.name, "created campaign spec");
        Ok(spec)
    }

    /// Validate and store one changeset spec. The repository must be
    /// visible to the actor.
    pub async fn create_changeset_spec(
        &self,
        actor: &Actor,
        campaign_spec_id: i64,
        repo_id: RepoId,
        raw_spec: &str,
    ) -> Result<ChangesetSpec> {
        let repo = self.repos.get(actor, repo_id).await?;
        if !self.registry.supports(&repo.external_service_type) {
            return Err(Error::UnsupportedCodehost(repo.external_service_type));
        }

        let fields: ChangesetSpecFields = parse_spec_body(raw_spec)?;
        if fields.external_id.is_none() && fields.head_ref.is_empty() {
            return Err(Error::InvalidInput(
                "changeset spec needs either externalID or headRef".into(),
            ));
        }

        let diff_stat = fields
            .commits
            .first()
            .map(|c| diff_stat_of(&c.diff))
            .unwrap_or_default();

        let mut spec = ChangesetSpec {
            id: 0,
            rand_id: Uuid::new_v4().simple().to_string(),
            campaign_spec_id,
            repo_id,
            user_id: actor.user_id,
            raw_spec: raw_spec.to_string(),
            spec: fields,
            diff_stat,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.create_changeset_spec(&mut spec).await?;
        Ok(spec)
    }

    /// Apply a campaign spec: find or create the target campaign, rewire
    /// its changesets onto the new spec, and enqueue everything affected.
    /// Idempotent: re-applying the spec a campaign already points at
    /// returns it unchanged with zero writes.
    pub async fn apply_campaign(
        &self,
        actor: &Actor,
        spec_rand_id: &str,
        ensure_campaign_id: Option<CampaignId>,
    ) -> Result<Campaign> {
        let spec = match self.store.get_campaign_spec_by_rand_id(spec_rand_id).await {
            Err(Error::NoResults) => {
                return Err(Error::CampaignSpecNotFound(spec_rand_id.to_string()))
            }
            other => other?,
        };
        self.auth
            .check_site_admin_or_same_user(actor, spec.user_id)
            .await?;

        let mut campaign = match self
            .store
            .get_campaign_by_namespace_and_name(
                spec.namespace_user_id,
                spec.namespace_org_id,
                &spec.spec.name,
            )
            .await
        {
            Ok(campaign) => campaign,
            Err(Error::NoResults) => new_campaign(&spec, actor),
            Err(e) => return Err(e),
        };

        if let Some(ensure) = ensure_campaign_id {
            if campaign.id != ensure {
                return Err(Error::EnsureCampaignFailed);
            }
        }

        if campaign.id != 0 && campaign.campaign_spec_id == spec.id {
            return Ok(campaign);
        }

        campaign.campaign_spec_id = spec.id;
        campaign.name = spec.spec.name.clone();
        campaign.description = spec.spec.description.clone();
        campaign.branch = spec.spec.changeset_template.branch.clone();

        let mappings = self
            .store
            .get_rewirer_mappings(spec.id, campaign.id)
            .await?;

        // Load associations for the rewirer: specs, live changesets, and
        // the subset of repos the actor can see.
        let spec_ids: Vec<i64> = mappings
            .iter()
            .map(|m| m.changeset_spec_id)
            .filter(|&id| id != 0)
            .collect();
        let changeset_ids: Vec<i64> = mappings
            .iter()
            .map(|m| m.changeset_id)
            .filter(|&id| id != 0)
            .collect();
        let repo_ids: Vec<RepoId> = {
            let mut ids: Vec<RepoId> = mappings.iter().map(|m| m.repo_id).collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };

        // Empty id lists skip their filter entirely, so guard against
        // accidentally selecting the whole table.
        let changeset_specs = if spec_ids.is_empty() {
            Vec::new()
        } else {
            self.store
                .list_changeset_specs(ListChangesetSpecsOpts {
                    ids: spec_ids,
                    limit: -1,
                    ..Default::default()
                })
                .await?
                .0
        };
        ensure_unique_branches(&changeset_specs)?;

        let changesets = if changeset_ids.is_empty() {
            Vec::new()
        } else {
            self.store
                .list_changesets(ListChangesetsOpts {
                    ids: changeset_ids,
                    limit: -1,
                    ..Default::default()
                })
                .await?
                .0
        };
        let accessible_repos = self.repos.get_repos_by_ids(actor, &repo_ids).await?;

        let mut mutations = rewire(RewirerInput {
            campaign: &campaign,
            mappings: &mappings,
            changeset_specs: changeset_specs.into_iter().map(|s| (s.id, s)).collect(),
            changesets: changesets.into_iter().map(|c| (c.id, c)).collect(),
            accessible_repos,
            supported_kinds: self.supported_kinds(),
        })?;

        self.store
            .apply_campaign_mutations(&mut campaign, &mut mutations)
            .await?;

        info!(
            campaign = campaign.id,
            created = mutations.create.len(),
            updated = mutations.update.len(),
            deleted = mutations.delete.len(),
            "applied campaign spec"
        );
        Ok(campaign)
    }

    /// Close a campaign, optionally enqueueing a remote close for every
    /// owned, published changeset. Refused while owned changesets are still
    /// being processed.
    pub async fn close_campaign(
        &self,
        actor: &Actor,
        id: CampaignId,
        close_changesets: bool,
    ) -> Result<Campaign> {
        let mut campaign = match self.store.get_campaign(id).await {
            Err(Error::NoResults) => return Err(Error::CampaignNotFound(id)),
            other => other?,
        };
        self.auth
            .check_site_admin_or_same_user(actor, campaign.author_id)
            .await?;

        if campaign.closed() {
            return Ok(campaign);
        }
        if self.has_processing_changesets(id).await? {
            return Err(Error::CloseProcessingCampaign);
        }

        if close_changesets {
            let (mut owned, _) = self
                .store
                .list_changesets(ListChangesetsOpts {
                    owned_by_campaign_id: Some(id),
                    limit: -1,
                    ..Default::default()
                })
                .await?;
            owned.retain(|cs| cs.published() && cs.open_on_host());
            for cs in &mut owned {
                cs.previous_spec_id = cs.current_spec_id;
                cs.closing = true;
                cs.reset_queued();
            }
            if !owned.is_empty() {
                self.store.update_changeset_batch(&mut owned).await?;
            }
        }

        campaign.closed_at = Some(Utc::now());
        self.store.update_campaign(&mut campaign).await?;
        info!(campaign = id, close_changesets, "closed campaign");
        Ok(campaign)
    }

    /// Delete a campaign and detach it from every changeset it touched.
    /// Owned, never-published changesets disappear with it.
    pub async fn delete_campaign(&self, actor: &Actor, id: CampaignId) -> Result<()> {
        let campaign = match self.store.get_campaign(id).await {
            Err(Error::NoResults) => return Err(Error::CampaignNotFound(id)),
            other => other?,
        };
        self.auth
            .check_site_admin_or_same_user(actor, campaign.author_id)
            .await?;

        if self.has_processing_changesets(id).await? {
            return Err(Error::DeleteProcessingCampaign);
        }

        let (attached, _) = self
            .store
            .list_changesets(ListChangesetsOpts {
                campaign_id: Some(id),
                limit: -1,
                ..Default::default()
            })
            .await?;

        let mut to_update = Vec::new();
        for mut cs in attached {
            if cs.owned_by_campaign_id == Some(id) && !cs.published() {
                self.store.delete_changeset(cs.id).await?;
            } else {
                cs.detach(id);
                to_update.push(cs);
            }
        }
        if !to_update.is_empty() {
            self.store.update_changeset_batch(&mut to_update).await?;
        }

        self.store.delete_campaign(id).await?;
        info!(campaign = id, "deleted campaign");
        Ok(())
    }

    /// Bump a changeset to the front of the sync schedule.
    pub async fn enqueue_changeset_sync(&self, actor: &Actor, id: ChangesetId) -> Result<()> {
        let cs = match self.store.get_changeset(id).await {
            Err(Error::NoResults) => return Err(Error::ChangesetNotFound(id)),
            other => other?,
        };
        // Visibility gate: the actor must be able to see the repository.
        self.repos.get(actor, cs.repo_id).await?;
        self.store.request_changeset_sync(&[id]).await
    }

    /// Aggregated reconciler progress, with failure messages filtered to
    /// what the actor may see: admins get everything except errors from
    /// repos outside their permission set; everyone else gets counts only.
    pub async fn get_campaign_status(
        &self,
        actor: &Actor,
        campaign: &Campaign,
    ) -> Result<CampaignStatus> {
        let is_admin = self
            .auth
            .check_site_admin_or_same_user(actor, campaign.author_id)
            .await
            .is_ok();

        let opts = if is_admin {
            let failed_repos = self.store.get_campaign_failed_repo_ids(campaign.id).await?;
            let visible = self.repos.get_repos_by_ids(actor, &failed_repos).await?;
            let hidden: Vec<RepoId> = failed_repos
                .into_iter()
                .filter(|id| !visible.contains_key(id))
                .collect();
            GetCampaignStatusOpts {
                exclude_errors: false,
                exclude_errors_in_repos: hidden,
            }
        } else {
            GetCampaignStatusOpts {
                exclude_errors: true,
                exclude_errors_in_repos: Vec::new(),
            }
        };

        self.store.get_campaign_status(campaign.id, opts).await
    }

    async fn has_processing_changesets(&self, campaign_id: CampaignId) -> Result<bool> {
        let count = self
            .store
            .count_changesets(ListChangesetsOpts {
                owned_by_campaign_id: Some(campaign_id),
                reconciler_states: vec![ReconcilerState::Queued, ReconcilerState::Processing],
                ..Default::default()
            })
            .await?;
        Ok(count > 0)
    }

    fn supported_kinds(&self) -> HashSet<String> {
        ["github", "gitlab", "bitbucketserver", "bitbucketcloud"]
            .iter()
            .filter(|kind| self.registry.supports(kind))
            .map(|kind| kind.to_string())
            .collect()
    }
}

fn new_campaign(spec: &CampaignSpec, actor: &Actor) -> Campaign {
    let now = Utc::now();
    Campaign {
        id: 0,
        name: spec.spec.name.clone(),
        description: spec.spec.description.clone(),
        branch: spec.spec.changeset_template.branch.clone(),
        namespace_user_id: spec.namespace_user_id,
        namespace_org_id: spec.namespace_org_id,
        author_id: actor.user_id,
        campaign_spec_id: spec.id,
        closed_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// Two branch specs in the same repository with the same head ref would
/// fight over one changeset.
fn ensure_unique_branches(specs: &[ChangesetSpec]) -> Result<()> {
    let mut seen: HashMap<(RepoId, &str), ()> = HashMap::new();
    for spec in specs {
        if spec.is_tracking() {
            continue;
        }
        if seen
            .insert((spec.repo_id, spec.spec.head_ref.as_str()), ())
            .is_some()
        {
            return Err(Error::DuplicateChangesetSpec(spec.repo_id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_core::DiffStat;

    fn spec(id: i64, repo_id: RepoId, head_ref: &str, tracking: Option<&str>) -> ChangesetSpec {
        let now = Utc::now();
        ChangesetSpec {
            id,
            rand_id: format!("s{id}"),
            campaign_spec_id: 1,
            repo_id,
            user_id: 1,
            raw_spec: String::new(),
            spec: ChangesetSpecFields {
                external_id: tracking.map(String::from),
                head_ref: head_ref.into(),
                ..Default::default()
            },
            diff_stat: DiffStat::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn duplicate_branch_in_same_repo_is_rejected() {
        let specs = vec![
            spec(1, 1, "refs/heads/a", None),
            spec(2, 1, "refs/heads/a", None),
        ];
        assert!(matches!(
            ensure_unique_branches(&specs),
            Err(Error::DuplicateChangesetSpec(1))
        ));
    }

    #[test]
    fn same_branch_in_different_repos_is_fine() {
        let specs = vec![
            spec(1, 1, "refs/heads/a", None),
            spec(2, 2, "refs/heads/a", None),
        ];
        assert!(ensure_unique_branches(&specs).is_ok());
    }

    #[test]
    fn tracking_specs_do_not_count_toward_branch_uniqueness() {
        let specs = vec![
            spec(1, 1, "", Some("42")),
            spec(2, 1, "", Some("43")),
        ];
        assert!(ensure_unique_branches(&specs).is_ok());
    }
}
