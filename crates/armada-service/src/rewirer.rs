use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::warn;

use armada_core::{
    Campaign, Changeset, ChangesetId, ChangesetMutations, ChangesetSpec, ChangesetSpecId,
    Error, PublicationState, ReconcilerState, Repo, RepoId, Result,
};
use armada_store::RewirerMapping;

/// Everything the rewirer needs, loaded up front so the rewire itself does
/// no I/O.
pub struct RewirerInput<'a> {
    pub campaign: &'a Campaign,
    pub mappings: &'a [RewirerMapping],
    pub changeset_specs: HashMap<ChangesetSpecId, ChangesetSpec>,
    pub changesets: HashMap<ChangesetId, Changeset>,
    /// Only the repositories the acting user can see.
    pub accessible_repos: HashMap<RepoId, Repo>,
    /// Code-host kinds with API integration.
    pub supported_kinds: HashSet<String>,
}

/// Compute the changeset mutations that make the campaign match its new
/// spec. Deterministic: mutations are emitted in mapping order, and equal
/// inputs produce equal outputs.
///
/// Access enforcement: a create or spec transition in a repository the
/// actor cannot see fails with `RepoNotFound` so the user observes the gap;
/// a detach of an invisible changeset is silently skipped, since the actor
/// could not discover that repository anyway.
pub fn rewire(input: RewirerInput<'_>) -> Result<ChangesetMutations> {
    let mut mutations = ChangesetMutations::default();
    // A campaign being created in this same transaction has no id yet; the
    // store rewrites the placeholder when it knows one.
    let campaign_id = input.campaign.id;

    for mapping in input.mappings {
        match (mapping.changeset_spec_id, mapping.changeset_id) {
            (0, 0) => {
                return Err(Error::Internal(
                    "rewirer mapping with neither spec nor changeset".into(),
                ))
            }

            // New spec with no live counterpart: create.
            (spec_id, 0) => {
                let spec = lookup_spec(&input.changeset_specs, spec_id)?;
                let repo = input
                    .accessible_repos
                    .get(&mapping.repo_id)
                    .ok_or(Error::RepoNotFound(mapping.repo_id))?;
                check_supported(&input.supported_kinds, repo)?;
                mutations.create.push(new_changeset(campaign_id, spec, repo));
            }

            // Live changeset no longer wanted: detach, closing it remotely
            // first when this campaign owns it and it is published.
            (0, changeset_id) => {
                let cs = lookup_changeset(&input.changesets, changeset_id)?;
                if !input.accessible_repos.contains_key(&cs.repo_id) {
                    warn!(
                        changeset = cs.id,
                        repo = cs.repo_id,
                        "skipping detach of changeset in inaccessible repository"
                    );
                    continue;
                }

                let mut cs = cs.clone();
                if cs.owned_by_campaign_id == Some(campaign_id) {
                    if cs.published() {
                        cs.previous_spec_id = cs.current_spec_id;
                        cs.closing = true;
                        cs.reset_queued();
                        mutations.update.push(cs);
                    } else {
                        // Never published: nothing exists remotely, drop it.
                        mutations.delete.push(cs.id);
                    }
                } else {
                    // Merely tracked: never close someone else's changeset.
                    cs.detach(campaign_id);
                    mutations.update.push(cs);
                }
            }

            // Matched pair.
            (spec_id, changeset_id) => {
                let spec = lookup_spec(&input.changeset_specs, spec_id)?;
                let cs = lookup_changeset(&input.changesets, changeset_id)?;
                let repo = input
                    .accessible_repos
                    .get(&mapping.repo_id)
                    .ok_or(Error::RepoNotFound(mapping.repo_id))?;
                check_supported(&input.supported_kinds, repo)?;

                let mut cs = cs.clone();
                if spec.is_tracking() {
                    // Reattach a tracked changeset; nudge it back onto the
                    // queue if a previous attempt left it errored.
                    cs.attach(campaign_id);
                    if cs.reconciler_state == ReconcilerState::Errored
                        && cs.owned_by_campaign_id.is_none()
                    {
                        cs.reset_queued();
                    }
                    mutations.update.push(cs);
                } else {
                    // Spec transition on an owned changeset.
                    if cs.reconciler_state == ReconcilerState::Completed {
                        cs.previous_spec_id = cs.current_spec_id;
                    }
                    cs.current_spec_id = Some(spec.id);
                    cs.attach(campaign_id);
                    cs.closing = false;
                    cs.diff_stat = spec.diff_stat;
                    cs.reset_queued();
                    mutations.update.push(cs);
                }
            }
        }
    }

    Ok(mutations)
}

fn lookup_spec(
    specs: &HashMap<ChangesetSpecId, ChangesetSpec>,
    id: ChangesetSpecId,
) -> Result<&ChangesetSpec> {
    specs
        .get(&id)
        .ok_or_else(|| Error::Internal(format!("rewirer mapping references unloaded spec {id}")))
}

fn lookup_changeset(
    changesets: &HashMap<ChangesetId, Changeset>,
    id: ChangesetId,
) -> Result<&Changeset> {
    changesets.get(&id).ok_or_else(|| {
        Error::Internal(format!("rewirer mapping references unloaded changeset {id}"))
    })
}

fn check_supported(supported: &HashSet<String>, repo: &Repo) -> Result<()> {
    if !supported.contains(&repo.external_service_type) {
        return Err(Error::UnsupportedCodehost(
            repo.external_service_type.clone(),
        ));
    }
    Ok(())
}

fn new_changeset(campaign_id: i64, spec: &ChangesetSpec, repo: &Repo) -> Changeset {
    let now = Utc::now();
    let mut cs = Changeset {
        id: 0,
        repo_id: repo.id,
        external_service_type: repo.external_service_type.clone(),
        external_id: String::new(),
        external_branch: String::new(),
        external_state: None,
        external_review_state: None,
        external_check_state: None,
        external_created_at: None,
        external_updated_at: None,
        campaign_ids: vec![campaign_id],
        owned_by_campaign_id: None,
        current_spec_id: Some(spec.id),
        previous_spec_id: None,
        publication_state: PublicationState::Unpublished,
        reconciler_state: ReconcilerState::Queued,
        failure_message: None,
        num_failures: 0,
        num_resets: 0,
        process_after: None,
        last_heartbeat_at: None,
        closing: false,
        unsynced: false,
        next_sync_at: None,
        diff_stat: spec.diff_stat,
        metadata: serde_json::Value::Null,
        created_at: now,
        updated_at: now,
    };

    if let Some(external_id) = &spec.spec.external_id {
        // Track an existing changeset: it lives on the host already, we
        // just have not seen it yet.
        cs.external_id = external_id.clone();
        cs.publication_state = PublicationState::Published;
        cs.unsynced = true;
    } else {
        cs.owned_by_campaign_id = Some(campaign_id);
    }
    cs
}
