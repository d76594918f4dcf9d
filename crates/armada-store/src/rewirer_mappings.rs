use armada_core::{CampaignId, CampaignSpecId, ChangesetId, ChangesetSpecId, RepoId, Result};

use crate::store::Store;

/// One row of the rewirer's input: a desired spec, a live changeset, or a
/// matched pair, always within a single repository. An id of `0` marks the
/// unmatched side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewirerMapping {
    pub changeset_spec_id: ChangesetSpecId,
    pub changeset_id: ChangesetId,
    pub repo_id: RepoId,
}

#[derive(Debug, Clone)]
pub(crate) struct SpecCandidate {
    pub id: ChangesetSpecId,
    pub repo_id: RepoId,
    pub head_ref: String,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct ChangesetCandidate {
    pub id: ChangesetId,
    pub repo_id: RepoId,
    pub external_id: String,
    pub owned_by_campaign_id: Option<CampaignId>,
    /// Head ref of the current spec, falling back to the branch observed on
    /// the code host.
    pub head_ref: String,
    pub attached: bool,
}

/// Pure matching between desired specs and live changesets.
///
/// Tracking specs (external id set) match any changeset mirroring that
/// remote object in the same repository. Branch specs match the changeset
/// the campaign owns on the same (repo, head ref). Attached changesets no
/// spec claimed become detach rows. Output order is deterministic: specs in
/// (repo, head ref / external id) order first, leftover changesets in
/// (repo, id) order after.
pub(crate) fn match_specs_to_changesets(
    mut specs: Vec<SpecCandidate>,
    changesets: Vec<ChangesetCandidate>,
    campaign_id: CampaignId,
) -> Vec<RewirerMapping> {
    specs.sort_by(|a, b| {
        let ka = (a.repo_id, a.external_id.as_deref().unwrap_or(&a.head_ref));
        let kb = (b.repo_id, b.external_id.as_deref().unwrap_or(&b.head_ref));
        ka.cmp(&kb).then(a.id.cmp(&b.id))
    });

    let mut claimed = vec![false; changesets.len()];
    let mut mappings = Vec::with_capacity(specs.len());

    for spec in &specs {
        let found = changesets.iter().enumerate().find(|(i, cs)| {
            if claimed[*i] || cs.repo_id != spec.repo_id {
                return false;
            }
            match &spec.external_id {
                Some(external_id) => cs.external_id == *external_id,
                None => {
                    cs.owned_by_campaign_id == Some(campaign_id) && cs.head_ref == spec.head_ref
                }
            }
        });

        let changeset_id = match found {
            Some((i, cs)) => {
                claimed[i] = true;
                cs.id
            }
            None => 0,
        };
        mappings.push(RewirerMapping {
            changeset_spec_id: spec.id,
            changeset_id,
            repo_id: spec.repo_id,
        });
    }

    // Whatever is still attached but unclaimed gets a detach row.
    let mut leftover: Vec<&ChangesetCandidate> = changesets
        .iter()
        .enumerate()
        .filter(|(i, cs)| !claimed[*i] && cs.attached)
        .map(|(_, cs)| cs)
        .collect();
    leftover.sort_by_key(|cs| (cs.repo_id, cs.id));

    for cs in leftover {
        mappings.push(RewirerMapping {
            changeset_spec_id: 0,
            changeset_id: cs.id,
            repo_id: cs.repo_id,
        });
    }

    mappings
}

impl Store {
    /// Compute the rewirer's input for applying `campaign_spec_id` to
    /// `campaign_id`. A `campaign_id` of `0` means the campaign does not
    /// exist yet, so nothing is attached.
    pub async fn get_rewirer_mappings(
        &self,
        campaign_spec_id: CampaignSpecId,
        campaign_id: CampaignId,
    ) -> Result<Vec<RewirerMapping>> {
        let spec_rows: Vec<(i64, i64, Option<String>, Option<String>)> = sqlx::query_as(
            r#"SELECT id, repo_id, spec->>'headRef', spec->>'externalID'
               FROM changeset_specs
               WHERE campaign_spec_id = $1
               ORDER BY id ASC"#,
        )
        .bind(campaign_spec_id)
        .fetch_all(&self.db)
        .await?;

        let specs: Vec<SpecCandidate> = spec_rows
            .into_iter()
            .map(|r| SpecCandidate {
                id: r.0,
                repo_id: r.1,
                head_ref: r.2.unwrap_or_default(),
                external_id: r.3,
            })
            .collect();

        // Candidates: everything attached to the campaign, plus unattached
        // changesets a tracking spec could adopt (same repo, same external
        // id, possibly tracked by another campaign already).
        let tracked_ids: Vec<String> = specs
            .iter()
            .filter_map(|s| s.external_id.clone())
            .collect();
        let tracked_repos: Vec<i64> = specs
            .iter()
            .filter(|s| s.external_id.is_some())
            .map(|s| s.repo_id)
            .collect();

        let changeset_rows: Vec<(i64, i64, String, Option<i64>, Option<String>, String, bool)> =
            sqlx::query_as(
                r#"SELECT c.id, c.repo_id, c.external_id, c.owned_by_campaign_id,
                          cs.spec->>'headRef', c.external_branch,
                          c.campaign_ids @> $1::jsonb AS attached
                   FROM changesets c
                   LEFT JOIN changeset_specs cs ON cs.id = c.current_spec_id
                   WHERE c.campaign_ids @> $1::jsonb
                      OR (c.external_id = ANY($2) AND c.repo_id = ANY($3))
                   ORDER BY c.id ASC"#,
            )
            .bind(serde_json::json!([campaign_id]))
            .bind(&tracked_ids)
            .bind(&tracked_repos)
            .fetch_all(&self.db)
            .await?;

        let changesets: Vec<ChangesetCandidate> = changeset_rows
            .into_iter()
            .map(|r| ChangesetCandidate {
                id: r.0,
                repo_id: r.1,
                external_id: r.2,
                owned_by_campaign_id: r.3,
                head_ref: r.4.unwrap_or(r.5),
                attached: r.6,
            })
            .collect();

        Ok(match_specs_to_changesets(specs, changesets, campaign_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch_spec(id: i64, repo: i64, head_ref: &str) -> SpecCandidate {
        SpecCandidate {
            id,
            repo_id: repo,
            head_ref: head_ref.into(),
            external_id: None,
        }
    }

    fn tracking_spec(id: i64, repo: i64, external_id: &str) -> SpecCandidate {
        SpecCandidate {
            id,
            repo_id: repo,
            head_ref: String::new(),
            external_id: Some(external_id.into()),
        }
    }

    fn owned_changeset(id: i64, repo: i64, campaign: i64, head_ref: &str) -> ChangesetCandidate {
        ChangesetCandidate {
            id,
            repo_id: repo,
            external_id: String::new(),
            owned_by_campaign_id: Some(campaign),
            head_ref: head_ref.into(),
            attached: true,
        }
    }

    #[test]
    fn fresh_apply_yields_unmatched_specs() {
        let mappings = match_specs_to_changesets(
            vec![branch_spec(10, 1, "refs/heads/fix"), tracking_spec(11, 2, "42")],
            vec![],
            7,
        );
        assert_eq!(
            mappings,
            vec![
                RewirerMapping { changeset_spec_id: 10, changeset_id: 0, repo_id: 1 },
                RewirerMapping { changeset_spec_id: 11, changeset_id: 0, repo_id: 2 },
            ]
        );
    }

    #[test]
    fn branch_spec_matches_owned_changeset_on_head_ref() {
        let mappings = match_specs_to_changesets(
            vec![branch_spec(10, 1, "refs/heads/fix")],
            vec![owned_changeset(100, 1, 7, "refs/heads/fix")],
            7,
        );
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].changeset_id, 100);
    }

    #[test]
    fn branch_spec_ignores_changesets_owned_by_other_campaigns() {
        let mappings = match_specs_to_changesets(
            vec![branch_spec(10, 1, "refs/heads/fix")],
            vec![owned_changeset(100, 1, 99, "refs/heads/fix")],
            7,
        );
        assert_eq!(mappings[0].changeset_id, 0);
        // The foreign changeset is not attached to campaign 7? It is
        // attached=true here, so it shows up as a detach row.
        assert_eq!(mappings[1], RewirerMapping { changeset_spec_id: 0, changeset_id: 100, repo_id: 1 });
    }

    #[test]
    fn tracking_spec_matches_on_external_id() {
        let cs = ChangesetCandidate {
            id: 200,
            repo_id: 3,
            external_id: "42".into(),
            owned_by_campaign_id: None,
            head_ref: String::new(),
            attached: false,
        };
        let mappings =
            match_specs_to_changesets(vec![tracking_spec(12, 3, "42")], vec![cs], 7);
        assert_eq!(
            mappings,
            vec![RewirerMapping { changeset_spec_id: 12, changeset_id: 200, repo_id: 3 }]
        );
    }

    #[test]
    fn unclaimed_attached_changesets_become_detach_rows() {
        let mappings = match_specs_to_changesets(
            vec![],
            vec![
                owned_changeset(101, 2, 7, "refs/heads/b"),
                owned_changeset(100, 1, 7, "refs/heads/a"),
            ],
            7,
        );
        assert_eq!(
            mappings,
            vec![
                RewirerMapping { changeset_spec_id: 0, changeset_id: 100, repo_id: 1 },
                RewirerMapping { changeset_spec_id: 0, changeset_id: 101, repo_id: 2 },
            ]
        );
    }

    #[test]
    fn output_is_deterministic_across_input_orderings() {
        let specs = vec![
            branch_spec(12, 2, "refs/heads/b"),
            branch_spec(10, 1, "refs/heads/a"),
            tracking_spec(11, 1, "9"),
        ];
        let mut reversed = specs.clone();
        reversed.reverse();

        let a = match_specs_to_changesets(specs, vec![], 7);
        let b = match_specs_to_changesets(reversed, vec![], 7);
        assert_eq!(a, b);
    }

    #[test]
    fn each_changeset_is_claimed_at_most_once() {
        let mappings = match_specs_to_changesets(
            vec![branch_spec(10, 1, "refs/heads/fix"), branch_spec(11, 1, "refs/heads/fix")],
            vec![owned_changeset(100, 1, 7, "refs/heads/fix")],
            7,
        );
        let matched: Vec<i64> = mappings.iter().map(|m| m.changeset_id).collect();
        assert_eq!(matched.iter().filter(|&&id| id == 100).count(), 1);
    }
}
