use std::sync::Arc;

use armada_core::{
    Changeset, ChangesetEvent, ChangesetSpecFields, Error, PublicationState, Repo, Result,
};
use armada_sources::{ChangesetSource, SourceChangeset};

use crate::gitserver::{CommitInfo, CreateCommitFromPatchRequest, GitserverClient};
use crate::plan::{determine_plan, Operation};

/// Executes a reconciliation plan for one changeset. Holds no database
/// handle: the worker loads specs before and persists the mutated changeset
/// and returned events after, which keeps every step here replayable against
/// fakes.
pub struct Executor {
    gitserver: Arc<dyn GitserverClient>,
}

impl Executor {
    pub fn new(gitserver: Arc<dyn GitserverClient>) -> Self {
        Self { gitserver }
    }

    /// Drive the changeset toward `current`, mutating it in place. Returns
    /// the remote events collected by Import/Sync steps for the caller to
    /// persist.
    pub async fn execute(
        &self,
        source: &dyn ChangesetSource,
        repo: &Repo,
        previous: Option<&ChangesetSpecFields>,
        current: &ChangesetSpecFields,
        cs: &mut Changeset,
    ) -> Result<Vec<ChangesetEvent>> {
        let plan = determine_plan(previous, current, cs)?;
        let mut events = Vec::new();

        for op in plan.ops() {
            tracing::debug!(changeset = cs.id, ?op, "executing reconciler operation");
            match op {
                Operation::Push => self.push_commits(repo, current, cs).await?,
                Operation::Import => {
                    let mut sc = source_changeset(repo, current, cs);
                    source.load_changeset(&mut sc).await?;
                    events.extend(source.load_events(&mut sc).await?);
                    cs.publication_state = PublicationState::Published;
                    cs.unsynced = false;
                    touch_next_sync(cs);
                }
                Operation::Publish | Operation::PublishDraft => {
                    let draft = op == Operation::PublishDraft;
                    let mut sc = source_changeset(repo, current, cs);
                    let already_exists = if draft {
                        source.create_draft_changeset(&mut sc).await?
                    } else {
                        source.create_changeset(&mut sc).await?
                    };
                    if already_exists {
                        // The host adopted an existing object for us; fall
                        // through to update semantics so metadata converges.
                        let mut sc = source_changeset(repo, current, cs);
                        source.update_changeset(&mut sc).await?;
                    }
                    // Publication only ever moves forward.
                    let target = if draft {
                        PublicationState::Draft
                    } else {
                        PublicationState::Published
                    };
                    cs.publication_state = cs.publication_state.max(target);
                }
                Operation::Update => {
                    let mut sc = source_changeset(repo, current, cs);
                    source.update_changeset(&mut sc).await?;
                }
                Operation::Undraft => {
                    let mut sc = source_changeset(repo, current, cs);
                    source.undraft_changeset(&mut sc).await?;
                    cs.publication_state = PublicationState::Published;
                }
                Operation::Reopen => {
                    let mut sc = source_changeset(repo, current, cs);
                    source.reopen_changeset(&mut sc).await?;
                }
                Operation::Close => {
                    let mut sc = source_changeset(repo, current, cs);
                    source.close_changeset(&mut sc).await?;
                }
                Operation::Sync => {
                    let mut sc = source_changeset(repo, current, cs);
                    source.load_changeset(&mut sc).await?;
                    events.extend(source.load_events(&mut sc).await?);
                    touch_next_sync(cs);
                }
            }
        }

        // A completed close run detaches the closing campaign.
        if cs.closing {
            cs.closing = false;
            if let Some(owner) = cs.owned_by_campaign_id {
                cs.detach(owner);
            }
        }

        Ok(events)
    }

    async fn push_commits(
        &self,
        repo: &Repo,
        current: &ChangesetSpecFields,
        cs: &mut Changeset,
    ) -> Result<()> {
        let commit = current.commits.first().ok_or_else(|| {
            Error::InvalidInput(format!(
                "changeset spec for repo {} has no commits to push",
                cs.repo_id
            ))
        })?;

        // git apply rejects a patch whose final hunk lacks a trailing
        // newline with "corrupt patch at line N".
        let mut patch = commit.diff.clone();
        if !patch.ends_with('\n') {
            patch.push('\n');
        }

        let req = CreateCommitFromPatchRequest {
            repo: repo.name.clone(),
            base_commit: current.base_rev.clone(),
            patch,
            target_ref: current.head_ref.clone(),
            commit_info: CommitInfo {
                message: commit.message.clone(),
                author_name: commit.author_name.clone(),
                author_email: commit.author_email.clone(),
                committer_name: commit.author_name.clone(),
                committer_email: commit.author_email.clone(),
            },
            // The diffs specs carry are prefix-less and context-less.
            git_apply_args: vec!["-p0".to_string(), "--unidiff-zero".to_string()],
            push: true,
        };

        self.gitserver.create_commit_from_patch(req).await?;
        Ok(())
    }
}

fn source_changeset<'a>(
    repo: &'a Repo,
    spec: &ChangesetSpecFields,
    cs: &'a mut Changeset,
) -> SourceChangeset<'a> {
    SourceChangeset {
        repo,
        title: spec.title.clone(),
        body: spec.body.clone(),
        base_ref: spec.base_ref.clone(),
        head_ref: spec.head_ref.clone(),
        changeset: cs,
    }
}

fn touch_next_sync(cs: &mut Changeset) {
    // The syncer recomputes a state-dependent interval on its own runs;
    // after a reconciler-driven sync, one hour is a safe upper bound.
    cs.next_sync_at = Some(chrono::Utc::now() + chrono::Duration::hours(1));
}

/// Whether a failed step should be retried (network weather, rate limits,
/// host hiccups) or is a terminal refusal.
pub fn is_transient_error(err: &Error) -> bool {
    match err {
        Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        Error::CodeHostStatus { status, .. } => *status == 429 || *status >= 500,
        Error::Database(_) => true,
        _ => false,
    }
}
