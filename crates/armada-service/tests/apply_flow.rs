//! End-to-end rewire-then-reconcile scenarios against fake collaborators:
//! the rewirer emits mutations, the reconciler executor drives the fake
//! code host, and the assertions check the states the two hand off through.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;

use armada_core::{
    Campaign, Changeset, ChangesetSpec, ChangesetSpecFields, DiffStat, ExternalState,
    GitCommitDescription, PublicationState, PublishedValue, ReconcilerState, Repo,
};
use armada_reconciler::{Executor, FakeGitserverClient};
use armada_service::{rewire, RewirerInput};
use armada_sources::fake::{FakeChangesetSource, FakeOp};
use armada_store::RewirerMapping;

fn campaign(id: i64) -> Campaign {
    let now = Utc::now();
    Campaign {
        id,
        name: "update-deps".into(),
        description: "Bump everything".into(),
        branch: "armada/update-deps".into(),
        namespace_user_id: Some(1),
        namespace_org_id: None,
        author_id: 1,
        campaign_spec_id: 1,
        closed_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn repo(id: i64) -> Repo {
    Repo {
        id,
        name: format!("github.com/foo/r{id}"),
        external_service_type: "github".into(),
        private: false,
    }
}

fn branch_spec(id: i64, repo_id: i64, title: &str, diff: &str) -> ChangesetSpec {
    let now = Utc::now();
    ChangesetSpec {
        id,
        rand_id: format!("spec-{id}"),
        campaign_spec_id: 1,
        repo_id,
        user_id: 1,
        raw_spec: String::new(),
        spec: ChangesetSpecFields {
            external_id: None,
            base_ref: "refs/heads/main".into(),
            base_rev: "cafebabe".into(),
            head_ref: "refs/heads/armada/update-deps".into(),
            title: title.into(),
            body: "autogenerated".into(),
            commits: vec![GitCommitDescription {
                message: title.into(),
                diff: diff.into(),
                author_name: "armada".into(),
                author_email: "bot@armada.dev".into(),
            }],
            published: PublishedValue::Bool(true),
        },
        diff_stat: DiffStat {
            added: 1,
            changed: 0,
            deleted: 0,
        },
        created_at: now,
        updated_at: now,
    }
}

fn tracking_spec(id: i64, repo_id: i64, external_id: &str) -> ChangesetSpec {
    let mut spec = branch_spec(id, repo_id, "", "");
    spec.spec = ChangesetSpecFields {
        external_id: Some(external_id.into()),
        ..Default::default()
    };
    spec
}

fn rewirer_input<'a>(
    campaign: &'a Campaign,
    mappings: &'a [RewirerMapping],
    specs: Vec<ChangesetSpec>,
    changesets: Vec<Changeset>,
    repos: Vec<Repo>,
) -> RewirerInput<'a> {
    RewirerInput {
        campaign,
        mappings,
        changeset_specs: specs.into_iter().map(|s| (s.id, s)).collect(),
        changesets: changesets.into_iter().map(|c| (c.id, c)).collect(),
        accessible_repos: repos.into_iter().map(|r| (r.id, r)).collect(),
        supported_kinds: HashSet::from(["github".to_string()]),
    }
}

#[tokio::test]
async fn fresh_apply_then_reconcile_publishes_the_branch_changeset() {
    let campaign = campaign(1);
    let mappings = [
        RewirerMapping { changeset_spec_id: 10, changeset_id: 0, repo_id: 1 },
        RewirerMapping { changeset_spec_id: 11, changeset_id: 0, repo_id: 2 },
    ];
    let branch = branch_spec(10, 1, "Update deps", "+new line");
    let tracked = tracking_spec(11, 2, "42");

    let mutations = rewire(rewirer_input(
        &campaign,
        &mappings,
        vec![branch.clone(), tracked.clone()],
        vec![],
        vec![repo(1), repo(2)],
    ))
    .unwrap();

    // One owned changeset queued unpublished, one tracking changeset queued
    // published and unsynced.
    assert_eq!(mutations.create.len(), 2);
    let owned = mutations.create[0].clone();
    assert_eq!(owned.reconciler_state, ReconcilerState::Queued);
    assert_eq!(owned.publication_state, PublicationState::Unpublished);
    let tracking = &mutations.create[1];
    assert!(tracking.unsynced);
    assert_eq!(tracking.publication_state, PublicationState::Published);

    // A worker picks up the owned changeset.
    let source = FakeChangesetSource::new();
    let gitserver = FakeGitserverClient::new();
    let executor = Executor::new(Arc::new(gitserver.clone()));
    let mut cs = owned;

    executor
        .execute(&source, &repo(1), None, &branch.spec, &mut cs)
        .await
        .unwrap();

    assert_eq!(cs.publication_state, PublicationState::Published);
    assert!(!cs.external_id.is_empty());
    assert_eq!(gitserver.pushes().len(), 1);
    assert_eq!(gitserver.pushes()[0].base_commit, "cafebabe");
}

#[tokio::test]
async fn spec_rotation_invokes_update_exactly_once() {
    let campaign = campaign(1);

    // A completed changeset from the previous apply.
    let s1 = branch_spec(10, 1, "Update deps", "+v1");
    let s2 = branch_spec(20, 1, "Update deps (retry)", "+v1");
    let now = Utc::now();
    let live = Changeset {
        id: 100,
        repo_id: 1,
        external_service_type: "github".into(),
        external_id: "7".into(),
        external_branch: "armada/update-deps".into(),
        external_state: Some(ExternalState::Open),
        external_review_state: None,
        external_check_state: None,
        external_created_at: Some(now),
        external_updated_at: Some(now),
        campaign_ids: vec![1],
        owned_by_campaign_id: Some(1),
        current_spec_id: Some(10),
        previous_spec_id: None,
        publication_state: PublicationState::Published,
        reconciler_state: ReconcilerState::Completed,
        failure_message: None,
        num_failures: 0,
        num_resets: 0,
        process_after: None,
        last_heartbeat_at: None,
        closing: false,
        unsynced: false,
        next_sync_at: None,
        diff_stat: DiffStat::default(),
        metadata: serde_json::Value::Null,
        created_at: now,
        updated_at: now,
    };

    let mappings = [RewirerMapping { changeset_spec_id: 20, changeset_id: 100, repo_id: 1 }];
    let mutations = rewire(rewirer_input(
        &campaign,
        &mappings,
        vec![s2.clone()],
        vec![live],
        vec![repo(1)],
    ))
    .unwrap();

    let mut cs = mutations.update[0].clone();
    assert_eq!(cs.previous_spec_id, Some(10));
    assert_eq!(cs.current_spec_id, Some(20));
    assert_eq!(cs.reconciler_state, ReconcilerState::Queued);

    let source = FakeChangesetSource::new();
    let executor = Executor::new(Arc::new(FakeGitserverClient::new()));
    executor
        .execute(&source, &repo(1), Some(&s1.spec), &s2.spec, &mut cs)
        .await
        .unwrap();

    let updates = source.ops().into_iter().filter(|op| *op == FakeOp::Update).count();
    assert_eq!(updates, 1);
    // The worker clears previous_spec_id once the run succeeds; the
    // executor itself leaves the rotation marker alone.
    assert_eq!(cs.previous_spec_id, Some(10));
}

#[tokio::test]
async fn detached_published_changeset_is_closed_remotely_then_detached() {
    let campaign = campaign(1);
    let now = Utc::now();
    let live = Changeset {
        id: 100,
        repo_id: 1,
        external_service_type: "github".into(),
        external_id: "7".into(),
        external_branch: "armada/update-deps".into(),
        external_state: Some(ExternalState::Open),
        external_review_state: None,
        external_check_state: None,
        external_created_at: Some(now),
        external_updated_at: Some(now),
        campaign_ids: vec![1],
        owned_by_campaign_id: Some(1),
        current_spec_id: Some(10),
        previous_spec_id: None,
        publication_state: PublicationState::Published,
        reconciler_state: ReconcilerState::Completed,
        failure_message: None,
        num_failures: 0,
        num_resets: 0,
        process_after: None,
        last_heartbeat_at: None,
        closing: false,
        unsynced: false,
        next_sync_at: None,
        diff_stat: DiffStat::default(),
        metadata: serde_json::Value::Null,
        created_at: now,
        updated_at: now,
    };

    let mappings = [RewirerMapping { changeset_spec_id: 0, changeset_id: 100, repo_id: 1 }];
    let mutations = rewire(rewirer_input(
        &campaign,
        &mappings,
        vec![branch_spec(10, 1, "t", "+x")],
        vec![live],
        vec![repo(1)],
    ))
    .unwrap();

    let mut cs = mutations.update[0].clone();
    assert!(cs.closing);
    assert_eq!(cs.previous_spec_id, cs.current_spec_id);

    let source = FakeChangesetSource::new();
    let executor = Executor::new(Arc::new(FakeGitserverClient::new()));
    let spec = branch_spec(10, 1, "t", "+x");
    executor
        .execute(&source, &repo(1), None, &spec.spec, &mut cs)
        .await
        .unwrap();

    assert!(source.ops().contains(&FakeOp::Close));
    assert_eq!(cs.external_state, Some(ExternalState::Closed));
    assert!(!cs.closing);
    assert!(!cs.campaign_ids.contains(&1));
}

#[tokio::test]
async fn replay_after_crash_does_not_create_a_duplicate_pull_request() {
    // First attempt: the create succeeded remotely, but the process died
    // before persisting, so the row was reset and a second worker replays
    // the publish against a host that already has the pull request.
    let spec = branch_spec(10, 1, "Update deps", "+x");
    let now = Utc::now();
    let mut cs = Changeset {
        id: 100,
        repo_id: 1,
        external_service_type: "github".into(),
        external_id: String::new(),
        external_branch: String::new(),
        external_state: None,
        external_review_state: None,
        external_check_state: None,
        external_created_at: None,
        external_updated_at: None,
        campaign_ids: vec![1],
        owned_by_campaign_id: Some(1),
        current_spec_id: Some(10),
        previous_spec_id: None,
        publication_state: PublicationState::Unpublished,
        reconciler_state: ReconcilerState::Processing,
        failure_message: None,
        num_failures: 0,
        num_resets: 1,
        process_after: None,
        last_heartbeat_at: None,
        closing: false,
        unsynced: false,
        next_sync_at: None,
        diff_stat: DiffStat::default(),
        metadata: serde_json::Value::Null,
        created_at: now,
        updated_at: now,
    };

    let source = FakeChangesetSource::new();
    source.set_already_exists();
    let executor = Executor::new(Arc::new(FakeGitserverClient::new()));

    executor
        .execute(&source, &repo(1), None, &spec.spec, &mut cs)
        .await
        .unwrap();

    // Exactly one create reached the host, and it adopted the existing
    // object instead of opening a second pull request.
    let creates = source.ops().into_iter().filter(|op| *op == FakeOp::Create).count();
    assert_eq!(creates, 1);
    assert!(source.ops().contains(&FakeOp::Update));
    assert_eq!(cs.publication_state, PublicationState::Published);
}
