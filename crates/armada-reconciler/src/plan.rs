use armada_core::{
    Changeset, ChangesetSpecFields, Error, ExternalState, PublicationState, Result,
};

/// One code-host-facing step. Plans list operations in the fixed execution
/// order of [`Operation::ORDER`]; each is independently skippable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Commit the spec's diff onto the base rev and push the head ref.
    Push,
    /// Import a tracked changeset: first load of remote state and events.
    Import,
    /// Open the pull/merge request (optionally as a draft).
    Publish,
    PublishDraft,
    /// Push title/body/base changes to the remote object.
    Update,
    Undraft,
    Reopen,
    Close,
    /// Refresh the local mirror; the unconditional final step for anything
    /// that exists remotely.
    Sync,
}

impl Operation {
    pub const ORDER: [Operation; 9] = [
        Operation::Push,
        Operation::Import,
        Operation::Publish,
        Operation::PublishDraft,
        Operation::Update,
        Operation::Undraft,
        Operation::Reopen,
        Operation::Close,
        Operation::Sync,
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    ops: Vec<Operation>,
}

impl Plan {
    fn add(&mut self, op: Operation) {
        if !self.ops.contains(&op) {
            self.ops.push(op);
        }
    }

    pub fn contains(&self, op: Operation) -> bool {
        self.ops.contains(&op)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Operations in execution order.
    pub fn ops(&self) -> impl Iterator<Item = Operation> + '_ {
        Operation::ORDER.iter().copied().filter(|op| self.contains(*op))
    }
}

fn diff_of(spec: &ChangesetSpecFields) -> &str {
    spec.commits.first().map(|c| c.diff.as_str()).unwrap_or("")
}

/// Compute the operations needed to drive `changeset` from the state
/// described by `previous` to the state described by `current`. Pure: same
/// inputs, same plan.
pub fn determine_plan(
    previous: Option<&ChangesetSpecFields>,
    current: &ChangesetSpecFields,
    changeset: &Changeset,
) -> Result<Plan> {
    let mut plan = Plan::default();

    // A changeset the rewirer marked for closing skips the delta entirely.
    if changeset.closing {
        if changeset.published() && changeset.open_on_host() {
            plan.add(Operation::Close);
        }
        if changeset.published() {
            plan.add(Operation::Sync);
        }
        return Ok(plan);
    }

    // Tracking spec: nothing to publish, only an initial import.
    if current.external_id.is_some() {
        if changeset.unsynced {
            plan.add(Operation::Import);
        }
        return Ok(plan);
    }

    if current.head_ref.is_empty() {
        return Err(Error::InvalidInput(format!(
            "changeset spec for repo {} has neither externalID nor headRef",
            changeset.repo_id
        )));
    }

    if !changeset.published() {
        // Unpublished changesets only ever move forward when the spec says
        // to publish; `published: false` leaves them local.
        if current.published.is_true() {
            plan.add(Operation::Push);
            plan.add(Operation::Publish);
            plan.add(Operation::Sync);
        } else if current.published.is_draft() {
            plan.add(Operation::Push);
            plan.add(Operation::PublishDraft);
            plan.add(Operation::Sync);
        }
        return Ok(plan);
    }

    // Published: compute the field-level delta against the previous spec.
    if let Some(previous) = previous {
        if diff_of(previous) != diff_of(current) {
            plan.add(Operation::Push);
        }
        if previous.title != current.title
            || previous.body != current.body
            || previous.base_ref != current.base_ref
        {
            plan.add(Operation::Update);
        }
        if previous.published.is_draft() && current.published.is_true() {
            plan.add(Operation::Undraft);
        }
    } else if changeset.publication_state == PublicationState::Draft && current.published.is_true()
    {
        // Adopted without a previous spec; the only safe delta is the
        // publication level.
        plan.add(Operation::Undraft);
    }

    if changeset.external_state == Some(ExternalState::Closed) {
        plan.add(Operation::Reopen);
    }

    plan.add(Operation::Sync);
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_core::{
        DiffStat, GitCommitDescription, PublishMode, PublishedValue, ReconcilerState,
    };
    use chrono::Utc;

    fn branch_spec(title: &str, diff: &str, published: PublishedValue) -> ChangesetSpecFields {
        ChangesetSpecFields {
            external_id: None,
            base_ref: "refs/heads/main".into(),
            base_rev: "cafe".into(),
            head_ref: "refs/heads/armada/fix".into(),
            title: title.into(),
            body: "body".into(),
            commits: vec![GitCommitDescription {
                message: "fix".into(),
                diff: diff.into(),
                author_name: "a".into(),
                author_email: "a@example.com".into(),
            }],
            published,
        }
    }

    fn tracking_spec(external_id: &str) -> ChangesetSpecFields {
        ChangesetSpecFields {
            external_id: Some(external_id.into()),
            ..Default::default()
        }
    }

    fn changeset(publication: PublicationState) -> Changeset {
        let now = Utc::now();
        Changeset {
            id: 1,
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
            current_spec_id: Some(1),
            previous_spec_id: None,
            publication_state: publication,
            reconciler_state: ReconcilerState::Processing,
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
        }
    }

    #[test]
    fn unpublished_spec_with_published_false_plans_nothing() {
        let spec = branch_spec("t", "diff", PublishedValue::Bool(false));
        let plan = determine_plan(None, &spec, &changeset(PublicationState::Unpublished)).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn publishing_plans_push_publish_sync_in_order() {
        let spec = branch_spec("t", "diff", PublishedValue::Bool(true));
        let plan = determine_plan(None, &spec, &changeset(PublicationState::Unpublished)).unwrap();
        let ops: Vec<Operation> = plan.ops().collect();
        assert_eq!(ops, vec![Operation::Push, Operation::Publish, Operation::Sync]);
    }

    #[test]
    fn publishing_as_draft_uses_draft_operation() {
        let spec = branch_spec("t", "diff", PublishedValue::Mode(PublishMode::Draft));
        let plan = determine_plan(None, &spec, &changeset(PublicationState::Unpublished)).unwrap();
        assert!(plan.contains(Operation::PublishDraft));
        assert!(!plan.contains(Operation::Publish));
    }

    #[test]
    fn spec_rotation_with_changed_title_plans_update_only() {
        let previous = branch_spec("old title", "diff", PublishedValue::Bool(true));
        let current = branch_spec("new title", "diff", PublishedValue::Bool(true));
        let plan = determine_plan(
            Some(&previous),
            &current,
            &changeset(PublicationState::Published),
        )
        .unwrap();
        let ops: Vec<Operation> = plan.ops().collect();
        assert_eq!(ops, vec![Operation::Update, Operation::Sync]);
    }

    #[test]
    fn changed_diff_plans_push() {
        let previous = branch_spec("t", "old diff", PublishedValue::Bool(true));
        let current = branch_spec("t", "new diff", PublishedValue::Bool(true));
        let plan = determine_plan(
            Some(&previous),
            &current,
            &changeset(PublicationState::Published),
        )
        .unwrap();
        assert!(plan.contains(Operation::Push));
        assert!(!plan.contains(Operation::Update));
    }

    #[test]
    fn identical_specs_plan_only_sync() {
        let previous = branch_spec("t", "diff", PublishedValue::Bool(true));
        let current = branch_spec("t", "diff", PublishedValue::Bool(true));
        let plan = determine_plan(
            Some(&previous),
            &current,
            &changeset(PublicationState::Published),
        )
        .unwrap();
        let ops: Vec<Operation> = plan.ops().collect();
        assert_eq!(ops, vec![Operation::Sync]);
    }

    #[test]
    fn draft_to_published_plans_undraft() {
        let previous = branch_spec("t", "diff", PublishedValue::Mode(PublishMode::Draft));
        let current = branch_spec("t", "diff", PublishedValue::Bool(true));
        let plan = determine_plan(
            Some(&previous),
            &current,
            &changeset(PublicationState::Draft),
        )
        .unwrap();
        assert!(plan.contains(Operation::Undraft));
    }

    #[test]
    fn published_never_regresses_to_unpublished() {
        // Spec flips back to published: false — the plan must not contain
        // any operation that would take the changeset off the host.
        let previous = branch_spec("t", "diff", PublishedValue::Bool(true));
        let current = branch_spec("t", "diff", PublishedValue::Bool(false));
        let plan = determine_plan(
            Some(&previous),
            &current,
            &changeset(PublicationState::Published),
        )
        .unwrap();
        assert!(!plan.contains(Operation::Close));
        assert!(plan.contains(Operation::Sync));
    }

    #[test]
    fn closing_changeset_plans_close_and_sync() {
        let spec = branch_spec("t", "diff", PublishedValue::Bool(true));
        let mut cs = changeset(PublicationState::Published);
        cs.closing = true;
        cs.external_state = Some(ExternalState::Open);
        let plan = determine_plan(None, &spec, &cs).unwrap();
        let ops: Vec<Operation> = plan.ops().collect();
        assert_eq!(ops, vec![Operation::Close, Operation::Sync]);
    }

    #[test]
    fn closing_an_already_closed_changeset_only_syncs() {
        let spec = branch_spec("t", "diff", PublishedValue::Bool(true));
        let mut cs = changeset(PublicationState::Published);
        cs.closing = true;
        cs.external_state = Some(ExternalState::Closed);
        let plan = determine_plan(None, &spec, &cs).unwrap();
        assert!(!plan.contains(Operation::Close));
        assert!(plan.contains(Operation::Sync));
    }

    #[test]
    fn closing_unpublished_changeset_plans_nothing() {
        let spec = branch_spec("t", "diff", PublishedValue::Bool(false));
        let mut cs = changeset(PublicationState::Unpublished);
        cs.closing = true;
        let plan = determine_plan(None, &spec, &cs).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn unsynced_tracking_changeset_plans_import() {
        let spec = tracking_spec("42");
        let mut cs = changeset(PublicationState::Published);
        cs.unsynced = true;
        let plan = determine_plan(None, &spec, &cs).unwrap();
        let ops: Vec<Operation> = plan.ops().collect();
        assert_eq!(ops, vec![Operation::Import]);
    }

    #[test]
    fn synced_tracking_changeset_plans_nothing() {
        let spec = tracking_spec("42");
        let cs = changeset(PublicationState::Published);
        let plan = determine_plan(None, &spec, &cs).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn externally_closed_changeset_is_reopened() {
        let previous = branch_spec("t", "diff", PublishedValue::Bool(true));
        let current = branch_spec("t", "diff", PublishedValue::Bool(true));
        let mut cs = changeset(PublicationState::Published);
        cs.external_state = Some(ExternalState::Closed);
        let plan = determine_plan(Some(&previous), &current, &cs).unwrap();
        let ops: Vec<Operation> = plan.ops().collect();
        assert_eq!(ops, vec![Operation::Reopen, Operation::Sync]);
    }

    #[test]
    fn plan_is_deterministic() {
        let previous = branch_spec("a", "d1", PublishedValue::Mode(PublishMode::Draft));
        let current = branch_spec("b", "d2", PublishedValue::Bool(true));
        let cs = changeset(PublicationState::Draft);
        let p1 = determine_plan(Some(&previous), &current, &cs).unwrap();
        let p2 = determine_plan(Some(&previous), &current, &cs).unwrap();
        assert_eq!(p1, p2);
    }

    #[test]
    fn spec_without_head_ref_or_external_id_is_a_caller_bug() {
        let spec = ChangesetSpecFields::default();
        let err = determine_plan(None, &spec, &changeset(PublicationState::Unpublished));
        assert!(err.is_err());
    }
}
