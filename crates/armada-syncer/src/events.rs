use std::collections::HashMap;

use chrono::{DateTime, Utc};

use armada_core::{Changeset, ChangesetEvent, ChangesetEventKind, ExternalState, ReviewState};

/// Reduce review events into the overall review verdict: for each reviewer
/// keep only their most recent substantive review (pending and plain
/// comments carry no verdict), then `ChangesRequested` beats `Approved`
/// beats `Pending`.
pub fn aggregate_review_state<'a, I>(events: I) -> ReviewState
where
    I: IntoIterator<Item = &'a ChangesetEvent>,
{
    let mut latest: HashMap<&str, (DateTime<Utc>, ReviewState)> = HashMap::new();

    for ev in events {
        let state = match ev.kind {
            ChangesetEventKind::Reviewed => match ev.review_state() {
                Some(ReviewState::Pending) | Some(ReviewState::Commented) | None => continue,
                Some(state) => state,
            },
            // A dismissal wipes the reviewer's standing verdict.
            ChangesetEventKind::ReviewDismissed => ReviewState::Dismissed,
            _ => continue,
        };

        let ts = ev.timestamp();
        match latest.get(ev.review_author()) {
            Some((seen, _)) if *seen >= ts => {}
            _ => {
                latest.insert(ev.review_author(), (ts, state));
            }
        }
    }

    let mut any_approved = false;
    for (_, state) in latest.values() {
        match state {
            ReviewState::ChangesRequested => return ReviewState::ChangesRequested,
            ReviewState::Approved => any_approved = true,
            _ => {}
        }
    }
    if any_approved {
        ReviewState::Approved
    } else {
        ReviewState::Pending
    }
}

/// Replay a changeset's events up to `t` and return its external state and
/// review state at that instant, or `None` if it did not exist remotely yet.
/// Merged is terminal: a close after a merge does not demote it.
pub fn changeset_state_at(
    cs: &Changeset,
    events: &[ChangesetEvent],
    t: DateTime<Utc>,
) -> Option<(ExternalState, ReviewState)> {
    let created_at = cs.external_created_at?;
    if created_at > t {
        return None;
    }

    let mut state = ExternalState::Open;
    let mut reviews: Vec<&ChangesetEvent> = Vec::new();

    let mut sorted: Vec<&ChangesetEvent> = events
        .iter()
        .filter(|ev| ev.changeset_id == cs.id && ev.timestamp() <= t)
        .collect();
    sorted.sort_by_key(|ev| ev.timestamp());

    for ev in sorted {
        match ev.kind {
            ChangesetEventKind::Merged => {
                state = ExternalState::Merged;
            }
            ChangesetEventKind::Closed => {
                if state != ExternalState::Merged {
                    state = ExternalState::Closed;
                }
            }
            ChangesetEventKind::Reopened => {
                if state != ExternalState::Merged {
                    state = ExternalState::Open;
                }
            }
            ChangesetEventKind::Reviewed | ChangesetEventKind::ReviewDismissed => {
                reviews.push(ev);
            }
            _ => {}
        }
    }

    Some((state, aggregate_review_state(reviews)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_core::{DiffStat, PublicationState, ReconcilerState};
    use chrono::Duration;

    fn review(author: &str, state: &str, at: DateTime<Utc>) -> ChangesetEvent {
        ChangesetEvent {
            id: 0,
            changeset_id: 1,
            kind: ChangesetEventKind::Reviewed,
            key: format!("{author}-{at}"),
            metadata: serde_json::json!({
                "author": author,
                "state": state,
                "timestamp": at.to_rfc3339(),
            }),
            created_at: at,
            updated_at: at,
        }
    }

    fn plain_event(kind: ChangesetEventKind, at: DateTime<Utc>) -> ChangesetEvent {
        ChangesetEvent {
            id: 0,
            changeset_id: 1,
            kind,
            key: format!("{kind}-{at}"),
            metadata: serde_json::json!({"timestamp": at.to_rfc3339()}),
            created_at: at,
            updated_at: at,
        }
    }

    fn changeset(created_at: DateTime<Utc>) -> Changeset {
        Changeset {
            id: 1,
            repo_id: 1,
            external_service_type: "github".into(),
            external_id: "7".into(),
            external_branch: "fix".into(),
            external_state: Some(ExternalState::Open),
            external_review_state: None,
            external_check_state: None,
            external_created_at: Some(created_at),
            external_updated_at: None,
            campaign_ids: vec![1],
            owned_by_campaign_id: Some(1),
            current_spec_id: None,
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
            created_at,
            updated_at: created_at,
        }
    }

    #[test]
    fn changes_requested_dominates_approvals() {
        let t0 = Utc::now();
        let events = vec![
            review("alice", "approved", t0),
            review("bob", "changes_requested", t0 + Duration::minutes(1)),
        ];
        assert_eq!(
            aggregate_review_state(&events),
            ReviewState::ChangesRequested
        );
    }

    #[test]
    fn later_review_by_same_author_replaces_earlier() {
        let t0 = Utc::now();
        let events = vec![
            review("alice", "changes_requested", t0),
            review("alice", "approved", t0 + Duration::minutes(5)),
        ];
        assert_eq!(aggregate_review_state(&events), ReviewState::Approved);
    }

    #[test]
    fn commented_reviews_carry_no_verdict() {
        let t0 = Utc::now();
        let events = vec![
            review("alice", "approved", t0),
            review("alice", "commented", t0 + Duration::minutes(5)),
        ];
        // The comment does not overwrite the standing approval.
        assert_eq!(aggregate_review_state(&events), ReviewState::Approved);
    }

    #[test]
    fn no_substantive_reviews_means_pending() {
        let t0 = Utc::now();
        let events = vec![review("alice", "commented", t0)];
        assert_eq!(aggregate_review_state(&events), ReviewState::Pending);
    }

    #[test]
    fn closed_then_merged_is_merged() {
        let t0 = Utc::now();
        let cs = changeset(t0);
        let events = vec![
            plain_event(ChangesetEventKind::Closed, t0 + Duration::hours(1)),
            plain_event(ChangesetEventKind::Merged, t0 + Duration::hours(2)),
            plain_event(ChangesetEventKind::Closed, t0 + Duration::hours(3)),
        ];

        let (state, _) = changeset_state_at(&cs, &events, t0 + Duration::hours(4)).unwrap();
        assert_eq!(state, ExternalState::Merged);
    }

    #[test]
    fn state_replay_respects_the_cutoff() {
        let t0 = Utc::now();
        let cs = changeset(t0);
        let events = vec![plain_event(ChangesetEventKind::Closed, t0 + Duration::hours(2))];

        let (at_one, _) = changeset_state_at(&cs, &events, t0 + Duration::hours(1)).unwrap();
        assert_eq!(at_one, ExternalState::Open);
        let (at_three, _) = changeset_state_at(&cs, &events, t0 + Duration::hours(3)).unwrap();
        assert_eq!(at_three, ExternalState::Closed);
    }

    #[test]
    fn changeset_does_not_exist_before_external_creation() {
        let t0 = Utc::now();
        let cs = changeset(t0);
        assert!(changeset_state_at(&cs, &[], t0 - Duration::hours(1)).is_none());
    }
}
