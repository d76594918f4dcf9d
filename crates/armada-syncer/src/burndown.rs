use chrono::{DateTime, Duration, Utc};

use armada_core::{Changeset, ChangesetEvent, ExternalState, ReviewState};

use crate::events::changeset_state_at;

/// Counts of changeset states at one instant, for the burndown chart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangesetCounts {
    pub time: DateTime<Utc>,
    pub total: i32,
    pub merged: i32,
    pub closed: i32,
    pub open: i32,
    pub open_approved: i32,
    pub open_changes_requested: i32,
    pub open_pending: i32,
}

/// Compute daily counts over the inclusive `[start, end]` range by replaying
/// each changeset's event history. Invariants:
/// `total = merged + closed + open` and
/// `open = open_approved + open_changes_requested + open_pending`.
pub fn calc_counts(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    changesets: &[Changeset],
    events: &[ChangesetEvent],
) -> Vec<ChangesetCounts> {
    let mut result = Vec::new();
    let mut t = start;

    while t <= end {
        let mut counts = ChangesetCounts {
            time: t,
            ..Default::default()
        };

        for cs in changesets {
            let Some((state, review)) = changeset_state_at(cs, events, t) else {
                continue;
            };
            counts.total += 1;
            match state {
                ExternalState::Merged => counts.merged += 1,
                ExternalState::Closed => counts.closed += 1,
                _ => {
                    counts.open += 1;
                    match review {
                        ReviewState::Approved => counts.open_approved += 1,
                        ReviewState::ChangesRequested => counts.open_changes_requested += 1,
                        _ => counts.open_pending += 1,
                    }
                }
            }
        }

        result.push(counts);
        t += Duration::days(1);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_core::{ChangesetEventKind, DiffStat, PublicationState, ReconcilerState};

    fn changeset(id: i64, created_at: DateTime<Utc>) -> Changeset {
        Changeset {
            id,
            repo_id: 1,
            external_service_type: "github".into(),
            external_id: id.to_string(),
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

    fn event(changeset_id: i64, kind: ChangesetEventKind, at: DateTime<Utc>) -> ChangesetEvent {
        ChangesetEvent {
            id: 0,
            changeset_id,
            kind,
            key: format!("{kind}-{at}"),
            metadata: serde_json::json!({"timestamp": at.to_rfc3339()}),
            created_at: at,
            updated_at: at,
        }
    }

    fn review(changeset_id: i64, author: &str, state: &str, at: DateTime<Utc>) -> ChangesetEvent {
        ChangesetEvent {
            id: 0,
            changeset_id,
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

    fn day(n: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2020-03-01T00:00:00Z").unwrap().with_timezone(&Utc)
            + Duration::days(n)
    }

    #[test]
    fn counts_track_the_lifecycle() {
        let changesets = vec![changeset(1, day(0)), changeset(2, day(0))];
        let events = vec![
            event(1, ChangesetEventKind::Merged, day(1) + Duration::hours(1)),
            event(2, ChangesetEventKind::Closed, day(2) + Duration::hours(1)),
        ];

        let counts = calc_counts(day(0), day(3), &changesets, &events);
        assert_eq!(counts.len(), 4);

        assert_eq!(counts[0].open, 2);
        assert_eq!(counts[1].merged, 1);
        assert_eq!(counts[1].open, 1);
        assert_eq!(counts[2].merged, 1);
        assert_eq!(counts[2].closed, 1);
        assert_eq!(counts[2].open, 0);
    }

    #[test]
    fn totals_always_close_over_the_partitions() {
        let changesets = vec![
            changeset(1, day(0)),
            changeset(2, day(1)),
            changeset(3, day(2)),
        ];
        let events = vec![
            event(1, ChangesetEventKind::Closed, day(1)),
            event(1, ChangesetEventKind::Reopened, day(2)),
            event(2, ChangesetEventKind::Merged, day(2)),
            review(3, "alice", "approved", day(2) + Duration::hours(1)),
        ];

        for counts in calc_counts(day(0), day(4), &changesets, &events) {
            assert_eq!(counts.total, counts.merged + counts.closed + counts.open);
            assert_eq!(
                counts.open,
                counts.open_approved + counts.open_changes_requested + counts.open_pending
            );
        }
    }

    #[test]
    fn reviews_split_the_open_bucket() {
        let changesets = vec![changeset(1, day(0)), changeset(2, day(0))];
        let events = vec![
            review(1, "alice", "approved", day(0) + Duration::hours(1)),
            review(2, "bob", "changes_requested", day(0) + Duration::hours(1)),
        ];

        let counts = calc_counts(day(1), day(1), &changesets, &events);
        assert_eq!(counts[0].open_approved, 1);
        assert_eq!(counts[0].open_changes_requested, 1);
        assert_eq!(counts[0].open_pending, 0);
    }

    #[test]
    fn changesets_created_mid_range_appear_late() {
        let changesets = vec![changeset(1, day(2))];
        let counts = calc_counts(day(0), day(3), &changesets, &[]);
        assert_eq!(counts[0].total, 0);
        assert_eq!(counts[1].total, 0);
        assert_eq!(counts[2].total, 1);
    }
}
