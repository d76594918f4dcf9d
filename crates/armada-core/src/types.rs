use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ── ID types ──
pub type CampaignId = i64;
pub type CampaignSpecId = i64;
pub type ChangesetId = i64;
pub type ChangesetSpecId = i64;
pub type RepoId = i64;
pub type UserId = i64;
pub type OrgId = i64;

// ── Code host kinds ──
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExternalServiceKind {
    GitHub,
    GitLab,
    BitbucketServer,
    BitbucketCloud,
}

impl std::fmt::Display for ExternalServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::BitbucketServer => "bitbucketserver",
            Self::BitbucketCloud => "bitbucketcloud",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ExternalServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Self::GitHub),
            "gitlab" => Ok(Self::GitLab),
            "bitbucketserver" => Ok(Self::BitbucketServer),
            "bitbucketcloud" => Ok(Self::BitbucketCloud),
            other => Err(format!("unknown ExternalServiceKind: {other}")),
        }
    }
}

// ── Changeset states ──

/// State of a changeset inside the reconciler queue. Only `Queued` rows are
/// eligible for dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcilerState {
    Queued,
    Processing,
    Completed,
    Errored,
    Failed,
}

impl std::fmt::Display for ReconcilerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ReconcilerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "errored" => Ok(Self::Errored),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown ReconcilerState: {other}")),
        }
    }
}

/// Publication state advances monotonically and never regresses:
/// `Unpublished < Draft < Published`. `Draft` is a substate of published as
/// far as remote existence is concerned (the changeset exists on the host).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PublicationState {
    Unpublished,
    Draft,
    Published,
}

impl PublicationState {
    /// True when the changeset exists on the code host (draft included).
    pub fn published(&self) -> bool {
        !matches!(self, Self::Unpublished)
    }
}

impl std::fmt::Display for PublicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unpublished => "unpublished",
            Self::Draft => "draft",
            Self::Published => "published",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PublicationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unpublished" => Ok(Self::Unpublished),
            "draft" => Ok(Self::Draft),
            "published" => Ok(Self::Published),
            other => Err(format!("unknown PublicationState: {other}")),
        }
    }
}

/// Mirror of the pull/merge request state on the code host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternalState {
    Draft,
    Open,
    Closed,
    Merged,
    Deleted,
}

impl std::fmt::Display for ExternalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Merged => "merged",
            Self::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ExternalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "merged" => Ok(Self::Merged),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown ExternalState: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Pending,
    Commented,
    Dismissed,
}

impl std::fmt::Display for ReviewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
            Self::Pending => "pending",
            Self::Commented => "commented",
            Self::Dismissed => "dismissed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ReviewState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "changes_requested" => Ok(Self::ChangesRequested),
            "pending" => Ok(Self::Pending),
            "commented" => Ok(Self::Commented),
            "dismissed" => Ok(Self::Dismissed),
            other => Err(format!("unknown ReviewState: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckState {
    Unknown,
    Pending,
    Passed,
    Failed,
}

impl std::fmt::Display for CheckState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Pending => "pending",
            Self::Passed => "passed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for CheckState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "pending" => Ok(Self::Pending),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown CheckState: {other}")),
        }
    }
}

// ── Changeset events ──

/// Canonicalized kinds of code-host-originated timeline events. Remote
/// payloads of all supported hosts reduce to this bounded set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangesetEventKind {
    Closed,
    Merged,
    Reopened,
    Reviewed,
    ReviewDismissed,
    ReviewRequested,
    Commented,
    Committed,
    Labeled,
    Unlabeled,
    MarkedReadyForReview,
    ConvertedToDraft,
}

impl std::fmt::Display for ChangesetEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Merged => "merged",
            Self::Reopened => "reopened",
            Self::Reviewed => "reviewed",
            Self::ReviewDismissed => "review_dismissed",
            Self::ReviewRequested => "review_requested",
            Self::Commented => "commented",
            Self::Committed => "committed",
            Self::Labeled => "labeled",
            Self::Unlabeled => "unlabeled",
            Self::MarkedReadyForReview => "ready_for_review",
            Self::ConvertedToDraft => "converted_to_draft",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ChangesetEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "merged" => Ok(Self::Merged),
            "reopened" => Ok(Self::Reopened),
            "reviewed" => Ok(Self::Reviewed),
            "review_dismissed" => Ok(Self::ReviewDismissed),
            "review_requested" => Ok(Self::ReviewRequested),
            "commented" => Ok(Self::Commented),
            "committed" => Ok(Self::Committed),
            "labeled" => Ok(Self::Labeled),
            "unlabeled" => Ok(Self::Unlabeled),
            "ready_for_review" => Ok(Self::MarkedReadyForReview),
            "converted_to_draft" => Ok(Self::ConvertedToDraft),
            other => Err(format!("unknown ChangesetEventKind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesetEvent {
    pub id: i64,
    pub changeset_id: ChangesetId,
    pub kind: ChangesetEventKind,
    /// Host-side identity of the event, unique per (changeset, kind). Lets
    /// repeated syncs upsert instead of duplicating.
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl ChangesetEvent {
    /// Timestamp the event occurred at on the code host, falling back to the
    /// local creation time when the payload carries none.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.metadata
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(self.created_at)
    }

    /// Author login for review-shaped events, empty otherwise.
    pub fn review_author(&self) -> &str {
        self.metadata
            .get("author")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }

    /// Review verdict for `Reviewed` events.
    pub fn review_state(&self) -> Option<ReviewState> {
        self.metadata
            .get("state")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }
}

// ── Published value ──

/// The `published` field of a changeset spec: `true`, `false`, or the string
/// `"draft"`. Round-trips through both JSON and YAML bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PublishedValue {
    Bool(bool),
    Mode(PublishMode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    Draft,
}

impl PublishedValue {
    pub fn is_true(&self) -> bool {
        matches!(self, Self::Bool(true))
    }

    pub fn is_false(&self) -> bool {
        matches!(self, Self::Bool(false))
    }

    pub fn is_draft(&self) -> bool {
        matches!(self, Self::Mode(PublishMode::Draft))
    }
}

impl Default for PublishedValue {
    fn default() -> Self {
        Self::Bool(false)
    }
}

// ── Diff stat ──

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStat {
    pub added: i32,
    pub changed: i32,
    pub deleted: i32,
}

impl DiffStat {
    pub fn add(&mut self, other: DiffStat) {
        self.added += other.added;
        self.changed += other.changed;
        self.deleted += other.deleted;
    }
}

// ── Campaign specs ──

/// Parsed structural view of a campaign spec body. The raw body stays
/// authoritative; this is re-derived on read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignSpecFields {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Branch template applied to changesets created from this spec.
    #[serde(default, rename = "changesetTemplate")]
    pub changeset_template: ChangesetTemplate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangesetTemplate {
    #[serde(default)]
    pub branch: String,
}

#[derive(Debug, Clone)]
pub struct CampaignSpec {
    pub id: CampaignSpecId,
    /// Opaque identifier handed to API clients instead of the row id.
    pub rand_id: String,
    pub raw_spec: String,
    pub spec: CampaignSpecFields,
    pub namespace_user_id: Option<UserId>,
    pub namespace_org_id: Option<OrgId>,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Changeset specs ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitCommitDescription {
    pub message: String,
    pub diff: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub author_email: String,
}

/// Parsed structural view of a changeset spec body. Either `external_id` is
/// set (track an existing PR) or the branch fields are (create one).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangesetSpecFields {
    #[serde(default, rename = "externalID", skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, rename = "baseRef")]
    pub base_ref: String,
    #[serde(default, rename = "baseRev")]
    pub base_rev: String,
    #[serde(default, rename = "headRef")]
    pub head_ref: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub commits: Vec<GitCommitDescription>,
    #[serde(default)]
    pub published: PublishedValue,
}

#[derive(Debug, Clone)]
pub struct ChangesetSpec {
    pub id: ChangesetSpecId,
    pub rand_id: String,
    pub campaign_spec_id: CampaignSpecId,
    pub repo_id: RepoId,
    pub user_id: UserId,
    pub raw_spec: String,
    pub spec: ChangesetSpecFields,
    pub diff_stat: DiffStat,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChangesetSpec {
    /// A spec that tracks an existing changeset on the code host.
    pub fn is_tracking(&self) -> bool {
        self.spec.external_id.is_some()
    }

    /// A spec that describes a branch Armada owns and publishes.
    pub fn is_branch(&self) -> bool {
        self.spec.external_id.is_none()
    }
}

// ── Campaigns ──

#[derive(Debug, Clone)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub description: String,
    pub branch: String,
    pub namespace_user_id: Option<UserId>,
    pub namespace_org_id: Option<OrgId>,
    pub author_id: UserId,
    pub campaign_spec_id: CampaignSpecId,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn closed(&self) -> bool {
        self.closed_at.is_some()
    }
}

// ── Changesets ──

/// Local mirror of one pull/merge request on one code host.
#[derive(Debug, Clone)]
pub struct Changeset {
    pub id: ChangesetId,
    pub repo_id: RepoId,
    pub external_service_type: String,
    pub external_id: String,
    pub external_branch: String,
    pub external_state: Option<ExternalState>,
    pub external_review_state: Option<ReviewState>,
    pub external_check_state: Option<CheckState>,
    pub external_created_at: Option<DateTime<Utc>>,
    pub external_updated_at: Option<DateTime<Utc>>,
    /// Campaigns this changeset is attached to (owner included).
    pub campaign_ids: Vec<CampaignId>,
    /// Set iff Armada created this changeset, as opposed to tracking one
    /// that already existed on the host.
    pub owned_by_campaign_id: Option<CampaignId>,
    pub current_spec_id: Option<ChangesetSpecId>,
    /// Only set while a spec transition is in flight.
    pub previous_spec_id: Option<ChangesetSpecId>,
    pub publication_state: PublicationState,
    pub reconciler_state: ReconcilerState,
    pub failure_message: Option<String>,
    pub num_failures: i32,
    pub num_resets: i32,
    pub process_after: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub closing: bool,
    /// Tracked changesets start unsynced until the syncer loads them.
    pub unsynced: bool,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub diff_stat: DiffStat,
    /// Raw code-host payload from the last sync.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Changeset {
    pub fn attached_to(&self, campaign: CampaignId) -> bool {
        self.campaign_ids.contains(&campaign)
    }

    pub fn attach(&mut self, campaign: CampaignId) {
        if !self.attached_to(campaign) {
            self.campaign_ids.push(campaign);
            self.campaign_ids.sort_unstable();
        }
    }

    pub fn detach(&mut self, campaign: CampaignId) {
        self.campaign_ids.retain(|&id| id != campaign);
    }

    pub fn published(&self) -> bool {
        self.publication_state.published()
    }

    pub fn open_on_host(&self) -> bool {
        matches!(
            self.external_state,
            Some(ExternalState::Open) | Some(ExternalState::Draft)
        )
    }

    /// Put the changeset back on the reconciler queue for immediate pickup.
    pub fn reset_queued(&mut self) {
        self.reconciler_state = ReconcilerState::Queued;
        self.num_failures = 0;
        self.failure_message = None;
        self.process_after = None;
    }
}

// ── Repositories ──

/// The slice of a repository the core needs: identity, routing to the right
/// code host, and the path components for API and clone URLs. Discovery and
/// cloning live elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: RepoId,
    /// Host-qualified name, e.g. `github.com/foo/bar`.
    pub name: String,
    pub external_service_type: String,
    pub private: bool,
}

impl Repo {
    /// The path portion of the name, without the host prefix.
    pub fn path(&self) -> &str {
        match self.name.split_once('/') {
            Some((_, rest)) => rest,
            None => &self.name,
        }
    }
}

/// The rewirer's output: every persistence action required so the campaign
/// matches its new spec. Applied atomically by the store.
#[derive(Debug, Default)]
pub struct ChangesetMutations {
    pub create: Vec<Changeset>,
    pub update: Vec<Changeset>,
    pub delete: Vec<ChangesetId>,
}

impl ChangesetMutations {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publication_state_ordering_is_monotonic() {
        assert!(PublicationState::Unpublished < PublicationState::Draft);
        assert!(PublicationState::Draft < PublicationState::Published);
        assert!(PublicationState::Draft.published());
        assert!(!PublicationState::Unpublished.published());
    }

    #[test]
    fn reconciler_state_roundtrips_through_strings() {
        for state in [
            ReconcilerState::Queued,
            ReconcilerState::Processing,
            ReconcilerState::Completed,
            ReconcilerState::Errored,
            ReconcilerState::Failed,
        ] {
            let parsed: ReconcilerState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("resting".parse::<ReconcilerState>().is_err());
    }

    #[test]
    fn published_value_parses_bool_and_draft() {
        let t: PublishedValue = serde_json::from_str("true").unwrap();
        assert!(t.is_true());
        let f: PublishedValue = serde_json::from_str("false").unwrap();
        assert!(f.is_false());
        let d: PublishedValue = serde_json::from_str("\"draft\"").unwrap();
        assert!(d.is_draft());
        assert!(serde_json::from_str::<PublishedValue>("\"sometime\"").is_err());
    }

    #[test]
    fn changeset_attach_detach_is_a_set() {
        let mut cs = sample_changeset();
        cs.attach(7);
        cs.attach(3);
        cs.attach(7);
        assert_eq!(cs.campaign_ids, vec![3, 7]);
        cs.detach(7);
        assert_eq!(cs.campaign_ids, vec![3]);
        assert!(!cs.attached_to(7));
    }

    #[test]
    fn changeset_spec_kind_predicates() {
        let now = Utc::now();
        let mut spec = ChangesetSpec {
            id: 1,
            rand_id: "abc".into(),
            campaign_spec_id: 1,
            repo_id: 1,
            user_id: 1,
            raw_spec: String::new(),
            spec: ChangesetSpecFields {
                external_id: Some("42".into()),
                ..Default::default()
            },
            diff_stat: DiffStat::default(),
            created_at: now,
            updated_at: now,
        };
        assert!(spec.is_tracking());
        assert!(!spec.is_branch());

        spec.spec = ChangesetSpecFields {
            head_ref: "refs/heads/fix".into(),
            ..Default::default()
        };
        assert!(spec.is_branch());
        assert!(!spec.is_tracking());
    }

    #[test]
    fn event_timestamp_falls_back_to_created_at() {
        let created = Utc::now();
        let ev = ChangesetEvent {
            id: 1,
            changeset_id: 2,
            kind: ChangesetEventKind::Closed,
            key: "x".into(),
            created_at: created,
            updated_at: created,
            metadata: serde_json::json!({}),
        };
        assert_eq!(ev.timestamp(), created);

        let ev2 = ChangesetEvent {
            metadata: serde_json::json!({"timestamp": "2020-03-01T12:00:00Z"}),
            ..ev
        };
        assert_eq!(
            ev2.timestamp(),
            DateTime::parse_from_rfc3339("2020-03-01T12:00:00Z").unwrap()
        );
    }

    fn sample_changeset() -> Changeset {
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
            campaign_ids: Vec::new(),
            owned_by_campaign_id: None,
            current_spec_id: None,
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
            diff_stat: DiffStat::default(),
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }
}
