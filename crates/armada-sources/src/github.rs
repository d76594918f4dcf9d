use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use armada_core::{
    ChangesetEvent, ChangesetEventKind, Error, ExternalState, Result,
};

use crate::http::expect_success;
use crate::ratelimit::RateLimiter;
use crate::registry::GithubConfig;
use crate::{ChangesetSource, SourceChangeset};

#[derive(Debug)]
pub struct GithubSource {
    http: reqwest::Client,
    config: GithubConfig,
    limiter: Arc<RateLimiter>,
}

#[derive(Debug, Clone, Deserialize)]
struct GithubPull {
    number: i64,
    node_id: String,
    state: String,
    title: String,
    #[serde(default)]
    body: Option<String>,
    draft: bool,
    merged_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    head: GithubRef,
}

#[derive(Debug, Clone, Deserialize)]
struct GithubRef {
    #[serde(rename = "ref")]
    branch: String,
}

#[derive(Debug, Deserialize)]
struct GithubReview {
    id: i64,
    state: String,
    submitted_at: Option<DateTime<Utc>>,
    user: GithubUser,
}

#[derive(Debug, Deserialize)]
struct GithubIssueEvent {
    id: i64,
    event: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    actor: Option<GithubUser>,
    #[serde(default)]
    label: Option<GithubLabel>,
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GithubLabel {
    name: String,
}

impl GithubSource {
    pub fn new(http: reqwest::Client, config: GithubConfig, limiter: Arc<RateLimiter>) -> Self {
        Self {
            http,
            config,
            limiter,
        }
    }

    /// REST root: api.github.com for the public host, `<url>/api/v3` for
    /// GitHub Enterprise.
    fn api_base(&self) -> String {
        let url = self.config.url.trim_end_matches('/');
        if url == "https://github.com" {
            "https://api.github.com".to_string()
        } else {
            format!("{url}/api/v3")
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.limiter.acquire().await;
        let res = self
            .http
            .get(format!("{}{}", self.api_base(), path))
            .bearer_auth(&self.config.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;
        Ok(expect_success(res).await?.json().await?)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        self.limiter.acquire().await;
        let res = self
            .http
            .request(method, format!("{}{}", self.api_base(), path))
            .bearer_auth(&self.config.token)
            .header("Accept", "application/vnd.github+json")
            .json(body)
            .send()
            .await?;
        Ok(expect_success(res).await?.json().await?)
    }

    fn pull_number(cs: &SourceChangeset<'_>) -> Result<i64> {
        cs.changeset
            .external_id
            .parse()
            .map_err(|_| Error::Internal(format!("changeset {} has no pull number", cs.changeset.id)))
    }

    /// Copy the remote object into the changeset mirror.
    fn apply_pull(cs: &mut SourceChangeset<'_>, pull: GithubPull) -> Result<()> {
        let state = if pull.merged_at.is_some() {
            ExternalState::Merged
        } else if pull.state == "closed" {
            ExternalState::Closed
        } else if pull.draft {
            ExternalState::Draft
        } else {
            ExternalState::Open
        };

        let changeset = &mut *cs.changeset;
        changeset.external_id = pull.number.to_string();
        changeset.external_branch = pull.head.branch.clone();
        changeset.external_state = Some(state);
        changeset.external_created_at = Some(pull.created_at);
        changeset.external_updated_at = Some(pull.updated_at);
        changeset.metadata = serde_json::json!({
            "number": pull.number,
            "node_id": pull.node_id,
            "title": pull.title,
            "body": pull.body,
            "state": pull.state,
            "draft": pull.draft,
            "merged_at": pull.merged_at,
            "created_at": pull.created_at,
            "updated_at": pull.updated_at,
            "head_ref": pull.head.branch,
        });
        Ok(())
    }

    async fn find_existing(&self, cs: &mut SourceChangeset<'_>) -> Result<Option<GithubPull>> {
        let owner = cs.repo.path().split('/').next().unwrap_or_default().to_string();
        let path = format!(
            "/repos/{}/pulls?head={}:{}&state=all",
            cs.repo.path(),
            owner,
            cs.head_branch(),
        );
        let mut pulls: Vec<GithubPull> = self.get_json(&path).await?;
        Ok(if pulls.is_empty() {
            None
        } else {
            Some(pulls.remove(0))
        })
    }

    async fn create(&self, cs: &mut SourceChangeset<'_>, draft: bool) -> Result<bool> {
        let path = format!("/repos/{}/pulls", cs.repo.path());
        let body = serde_json::json!({
            "title": cs.title,
            "body": cs.body,
            "head": cs.head_branch(),
            "base": cs.base_branch(),
            "draft": draft,
        });

        match self.send_json::<GithubPull>(reqwest::Method::POST, &path, &body).await {
            Ok(pull) => {
                Self::apply_pull(cs, pull)?;
                Ok(false)
            }
            // 422 "A pull request already exists" — adopt the remote object.
            Err(Error::CodeHostStatus { status: 422, message })
                if message.contains("already exists") =>
            {
                match self.find_existing(cs).await? {
                    Some(pull) => {
                        Self::apply_pull(cs, pull)?;
                        Ok(true)
                    }
                    None => Err(Error::CodeHostStatus {
                        status: 422,
                        message,
                    }),
                }
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ChangesetSource for GithubSource {
    async fn load_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        let number = Self::pull_number(cs)?;
        let pull: GithubPull = self
            .get_json(&format!("/repos/{}/pulls/{}", cs.repo.path(), number))
            .await?;
        Self::apply_pull(cs, pull)
    }

    async fn create_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<bool> {
        self.create(cs, false).await
    }

    async fn create_draft_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<bool> {
        self.create(cs, true).await
    }

    async fn update_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        let number = Self::pull_number(cs)?;
        let path = format!("/repos/{}/pulls/{}", cs.repo.path(), number);
        let body = serde_json::json!({
            "title": cs.title,
            "body": cs.body,
            "base": cs.base_branch(),
        });
        let pull: GithubPull = self.send_json(reqwest::Method::PATCH, &path, &body).await?;
        Self::apply_pull(cs, pull)
    }

    async fn close_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        if matches!(
            cs.changeset.external_state,
            Some(ExternalState::Closed) | Some(ExternalState::Merged)
        ) {
            return Ok(());
        }
        let number = Self::pull_number(cs)?;
        let path = format!("/repos/{}/pulls/{}", cs.repo.path(), number);
        let pull: GithubPull = self
            .send_json(reqwest::Method::PATCH, &path, &serde_json::json!({"state": "closed"}))
            .await?;
        Self::apply_pull(cs, pull)
    }

    async fn reopen_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        let number = Self::pull_number(cs)?;
        let path = format!("/repos/{}/pulls/{}", cs.repo.path(), number);
        let pull: GithubPull = self
            .send_json(reqwest::Method::PATCH, &path, &serde_json::json!({"state": "open"}))
            .await?;
        Self::apply_pull(cs, pull)
    }

    /// Draft state only moves through the GraphQL API.
    async fn undraft_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        let node_id = cs
            .changeset
            .metadata
            .get("node_id")
            .and_then(|v| v.as_str())
            .map(String::from);
        let node_id = match node_id {
            Some(id) => id,
            None => {
                self.load_changeset(cs).await?;
                cs.changeset
                    .metadata
                    .get("node_id")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .ok_or_else(|| {
                        Error::Internal(format!(
                            "changeset {} has no node id for undraft",
                            cs.changeset.id
                        ))
                    })?
            }
        };

        self.limiter.acquire().await;
        let res = self
            .http
            .post(format!("{}/graphql", self.api_base()))
            .bearer_auth(&self.config.token)
            .json(&serde_json::json!({
                "query": "mutation($id: ID!) { markPullRequestReadyForReview(input: {pullRequestId: $id}) { pullRequest { number } } }",
                "variables": {"id": node_id},
            }))
            .send()
            .await?;
        expect_success(res).await?;

        self.load_changeset(cs).await
    }

    async fn create_comment(&self, cs: &mut SourceChangeset<'_>, body: &str) -> Result<()> {
        let number = Self::pull_number(cs)?;
        let path = format!("/repos/{}/issues/{}/comments", cs.repo.path(), number);
        let _: serde_json::Value = self
            .send_json(reqwest::Method::POST, &path, &serde_json::json!({"body": body}))
            .await?;
        Ok(())
    }

    async fn merge_changeset(&self, cs: &mut SourceChangeset<'_>, squash: bool) -> Result<()> {
        let number = Self::pull_number(cs)?;
        let path = format!("/repos/{}/pulls/{}/merge", cs.repo.path(), number);
        let body = serde_json::json!({
            "merge_method": if squash { "squash" } else { "merge" },
        });
        let _: serde_json::Value = self.send_json(reqwest::Method::PUT, &path, &body).await?;
        self.load_changeset(cs).await
    }

    async fn load_events(&self, cs: &mut SourceChangeset<'_>) -> Result<Vec<ChangesetEvent>> {
        let number = Self::pull_number(cs)?;
        let changeset_id = cs.changeset.id;
        let mut events = Vec::new();

        let reviews: Vec<GithubReview> = self
            .get_json(&format!("/repos/{}/pulls/{}/reviews", cs.repo.path(), number))
            .await?;
        for review in reviews {
            let state = match review.state.as_str() {
                "APPROVED" => "approved",
                "CHANGES_REQUESTED" => "changes_requested",
                "COMMENTED" => "commented",
                "DISMISSED" => "dismissed",
                _ => "pending",
            };
            events.push(event(
                changeset_id,
                ChangesetEventKind::Reviewed,
                review.id.to_string(),
                serde_json::json!({
                    "author": review.user.login,
                    "state": state,
                    "timestamp": review.submitted_at,
                }),
            ));
        }

        let issue_events: Vec<GithubIssueEvent> = self
            .get_json(&format!("/repos/{}/issues/{}/events", cs.repo.path(), number))
            .await?;
        for ev in issue_events {
            let kind = match ev.event.as_str() {
                "closed" => ChangesetEventKind::Closed,
                "merged" => ChangesetEventKind::Merged,
                "reopened" => ChangesetEventKind::Reopened,
                "labeled" => ChangesetEventKind::Labeled,
                "unlabeled" => ChangesetEventKind::Unlabeled,
                "review_requested" => ChangesetEventKind::ReviewRequested,
                "review_dismissed" => ChangesetEventKind::ReviewDismissed,
                "ready_for_review" => ChangesetEventKind::MarkedReadyForReview,
                "convert_to_draft" => ChangesetEventKind::ConvertedToDraft,
                _ => continue,
            };
            events.push(event(
                changeset_id,
                kind,
                ev.id.to_string(),
                serde_json::json!({
                    "author": ev.actor.map(|a| a.login),
                    "label": ev.label.map(|l| l.name),
                    "timestamp": ev.created_at,
                }),
            ));
        }

        Ok(events)
    }
}

fn event(
    changeset_id: i64,
    kind: ChangesetEventKind,
    key: String,
    metadata: serde_json::Value,
) -> ChangesetEvent {
    let now = Utc::now();
    ChangesetEvent {
        id: 0,
        changeset_id,
        kind,
        key,
        metadata,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_base_distinguishes_dotcom_from_enterprise() {
        let dotcom = GithubSource::new(
            reqwest::Client::new(),
            GithubConfig {
                url: "https://github.com".into(),
                token: "t".into(),
                git_url_type: Default::default(),
                rate_limit: Default::default(),
            },
            Arc::new(RateLimiter::unlimited()),
        );
        assert_eq!(dotcom.api_base(), "https://api.github.com");

        let ghe = GithubSource::new(
            reqwest::Client::new(),
            GithubConfig {
                url: "https://github.example.com/".into(),
                token: "t".into(),
                git_url_type: Default::default(),
                rate_limit: Default::default(),
            },
            Arc::new(RateLimiter::unlimited()),
        );
        assert_eq!(ghe.api_base(), "https://github.example.com/api/v3");
    }

    #[test]
    fn merged_pull_maps_to_merged_state() {
        let pull: GithubPull = serde_json::from_value(serde_json::json!({
            "number": 7,
            "node_id": "PR_x",
            "state": "closed",
            "title": "t",
            "body": "b",
            "draft": false,
            "merged_at": "2020-01-02T00:00:00Z",
            "created_at": "2020-01-01T00:00:00Z",
            "updated_at": "2020-01-02T00:00:00Z",
            "head": {"ref": "fix"}
        }))
        .unwrap();

        let repo = armada_core::Repo {
            id: 1,
            name: "github.com/foo/bar".into(),
            external_service_type: "github".into(),
            private: false,
        };
        let mut changeset = test_changeset();
        let mut cs = SourceChangeset {
            repo: &repo,
            title: String::new(),
            body: String::new(),
            base_ref: String::new(),
            head_ref: String::new(),
            changeset: &mut changeset,
        };
        GithubSource::apply_pull(&mut cs, pull).unwrap();
        assert_eq!(changeset.external_state, Some(ExternalState::Merged));
        assert_eq!(changeset.external_id, "7");
        assert_eq!(changeset.external_branch, "fix");
    }

    fn test_changeset() -> armada_core::Changeset {
        let now = Utc::now();
        armada_core::Changeset {
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
            campaign_ids: vec![],
            owned_by_campaign_id: None,
            current_spec_id: None,
            previous_spec_id: None,
            publication_state: armada_core::PublicationState::Unpublished,
            reconciler_state: armada_core::ReconcilerState::Queued,
            failure_message: None,
            num_failures: 0,
            num_resets: 0,
            process_after: None,
            last_heartbeat_at: None,
            closing: false,
            unsynced: false,
            next_sync_at: None,
            diff_stat: Default::default(),
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }
}
