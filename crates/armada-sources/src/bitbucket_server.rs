use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use armada_core::{ChangesetEvent, ChangesetEventKind, Error, ExternalState, Result};

use crate::http::expect_success;
use crate::ratelimit::RateLimiter;
use crate::registry::BitbucketServerConfig;
use crate::{ChangesetSource, SourceChangeset};

#[derive(Debug)]
pub struct BitbucketServerSource {
    http: reqwest::Client,
    config: BitbucketServerConfig,
    limiter: Arc<RateLimiter>,
}

#[derive(Debug, Clone, Deserialize)]
struct BitbucketPullRequest {
    id: i64,
    version: i64,
    state: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(rename = "createdDate")]
    created_date: i64,
    #[serde(rename = "updatedDate")]
    updated_date: i64,
    #[serde(rename = "fromRef")]
    from_ref: BitbucketRef,
}

#[derive(Debug, Clone, Deserialize)]
struct BitbucketRef {
    #[serde(rename = "displayId")]
    display_id: String,
}

#[derive(Debug, Deserialize)]
struct BitbucketActivity {
    id: i64,
    action: String,
    #[serde(rename = "createdDate")]
    created_date: i64,
    user: BitbucketUser,
}

#[derive(Debug, Deserialize)]
struct BitbucketUser {
    name: String,
}

#[derive(Debug, Deserialize)]
struct BitbucketPage<T> {
    values: Vec<T>,
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

impl BitbucketServerSource {
    pub fn new(
        http: reqwest::Client,
        config: BitbucketServerConfig,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            http,
            config,
            limiter,
        }
    }

    /// Repo names look like `bitbucket.example.com/PROJ/slug`.
    fn repo_url(&self, cs: &SourceChangeset<'_>) -> Result<String> {
        let path = cs.repo.path();
        let (project, slug) = path.split_once('/').ok_or_else(|| {
            Error::Internal(format!("malformed Bitbucket repo name: {}", cs.repo.name))
        })?;
        Ok(format!(
            "{}/rest/api/1.0/projects/{}/repos/{}",
            self.config.url.trim_end_matches('/'),
            project,
            slug,
        ))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T> {
        self.limiter.acquire().await;
        let res = self
            .http
            .get(url)
            .basic_auth(&self.config.username, Some(&self.config.token))
            .send()
            .await?;
        Ok(expect_success(res).await?.json().await?)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: String,
        body: &serde_json::Value,
    ) -> Result<T> {
        self.limiter.acquire().await;
        let res = self
            .http
            .request(method, url)
            .basic_auth(&self.config.username, Some(&self.config.token))
            .json(body)
            .send()
            .await?;
        Ok(expect_success(res).await?.json().await?)
    }

    fn pull_request_id(cs: &SourceChangeset<'_>) -> Result<i64> {
        cs.changeset.external_id.parse().map_err(|_| {
            Error::Internal(format!(
                "changeset {} has no pull request id",
                cs.changeset.id
            ))
        })
    }

    fn apply_pull_request(cs: &mut SourceChangeset<'_>, pr: BitbucketPullRequest) {
        let state = match pr.state.as_str() {
            "MERGED" => ExternalState::Merged,
            "DECLINED" => ExternalState::Closed,
            _ => ExternalState::Open,
        };

        let changeset = &mut *cs.changeset;
        changeset.external_id = pr.id.to_string();
        changeset.external_branch = pr.from_ref.display_id.clone();
        changeset.external_state = Some(state);
        changeset.external_created_at = Some(millis_to_utc(pr.created_date));
        changeset.external_updated_at = Some(millis_to_utc(pr.updated_date));
        changeset.metadata = serde_json::json!({
            "id": pr.id,
            "version": pr.version,
            "title": pr.title,
            "description": pr.description,
            "state": pr.state,
            "source_branch": pr.from_ref.display_id,
            "created_date": pr.created_date,
            "updated_date": pr.updated_date,
        });
    }

    /// Updates need the current object version or the server rejects with a
    /// conflict, so re-load right before writing.
    fn current_version(cs: &SourceChangeset<'_>) -> i64 {
        cs.changeset
            .metadata
            .get("version")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    async fn find_existing(
        &self,
        cs: &mut SourceChangeset<'_>,
    ) -> Result<Option<BitbucketPullRequest>> {
        let url = format!(
            "{}/pull-requests?at=refs/heads/{}&state=ALL&direction=OUTGOING",
            self.repo_url(cs)?,
            cs.head_branch(),
        );
        let mut page: BitbucketPage<BitbucketPullRequest> = self.get_json(url).await?;
        Ok(if page.values.is_empty() {
            None
        } else {
            Some(page.values.remove(0))
        })
    }
}

#[async_trait]
impl ChangesetSource for BitbucketServerSource {
    async fn load_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        let id = Self::pull_request_id(cs)?;
        let url = format!("{}/pull-requests/{}", self.repo_url(cs)?, id);
        let pr: BitbucketPullRequest = self.get_json(url).await?;
        Self::apply_pull_request(cs, pr);
        Ok(())
    }

    async fn create_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<bool> {
        let url = format!("{}/pull-requests", self.repo_url(cs)?);
        let body = serde_json::json!({
            "title": cs.title,
            "description": cs.body,
            "fromRef": {"id": format!("refs/heads/{}", cs.head_branch())},
            "toRef": {"id": format!("refs/heads/{}", cs.base_branch())},
        });

        match self
            .send_json::<BitbucketPullRequest>(reqwest::Method::POST, url, &body)
            .await
        {
            Ok(pr) => {
                Self::apply_pull_request(cs, pr);
                Ok(false)
            }
            // 409: a pull request for this branch pair already exists.
            Err(Error::CodeHostStatus { status: 409, message }) => {
                match self.find_existing(cs).await? {
                    Some(pr) => {
                        Self::apply_pull_request(cs, pr);
                        Ok(true)
                    }
                    None => Err(Error::CodeHostStatus { status: 409, message }),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn create_draft_changeset(&self, _cs: &mut SourceChangeset<'_>) -> Result<bool> {
        Err(Error::UnsupportedCodehost(
            "bitbucketserver does not support draft pull requests".into(),
        ))
    }

    async fn update_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        self.load_changeset(cs).await?;
        let id = Self::pull_request_id(cs)?;
        let url = format!("{}/pull-requests/{}", self.repo_url(cs)?, id);
        let body = serde_json::json!({
            "version": Self::current_version(cs),
            "title": cs.title,
            "description": cs.body,
            "toRef": {"id": format!("refs/heads/{}", cs.base_branch())},
        });
        let pr: BitbucketPullRequest = self.send_json(reqwest::Method::PUT, url, &body).await?;
        Self::apply_pull_request(cs, pr);
        Ok(())
    }

    async fn close_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        if matches!(
            cs.changeset.external_state,
            Some(ExternalState::Closed) | Some(ExternalState::Merged)
        ) {
            return Ok(());
        }
        self.load_changeset(cs).await?;
        let id = Self::pull_request_id(cs)?;
        let url = format!(
            "{}/pull-requests/{}/decline?version={}",
            self.repo_url(cs)?,
            id,
            Self::current_version(cs),
        );
        let pr: BitbucketPullRequest = self
            .send_json(reqwest::Method::POST, url, &serde_json::json!({}))
            .await?;
        Self::apply_pull_request(cs, pr);
        Ok(())
    }

    async fn reopen_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        self.load_changeset(cs).await?;
        let id = Self::pull_request_id(cs)?;
        let url = format!(
            "{}/pull-requests/{}/reopen?version={}",
            self.repo_url(cs)?,
            id,
            Self::current_version(cs),
        );
        let pr: BitbucketPullRequest = self
            .send_json(reqwest::Method::POST, url, &serde_json::json!({}))
            .await?;
        Self::apply_pull_request(cs, pr);
        Ok(())
    }

    async fn undraft_changeset(&self, _cs: &mut SourceChangeset<'_>) -> Result<()> {
        Err(Error::UnsupportedCodehost(
            "bitbucketserver does not support draft pull requests".into(),
        ))
    }

    async fn create_comment(&self, cs: &mut SourceChangeset<'_>, body: &str) -> Result<()> {
        let id = Self::pull_request_id(cs)?;
        let url = format!("{}/pull-requests/{}/comments", self.repo_url(cs)?, id);
        let _: serde_json::Value = self
            .send_json(reqwest::Method::POST, url, &serde_json::json!({"text": body}))
            .await?;
        Ok(())
    }

    async fn merge_changeset(&self, cs: &mut SourceChangeset<'_>, _squash: bool) -> Result<()> {
        self.load_changeset(cs).await?;
        let id = Self::pull_request_id(cs)?;
        let url = format!(
            "{}/pull-requests/{}/merge?version={}",
            self.repo_url(cs)?,
            id,
            Self::current_version(cs),
        );
        let pr: BitbucketPullRequest = self
            .send_json(reqwest::Method::POST, url, &serde_json::json!({}))
            .await?;
        Self::apply_pull_request(cs, pr);
        Ok(())
    }

    async fn load_events(&self, cs: &mut SourceChangeset<'_>) -> Result<Vec<ChangesetEvent>> {
        let id = Self::pull_request_id(cs)?;
        let changeset_id = cs.changeset.id;
        let url = format!(
            "{}/pull-requests/{}/activities?limit=100",
            self.repo_url(cs)?,
            id
        );
        let page: BitbucketPage<BitbucketActivity> = self.get_json(url).await?;

        let mut events = Vec::new();
        for activity in page.values {
            let (kind, state) = match activity.action.as_str() {
                "DECLINED" => (ChangesetEventKind::Closed, None),
                "MERGED" => (ChangesetEventKind::Merged, None),
                "REOPENED" => (ChangesetEventKind::Reopened, None),
                "APPROVED" => (ChangesetEventKind::Reviewed, Some("approved")),
                "REVIEWED" => (ChangesetEventKind::Reviewed, Some("changes_requested")),
                "COMMENTED" => (ChangesetEventKind::Commented, None),
                _ => continue,
            };
            events.push(ChangesetEvent {
                id: 0,
                changeset_id,
                kind,
                key: activity.id.to_string(),
                metadata: serde_json::json!({
                    "author": activity.user.name,
                    "state": state,
                    "timestamp": millis_to_utc(activity.created_date),
                }),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declined_maps_to_closed() {
        let pr: BitbucketPullRequest = serde_json::from_value(serde_json::json!({
            "id": 11,
            "version": 4,
            "state": "DECLINED",
            "title": "t",
            "description": null,
            "createdDate": 1583020800000i64,
            "updatedDate": 1583107200000i64,
            "fromRef": {"displayId": "fix"}
        }))
        .unwrap();
        assert_eq!(pr.state, "DECLINED");
        assert_eq!(millis_to_utc(pr.created_date).to_rfc3339(), "2020-03-01T00:00:00+00:00");
    }
}
