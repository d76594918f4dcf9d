use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use armada_core::{ChangesetEvent, ChangesetEventKind, Error, ExternalState, Result};

use crate::http::expect_success;
use crate::ratelimit::RateLimiter;
use crate::registry::GitlabConfig;
use crate::{ChangesetSource, SourceChangeset};

#[derive(Debug)]
pub struct GitlabSource {
    http: reqwest::Client,
    config: GitlabConfig,
    limiter: Arc<RateLimiter>,
}

#[derive(Debug, Clone, Deserialize)]
struct GitlabMergeRequest {
    iid: i64,
    state: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    work_in_progress: bool,
    source_branch: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GitlabStateEvent {
    id: i64,
    state: String,
    created_at: DateTime<Utc>,
    user: GitlabUser,
}

#[derive(Debug, Deserialize)]
struct GitlabNote {
    id: i64,
    created_at: DateTime<Utc>,
    author: GitlabUser,
    #[serde(default)]
    system: bool,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct GitlabUser {
    username: String,
}

impl GitlabSource {
    pub fn new(http: reqwest::Client, config: GitlabConfig, limiter: Arc<RateLimiter>) -> Self {
        Self {
            http,
            config,
            limiter,
        }
    }

    fn project_url(&self, cs: &SourceChangeset<'_>) -> String {
        format!(
            "{}/api/v4/projects/{}",
            self.config.url.trim_end_matches('/'),
            urlencoding::encode(cs.repo.path()),
        )
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T> {
        self.limiter.acquire().await;
        let res = self
            .http
            .get(url)
            .header("PRIVATE-TOKEN", &self.config.token)
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
            .header("PRIVATE-TOKEN", &self.config.token)
            .json(body)
            .send()
            .await?;
        Ok(expect_success(res).await?.json().await?)
    }

    fn merge_request_iid(cs: &SourceChangeset<'_>) -> Result<i64> {
        cs.changeset.external_id.parse().map_err(|_| {
            Error::Internal(format!("changeset {} has no merge request iid", cs.changeset.id))
        })
    }

    fn apply_merge_request(cs: &mut SourceChangeset<'_>, mr: GitlabMergeRequest) {
        let state = match mr.state.as_str() {
            "merged" => ExternalState::Merged,
            "closed" => ExternalState::Closed,
            "locked" => ExternalState::Closed,
            _ if mr.work_in_progress => ExternalState::Draft,
            _ => ExternalState::Open,
        };

        let changeset = &mut *cs.changeset;
        changeset.external_id = mr.iid.to_string();
        changeset.external_branch = mr.source_branch.clone();
        changeset.external_state = Some(state);
        changeset.external_created_at = Some(mr.created_at);
        changeset.external_updated_at = Some(mr.updated_at);
        changeset.metadata = serde_json::json!({
            "iid": mr.iid,
            "title": mr.title,
            "description": mr.description,
            "state": mr.state,
            "work_in_progress": mr.work_in_progress,
            "source_branch": mr.source_branch,
            "created_at": mr.created_at,
            "updated_at": mr.updated_at,
        });
    }

    async fn find_existing(
        &self,
        cs: &mut SourceChangeset<'_>,
    ) -> Result<Option<GitlabMergeRequest>> {
        let url = format!(
            "{}/merge_requests?source_branch={}&state=all",
            self.project_url(cs),
            cs.head_branch(),
        );
        let mut mrs: Vec<GitlabMergeRequest> = self.get_json(url).await?;
        Ok(if mrs.is_empty() { None } else { Some(mrs.remove(0)) })
    }

    async fn create(&self, cs: &mut SourceChangeset<'_>, draft: bool) -> Result<bool> {
        let title = if draft {
            format!("Draft: {}", cs.title)
        } else {
            cs.title.clone()
        };
        let url = format!("{}/merge_requests", self.project_url(cs));
        let body = serde_json::json!({
            "title": title,
            "description": cs.body,
            "source_branch": cs.head_branch(),
            "target_branch": cs.base_branch(),
        });

        match self
            .send_json::<GitlabMergeRequest>(reqwest::Method::POST, url, &body)
            .await
        {
            Ok(mr) => {
                Self::apply_merge_request(cs, mr);
                Ok(false)
            }
            // 409: another merge request already exists for this branch.
            Err(Error::CodeHostStatus { status: 409, message }) => {
                match self.find_existing(cs).await? {
                    Some(mr) => {
                        Self::apply_merge_request(cs, mr);
                        Ok(true)
                    }
                    None => Err(Error::CodeHostStatus { status: 409, message }),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn update_state(&self, cs: &mut SourceChangeset<'_>, event: &str) -> Result<()> {
        let iid = Self::merge_request_iid(cs)?;
        let url = format!("{}/merge_requests/{}", self.project_url(cs), iid);
        let mr: GitlabMergeRequest = self
            .send_json(
                reqwest::Method::PUT,
                url,
                &serde_json::json!({"state_event": event}),
            )
            .await?;
        Self::apply_merge_request(cs, mr);
        Ok(())
    }
}

#[async_trait]
impl ChangesetSource for GitlabSource {
    async fn load_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        let iid = Self::merge_request_iid(cs)?;
        let url = format!("{}/merge_requests/{}", self.project_url(cs), iid);
        let mr: GitlabMergeRequest = self.get_json(url).await?;
        Self::apply_merge_request(cs, mr);
        Ok(())
    }

    async fn create_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<bool> {
        self.create(cs, false).await
    }

    async fn create_draft_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<bool> {
        self.create(cs, true).await
    }

    async fn update_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        let iid = Self::merge_request_iid(cs)?;
        let url = format!("{}/merge_requests/{}", self.project_url(cs), iid);
        let body = serde_json::json!({
            "title": cs.title,
            "description": cs.body,
            "target_branch": cs.base_branch(),
        });
        let mr: GitlabMergeRequest = self.send_json(reqwest::Method::PUT, url, &body).await?;
        Self::apply_merge_request(cs, mr);
        Ok(())
    }

    async fn close_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        if matches!(
            cs.changeset.external_state,
            Some(ExternalState::Closed) | Some(ExternalState::Merged)
        ) {
            return Ok(());
        }
        self.update_state(cs, "close").await
    }

    async fn reopen_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        self.update_state(cs, "reopen").await
    }

    /// GitLab drafts are a title prefix; undrafting rewrites the title.
    async fn undraft_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()> {
        let iid = Self::merge_request_iid(cs)?;
        let url = format!("{}/merge_requests/{}", self.project_url(cs), iid);
        let mr: GitlabMergeRequest = self
            .send_json(
                reqwest::Method::PUT,
                url,
                &serde_json::json!({"title": cs.title}),
            )
            .await?;
        Self::apply_merge_request(cs, mr);
        Ok(())
    }

    async fn create_comment(&self, cs: &mut SourceChangeset<'_>, body: &str) -> Result<()> {
        let iid = Self::merge_request_iid(cs)?;
        let url = format!("{}/merge_requests/{}/notes", self.project_url(cs), iid);
        let _: serde_json::Value = self
            .send_json(reqwest::Method::POST, url, &serde_json::json!({"body": body}))
            .await?;
        Ok(())
    }

    async fn merge_changeset(&self, cs: &mut SourceChangeset<'_>, squash: bool) -> Result<()> {
        let iid = Self::merge_request_iid(cs)?;
        let url = format!("{}/merge_requests/{}/merge", self.project_url(cs), iid);
        let mr: GitlabMergeRequest = self
            .send_json(
                reqwest::Method::PUT,
                url,
                &serde_json::json!({"squash": squash}),
            )
            .await?;
        Self::apply_merge_request(cs, mr);
        Ok(())
    }

    async fn load_events(&self, cs: &mut SourceChangeset<'_>) -> Result<Vec<ChangesetEvent>> {
        let iid = Self::merge_request_iid(cs)?;
        let changeset_id = cs.changeset.id;
        let mut events = Vec::new();

        let state_events: Vec<GitlabStateEvent> = self
            .get_json(format!(
                "{}/merge_requests/{}/resource_state_events",
                self.project_url(cs),
                iid
            ))
            .await?;
        for ev in state_events {
            let kind = match ev.state.as_str() {
                "closed" => ChangesetEventKind::Closed,
                "merged" => ChangesetEventKind::Merged,
                "reopened" => ChangesetEventKind::Reopened,
                _ => continue,
            };
            events.push(ChangesetEvent {
                id: 0,
                changeset_id,
                kind,
                key: ev.id.to_string(),
                metadata: serde_json::json!({
                    "author": ev.user.username,
                    "timestamp": ev.created_at,
                }),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            });
        }

        let notes: Vec<GitlabNote> = self
            .get_json(format!(
                "{}/merge_requests/{}/notes",
                self.project_url(cs),
                iid
            ))
            .await?;
        for note in notes {
            // System notes carry approvals; everything else is a comment.
            let (kind, state) = if note.system && note.body.starts_with("approved this merge request") {
                (ChangesetEventKind::Reviewed, Some("approved"))
            } else if note.system && note.body.starts_with("requested changes") {
                (ChangesetEventKind::Reviewed, Some("changes_requested"))
            } else if note.system {
                continue;
            } else {
                (ChangesetEventKind::Commented, None)
            };
            events.push(ChangesetEvent {
                id: 0,
                changeset_id,
                kind,
                key: note.id.to_string(),
                metadata: serde_json::json!({
                    "author": note.author.username,
                    "state": state,
                    "timestamp": note.created_at,
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
    fn wip_merge_request_maps_to_draft() {
        let mr: GitlabMergeRequest = serde_json::from_value(serde_json::json!({
            "iid": 3,
            "state": "opened",
            "title": "Draft: x",
            "description": "d",
            "work_in_progress": true,
            "source_branch": "fix",
            "created_at": "2020-01-01T00:00:00Z",
            "updated_at": "2020-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(mr.work_in_progress);
        assert_eq!(mr.state, "opened");
    }
}
