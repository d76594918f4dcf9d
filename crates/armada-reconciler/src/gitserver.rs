use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use armada_core::{Error as CoreError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub committer_name: String,
    pub committer_email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCommitFromPatchRequest {
    /// Host-qualified repository name.
    pub repo: String,
    pub base_commit: String,
    /// Unified diff, prefix-less and context-less; see `git_apply_args`.
    pub patch: String,
    pub target_ref: String,
    pub commit_info: CommitInfo,
    pub git_apply_args: Vec<String>,
    pub push: bool,
}

/// Structured failure from gitserver, carrying enough context for a
/// user-facing error message.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("applying patch in {repository} failed: {command}: {combined_output}")]
pub struct CreateCommitFromPatchError {
    pub repository: String,
    pub command: String,
    pub combined_output: String,
}

/// The one RPC the core needs from gitserver: commit a patch onto a base
/// commit and (optionally) push the resulting ref.
#[async_trait]
pub trait GitserverClient: Send + Sync {
    /// Returns the new commit SHA.
    async fn create_commit_from_patch(&self, req: CreateCommitFromPatchRequest) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct CreateCommitResponse {
    #[serde(default)]
    rev: String,
    #[serde(default)]
    error: Option<CreateCommitFromPatchError>,
}

pub struct HttpGitserverClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpGitserverClient {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl GitserverClient for HttpGitserverClient {
    async fn create_commit_from_patch(&self, req: CreateCommitFromPatchRequest) -> Result<String> {
        let res = self
            .http
            .post(format!("{}/create-commit-from-patch", self.base_url))
            .json(&req)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let message = res.text().await.unwrap_or_default();
            return Err(CoreError::CodeHostStatus {
                status: status.as_u16(),
                message,
            });
        }

        let body: CreateCommitResponse = res.json().await?;
        if let Some(err) = body.error {
            return Err(CoreError::Internal(err.to_string()));
        }
        Ok(body.rev)
    }
}

/// Records pushes and hands back deterministic SHAs; for tests.
#[derive(Clone, Default)]
pub struct FakeGitserverClient {
    pushes: Arc<Mutex<Vec<CreateCommitFromPatchRequest>>>,
}

impl FakeGitserverClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pushes(&self) -> Vec<CreateCommitFromPatchRequest> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitserverClient for FakeGitserverClient {
    async fn create_commit_from_patch(&self, req: CreateCommitFromPatchRequest) -> Result<String> {
        let mut pushes = self.pushes.lock().unwrap();
        pushes.push(req);
        Ok(format!("{:040x}", pushes.len()))
    }
}
