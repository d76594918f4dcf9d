//! Code-host clients behind a uniform capability set.
//!
//! A [`ChangesetSource`] drives one pull/merge request on one code host:
//! load, create, update, close, reopen, undraft, comment, merge. Every
//! operation mutates the passed changeset in place with the fresh remote
//! metadata, so callers never re-fetch after a write. The [`SourceRegistry`]
//! hands out the right source for a repository and keeps HTTP transports and
//! rate limiters shared per base URL.

mod bitbucket_server;
mod clone_url;
pub mod fake;
mod github;
mod gitlab;
mod http;
mod ratelimit;
mod registry;

use async_trait::async_trait;

use armada_core::{Changeset, Repo, Result};

pub use bitbucket_server::BitbucketServerSource;
pub use clone_url::repo_clone_url;
pub use github::GithubSource;
pub use gitlab::GitlabSource;
pub use ratelimit::RateLimiter;
pub use registry::{
    BitbucketServerConfig, ExternalServiceConfig, GitUrlType, GithubConfig, GitlabConfig,
    RateLimitConfig, SourceRegistry,
};

/// A changeset paired with the desired-state fields of its current spec,
/// which is what code-host create/update calls need.
pub struct SourceChangeset<'a> {
    pub repo: &'a Repo,
    pub title: String,
    pub body: String,
    pub base_ref: String,
    pub head_ref: String,
    pub changeset: &'a mut Changeset,
}

impl SourceChangeset<'_> {
    /// Branch name without the `refs/heads/` prefix, which is what every
    /// host API wants.
    pub fn head_branch(&self) -> &str {
        self.head_ref.strip_prefix("refs/heads/").unwrap_or(&self.head_ref)
    }

    pub fn base_branch(&self) -> &str {
        self.base_ref.strip_prefix("refs/heads/").unwrap_or(&self.base_ref)
    }
}

/// Capability set every supported code host implements.
#[async_trait]
pub trait ChangesetSource: Send + Sync + std::fmt::Debug {
    /// Fetch the current remote state into the changeset.
    async fn load_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()>;

    /// Open a pull/merge request. Returns `true` when the host reports one
    /// already exists for this branch pair; in that case the changeset is
    /// populated from the existing remote object instead of failing, and
    /// callers fall through to update semantics.
    async fn create_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<bool>;

    /// Same as [`create_changeset`](Self::create_changeset) but opened as a
    /// draft, on hosts that support it.
    async fn create_draft_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<bool>;

    /// Push title/body/base changes to the remote object. Idempotent.
    async fn update_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()>;

    /// No-op when the remote object is already closed.
    async fn close_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()>;

    async fn reopen_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()>;

    /// Mark a draft ready for review.
    async fn undraft_changeset(&self, cs: &mut SourceChangeset<'_>) -> Result<()>;

    async fn create_comment(&self, cs: &mut SourceChangeset<'_>, body: &str) -> Result<()>;

    async fn merge_changeset(&self, cs: &mut SourceChangeset<'_>, squash: bool) -> Result<()>;

    /// Fetch the remote timeline, canonicalized into the bounded event set.
    /// Event keys are stable host-side identities so repeated syncs upsert.
    async fn load_events(
        &self,
        cs: &mut SourceChangeset<'_>,
    ) -> Result<Vec<armada_core::ChangesetEvent>>;
}
