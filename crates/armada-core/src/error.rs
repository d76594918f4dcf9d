use thiserror::Error;

use crate::types::RepoId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Campaign not found: {0}")]
    CampaignNotFound(i64),

    #[error("Campaign spec not found: {0}")]
    CampaignSpecNotFound(String),

    #[error("Changeset not found: {0}")]
    ChangesetNotFound(i64),

    #[error("Changeset spec not found: {0}")]
    ChangesetSpecNotFound(String),

    #[error("Repository not found: {0}")]
    RepoNotFound(RepoId),

    /// Sentinel for queries that legitimately matched no row.
    #[error("no results")]
    NoResults,

    #[error("Insufficient authorization")]
    InsufficientAuthorization,

    #[error("Campaign name cannot be blank")]
    CampaignNameBlank,

    #[error("Campaign branch is invalid")]
    CampaignBranchInvalid,

    #[error("Duplicate changeset spec for repository {0}")]
    DuplicateChangesetSpec(RepoId),

    #[error("A campaign in the given namespace exists with a different spec")]
    EnsureCampaignFailed,

    #[error("Campaign has changesets currently being processed and cannot be closed")]
    CloseProcessingCampaign,

    #[error("Campaign has changesets currently being processed and cannot be deleted")]
    DeleteProcessingCampaign,

    #[error("Code host not supported: {0}")]
    UnsupportedCodehost(String),

    /// The row is no longer `processing` under this worker; the caller
    /// must abandon its in-flight work.
    #[error("heartbeat lost for changeset {0}")]
    HeartbeatLost(i64),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Non-2xx response from a code host. The reconciler classifies these
    /// into transient (429, 5xx) and permanent (other 4xx) failures.
    #[error("code host returned {status}: {message}")]
    CodeHostStatus { status: u16, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
