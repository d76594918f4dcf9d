//! Collaborator interfaces the core consumes but does not implement:
//! repository lookup (permission filtered) and the authorization predicate.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Repo, RepoId, UserId};

/// The acting identity for a request. Background work runs as the system
/// actor, which sees everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub site_admin: bool,
}

impl Actor {
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            site_admin: false,
        }
    }

    pub fn admin(user_id: UserId) -> Self {
        Self {
            user_id,
            site_admin: true,
        }
    }

    /// Internal background actor (reconciler, syncer).
    pub fn system() -> Self {
        Self {
            user_id: 0,
            site_admin: true,
        }
    }
}

/// Permission-aware repository lookup. Rows the actor cannot access are
/// silently excluded from set lookups; point lookups return
/// [`RepoNotFound`](crate::Error::RepoNotFound) so the caller cannot
/// distinguish "missing" from "forbidden".
#[async_trait]
pub trait RepoStore: Send + Sync {
    async fn get_repos_by_ids(
        &self,
        actor: &Actor,
        ids: &[RepoId],
    ) -> Result<HashMap<RepoId, Repo>>;

    async fn get(&self, actor: &Actor, id: RepoId) -> Result<Repo>;
}

/// Opaque authorization predicate supplied by the host application.
#[async_trait]
pub trait AuthChecker: Send + Sync {
    /// Ok when the actor is a site admin or is `user_id` themselves,
    /// [`InsufficientAuthorization`](crate::Error::InsufficientAuthorization)
    /// otherwise.
    async fn check_site_admin_or_same_user(&self, actor: &Actor, user_id: UserId) -> Result<()>;
}
