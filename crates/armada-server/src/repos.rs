use std::collections::HashMap;

use async_trait::async_trait;

use armada_core::{Actor, Error, Repo, RepoId, Result};
use armada_store::Store;

/// Repo lookup over the `repos` mirror table the external repo syncer
/// maintains. Admin and system actors see everything; other actors see
/// public repositories only. Deployments with a real permission syncer
/// substitute their own [`armada_core::RepoStore`].
pub struct PgRepoStore {
    store: Store,
}

impl PgRepoStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn visible(actor: &Actor, private: bool) -> bool {
        actor.site_admin || !private
    }
}

#[async_trait]
impl armada_core::RepoStore for PgRepoStore {
    async fn get_repos_by_ids(
        &self,
        actor: &Actor,
        ids: &[RepoId],
    ) -> Result<HashMap<RepoId, Repo>> {
        let rows: Vec<(i64, String, String, bool)> = sqlx::query_as(
            "SELECT id, name, external_service_type, private FROM repos WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(self.store.pool())
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .filter(|r| Self::visible(actor, r.3))
            .map(|r| {
                (
                    r.0,
                    Repo {
                        id: r.0,
                        name: r.1,
                        external_service_type: r.2,
                        private: r.3,
                    },
                )
            })
            .collect())
    }

    async fn get(&self, actor: &Actor, id: RepoId) -> Result<Repo> {
        let row: Option<(i64, String, String, bool)> = sqlx::query_as(
            "SELECT id, name, external_service_type, private FROM repos WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.store.pool())
        .await
        .map_err(Error::Database)?;

        match row {
            // Inaccessible and missing are indistinguishable to the caller.
            Some(r) if Self::visible(actor, r.3) => Ok(Repo {
                id: r.0,
                name: r.1,
                external_service_type: r.2,
                private: r.3,
            }),
            _ => Err(Error::RepoNotFound(id)),
        }
    }
}

/// The opaque authorization predicate: site admins may act on anyone,
/// everyone else only on themselves.
pub struct PredicateAuth;

#[async_trait]
impl armada_core::AuthChecker for PredicateAuth {
    async fn check_site_admin_or_same_user(
        &self,
        actor: &Actor,
        user_id: armada_core::UserId,
    ) -> Result<()> {
        if actor.site_admin || actor.user_id == user_id {
            Ok(())
        } else {
            Err(Error::InsufficientAuthorization)
        }
    }
}
