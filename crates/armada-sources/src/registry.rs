use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use armada_core::{Error, Repo, Result};

use crate::ratelimit::{default_requests_per_hour, RateLimiter};
use crate::{BitbucketServerSource, ChangesetSource, GithubSource, GitlabSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GitUrlType {
    #[default]
    Http,
    Ssh,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default, rename = "requestsPerHour")]
    pub requests_per_hour: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    pub url: String,
    pub token: String,
    #[serde(default, rename = "gitURLType")]
    pub git_url_type: GitUrlType,
    #[serde(default, rename = "rateLimit")]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitlabConfig {
    pub url: String,
    pub token: String,
    #[serde(default, rename = "gitURLType")]
    pub git_url_type: GitUrlType,
    #[serde(default, rename = "rateLimit")]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitbucketServerConfig {
    pub url: String,
    pub username: String,
    pub token: String,
    #[serde(default, rename = "gitURLType")]
    pub git_url_type: GitUrlType,
    #[serde(default, rename = "rateLimit")]
    pub rate_limit: RateLimitConfig,
}

/// Per-kind external service configuration, the subset of the site config
/// the core consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExternalServiceConfig {
    GitHub(GithubConfig),
    GitLab(GitlabConfig),
    BitbucketServer(BitbucketServerConfig),
}

impl ExternalServiceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GitHub(_) => "github",
            Self::GitLab(_) => "gitlab",
            Self::BitbucketServer(_) => "bitbucketserver",
        }
    }

    pub fn base_url(&self) -> &str {
        match self {
            Self::GitHub(c) => &c.url,
            Self::GitLab(c) => &c.url,
            Self::BitbucketServer(c) => &c.url,
        }
    }

    fn rate_limit(&self) -> &RateLimitConfig {
        match self {
            Self::GitHub(c) => &c.rate_limit,
            Self::GitLab(c) => &c.rate_limit,
            Self::BitbucketServer(c) => &c.rate_limit,
        }
    }
}

/// Produces a [`ChangesetSource`] for a repository's code host. HTTP clients
/// and rate limiters are process-wide singletons keyed by base URL so that
/// limiter state stays coherent across workers.
pub struct SourceRegistry {
    configs: HashMap<String, ExternalServiceConfig>,
    clients: DashMap<String, reqwest::Client>,
    limiters: DashMap<String, Arc<RateLimiter>>,
    /// Deadline applied to every code-host call.
    timeout: Duration,
}

impl SourceRegistry {
    pub fn new(configs: Vec<ExternalServiceConfig>) -> Self {
        let configs = configs
            .into_iter()
            .map(|c| (c.kind().to_string(), c))
            .collect();
        Self {
            configs,
            clients: DashMap::new(),
            limiters: DashMap::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn config_for_kind(&self, kind: &str) -> Option<&ExternalServiceConfig> {
        self.configs.get(kind)
    }

    /// A code host is supported when we both know the kind and have a
    /// config for it.
    pub fn supports(&self, kind: &str) -> bool {
        self.configs.contains_key(kind)
    }

    pub fn source_for_repo(&self, repo: &Repo) -> Result<Box<dyn ChangesetSource>> {
        let config = self
            .configs
            .get(&repo.external_service_type)
            .ok_or_else(|| Error::UnsupportedCodehost(repo.external_service_type.clone()))?;

        let http = self.client_for(config.base_url())?;
        let limiter = self.limiter_for(config);

        let source: Box<dyn ChangesetSource> = match config {
            ExternalServiceConfig::GitHub(c) => {
                Box::new(GithubSource::new(http, c.clone(), limiter))
            }
            ExternalServiceConfig::GitLab(c) => {
                Box::new(GitlabSource::new(http, c.clone(), limiter))
            }
            ExternalServiceConfig::BitbucketServer(c) => {
                Box::new(BitbucketServerSource::new(http, c.clone(), limiter))
            }
        };
        Ok(source)
    }

    fn client_for(&self, base_url: &str) -> Result<reqwest::Client> {
        if let Some(client) = self.clients.get(base_url) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent("armada")
            .build()
            .map_err(Error::Http)?;
        self.clients.insert(base_url.to_string(), client.clone());
        Ok(client)
    }

    fn limiter_for(&self, config: &ExternalServiceConfig) -> Arc<RateLimiter> {
        let base_url = config.base_url();
        if let Some(limiter) = self.limiters.get(base_url) {
            return limiter.clone();
        }

        let rl = config.rate_limit();
        let limiter = match (rl.enabled, rl.requests_per_hour) {
            (Some(false), _) => Arc::new(RateLimiter::unlimited()),
            (_, Some(rph)) => Arc::new(RateLimiter::new(rph)),
            _ => match default_requests_per_hour(config.kind()) {
                Some(rph) => Arc::new(RateLimiter::new(rph)),
                None => Arc::new(RateLimiter::unlimited()),
            },
        };
        self.limiters.insert(base_url.to_string(), limiter.clone());
        limiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn github_config() -> ExternalServiceConfig {
        ExternalServiceConfig::GitHub(GithubConfig {
            url: "https://github.com".into(),
            token: "ghp_test".into(),
            git_url_type: GitUrlType::Http,
            rate_limit: RateLimitConfig::default(),
        })
    }

    #[test]
    fn unknown_kind_is_unsupported() {
        let registry = SourceRegistry::new(vec![github_config()]);
        let repo = Repo {
            id: 1,
            name: "phabricator.example.com/x".into(),
            external_service_type: "phabricator".into(),
            private: false,
        };
        let err = registry.source_for_repo(&repo).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCodehost(kind) if kind == "phabricator"));
    }

    #[test]
    fn limiter_is_shared_per_base_url() {
        let registry = SourceRegistry::new(vec![github_config()]);
        let config = registry.config_for_kind("github").unwrap().clone();
        let a = registry.limiter_for(&config);
        let b = registry.limiter_for(&config);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn config_parses_camel_case_fields() {
        let raw = serde_json::json!({
            "kind": "github",
            "url": "https://github.example.com",
            "token": "t",
            "gitURLType": "ssh",
            "rateLimit": {"enabled": true, "requestsPerHour": 100.0}
        });
        let config: ExternalServiceConfig = serde_json::from_value(raw).unwrap();
        match &config {
            ExternalServiceConfig::GitHub(c) => {
                assert_eq!(c.git_url_type, GitUrlType::Ssh);
                assert_eq!(c.rate_limit.requests_per_hour, Some(100.0));
            }
            _ => panic!("wrong kind"),
        }
    }
}
