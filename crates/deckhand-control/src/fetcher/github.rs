//! GitHub Releases client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{GithubConfig, ReleasesConfig};
use crate::error::{ControlError, ControlResult};
use crate::types::{RepoRef, ServiceName};

use super::{find_asset, is_symbolic, resolve_asset_name, ArtifactFetcher};

const API_MEDIA_TYPE: &str = "application/vnd.github+json";
const BINARY_MEDIA_TYPE: &str = "application/octet-stream";

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    id: u64,
    name: String,
}

/// Fetches release assets through the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GithubFetcher {
    client: Client,
    api_url: String,
    token: SecretString,
    default_owner: String,
    asset_pattern: String,
}

impl GithubFetcher {
    /// Create a fetcher from configuration.
    pub fn new(github: &GithubConfig, releases: &ReleasesConfig) -> ControlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(github.timeout_secs))
            .build()
            .map_err(ControlError::Http)?;

        Ok(Self {
            client,
            api_url: github.api_url.trim_end_matches('/').to_owned(),
            token: SecretString::from(github.token.clone()),
            default_owner: github.owner.clone(),
            asset_pattern: releases.asset_pattern.clone(),
        })
    }

    /// Owner and repository for a reference, applying the default owner.
    fn coordinates<'a>(&'a self, repo: &'a RepoRef) -> ControlResult<(&'a str, &'a str)> {
        let owner = repo.owner().unwrap_or(&self.default_owner);
        if owner.is_empty() {
            return Err(ControlError::fetch(format!(
                "repository {repo} has no owner and github.owner is not configured"
            )));
        }
        Ok((owner, repo.repo()))
    }

    fn get(&self, url: &str, accept: &str) -> RequestBuilder {
        let mut request = self
            .client
            .get(url)
            .header(USER_AGENT, concat!("deckhand/", env!("CARGO_PKG_VERSION")))
            .header(ACCEPT, accept);
        let token = self.token.expose_secret();
        if !token.is_empty() {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        request
    }

    async fn release(&self, owner: &str, repo: &str, which: &str) -> ControlResult<Release> {
        let url = format!("{}/repos/{owner}/{repo}/releases/{which}", self.api_url);
        let response = self
            .get(&url, API_MEDIA_TYPE)
            .send()
            .await
            .map_err(ControlError::Http)?;

        match response.status() {
            status if status.is_success() => response.json().await.map_err(ControlError::Http),
            StatusCode::NOT_FOUND => Err(ControlError::fetch(format!(
                "release {which} not found for {owner}/{repo}"
            ))),
            status => Err(ControlError::fetch(format!(
                "getting release {which} for {owner}/{repo}: {status}"
            ))),
        }
    }
}

#[async_trait]
impl ArtifactFetcher for GithubFetcher {
    async fn resolve_version(&self, repo: &RepoRef, requested: &str) -> ControlResult<String> {
        if !is_symbolic(requested) {
            return Ok(requested.to_owned());
        }

        let (owner, name) = self.coordinates(repo)?;
        let release = self.release(owner, name, "latest").await?;
        debug!(repo = %repo, version = %release.tag_name, "resolved latest release");
        Ok(release.tag_name)
    }

    async fn download(
        &self,
        repo: &RepoRef,
        version: &str,
        service: &ServiceName,
    ) -> ControlResult<Vec<u8>> {
        let (owner, name) = self.coordinates(repo)?;
        let release = self.release(owner, name, &format!("tags/{version}")).await?;

        let expected = resolve_asset_name(&self.asset_pattern, service, version);
        let index = find_asset(release.assets.iter().map(|a| a.name.as_str()), &expected)?;
        let asset = &release.assets[index];

        info!(repo = %repo, version, asset = %asset.name, "downloading release asset");

        let url = format!(
            "{}/repos/{owner}/{name}/releases/assets/{}",
            self.api_url, asset.id
        );
        let response = self
            .get(&url, BINARY_MEDIA_TYPE)
            .send()
            .await
            .map_err(ControlError::Http)?;

        if !response.status().is_success() {
            return Err(ControlError::fetch(format!(
                "downloading asset {expected} for {owner}/{name} {version}: {}",
                response.status()
            )));
        }

        let bytes = response.bytes().await.map_err(ControlError::Http)?;
        debug!(asset = %asset.name, size = bytes.len(), "downloaded asset");
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(owner: &str) -> GithubFetcher {
        let github = GithubConfig {
            owner: owner.to_owned(),
            api_url: "http://127.0.0.1:9/".to_owned(),
            ..GithubConfig::default()
        };
        GithubFetcher::new(&github, &ReleasesConfig::default()).unwrap()
    }

    #[test]
    fn coordinates_apply_default_owner() {
        let f = fetcher("acme");
        let bare = RepoRef::new("api").unwrap();
        let full = RepoRef::new("other/api").unwrap();

        assert_eq!(f.coordinates(&bare).unwrap(), ("acme", "api"));
        assert_eq!(f.coordinates(&full).unwrap(), ("other", "api"));
        assert!(fetcher("").coordinates(&bare).is_err());
    }

    #[test]
    fn api_url_is_normalised() {
        assert_eq!(fetcher("acme").api_url, "http://127.0.0.1:9");
    }

    #[tokio::test]
    async fn explicit_versions_skip_the_network() {
        let f = fetcher("acme");
        let repo = RepoRef::new("api").unwrap();
        assert_eq!(f.resolve_version(&repo, "v1.2.3").await.unwrap(), "v1.2.3");
    }
}
