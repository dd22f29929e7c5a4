//! Release artifact retrieval.
//!
//! The fetcher only talks to the release source. Placing the bytes on disk
//! and repointing the active version is the job of
//! [`ArtifactLayout`](crate::artifacts::ArtifactLayout), so a workflow can
//! decide when the switch happens.

mod github;

pub use github::GithubFetcher;

use async_trait::async_trait;

use crate::error::{ControlError, ControlResult};
use crate::types::{RepoRef, ServiceName};

/// Version alias resolved through the release source.
pub const LATEST: &str = "latest";

/// Source of release artifacts.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Resolve a symbolic version (`latest` or empty) to a concrete tag.
    ///
    /// Explicit versions are returned unchanged.
    async fn resolve_version(&self, repo: &RepoRef, requested: &str) -> ControlResult<String>;

    /// Download the build of `version` matching `service`.
    ///
    /// When no asset matches, the error lists the available asset names.
    async fn download(
        &self,
        repo: &RepoRef,
        version: &str,
        service: &ServiceName,
    ) -> ControlResult<Vec<u8>>;
}

/// Whether `requested` needs resolving against the release source.
#[must_use]
pub fn is_symbolic(requested: &str) -> bool {
    requested.is_empty() || requested == LATEST
}

/// Expand an asset pattern's `{name}` and `{version}` placeholders.
#[must_use]
pub fn resolve_asset_name(pattern: &str, service: &ServiceName, version: &str) -> String {
    pattern
        .replace("{name}", service.as_str())
        .replace("{version}", version)
}

/// Find `expected` among the available asset names.
pub fn find_asset<'a, I>(available: I, expected: &str) -> ControlResult<usize>
where
    I: IntoIterator<Item = &'a str>,
{
    let names: Vec<&str> = available.into_iter().collect();
    names.iter().position(|n| *n == expected).ok_or_else(|| {
        let listed = if names.is_empty() {
            "(none)".to_owned()
        } else {
            names.join(", ")
        };
        ControlError::fetch(format!(
            "no asset matching {expected:?} found; available assets: {listed}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_pattern_placeholders() {
        let api = ServiceName::new("api").unwrap();
        assert_eq!(
            resolve_asset_name("{name}-linux-amd64", &api, "v1.0.0"),
            "api-linux-amd64"
        );
        assert_eq!(
            resolve_asset_name("{name}_{version}_linux", &api, "v1.0.0"),
            "api_v1.0.0_linux"
        );
    }

    #[test]
    fn find_asset_lists_alternatives() {
        let assets = ["api-darwin-arm64", "api-linux-amd64"];
        assert_eq!(find_asset(assets, "api-linux-amd64").unwrap(), 1);

        let err = find_asset(assets, "api-linux-arm64").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("\"api-linux-arm64\""));
        assert!(msg.contains("api-darwin-arm64, api-linux-amd64"));

        let none = find_asset([], "x").unwrap_err();
        assert!(none.to_string().contains("(none)"));
    }

    #[test]
    fn symbolic_versions() {
        assert!(is_symbolic(""));
        assert!(is_symbolic("latest"));
        assert!(!is_symbolic("v1.0.0"));
    }
}
