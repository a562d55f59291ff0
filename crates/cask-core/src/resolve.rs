//! Package resolution: turn an alias + bare specifier into a concrete
//! identity and resolution descriptor. The `Resolver` trait is the seam
//! to the external resolver; `RegistryResolver` is the npm-registry
//! implementation, using the manifest endpoint fast path for exact and
//! `latest` specs to avoid full packument downloads.

use std::collections::HashMap;

use async_trait::async_trait;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Unresolved package request: alias plus bare specifier.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WantedPackage {
    pub alias: String,
    pub bare_specifier: String,
}

/// Where a resolved package's bytes come from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tarball: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    /// Local directory source, instead of a tarball.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

/// Outcome of resolution: a concrete identity plus its resolution
/// descriptor, and the manifest when resolution already fetched one.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPackage {
    pub id: String,
    pub resolution: Resolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<serde_json::Value>,
}

/// External resolver collaborator. The store controller trusts the
/// descriptor this returns.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, wanted: &WantedPackage) -> Result<ResolvedPackage, StoreError>;
}

/// Resolver backed by an npm-compatible registry.
pub struct RegistryResolver {
    registry: String,
    host: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl RegistryResolver {
    pub fn new(registry: &str, auth_token: Option<String>) -> Self {
        let registry = registry.trim_end_matches('/').to_string();
        let host = registry
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap_or("registry")
            .to_string();
        Self {
            registry,
            host,
            auth_token,
            client: reqwest::Client::new(),
        }
    }

    /// Scoped names are URL-encoded: @scope/pkg -> @scope%2Fpkg.
    fn encoded_name(name: &str) -> String {
        if name.starts_with('@') {
            name.replace('/', "%2F")
        } else {
            name.to_string()
        }
    }

    async fn fetch_json(
        &self,
        url: &str,
        pkg_name: &str,
    ) -> Result<serde_json::Value, StoreError> {
        let mut req = self.client.get(url);
        if let Some(token) = self.auth_token.as_deref().filter(|t| !t.is_empty()) {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| StoreError::RegistryFetch {
            status: None,
            url: url.to_string(),
            hint: format!("Could not reach the registry for {}.", pkg_name),
            pkg_name: pkg_name.to_string(),
            reason: e.to_string(),
        })?;
        let status = resp.status().as_u16();
        if status != 200 {
            return Err(StoreError::registry_fetch(status, url, pkg_name));
        }
        resp.json().await.map_err(|e| StoreError::RegistryFetch {
            status: None,
            url: url.to_string(),
            hint: format!("The registry returned invalid JSON for {}.", pkg_name),
            pkg_name: pkg_name.to_string(),
            reason: e.to_string(),
        })
    }

    fn resolved_from_manifest(
        &self,
        alias: &str,
        manifest: serde_json::Value,
    ) -> Result<ResolvedPackage, StoreError> {
        let version = manifest
            .get("version")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StoreError::Resolution {
                pkg_spec: alias.to_string(),
                reason: "manifest has no version".to_string(),
            })?
            .to_string();
        let dist = manifest.get("dist").and_then(|d| d.as_object());
        let tarball = dist
            .and_then(|d| d.get("tarball"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| StoreError::Resolution {
                pkg_spec: format!("{}@{}", alias, version),
                reason: "manifest has no dist.tarball".to_string(),
            })?;
        let integrity = dist
            .and_then(|d| d.get("integrity"))
            .and_then(|v| v.as_str())
            .map(String::from);
        Ok(ResolvedPackage {
            id: format!("{}/{}/{}", self.host, alias, version),
            resolution: Resolution {
                tarball: Some(tarball),
                integrity,
                directory: None,
            },
            manifest: Some(manifest),
        })
    }
}

#[async_trait]
impl Resolver for RegistryResolver {
    async fn resolve(&self, wanted: &WantedPackage) -> Result<ResolvedPackage, StoreError> {
        let name = Self::encoded_name(&wanted.alias);
        let spec = wanted.bare_specifier.trim();

        // Fast path: exact versions and `latest` hit the manifest
        // endpoint directly (no packument download).
        let selector = if spec.is_empty() || spec == "latest" {
            Some("latest".to_string())
        } else if Version::parse(spec).is_ok() {
            Some(spec.to_string())
        } else {
            None
        };
        if let Some(selector) = selector {
            let url = format!("{}/{}/{}", self.registry, name, selector);
            let manifest = self.fetch_json(&url, &wanted.alias).await?;
            return self.resolved_from_manifest(&wanted.alias, manifest);
        }

        // Range spec: full packument, pick the max satisfying version.
        let url = format!("{}/{}", self.registry, name);
        let packument = self.fetch_json(&url, &wanted.alias).await?;
        let versions = packument
            .get("versions")
            .and_then(|v| v.as_object())
            .ok_or_else(|| StoreError::Resolution {
                pkg_spec: format!("{}@{}", wanted.alias, spec),
                reason: "packument has no versions".to_string(),
            })?;
        let version_list: Vec<String> = versions.keys().cloned().collect();
        let picked = resolve_range(&version_list, spec).ok_or_else(|| StoreError::Resolution {
            pkg_spec: format!("{}@{}", wanted.alias, spec),
            reason: format!("no version satisfies {}", spec),
        })?;
        let manifest = versions
            .get(&picked)
            .cloned()
            .ok_or_else(|| StoreError::Resolution {
                pkg_spec: format!("{}@{}", wanted.alias, spec),
                reason: "picked version missing from packument".to_string(),
            })?;
        self.resolved_from_manifest(&wanted.alias, manifest)
    }
}

/// Resolve a semver range to the maximum satisfying version from a list.
pub fn resolve_range(version_strings: &[String], range: &str) -> Option<String> {
    let range = range.trim();
    if range.is_empty() || range == "*" {
        let mut parsed: Vec<Version> = version_strings
            .iter()
            .filter_map(|s| Version::parse(s).ok())
            .collect();
        parsed.sort();
        return parsed.last().map(|v| v.to_string());
    }
    let req = VersionReq::parse(range).ok()?;
    let mut satisfying: Vec<Version> = version_strings
        .iter()
        .filter_map(|s| Version::parse(s).ok())
        .filter(|v| req.matches(v))
        .collect();
    satisfying.sort();
    satisfying.last().map(|v| v.to_string())
}

/// Fixed resolver for tests and local-dir workflows: every alias maps
/// to a pre-resolved package.
pub struct StaticResolver {
    packages: HashMap<String, ResolvedPackage>,
}

impl StaticResolver {
    pub fn new(packages: HashMap<String, ResolvedPackage>) -> Self {
        Self { packages }
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, wanted: &WantedPackage) -> Result<ResolvedPackage, StoreError> {
        self.packages
            .get(&wanted.alias)
            .cloned()
            .ok_or_else(|| StoreError::Resolution {
                pkg_spec: format!("{}@{}", wanted.alias, wanted.bare_specifier),
                reason: "unknown package".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_range() {
        let versions = vec![
            "1.0.0".to_string(),
            "1.2.0".to_string(),
            "1.9.3".to_string(),
            "2.0.0".to_string(),
        ];
        assert_eq!(resolve_range(&versions, "^1.0.0"), Some("1.9.3".to_string()));
        assert_eq!(resolve_range(&versions, "*"), Some("2.0.0".to_string()));
        assert_eq!(resolve_range(&versions, "^3.0.0"), None);
    }

    #[test]
    fn test_encoded_name() {
        assert_eq!(RegistryResolver::encoded_name("is-positive"), "is-positive");
        assert_eq!(RegistryResolver::encoded_name("@scope/pkg"), "@scope%2Fpkg");
    }

    #[test]
    fn test_host_from_registry_url() {
        let r = RegistryResolver::new("https://registry.npmjs.org/", None);
        assert_eq!(r.host, "registry.npmjs.org");
        assert_eq!(r.registry, "https://registry.npmjs.org");
    }
}
