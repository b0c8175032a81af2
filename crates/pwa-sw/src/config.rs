//! Agent configuration

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Result, ServiceWorkerError};

/// Cache store name of the shipped version. Bump it to invalidate every
/// previously cached asset.
pub const DEFAULT_CACHE_NAME: &str = "smart-home-pwa-v1";

/// Assets guaranteed to be cached after install.
pub const DEFAULT_MANIFEST: &[&str] = &["smart_home_app.html", "manifest.json"];

const DEFAULT_SCOPE: &str = "http://localhost/";

/// Configuration handed to [`crate::OfflineCacheAgent`] at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Version string naming the current cache store.
    pub cache_name: String,

    /// Ordered asset URLs, relative to `scope`.
    pub manifest: Vec<String>,

    /// Scope URL the agent controls; manifest entries resolve against it.
    pub scope: String,

    /// Ask the host to activate right after install instead of waiting for
    /// controlled pages to close.
    pub skip_waiting: bool,

    /// Take control of already open pages on activation.
    pub claim_clients: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            manifest: DEFAULT_MANIFEST.iter().map(|s| s.to_string()).collect(),
            scope: DEFAULT_SCOPE.to_string(),
            skip_waiting: true,
            claim_clients: true,
        }
    }
}

impl AgentConfig {
    /// Default configuration rooted at `scope`.
    pub fn new(scope: &Url) -> Self {
        Self {
            scope: scope.to_string(),
            ..Default::default()
        }
    }

    /// Replace the cache name.
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    /// Replace the asset manifest.
    pub fn with_manifest<I, S>(mut self, manifest: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.manifest = manifest.into_iter().map(Into::into).collect();
        self
    }

    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ServiceWorkerError::Config(format!("invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Parsed scope URL.
    pub fn scope_url(&self) -> Result<Url> {
        let scope = Url::parse(&self.scope)
            .map_err(|e| {
                ServiceWorkerError::Config(format!("invalid scope '{}': {}", self.scope, e))
            })?;
        if scope.cannot_be_a_base() {
            return Err(ServiceWorkerError::Config(format!(
                "scope '{}' cannot resolve relative URLs",
                self.scope
            )));
        }
        Ok(scope)
    }

    /// Resolve every manifest entry against the scope, in manifest order.
    ///
    /// Entries must stay on the scope's origin and be unique once resolved.
    pub fn resolve_manifest(&self) -> Result<Vec<Url>> {
        let scope = self.scope_url()?;
        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(self.manifest.len());

        for entry in &self.manifest {
            let mut url = scope.join(entry).map_err(|e| {
                ServiceWorkerError::Config(format!("invalid manifest entry '{}': {}", entry, e))
            })?;
            url.set_fragment(None);

            if url.origin() != scope.origin() {
                return Err(ServiceWorkerError::Config(format!(
                    "manifest entry '{}' is not on origin {}",
                    entry,
                    scope.origin().ascii_serialization()
                )));
            }
            if !seen.insert(url.clone()) {
                return Err(ServiceWorkerError::Config(format!(
                    "duplicate manifest entry '{}'",
                    entry
                )));
            }
            resolved.push(url);
        }

        Ok(resolved)
    }

    /// Check the configuration without touching the network.
    pub fn validate(&self) -> Result<()> {
        if self.cache_name.trim().is_empty() {
            return Err(ServiceWorkerError::Config(
                "cache_name must not be empty".to_string(),
            ));
        }
        self.resolve_manifest().map(|_| ())
    }
}
