//! The offline cache agent: install, activate and cache-first fetch handling.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use pwa_net::{CacheMode, Fetch, Request, Response};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::clients::ClientControl;
use crate::config::AgentConfig;
use crate::registration::ServiceWorkerId;
use crate::{Result, ServiceWorkerError};

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Cache store that was populated.
    pub cache_name: String,
    /// Manifest URLs now in the store, in manifest order.
    pub cached: Vec<Url>,
    /// Whether this install created the store rather than refilling one.
    pub created: bool,
    /// Whether the host should activate without waiting for pages to close.
    pub skip_waiting: bool,
}

/// What an activation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
    /// Stale caches that were deleted.
    pub deleted: Vec<String>,
    /// Stale caches whose deletion failed.
    pub failed: Vec<ServiceWorkerError>,
    /// Clients that came under this worker's control.
    pub claimed: Vec<String>,
}

/// How the agent answered an intercepted request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Answer the page with this response.
    Respond(Response),
    /// The agent does not intervene; the host's default handling applies.
    Passthrough,
}

impl FetchOutcome {
    /// The response, if the agent produced one.
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchOutcome::Respond(response) => Some(response),
            FetchOutcome::Passthrough => None,
        }
    }
}

/// Lifecycle events a host runtime delivers to a service worker.
#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    /// Cache version this worker owns.
    fn cache_name(&self) -> &str;

    /// Scope of pages and requests this worker handles.
    fn scope(&self) -> &Url;

    /// Install event. The worker is installed once this resolves `Ok`.
    async fn on_install(&self) -> Result<InstallOutcome>;

    /// Activate event for the worker `id`.
    async fn on_activate(&self, id: ServiceWorkerId) -> Result<ActivateReport>;

    /// Fetch event for one request from a controlled page.
    async fn on_fetch(&self, request: Request) -> Result<FetchOutcome>;

    /// Called when a completed install is thrown away before it could be
    /// promoted, e.g. because its scope was unregistered meanwhile.
    async fn on_discard(&self, _outcome: &InstallOutcome) -> Result<()> {
        Ok(())
    }
}

/// Cache-first offline agent over a fixed asset manifest.
pub struct OfflineCacheAgent {
    config: AgentConfig,
    scope: Url,
    manifest: Vec<Url>,
    caches: Arc<dyn CacheStore>,
    network: Arc<dyn Fetch>,
    clients: Arc<dyn ClientControl>,
}

impl OfflineCacheAgent {
    /// Create an agent. Fails if the configuration does not validate.
    pub fn new(
        config: AgentConfig,
        caches: Arc<dyn CacheStore>,
        network: Arc<dyn Fetch>,
        clients: Arc<dyn ClientControl>,
    ) -> Result<Self> {
        config.validate()?;
        let scope = config.scope_url()?;
        let manifest = config.resolve_manifest()?;

        Ok(Self {
            config,
            scope,
            manifest,
            caches,
            network,
            clients,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Resolved manifest URLs.
    pub fn manifest(&self) -> &[Url] {
        &self.manifest
    }

    /// Fetch one manifest asset, bypassing intermediate HTTP caches.
    async fn fetch_asset(&self, url: &Url) -> Result<(Request, Response)> {
        let request = Request::get(url.clone()).cache_mode(CacheMode::Reload);
        let response = self
            .network
            .fetch(request.clone())
            .await
            .map_err(|e| ServiceWorkerError::Installation(format!("{}: {}", url, e)))?;

        if !response.ok() {
            return Err(ServiceWorkerError::Installation(format!(
                "{}: HTTP {}",
                url, response.status
            )));
        }

        debug!(
            url = %url,
            status = %response.status,
            bytes = response.body.len(),
            "Fetched asset"
        );
        Ok((request, response))
    }

    /// Delete every cache not named by the current version.
    async fn delete_stale_caches(&self) -> Result<(Vec<String>, Vec<ServiceWorkerError>)> {
        let current = self.config.cache_name.as_str();
        let names = self
            .caches
            .keys()
            .await
            .map_err(|e| ServiceWorkerError::Activation(e.to_string()))?;

        let stale: Vec<String> = names.into_iter().filter(|name| name != current).collect();
        let results = join_all(stale.iter().map(|name| async move {
            info!(cache = %name, "Deleting stale cache");
            self.caches.delete(name).await
        }))
        .await;

        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        for (name, result) in stale.into_iter().zip(results) {
            match result {
                Ok(_) => deleted.push(name),
                Err(e) => {
                    warn!(cache = %name, error = %e, "Stale cache deletion failed");
                    failed.push(ServiceWorkerError::CacheDeletion {
                        name,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok((deleted, failed))
    }
}

#[async_trait]
impl LifecycleHandler for OfflineCacheAgent {
    fn cache_name(&self) -> &str {
        &self.config.cache_name
    }

    fn scope(&self) -> &Url {
        &self.scope
    }

    async fn on_install(&self) -> Result<InstallOutcome> {
        let name = self.config.cache_name.as_str();
        info!(cache = %name, assets = self.manifest.len(), "Installing");

        // Nothing is written until every asset has arrived.
        let assets = try_join_all(self.manifest.iter().map(|url| self.fetch_asset(url))).await?;

        let existed = self
            .caches
            .has(name)
            .await
            .map_err(|e| ServiceWorkerError::Installation(e.to_string()))?;
        self.caches
            .open(name)
            .await
            .map_err(|e| ServiceWorkerError::Installation(e.to_string()))?;

        info!(cache = %name, "Caching manifest assets");
        if let Err(e) = self.caches.put_all(name, &assets).await {
            if !existed {
                if let Err(cleanup) = self.caches.delete(name).await {
                    warn!(cache = %name, error = %cleanup, "Could not remove new cache");
                }
            }
            return Err(ServiceWorkerError::Installation(e.to_string()));
        }

        Ok(InstallOutcome {
            cache_name: name.to_string(),
            cached: self.manifest.clone(),
            created: !existed,
            skip_waiting: self.config.skip_waiting,
        })
    }

    async fn on_activate(&self, id: ServiceWorkerId) -> Result<ActivateReport> {
        info!(cache = %self.config.cache_name, worker = id.raw(), "Activating");

        let cleanup = self.delete_stale_caches().await;

        let claimed = if self.config.claim_clients {
            match self.clients.claim(id, &self.scope).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(error = %e, "Claiming clients failed");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let (deleted, failed) = cleanup?;
        Ok(ActivateReport {
            deleted,
            failed,
            claimed,
        })
    }

    async fn on_fetch(&self, request: Request) -> Result<FetchOutcome> {
        if !request.is_get() {
            debug!(url = %request.url, method = %request.method, "Not intercepting");
            return Ok(FetchOutcome::Passthrough);
        }

        // A missing store is a miss; lookups never create stores.
        let name = self.config.cache_name.as_str();
        match self.caches.match_request(name, &request).await {
            Ok(Some(response)) => {
                info!(url = %request.url, "Serving from cache");
                return Ok(FetchOutcome::Respond(response));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(url = %request.url, error = %e, "Cache lookup failed");
            }
        }

        info!(url = %request.url, "Fetching from network");
        let url = request.url.to_string();
        match self.network.fetch(request).await {
            Ok(response) => Ok(FetchOutcome::Respond(response)),
            Err(e) => {
                error!(url = %url, error = %e, "Fetch failed");
                Err(ServiceWorkerError::Fetch {
                    url,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn on_discard(&self, outcome: &InstallOutcome) -> Result<()> {
        if outcome.created {
            info!(cache = %outcome.cache_name, "Discarding unused cache");
            self.caches.delete(&outcome.cache_name).await?;
        }
        Ok(())
    }
}
