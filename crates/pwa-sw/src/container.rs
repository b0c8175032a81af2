//! Host runtime that owns registrations and delivers lifecycle and fetch
//! events to service workers.

use std::sync::Arc;

use hashbrown::HashMap;
use pwa_net::{Fetch, Request, Response};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::agent::{FetchOutcome, LifecycleHandler};
use crate::clients::{Client, ClientControl, ClientMatchOptions};
use crate::registration::{
    ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};
use crate::{Result, ServiceWorkerError};

/// Service worker events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A new worker started installing.
    UpdateFound { registration_scope: String },
    /// A stale cache was deleted during activation.
    CacheDeleted { cache_name: String },
    /// A client came under a new worker's control.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

/// A registration plus the handlers of its live workers.
struct ScopeEntry {
    registration: ServiceWorkerRegistration,
    handlers: HashMap<ServiceWorkerId, Arc<dyn LifecycleHandler>>,
}

impl ScopeEntry {
    fn new(scope: Url) -> Self {
        Self {
            registration: ServiceWorkerRegistration::new(scope),
            handlers: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        let registration = &self.registration;
        registration.installing.is_none()
            && registration.waiting.is_none()
            && registration.active.is_none()
    }
}

/// Service worker container (the host side of `navigator.serviceWorker`).
///
/// Lifecycle handlers run without holding the registration lock, so fetches
/// keep flowing to the active worker while a newer one installs.
pub struct ServiceWorkerContainer {
    /// Registrations by scope.
    registrations: RwLock<HashMap<String, ScopeEntry>>,

    /// Default network handling for requests no worker answers.
    network: Arc<dyn Fetch>,

    /// Pages on the origin.
    clients: Arc<dyn ClientControl>,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(
        network: Arc<dyn Fetch>,
        clients: Arc<dyn ClientControl>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: RwLock::new(HashMap::new()),
                network,
                clients,
                event_tx,
            },
            event_rx,
        )
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, scope: &str, worker: &ServiceWorker) {
        self.emit(ServiceWorkerEvent::StateChange {
            registration_scope: scope.to_string(),
            worker_id: worker.id,
            new_state: worker.state,
        });
    }

    /// Register `handler` under its scope and run it through install.
    ///
    /// Activates right away when the handler asks to skip waiting or the
    /// scope has no active worker. On install failure the previous active
    /// worker, if any, stays in control and the error is returned. If the
    /// scope is unregistered while the install runs, the handler is asked to
    /// discard what it installed.
    pub async fn register(&self, handler: Arc<dyn LifecycleHandler>) -> Result<ServiceWorkerId> {
        let scope = handler.scope().clone();
        let scope_key = scope.to_string();
        let worker = ServiceWorker::new(handler.cache_name());

        let id = {
            let mut registrations = self.registrations.write().await;
            let entry = registrations
                .entry(scope_key.clone())
                .or_insert_with(|| ScopeEntry::new(scope));
            let id = entry.registration.begin_install(worker)?;
            if let Some(ref installing) = entry.registration.installing {
                self.emit_state(&scope_key, installing);
            }
            id
        };
        self.emit(ServiceWorkerEvent::UpdateFound {
            registration_scope: scope_key.clone(),
        });
        info!(
            scope = %scope_key,
            worker = id.raw(),
            cache = handler.cache_name(),
            "Installing worker"
        );

        let install = handler.on_install().await;

        let activate_now = {
            let mut registrations = self.registrations.write().await;
            if !registrations.contains_key(&scope_key) {
                drop(registrations);
                warn!(
                    scope = %scope_key,
                    worker = id.raw(),
                    "Scope unregistered during install"
                );
                if let Ok(ref outcome) = install {
                    if let Err(e) = handler.on_discard(outcome).await {
                        warn!(scope = %scope_key, error = %e, "Discarding install failed");
                    }
                }
                return Err(ServiceWorkerError::NotFound(scope_key));
            }
            let entry = registrations
                .get_mut(&scope_key)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope_key.clone()))?;

            let outcome = match install {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(
                        scope = %scope_key,
                        worker = id.raw(),
                        error = %e,
                        "Install failed; keeping current worker"
                    );
                    if let Some(failed) = entry.registration.install_failed(&e.to_string()) {
                        self.emit_state(&scope_key, &failed);
                    }
                    if entry.is_empty() {
                        registrations.remove(&scope_key);
                    }
                    return Err(e);
                }
            };

            if let Some(displaced) = entry.registration.install_complete()? {
                entry.handlers.remove(&displaced.id);
                self.emit_state(&scope_key, &displaced);
            }
            entry.handlers.insert(id, handler);
            if let Some(ref waiting) = entry.registration.waiting {
                self.emit_state(&scope_key, waiting);
            }
            info!(
                scope = %scope_key,
                worker = id.raw(),
                cached = outcome.cached.len(),
                "Worker installed"
            );

            outcome.skip_waiting || entry.registration.active.is_none()
        };

        if activate_now {
            self.activate_waiting(&scope_key).await?;
        }
        Ok(id)
    }

    /// Activate the waiting worker of `scope`.
    pub async fn activate_waiting(&self, scope: &str) -> Result<()> {
        let (id, handler) = {
            let mut registrations = self.registrations.write().await;
            let entry = registrations
                .get_mut(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;

            let (id, replaced) = entry.registration.activate()?;
            if let Some(old) = replaced {
                entry.handlers.remove(&old.id);
                self.emit_state(scope, &old);
            }
            if let Some(ref active) = entry.registration.active {
                self.emit_state(scope, active);
            }
            let handler = entry
                .handlers
                .get(&id)
                .cloned()
                .ok_or_else(|| {
                    ServiceWorkerError::NotFound(format!("handler for worker {}", id.raw()))
                })?;
            (id, handler)
        };

        match handler.on_activate(id).await {
            Ok(report) => {
                for cache_name in report.deleted {
                    self.emit(ServiceWorkerEvent::CacheDeleted { cache_name });
                }
                for client_id in report.claimed {
                    self.emit(ServiceWorkerEvent::ControllerChange {
                        client_id,
                        worker_id: id,
                    });
                }
                for failure in &report.failed {
                    warn!(scope = %scope, error = %failure, "Activation cleanup incomplete");
                }
            }
            Err(e) => {
                warn!(scope = %scope, error = %e, "Activate handler failed; activating anyway");
            }
        }

        let mut registrations = self.registrations.write().await;
        let entry = registrations
            .get_mut(scope)
            .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
        entry.registration.activation_complete(id)?;
        if let Some(ref active) = entry.registration.active {
            self.emit_state(scope, active);
        }
        info!(scope = %scope, worker = id.raw(), "Worker activated");
        Ok(())
    }

    /// Handler of the active worker whose scope best matches `url`.
    async fn controller_for(&self, url: &Url) -> Option<Arc<dyn LifecycleHandler>> {
        let registrations = self.registrations.read().await;
        let entry = registrations
            .values()
            .filter(|entry| entry.registration.in_scope(url))
            .max_by_key(|entry| entry.registration.scope.as_str().len())?;
        let active = entry.registration.active.as_ref()?;
        entry.handlers.get(&active.id).cloned()
    }

    /// Dispatch a page request.
    ///
    /// The controlling worker answers first; requests it declines, and
    /// requests with no controlling worker, go straight to the network.
    pub async fn handle_fetch(&self, request: Request) -> Result<Response> {
        if let Some(handler) = self.controller_for(&request.url).await {
            match handler.on_fetch(request.clone()).await? {
                FetchOutcome::Respond(response) => return Ok(response),
                FetchOutcome::Passthrough => {}
            }
        }

        debug!(url = %request.url, method = %request.method, "Default network handling");
        Ok(self.network.fetch(request).await?)
    }

    /// Scope of the registration controlling `url`, if any.
    pub async fn get_registration(&self, url: &Url) -> Option<String> {
        let registrations = self.registrations.read().await;
        registrations
            .iter()
            .filter(|(_, entry)| entry.registration.in_scope(url))
            .max_by_key(|(scope, _)| scope.len())
            .map(|(scope, _)| scope.clone())
    }

    /// Snapshot of the registration for `scope`.
    pub async fn registration(&self, scope: &str) -> Option<ServiceWorkerRegistration> {
        self.registrations
            .read()
            .await
            .get(scope)
            .map(|entry| entry.registration.clone())
    }

    /// Get all registration scopes.
    pub async fn get_registrations(&self) -> Vec<String> {
        self.registrations.read().await.keys().cloned().collect()
    }

    /// Clients on the origin matching `options`.
    pub async fn match_clients(&self, options: &ClientMatchOptions) -> Result<Vec<Client>> {
        self.clients.match_all(options).await
    }

    /// Unregister a scope; every worker in it becomes redundant and the
    /// pages it controlled become uncontrolled.
    pub async fn unregister(&self, scope: &str) -> Result<bool> {
        let removed = self.registrations.write().await.remove(scope);
        let mut entry = match removed {
            Some(entry) => entry,
            None => return Ok(false),
        };

        for worker in entry.registration.unregister() {
            self.emit_state(scope, &worker);
            let released = self.clients.release(worker.id).await?;
            if !released.is_empty() {
                debug!(
                    scope = %scope,
                    worker = worker.id.raw(),
                    released = released.len(),
                    "Released clients"
                );
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tests::{home_network, scope, ScriptedNetwork};
    use crate::agent::{ActivateReport, InstallOutcome, OfflineCacheAgent};
    use crate::cache::{CacheStorage, SharedCacheStorage};
    use crate::clients::{Client, Clients};
    use crate::config::AgentConfig;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::StatusCode;
    use tokio::sync::Notify;

    /// Holds a finished install until the test lets it go.
    struct GatedInstall {
        inner: Arc<dyn LifecycleHandler>,
        installed: Notify,
        proceed: Notify,
    }

    #[async_trait]
    impl LifecycleHandler for GatedInstall {
        fn cache_name(&self) -> &str {
            self.inner.cache_name()
        }
        fn scope(&self) -> &Url {
            self.inner.scope()
        }
        async fn on_install(&self) -> Result<InstallOutcome> {
            let outcome = self.inner.on_install().await;
            self.installed.notify_one();
            self.proceed.notified().await;
            outcome
        }
        async fn on_activate(&self, id: ServiceWorkerId) -> Result<ActivateReport> {
            self.inner.on_activate(id).await
        }
        async fn on_fetch(&self, request: Request) -> Result<FetchOutcome> {
            self.inner.on_fetch(request).await
        }
        async fn on_discard(&self, outcome: &InstallOutcome) -> Result<()> {
            self.inner.on_discard(outcome).await
        }
    }

    struct Host {
        container: ServiceWorkerContainer,
        events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
        caches: SharedCacheStorage,
        clients: Arc<RwLock<Clients>>,
        network: Arc<ScriptedNetwork>,
    }

    impl Host {
        fn new() -> Self {
            let network = Arc::new(home_network());
            let clients = Arc::new(RwLock::new(Clients::new()));
            let (container, events) = ServiceWorkerContainer::new(network.clone(), clients.clone());
            Self {
                container,
                events,
                caches: CacheStorage::new().shared(),
                clients,
                network,
            }
        }

        fn agent(&self, config: AgentConfig) -> Arc<dyn LifecycleHandler> {
            Arc::new(
                OfflineCacheAgent::new(
                    config,
                    self.caches.clone(),
                    self.network.clone(),
                    self.clients.clone(),
                )
                .unwrap(),
            )
        }

        fn drain(&mut self) -> Vec<ServiceWorkerEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        async fn active_cache(&self) -> Option<String> {
            self.container
                .registration(scope().as_str())
                .await?
                .active
                .filter(|w| w.is_active())
                .map(|w| w.cache_name)
        }
    }

    fn get(path: &str) -> Request {
        Request::get(scope().join(path).unwrap())
    }

    #[tokio::test]
    async fn test_register_installs_and_activates() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mut host = Host::new();

        let id = host
            .container
            .register(host.agent(AgentConfig::new(&scope())))
            .await
            .unwrap();

        assert_eq!(host.active_cache().await.as_deref(), Some("smart-home-pwa-v1"));
        let states: Vec<ServiceWorkerState> = host
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                ServiceWorkerEvent::StateChange { worker_id, new_state, .. } if worker_id == id => {
                    Some(new_state)
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_cached_manifest_served_without_network() {
        let host = Host::new();
        host.container
            .register(host.agent(AgentConfig::new(&scope())))
            .await
            .unwrap();
        let calls = host.network.calls();

        let response = host
            .container
            .handle_fetch(get("smart_home_app.html"))
            .await
            .unwrap();

        assert!(response.from_cache);
        assert_eq!(host.network.calls(), calls);
    }

    #[tokio::test]
    async fn test_unknown_asset_from_network_cache_unchanged() {
        let host = Host::new();
        host.container
            .register(host.agent(AgentConfig::new(&scope())))
            .await
            .unwrap();

        let response = host.container.handle_fetch(get("/unknown.png")).await.unwrap();

        assert!(!response.from_cache);
        assert_eq!(response.status, StatusCode::OK);
        let storage = host.caches.read().await;
        assert_eq!(storage.get("smart-home-pwa-v1").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_asset_offline_fails() {
        let host = Host::new();
        host.container
            .register(host.agent(AgentConfig::new(&scope())))
            .await
            .unwrap();
        host.network.set_online(false);

        let err = host
            .container
            .handle_fetch(get("/unknown.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_version_bump_deletes_old_cache() {
        let mut host = Host::new();
        host.container
            .register(host.agent(AgentConfig::new(&scope()).with_cache_name("smart-home-pwa-v1")))
            .await
            .unwrap();
        host.drain();

        host.container
            .register(host.agent(AgentConfig::new(&scope()).with_cache_name("smart-home-pwa-v2")))
            .await
            .unwrap();

        assert_eq!(host.active_cache().await.as_deref(), Some("smart-home-pwa-v2"));
        assert_eq!(host.caches.read().await.keys(), vec!["smart-home-pwa-v2"]);
        assert!(host.drain().contains(&ServiceWorkerEvent::CacheDeleted {
            cache_name: "smart-home-pwa-v1".to_string()
        }));

        // Still served, now from the v2 store.
        let response = host.container.handle_fetch(get("manifest.json")).await.unwrap();
        assert!(response.from_cache);
    }

    #[tokio::test]
    async fn test_post_uses_default_network_handling() {
        let host = Host::new();
        host.container
            .register(host.agent(AgentConfig::new(&scope())))
            .await
            .unwrap();
        let calls = host.network.calls();

        let post = Request::post(scope().join("unknown.png").unwrap(), Bytes::from_static(b"on"));
        let response = host.container.handle_fetch(post).await.unwrap();

        assert!(!response.from_cache);
        assert_eq!(host.network.calls(), calls + 1);
        assert_eq!(
            host.network.seen().last().unwrap().method,
            http::Method::POST
        );
    }

    #[tokio::test]
    async fn test_failed_install_keeps_previous_worker() {
        let mut host = Host::new();
        host.container
            .register(host.agent(AgentConfig::new(&scope())))
            .await
            .unwrap();
        host.drain();

        let broken = AgentConfig::new(&scope())
            .with_cache_name("smart-home-pwa-v2")
            .with_manifest(["smart_home_app.html", "icons/512.png"]);
        let err = host.container.register(host.agent(broken)).await.unwrap_err();

        assert!(matches!(err, ServiceWorkerError::Installation(_)));
        assert_eq!(host.active_cache().await.as_deref(), Some("smart-home-pwa-v1"));
        assert!(!host.caches.read().await.has("smart-home-pwa-v2"));
        assert!(host.drain().iter().any(|e| matches!(
            e,
            ServiceWorkerEvent::StateChange {
                new_state: ServiceWorkerState::InstallFailed,
                ..
            }
        )));

        let response = host.container.handle_fetch(get("smart_home_app.html")).await.unwrap();
        assert!(response.from_cache);
    }

    #[tokio::test]
    async fn test_without_skip_waiting_new_worker_waits() {
        let host = Host::new();
        host.container
            .register(host.agent(AgentConfig::new(&scope())))
            .await
            .unwrap();

        let mut next = AgentConfig::new(&scope()).with_cache_name("smart-home-pwa-v2");
        next.skip_waiting = false;
        host.container.register(host.agent(next)).await.unwrap();

        let registration = host.container.registration(scope().as_str()).await.unwrap();
        assert_eq!(registration.waiting.unwrap().cache_name, "smart-home-pwa-v2");
        assert_eq!(host.active_cache().await.as_deref(), Some("smart-home-pwa-v1"));

        host.container.activate_waiting(scope().as_str()).await.unwrap();
        assert_eq!(host.active_cache().await.as_deref(), Some("smart-home-pwa-v2"));
    }

    #[tokio::test]
    async fn test_activation_claims_open_pages() {
        let mut host = Host::new();
        let page = Client::window(scope().join("smart_home_app.html").unwrap());
        let page_id = page.id.clone();
        host.clients.write().await.add(page);

        let id = host
            .container
            .register(host.agent(AgentConfig::new(&scope())))
            .await
            .unwrap();

        assert!(host.drain().contains(&ServiceWorkerEvent::ControllerChange {
            client_id: page_id.clone(),
            worker_id: id,
        }));
        assert_eq!(
            host.clients.read().await.get(&page_id).unwrap().controller,
            Some(id)
        );
    }

    #[tokio::test]
    async fn test_no_controller_uses_network() {
        let host = Host::new();

        let response = host.container.handle_fetch(get("smart_home_app.html")).await.unwrap();

        assert!(!response.from_cache);
        assert_eq!(host.network.calls(), 1);
    }

    #[tokio::test]
    async fn test_registration_lookup_and_unregister() {
        let host = Host::new();
        host.container
            .register(host.agent(AgentConfig::new(&scope())))
            .await
            .unwrap();

        let url = scope().join("manifest.json").unwrap();
        assert_eq!(
            host.container.get_registration(&url).await.as_deref(),
            Some(scope().as_str())
        );
        assert_eq!(host.container.get_registrations().await.len(), 1);

        assert!(host.container.unregister(scope().as_str()).await.unwrap());
        assert!(!host.container.unregister(scope().as_str()).await.unwrap());
        assert!(host.container.get_registrations().await.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_releases_controlled_pages() {
        let host = Host::new();
        let page = Client::window(scope().join("smart_home_app.html").unwrap());
        let page_id = page.id.clone();
        host.clients.write().await.add(page);
        host.container
            .register(host.agent(AgentConfig::new(&scope())))
            .await
            .unwrap();
        let controlled = host
            .container
            .match_clients(&ClientMatchOptions::default())
            .await
            .unwrap();
        assert_eq!(controlled.len(), 1);

        host.container.unregister(scope().as_str()).await.unwrap();

        assert!(host
            .container
            .match_clients(&ClientMatchOptions::default())
            .await
            .unwrap()
            .is_empty());
        assert!(host.clients.read().await.get(&page_id).unwrap().controller.is_none());
    }

    #[tokio::test]
    async fn test_failed_first_install_leaves_no_registration() {
        let host = Host::new();
        let broken =
            AgentConfig::new(&scope()).with_manifest(["smart_home_app.html", "missing.png"]);

        assert!(host.container.register(host.agent(broken)).await.is_err());

        let url = scope().join("smart_home_app.html").unwrap();
        assert!(host.container.get_registration(&url).await.is_none());
        assert!(host.container.get_registrations().await.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_during_install_discards_cache() {
        let host = Host::new();
        let handler = Arc::new(GatedInstall {
            inner: host.agent(AgentConfig::new(&scope())),
            installed: Notify::new(),
            proceed: Notify::new(),
        });

        let register = host.container.register(handler.clone());
        let interrupt = async {
            handler.installed.notified().await;
            assert!(host.caches.read().await.has("smart-home-pwa-v1"));
            host.container.unregister(scope().as_str()).await.unwrap();
            handler.proceed.notify_one();
        };
        let (result, ()) = tokio::join!(register, interrupt);

        assert!(matches!(result, Err(ServiceWorkerError::NotFound(_))));
        assert!(!host.caches.read().await.has("smart-home-pwa-v1"));
        assert!(host.container.get_registrations().await.is_empty());
    }
}
