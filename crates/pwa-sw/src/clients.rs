//! Clients API: the pages a service worker may control.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::registration::ServiceWorkerId;
use crate::Result;

/// A client (an open page).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Worker currently controlling this client.
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    /// Create an uncontrolled window client.
    pub fn window(url: Url) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self {
            id: format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed)),
            url,
            controller: None,
        }
    }

    pub fn is_controlled(&self) -> bool {
        self.controller.is_some()
    }
}

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    /// Also return clients no worker controls.
    pub include_uncontrolled: bool,
    /// Only return clients controlled by this worker.
    pub controller: Option<ServiceWorkerId>,
}

/// Registry of clients on the origin.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Match all clients.
    pub fn match_all(&self, options: &ClientMatchOptions) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| options.include_uncontrolled || c.is_controlled())
            .filter(|c| options.controller.map_or(true, |id| c.controller == Some(id)))
            .collect()
    }

    /// Make `worker` the controller of every client under `scope`.
    ///
    /// Returns the ids of clients whose controller changed, sorted.
    pub fn claim(&mut self, worker: ServiceWorkerId, scope: &Url) -> Vec<String> {
        let mut claimed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.url.as_str().starts_with(scope.as_str()))
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect();
        claimed.sort_unstable();
        claimed
    }

    /// Clear the controller of every client controlled by `worker`.
    ///
    /// Returns the ids of released clients, sorted.
    pub fn release(&mut self, worker: ServiceWorkerId) -> Vec<String> {
        let mut released: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.controller == Some(worker))
            .map(|c| {
                c.controller = None;
                c.id.clone()
            })
            .collect();
        released.sort_unstable();
        released
    }
}

/// Client control shared by the agent (claim on activation) and the host
/// (release on unregister, queries).
#[async_trait]
pub trait ClientControl: Send + Sync {
    /// Take control of every client under `scope`; returns the claimed ids.
    async fn claim(&self, worker: ServiceWorkerId, scope: &Url) -> Result<Vec<String>>;

    /// Clients matching `options`, sorted by id.
    async fn match_all(&self, options: &ClientMatchOptions) -> Result<Vec<Client>>;

    /// Drop `worker` as controller everywhere; returns the released ids.
    async fn release(&self, worker: ServiceWorkerId) -> Result<Vec<String>>;
}

#[async_trait]
impl ClientControl for RwLock<Clients> {
    async fn claim(&self, worker: ServiceWorkerId, scope: &Url) -> Result<Vec<String>> {
        let claimed = self.write().await.claim(worker, scope);
        debug!(
            worker = worker.raw(),
            scope = %scope,
            claimed = claimed.len(),
            "Clients claimed"
        );
        Ok(claimed)
    }

    async fn match_all(&self, options: &ClientMatchOptions) -> Result<Vec<Client>> {
        let clients = self.read().await;
        let mut matched: Vec<Client> = clients.match_all(options).into_iter().cloned().collect();
        matched.sort_unstable_by(|a, b| a.id.cmp(&b.id));
        Ok(matched)
    }

    async fn release(&self, worker: ServiceWorkerId) -> Result<Vec<String>> {
        let released = self.write().await.release(worker);
        debug!(worker = worker.raw(), released = released.len(), "Clients released");
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::ServiceWorker;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_clients_registry() {
        let mut clients = Clients::new();
        let client = Client::window(url("https://home.example/smart_home_app.html"));
        let id = client.id.clone();

        clients.add(client);
        assert!(clients.get(&id).is_some());
        assert!(!clients.get(&id).unwrap().is_controlled());

        assert!(clients.remove(&id).is_some());
        assert!(clients.get(&id).is_none());
    }

    #[test]
    fn test_claim_only_in_scope() {
        let mut clients = Clients::new();
        let inside = Client::window(url("https://home.example/app/smart_home_app.html"));
        let outside = Client::window(url("https://home.example/admin/"));
        let inside_id = inside.id.clone();
        let outside_id = outside.id.clone();
        clients.add(inside);
        clients.add(outside);

        let worker = ServiceWorker::new("v1").id;
        let claimed = clients.claim(worker, &url("https://home.example/app/"));

        assert_eq!(claimed, vec![inside_id.clone()]);
        assert_eq!(clients.get(&inside_id).unwrap().controller, Some(worker));
        assert!(clients.get(&outside_id).unwrap().controller.is_none());

        // Already controlled clients are not reported again.
        assert!(clients.claim(worker, &url("https://home.example/app/")).is_empty());
    }

    #[test]
    fn test_match_all_filters_uncontrolled() {
        let mut clients = Clients::new();
        clients.add(Client::window(url("https://home.example/a")));
        clients.add(Client::window(url("https://home.example/b")));

        assert!(clients.match_all(&ClientMatchOptions::default()).is_empty());

        let all = ClientMatchOptions {
            include_uncontrolled: true,
            controller: None,
        };
        assert_eq!(clients.match_all(&all).len(), 2);

        let worker = ServiceWorker::new("v1").id;
        clients.claim(worker, &url("https://home.example/"));
        assert_eq!(clients.match_all(&ClientMatchOptions::default()).len(), 2);

        let other = ClientMatchOptions {
            include_uncontrolled: false,
            controller: Some(ServiceWorker::new("v2").id),
        };
        assert!(clients.match_all(&other).is_empty());

        assert_eq!(clients.release(worker).len(), 2);
        assert!(clients.match_all(&ClientMatchOptions::default()).is_empty());
    }

    #[tokio::test]
    async fn test_client_control_claim() {
        let clients = RwLock::new(Clients::new());
        clients
            .write()
            .await
            .add(Client::window(url("https://home.example/smart_home_app.html")));

        let worker = ServiceWorker::new("v1").id;
        let claimed = ClientControl::claim(&clients, worker, &url("https://home.example/"))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let controlled = ClientControl::match_all(&clients, &ClientMatchOptions::default())
            .await
            .unwrap();
        assert_eq!(controlled.len(), 1);
        assert_eq!(controlled[0].controller, Some(worker));

        let released = ClientControl::release(&clients, worker).await.unwrap();
        assert_eq!(released, claimed);
        assert!(ClientControl::match_all(&clients, &ClientMatchOptions::default())
            .await
            .unwrap()
            .is_empty());
    }
}
