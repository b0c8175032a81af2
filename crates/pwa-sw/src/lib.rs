//! # PWA Service Worker
//!
//! Offline cache agent for a progressive web app, plus the small host runtime
//! that drives it.
//!
//! ## Features
//!
//! - **Install**: fetch a fixed asset manifest and store it all-or-nothing
//! - **Activate**: delete caches from older versions, claim open pages
//! - **Fetch interception**: cache-first for GET, passthrough for everything else
//! - **Cache storage**: named stores of request/response pairs with JSON snapshots
//! - **Clients**: registry of controlled pages
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (host runtime)
//!     │
//!     └── ServiceWorkerRegistration (per scope)
//!             ├── installing ─┐
//!             ├── waiting     ├── ServiceWorker ── LifecycleHandler (OfflineCacheAgent)
//!             └── active ─────┘                        │
//!                                                      ├── CacheStore  (CacheStorage)
//!                                                      ├── Fetch       (pwa_net::ResourceLoader)
//!                                                      └── ClientControl (Clients)
//! ```

use thiserror::Error;

pub mod agent;
pub mod cache;
pub mod clients;
pub mod config;
pub mod container;
pub mod registration;

pub use agent::{ActivateReport, FetchOutcome, InstallOutcome, LifecycleHandler, OfflineCacheAgent};
pub use cache::{CacheEntry, CacheStorage, CacheStore, SharedCacheStorage};
pub use clients::{Client, ClientControl, ClientMatchOptions, Clients};
pub use config::{AgentConfig, DEFAULT_CACHE_NAME, DEFAULT_MANIFEST};
pub use container::{ServiceWorkerContainer, ServiceWorkerEvent};
pub use registration::{
    ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    #[error("Installation failed: {0}")]
    Installation(String),

    #[error("Activation failed: {0}")]
    Activation(String),

    #[error("Failed to delete cache '{name}': {reason}")]
    CacheDeletion { name: String, reason: String },

    #[error("Fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<pwa_net::NetError> for ServiceWorkerError {
    fn from(err: pwa_net::NetError) -> Self {
        Self::NetworkError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
