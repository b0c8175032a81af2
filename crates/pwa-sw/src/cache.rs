//! Cache storage: named stores of request/response pairs.
//!
//! [`CacheStore`] is the storage interface the agent is written against.
//! [`CacheStorage`] is the in-memory implementation; wrap it in
//! [`SharedCacheStorage`] to share it between the agent and the host.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use pwa_net::{Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::{Result, ServiceWorkerError};

/// Key under which a request is stored. Fragments never take part in matching.
fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (the cache key).
    pub url: String,

    /// URL the response was finally served from, after redirects.
    pub response_url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in wire order. Values are kept as raw bytes.
    pub headers: Vec<(String, Bytes)>,

    /// Response body.
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture `response` as the stored answer for `request`.
    pub fn from_parts(request: &Request, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    Bytes::copy_from_slice(value.as_bytes()),
                )
            })
            .collect();

        Self {
            url: cache_key(&request.url),
            response_url: response.url.to_string(),
            method: request.method.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
            cached_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Rebuild the stored response, flagged as served from cache.
    pub fn to_response(&self) -> Result<Response> {
        let url = Url::parse(&self.response_url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("corrupt entry url: {}", e)))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::CacheError(format!("corrupt entry status: {}", e)))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
            let value = HeaderValue::from_bytes(value)
                .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
            headers.append(name, value);
        }

        Ok(Response::new(url, status, headers, self.body.clone()).into_cached())
    }
}

/// A cache instance.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries keyed by request URL.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request. Only GET requests ever match.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        if request.method != Method::GET {
            return None;
        }
        self.entries.get(&cache_key(&request.url))
    }

    /// Store `response` for `request`, replacing any earlier entry.
    pub fn put(&mut self, request: &Request, response: &Response) -> Result<()> {
        if request.method != Method::GET {
            return Err(ServiceWorkerError::CacheError(format!(
                "cannot cache {} request for {}",
                request.method, request.url
            )));
        }
        let entry = CacheEntry::from_parts(request, response);
        self.entries.insert(entry.url.clone(), entry);
        Ok(())
    }

    /// Delete entry.
    pub fn delete(&mut self, url: &Url) -> bool {
        self.entries.remove(&cache_key(url)).is_some()
    }

    /// Stored request URLs, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache storage (the `caches` global of one origin).
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap in the shared handle used by agents and hosts.
    pub fn shared(self) -> SharedCacheStorage {
        Arc::new(RwLock::new(self))
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// All cache names, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.caches.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    /// Serialize every cache to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ServiceWorkerError::CacheError(e.to_string()))
    }

    /// Restore storage from [`CacheStorage::to_json`] output.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ServiceWorkerError::CacheError(e.to_string()))
    }

    /// Write a JSON snapshot to `path`.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = self.to_json()?;
        tokio::fs::write(path, json).await.map_err(|e| {
            ServiceWorkerError::CacheError(format!("cannot write {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), caches = self.caches.len(), "Cache storage saved");
        Ok(())
    }

    /// Read a JSON snapshot from `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            ServiceWorkerError::CacheError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let storage = Self::from_json(&json)?;
        debug!(path = %path.display(), caches = storage.caches.len(), "Cache storage loaded");
        Ok(storage)
    }
}

/// Cache storage shared between the agent and its host.
pub type SharedCacheStorage = Arc<RwLock<CacheStorage>>;

/// Named-cache storage interface the agent runs against.
///
/// Individual operations are atomic; nothing orders them across callers.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Create the named cache if it does not exist.
    async fn open(&self, name: &str) -> Result<()>;

    /// Whether the named cache exists.
    async fn has(&self, name: &str) -> Result<bool>;

    /// Look `request` up in the named cache.
    async fn match_request(&self, name: &str, request: &Request) -> Result<Option<Response>>;

    /// Store one pair in an existing cache.
    async fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()>;

    /// Store every pair in an existing cache.
    async fn put_all(&self, name: &str, pairs: &[(Request, Response)]) -> Result<()> {
        for (request, response) in pairs {
            self.put(name, request, response).await?;
        }
        Ok(())
    }

    /// Names of every cache on the origin.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Delete the named cache. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool>;
}

#[async_trait]
impl CacheStore for RwLock<CacheStorage> {
    async fn open(&self, name: &str) -> Result<()> {
        self.write().await.open(name);
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.read().await.has(name))
    }

    async fn match_request(&self, name: &str, request: &Request) -> Result<Option<Response>> {
        let storage = self.read().await;
        let entry = storage
            .get(name)
            .and_then(|cache| cache.match_request(request));
        trace!(cache = name, url = %request.url, hit = entry.is_some(), "Cache lookup");
        entry.map(CacheEntry::to_response).transpose()
    }

    async fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()> {
        let mut storage = self.write().await;
        let cache = storage
            .caches
            .get_mut(name)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("cache '{}'", name)))?;
        cache.put(request, response)
    }

    /// All pairs land under one write lock, or none do.
    async fn put_all(&self, name: &str, pairs: &[(Request, Response)]) -> Result<()> {
        let mut storage = self.write().await;
        let cache = storage
            .caches
            .get_mut(name)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("cache '{}'", name)))?;

        let mut staged = cache.clone();
        for (request, response) in pairs {
            staged.put(request, response)?;
        }
        *cache = staged;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .read()
            .await
            .keys()
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.write().await.delete(name))
    }
}
