//! Cache API: named stores of request → response pairs.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::future::join_all;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use prayerkit_net::{Fetcher, Request, Response, ResponseType};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, trace};
use url::Url;

use crate::ServiceWorkerError;

/// Identity of a cached request: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }

    pub fn for_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }
}

/// A stored response snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Response URL.
    pub url: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in order, repeated names allowed.
    pub headers: Vec<(String, String)>,

    /// Response type at the time it was stored.
    pub response_type: ResponseType,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response. Consumes it: the body can only be read once.
    pub fn from_response(response: Response) -> Self {
        let url = response.url.to_string();
        let status = response.status.as_u16();
        let response_type = response.response_type;
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.into_body().to_vec();

        Self {
            url,
            status,
            headers,
            response_type,
            body,
            cached_at: now_millis(),
        }
    }

    /// Build a fresh response from this snapshot.
    pub fn to_response(&self) -> Result<Response, ServiceWorkerError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("bad cached url: {e}")))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::CacheError(format!("bad cached status: {e}")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }

        Ok(
            Response::from_parts(url, status, headers, Bytes::from(self.body.clone()))
                .with_type(self.response_type)
                .with_from_cache(true),
        )
    }
}

/// A cache instance.
#[derive(Debug)]
pub struct Cache {
    /// Cache name.
    name: String,

    /// Cached entries.
    entries: RwLock<HashMap<RequestKey, CacheEntry>>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request, returning a new response each time.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        let key = RequestKey::for_request(request);
        let entries = self.entries.read().await;
        let entry = entries.get(&key)?;
        match entry.to_response() {
            Ok(response) => Some(response),
            Err(e) => {
                debug!(cache = %self.name, url = %key.url, error = %e, "Dropping unreadable entry");
                None
            }
        }
    }

    /// Get a copy of the stored entry for a key.
    pub async fn entry(&self, key: &RequestKey) -> Option<CacheEntry> {
        self.entries.read().await.get(key).cloned()
    }

    /// Store a response, replacing any previous entry for the request.
    pub async fn put(&self, request: &Request, response: Response) -> Result<(), ServiceWorkerError> {
        if request.method != Method::GET {
            return Err(ServiceWorkerError::CacheError(format!(
                "cannot cache {} request for {}",
                request.method, request.url
            )));
        }
        if response.status == StatusCode::PARTIAL_CONTENT {
            return Err(ServiceWorkerError::CacheError(format!(
                "cannot cache partial response for {}",
                request.url
            )));
        }

        let key = RequestKey::for_request(request);
        trace!(cache = %self.name, url = %key.url, "Cache put");
        let entry = CacheEntry::from_response(response);
        self.entries.write().await.insert(key, entry);
        Ok(())
    }

    /// Fetch every request and store all responses, or store nothing.
    ///
    /// Fails if any fetch fails or returns a non-2xx status.
    pub async fn add_all(
        &self,
        fetcher: &dyn Fetcher,
        requests: Vec<Request>,
    ) -> Result<usize, ServiceWorkerError> {
        let fetches = requests.iter().map(|request| fetcher.fetch(request.clone()));
        let results = join_all(fetches).await;

        let mut staged = Vec::with_capacity(requests.len());
        for (request, result) in requests.iter().zip(results) {
            let response = result.map_err(|e| ServiceWorkerError::InstallFailed {
                url: request.url.to_string(),
                reason: e.to_string(),
            })?;
            if !response.ok() {
                return Err(ServiceWorkerError::InstallFailed {
                    url: request.url.to_string(),
                    reason: format!("bad status {}", response.status),
                });
            }
            staged.push((RequestKey::for_request(request), CacheEntry::from_response(response)));
        }

        let count = staged.len();
        let mut entries = self.entries.write().await;
        for (key, entry) in staged {
            entries.insert(key, entry);
        }
        debug!(cache = %self.name, count, "Stored precache entries");
        Ok(count)
    }

    /// Delete entry.
    pub async fn delete(&self, request: &Request) -> bool {
        let key = RequestKey::for_request(request);
        self.entries.write().await.remove(&key).is_some()
    }

    /// Get all keys, sorted by URL.
    pub async fn keys(&self) -> Vec<RequestKey> {
        let mut keys: Vec<_> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Cache storage (the `caches` global).
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: RwLock<HashMap<String, Arc<Cache>>>,
}

#[derive(Serialize, Deserialize)]
struct CacheSnapshot {
    name: String,
    entries: Vec<(RequestKey, CacheEntry)>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if doesn't exist).
    pub async fn open(&self, name: &str) -> Arc<Cache> {
        if let Some(cache) = self.caches.read().await.get(name) {
            return Arc::clone(cache);
        }
        let mut caches = self.caches.write().await;
        Arc::clone(
            caches
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Cache::new(name))),
        )
    }

    /// Get a cache without creating it.
    pub async fn get(&self, name: &str) -> Option<Arc<Cache>> {
        self.caches.read().await.get(name).cloned()
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> bool {
        self.caches.write().await.remove(name).is_some()
    }

    /// Get all cache names, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut names: Vec<_> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Match across all caches, in name order.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        let caches: Vec<Arc<Cache>> = {
            let guard = self.caches.read().await;
            let mut caches: Vec<_> = guard.values().cloned().collect();
            caches.sort_by(|a, b| a.name.cmp(&b.name));
            caches
        };
        for cache in caches {
            if let Some(response) = cache.match_request(request).await {
                return Some(response);
            }
        }
        None
    }

    /// Write every cache to a JSON file, replacing it atomically.
    pub async fn save(&self, path: &Path) -> Result<(), ServiceWorkerError> {
        let caches: Vec<Arc<Cache>> = self.caches.read().await.values().cloned().collect();
        let mut snapshot = Vec::with_capacity(caches.len());
        for cache in caches {
            let mut entries: Vec<_> = cache
                .entries
                .read()
                .await
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            snapshot.push(CacheSnapshot {
                name: cache.name.clone(),
                entries,
            });
        }
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));

        let json = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        info!(path = %path.display(), caches = snapshot.len(), "Saved cache storage");
        Ok(())
    }

    /// Load caches from a JSON file. A missing file gives empty storage.
    pub async fn load(path: &Path) -> Result<Self, ServiceWorkerError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No cache snapshot; starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: Vec<CacheSnapshot> = serde_json::from_slice(&bytes)?;
        let mut caches = HashMap::with_capacity(snapshot.len());
        for dump in snapshot {
            let cache = Cache::new(&dump.name);
            {
                let mut entries = cache.entries.write().await;
                entries.extend(dump.entries);
            }
            caches.insert(dump.name, Arc::new(cache));
        }
        debug!(path = %path.display(), caches = caches.len(), "Loaded cache storage");
        Ok(Self {
            caches: RwLock::new(caches),
        })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(url: &str) -> Request {
        Request::get_str(url).unwrap()
    }

    fn ok(url: &str, body: &str) -> Response {
        Response::ok_with_body(Url::parse(url).unwrap(), body.to_string())
    }

    #[tokio::test]
    async fn test_put_and_match() {
        let cache = Cache::new("v1");
        let request = get("https://tracker.example/style.css");
        cache
            .put(&request, ok("https://tracker.example/style.css", "body{}"))
            .await
            .unwrap();

        let hit = cache.match_request(&request).await.unwrap();
        assert!(hit.from_cache);
        assert_eq!(hit.text().await.unwrap(), "body{}");

        // Each match yields an independent response.
        let again = cache.match_request(&request).await.unwrap();
        assert_eq!(again.text().await.unwrap(), "body{}");

        assert!(cache
            .match_request(&get("https://tracker.example/other.css"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_put_overwrites_same_key() {
        let cache = Cache::new("v1");
        let request = get("https://tracker.example/index.html");
        cache
            .put(&request, ok("https://tracker.example/index.html", "old"))
            .await
            .unwrap();
        cache
            .put(&request, ok("https://tracker.example/index.html", "new"))
            .await
            .unwrap();

        assert_eq!(cache.len().await, 1);
        let hit = cache.match_request(&request).await.unwrap();
        assert_eq!(hit.text().await.unwrap(), "new");
    }

    #[tokio::test]
    async fn test_fragment_is_ignored() {
        let cache = Cache::new("v1");
        cache
            .put(
                &get("https://tracker.example/index.html"),
                ok("https://tracker.example/index.html", "x"),
            )
            .await
            .unwrap();
        assert!(cache
            .match_request(&get("https://tracker.example/index.html#today"))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_put_rejects_non_get() {
        let cache = Cache::new("v1");
        let url = Url::parse("https://tracker.example/api").unwrap();
        let request = Request::post(url.clone(), Bytes::from_static(b"{}"));
        let result = cache.put(&request, ok(url.as_str(), "")).await;
        assert!(matches!(result, Err(ServiceWorkerError::CacheError(_))));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_cache_delete_and_keys() {
        let cache = Cache::new("test");
        for path in ["b.js", "a.js"] {
            let url = format!("https://tracker.example/{path}");
            cache.put(&get(&url), ok(&url, path)).await.unwrap();
        }

        let keys: Vec<String> = cache.keys().await.into_iter().map(|k| k.url).collect();
        assert_eq!(
            keys,
            vec!["https://tracker.example/a.js", "https://tracker.example/b.js"]
        );

        assert!(cache.delete(&get("https://tracker.example/a.js")).await);
        assert!(!cache.delete(&get("https://tracker.example/a.js")).await);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_cache_storage_open_has_delete() {
        let storage = CacheStorage::new();
        assert!(!storage.has("v1").await);

        let first = storage.open("v1").await;
        let second = storage.open("v1").await;
        assert!(Arc::ptr_eq(&first, &second));
        assert!(storage.has("v1").await);

        storage.open("v0").await;
        assert_eq!(storage.keys().await, vec!["v0".to_string(), "v1".to_string()]);

        assert!(storage.delete("v1").await);
        assert!(!storage.has("v1").await);
        assert!(storage.get("v1").await.is_none());
    }

    #[test]
    fn test_entry_round_trip_keeps_headers_and_type() {
        let url = Url::parse("https://cdn.tailwindcss.com/3.4.3").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/javascript"),
        );
        let response = Response::from_parts(url, StatusCode::OK, headers, Bytes::from("js"))
            .with_type(ResponseType::Cors);

        let entry = CacheEntry::from_response(response);
        assert_eq!(entry.status, 200);
        assert_eq!(entry.body, b"js");

        let restored = entry.to_response().unwrap();
        assert_eq!(restored.response_type, ResponseType::Cors);
        assert_eq!(
            restored.content_type.as_ref().map(|m| m.essence_str()),
            Some("application/javascript")
        );
        assert!(restored.from_cache);
    }

    #[tokio::test]
    async fn test_snapshot_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.json");

        let storage = CacheStorage::new();
        let cache = storage.open("prayer-tracker-cache-v1").await;
        cache
            .put(
                &get("https://tracker.example/index.html"),
                ok("https://tracker.example/index.html", "<html>"),
            )
            .await
            .unwrap();
        storage.save(&path).await.unwrap();

        let restored = CacheStorage::load(&path).await.unwrap();
        assert_eq!(restored.keys().await, vec!["prayer-tracker-cache-v1".to_string()]);
        let hit = restored
            .match_request(&get("https://tracker.example/index.html"))
            .await
            .unwrap();
        assert_eq!(hit.text().await.unwrap(), "<html>");
    }

    #[tokio::test]
    async fn test_load_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CacheStorage::load(&dir.path().join("absent.json"))
            .await
            .unwrap();
        assert!(storage.keys().await.is_empty());
    }
}
