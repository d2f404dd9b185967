//! The cache worker: install, fetch interception, activation sweep, messages.

use std::sync::Arc;

use http::{Method, StatusCode};
use prayerkit_net::{Fetcher, NetError, Request, RequestMode, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::cache::{Cache, CacheStorage};
use crate::manifest::{AssetManifest, CacheName};
use crate::ServiceWorkerError;

/// What the host loads to create a worker: where it lives, which store it
/// owns, and what it precaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerScript {
    pub script_url: Url,
    pub cache_name: CacheName,
    pub manifest: AssetManifest,
}

impl WorkerScript {
    pub fn new(script_url: Url, cache_name: CacheName, manifest: AssetManifest) -> Self {
        Self {
            script_url,
            cache_name,
            manifest,
        }
    }

    /// Same script URL and same version tag.
    pub fn same_version(&self, other: &WorkerScript) -> bool {
        self.script_url == other.script_url && self.cache_name == other.cache_name
    }
}

/// Messages a page can post to the worker, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Stop waiting and activate now.
    SkipWaiting,
}

impl WorkerMessage {
    pub fn to_json(&self) -> JsonValue {
        match self {
            WorkerMessage::SkipWaiting => serde_json::json!({ "type": "SKIP_WAITING" }),
        }
    }
}

/// Result of offering a request to the worker.
#[derive(Debug)]
pub enum FetchDisposition {
    /// Not handled; the request goes to the network as if no worker existed.
    Passthrough(Request),
    /// Handled by the worker.
    Responded(Result<Response, NetError>),
}

/// The offline cache worker for one version of the app.
pub struct CacheWorker {
    script_url: Url,
    cache_name: CacheName,
    precache: Vec<Url>,
    caches: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    revalidations: Mutex<JoinSet<()>>,
}

impl CacheWorker {
    /// Create the worker, resolving the manifest against the script URL.
    pub fn new(
        script: &WorkerScript,
        caches: Arc<CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        let precache = script.manifest.resolve(&script.script_url)?;
        Ok(Self {
            script_url: script.script_url.clone(),
            cache_name: script.cache_name.clone(),
            precache,
            caches,
            fetcher,
            revalidations: Mutex::new(JoinSet::new()),
        })
    }

    pub fn cache_name(&self) -> &CacheName {
        &self.cache_name
    }

    /// Resolved precache list.
    pub fn precache_urls(&self) -> &[Url] {
        &self.precache
    }

    /// Install: open the versioned store and fill it from the manifest.
    ///
    /// Nothing is written unless every asset was fetched with an OK status.
    /// A store created by a failed install is removed again.
    pub async fn install(&self) -> Result<usize, ServiceWorkerError> {
        let name = self.cache_name.to_string();
        let existed = self.caches.has(&name).await;
        let cache = self.caches.open(&name).await;
        info!(cache = %name, assets = self.precache.len(), "Opened cache");

        let requests = self
            .precache
            .iter()
            .map(|url| {
                Request::get(url.clone())
                    .mode(RequestMode::Cors)
                    .referrer(self.script_url.clone())
            })
            .collect();

        match cache.add_all(self.fetcher.as_ref(), requests).await {
            Ok(count) => {
                info!(cache = %name, count, "Precache complete");
                Ok(count)
            }
            Err(e) => {
                warn!(cache = %name, error = %e, "Precache failed");
                if !existed {
                    self.caches.delete(&name).await;
                }
                Err(e)
            }
        }
    }

    /// Activate: delete every store that is not this worker's version.
    pub async fn activate(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let keep = self.cache_name.to_string();
        let mut deleted = Vec::new();
        for name in self.caches.keys().await {
            if name != keep && self.caches.delete(&name).await {
                info!(cache = %name, "Deleted old cache");
                deleted.push(name);
            }
        }
        Ok(deleted)
    }

    /// Handle an intercepted request with stale-while-revalidate.
    ///
    /// Non-GET requests are passed through. A cache hit is returned at once
    /// and refreshed in the background. A miss goes to the network and a
    /// `200` response is stored before it is returned. Network failures on a
    /// miss are returned to the caller.
    pub async fn handle_fetch(&self, request: Request) -> FetchDisposition {
        if request.method != Method::GET {
            trace!(url = %request.url, method = %request.method, "Not intercepting");
            return FetchDisposition::Passthrough(request);
        }

        let cache = self.caches.open(&self.cache_name.to_string()).await;

        if let Some(cached) = cache.match_request(&request).await {
            debug!(url = %request.url, "Cache hit");
            self.spawn_revalidation(cache, request).await;
            return FetchDisposition::Responded(Ok(cached));
        }

        debug!(url = %request.url, "Cache miss");
        match self.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                if is_cacheable(&response) {
                    if let Err(e) = cache.put(&request, response.duplicate()).await {
                        warn!(url = %request.url, error = %e, "Failed to cache response");
                    }
                } else {
                    trace!(url = %request.url, status = %response.status, "Response not cached");
                }
                FetchDisposition::Responded(Ok(response))
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Fetch failed; user is likely offline");
                FetchDisposition::Responded(Err(e))
            }
        }
    }

    async fn spawn_revalidation(&self, cache: Arc<Cache>, request: Request) {
        let fetcher = Arc::clone(&self.fetcher);
        let mut tasks = self.revalidations.lock().await;
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            match fetcher.fetch(request.clone()).await {
                Ok(fresh) if is_cacheable(&fresh) => match cache.put(&request, fresh).await {
                    Ok(()) => debug!(url = %request.url, "Revalidated cache entry"),
                    Err(e) => warn!(url = %request.url, error = %e, "Failed to store revalidation"),
                },
                Ok(fresh) => {
                    debug!(url = %request.url, status = %fresh.status, "Revalidation not stored")
                }
                Err(e) => {
                    debug!(url = %request.url, error = %e, "Revalidation failed; stale entry kept")
                }
            }
        });
    }

    /// Wait for every background revalidation started so far.
    pub async fn wait_idle(&self) {
        let mut tasks = std::mem::take(&mut *self.revalidations.lock().await);
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Revalidation task failed");
            }
        }
    }

    /// Decode a posted message. Unknown messages are ignored.
    pub fn handle_message(&self, data: &JsonValue) -> Option<WorkerMessage> {
        match serde_json::from_value::<WorkerMessage>(data.clone()) {
            Ok(message) => {
                debug!(?message, "Worker message");
                Some(message)
            }
            Err(e) => {
                debug!(%data, error = %e, "Ignoring unknown message");
                None
            }
        }
    }
}

impl std::fmt::Debug for CacheWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWorker")
            .field("script_url", &self.script_url.as_str())
            .field("cache_name", &self.cache_name.to_string())
            .field("precache", &self.precache.len())
            .finish()
    }
}

/// Only plain `200` responses are stored; opaque responses never are.
fn is_cacheable(response: &Response) -> bool {
    response.status == StatusCode::OK && !response.is_opaque()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prayerkit_net::DisconnectedFetcher;

    fn script(manifest: &[&str]) -> WorkerScript {
        WorkerScript::new(
            Url::parse("https://tracker.example/sw.js").unwrap(),
            CacheName::new("prayer-tracker-cache", "v1"),
            AssetManifest::new(manifest.iter().copied()),
        )
    }

    #[test]
    fn test_skip_waiting_message_wire_format() {
        let json = WorkerMessage::SkipWaiting.to_json();
        assert_eq!(json, serde_json::json!({ "type": "SKIP_WAITING" }));
        let parsed: WorkerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, WorkerMessage::SkipWaiting);
    }

    #[test]
    fn test_handle_message_ignores_unknown() {
        let worker = CacheWorker::new(
            &script(&["./"]),
            Arc::new(CacheStorage::new()),
            Arc::new(DisconnectedFetcher),
        )
        .unwrap();

        assert_eq!(
            worker.handle_message(&serde_json::json!({ "type": "SKIP_WAITING" })),
            Some(WorkerMessage::SkipWaiting)
        );
        assert_eq!(
            worker.handle_message(&serde_json::json!({ "type": "CLAIM" })),
            None
        );
        assert_eq!(worker.handle_message(&serde_json::json!("hello")), None);
    }

    #[test]
    fn test_precache_urls_resolved_against_script() {
        let worker = CacheWorker::new(
            &script(&["./", "./index.html"]),
            Arc::new(CacheStorage::new()),
            Arc::new(DisconnectedFetcher),
        )
        .unwrap();
        let urls: Vec<&str> = worker.precache_urls().iter().map(Url::as_str).collect();
        assert_eq!(
            urls,
            vec!["https://tracker.example/", "https://tracker.example/index.html"]
        );
    }

    #[test]
    fn test_same_version() {
        let a = script(&["./"]);
        let mut b = script(&["./", "./index.html"]);
        assert!(a.same_version(&b));
        b.cache_name = CacheName::new("prayer-tracker-cache", "v2");
        assert!(!a.same_version(&b));
    }

    #[tokio::test]
    async fn test_install_offline_leaves_no_store() {
        let caches = Arc::new(CacheStorage::new());
        let worker = CacheWorker::new(
            &script(&["./", "./index.html"]),
            Arc::clone(&caches),
            Arc::new(DisconnectedFetcher),
        )
        .unwrap();

        let result = worker.install().await;
        assert!(matches!(
            result,
            Err(ServiceWorkerError::InstallFailed { .. })
        ));
        assert!(caches.keys().await.is_empty());
    }
}
