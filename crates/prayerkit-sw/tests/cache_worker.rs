//! Cache worker behavior: install, stale-while-revalidate, activation sweep.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::{asset, script, serve_shell, shell_network, MockNetwork, ORIGIN};
use http::StatusCode;
use prayerkit_net::{Fetcher, Request, RequestMode};
use prayerkit_sw::{CacheStorage, CacheWorker, FetchDisposition, RequestKey, ServiceWorkerError};

fn worker(
    version: &str,
    manifest: &[&str],
    caches: &Arc<CacheStorage>,
    net: &Arc<MockNetwork>,
) -> CacheWorker {
    let fetcher: Arc<dyn Fetcher> = Arc::clone(net) as Arc<dyn Fetcher>;
    CacheWorker::new(&script(version, manifest), Arc::clone(caches), fetcher).unwrap()
}

async fn body_of(disposition: FetchDisposition) -> String {
    match disposition {
        FetchDisposition::Responded(Ok(response)) => response.text().await.unwrap(),
        other => panic!("expected a response, got {other:?}"),
    }
}

#[tokio::test]
async fn install_stores_one_entry_per_manifest_url() {
    let caches = Arc::new(CacheStorage::new());
    let net = shell_network("v1");
    let worker = worker("v1", &["./", "./index.html"], &caches, &net);

    assert_eq!(worker.install().await.unwrap(), 2);

    let cache = caches.get("prayer-tracker-cache-v1").await.unwrap();
    assert_eq!(cache.len().await, 2);

    let deleted = worker.activate().await.unwrap();
    assert!(deleted.is_empty());
    assert_eq!(caches.keys().await, vec!["prayer-tracker-cache-v1"]);
}

#[tokio::test]
async fn reinstall_with_same_manifest_is_idempotent() {
    let caches = Arc::new(CacheStorage::new());
    let net = shell_network("v1");
    let worker = worker("v1", &["./", "./index.html", "index.html"], &caches, &net);

    worker.install().await.unwrap();
    worker.install().await.unwrap();

    let cache = caches.get("prayer-tracker-cache-v1").await.unwrap();
    let keys = cache.keys().await;
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&RequestKey::new(&http::Method::GET, &asset("index.html"))));
}

#[tokio::test]
async fn failed_install_writes_nothing() {
    let caches = Arc::new(CacheStorage::new());
    let net = MockNetwork::new();
    net.route(ORIGIN, 200, "shell");
    net.route(&asset("index.html").to_string(), 500, "boom");
    let worker = worker("v1", &["./", "./index.html"], &caches, &net);

    let err = worker.install().await.unwrap_err();
    match err {
        ServiceWorkerError::InstallFailed { url: failed, .. } => {
            assert_eq!(failed, asset("index.html").to_string())
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!caches.has("prayer-tracker-cache-v1").await);
}

#[tokio::test]
async fn activation_deletes_every_other_version() {
    let caches = Arc::new(CacheStorage::new());
    let net = shell_network("v1");
    caches.open("unrelated-store").await;

    let v1 = worker("v1", &["./"], &caches, &net);
    v1.install().await.unwrap();
    v1.activate().await.unwrap();
    assert_eq!(caches.keys().await, vec!["prayer-tracker-cache-v1"]);

    serve_shell(&net, "v2");
    let v2 = worker("v2", &["./"], &caches, &net);
    v2.install().await.unwrap();
    assert_eq!(caches.keys().await.len(), 2);

    let deleted = v2.activate().await.unwrap();
    assert_eq!(deleted, vec!["prayer-tracker-cache-v1"]);
    assert_eq!(caches.keys().await, vec!["prayer-tracker-cache-v2"]);
}

#[tokio::test]
async fn cached_get_is_served_while_offline() {
    let caches = Arc::new(CacheStorage::new());
    let net = shell_network("v1");
    let worker = worker("v1", &["./", "./index.html"], &caches, &net);
    worker.install().await.unwrap();

    net.set_offline(true);

    let response = match worker.handle_fetch(Request::get(asset("index.html"))).await {
        FetchDisposition::Responded(Ok(response)) => response,
        other => panic!("expected cached response, got {other:?}"),
    };
    assert!(response.from_cache);
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "index v1");

    // The failed background refresh must not evict the entry.
    worker.wait_idle().await;
    assert_eq!(
        body_of(worker.handle_fetch(Request::get(asset("index.html"))).await).await,
        "index v1"
    );
}

#[tokio::test]
async fn revalidation_overwrites_stale_entry() {
    let caches = Arc::new(CacheStorage::new());
    let net = shell_network("v1");
    let worker = worker("v1", &["./index.html"], &caches, &net);
    worker.install().await.unwrap();

    serve_shell(&net, "v1-patched");

    let stale = body_of(worker.handle_fetch(Request::get(asset("index.html"))).await).await;
    assert_eq!(stale, "index v1");

    worker.wait_idle().await;
    let fresh = body_of(worker.handle_fetch(Request::get(asset("index.html"))).await).await;
    assert_eq!(fresh, "index v1-patched");
    worker.wait_idle().await;
    assert_eq!(net.hits(&asset("index.html").to_string()), 3);
}

#[tokio::test]
async fn uncached_network_failure_is_returned() {
    let caches = Arc::new(CacheStorage::new());
    let net = shell_network("v1");
    let worker = worker("v1", &["./"], &caches, &net);
    worker.install().await.unwrap();
    net.set_offline(true);

    let target = asset("data/2026.json");
    match worker.handle_fetch(Request::get(target.clone())).await {
        FetchDisposition::Responded(Err(e)) => assert!(e.is_network_failure()),
        other => panic!("expected a failed load, got {other:?}"),
    }

    let cache = caches.get("prayer-tracker-cache-v1").await.unwrap();
    assert!(cache.match_request(&Request::get(target)).await.is_none());
    assert_eq!(cache.len().await, 1);
}

#[tokio::test]
async fn miss_with_ok_status_is_stored() {
    let caches = Arc::new(CacheStorage::new());
    let net = shell_network("v1");
    net.route(&asset("icon.png").to_string(), 200, "png");
    let worker = worker("v1", &["./"], &caches, &net);
    worker.install().await.unwrap();

    let body = body_of(worker.handle_fetch(Request::get(asset("icon.png"))).await).await;
    assert_eq!(body, "png");

    net.set_offline(true);
    let again = body_of(worker.handle_fetch(Request::get(asset("icon.png"))).await).await;
    assert_eq!(again, "png");
}

#[tokio::test]
async fn non_ok_responses_are_not_stored() {
    let caches = Arc::new(CacheStorage::new());
    let net = shell_network("v1");
    net.route(&asset("moved").to_string(), 301, "");
    let worker = worker("v1", &["./"], &caches, &net);
    worker.install().await.unwrap();

    for path in ["missing", "moved"] {
        match worker.handle_fetch(Request::get(asset(path))).await {
            FetchDisposition::Responded(Ok(response)) => assert_ne!(response.status, StatusCode::OK),
            other => panic!("expected a response, got {other:?}"),
        }
    }

    let cache = caches.get("prayer-tracker-cache-v1").await.unwrap();
    assert_eq!(cache.len().await, 1);
}

#[tokio::test]
async fn opaque_responses_are_not_stored() {
    let caches = Arc::new(CacheStorage::new());
    let net = shell_network("v1");
    let cdn = "https://cdn.example/lib.js";
    net.route(cdn, 200, "lib");
    let worker = worker("v1", &["./"], &caches, &net);
    worker.install().await.unwrap();

    let request = Request::get(url::Url::parse(cdn).unwrap()).referrer(asset("index.html"));
    match worker.handle_fetch(request.clone()).await {
        FetchDisposition::Responded(Ok(response)) => assert!(response.is_opaque()),
        other => panic!("expected a response, got {other:?}"),
    }
    let cache = caches.get("prayer-tracker-cache-v1").await.unwrap();
    assert!(cache.match_request(&request).await.is_none());

    let cors = request.mode(RequestMode::Cors);
    body_of(worker.handle_fetch(cors.clone()).await).await;
    assert!(cache.match_request(&cors).await.is_some());
}

#[tokio::test]
async fn non_get_requests_pass_through() {
    let caches = Arc::new(CacheStorage::new());
    let net = shell_network("v1");
    let worker = worker("v1", &["./"], &caches, &net);
    worker.install().await.unwrap();
    let before = net.total_hits();

    let post = Request::post(asset("sync"), Bytes::from_static(b"{}"));
    match worker.handle_fetch(post).await {
        FetchDisposition::Passthrough(request) => assert_eq!(request.method, http::Method::POST),
        other => panic!("expected passthrough, got {other:?}"),
    }
    assert_eq!(net.total_hits(), before);
}

#[tokio::test]
async fn snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("caches.json");

    let caches = Arc::new(CacheStorage::new());
    let net = shell_network("v1");
    worker("v1", &["./", "./index.html"], &caches, &net)
        .install()
        .await
        .unwrap();
    caches.save(&path).await.unwrap();

    let restored = Arc::new(CacheStorage::load(&path).await.unwrap());
    net.set_offline(true);
    let worker = worker("v1", &["./", "./index.html"], &restored, &net);
    assert_eq!(
        body_of(worker.handle_fetch(Request::get(asset("./"))).await).await,
        "shell v1"
    );
}
