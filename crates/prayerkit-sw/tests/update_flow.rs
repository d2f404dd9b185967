//! Host and page together: first install, update banner, single reload.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{asset, script, serve_shell, shell_network, MockNetwork, ORIGIN};
use prayerkit_common::RetryConfig;
use prayerkit_net::{Fetcher, Request};
use prayerkit_sw::{
    CacheStorage, HostConfig, OfflineSupport, PageAction, PageController, PageUi,
    ServiceWorkerContainer, ServiceWorkerEvent, ServiceWorkerState, UpdateFlow,
};

const SHELL: &[&str] = &["./", "./index.html"];

#[derive(Debug, Default)]
struct RecordingUi {
    banners: usize,
    reloads: usize,
}

impl PageUi for RecordingUi {
    fn show_update_banner(&mut self) {
        self.banners += 1;
    }

    fn reload(&mut self) {
        self.reloads += 1;
    }
}

fn host(net: &Arc<MockNetwork>, retry: RetryConfig) -> Arc<ServiceWorkerContainer> {
    let fetcher: Arc<dyn Fetcher> = Arc::clone(net) as Arc<dyn Fetcher>;
    Arc::new(ServiceWorkerContainer::new(
        HostConfig {
            enabled: true,
            install_retry: retry,
        },
        Arc::new(CacheStorage::new()),
        fetcher,
    ))
}

async fn open_page(
    container: &Arc<ServiceWorkerContainer>,
    version: &str,
) -> PageController<RecordingUi> {
    PageController::load(
        Arc::clone(container),
        asset("./"),
        script(version, SHELL),
        RecordingUi::default(),
    )
    .await
}

#[tokio::test]
async fn first_install_activates_without_notifying() {
    let net = shell_network("v1");
    let container = host(&net, RetryConfig::none());
    let mut page = open_page(&container, "v1").await;

    assert_eq!(page.register().await, OfflineSupport::Available);
    assert_eq!(page.scope(), Some(ORIGIN));
    assert!(page.process_pending().await.is_empty());

    assert_eq!(page.flow(), UpdateFlow::Activated);
    assert_eq!(page.ui().banners, 0);
    assert_eq!(page.ui().reloads, 0);
    assert!(container.controller().await.is_none());
    assert_eq!(
        container.caches().keys().await,
        vec!["prayer-tracker-cache-v1"]
    );
}

#[tokio::test]
async fn update_shows_banner_then_reloads_once() {
    let net = shell_network("v1");
    let container = host(&net, RetryConfig::none());

    let mut first = open_page(&container, "v1").await;
    first.register().await;
    first.process_pending().await;

    serve_shell(&net, "v2");
    let mut page = open_page(&container, "v2").await;
    let v1 = container.controller().await.unwrap();
    assert_eq!(v1.cache_name().version(), "v1");

    page.register().await;
    assert_eq!(page.process_pending().await, vec![PageAction::ShowUpdateBanner]);
    assert_eq!(page.flow(), UpdateFlow::Waiting);
    assert_eq!(page.ui().banners, 1);

    let registration = container.registration(ORIGIN).await.unwrap();
    let waiting = registration.waiting.unwrap();
    assert_eq!(waiting.state, ServiceWorkerState::Installed);
    assert_eq!(registration.active.unwrap().id, v1.id);
    assert_eq!(container.caches().keys().await.len(), 2);

    assert!(page.apply_update().await.unwrap());
    assert_eq!(page.process_pending().await, vec![PageAction::Reload]);
    assert_eq!(page.flow(), UpdateFlow::Reloading);
    assert_eq!(page.ui().reloads, 1);

    assert_eq!(container.controller().await.unwrap().id, waiting.id);
    assert_eq!(
        container.caches().keys().await,
        vec!["prayer-tracker-cache-v2"]
    );

    let again = page
        .process_event(ServiceWorkerEvent::ControllerChange {
            worker_id: waiting.id,
        })
        .await;
    assert_eq!(again, None);
    assert_eq!(page.ui().reloads, 1);
    assert!(!page.apply_update().await.unwrap());
}

#[tokio::test]
async fn reload_with_same_version_is_quiet() {
    let net = shell_network("v1");
    let container = host(&net, RetryConfig::none());

    let mut first = open_page(&container, "v1").await;
    first.register().await;
    let installs = net.total_hits();

    let mut reloaded = open_page(&container, "v1").await;
    assert_eq!(reloaded.register().await, OfflineSupport::Available);
    assert!(reloaded.process_pending().await.is_empty());
    assert_eq!(reloaded.flow(), UpdateFlow::None);
    assert_eq!(net.total_hits(), installs);
}

#[tokio::test]
async fn controlled_page_works_offline() {
    let net = shell_network("v1");
    let container = host(&net, RetryConfig::none());

    let mut first = open_page(&container, "v1").await;
    first.register().await;

    let page = open_page(&container, "v1").await;
    net.set_offline(true);

    let response = page.fetch(Request::get(asset("index.html"))).await.unwrap();
    assert!(response.from_cache);
    assert_eq!(response.text().await.unwrap(), "index v1");

    let err = page.fetch(Request::get(asset("api/today"))).await.unwrap_err();
    assert!(err.is_network_failure());
    container.wait_idle().await;
}

#[tokio::test]
async fn uncontrolled_page_goes_to_network() {
    let net = shell_network("v1");
    let container = host(&net, RetryConfig::none());

    let mut page = open_page(&container, "v1").await;
    page.register().await;
    net.set_offline(true);

    // Registered during this load, so not controlled until the next one.
    assert!(page.fetch(Request::get(asset("index.html"))).await.is_err());
}

#[tokio::test]
async fn failed_install_is_retried_then_abandoned() {
    let net = shell_network("v1");
    net.set_offline(true);
    let container = host(&net, RetryConfig::new(3, Duration::from_millis(1)));

    let mut page = open_page(&container, "v1").await;
    assert_eq!(page.register().await, OfflineSupport::Unavailable);
    page.process_pending().await;

    assert_eq!(page.flow(), UpdateFlow::None);
    assert_eq!(net.hits(ORIGIN), 3);
    assert!(container.caches().keys().await.is_empty());

    let registration = container.registration(ORIGIN).await.unwrap();
    assert!(registration.installing.is_none());
    assert!(registration.waiting.is_none());
    assert!(registration.active.is_none());
}

#[tokio::test]
async fn unregister_leaves_next_page_uncontrolled() {
    let net = shell_network("v1");
    let container = host(&net, RetryConfig::none());

    let mut page = open_page(&container, "v1").await;
    page.register().await;
    assert!(container.unregister(ORIGIN).await.unwrap());

    open_page(&container, "v1").await;
    assert!(container.controller().await.is_none());
}
