//! Page-side coordination: register once, notice updates, reload once.

use std::sync::Arc;

use prayerkit_net::{NetError, Request, Response};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::container::{
    RegistrationOptions, ServiceWorkerContainer, ServiceWorkerEvent, ServiceWorkerId,
};
use crate::lifecycle::ServiceWorkerState;
use crate::worker::{WorkerMessage, WorkerScript};
use crate::ServiceWorkerError;

/// What the page shows the user.
pub trait PageUi: Send {
    /// A new version is installed and waiting.
    fn show_update_banner(&mut self);

    /// Reload the page.
    fn reload(&mut self);
}

/// Whether the page got a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineSupport {
    /// Not registered yet.
    Pending,
    Available,
    /// Registration failed or no worker ever activated; the page keeps
    /// working online only.
    Unavailable,
}

/// The page's view of the newest worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateFlow {
    #[default]
    None,
    Installing,
    Waiting,
    Activating,
    Activated,
    Reloading,
}

/// Side effects produced while handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAction {
    ShowUpdateBanner,
    Reload,
}

/// Controller for one page load.
pub struct PageController<U: PageUi> {
    container: Arc<ServiceWorkerContainer>,
    page_url: Url,
    script: WorkerScript,
    ui: U,
    events: Option<mpsc::UnboundedReceiver<ServiceWorkerEvent>>,
    scope: Option<String>,
    support: OfflineSupport,
    flow: UpdateFlow,
    tracked: Option<ServiceWorkerId>,
    /// Set on the first controller change and never cleared.
    refreshing: bool,
}

impl<U: PageUi> PageController<U> {
    /// Load the page. It is controlled by the active worker if one exists.
    pub async fn load(
        container: Arc<ServiceWorkerContainer>,
        page_url: Url,
        script: WorkerScript,
        ui: U,
    ) -> Self {
        container.begin_page_load(&page_url).await;
        Self {
            container,
            page_url,
            script,
            ui,
            events: None,
            scope: None,
            support: OfflineSupport::Pending,
            flow: UpdateFlow::None,
            tracked: None,
            refreshing: false,
        }
    }

    /// Register the worker. Only the first call does anything.
    pub async fn register(&mut self) -> OfflineSupport {
        if self.support != OfflineSupport::Pending {
            return self.support;
        }

        self.events = Some(self.container.subscribe().await);

        match self
            .container
            .register(self.script.clone(), RegistrationOptions::default())
            .await
        {
            Ok(scope) => {
                let active = self
                    .container
                    .registration(&scope)
                    .await
                    .is_some_and(|r| r.active.is_some());
                if active {
                    info!(%scope, "ServiceWorker registration successful");
                    self.support = OfflineSupport::Available;
                } else {
                    warn!(%scope, "ServiceWorker registered without an active worker");
                    self.support = OfflineSupport::Unavailable;
                }
                self.scope = Some(scope);
            }
            Err(e) => {
                warn!(page = %self.page_url, error = %e, "ServiceWorker registration failed");
                self.support = OfflineSupport::Unavailable;
            }
        }
        self.support
    }

    /// Handle every event delivered so far.
    pub async fn process_pending(&mut self) -> Vec<PageAction> {
        let mut actions = Vec::new();
        loop {
            let event = match self.events.as_mut() {
                Some(rx) => match rx.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
                None => break,
            };
            if let Some(action) = self.process_event(event).await {
                actions.push(action);
            }
        }
        actions
    }

    /// Handle one lifecycle event.
    pub async fn process_event(&mut self, event: ServiceWorkerEvent) -> Option<PageAction> {
        match event {
            ServiceWorkerEvent::UpdateFound { worker_id, .. } => {
                debug!(worker = worker_id.raw(), "Update found");
                self.tracked = Some(worker_id);
                self.flow = UpdateFlow::Installing;
                None
            }
            ServiceWorkerEvent::StateChange {
                worker_id, state, ..
            } if self.tracked == Some(worker_id) => self.on_state_change(state).await,
            ServiceWorkerEvent::StateChange { .. } => None,
            ServiceWorkerEvent::ControllerChange { worker_id } => {
                if self.refreshing {
                    debug!(worker = worker_id.raw(), "Already reloading");
                    return None;
                }
                self.refreshing = true;
                self.flow = UpdateFlow::Reloading;
                info!(worker = worker_id.raw(), "Controller changed; reloading");
                self.ui.reload();
                Some(PageAction::Reload)
            }
        }
    }

    async fn on_state_change(&mut self, state: ServiceWorkerState) -> Option<PageAction> {
        match state {
            ServiceWorkerState::Installed => {
                self.flow = UpdateFlow::Waiting;
                if self.container.controller().await.is_some() {
                    info!("New version available");
                    self.ui.show_update_banner();
                    return Some(PageAction::ShowUpdateBanner);
                }
                None
            }
            ServiceWorkerState::Activating => {
                self.flow = UpdateFlow::Activating;
                None
            }
            ServiceWorkerState::Activated => {
                if self.flow != UpdateFlow::Reloading {
                    self.flow = UpdateFlow::Activated;
                }
                None
            }
            ServiceWorkerState::Redundant => {
                self.tracked = None;
                self.flow = UpdateFlow::None;
                None
            }
            ServiceWorkerState::Parsed | ServiceWorkerState::Installing => None,
        }
    }

    /// The user accepted the update: tell the waiting worker to skip waiting.
    ///
    /// Returns `false` when nothing is waiting.
    pub async fn apply_update(&mut self) -> Result<bool, ServiceWorkerError> {
        let Some(scope) = self.scope.as_deref() else {
            return Ok(false);
        };
        let waiting = self
            .container
            .registration(scope)
            .await
            .and_then(|r| r.waiting);
        let Some(worker) = waiting else {
            debug!(scope, "No waiting worker");
            return Ok(false);
        };

        self.container
            .post_message(worker.id, WorkerMessage::SkipWaiting.to_json())
            .await?;
        Ok(true)
    }

    /// Fetch a resource the way the page would.
    pub async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.container.fetch(request).await
    }

    pub fn page_url(&self) -> &Url {
        &self.page_url
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn support(&self) -> OfflineSupport {
        self.support
    }

    pub fn flow(&self) -> UpdateFlow {
        self.flow
    }

    pub fn is_reloading(&self) -> bool {
        self.refreshing
    }

    pub fn ui(&self) -> &U {
        &self.ui
    }

    pub fn into_ui(self) -> U {
        self.ui
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStorage;
    use crate::container::HostConfig;
    use crate::manifest::{AssetManifest, CacheName};
    use prayerkit_common::RetryConfig;
    use prayerkit_net::DisconnectedFetcher;

    #[derive(Default)]
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

    fn script(version: &str) -> WorkerScript {
        WorkerScript::new(
            Url::parse("https://tracker.example/sw.js").unwrap(),
            CacheName::new("prayer-tracker-cache", version),
            AssetManifest::new(Vec::<String>::new()),
        )
    }

    fn container(enabled: bool) -> Arc<ServiceWorkerContainer> {
        Arc::new(ServiceWorkerContainer::new(
            HostConfig {
                enabled,
                install_retry: RetryConfig::none(),
            },
            Arc::new(CacheStorage::new()),
            Arc::new(DisconnectedFetcher),
        ))
    }

    async fn page(
        container: &Arc<ServiceWorkerContainer>,
        version: &str,
    ) -> PageController<RecordingUi> {
        PageController::load(
            Arc::clone(container),
            Url::parse("https://tracker.example/").unwrap(),
            script(version),
            RecordingUi::default(),
        )
        .await
    }

    #[tokio::test]
    async fn test_unsupported_host_degrades() {
        let container = container(false);
        let mut page = page(&container, "v1").await;

        assert_eq!(page.register().await, OfflineSupport::Unavailable);
        assert!(page.process_pending().await.is_empty());
        assert!(!page.apply_update().await.unwrap());
    }

    #[tokio::test]
    async fn test_register_twice_is_noop() {
        let container = container(true);
        let mut page = page(&container, "v1").await;

        assert_eq!(page.register().await, OfflineSupport::Available);
        page.process_pending().await;
        assert_eq!(page.register().await, OfflineSupport::Available);
        assert!(page.process_pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_controller_change_reloads_once() {
        let container = container(true);
        let mut page = page(&container, "v1").await;
        page.register().await;
        let id = container
            .registration(page.scope().unwrap())
            .await
            .unwrap()
            .active
            .unwrap()
            .id;

        let first = page
            .process_event(ServiceWorkerEvent::ControllerChange { worker_id: id })
            .await;
        let second = page
            .process_event(ServiceWorkerEvent::ControllerChange { worker_id: id })
            .await;

        assert_eq!(first, Some(PageAction::Reload));
        assert_eq!(second, None);
        assert_eq!(page.ui().reloads, 1);
        assert!(page.is_reloading());
    }
}
