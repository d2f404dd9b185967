//! The service worker host: registrations, lifecycle, event delivery.
//!
//! This is the part a browser owns. Pages only call [`register`], post
//! messages and fetch; every state change is made here and reported back as a
//! [`ServiceWorkerEvent`].
//!
//! [`register`]: ServiceWorkerContainer::register

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use prayerkit_common::{retry_with_backoff, RetryConfig};
use prayerkit_net::{Fetcher, NetError, Request, Response};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::lifecycle::{LifecycleTransition, ServiceWorkerState};
use crate::manifest::CacheName;
use crate::worker::{CacheWorker, FetchDisposition, WorkerMessage, WorkerScript};
use crate::ServiceWorkerError;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A service worker instance as seen by the host.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// The script this worker was created from.
    pub script: WorkerScript,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,

    runtime: Arc<CacheWorker>,
}

impl ServiceWorker {
    fn new(script: WorkerScript, runtime: CacheWorker) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script,
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
            runtime: Arc::new(runtime),
        }
    }

    fn apply(&mut self, input: LifecycleTransition) -> Result<ServiceWorkerState, ServiceWorkerError> {
        self.state = self.state.transition(input)?;
        self.state_changed_at = Instant::now();
        Ok(self.state)
    }

    pub fn cache_name(&self) -> &CacheName {
        &self.script.cache_name
    }

    /// The running worker.
    pub fn runtime(&self) -> &Arc<CacheWorker> {
        &self.runtime
    }
}

/// Options for service worker registration.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope URL. Defaults to the directory of the script.
    pub scope: Option<String>,
}

/// A service worker registration.
#[derive(Debug, Clone)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Last update check time.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    /// The most recent worker in any slot.
    pub fn newest_worker(&self) -> Option<&ServiceWorker> {
        self.installing
            .as_ref()
            .or(self.waiting.as_ref())
            .or(self.active.as_ref())
    }

    /// Find a worker by ID in any slot.
    pub fn worker(&self, id: ServiceWorkerId) -> Option<&ServiceWorker> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .find(|w| w.id == id)
    }

    /// Whether `url` falls under this registration's scope.
    pub fn covers(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }
}

/// Service worker events delivered to the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new worker started installing.
    UpdateFound {
        scope: String,
        worker_id: ServiceWorkerId,
    },
    /// A worker changed state.
    StateChange {
        scope: String,
        worker_id: ServiceWorkerId,
        state: ServiceWorkerState,
    },
    /// The worker controlling the page changed.
    ControllerChange { worker_id: ServiceWorkerId },
}

/// Host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Whether this environment supports service workers at all.
    pub enabled: bool,
    /// Retry policy for failed installs.
    pub install_retry: RetryConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            install_retry: RetryConfig::default(),
        }
    }
}

/// Service worker container (`navigator.serviceWorker` plus the browser
/// machinery behind it) for one browsing context.
pub struct ServiceWorkerContainer {
    config: HostConfig,

    /// Registrations by scope.
    registrations: RwLock<HashMap<String, ServiceWorkerRegistration>>,

    /// Cache storage shared by all workers.
    caches: Arc<CacheStorage>,

    /// Network used by workers and for uncontrolled requests.
    fetcher: Arc<dyn Fetcher>,

    /// Worker controlling the current page.
    controller: RwLock<Option<ServiceWorker>>,

    /// Event sender for the current page.
    event_tx: Mutex<Option<mpsc::UnboundedSender<ServiceWorkerEvent>>>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(config: HostConfig, caches: Arc<CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            registrations: RwLock::new(HashMap::new()),
            caches,
            fetcher,
            controller: RwLock::new(None),
            event_tx: Mutex::new(None),
        }
    }

    /// Cache storage.
    pub fn caches(&self) -> &Arc<CacheStorage> {
        &self.caches
    }

    /// Start receiving events. A new subscriber replaces the previous one,
    /// the way a reloaded page stops hearing events meant for the old one.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<ServiceWorkerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.event_tx.lock().await = Some(tx);
        rx
    }

    async fn emit(&self, event: ServiceWorkerEvent) {
        if let Some(tx) = self.event_tx.lock().await.as_ref() {
            if tx.send(event).is_err() {
                debug!("Page is no longer listening for worker events");
            }
        }
    }

    /// Navigate the page: it becomes controlled by the active worker whose
    /// scope covers `page_url`, if any.
    pub async fn begin_page_load(&self, page_url: &Url) -> bool {
        let active = {
            let registrations = self.registrations.read().await;
            registrations
                .values()
                .filter(|r| r.covers(page_url))
                .max_by_key(|r| r.scope.as_str().len())
                .and_then(|r| r.active.clone())
        };
        let controlled = active.is_some();
        *self.controller.write().await = active;
        debug!(url = %page_url, controlled, "Page load");
        controlled
    }

    /// The worker controlling the current page.
    pub async fn controller(&self) -> Option<ServiceWorker> {
        self.controller.read().await.clone()
    }

    /// Register a worker script.
    ///
    /// Installs the script unless the registration already has a worker of
    /// the same version. With no active worker the new one is activated right
    /// away; otherwise it waits for `SKIP_WAITING`.
    ///
    /// A failed install is not an error here: the worker turns redundant
    /// (reported as a `StateChange`) and the registration is kept.
    pub async fn register(
        &self,
        script: WorkerScript,
        options: RegistrationOptions,
    ) -> Result<String, ServiceWorkerError> {
        if !self.config.enabled {
            return Err(ServiceWorkerError::Unsupported);
        }

        let scope = resolve_scope(&script.script_url, options.scope.as_deref())?;
        let scope_str = scope.to_string();

        let worker = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(scope_str.clone())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope));
            registration.last_update_check = Some(Instant::now());

            if let Some(newest) = registration.newest_worker() {
                if newest.script.same_version(&script) {
                    debug!(scope = %scope_str, version = %script.cache_name, "Worker is up to date");
                    return Ok(scope_str);
                }
            }

            let runtime = CacheWorker::new(&script, Arc::clone(&self.caches), Arc::clone(&self.fetcher))?;
            let mut worker = ServiceWorker::new(script, runtime);
            worker.apply(LifecycleTransition::StartInstall)?;

            if let Some(mut previous) = registration.installing.replace(worker.clone()) {
                previous.apply(LifecycleTransition::Discard)?;
            }
            worker
        };

        info!(scope = %scope_str, version = %worker.cache_name(), "Installing service worker");
        self.emit(ServiceWorkerEvent::UpdateFound {
            scope: scope_str.clone(),
            worker_id: worker.id,
        })
        .await;

        let runtime = Arc::clone(&worker.runtime);
        let install = retry_with_backoff(&self.config.install_retry, || {
            let runtime = Arc::clone(&runtime);
            async move { runtime.install().await }
        })
        .await;

        let (installed, has_active) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(&scope_str)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope_str.clone()))?;

            let still_current = registration
                .installing
                .as_ref()
                .is_some_and(|w| w.id == worker.id);
            if !still_current {
                debug!(scope = %scope_str, "Install superseded or unregistered");
                return Ok(scope_str);
            }

            let Some(mut installed) = registration.installing.take() else {
                return Ok(scope_str);
            };

            // The registration stays; any active worker keeps serving.
            if let Err(e) = install {
                installed.apply(LifecycleTransition::InstallFailed)?;
                drop(registrations);
                error!(scope = %scope_str, error = %e, "Service worker install failed");
                self.emit(state_change(&scope_str, &installed)).await;
                return Ok(scope_str);
            }

            installed.apply(LifecycleTransition::InstallSucceeded)?;
            if let Some(mut replaced) = registration.waiting.replace(installed.clone()) {
                replaced.apply(LifecycleTransition::Discard)?;
            }
            (installed, registration.active.is_some())
        };

        self.emit(state_change(&scope_str, &installed)).await;

        if !has_active {
            self.activate_waiting(&scope_str).await?;
        } else {
            info!(scope = %scope_str, "New service worker installed and waiting");
        }

        Ok(scope_str)
    }

    /// Recreate the active worker of a registration kept from an earlier
    /// session. Its store must already be in cache storage; nothing is fetched.
    pub async fn restore_active(
        &self,
        script: WorkerScript,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        if !self.config.enabled {
            return Err(ServiceWorkerError::Unsupported);
        }
        let name = script.cache_name.to_string();
        if !self.caches.has(&name).await {
            return Err(ServiceWorkerError::NotFound(format!("cache {name}")));
        }

        let scope = resolve_scope(&script.script_url, None)?;
        let runtime = CacheWorker::new(&script, Arc::clone(&self.caches), Arc::clone(&self.fetcher))?;
        let mut worker = ServiceWorker::new(script, runtime);
        for step in [
            LifecycleTransition::StartInstall,
            LifecycleTransition::InstallSucceeded,
            LifecycleTransition::StartActivation,
            LifecycleTransition::ActivationFinished,
        ] {
            worker.apply(step)?;
        }
        let id = worker.id;

        let mut registrations = self.registrations.write().await;
        let registration = registrations
            .entry(scope.to_string())
            .or_insert_with(|| ServiceWorkerRegistration::new(scope));
        if let Some(mut previous) = registration.active.replace(worker) {
            previous.apply(LifecycleTransition::Discard)?;
        }
        debug!(scope = %registration.scope, cache = %name, "Restored active worker");
        Ok(id)
    }

    /// Deliver a message from the page to a worker.
    ///
    /// `SKIP_WAITING` sent to the waiting worker activates it.
    pub async fn post_message(
        &self,
        worker_id: ServiceWorkerId,
        data: JsonValue,
    ) -> Result<(), ServiceWorkerError> {
        let (scope, worker, is_waiting) = {
            let registrations = self.registrations.read().await;
            registrations
                .iter()
                .find_map(|(scope, r)| {
                    r.worker(worker_id).map(|w| {
                        let is_waiting = r.waiting.as_ref().is_some_and(|w| w.id == worker_id);
                        (scope.clone(), w.clone(), is_waiting)
                    })
                })
                .ok_or_else(|| ServiceWorkerError::NotFound(format!("worker {}", worker_id.raw())))?
        };

        if worker.state.is_redundant() {
            return Err(ServiceWorkerError::StateError(
                "Cannot post message to redundant worker".to_string(),
            ));
        }

        match worker.runtime.handle_message(&data) {
            Some(WorkerMessage::SkipWaiting) if is_waiting => {
                self.activate_waiting(&scope).await?;
            }
            Some(WorkerMessage::SkipWaiting) => {
                debug!(worker = worker_id.raw(), "SKIP_WAITING ignored; worker is not waiting");
            }
            None => {}
        }
        Ok(())
    }

    /// Promote the waiting worker: activating → sweep → activated.
    async fn activate_waiting(&self, scope: &str) -> Result<(), ServiceWorkerError> {
        let mut worker = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            match registration.waiting.take() {
                Some(worker) => worker,
                None => return Ok(()),
            }
        };

        worker.apply(LifecycleTransition::StartActivation)?;
        self.emit(state_change(scope, &worker)).await;

        match worker.runtime.activate().await {
            Ok(deleted) => debug!(scope, deleted = deleted.len(), "Activation sweep done"),
            Err(e) => warn!(scope, error = %e, "Activation sweep failed"),
        }

        worker.apply(LifecycleTransition::ActivationFinished)?;

        let previous = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            registration.active.replace(worker.clone())
        };

        if let Some(mut old) = previous {
            old.apply(LifecycleTransition::Discard)?;
            self.emit(state_change(scope, &old)).await;
        }
        info!(scope, version = %worker.cache_name(), "Service worker activated");
        self.emit(state_change(scope, &worker)).await;

        let controller_changed = {
            let mut controller = self.controller.write().await;
            match controller.as_ref() {
                Some(current) if current.id != worker.id => {
                    *controller = Some(worker.clone());
                    true
                }
                _ => false,
            }
        };
        if controller_changed {
            self.emit(ServiceWorkerEvent::ControllerChange { worker_id: worker.id })
                .await;
        }

        Ok(())
    }

    /// Fetch on behalf of the page, through the controlling worker if any.
    pub async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let controller = self.controller.read().await.clone();
        let request = match controller {
            Some(worker) => match worker.runtime.handle_fetch(request).await {
                FetchDisposition::Responded(result) => return result,
                FetchDisposition::Passthrough(request) => request,
            },
            None => request,
        };
        self.fetcher.fetch(request).await
    }

    /// Get a snapshot of the registration for a scope.
    pub async fn registration(&self, scope: &str) -> Option<ServiceWorkerRegistration> {
        self.registrations.read().await.get(scope).cloned()
    }

    /// Get the scope of the registration covering a URL.
    pub async fn get_registration(&self, url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let registrations = self.registrations.read().await;
        registrations
            .values()
            .filter(|r| r.covers(&url))
            .max_by_key(|r| r.scope.as_str().len())
            .map(|r| r.scope.to_string())
    }

    /// Get all registration scopes.
    pub async fn get_registrations(&self) -> Vec<String> {
        let mut scopes: Vec<_> = self.registrations.read().await.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Wait until no worker has background revalidations in flight.
    pub async fn wait_idle(&self) {
        let runtimes: Vec<Arc<CacheWorker>> = {
            let registrations = self.registrations.read().await;
            registrations
                .values()
                .flat_map(|r| [&r.installing, &r.waiting, &r.active])
                .flatten()
                .map(|w| Arc::clone(&w.runtime))
                .collect()
        };
        for runtime in runtimes {
            runtime.wait_idle().await;
        }
        if let Some(controller) = self.controller().await {
            controller.runtime.wait_idle().await;
        }
    }

    /// Unregister a service worker.
    pub async fn unregister(&self, scope: &str) -> Result<bool, ServiceWorkerError> {
        let removed = self.registrations.write().await.remove(scope);
        let Some(registration) = removed else {
            return Ok(false);
        };
        for mut worker in [registration.installing, registration.waiting, registration.active]
            .into_iter()
            .flatten()
        {
            worker.apply(LifecycleTransition::Discard)?;
            self.emit(state_change(scope, &worker)).await;
        }
        info!(scope, "Service worker unregistered");
        Ok(true)
    }
}

fn state_change(scope: &str, worker: &ServiceWorker) -> ServiceWorkerEvent {
    ServiceWorkerEvent::StateChange {
        scope: scope.to_string(),
        worker_id: worker.id,
        state: worker.state,
    }
}

/// Scope is the script's directory unless given; it may not reach above it.
fn resolve_scope(script_url: &Url, scope: Option<&str>) -> Result<Url, ServiceWorkerError> {
    let max_scope = script_url
        .join("./")
        .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;

    let Some(scope) = scope else {
        return Ok(max_scope);
    };

    let scope = script_url
        .join(scope)
        .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
    if !scope.as_str().starts_with(max_scope.as_str()) {
        return Err(ServiceWorkerError::SecurityError(format!(
            "scope {scope} is outside the script directory {max_scope}"
        )));
    }
    Ok(scope)
}
