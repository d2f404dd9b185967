//! Offline cache session: each CLI run behaves like one page load.
//!
//! Cache storage and the active worker's version survive between runs in the
//! data directory, the way a browser keeps its registrations.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use prayerkit_common::{PrayerKitError, Result};
use prayerkit_net::{DisconnectedFetcher, Fetcher, Request, ResourceLoader};
use prayerkit_sw::{
    CacheName, CacheStorage, OfflineSupport, PageAction, PageController, PageUi, ServiceWorkerContainer,
    UpdateFlow,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AppConfig;

/// Page UI for a terminal.
#[derive(Debug, Default)]
pub struct ConsoleUi {
    pub banner_shown: bool,
    pub reloads: usize,
}

impl PageUi for ConsoleUi {
    fn show_update_banner(&mut self) {
        self.banner_shown = true;
        println!("A new version is available. Run `prayerkit offline sync --apply` to update.");
    }

    fn reload(&mut self) {
        self.reloads += 1;
        println!("Updated to the new version.");
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionState {
    active_cache: Option<String>,
}

/// Outcome of `offline sync`.
#[derive(Debug)]
pub struct SyncReport {
    pub support: OfflineSupport,
    pub flow: UpdateFlow,
    pub actions: Vec<PageAction>,
    pub applied: bool,
    pub active_cache: Option<String>,
}

/// Outcome of `offline fetch`.
#[derive(Debug)]
pub struct FetchOutcome {
    pub url: String,
    pub status: u16,
    pub from_cache: bool,
    pub body: Bytes,
}

/// One cache store as shown by `offline status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
    pub name: String,
    pub entries: usize,
    pub active: bool,
}

pub struct OfflineSession {
    config: AppConfig,
    container: Arc<ServiceWorkerContainer>,
}

impl OfflineSession {
    /// Open a session that reaches the network.
    pub async fn online(config: AppConfig) -> Result<Self> {
        let loader = ResourceLoader::new(config.loader_config())?;
        Self::open(config, Arc::new(loader)).await
    }

    /// Open a session with the network unplugged.
    pub async fn offline(config: AppConfig) -> Result<Self> {
        Self::open(config, Arc::new(DisconnectedFetcher)).await
    }

    /// Restore cache storage and the previously active worker.
    pub async fn open(config: AppConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        let caches = CacheStorage::load(&config.caches_path()).await?;
        let container = Arc::new(ServiceWorkerContainer::new(
            config.host_config(),
            Arc::new(caches),
            fetcher,
        ));

        let state = read_state(&config.session_path()).await?;
        if let Some(name) = state.active_cache.as_deref().and_then(CacheName::parse) {
            let script = config.script_for(name.clone())?;
            match container.restore_active(script).await {
                Ok(_) => debug!(cache = %name, "Restored active worker"),
                Err(e) => warn!(cache = %name, error = %e, "Could not restore service worker"),
            }
        }

        Ok(Self { config, container })
    }

    async fn open_page(&self) -> Result<PageController<ConsoleUi>> {
        Ok(PageController::load(
            Arc::clone(&self.container),
            self.config.origin_url()?,
            self.config.script()?,
            ConsoleUi::default(),
        )
        .await)
    }

    /// Load the page, register the configured version and, with `apply`,
    /// accept a waiting update right away.
    pub async fn sync(&self, apply: bool) -> Result<SyncReport> {
        let mut page = self.open_page().await?;
        let support = page.register().await;
        let mut actions = page.process_pending().await;

        let mut applied = false;
        if apply && actions.contains(&PageAction::ShowUpdateBanner) {
            applied = page.apply_update().await?;
            actions.extend(page.process_pending().await);
        }

        self.persist().await?;
        let report = SyncReport {
            support,
            flow: page.flow(),
            actions,
            applied,
            active_cache: self.active_cache().await,
        };
        info!(support = ?report.support, flow = ?report.flow, applied, "Sync finished");
        Ok(report)
    }

    /// Fetch a URL (relative to the origin) as the page would.
    pub async fn fetch(&self, target: &str) -> Result<FetchOutcome> {
        let page = self.open_page().await?;
        let url = page.page_url().join(target).map_err(|e| {
            PrayerKitError::InvalidArgument(format!("{target}: {e}"))
        })?;
        let request = Request::get(url.clone()).referrer(page.page_url().clone());

        let result = page.fetch(request).await;
        self.container.wait_idle().await;
        self.persist().await?;

        let response = result?;
        Ok(FetchOutcome {
            url: url.to_string(),
            status: response.status.as_u16(),
            from_cache: response.from_cache,
            body: response.into_body(),
        })
    }

    /// Every cache store with its entry count.
    pub async fn status(&self) -> Vec<CacheStatus> {
        let active = self.active_cache().await;
        let caches = self.container.caches();
        let mut status = Vec::new();
        for name in caches.keys().await {
            let entries = match caches.get(&name).await {
                Some(cache) => cache.len().await,
                None => 0,
            };
            status.push(CacheStatus {
                active: active.as_deref() == Some(name.as_str()),
                name,
                entries,
            });
        }
        status
    }

    /// Store name of the active worker, if any.
    pub async fn active_cache(&self) -> Option<String> {
        let origin = self.config.origin_url().ok()?;
        let scope = self.container.get_registration(origin.as_str()).await?;
        let registration = self.container.registration(&scope).await?;
        registration.active.map(|w| w.cache_name().to_string())
    }

    async fn persist(&self) -> Result<()> {
        self.container
            .caches()
            .save(&self.config.caches_path())
            .await?;
        let state = SessionState {
            active_cache: self.active_cache().await,
        };
        write_state(&self.config.session_path(), &state).await
    }

    /// Forget all offline state.
    pub async fn clear(config: &AppConfig) -> Result<bool> {
        let mut removed = false;
        for path in [config.caches_path(), config.session_path()] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(removed, "Cleared offline state");
        Ok(removed)
    }
}

async fn read_state(path: &Path) -> Result<SessionState> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            PrayerKitError::storage_with_source(format!("invalid {}", path.display()), e)
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SessionState::default()),
        Err(e) => Err(e.into()),
    }
}

async fn write_state(path: &Path, state: &SessionState) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(state)
        .map_err(|e| PrayerKitError::storage_with_source("session state", e))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}
