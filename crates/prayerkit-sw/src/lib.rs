//! # PrayerKit Service Workers
//!
//! Offline support for the prayer tracker: a versioned cache worker, the host
//! that owns its lifecycle, and the page-side controller that turns a newly
//! installed version into a single user-approved reload.
//!
//! ## Features
//!
//! - **Install**: precache the asset manifest into a store named by the
//!   version tag, all-or-nothing
//! - **Fetch interception**: stale-while-revalidate for GET requests
//! - **Activation sweep**: delete every store that is not the current version
//! - **Update flow**: `updatefound` → `installed` → banner → `SKIP_WAITING` →
//!   `controllerchange` → one reload
//!
//! ## Architecture
//!
//! ```text
//! PageController ──register/post_message──► ServiceWorkerContainer
//!       ▲                                        │
//!       └──────── ServiceWorkerEvent (mpsc) ─────┤
//!                                                ├── ServiceWorkerRegistration
//!                                                │       ├── installing
//!                                                │       ├── waiting
//!                                                │       └── active ── CacheWorker
//!                                                │
//!                                                └── CacheStorage
//!                                                        └── Cache (RequestKey → CacheEntry)
//! ```

use prayerkit_common::PrayerKitError;
use prayerkit_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod container;
pub mod controller;
pub mod lifecycle;
pub mod manifest;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheStorage, RequestKey};
pub use container::{
    HostConfig, RegistrationOptions, ServiceWorker, ServiceWorkerContainer, ServiceWorkerEvent,
    ServiceWorkerId, ServiceWorkerRegistration,
};
pub use controller::{OfflineSupport, PageAction, PageController, PageUi, UpdateFlow};
pub use lifecycle::{LifecycleTransition, ServiceWorkerState};
pub use manifest::{AssetManifest, CacheName};
pub use worker::{CacheWorker, FetchDisposition, WorkerMessage, WorkerScript};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Service workers are not supported in this environment")]
    Unsupported,

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl From<ServiceWorkerError> for PrayerKitError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::Network(e) => e.into(),
            ServiceWorkerError::Io(e) => PrayerKitError::Io(e),
            ServiceWorkerError::NotFound(what) => PrayerKitError::NotFound(what),
            other => PrayerKitError::service_worker_with_source("service worker", other),
        }
    }
}
