//! # PrayerKit Store
//!
//! Local persistence for the prayer tracker.
//!
//! ## Features
//!
//! - **KeyValueStore**: `get_item`, `set_item`, `remove_item`, `keys` over JSON
//!   values, optionally backed by a file
//! - **PrayerTracker**: month data, toggles and the annual overview
//!
//! ## Architecture
//!
//! ```text
//! PrayerTracker
//!     │
//!     └── KeyValueStore
//!             ├── items (key → JSON value)
//!             └── store file (JSON object, replaced atomically)
//! ```
//!
//! The store is never touched by the offline cache; the two only share a
//! data directory.

use std::io;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use prayerkit_common::PrayerKitError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace};

pub mod tracker;

pub use tracker::{date_label, DayRecord, MonthSummary, MonthView, Prayer, PrayerTracker, YearMonth};

/// Store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error("Corrupt store file {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

impl From<StoreError> for PrayerKitError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidDate(date) => PrayerKitError::InvalidArgument(date),
            other => PrayerKitError::storage_with_source("key-value store", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A key-value store of JSON values.
///
/// Every mutation is written through to the backing file when there is one.
#[derive(Debug)]
pub struct KeyValueStore {
    path: Option<PathBuf>,
    items: RwLock<HashMap<String, JsonValue>>,
}

impl KeyValueStore {
    /// Create a store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            items: RwLock::new(HashMap::new()),
        }
    }

    /// Open a file-backed store. A missing file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let items = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                serde_json::from_slice::<HashMap<String, JsonValue>>(&bytes).map_err(|e| {
                    StoreError::Corrupt {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    }
                })?
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), items = items.len(), "Opened store");

        Ok(Self {
            path: Some(path),
            items: RwLock::new(items),
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read and decode an item.
    pub async fn get_item<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let items = self.items.read().await;
        match items.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Store an item, replacing any previous value.
    pub async fn set_item<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let mut items = self.items.write().await;
        let mut staged = items.clone();
        staged.insert(key.to_string(), value);
        self.persist(&staged).await?;
        *items = staged;
        trace!(key, "set_item");
        Ok(())
    }

    /// Remove an item. Returns whether it existed.
    pub async fn remove_item(&self, key: &str) -> Result<bool> {
        let mut items = self.items.write().await;
        if !items.contains_key(key) {
            return Ok(false);
        }
        let mut staged = items.clone();
        staged.remove(key);
        self.persist(&staged).await?;
        *items = staged;
        trace!(key, "remove_item");
        Ok(true)
    }

    /// All keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.items.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Remove everything.
    pub async fn clear(&self) -> Result<()> {
        let mut items = self.items.write().await;
        self.persist(&HashMap::new()).await?;
        items.clear();
        Ok(())
    }

    /// Write `items` to the backing file. The in-memory map is only updated
    /// by callers once this succeeds.
    async fn persist(&self, items: &HashMap<String, JsonValue>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec(items)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        trace!(path = %path.display(), bytes = bytes.len(), "Store persisted");
        Ok(())
    }
}

impl Default for KeyValueStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
