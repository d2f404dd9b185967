//! Version tags and the asset manifest.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::ServiceWorkerError;

/// Name of a cache store: a fixed prefix plus the version tag.
///
/// Bumping the version is the only way to force a refresh of the precached
/// assets and to start the update flow on open pages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheName {
    prefix: String,
    version: String,
}

impl CacheName {
    pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            version: version.into(),
        }
    }

    /// Split a store name such as `prayer-tracker-cache-v1` at its last `-`.
    pub fn parse(name: &str) -> Option<Self> {
        let (prefix, version) = name.rsplit_once('-')?;
        if prefix.is_empty() || version.is_empty() {
            return None;
        }
        Some(Self::new(prefix, version))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.prefix, self.version)
    }
}

/// Ordered list of URLs that must be cached for the app to work offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetManifest(Vec<String>);

impl AssetManifest {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(entries.into_iter().map(Into::into).collect())
    }

    /// The prayer tracker shell and its third-party dependencies.
    pub fn prayer_tracker() -> Self {
        Self::new([
            "./",
            "./index.html",
            "./manifest.json",
            "https://cdn.jsdelivr.net/npm/localforage@1.10.0/dist/localforage.min.js",
            "https://cdn.tailwindcss.com/3.4.3",
            "https://fonts.googleapis.com/css2?family=Inter:wght@400;500;600;700&display=swap",
        ])
    }

    pub fn entries(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Resolve every entry against `base`, dropping later duplicates.
    pub fn resolve(&self, base: &Url) -> Result<Vec<Url>, ServiceWorkerError> {
        let mut urls: Vec<Url> = Vec::with_capacity(self.0.len());
        for entry in &self.0 {
            let mut url = base.join(entry).map_err(|e| {
                ServiceWorkerError::RegistrationFailed(format!(
                    "invalid manifest entry {entry:?}: {e}"
                ))
            })?;
            url.set_fragment(None);
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        Ok(urls)
    }
}

impl Default for AssetManifest {
    fn default() -> Self {
        Self::prayer_tracker()
    }
}
