//! Application configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use prayerkit_common::{LogConfig, LogFormat, PrayerKitError, Result, RetryConfig};
use prayerkit_net::LoaderConfig;
use prayerkit_sw::{AssetManifest, CacheName, HostConfig, WorkerScript};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding the tracker store and the offline cache snapshot
    pub data_dir: PathBuf,

    /// Where the app is served from
    pub origin: String,

    /// Worker script, relative to the origin
    pub worker_script: String,

    /// Offline cache settings
    pub offline: OfflineConfig,

    /// Network settings
    pub network: NetworkConfig,

    /// Log settings
    pub log: LogSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Register the service worker at all
    pub enabled: bool,

    /// Cache store name prefix
    pub cache_prefix: String,

    /// Version tag; bump it to ship new assets
    pub cache_version: String,

    /// Assets precached on install
    pub manifest: AssetManifest,

    /// Install attempts before the worker is abandoned
    pub install_attempts: u32,

    /// Delay before the first install retry, in milliseconds
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// User agent override
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `pretty`, `compact` or `json`
    pub format: String,

    /// Extra `EnvFilter` directives
    pub filter: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("prayerkit"),
            origin: "http://localhost:8080/".to_string(),
            worker_script: "./sw.js".to_string(),
            offline: OfflineConfig::default(),
            network: NetworkConfig::default(),
            log: LogSettings::default(),
        }
    }
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_prefix: "prayer-tracker-cache".to_string(),
            cache_version: "v1".to_string(),
            manifest: AssetManifest::prayer_tracker(),
            install_attempts: 3,
            retry_delay_ms: 500,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: None,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            format: "compact".to_string(),
            filter: None,
        }
    }
}

impl AppConfig {
    /// `config.json` in the user's config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("prayerkit").join("config.json"))
    }

    /// Load from `path`, or from the default location. A missing file gives
    /// the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => return Ok(Self::default()),
        };

        match std::fs::read(&path) {
            Ok(bytes) => {
                let config = serde_json::from_slice(&bytes).map_err(|e| {
                    PrayerKitError::config_with_source(format!("invalid {}", path.display()), e)
                })?;
                debug!(path = %path.display(), "Loaded config");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file; using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("tracker.json")
    }

    pub fn caches_path(&self) -> PathBuf {
        self.data_dir.join("caches.json")
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }

    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin)
            .map_err(|e| PrayerKitError::config_with_source(format!("invalid origin {}", self.origin), e))
    }

    pub fn cache_name(&self) -> CacheName {
        CacheName::new(&self.offline.cache_prefix, &self.offline.cache_version)
    }

    /// The worker script for the configured version.
    pub fn script(&self) -> Result<WorkerScript> {
        self.script_for(self.cache_name())
    }

    pub fn script_for(&self, cache_name: CacheName) -> Result<WorkerScript> {
        let script_url = self.origin_url()?.join(&self.worker_script).map_err(|e| {
            PrayerKitError::config_with_source(format!("invalid worker script {}", self.worker_script), e)
        })?;
        Ok(WorkerScript::new(
            script_url,
            cache_name,
            self.offline.manifest.clone(),
        ))
    }

    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            enabled: self.offline.enabled,
            install_retry: RetryConfig::new(
                self.offline.install_attempts,
                Duration::from_millis(self.offline.retry_delay_ms),
            ),
        }
    }

    pub fn loader_config(&self) -> LoaderConfig {
        let mut config = LoaderConfig {
            default_timeout: Duration::from_secs(self.network.timeout_secs),
            ..LoaderConfig::default()
        };
        if let Some(agent) = &self.network.user_agent {
            config.user_agent = agent.clone();
        }
        config
    }

    /// Log setup for a `-v` count. Unknown formats fall back to compact.
    pub fn log_config(&self, verbosity: u8) -> LogConfig {
        let format = self.log.format.parse().unwrap_or(LogFormat::Compact);
        let config = LogConfig::from_verbosity(verbosity).with_format(format);
        match &self.log.filter {
            Some(filter) => config.with_filter(filter.clone()),
            None => config,
        }
    }
}
