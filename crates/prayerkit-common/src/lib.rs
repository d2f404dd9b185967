//! # PrayerKit Common
//!
//! Common utilities, error types, and logging configuration shared by the
//! PrayerKit crates.
//!
//! ## Features
//!
//! - Unified error type with a category per subsystem
//! - Logging configuration and setup
//! - Retry with exponential backoff (used by the service worker host to
//!   retry failed installs)

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, RetryConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Unified error type for PrayerKit.
#[derive(Error, Debug)]
pub enum PrayerKitError {
    /// Network-related errors.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Service worker and cache errors.
    #[error("Service worker error: {message}")]
    ServiceWorker {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Local key-value store errors.
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl PrayerKitError {
    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source.
    pub fn network_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a service worker error with source.
    pub fn service_worker_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::ServiceWorker {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error with source.
    pub fn storage_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            PrayerKitError::Network { .. } => "network",
            PrayerKitError::ServiceWorker { .. } => "service_worker",
            PrayerKitError::Storage { .. } => "storage",
            PrayerKitError::Config { .. } => "config",
            PrayerKitError::Io(_) => "io",
            PrayerKitError::Timeout(_) => "timeout",
            PrayerKitError::NotFound(_) => "not_found",
            PrayerKitError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

/// Result type alias for PrayerKit operations.
pub type Result<T> = std::result::Result<T, PrayerKitError>;
