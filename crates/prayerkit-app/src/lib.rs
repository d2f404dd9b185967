//! PrayerKit application library
//!
//! Configuration and the offline session used by the `prayerkit` binary.

pub mod config;
pub mod offline;

pub use config::AppConfig;
pub use offline::{CacheStatus, ConsoleUi, FetchOutcome, OfflineSession, SyncReport};
