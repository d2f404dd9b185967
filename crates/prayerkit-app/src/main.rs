//! PrayerKit command line.
//!
//! ## Usage
//!
//! ```bash
//! # Show the current month
//! prayerkit month
//!
//! # Mark Asr as prayed today
//! prayerkit toggle asr
//!
//! # Completion per month
//! prayerkit year --year 2026
//!
//! # Install the offline cache, or update it and switch right away
//! prayerkit offline sync --apply
//!
//! # Read an asset with the network unplugged
//! prayerkit offline fetch ./index.html --offline
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, Local, NaiveDate};
use clap::{Parser, Subcommand};
use prayerkit_app::{AppConfig, OfflineSession};
use prayerkit_common::init_logging;
use prayerkit_store::{date_label, KeyValueStore, MonthView, Prayer, PrayerTracker, YearMonth};
use prayerkit_sw::{OfflineSupport, UpdateFlow};
use tracing::debug;

#[derive(Parser)]
#[command(name = "prayerkit", version)]
#[command(about = "Track the five daily prayers, online or offline")]
struct Cli {
    /// Config file (defaults to config.json in the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory override
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Origin the app is served from
    #[arg(long, global = true)]
    origin: Option<String>,

    /// More logging (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log format: pretty, compact or json
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a month
    Month {
        /// Year (defaults to this year)
        #[arg(long)]
        year: Option<i32>,
        /// Month 1-12 (defaults to this month)
        #[arg(long)]
        month: Option<u32>,
        /// Months to move from the selected one
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        offset: i32,
    },

    /// Toggle one prayer for a day
    Toggle {
        /// fajr, zuhr, asr, maghrib or isha
        prayer: Prayer,
        /// Day as YYYY-MM-DD (defaults to today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Annual overview
    Year {
        /// Year (defaults to this year)
        #[arg(long)]
        year: Option<i32>,
    },

    /// Offline cache
    Offline {
        #[command(subcommand)]
        command: OfflineCommands,
    },
}

#[derive(Subcommand)]
enum OfflineCommands {
    /// Install or update the offline cache
    Sync {
        /// Switch to a newly installed version immediately
        #[arg(long)]
        apply: bool,
    },

    /// Fetch a URL through the cache
    Fetch {
        /// URL, absolute or relative to the origin
        url: String,
        /// Pretend the network is down
        #[arg(long)]
        offline: bool,
        /// Print the body
        #[arg(long)]
        body: bool,
    },

    /// List cache stores
    Status,

    /// Delete all offline state
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(origin) = cli.origin {
        config.origin = origin;
    }
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }
    init_logging(config.log_config(cli.verbose));
    debug!(data_dir = %config.data_dir.display(), origin = %config.origin, "Starting");

    let today = Local::now().date_naive();

    match cli.command {
        Commands::Month {
            year,
            month,
            offset,
        } => {
            let selected = YearMonth::new(
                year.unwrap_or(today.year()),
                month.unwrap_or(today.month()),
            )?
            .offset(offset)?;
            let tracker = open_tracker(&config).await?;
            let view = tracker.load_month(selected, today).await?;
            print_month(&view);
        }
        Commands::Toggle { prayer, date } => {
            let date = date.unwrap_or(today);
            let tracker = open_tracker(&config).await?;
            let done = tracker.toggle(date, prayer).await?;
            let mark = if done { "prayed" } else { "not prayed" };
            println!("{prayer} on {}: {mark}", date_label(date));
        }
        Commands::Year { year } => {
            let year = year.unwrap_or(today.year());
            let tracker = open_tracker(&config).await?;
            println!("Annual Overview - {year}");
            for summary in tracker.annual_overview(year).await? {
                let pct = summary.percentage();
                let filled = (pct / 5) as usize;
                println!(
                    "{:<10} {:>3}% Completed [{}{}]",
                    summary.month.month_name(),
                    pct,
                    "#".repeat(filled),
                    "-".repeat(20 - filled)
                );
            }
        }
        Commands::Offline { command } => run_offline(config, command).await?,
    }

    Ok(())
}

async fn open_tracker(config: &AppConfig) -> Result<PrayerTracker> {
    let store = KeyValueStore::open(config.store_path())
        .await
        .with_context(|| format!("failed to open {}", config.store_path().display()))?;
    Ok(PrayerTracker::new(Arc::new(store)))
}

fn print_month(view: &MonthView) {
    println!("{}", view.month);
    print!("{:<12}", "");
    for prayer in Prayer::ALL {
        print!("{:<9}", prayer.name());
    }
    println!();

    for day in &view.days {
        let marker = if day.is_today { '*' } else { ' ' };
        print!("{marker}{:>2} {:<8}", day.date.day(), day.date.format("%a").to_string());
        for prayer in Prayer::ALL {
            print!("{:<9}", if day.is_done(prayer) { "[x]" } else { "[ ]" });
        }
        println!();
    }
}

async fn run_offline(config: AppConfig, command: OfflineCommands) -> Result<()> {
    match command {
        OfflineCommands::Sync { apply } => {
            let wanted = config.cache_name().to_string();
            let session = OfflineSession::online(config).await?;
            let report = session.sync(apply).await?;
            let current = report.active_cache.as_deref() == Some(wanted.as_str());
            match (report.support, report.flow) {
                (OfflineSupport::Unavailable, _) => {
                    println!("Offline support unavailable; the app works online only.")
                }
                (_, UpdateFlow::Waiting) => println!("Update installed and waiting."),
                (_, UpdateFlow::Reloading) => {}
                _ if !current => println!("Could not install {wanted}; keeping the current version."),
                _ => println!("Offline cache is up to date."),
            }
            if let Some(active) = report.active_cache {
                println!("Active cache: {active}");
            }
        }
        OfflineCommands::Fetch {
            url,
            offline,
            body,
        } => {
            let session = if offline {
                OfflineSession::offline(config).await?
            } else {
                OfflineSession::online(config).await?
            };
            let outcome = session.fetch(&url).await?;
            let source = if outcome.from_cache { "cache" } else { "network" };
            println!(
                "{} {} ({} bytes from {source})",
                outcome.status,
                outcome.url,
                outcome.body.len()
            );
            if body {
                println!("{}", String::from_utf8_lossy(&outcome.body));
            }
        }
        OfflineCommands::Status => {
            let session = OfflineSession::offline(config).await?;
            let status = session.status().await;
            if status.is_empty() {
                println!("No cache stores.");
            }
            for cache in status {
                let active = if cache.active { " (active)" } else { "" };
                println!("{}: {} entries{active}", cache.name, cache.entries);
            }
        }
        OfflineCommands::Clear => {
            if OfflineSession::clear(&config).await? {
                println!("Offline state cleared.");
            } else {
                println!("Nothing to clear.");
            }
        }
    }
    Ok(())
}
