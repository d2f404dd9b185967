//! Prayer tracker model: five daily prayers per calendar day, stored per month.
//!
//! Month data lives under `prayerTrackerData_<year>_<monthIndex>` (month index
//! 0-based) as an object mapping a long date label such as
//! `"October 18, 2026"` to five booleans in prayer order.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Datelike, Month, NaiveDate};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{KeyValueStore, Result, StoreError};

/// The five daily prayers, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Prayer {
    Fajr,
    Zuhr,
    Asr,
    Maghrib,
    Isha,
}

impl Prayer {
    pub const ALL: [Prayer; 5] = [
        Prayer::Fajr,
        Prayer::Zuhr,
        Prayer::Asr,
        Prayer::Maghrib,
        Prayer::Isha,
    ];

    /// Position in a day's record.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Prayer::Fajr => "Fajr",
            Prayer::Zuhr => "Zuhr",
            Prayer::Asr => "Asr",
            Prayer::Maghrib => "Maghrib",
            Prayer::Isha => "Isha",
        }
    }
}

impl fmt::Display for Prayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Prayer {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Prayer::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown prayer '{s}' (expected fajr, zuhr, asr, maghrib or isha)"))
    }
}

/// Long en-US date label used as the day key.
pub fn date_label(date: NaiveDate) -> String {
    date.format("%B %-d, %Y").to_string()
}

/// A calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    year: i32,
    /// 1..=12
    month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(StoreError::InvalidDate(format!("month {month} of {year}")));
        }
        Ok(Self { year, month })
    }

    /// The month containing `date`.
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    /// Month number, 1-based.
    pub fn month(&self) -> u32 {
        self.month
    }

    /// Month index, 0-based.
    pub fn month_index(&self) -> u32 {
        self.month - 1
    }

    pub fn storage_key(&self) -> String {
        format!("prayerTrackerData_{}_{}", self.year, self.month_index())
    }

    pub fn month_name(&self) -> &'static str {
        u8::try_from(self.month)
            .ok()
            .and_then(|m| Month::try_from(m).ok())
            .map(|m| m.name())
            .unwrap_or_default()
    }

    pub fn first_day(&self) -> Result<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .ok_or_else(|| StoreError::InvalidDate(self.to_string()))
    }

    /// Every day of the month in calendar order.
    pub fn days(&self) -> Result<Vec<NaiveDate>> {
        let first = self.first_day()?;
        Ok(first
            .iter_days()
            .take_while(|d| d.month() == self.month)
            .collect())
    }

    /// Move by a number of months, crossing year boundaries.
    pub fn offset(self, months: i32) -> Result<Self> {
        let total = self
            .year
            .checked_mul(12)
            .and_then(|m| m.checked_add(self.month as i32 - 1))
            .and_then(|m| m.checked_add(months))
            .ok_or_else(|| StoreError::InvalidDate(format!("{self} moved by {months} months")))?;
        Ok(Self {
            year: total.div_euclid(12),
            month: total.rem_euclid(12) as u32 + 1,
        })
    }

    pub fn previous(self) -> Result<Self> {
        self.offset(-1)
    }

    pub fn next(self) -> Result<Self> {
        self.offset(1)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.month_name(), self.year)
    }
}

/// One day of a loaded month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayRecord {
    pub date: NaiveDate,
    pub label: String,
    pub prayers: Vec<bool>,
    pub is_today: bool,
}

impl DayRecord {
    pub fn is_done(&self, prayer: Prayer) -> bool {
        self.prayers.get(prayer.index()).copied().unwrap_or(false)
    }

    pub fn completed(&self) -> usize {
        self.prayers.iter().filter(|done| **done).count()
    }
}

/// A month with every day filled in.
#[derive(Debug, Clone)]
pub struct MonthView {
    pub month: YearMonth,
    pub days: Vec<DayRecord>,
}

impl MonthView {
    pub fn today(&self) -> Option<&DayRecord> {
        self.days.iter().find(|d| d.is_today)
    }
}

/// Completion for one month of the annual overview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthSummary {
    pub month: YearMonth,
    pub completed: usize,
    pub total: usize,
}

impl MonthSummary {
    /// Rounded completion percentage; 0 for a month with no entries.
    pub fn percentage(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        (self.completed as f64 / self.total as f64 * 100.0).round() as u32
    }
}

type MonthData = HashMap<String, Vec<bool>>;

fn empty_day() -> Vec<bool> {
    vec![false; Prayer::ALL.len()]
}

/// Tracker over a key-value store.
#[derive(Debug, Clone)]
pub struct PrayerTracker {
    store: Arc<KeyValueStore>,
}

impl PrayerTracker {
    pub fn new(store: Arc<KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<KeyValueStore> {
        &self.store
    }

    async fn read_month(&self, month: YearMonth) -> Result<MonthData> {
        Ok(self
            .store
            .get_item::<MonthData>(&month.storage_key())
            .await?
            .unwrap_or_default())
    }

    /// Load a month, filling in and persisting any missing days.
    pub async fn load_month(&self, month: YearMonth, today: NaiveDate) -> Result<MonthView> {
        let key = month.storage_key();
        let mut data = self.read_month(month).await?;
        let stored = data.len();

        let mut days = Vec::new();
        for date in month.days()? {
            let label = date_label(date);
            let prayers = data.entry(label.clone()).or_insert_with(empty_day).clone();
            days.push(DayRecord {
                date,
                label,
                prayers,
                is_today: date == today,
            });
        }

        self.store.set_item(&key, &data).await?;
        debug!(%key, days = days.len(), added = data.len() - stored, "Loaded month");
        Ok(MonthView { month, days })
    }

    /// Flip one prayer for a day and persist. Returns the new value.
    pub async fn toggle(&self, date: NaiveDate, prayer: Prayer) -> Result<bool> {
        let month = YearMonth::of(date);
        let mut data = self.read_month(month).await?;

        let day = data.entry(date_label(date)).or_insert_with(empty_day);
        if day.len() < Prayer::ALL.len() {
            day.resize(Prayer::ALL.len(), false);
        }
        let done = !day[prayer.index()];
        day[prayer.index()] = done;

        self.store.set_item(&month.storage_key(), &data).await?;
        info!(date = %date, %prayer, done, "Toggled prayer");
        Ok(done)
    }

    /// Completion per month of `year`, over whatever days are stored.
    pub async fn annual_overview(&self, year: i32) -> Result<Vec<MonthSummary>> {
        let mut summaries = Vec::with_capacity(12);
        for m in 1..=12 {
            let month = YearMonth::new(year, m)?;
            let data = self.read_month(month).await?;
            let total = data.values().map(Vec::len).sum();
            let completed = data.values().flatten().filter(|done| **done).count();
            summaries.push(MonthSummary {
                month,
                completed,
                total,
            });
        }
        Ok(summaries)
    }
}
