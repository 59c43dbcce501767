//! Runtime settings and course catalog loading from config.toml
//!
//! The configuration file has an optional `[settings]` table with tunables for
//! the payment gateway and retry behaviour, and a list of `[[courses]]` used to seed
//! the catalog on first run.

use crate::core::course::{NewCourse, ScheduleSlot};
use crate::errors::{Error, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Configuration structure representing the entire config.toml file
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    /// Courses to seed when missing from the database
    #[serde(default)]
    pub courses: Vec<CourseConfig>,
}

/// Service tunables
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Upper bound on a single gateway charge
    pub gateway_timeout_ms: u64,
    /// Currency assumed when a settlement does not name one
    pub default_currency: String,
    /// Attempts per transaction when the store reports a transient fault
    pub retry_attempts: u32,
    /// Delay before the first retry; doubles on each further attempt
    pub retry_backoff_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gateway_timeout_ms: 10_000,
            default_currency: "PEN".to_string(),
            retry_attempts: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl Settings {
    #[must_use]
    pub const fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Configuration for a single seeded course
#[derive(Debug, Deserialize, Clone)]
pub struct CourseConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub capacity: i32,
    pub price_cents: i64,
    pub currency: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub schedule: Vec<ScheduleSlot>,
}

const fn default_active() -> bool {
    true
}

impl CourseConfig {
    /// Converts the file entry into a catalog insert, filling the currency from settings.
    #[must_use]
    pub fn to_new_course(&self, settings: &Settings) -> NewCourse {
        NewCourse {
            name: self.name.clone(),
            description: self.description.clone(),
            capacity: self.capacity,
            price_cents: self.price_cents,
            currency: self
                .currency
                .clone()
                .unwrap_or_else(|| settings.default_currency.clone()),
            start_date: self.start_date,
            end_date: self.end_date,
            is_active: self.active,
            schedule: self.schedule.clone(),
        }
    }
}

/// Loads configuration from a TOML file
///
/// # Errors
/// Returns an error if:
/// - The file cannot be read
/// - The TOML syntax is invalid
/// - Required fields are missing
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Config {
        message: format!("Failed to read config file: {e}"),
    })?;

    toml::from_str(&contents).map_err(|e| Error::Config {
        message: format!("Failed to parse config.toml: {e}"),
    })
}

/// Loads configuration from `ACADEMY_CONFIG` or `./config.toml`.
///
/// A missing file is not an error: defaults are used and nothing is seeded.
pub fn load_default_config() -> Result<Config> {
    let path = std::env::var("ACADEMY_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    if Path::new(&path).exists() {
        load_config(&path)
    } else {
        tracing::info!(path = %path, "No configuration file found, using defaults");
        Ok(Config::default())
    }
}
