use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::parse_timezone;
use crate::error::{CoreError, Result};
use crate::types::TimeOfDay;

pub const DEFAULT_TIMEZONE: &str = "America/Bogota";
pub const DEFAULT_LEAD_MINUTES: u32 = 30;
pub const MIN_LEAD_MINUTES: u32 = 5;
pub const MAX_LEAD_MINUTES: u32 = 120;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_DELIVERY_TIMEOUT_SECS: u64 = 30;

/// Top-level config (entrena.toml + ENTRENA_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// IANA timezone all weekly times are interpreted in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub reminders: ReminderConfig,
    #[serde(default)]
    pub reports: ReportConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            reminders: ReminderConfig::default(),
            reports: ReportConfig::default(),
            scheduler: SchedulerConfig::default(),
            database: DatabaseConfig::default(),
            channels: ChannelsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderConfig {
    /// Minutes before the session the reminder is sent.
    #[serde(default = "default_lead_minutes")]
    pub lead_minutes: u32,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            lead_minutes: DEFAULT_LEAD_MINUTES,
        }
    }
}

/// Trainer's weekly broadcast to all active students.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// 0 = Monday … 6 = Sunday.
    #[serde(default = "default_report_weekday")]
    pub weekday: u8,
    #[serde(default = "default_report_time")]
    pub time: TimeOfDay,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weekday: default_report_weekday(),
            time: default_report_time(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on how long the worker sleeps between store scans.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a worker waits for the messaging channel before giving up.
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
    /// When set, runs later than this are skipped instead of caught up.
    #[serde(default)]
    pub misfire_grace_secs: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            delivery_timeout_secs: DEFAULT_DELIVERY_TIMEOUT_SECS,
            misfire_grace_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Telegram user id of the trainer; always allowed to use bot commands.
    pub trainer_id: Option<i64>,
    /// Extra usernames or numeric ids allowed to use bot commands.
    #[serde(default)]
    pub allow_users: Vec<String>,
}

fn bool_true() -> bool {
    true
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_lead_minutes() -> u32 {
    DEFAULT_LEAD_MINUTES
}
fn default_report_weekday() -> u8 {
    6
}
fn default_report_time() -> TimeOfDay {
    // 20:00 is always in range
    TimeOfDay::new(20, 0).unwrap_or(TimeOfDay::MIDNIGHT)
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_delivery_timeout_secs() -> u64 {
    DEFAULT_DELIVERY_TIMEOUT_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.entrena/entrena.db", home)
}

impl TrainerConfig {
    /// Load config from a TOML file with ENTRENA_* env var overrides.
    ///
    /// Nested keys use a double underscore: `ENTRENA_REMINDERS__LEAD_MINUTES=15`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        if std::path::Path::new(&path).exists() {
            debug!(path = %path, "loading configuration file");
        } else {
            info!(path = %path, "no configuration file, using defaults and environment");
        }

        let config: TrainerConfig = Figment::from(Serialized::defaults(TrainerConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("ENTRENA_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        if let Err(e) = config.validate() {
            warn!(path = %path, error = %e, "configuration failed validation");
            return Err(e);
        }
        info!(
            timezone = %config.timezone,
            lead_minutes = config.reminders.lead_minutes,
            database = %config.database.path,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        parse_timezone(&self.timezone)?;
        let lead = self.reminders.lead_minutes;
        if !(MIN_LEAD_MINUTES..=MAX_LEAD_MINUTES).contains(&lead) {
            return Err(CoreError::Config(format!(
                "reminders.lead_minutes must be between {MIN_LEAD_MINUTES} and {MAX_LEAD_MINUTES}, got {lead}"
            )));
        }
        if self.reports.weekday > 6 {
            return Err(CoreError::InvalidWeekday(self.reports.weekday));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(CoreError::Config(
                "scheduler.poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.entrena/entrena.toml", home)
}
