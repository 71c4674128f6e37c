use chrono::NaiveTime;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Buffer configuration, loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub capacity: CapacitySettings,
    #[serde(default)]
    pub deletion: DeletionSettings,
    #[serde(default)]
    pub forwarding: ForwardingSettings,
}

fn default_database_url() -> String {
    "sqlite://edgebuf.db".to_string()
}

/// Bound on the number of stored records.
#[derive(Debug, Clone, Deserialize)]
pub struct CapacitySettings {
    #[serde(default)]
    pub unlimited: bool,
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
    /// Evict the oldest record when full; otherwise the newest.
    #[serde(default = "default_oldest_first")]
    pub oldest_first: bool,
}

fn default_max_samples() -> usize {
    10_000
}

fn default_oldest_first() -> bool {
    true
}

impl Default for CapacitySettings {
    fn default() -> Self {
        Self {
            unlimited: false,
            max_samples: default_max_samples(),
            oldest_first: default_oldest_first(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMethod {
    AfterDays,
    AfterSent,
}

/// What the retention sweeper removes.
#[derive(Debug, Clone, Deserialize)]
pub struct DeletionSettings {
    #[serde(default = "default_delete_method")]
    pub method: DeleteMethod,
    #[serde(default = "default_after_days")]
    pub after_days: u32,
}

fn default_delete_method() -> DeleteMethod {
    DeleteMethod::AfterSent
}

fn default_after_days() -> u32 {
    7
}

impl Default for DeletionSettings {
    fn default() -> Self {
        Self {
            method: default_delete_method(),
            after_days: default_after_days(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardMethod {
    #[default]
    None,
    OnChange,
    TimeWindow,
}

/// Pre-transmission filtering policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardingSettings {
    #[serde(default)]
    pub method: ForwardMethod,
    #[serde(default = "default_time_start", deserialize_with = "deserialize_time")]
    pub time_start: NaiveTime,
    #[serde(default = "default_time_end", deserialize_with = "deserialize_time")]
    pub time_end: NaiveTime,
}

fn default_time_start() -> NaiveTime {
    NaiveTime::default()
}

fn default_time_end() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default()
}

impl Default for ForwardingSettings {
    fn default() -> Self {
        Self {
            method: ForwardMethod::None,
            time_start: default_time_start(),
            time_end: default_time_end(),
        }
    }
}

/// Parse a `HH:MM:SS` time of day.
pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M:%S").ok()
}

fn deserialize_time<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_time_of_day(&s)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid time {:?}, expected HH:MM:SS", s)))
}

impl Config {
    /// Load configuration from environment variables.
    /// EDGEBUF_DATABASE_URL defaults to "sqlite://edgebuf.db"
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env_or("EDGEBUF_DATABASE_URL", default_database_url());

        let capacity = CapacitySettings {
            unlimited: parse_env("EDGEBUF_UNLIMITED", false, parse_bool, "must be true or false")?,
            max_samples: parse_env(
                "EDGEBUF_MAX_SAMPLES",
                default_max_samples(),
                |s| s.parse().ok(),
                "must be a non-negative integer",
            )?,
            oldest_first: parse_env(
                "EDGEBUF_OLDEST_FIRST",
                default_oldest_first(),
                parse_bool,
                "must be true or false",
            )?,
        };

        let deletion = DeletionSettings {
            method: parse_env(
                "EDGEBUF_DELETE_METHOD",
                default_delete_method(),
                |s| match s {
                    "after_days" => Some(DeleteMethod::AfterDays),
                    "after_sent" => Some(DeleteMethod::AfterSent),
                    _ => None,
                },
                "must be after_days or after_sent",
            )?,
            after_days: parse_env(
                "EDGEBUF_AFTER_DAYS",
                default_after_days(),
                |s| s.parse().ok(),
                "must be a non-negative integer",
            )?,
        };

        let forwarding = ForwardingSettings {
            method: parse_env(
                "EDGEBUF_FORWARD_METHOD",
                ForwardMethod::None,
                |s| match s {
                    "none" | "" => Some(ForwardMethod::None),
                    "on_change" => Some(ForwardMethod::OnChange),
                    "time_window" => Some(ForwardMethod::TimeWindow),
                    _ => None,
                },
                "must be none, on_change or time_window",
            )?,
            time_start: parse_env(
                "EDGEBUF_TIME_START",
                default_time_start(),
                parse_time_of_day,
                "must be HH:MM:SS",
            )?,
            time_end: parse_env(
                "EDGEBUF_TIME_END",
                default_time_end(),
                parse_time_of_day,
                "must be HH:MM:SS",
            )?,
        };

        Ok(Config {
            database_url,
            capacity,
            deletion,
            forwarding,
        })
    }

    /// Configuration backed by the given database, everything else default.
    pub fn with_database(database_url: impl Into<String>) -> Self {
        Config {
            database_url: database_url.into(),
            capacity: CapacitySettings::default(),
            deletion: DeletionSettings::default(),
            forwarding: ForwardingSettings::default(),
        }
    }
}

fn env_or(var: &str, default: String) -> String {
    std::env::var(var).unwrap_or(default)
}

fn parse_env<T>(
    var: &'static str,
    default: T,
    parse: impl Fn(&str) -> Option<T>,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => parse(raw.trim()).ok_or(ConfigError::Invalid(var, reason)),
        Err(_) => Ok(default),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
