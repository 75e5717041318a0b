//! Configuration file support for Medrem.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/medrem/config.toml`.

use crate::{Channel, Error, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub reminders: ReminderConfig,

    #[serde(default)]
    pub escalation: EscalationConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Obligation generation and resolution
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// How far ahead obligations are materialized
    #[serde(default = "default_horizon_hours")]
    pub horizon_hours: u32,

    /// Minutes after the scheduled time before an open dose is Missed
    #[serde(default = "default_grace_minutes")]
    pub grace_minutes: u32,

    /// Tolerance for counting a Taken dose as on time
    #[serde(default = "default_on_time_minutes")]
    pub on_time_minutes: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            horizon_hours: default_horizon_hours(),
            grace_minutes: default_grace_minutes(),
            on_time_minutes: default_on_time_minutes(),
        }
    }
}

/// Reminder cadence and delivery
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReminderConfig {
    /// Minutes after the scheduled time at which each attempt fires
    #[serde(default = "default_offsets")]
    pub offsets_minutes: Vec<u32>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Transport-level retries within a single attempt
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,

    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_secs: u64,

    /// Minutes after the last attempt before escalating
    #[serde(default = "default_escalate_after")]
    pub escalate_after_minutes: u32,

    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            offsets_minutes: default_offsets(),
            max_attempts: default_max_attempts(),
            transport_retries: default_transport_retries(),
            delivery_timeout_secs: default_delivery_timeout(),
            escalate_after_minutes: default_escalate_after(),
            tick_seconds: default_tick_seconds(),
        }
    }
}

/// Where escalations go when a prescription lists no emergency contacts
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct EscalationConfig {
    #[serde(default)]
    pub default_contacts: Vec<String>,

    #[serde(default)]
    pub channel: Channel,
}

/// Reminder settings resolved into durations
#[derive(Clone, Debug)]
pub struct ReminderPolicy {
    pub offsets: Vec<Duration>,
    pub max_attempts: u32,
    pub transport_retries: u32,
    pub delivery_timeout: std::time::Duration,
    pub escalate_after: Duration,
    pub escalation_contacts: Vec<String>,
    pub escalation_channel: Channel,
}

impl ReminderPolicy {
    /// When attempt `n` (1-based) fires for a dose scheduled at `scheduled`
    pub fn fire_at(
        &self,
        scheduled: chrono::DateTime<chrono::Utc>,
        n: u32,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        if n == 0 || n > self.max_attempts {
            return None;
        }
        self.offsets.get(n as usize - 1).map(|offset| scheduled + *offset)
    }
}

// Default value functions
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| home_dir().join(".local/share"));
    base.join("medrem")
}

fn default_horizon_hours() -> u32 {
    48
}

fn default_grace_minutes() -> u32 {
    60
}

fn default_on_time_minutes() -> u32 {
    30
}

fn default_offsets() -> Vec<u32> {
    vec![0, 15, 45]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_transport_retries() -> u32 {
    2
}

fn default_delivery_timeout() -> u64 {
    10
}

fn default_escalate_after() -> u32 {
    15
}

fn default_tick_seconds() -> u64 {
    30
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load and validate configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| home_dir().join(".config"));
        base.join("medrem").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject settings the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        let r = &self.reminders;
        if r.offsets_minutes.is_empty() {
            return Err(Error::Config("reminders.offsets_minutes is empty".into()));
        }
        if r.offsets_minutes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Config(
                "reminders.offsets_minutes must be strictly increasing".into(),
            ));
        }
        if r.max_attempts == 0 || r.max_attempts as usize > r.offsets_minutes.len() {
            return Err(Error::Config(format!(
                "reminders.max_attempts must be between 1 and {}",
                r.offsets_minutes.len()
            )));
        }
        if r.delivery_timeout_secs == 0 {
            return Err(Error::Config("reminders.delivery_timeout_secs is zero".into()));
        }
        if r.tick_seconds == 0 {
            return Err(Error::Config("reminders.tick_seconds is zero".into()));
        }
        if self.schedule.grace_minutes == 0 {
            return Err(Error::Config("schedule.grace_minutes is zero".into()));
        }
        if self.schedule.horizon_hours == 0 {
            return Err(Error::Config("schedule.horizon_hours is zero".into()));
        }
        Ok(())
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data.data_dir.join("ledger.jsonl")
    }

    pub fn horizon(&self) -> Duration {
        Duration::hours(i64::from(self.schedule.horizon_hours))
    }

    pub fn grace(&self) -> Duration {
        Duration::minutes(i64::from(self.schedule.grace_minutes))
    }

    pub fn on_time(&self) -> Duration {
        Duration::minutes(i64::from(self.schedule.on_time_minutes))
    }

    pub fn reminder_policy(&self) -> ReminderPolicy {
        let r = &self.reminders;
        ReminderPolicy {
            offsets: r
                .offsets_minutes
                .iter()
                .map(|m| Duration::minutes(i64::from(*m)))
                .collect(),
            max_attempts: r.max_attempts,
            transport_retries: r.transport_retries,
            delivery_timeout: std::time::Duration::from_secs(r.delivery_timeout_secs),
            escalate_after: Duration::minutes(i64::from(r.escalate_after_minutes)),
            escalation_contacts: self.escalation.default_contacts.clone(),
            escalation_channel: self.escalation.channel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.schedule.horizon_hours, 48);
        assert_eq!(config.schedule.grace_minutes, 60);
        assert_eq!(config.reminders.offsets_minutes, vec![0, 15, 45]);
        assert_eq!(config.reminders.max_attempts, 3);
        assert!(config.validate().is_ok());
        assert!(config.journal_path().ends_with("medrem/ledger.jsonl"));
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[schedule]
grace_minutes = 90

[escalation]
default_contacts = ["+15550123"]
channel = "email"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.schedule.grace_minutes, 90);
        assert_eq!(config.schedule.horizon_hours, 48); // default
        assert_eq!(config.escalation.channel, Channel::Email);
        assert_eq!(config.grace(), Duration::minutes(90));
    }

    #[test]
    fn test_validation_rejects_bad_reminders() {
        let mut config = Config::default();
        config.reminders.offsets_minutes = vec![0, 30, 30];
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.reminders.max_attempts = 4;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reminders.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.schedule.grace_minutes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.reminders.offsets_minutes = vec![0, 10];
        config.reminders.max_attempts = 2;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.reminders.offsets_minutes, vec![0, 10]);
    }

    #[test]
    fn test_policy_fire_times() {
        let policy = Config::default().reminder_policy();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        assert_eq!(policy.fire_at(at, 1), Some(at));
        assert_eq!(policy.fire_at(at, 3), Some(at + Duration::minutes(45)));
        assert_eq!(policy.fire_at(at, 4), None);
        assert_eq!(policy.fire_at(at, 0), None);
    }
}
