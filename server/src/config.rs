use std::path::PathBuf;

use chrono::NaiveTime;

use crate::error::ConfigError;

/// Process configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection string.
    pub database_url: String,
    /// Root for print files and backups.
    pub data_dir: PathBuf,
    /// Base64 key for secret-column encryption.
    pub encryption_key: String,
    /// Daily window during which no job may run.
    pub blackout_start: NaiveTime,
    pub blackout_end: NaiveTime,
    /// Scheduling horizon in days.
    pub horizon_days: i64,
    /// Filament-swap setup block in minutes.
    pub setup_minutes: i64,
    /// Seconds without a status frame before a printer counts as offline.
    pub liveness_secs: i64,
    /// Optional external filament catalog.
    pub catalog_url: Option<String>,
    /// Base URL the message-bus vendor pulls staged artifacts from.
    pub artifact_base_url: Option<String>,
    /// Optional relay that forwards rendered alerts as browser push.
    pub push_relay_url: Option<String>,
    pub smtp: Option<SmtpConfig>,
    /// Reject webhook targets resolving to private address space.
    pub webhook_block_private: bool,
    pub audit_retention_days: i64,
    pub telemetry_retention_days: i64,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Stored encrypted when persisted; plaintext only in memory.
    pub password: String,
    pub from: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://printfarm.db?mode=rwc".to_string());
        let data_dir = PathBuf::from(env_or("DATA_DIR", "./data"));
        let encryption_key =
            std::env::var("ENCRYPTION_KEY").map_err(|_| ConfigError::Missing("ENCRYPTION_KEY"))?;

        let blackout_start = parse_hhmm("BLACKOUT_START", &env_or("BLACKOUT_START", "22:00"))?;
        let blackout_end = parse_hhmm("BLACKOUT_END", &env_or("BLACKOUT_END", "07:00"))?;

        let smtp = match std::env::var("SMTP_HOST") {
            Ok(host) => Some(SmtpConfig {
                host,
                port: parse_num("SMTP_PORT", &env_or("SMTP_PORT", "587"))? as u16,
                username: env_or("SMTP_USERNAME", ""),
                password: env_or("SMTP_PASSWORD", ""),
                from: env_or("SMTP_FROM", "printfarm@localhost"),
            }),
            Err(_) => None,
        };

        Ok(Self {
            database_url,
            data_dir,
            encryption_key,
            blackout_start,
            blackout_end,
            horizon_days: parse_num("SCHEDULE_HORIZON_DAYS", &env_or("SCHEDULE_HORIZON_DAYS", "7"))?,
            setup_minutes: parse_num("SETUP_MINUTES", &env_or("SETUP_MINUTES", "120"))?,
            liveness_secs: parse_num("LIVENESS_SECS", &env_or("LIVENESS_SECS", "90"))?,
            catalog_url: std::env::var("CATALOG_URL").ok(),
            artifact_base_url: std::env::var("ARTIFACT_BASE_URL").ok(),
            push_relay_url: std::env::var("PUSH_RELAY_URL").ok(),
            smtp,
            webhook_block_private: env_or("WEBHOOK_BLOCK_PRIVATE", "true") == "true",
            audit_retention_days: parse_num(
                "AUDIT_RETENTION_DAYS",
                &env_or("AUDIT_RETENTION_DAYS", "365"),
            )?,
            telemetry_retention_days: parse_num(
                "TELEMETRY_RETENTION_DAYS",
                &env_or("TELEMETRY_RETENTION_DAYS", "30"),
            )?,
        })
    }

    pub fn print_files_dir(&self) -> PathBuf {
        self.data_dir.join("print_files")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_hhmm(name: &'static str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}

fn parse_num(name: &'static str, value: &str) -> Result<i64, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        name,
        reason: format!("not a number: {value}"),
    })
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        database_url: "sqlite::memory:".to_string(),
        data_dir: std::env::temp_dir(),
        encryption_key: String::new(),
        blackout_start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
        blackout_end: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
        horizon_days: 7,
        setup_minutes: 120,
        liveness_secs: 90,
        catalog_url: None,
        artifact_base_url: None,
        push_relay_url: None,
        smtp: None,
        webhook_block_private: true,
        audit_retention_days: 365,
        telemetry_retention_days: 30,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wrapping_blackout_times() {
        let start = parse_hhmm("BLACKOUT_START", "22:00").unwrap();
        let end = parse_hhmm("BLACKOUT_END", "07:00").unwrap();
        assert!(start > end);
    }

    #[test]
    fn rejects_garbage_times() {
        assert!(parse_hhmm("BLACKOUT_START", "25:99").is_err());
        assert!(parse_hhmm("BLACKOUT_START", "ten").is_err());
    }
}
