// src/config.rs

use chrono::NaiveDate;
use std::env;
use thiserror::Error;

/// No training hours exist before this date; the club only started keeping
/// the electronic ledger then.
pub const DEFAULT_ACTIVATION_DATE: &str = "2025-09-01";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 6 * 60 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {var}: {reason}")]
    InvalidValue {
        var: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Browser origin allowed by CORS; permissive when unset (local dev).
    pub cors_origin: Option<String>,
    pub activation_date: NaiveDate,
    pub resync_interval_secs: u64,
}

pub fn load_app_config() -> Result<AppConfig, ConfigError> {
    let port = parse_env("PORT", DEFAULT_PORT)?;
    let cors_origin = env::var("CORS_ORIGIN").ok().filter(|s| !s.is_empty());
    let activation_date = match env::var("ACTIVATION_DATE") {
        Ok(value) => NaiveDate::parse_from_str(&value, "%Y-%m-%d").map_err(|e| {
            ConfigError::InvalidValue {
                var: "ACTIVATION_DATE".to_string(),
                value,
                reason: e.to_string(),
            }
        })?,
        Err(_) => NaiveDate::parse_from_str(DEFAULT_ACTIVATION_DATE, "%Y-%m-%d")
            .expect("default activation date is valid"),
    };
    let resync_interval_secs = parse_env("RESYNC_INTERVAL_SECS", DEFAULT_RESYNC_INTERVAL_SECS)?;

    Ok(AppConfig {
        port,
        cors_origin,
        activation_date,
        resync_interval_secs,
    })
}

fn parse_env<T: std::str::FromStr>(var: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(value) => value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: var.to_string(),
            value,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
