// ============================
// roomcast-backend-lib/src/config.rs
// ============================
//! Configuration management.
use crate::error::AppError;
use anyhow::Result;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Data directory for the flat-file message store
    pub data_dir: PathBuf,
    /// Log level
    pub log_level: String,
    /// Session TTL in seconds
    pub session_ttl_secs: u64,
    /// Redis URL for the presence store and broadcast transport. When unset
    /// the process runs with in-memory equivalents and cannot see messages
    /// published by other processes.
    pub redis_url: Option<String>,
    /// Upper bound on a single history page
    pub history_page_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".parse().unwrap(),
            data_dir: PathBuf::from("data"),
            log_level: "info".to_string(),
            session_ttl_secs: 60 * 60 * 24 * 7, // 7 days
            redis_url: None,
            history_page_limit: 200,
        }
    }
}

impl Settings {
    /// Load settings from config files and `ROOMCAST_`-prefixed environment
    /// variables, on top of the defaults.
    pub fn load() -> Result<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file("config.toml"))
            .merge(Yaml::file("config.yaml"))
            .merge(Json::file("config.json"))
            .merge(Env::prefixed("ROOMCAST_"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from an explicit TOML file (environment still wins).
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ROOMCAST_"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate field values beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), AppError> {
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(AppError::InvalidInput(format!(
                "unknown log level '{}'",
                self.log_level
            )));
        }
        if self.session_ttl_secs == 0 {
            return Err(AppError::InvalidInput(
                "session_ttl_secs must be positive".to_string(),
            ));
        }
        if self.history_page_limit == 0 {
            return Err(AppError::InvalidInput(
                "history_page_limit must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
