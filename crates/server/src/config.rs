use std::path::Path;

use anyhow::{ensure, Context};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::gateway::GatewaySettings;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    /// Broadcast buffer per room before slow members start lagging.
    pub room_capacity: usize,
    /// Frames queued per connection before the writer applies backpressure.
    pub outbound_buffer: usize,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/messaging.db".into(),
            room_capacity: 256,
            outbound_buffer: 64,
            log_filter: "info".into(),
        }
    }
}

impl Settings {
    pub fn gateway(&self) -> GatewaySettings {
        GatewaySettings {
            room_capacity: self.room_capacity,
            outbound_buffer: self.outbound_buffer,
        }
    }
}

/// Defaults, then `server.toml` in the working directory, then `APP__*` variables.
pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(Path::new("server.toml"))
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<Settings> {
    let defaults = Settings::default();
    let raw = Config::builder()
        .set_default("bind_addr", defaults.bind_addr)?
        .set_default("database_url", defaults.database_url)?
        .set_default("room_capacity", defaults.room_capacity as i64)?
        .set_default("outbound_buffer", defaults.outbound_buffer as i64)?
        .set_default("log_filter", defaults.log_filter)?
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to read configuration from '{}'", path.display()))?;

    let settings: Settings = raw
        .try_deserialize()
        .context("invalid server configuration")?;
    ensure!(settings.room_capacity > 0, "room_capacity must be positive");
    ensure!(settings.outbound_buffer > 0, "outbound_buffer must be positive");
    Ok(settings)
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    storage::ensure_sqlite_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }
    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    let path = if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        path
    } else if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        path
    } else if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    } else {
        raw_database_url
    };

    let path = path.replace('\\', "/");
    if has_drive_prefix(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'/'
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
