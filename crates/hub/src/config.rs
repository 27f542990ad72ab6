//! TOML config file loading, environment overrides, and validation.
//!
//! Only process wiring lives here (listen address, database). Watering policy
//! is operator-editable at runtime and is kept in the settings store.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 5001,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Fail-fast bound for pool acquisition and SQLite lock waits.
    pub timeout_sec: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:plantcare.db?mode=rwc".to_string(),
            max_connections: 5,
            timeout_sec: 5,
        }
    }
}

/// Upper bound on `database.timeout_sec`.
const MAX_TIMEOUT_SEC: u64 = 60;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.server.bind.parse::<IpAddr>().is_err() {
            errors.push(format!(
                "server.bind '{}' is not an IP address",
                self.server.bind
            ));
        }
        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }

        let url = self.database.url.trim();
        if url.is_empty() {
            errors.push("database.url is empty".to_string());
        } else if !url.starts_with("sqlite:") {
            errors.push(format!(
                "database.url '{url}' must be a sqlite: connection string"
            ));
        }
        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be positive".to_string());
        }
        if !(1..=MAX_TIMEOUT_SEC).contains(&self.database.timeout_sec) {
            errors.push(format!(
                "database.timeout_sec {} out of range [1, {MAX_TIMEOUT_SEC}]",
                self.database.timeout_sec
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    /// Apply `WEB_PORT` / `DB_URL` style overrides. `lookup` is `std::env::var`
    /// in production.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup("WEB_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("WEB_PORT '{port}' is not a port number"))?;
        }
        if let Some(url) = lookup("DB_URL") {
            self.database.url = url;
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .bind
            .parse()
            .with_context(|| format!("invalid bind address: {}", self.server.bind))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_secs(self.database.timeout_sec)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file, falling back to defaults when the file
/// does not exist, then apply env overrides and validate.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "no config file, using defaults");
        Config::default()
    };

    config.apply_overrides(|k| std::env::var(k).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
