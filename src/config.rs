use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::aggregate::rollup::RollupFn;

/// Top-level configuration for the gauged daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Ingestion HTTP server configuration.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Database connection configuration.
    #[serde(default)]
    pub db: DbConfig,

    /// Rollup spec per metric kind: ordered list of function tokens
    /// (`sum`, `avg`, `sumb`, `pct(N)`).
    #[serde(default = "default_rollups")]
    pub rollups: HashMap<String, Vec<String>>,
}

/// Ingestion HTTP server configuration.
#[derive(Debug, Deserialize)]
pub struct IngestConfig {
    /// Listen address (e.g. "0.0.0.0:8586" or ":8586"). Default: ":8586".
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Accepted submitter credentials, user -> password (HTTP Basic).
    /// An empty map disables authentication.
    #[serde(default)]
    pub users: HashMap<String, String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            users: HashMap::new(),
        }
    }
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    /// PostgreSQL host. Default: "localhost".
    #[serde(default = "default_db_host")]
    pub host: String,

    /// PostgreSQL port. Default: 5432.
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database name. Default: "gauged".
    #[serde(default = "default_db_name")]
    pub dbname: String,

    /// Connection user. Default: "gauged".
    #[serde(default = "default_db_user")]
    pub user: String,

    /// Connection password. Default: empty.
    #[serde(default)]
    pub password: String,

    /// Connect timeout. Default: 10s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            dbname: default_db_name(),
            user: default_db_user(),
            password: String::new(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            ingest: IngestConfig::default(),
            db: DbConfig::default(),
            rollups: default_rollups(),
        }
    }
}

impl Config {
    /// Loads and validates the configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validates cross-field constraints that serde cannot express.
    ///
    /// Rollup tokens are checked eagerly here so a typo fails at startup
    /// rather than poisoning every flush for that metric kind.
    fn validate(&self) -> Result<()> {
        if self.rollups.is_empty() {
            bail!("at least one rollup spec is required");
        }

        for (kind, tokens) in &self.rollups {
            if tokens.is_empty() {
                bail!("rollup spec for kind {kind:?} is empty");
            }
            for token in tokens {
                RollupFn::parse(token)
                    .with_context(|| format!("rollup spec for kind {kind:?}"))?;
            }
        }

        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen() -> String {
    ":8586".to_string()
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "gauged".to_string()
}

fn default_db_user() -> String {
    "gauged".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Default rollups covering the common collector datasource kinds.
fn default_rollups() -> HashMap<String, Vec<String>> {
    let mut rollups = HashMap::new();
    rollups.insert(
        "gauge".to_string(),
        vec!["avg".to_string(), "pct(95)".to_string()],
    );
    rollups.insert(
        "derive".to_string(),
        vec!["sum".to_string(), "sumb".to_string()],
    );
    rollups.insert(
        "counter".to_string(),
        vec!["sum".to_string(), "sumb".to_string()],
    );
    rollups.insert("absolute".to_string(), vec!["sum".to_string()]);
    rollups
}
