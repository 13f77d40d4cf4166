//! Server configuration.

use anyhow::{bail, Context, Result};
use patrol::{Guard, PatrolConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// SQLite file; the in-memory store is used when absent
    #[serde(default)]
    pub database: Option<String>,

    /// Guard records served by the static identity provider
    #[serde(default)]
    pub guards: Vec<Guard>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    #[serde(flatten)]
    pub patrol: PatrolConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            database: None,
            guards: Vec::new(),
            request_timeout_seconds: default_request_timeout(),
            patrol: PatrolConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&raw).context("Failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path` if given, otherwise (or on failure) fall back to defaults.
    pub fn load(path: Option<&str>) -> Self {
        let Some(path) = path else {
            info!("No config file given, using defaults");
            return Self::default();
        };
        match Self::from_file(path) {
            Ok(config) => {
                info!(path, guards = config.guards.len(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(path, error = %format!("{e:#}"), "Failed to load configuration, using defaults");
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Err(e) = self.patrol.validate() {
            bail!(e);
        }
        if self.request_timeout_seconds == 0 {
            bail!("requestTimeoutSeconds must be positive");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

const fn default_request_timeout() -> u64 {
    30
}
