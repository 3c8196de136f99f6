//! Configuration and settings for `edgewayd`.
//!
//! This module consolidates CLI argument parsing and TOML configuration loading.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config as RawConfig;
use edgeway::{
    BackoffConfig, DialSettings, FileConfigMapLoader, StaticServiceRegistry,
    dial::{DEFAULT_DIAL_TIMEOUT, DEFAULT_MAX_BACKOFF_DELAY},
};
use serde::Deserialize;

/// edgewayd - cloud connectivity and configuration storage for the gateway
#[derive(Parser, Debug)]
#[command(name = "edgewayd")]
#[command(about = "Cloud connectivity and configuration storage for the gateway")]
pub struct Args {
    /// Path to the configuration file (TOML format)
    #[arg(short = 'c', value_name = "CONFIG_PATH")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connects to a cloud service and reports the address it was reached at.
    Connect {
        /// Name of the cloud service, e.g. `configurator`.
        #[arg(value_name = "SERVICE")]
        service: String,
    },
    /// Stores a configuration blob as the gateway configuration.
    Save {
        /// Path to the configuration blob.
        #[arg(value_name = "BLOB_FILE")]
        blob: PathBuf,

        /// Report the size of the configuration being replaced.
        #[arg(long)]
        read_old: bool,
    },
}

/// File-backed configuration for `edgewayd`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path to the log file. Logs go to stdout when unset.
    pub log_path: Option<PathBuf>,

    /// Directory holding service configuration files such as
    /// `control_proxy.yml`.
    pub config_dir: PathBuf,

    /// Directory whose service configuration files override `config_dir`.
    pub override_dir: Option<PathBuf>,

    /// Local service addresses by logical name.
    #[serde(default)]
    pub registry: HashMap<String, String>,

    #[serde(default)]
    pub dial: DialConfig,

    pub persist: PersistConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DialConfig {
    pub timeout_secs: u64,
    pub max_backoff_delay_secs: u64,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_DIAL_TIMEOUT.as_secs(),
            max_backoff_delay_secs: DEFAULT_MAX_BACKOFF_DELAY.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistConfig {
    /// Path of the primary gateway configuration.
    pub config_path: PathBuf,

    /// Path of the throttled static copy.
    pub static_config_path: PathBuf,

    /// Minimum minutes between static copy updates; zero or less disables it.
    #[serde(default)]
    pub static_update_interval_min: i64,
}

impl Config {
    /// Loads configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = RawConfig::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("EDGEWAYD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to load config from: {}", path.display()))?;

        let config: Self = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;

        Ok(config)
    }

    pub fn registry(&self) -> StaticServiceRegistry {
        StaticServiceRegistry::new(&self.registry)
    }

    pub fn loader(&self) -> FileConfigMapLoader {
        FileConfigMapLoader::new(&self.config_dir, self.override_dir.clone())
    }

    pub fn dial_settings(&self) -> DialSettings {
        DialSettings {
            timeout: Duration::from_secs(self.dial.timeout_secs),
            backoff: BackoffConfig {
                max_delay: Duration::from_secs(self.dial.max_backoff_delay_secs),
                ..BackoffConfig::default()
            },
            ..DialSettings::default()
        }
    }
}
