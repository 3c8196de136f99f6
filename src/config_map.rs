//! Typed access to named service configuration files.
//!
//! A [`ConfigMap`] is a flat key/value view over one service's configuration
//! file. Maps are produced by a [`ConfigMapLoader`]; the default loader reads
//! YAML files from a configuration directory, optionally layered with a
//! same-named file from an override directory.

use std::path::{Path, PathBuf};

use config::{Config, ConfigError, File, FileFormat, Value};
use thiserror::Error;

const CONFIG_FILE_EXTENSION: &str = "yml";

#[derive(Debug, Error)]
pub enum ConfigMapError {
    #[error("failed to load configuration for {service}: {source}")]
    Load {
        service: String,
        #[source]
        source: ConfigError,
    },
    #[error("missing configuration key: {0}")]
    Missing(String),
    #[error("invalid value for configuration key {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Loads the configuration map of a service.
pub trait ConfigMapLoader: Send + Sync {
    /// Loads the configuration for `service_name` within `module_name`.
    ///
    /// An empty `module_name` means the service's file lives directly in
    /// the configuration directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be read or parsed.
    fn load(&self, module_name: &str, service_name: &str) -> Result<ConfigMap, ConfigMapError>;
}

/// An immutable key/value configuration map.
#[derive(Debug, Clone)]
pub struct ConfigMap {
    inner: Config,
}

impl ConfigMap {
    /// Builds a map from in-memory key/value pairs.
    ///
    /// # Errors
    ///
    /// Returns an error if a key cannot be stored.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigMapError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let mut builder = Config::builder();
        for (key, value) in pairs {
            let key = key.as_ref();
            builder = builder
                .set_override(key, value)
                .map_err(|e| ConfigMapError::Invalid {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
        }
        let inner = builder.build().map_err(|source| ConfigMapError::Load {
            service: "<memory>".to_string(),
            source,
        })?;
        Ok(Self { inner })
    }

    /// # Errors
    ///
    /// Returns an error if `key` is absent or is not a string.
    pub fn get_string(&self, key: &str) -> Result<String, ConfigMapError> {
        self.inner
            .get_string(key)
            .map_err(|e| lookup_error(key, &e))
    }

    /// # Errors
    ///
    /// Returns an error if `key` is absent or is not an integer.
    pub fn get_int(&self, key: &str) -> Result<i64, ConfigMapError> {
        self.inner.get_int(key).map_err(|e| lookup_error(key, &e))
    }

    /// # Errors
    ///
    /// Returns an error if `key` is absent or is not a boolean.
    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigMapError> {
        self.inner.get_bool(key).map_err(|e| lookup_error(key, &e))
    }
}

fn lookup_error(key: &str, err: &ConfigError) -> ConfigMapError {
    match err {
        ConfigError::NotFound(_) => ConfigMapError::Missing(key.to_string()),
        other => ConfigMapError::Invalid {
            key: key.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Reads `<config_dir>/[<module>/]<service>.yml`, layered with the same
/// relative path under `override_dir` when present.
#[derive(Debug, Clone)]
pub struct FileConfigMapLoader {
    config_dir: PathBuf,
    override_dir: Option<PathBuf>,
}

impl FileConfigMapLoader {
    #[must_use]
    pub fn new(config_dir: impl Into<PathBuf>, override_dir: Option<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            override_dir,
        }
    }

    fn file_path(dir: &Path, module_name: &str, service_name: &str) -> PathBuf {
        let file_name = format!("{service_name}.{CONFIG_FILE_EXTENSION}");
        if module_name.is_empty() {
            dir.join(file_name)
        } else {
            dir.join(module_name).join(file_name)
        }
    }
}

impl ConfigMapLoader for FileConfigMapLoader {
    fn load(&self, module_name: &str, service_name: &str) -> Result<ConfigMap, ConfigMapError> {
        let base = Self::file_path(&self.config_dir, module_name, service_name);
        let mut builder =
            Config::builder().add_source(File::from(base.as_path()).format(FileFormat::Yaml));
        if let Some(dir) = &self.override_dir {
            let path = Self::file_path(dir, module_name, service_name);
            builder = builder.add_source(
                File::from(path.as_path())
                    .format(FileFormat::Yaml)
                    .required(false),
            );
        }

        let inner = builder.build().map_err(|source| ConfigMapError::Load {
            service: service_name.to_string(),
            source,
        })?;
        tracing::debug!("Loaded {service_name} configuration from {}", base.display());
        Ok(ConfigMap { inner })
    }
}
