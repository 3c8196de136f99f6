//! Control-proxy configuration and its process-wide cache.
//!
//! The control-proxy configuration is read once and kept for the lifetime of
//! the process. Changes to the file on disk take effect only after a restart.

use std::{
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
};

use crate::config_map::{ConfigMap, ConfigMapError, ConfigMapLoader};

/// Module under which the control-proxy configuration is stored.
pub const CONTROL_PROXY_MODULE: &str = "";
/// Service name of the control-proxy configuration file.
pub const CONTROL_PROXY_SERVICE: &str = "control_proxy";

const CLOUD_ADDRESS: &str = "cloud_address";
const CLOUD_PORT: &str = "cloud_port";
const LOCAL_PORT: &str = "local_port";
const PROXY_CLOUD_CONNECTIONS: &str = "proxy_cloud_connections";
const ROOTCA_CERT: &str = "rootca_cert";
const GATEWAY_CERT: &str = "gateway_cert";
const GATEWAY_KEY: &str = "gateway_key";

/// Typed view over the control-proxy configuration map.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    map: ConfigMap,
}

impl ProxyConfig {
    #[must_use]
    pub fn new(map: ConfigMap) -> Self {
        Self { map }
    }

    /// Loads the control-proxy configuration through `loader`.
    ///
    /// # Errors
    ///
    /// Returns an error if the loader fails.
    pub fn load(loader: &dyn ConfigMapLoader) -> Result<Self, ConfigMapError> {
        loader
            .load(CONTROL_PROXY_MODULE, CONTROL_PROXY_SERVICE)
            .map(Self::new)
    }

    /// The cloud controller address as `host:port`.
    ///
    /// # Errors
    ///
    /// Returns an error if `cloud_address` is absent or empty.
    pub fn cloud_address(&self) -> Result<String, ConfigMapError> {
        let addr = self.map.get_string(CLOUD_ADDRESS)?;
        if addr.is_empty() {
            return Err(ConfigMapError::Missing(CLOUD_ADDRESS.to_string()));
        }
        Ok(addr)
    }

    /// Port the local control proxy listens on for gateway services.
    ///
    /// # Errors
    ///
    /// Returns an error if `local_port` is absent or not a valid port.
    pub fn local_port(&self) -> Result<u16, ConfigMapError> {
        self.port(LOCAL_PORT)
    }

    /// Port of the cloud controller used for direct connections.
    ///
    /// # Errors
    ///
    /// Returns an error if `cloud_port` is absent or not a valid port.
    pub fn cloud_port(&self) -> Result<u16, ConfigMapError> {
        self.port(CLOUD_PORT)
    }

    /// Whether cloud connections go through the local control proxy.
    /// Defaults to `true` when the key is absent or unreadable.
    #[must_use]
    pub fn proxy_cloud_connections(&self) -> bool {
        self.map.get_bool(PROXY_CLOUD_CONNECTIONS).unwrap_or(true)
    }

    #[must_use]
    pub fn rootca_cert(&self) -> Option<PathBuf> {
        self.path(ROOTCA_CERT)
    }

    #[must_use]
    pub fn gateway_cert(&self) -> Option<PathBuf> {
        self.path(GATEWAY_CERT)
    }

    #[must_use]
    pub fn gateway_key(&self) -> Option<PathBuf> {
        self.path(GATEWAY_KEY)
    }

    fn port(&self, key: &str) -> Result<u16, ConfigMapError> {
        let value = self.map.get_int(key)?;
        u16::try_from(value)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| ConfigMapError::Invalid {
                key: key.to_string(),
                reason: format!("{value} is not a valid port"),
            })
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        self.map
            .get_string(key)
            .ok()
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }
}

/// A load-once slot for the control-proxy configuration.
///
/// A failed load leaves the slot empty so that a later call can retry.
/// Concurrent first loads may each read the configuration; the last one
/// stored wins, which is harmless because loads are idempotent.
#[derive(Debug, Default)]
pub struct ProxyConfigCache {
    slot: RwLock<Option<Arc<ProxyConfig>>>,
}

impl ProxyConfigCache {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    /// Returns the cached configuration, loading it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing is cached yet and the load fails.
    pub fn get_or_load(
        &self,
        loader: &dyn ConfigMapLoader,
    ) -> Result<Arc<ProxyConfig>, ConfigMapError> {
        if let Some(cfg) = self.cached() {
            return Ok(cfg);
        }

        let cfg = Arc::new(ProxyConfig::load(loader)?);
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&cfg));
        tracing::info!("Cached control proxy configuration");
        Ok(cfg)
    }

    #[must_use]
    pub fn cached(&self) -> Option<Arc<ProxyConfig>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

static PROXY_CONFIG: ProxyConfigCache = ProxyConfigCache::new();

/// Returns the process-wide control-proxy configuration.
///
/// # Errors
///
/// Returns an error if the configuration has not been cached yet and cannot
/// be loaded.
pub fn proxy_config(loader: &dyn ConfigMapLoader) -> Result<Arc<ProxyConfig>, ConfigMapError> {
    PROXY_CONFIG.get_or_load(loader)
}
