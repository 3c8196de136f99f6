//! Lookup of local service addresses by logical name.

use std::collections::HashMap;

use thiserror::Error;

/// Logical name of the local control proxy.
pub const CONTROL_PROXY_SERVICE_NAME: &str = "CONTROL_PROXY";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service {0} is not registered")]
    NotFound(String),
}

/// Resolves a logical service name to a `host:port` string.
pub trait ServiceRegistry: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if `service_name` has no registered address.
    fn resolve(&self, service_name: &str) -> Result<String, RegistryError>;
}

/// A fixed name-to-address table. Names are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct StaticServiceRegistry {
    services: HashMap<String, String>,
}

impl StaticServiceRegistry {
    #[must_use]
    pub fn new<I, K, V>(services: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            services: services
                .into_iter()
                .map(|(name, addr)| (name.as_ref().to_ascii_uppercase(), addr.into()))
                .collect(),
        }
    }
}

impl ServiceRegistry for StaticServiceRegistry {
    fn resolve(&self, service_name: &str) -> Result<String, RegistryError> {
        self.services
            .get(&service_name.to_ascii_uppercase())
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(service_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_ignores_case() {
        let registry = StaticServiceRegistry::new([("control_proxy", "127.0.0.1:8443")]);
        assert_eq!(
            registry
                .resolve(CONTROL_PROXY_SERVICE_NAME)
                .expect("registered service"),
            "127.0.0.1:8443"
        );
    }

    #[test]
    fn resolve_unknown_service_fails() {
        let registry = StaticServiceRegistry::default();
        assert!(matches!(
            registry.resolve("magmad"),
            Err(RegistryError::NotFound(name)) if name == "magmad"
        ));
    }
}
