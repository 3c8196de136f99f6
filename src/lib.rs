pub mod cloud;
pub mod config_map;
pub mod dial;
pub mod persist;
pub mod proxy_config;
pub mod registry;

pub use cloud::{Channel, CloudConnector, ConnectError, Target};
pub use config_map::{ConfigMap, ConfigMapError, ConfigMapLoader, FileConfigMapLoader};
pub use dial::{
    Authority, BackoffConfig, DialError, DialOptions, DialSettings, TlsMaterial, TlsWarning,
    Transport, build_dial_options,
};
pub use persist::{
    AtomicSwap, ConfigWriter, FileSystem, PersistError, StaticUpdate, StdFs, SwapState,
};
pub use proxy_config::{ProxyConfig, ProxyConfigCache, proxy_config};
pub use registry::{
    CONTROL_PROXY_SERVICE_NAME, RegistryError, ServiceRegistry, StaticServiceRegistry,
};
