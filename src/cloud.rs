//! Connections from the gateway to cloud services.
//!
//! A [`CloudConnector`] resolves where a named cloud service is reachable,
//! either through the local control proxy or directly, and dials it with a
//! bounded timeout. A returned [`Channel`] has completed its handshake and is
//! ready for use; dialing never hands back a lazily-connecting handle.

use std::{
    fmt, io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use quinn::{Connection, Endpoint, RecvStream, SendStream, VarInt};
use thiserror::Error;

use crate::{
    config_map::{ConfigMapError, ConfigMapLoader},
    dial::{Authority, DialError, DialOptions, DialSettings, build_dial_options, host_of},
    proxy_config::{ProxyConfig, proxy_config},
    registry::{CONTROL_PROXY_SERVICE_NAME, RegistryError, ServiceRegistry},
};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigMapError),
    #[error("failed to resolve control proxy: {0}")]
    Registry(#[from] RegistryError),
    #[error("address: {address} lookup error: {source}")]
    Lookup {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Options(#[from] DialError),
    #[error("address: {address} dial error: {source}")]
    Dial {
        address: String,
        #[source]
        source: DialFailure,
    },
    #[error("address: {address} dial timed out after {timeout:?}{}", cause_suffix(.last_error.as_deref()))]
    Timeout {
        address: String,
        timeout: Duration,
        last_error: Option<String>,
    },
}

fn cause_suffix(cause: Option<&str>) -> String {
    cause.map(|c| format!(" ({c})")).unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum DialFailure {
    #[error("failed to create client endpoint: {0}")]
    Endpoint(#[source] io::Error),
    #[error(transparent)]
    Connect(#[from] quinn::ConnectError),
}

/// Where a cloud service is dialed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// `host:port` to dial.
    pub address: String,
    /// Whether `address` belongs to the local control proxy.
    pub proxied: bool,
}

/// An established connection to a cloud service.
pub struct Channel {
    endpoint: Endpoint,
    connection: Connection,
    authority: Authority,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("authority", &self.authority)
            .field("remote_addr", &self.connection.remote_address())
            .finish_non_exhaustive()
    }
}

impl Channel {
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    #[must_use]
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Opens a bidirectional stream for one RPC exchange.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection has been lost.
    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream), quinn::ConnectionError> {
        self.connection.open_bi().await
    }

    /// Closes the connection and waits for the peer to be notified.
    pub async fn close(self) {
        self.connection.close(VarInt::from_u32(0), b"done");
        self.endpoint.wait_idle().await;
    }
}

/// Dials cloud services on behalf of the gateway.
pub struct CloudConnector {
    registry: Arc<dyn ServiceRegistry>,
    loader: Arc<dyn ConfigMapLoader>,
    settings: DialSettings,
}

impl CloudConnector {
    #[must_use]
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        loader: Arc<dyn ConfigMapLoader>,
        settings: DialSettings,
    ) -> Self {
        Self {
            registry,
            loader,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &DialSettings {
        &self.settings
    }

    /// Connects to `service` using the process-wide control-proxy
    /// configuration, loading it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded, the target
    /// cannot be resolved, or the dial fails or times out.
    pub async fn connect(&self, service: &str) -> Result<Channel, ConnectError> {
        let cfg = proxy_config(self.loader.as_ref())?;
        self.connect_with_config(&cfg, service).await
    }

    /// Connects to `service` using the given control-proxy configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `cloud_address` or a required port is missing, the
    /// target cannot be resolved, or the dial fails or times out.
    pub async fn connect_with_config(
        &self,
        cfg: &ProxyConfig,
        service: &str,
    ) -> Result<Channel, ConnectError> {
        let authority = Authority::new(service, &cfg.cloud_address()?);
        let target = self.resolve_target(cfg)?;
        let options = build_dial_options(cfg, &authority, target.proxied, &self.settings)?;
        let addr = lookup(&target.address).await?;
        self.dial(addr, &options).await
    }

    /// Determines the address `cfg` routes cloud connections to.
    ///
    /// # Errors
    ///
    /// Returns an error if a required key is missing or the control proxy is
    /// not registered.
    pub fn resolve_target(&self, cfg: &ProxyConfig) -> Result<Target, ConnectError> {
        if cfg.proxy_cloud_connections() {
            let local_port = cfg.local_port()?;
            let proxy_addr = self.registry.resolve(CONTROL_PROXY_SERVICE_NAME)?;
            Ok(Target {
                address: join_host_port(host_of(&proxy_addr), local_port),
                proxied: true,
            })
        } else {
            let cloud_address = cfg.cloud_address()?;
            let cloud_port = cfg.cloud_port()?;
            Ok(Target {
                address: join_host_port(host_of(&cloud_address), cloud_port),
                proxied: false,
            })
        }
    }

    async fn dial(&self, addr: SocketAddr, options: &DialOptions) -> Result<Channel, ConnectError> {
        let address = addr.to_string();
        let client_config = options.client_config()?;
        let bind_addr: SocketAddr = if addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = Endpoint::client(bind_addr).map_err(|e| ConnectError::Dial {
            address: address.clone(),
            source: DialFailure::Endpoint(e),
        })?;
        endpoint.set_default_client_config(client_config);

        let mut last_error = None;
        let attempt = connect_with_backoff(&endpoint, addr, options, &mut last_error);
        let result = tokio::time::timeout(self.settings.timeout, attempt).await;
        match result {
            Ok(Ok(connection)) => {
                tracing::info!("Connected to {} at {address}", options.authority);
                Ok(Channel {
                    endpoint,
                    connection,
                    authority: options.authority.clone(),
                })
            }
            Ok(Err(source)) => Err(ConnectError::Dial { address, source }),
            Err(_) => {
                endpoint.close(VarInt::from_u32(0), b"dial timeout");
                Err(ConnectError::Timeout {
                    address,
                    timeout: self.settings.timeout,
                    last_error,
                })
            }
        }
    }
}

/// Retries connection attempts with backoff until one completes its
/// handshake. Only a rejected attempt setup ends the loop; the caller bounds
/// the total time.
async fn connect_with_backoff(
    endpoint: &Endpoint,
    addr: SocketAddr,
    options: &DialOptions,
    last_error: &mut Option<String>,
) -> Result<Connection, DialFailure> {
    let mut retries = 0;
    loop {
        let connecting = endpoint.connect(addr, options.server_name())?;
        let failure = match tokio::time::timeout(options.min_connect_timeout, connecting).await {
            Ok(Ok(connection)) => return Ok(connection),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "connection attempt timed out".to_string(),
        };

        let delay = options.backoff.delay(retries);
        tracing::warn!("Connection attempt to {addr} failed: {failure}; retrying in {delay:?}");
        *last_error = Some(failure);
        retries = retries.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}

async fn lookup(address: &str) -> Result<SocketAddr, ConnectError> {
    let lookup_error = |source| ConnectError::Lookup {
        address: address.to_string(),
        source,
    };
    tokio::net::lookup_host(address)
        .await
        .map_err(lookup_error)?
        .next()
        .ok_or_else(|| {
            lookup_error(io::Error::new(
                io::ErrorKind::NotFound,
                "no addresses found",
            ))
        })
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
