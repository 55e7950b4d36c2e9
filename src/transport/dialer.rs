//! Secure channel dialer

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use super::connection::Connection;
use super::DialError;
use crate::config::{DialSettings, DEFAULT_CHANNEL_TYPE, DEFAULT_DIAL_TIMEOUT};
use crate::crypto::Signer;
use crate::session::handshake::DEFAULT_USER;
use crate::session::{
    client_handshake, AllowAll, ClientConfig, FingerprintAllowList, HandshakeError, HostVerifier,
    Session,
};

/// Address family used when dialing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// IPv4 or IPv6
    #[default]
    Tcp,
    /// IPv4 only
    Tcp4,
    /// IPv6 only
    Tcp6,
}

impl Network {
    fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Tcp4 => write!(f, "tcp4"),
            Network::Tcp6 => write!(f, "tcp6"),
        }
    }
}

impl std::str::FromStr for Network {
    type Err = DialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(DialError::UnknownNetwork(other.to_string())),
        }
    }
}

/// Dialer configuration
#[derive(Clone)]
pub struct DialOptions {
    /// Address family
    pub network: Network,
    /// `host:port` to reach
    pub address: String,
    /// Client credential
    pub identity: Signer,
    /// Bound on connect plus handshake; zero means unbounded
    pub timeout: Duration,
    /// Channel type to open
    pub channel_type: String,
    /// Decides whether the server's host key is acceptable
    pub host_verifier: Arc<dyn HostVerifier>,
}

impl DialOptions {
    /// Options with defaults: any address family, an `"http"` channel, any host key
    pub fn new(address: impl Into<String>, identity: Signer) -> Self {
        DialOptions {
            network: Network::default(),
            address: address.into(),
            identity,
            timeout: DEFAULT_DIAL_TIMEOUT,
            channel_type: DEFAULT_CHANNEL_TYPE.to_string(),
            host_verifier: Arc::new(AllowAll),
        }
    }

    /// Set the address family
    pub fn network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    /// Set the connect plus handshake bound
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the channel type to open
    pub fn channel_type(mut self, channel_type: impl Into<String>) -> Self {
        self.channel_type = channel_type.into();
        self
    }

    /// Set the host key verifier
    pub fn host_verifier(mut self, verifier: Arc<dyn HostVerifier>) -> Self {
        self.host_verifier = verifier;
        self
    }

    /// Apply file-based settings
    pub fn with_settings(self, settings: &DialSettings) -> Self {
        let options = self
            .network(settings.network)
            .timeout(settings.timeout())
            .channel_type(settings.channel_type.clone());

        if settings.known_hosts.is_empty() {
            options
        } else {
            options.host_verifier(Arc::new(FingerprintAllowList::new(
                settings.known_hosts.iter().copied(),
            )))
        }
    }
}

impl std::fmt::Debug for DialOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialOptions")
            .field("network", &self.network)
            .field("address", &self.address)
            .field("identity", &self.identity)
            .field("timeout", &self.timeout)
            .field("channel_type", &self.channel_type)
            .finish_non_exhaustive()
    }
}

async fn connect(network: Network, address: &str) -> Result<TcpStream, DialError> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(address)
        .await
        .map_err(DialError::Connect)?
        .filter(|addr| network.admits(addr))
        .collect();

    let mut last_error = None;
    for addr in candidates {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(address = %addr, error = %e, "Connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) => DialError::Connect(e),
        None => DialError::NoAddress {
            address: address.to_string(),
            network,
        },
    })
}

/// Run `fut` until `deadline`; `None` if the deadline passed first
async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Connect, authenticate and open one channel
///
/// One deadline covers connecting and the handshake. Running out of time
/// while connecting is [`DialError::Timeout`]; running out during the
/// handshake is [`HandshakeError::Timeout`]. Opening the channel is not
/// bounded.
pub async fn dial(options: DialOptions) -> Result<Connection, DialError> {
    let connecting = connect(options.network, &options.address);
    dial_over(&options, connecting).await
}

async fn dial_over<C>(options: &DialOptions, connecting: C) -> Result<Connection, DialError>
where
    C: Future<Output = Result<TcpStream, DialError>>,
{
    let deadline = (!options.timeout.is_zero()).then(|| Instant::now() + options.timeout);

    let stream = within(deadline, connecting)
        .await
        .ok_or(DialError::Timeout(options.timeout))??;
    let _ = stream.set_nodelay(true);

    let config = ClientConfig {
        signer: options.identity.clone(),
        verifier: options.host_verifier.clone(),
        host: options.address.clone(),
        user: DEFAULT_USER.to_string(),
    };
    let established = within(deadline, client_handshake(stream, &config))
        .await
        .unwrap_or(Err(HandshakeError::Timeout))?;

    let session = Session::client(established);
    debug!(
        address = %options.address,
        host_key = %session.peer_fingerprint(),
        "Session established"
    );

    let channel = session.open_channel(&options.channel_type).await?;
    Ok(Connection::new(channel, session))
}
