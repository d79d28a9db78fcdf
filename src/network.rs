use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, trace};

use crate::peers::{ConnectionInfo, Direction, PeerAddrInfo, PeerId};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("unsupported address {0:?}")]
    UnsupportedAddress(String),
    #[error("no addresses known for {0}")]
    NoAddresses(PeerId),
    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dial {addr} timed out after {after:?}")]
    Timeout { addr: String, after: Duration },
}

#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Open a connection to `peer`. Already connected peers succeed at once.
    async fn connect(&self, peer: &PeerAddrInfo) -> Result<(), NetworkError>;

    /// Every peer the node has addresses for.
    async fn known_peers(&self) -> HashMap<PeerId, Vec<String>>;

    async fn connected_peers(&self) -> Vec<ConnectionInfo>;

    /// Record addresses without dialling.
    async fn learn(&self, peer: &PeerAddrInfo);
}

/// Extract `(host, port)` from `/ip4|ip6|dns|dns4|dns6/<host>/tcp/<port>[/...]`.
pub fn tcp_target(addr: &str) -> Result<(String, u16), NetworkError> {
    let unsupported = || NetworkError::UnsupportedAddress(addr.to_string());

    let mut parts = addr.strip_prefix('/').ok_or_else(unsupported)?.split('/');
    let host = match (parts.next(), parts.next()) {
        (Some("ip4" | "ip6" | "dns" | "dns4" | "dns6"), Some(host)) if !host.is_empty() => host,
        _ => return Err(unsupported()),
    };
    let port = match (parts.next(), parts.next()) {
        (Some("tcp"), Some(port)) => port.parse().map_err(|_| unsupported())?,
        _ => return Err(unsupported()),
    };
    // only a peer id may follow the transport
    match (parts.next(), parts.next(), parts.next()) {
        (None, ..) | (Some("p2p" | "ipfs"), Some(_), None) => Ok((host.to_string(), port)),
        _ => Err(unsupported()),
    }
}

struct Connection {
    stream: TcpStream,
    address: String,
}

impl Connection {
    /// A stream is dead once the remote has closed it or it errored.
    fn is_alive(&self) -> bool {
        let mut buf = [0u8; 64];
        match self.stream.try_read(&mut buf) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }
}

#[derive(Default)]
struct NetworkState {
    addresses: HashMap<PeerId, Vec<String>>,
    connections: HashMap<PeerId, Connection>,
}

impl NetworkState {
    fn learn(&mut self, peer: &PeerAddrInfo) {
        let known = self.addresses.entry(peer.id.clone()).or_default();
        for addr in &peer.addrs {
            if !known.contains(addr) {
                known.push(addr.clone());
            }
        }
    }
}

// A connection here is an open TCP stream to one of the peer's addresses.
pub struct TcpNetwork {
    dial_timeout: Duration,
    state: Mutex<NetworkState>,
}

impl TcpNetwork {
    pub fn new(dial_timeout: Duration) -> Self {
        Self {
            dial_timeout,
            state: Mutex::new(NetworkState::default()),
        }
    }

    async fn dial(&self, addr: &str) -> Result<TcpStream, NetworkError> {
        let (host, port) = tcp_target(addr)?;
        match time::timeout(self.dial_timeout, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(NetworkError::Dial {
                addr: addr.to_string(),
                source,
            }),
            Err(_) => Err(NetworkError::Timeout {
                addr: addr.to_string(),
                after: self.dial_timeout,
            }),
        }
    }

    fn prune(&self) {
        self.state.lock().connections.retain(|peer, conn| {
            let alive = conn.is_alive();
            if !alive {
                debug!("Connection to {} at {} closed", peer, conn.address);
            }
            alive
        });
    }
}

#[async_trait]
impl PeerNetwork for TcpNetwork {
    async fn connect(&self, peer: &PeerAddrInfo) -> Result<(), NetworkError> {
        let addrs = {
            let mut state = self.state.lock();
            state.learn(peer);
            if state.connections.get(&peer.id).is_some_and(Connection::is_alive) {
                return Ok(());
            }
            state.addresses.get(&peer.id).cloned().unwrap_or_default()
        };

        let mut last_error = NetworkError::NoAddresses(peer.id.clone());
        for addr in addrs {
            match self.dial(&addr).await {
                Ok(stream) => {
                    trace!("Connected to {} at {}", peer.id, addr);
                    self.state.lock().connections.insert(
                        peer.id.clone(),
                        Connection {
                            stream,
                            address: addr,
                        },
                    );
                    return Ok(());
                }
                Err(e) => {
                    trace!("Dial to {} failed: {}", peer.id, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn known_peers(&self) -> HashMap<PeerId, Vec<String>> {
        self.state.lock().addresses.clone()
    }

    async fn connected_peers(&self) -> Vec<ConnectionInfo> {
        self.prune();
        let state = self.state.lock();
        let mut infos: Vec<ConnectionInfo> = state
            .connections
            .iter()
            .map(|(peer, conn)| ConnectionInfo {
                peer: peer.clone(),
                direction: Direction::Outbound,
                address: conn.address.clone(),
                protocols: vec![],
            })
            .collect();
        infos.sort_by(|a, b| a.peer.cmp(&b.peer));
        infos
    }

    async fn learn(&self, peer: &PeerAddrInfo) {
        self.state.lock().learn(peer);
    }
}
