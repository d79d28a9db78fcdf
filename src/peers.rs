use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

/// Opaque, immutable peer identifier. Cloning only bumps a refcount.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Arc<str>);

#[derive(Debug, Error, PartialEq)]
pub enum PeerIdError {
    #[error("peer id is empty")]
    Empty,
    #[error("peer id {0:?} contains a forbidden character")]
    ForbiddenCharacter(String),
}

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PeerIdError::Empty);
        }
        // ';' and ',' are the snapshot CSV separators
        if s.chars().any(|c| c.is_whitespace() || c == ';' || c == ',') {
            return Err(PeerIdError::ForbiddenCharacter(s.to_string()));
        }
        Ok(PeerId(Arc::from(s)))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A peer together with the multi-addresses it can be dialled on.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerAddrInfo {
    pub id: PeerId,
    pub addrs: Vec<String>,
}

/// A node reported by a DHT crawl.
#[derive(Clone, Debug, PartialEq)]
pub struct VisitedPeer {
    pub id: PeerId,
    pub addrs: Vec<String>,
    pub reachable: bool,
    pub agent_version: String,
}

impl VisitedPeer {
    pub fn addr_info(&self) -> PeerAddrInfo {
        PeerAddrInfo {
            id: self.id.clone(),
            addrs: self.addrs.clone(),
        }
    }
}

/// Which side opened a connection. The discriminants are the codes written to
/// `connected_*.csv`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    Unknown = 0,
    Inbound = 1,
    Outbound = 2,
}

impl Direction {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Direction::Unknown),
            1 => Some(Direction::Inbound),
            2 => Some(Direction::Outbound),
            _ => None,
        }
    }
}

/// A peer read back from a connected-peers snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectedPeer {
    pub id: PeerId,
    pub direction: Direction,
    pub protocols: Vec<String>,
}

/// A live connection as reported by the network collaborator.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionInfo {
    pub peer: PeerId,
    pub direction: Direction,
    pub address: String,
    pub protocols: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_parsing() {
        let id: PeerId = "QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN".parse().unwrap();
        assert_eq!(id.as_str(), "QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN");
        assert_eq!("".parse::<PeerId>(), Err(PeerIdError::Empty));
        assert!("a;b".parse::<PeerId>().is_err());
        assert!("a b".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_direction_codes() {
        for dir in [Direction::Unknown, Direction::Inbound, Direction::Outbound] {
            assert_eq!(Direction::from_code(dir.code()), Some(dir));
        }
        assert_eq!(Direction::from_code(7), None);
    }
}
