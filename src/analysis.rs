use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::correlator::{Category, FilesForAnalysis};
use crate::input::{self, InputError};
use crate::peers::{ConnectedPeer, Direction, PeerId, VisitedPeer};

#[derive(Debug, Error)]
#[error("{category} could not be loaded: {source}")]
pub struct AnalysisError {
    pub category: Category,
    #[source]
    pub source: InputError,
}

/// Peer sets loaded from one selection of files.
#[derive(Debug, Default)]
pub struct SnapshotMaps {
    pub visited: HashMap<PeerId, VisitedPeer>,
    pub known: HashSet<PeerId>,
    pub connected: HashMap<PeerId, ConnectedPeer>,
    pub established: HashSet<PeerId>,
    pub successful: HashSet<PeerId>,
    pub failed: HashSet<PeerId>,
}

impl SnapshotMaps {
    /// Load every selected file. Any failure is fatal to the analysis.
    pub fn load(files: &FilesForAnalysis) -> Result<Self, AnalysisError> {
        let wrap = |category| move |source| AnalysisError { category, source };

        let visited = match &files.visited_peers {
            Some(file) => input::load_visited_peers(&file.path())
                .map_err(wrap(Category::VisitedPeers))?,
            None => HashMap::new(),
        };
        let peer_list = |category: Category, file: &crate::correlator::SnapshotFile| {
            input::load_peer_list(&file.path()).map_err(wrap(category))
        };

        Ok(SnapshotMaps {
            visited,
            known: peer_list(Category::Known, &files.known)?,
            connected: input::load_connected_peers(&files.connected.path())
                .map_err(wrap(Category::Connected))?,
            established: peer_list(Category::Established, &files.established)?,
            successful: peer_list(Category::Successful, &files.successful)?,
            failed: peer_list(Category::Failed, &files.failed)?,
        })
    }

    pub fn compare(&self) -> ComparisonResult {
        ComparisonResult::compute(
            &self.visited,
            &self.known,
            &self.connected,
            &self.successful,
            &self.failed,
        )
    }

    /// Row for `total.dat`: known, connected, established, failed, successful.
    pub fn totals_row(&self) -> [usize; 5] {
        [
            self.known.len(),
            self.connected.len(),
            self.established.len(),
            self.failed.len(),
            self.successful.len(),
        ]
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ComparisonResult {
    pub dht_peers: usize,
    pub reachable_dht_peers: usize,
    pub known_peers: usize,
    pub connected_peers: usize,
    pub successful_connections: usize,
    pub failed_connections: usize,
    pub dht_but_not_known: usize,
    pub dht_but_not_connected: usize,
    pub dht_but_not_successful: usize,
    pub dht_but_failed: usize,
    pub known_but_not_dht: usize,
    pub connected_but_not_dht: usize,
    pub connected_but_not_dht_reachable: usize,
    pub successful_but_not_dht: usize,
    pub successful_but_not_dht_reachable: usize,
}

impl ComparisonResult {
    /// One pass of membership tests per input set. Inputs are taken as-is.
    pub fn compute(
        visited: &HashMap<PeerId, VisitedPeer>,
        known: &HashSet<PeerId>,
        connected: &HashMap<PeerId, ConnectedPeer>,
        successful: &HashSet<PeerId>,
        failed: &HashSet<PeerId>,
    ) -> Self {
        let mut result = ComparisonResult {
            dht_peers: visited.len(),
            reachable_dht_peers: visited.len(),
            known_peers: known.len(),
            connected_peers: connected.len(),
            successful_connections: successful.len(),
            failed_connections: failed.len(),
            ..Default::default()
        };

        for (id, peer) in visited {
            if !peer.reachable {
                result.reachable_dht_peers -= 1;
                continue;
            }
            if !known.contains(id) {
                result.dht_but_not_known += 1;
            }
            if !connected.contains_key(id) {
                result.dht_but_not_connected += 1;
            }
            if !successful.contains(id) {
                result.dht_but_not_successful += 1;
            }
            if failed.contains(id) {
                result.dht_but_failed += 1;
            }
        }

        result.known_but_not_dht = known.iter().filter(|id| !visited.contains_key(*id)).count();

        for id in connected.keys() {
            match visited.get(id) {
                None => result.connected_but_not_dht += 1,
                Some(peer) if !peer.reachable => result.connected_but_not_dht_reachable += 1,
                Some(_) => {}
            }
        }

        for id in successful {
            match visited.get(id) {
                None => result.successful_but_not_dht += 1,
                Some(peer) if !peer.reachable => result.successful_but_not_dht_reachable += 1,
                Some(_) => {}
            }
        }

        result
    }

    /// Stats row in field order.
    pub fn as_row(&self) -> [usize; 15] {
        [
            self.dht_peers,
            self.reachable_dht_peers,
            self.known_peers,
            self.connected_peers,
            self.successful_connections,
            self.failed_connections,
            self.dht_but_not_known,
            self.dht_but_not_connected,
            self.dht_but_not_successful,
            self.dht_but_failed,
            self.known_but_not_dht,
            self.connected_but_not_dht,
            self.connected_but_not_dht_reachable,
            self.successful_but_not_dht,
            self.successful_but_not_dht_reachable,
        ]
    }
}

/// Count inbound and outbound connections.
pub fn directions(connected: &HashMap<PeerId, ConnectedPeer>) -> (usize, usize) {
    connected
        .values()
        .fold((0, 0), |(inbound, outbound), peer| match peer.direction {
            Direction::Inbound => (inbound + 1, outbound),
            Direction::Outbound => (inbound, outbound + 1),
            Direction::Unknown => (inbound, outbound),
        })
}
