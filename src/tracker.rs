use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::peers::PeerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerState {
    InFlight,
    Failed,
    Established,
}

/// Counts read under a single lock acquisition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionCounts {
    pub established: usize,
    pub failed: usize,
    pub in_flight: usize,
    pub successful_ever: usize,
    /// Peers that ever left the untried state.
    pub seen: usize,
}

#[derive(Default)]
struct TrackerState {
    peers: HashMap<PeerId, PeerState>,
    successful_ever: HashSet<PeerId>,
    established: usize,
    failed: usize,
    in_flight: usize,
}

impl TrackerState {
    fn counter(&mut self, state: PeerState) -> &mut usize {
        match state {
            PeerState::InFlight => &mut self.in_flight,
            PeerState::Failed => &mut self.failed,
            PeerState::Established => &mut self.established,
        }
    }

    fn set(&mut self, peer: &PeerId, next: PeerState) {
        let previous = self.peers.insert(peer.clone(), next);
        if previous == Some(next) {
            return;
        }
        if let Some(previous) = previous {
            *self.counter(previous) -= 1;
        }
        *self.counter(next) += 1;
    }
}

// A peer absent from `peers` is untried. `successful_ever` is never pruned.
#[derive(Default)]
pub struct ConnectionTracker {
    state: Mutex<TrackerState>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the single in-flight slot of an untried or failed peer.
    pub fn try_reserve(&self, peer: &PeerId) -> bool {
        let mut state = self.state.lock();
        match state.peers.get(peer) {
            None | Some(PeerState::Failed) => {
                state.set(peer, PeerState::InFlight);
                trace!("Reserved attempt for {}", peer);
                true
            }
            Some(PeerState::InFlight) | Some(PeerState::Established) => false,
        }
    }

    /// Like [`Self::try_reserve`], but an established peer may be dialled
    /// again. Used for the bootstrap list.
    pub fn try_redial(&self, peer: &PeerId) -> bool {
        let mut state = self.state.lock();
        if state.peers.get(peer) == Some(&PeerState::InFlight) {
            return false;
        }
        state.set(peer, PeerState::InFlight);
        true
    }

    pub fn mark_established(&self, peer: &PeerId) {
        let mut state = self.state.lock();
        state.set(peer, PeerState::Established);
        state.successful_ever.insert(peer.clone());
    }

    /// Only the latest outcome counts: an established peer that fails a new
    /// attempt is demoted. The successful-ever set is left alone.
    pub fn mark_failed(&self, peer: &PeerId) {
        self.state.lock().set(peer, PeerState::Failed);
    }

    pub fn counts(&self) -> ConnectionCounts {
        let state = self.state.lock();
        ConnectionCounts {
            established: state.established,
            failed: state.failed,
            in_flight: state.in_flight,
            successful_ever: state.successful_ever.len(),
            seen: state.peers.len(),
        }
    }

    #[cfg(test)]
    pub fn state_of(&self, peer: &PeerId) -> Option<PeerState> {
        self.state.lock().peers.get(peer).copied()
    }

    /// Sorted peers currently in `wanted`.
    pub fn peers_in(&self, wanted: PeerState) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .state
            .lock()
            .peers
            .iter()
            .filter(|(_, state)| **state == wanted)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn successful_ever(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.state.lock().successful_ever.iter().cloned().collect();
        peers.sort();
        peers
    }

    /// Reserve `peer` and hand back a guard that resolves the attempt.
    pub fn reserve(self: &Arc<Self>, peer: PeerId) -> Option<Attempt> {
        self.try_reserve(&peer).then(|| Attempt::new(self.clone(), peer))
    }

    /// [`Self::reserve`] for [`Self::try_redial`].
    pub fn redial(self: &Arc<Self>, peer: PeerId) -> Option<Attempt> {
        self.try_redial(&peer).then(|| Attempt::new(self.clone(), peer))
    }
}

/// An in-flight attempt. Dropping it unresolved marks the peer failed, so a
/// cancelled or panicking dial never leaves the peer stuck in flight.
pub struct Attempt {
    tracker: Arc<ConnectionTracker>,
    peer: PeerId,
    resolved: bool,
}

impl Attempt {
    fn new(tracker: Arc<ConnectionTracker>, peer: PeerId) -> Self {
        Self {
            tracker,
            peer,
            resolved: false,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn established(mut self) {
        self.resolved = true;
        self.tracker.mark_established(&self.peer);
    }

    pub fn failed(mut self) {
        self.resolved = true;
        self.tracker.mark_failed(&self.peer);
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if !self.resolved {
            self.tracker.mark_failed(&self.peer);
        }
    }
}
