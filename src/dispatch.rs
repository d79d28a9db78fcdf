use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::context::{RunContext, Shutdown};
use crate::network::NetworkError;
use crate::peers::PeerAddrInfo;
use crate::ratelimit::TokenBucket;
use crate::tracker::Attempt;
use crate::types::{GenericBoxedStream, SharedNetwork};

pub type AttemptHandle = JoinHandle<Result<(), NetworkError>>;

/// Await the next candidate unless shutdown comes first.
async fn next_or_shutdown<T>(stream: &mut GenericBoxedStream<T>, shutdown: &Shutdown) -> Option<T> {
    tokio::select! {
        biased;
        _ = shutdown.wait() => None,
        item = stream.next() => item,
    }
}

fn spawn_resolved(ctx: &RunContext, network: &SharedNetwork, peer: PeerAddrInfo, attempt: Attempt) -> AttemptHandle {
    let guard = ctx.in_flight.enter();
    let network = network.clone();
    let durations = ctx.durations.clone();
    tokio::spawn(async move {
        let _guard = guard;
        let started = Instant::now();
        let result = network.connect(&peer).await;
        durations.record(result.is_ok(), started.elapsed());
        match &result {
            Ok(()) => attempt.established(),
            Err(e) => {
                debug!("Connection attempt to {} failed: {}", attempt.peer(), e);
                attempt.failed();
            }
        }
        result
    })
}

/// Reserve `peer` and dial it in the background. `None` when the tracker
/// refuses the reservation.
pub fn spawn_attempt(ctx: &RunContext, network: &SharedNetwork, peer: PeerAddrInfo) -> Option<AttemptHandle> {
    let attempt = ctx.tracker.reserve(peer.id.clone())?;
    Some(spawn_resolved(ctx, network, peer, attempt))
}

/// Like [`spawn_attempt`] but also dials peers that are already established.
pub fn spawn_redial(ctx: &RunContext, network: &SharedNetwork, peer: PeerAddrInfo) -> Option<AttemptHandle> {
    let attempt = ctx.tracker.redial(peer.id.clone())?;
    Some(spawn_resolved(ctx, network, peer, attempt))
}

/// Offer every candidate to the tracker, taking one token per dial. Returns
/// the handles of the attempts that were started.
pub async fn dispatch_paced(
    ctx: &RunContext,
    network: &SharedNetwork,
    bucket: &TokenBucket,
    mut candidates: GenericBoxedStream<PeerAddrInfo>,
) -> Vec<AttemptHandle> {
    let mut started = Vec::new();
    while let Some(peer) = next_or_shutdown(&mut candidates, &ctx.shutdown).await {
        if !bucket.try_acquire() {
            tokio::select! {
                biased;
                _ = ctx.shutdown.wait() => break,
                _ = bucket.acquire() => {}
            }
        }
        if let Some(handle) = spawn_attempt(ctx, network, peer) {
            started.push(handle);
        }
    }
    if ctx.shutdown.is_triggered() {
        info!("Dispatch stopped by shutdown after {} attempts", started.len());
    }
    started
}

pub fn candidate_stream(peers: impl IntoIterator<Item = PeerAddrInfo>) -> GenericBoxedStream<PeerAddrInfo> {
    let peers: Vec<PeerAddrInfo> = peers.into_iter().collect();
    futures_util::stream::iter(peers).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::PeerNetwork;
    use crate::peers::{ConnectionInfo, PeerId};
    use crate::tracker::PeerState;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::Duration;

    /// Peers whose id starts with `ok` connect, everything else fails.
    #[derive(Default)]
    struct ScriptedNetwork {
        dials: Mutex<Vec<(PeerId, Instant)>>,
    }

    #[async_trait]
    impl PeerNetwork for ScriptedNetwork {
        async fn connect(&self, peer: &PeerAddrInfo) -> Result<(), NetworkError> {
            self.dials.lock().push((peer.id.clone(), Instant::now()));
            tokio::time::sleep(Duration::from_millis(10)).await;
            if peer.id.as_str().starts_with("ok") {
                Ok(())
            } else {
                Err(NetworkError::NoAddresses(peer.id.clone()))
            }
        }

        async fn known_peers(&self) -> HashMap<PeerId, Vec<String>> {
            HashMap::new()
        }

        async fn connected_peers(&self) -> Vec<ConnectionInfo> {
            vec![]
        }

        async fn learn(&self, _peer: &PeerAddrInfo) {}
    }

    fn peer(id: &str) -> PeerAddrInfo {
        PeerAddrInfo {
            id: id.parse().unwrap(),
            addrs: vec![],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_is_paced_and_deduplicated() {
        let ctx = RunContext::new();
        let scripted = Arc::new(ScriptedNetwork::default());
        let network: SharedNetwork = scripted.clone();
        let bucket = TokenBucket::per_second(2);
        let start = Instant::now();

        let candidates = candidate_stream(
            ["ok1", "bad1", "ok1", "ok2", "bad2"].into_iter().map(peer),
        );
        let handles = dispatch_paced(&ctx, &network, &bucket, candidates).await;
        assert_eq!(handles.len(), 4);

        let results = futures_util::future::join_all(handles).await;
        assert_eq!(results.iter().filter(|r| matches!(r, Ok(Ok(())))).count(), 2);
        ctx.in_flight.wait_idle().await;

        let dials = scripted.dials.lock();
        let ids: HashSet<&str> = dials.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids.len(), 4);
        // two tokens per second: the fifth candidate waits for the third window
        assert!(dials.iter().all(|(_, at)| at.duration_since(start) <= Duration::from_secs(2)));
        assert!(dials.iter().any(|(_, at)| at.duration_since(start) >= Duration::from_secs(2)));

        let counts = ctx.tracker.counts();
        assert_eq!((counts.established, counts.failed, counts.in_flight), (2, 2, 0));
        assert_eq!(ctx.durations.mean_millis()[1], 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_dispatch() {
        let ctx = RunContext::new();
        let network: SharedNetwork = Arc::new(ScriptedNetwork::default());
        let bucket = TokenBucket::per_second(1);
        ctx.shutdown.trigger();

        let handles =
            dispatch_paced(&ctx, &network, &bucket, candidate_stream((0..10).map(|n| peer(&format!("ok{n}"))))).await;
        assert!(handles.is_empty());
        assert_eq!(ctx.tracker.counts().seen, 0);
    }

    #[tokio::test]
    async fn test_redial_established_peer() {
        let ctx = RunContext::new();
        let network: SharedNetwork = Arc::new(ScriptedNetwork::default());

        spawn_attempt(&ctx, &network, peer("ok1")).unwrap().await.unwrap().unwrap();
        assert!(spawn_attempt(&ctx, &network, peer("ok1")).is_none());

        let handle = spawn_redial(&ctx, &network, peer("ok1")).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(ctx.tracker.state_of(&"ok1".parse().unwrap()), Some(PeerState::Established));
    }
}
