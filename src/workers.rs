use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::context::RunContext;
use crate::correlator::Category;
use crate::crawler::CrawlRound;
use crate::dispatch::{self, candidate_stream, AttemptHandle};
use crate::input;
use crate::peers::{PeerAddrInfo, PeerId};
use crate::ratelimit::TokenBucket;
use crate::stats::{RowObserver, StatsFile};
use crate::tracker::PeerState;
use crate::types::{SharedCrawler, SharedNetwork};

pub const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Everything the live loops need to know, resolved from the command line.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub bootstrap: Vec<PeerAddrInfo>,
    pub stats_file: PathBuf,
    pub stats_interval: Duration,
    pub log_to_stdout: bool,
    pub measure_connections: Option<PathBuf>,
    pub dht_peers: Option<PathBuf>,
    pub dht_conns_per_sec: u32,
    pub snapshots: Option<PathBuf>,
    pub snapshot_interval: Duration,
    pub date_format: String,
    pub crawl_interval: Option<Duration>,
    pub crawl_out: PathBuf,
    pub cache_file: Option<PathBuf>,
}

/// Sleep for `period` unless shutdown arrives first. Returns `false` on
/// shutdown.
async fn tick(ctx: &RunContext, period: Duration) -> bool {
    tokio::select! {
        biased;
        _ = ctx.shutdown.wait() => false,
        _ = tokio::time::sleep(period) => true,
    }
}

async fn join_attempts(handles: Vec<AttemptHandle>) {
    for joined in futures_util::future::join_all(handles).await {
        if let Err(e) = joined {
            error!("Connection attempt task failed: {}", e);
        }
    }
}

/// Run every configured loop until shutdown, then wait for the attempts still
/// in flight and close the stats files.
pub async fn run_workers(
    ctx: RunContext,
    network: SharedNetwork,
    crawler: SharedCrawler,
    settings: WorkerSettings,
) -> Result<(), crate::stats::StatsError> {
    info!("Worker runtime started");

    // the main stats file is required, everything else degrades to a warning
    let stats = open_stats(&ctx, &settings)?;
    let durations = match &settings.measure_connections {
        Some(path) => match ctx.stats.open(path) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("Not collecting duration stats: {}", e);
                None
            }
        },
        None => None,
    };
    let bucket = Arc::new(TokenBucket::per_second(settings.dht_conns_per_sec));

    let mut handles: Vec<JoinHandle<()>> = vec![
        task::spawn(bootstrap(ctx.clone(), network.clone(), settings.bootstrap.clone())),
        task::spawn(stats_loop(
            ctx.clone(),
            network.clone(),
            stats,
            durations,
            settings.stats_interval,
        )),
        task::spawn(flush_loop(ctx.clone())),
    ];
    if let Some(path) = settings.dht_peers.clone() {
        handles.push(task::spawn(dht_peers(
            ctx.clone(),
            network.clone(),
            bucket.clone(),
            path,
        )));
    }
    if let Some(interval) = settings.crawl_interval {
        handles.push(task::spawn(crawl_loop(
            ctx.clone(),
            network.clone(),
            crawler,
            bucket.clone(),
            settings.clone(),
            interval,
        )));
    }
    if let Some(dir) = settings.snapshots.clone() {
        handles.push(task::spawn(snapshot_loop(
            ctx.clone(),
            network.clone(),
            dir,
            settings.date_format.clone(),
            settings.snapshot_interval,
        )));
    }

    for joined in futures_util::future::join_all(handles).await {
        if let Err(e) = joined {
            error!("Worker task failed: {}", e);
        }
    }

    let pending = ctx.in_flight.current();
    if pending > 0 {
        info!("Waiting for {} connection attempts to finish", pending);
    }
    ctx.in_flight.wait_idle().await;

    debug!("Closing {} stats files", ctx.stats.len());
    for e in ctx.stats.close_all() {
        error!("Stats flush error: {}", e);
    }
    info!("Worker runtime exited");
    Ok(())
}

fn open_stats(
    ctx: &RunContext,
    settings: &WorkerSettings,
) -> Result<Arc<StatsFile>, crate::stats::StatsError> {
    if !settings.log_to_stdout {
        return ctx.stats.open(&settings.stats_file);
    }
    let echo: RowObserver = Box::new(|row: &[f64]| {
        if let [known, connected, established, failed, in_flight, successful, ..] = row {
            info!(
                "known={} connected={} established={} failed={} initiated={} successful={}",
                known, connected, established, failed, in_flight, successful
            );
        }
    });
    ctx.stats.open_with_observer(&settings.stats_file, echo)
}

async fn bootstrap(ctx: RunContext, network: SharedNetwork, peers: Vec<PeerAddrInfo>) {
    info!("Connecting to {} bootstrap peers", peers.len());
    let mut pending = Vec::new();
    for peer in peers {
        let id = peer.id.clone();
        if let Some(handle) = dispatch::spawn_redial(&ctx, &network, peer) {
            pending.push((id, handle));
        }
    }
    for (id, handle) in pending {
        match handle.await {
            Ok(Ok(())) => debug!("Connected to bootstrap peer {}", id),
            Ok(Err(e)) => warn!("Could not connect to bootstrap peer {}: {}", id, e),
            Err(e) => error!("Bootstrap attempt task failed: {}", e),
        }
    }
}

/// Hand crawled addresses to the network so they show up as known peers,
/// whether or not the paced dial reaches them before shutdown.
async fn learn_all(network: &SharedNetwork, peers: &[PeerAddrInfo]) {
    for peer in peers {
        network.learn(peer).await;
    }
}

async fn dht_peers(ctx: RunContext, network: SharedNetwork, bucket: Arc<TokenBucket>, path: PathBuf) {
    let peers = match task::spawn_blocking(move || input::load_visited_peers(&path)).await {
        Ok(Ok(peers)) => peers,
        Ok(Err(e)) => {
            warn!("Error loading peers from DHT scan: {}", e);
            return;
        }
        Err(e) => {
            error!("DHT peer loader failed: {}", e);
            return;
        }
    };
    info!(
        "Dialling {} peers from DHT scan, {} per second",
        peers.len(),
        bucket.capacity()
    );

    let mut infos: Vec<PeerAddrInfo> = peers.values().map(|node| node.addr_info()).collect();
    infos.sort_by(|a, b| a.id.cmp(&b.id));
    learn_all(&network, &infos).await;
    let handles = dispatch::dispatch_paced(&ctx, &network, &bucket, candidate_stream(infos)).await;
    join_attempts(handles).await;
}

async fn crawl_loop(
    ctx: RunContext,
    network: SharedNetwork,
    crawler: SharedCrawler,
    bucket: Arc<TokenBucket>,
    settings: WorkerSettings,
    interval: Duration,
) {
    loop {
        // the next interval starts with the crawl, the next crawl waits for
        // both the interval and the previous batch of attempts
        let batch = task::spawn({
            let ctx = ctx.clone();
            let network = network.clone();
            let crawler = crawler.clone();
            let bucket = bucket.clone();
            let settings = settings.clone();
            async move {
                let round = CrawlRound {
                    out_dir: &settings.crawl_out,
                    cache_file: settings.cache_file.as_deref(),
                };
                let reachable = match round.run(crawler.as_ref(), &settings.bootstrap).await {
                    Ok(reachable) => reachable,
                    Err(e) => {
                        warn!("DHT crawl failed: {}", e);
                        return;
                    }
                };
                let mut infos: Vec<PeerAddrInfo> = reachable.into_values().collect();
                infos.sort_by(|a, b| a.id.cmp(&b.id));
                learn_all(&network, &infos).await;
                let handles =
                    dispatch::dispatch_paced(&ctx, &network, &bucket, candidate_stream(infos)).await;
                join_attempts(handles).await;
            }
        });

        let keep_going = tick(&ctx, interval).await;
        if let Err(e) = batch.await {
            error!("Crawl batch failed: {}", e);
        }
        if !keep_going {
            info!("Crawl loop: shutdown signal received");
            break;
        }
    }
}

async fn stats_loop(
    ctx: RunContext,
    network: SharedNetwork,
    stats: Arc<StatsFile>,
    durations: Option<Arc<StatsFile>>,
    interval: Duration,
) {
    while tick(&ctx, interval).await {
        let known = network.known_peers().await;
        let connected: HashSet<PeerId> = network
            .connected_peers()
            .await
            .into_iter()
            .map(|conn| conn.peer)
            .collect();
        let counts = ctx.tracker.counts();

        stats.append_ints(&[
            known.len(),
            connected.len(),
            counts.established,
            counts.failed,
            counts.in_flight,
            counts.successful_ever,
        ]);
        if let Some(durations) = &durations {
            durations.append_row(ctx.durations.mean_millis().to_vec());
        }

        let mut offered = 0;
        for (id, addrs) in known {
            if connected.contains(&id) {
                continue;
            }
            if dispatch::spawn_attempt(&ctx, &network, PeerAddrInfo { id, addrs }).is_some() {
                offered += 1;
            }
        }
        if offered > 0 {
            debug!("Dialling {} known but unconnected peers", offered);
        }
    }
    info!("Stats loop: shutdown signal received");
}

async fn flush_loop(ctx: RunContext) {
    while tick(&ctx, FLUSH_INTERVAL).await {
        let stats = ctx.stats.clone();
        match task::spawn_blocking(move || stats.flush_all()).await {
            Ok(errors) => {
                for e in errors {
                    warn!("Stats flush error: {}", e);
                }
            }
            Err(e) => error!("Stats flush task failed: {}", e),
        }
    }
}

/// Rows of every snapshot category, gathered at one instant.
struct SnapshotRows(Vec<(Category, Vec<String>)>);

async fn collect_snapshot(ctx: &RunContext, network: &SharedNetwork) -> SnapshotRows {
    let mut known: Vec<PeerId> = network.known_peers().await.into_keys().collect();
    known.sort();
    let connected = network.connected_peers().await;

    SnapshotRows(vec![
        (Category::Known, input::peer_rows(&known)),
        (Category::Connected, input::connection_rows(&connected)),
        (
            Category::Established,
            input::peer_rows(&ctx.tracker.peers_in(PeerState::Established)),
        ),
        (
            Category::Successful,
            input::peer_rows(&ctx.tracker.successful_ever()),
        ),
        (
            Category::Failed,
            input::peer_rows(&ctx.tracker.peers_in(PeerState::Failed)),
        ),
    ])
}

fn write_snapshot_set(dir: &std::path::Path, date_format: &str, rows: SnapshotRows) {
    let at = Local::now().naive_local();
    for (category, rows) in rows.0 {
        if let Err(e) = input::write_snapshot(dir, category, date_format, at, &rows) {
            // later categories would not match this timestamp set anyway
            warn!("Failed to write {} snapshot: {}", category.name(), e);
            return;
        }
    }
    debug!("Snapshot written to {}", dir.display());
}

async fn snapshot_loop(
    ctx: RunContext,
    network: SharedNetwork,
    dir: PathBuf,
    date_format: String,
    interval: Duration,
) {
    if dir.exists() && !dir.is_dir() {
        warn!("{} is not a directory, not writing snapshots", dir.display());
        return;
    }
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!(
            "Directory {} could not be created ({}), not writing snapshots",
            dir.display(),
            e
        );
        return;
    }

    while tick(&ctx, interval).await {
        let rows = collect_snapshot(&ctx, &network).await;
        let dir = dir.clone();
        let date_format = date_format.clone();
        if let Err(e) = task::spawn_blocking(move || write_snapshot_set(&dir, &date_format, rows)).await {
            error!("Snapshot task failed: {}", e);
        }
    }
    info!("Snapshot loop: shutdown signal received");
}
