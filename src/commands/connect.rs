use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};

use super::{parse_options, CommandResult};
use crate::config::ConfigTable;
use crate::context::RunContext;
use crate::correlator::DEFAULT_DATE_FORMAT;
use crate::crawler::CrawlImporter;
use crate::input;
use crate::network::TcpNetwork;
use crate::peers::PeerAddrInfo;
use crate::types::{SharedCrawler, SharedNetwork};
use crate::workers::{self, WorkerSettings};

pub const BOOTSTRAP_PEERS: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/138.201.67.219/tcp/4001/p2p/QmUd6zHcbkbcs7SMxwLs48qZVX3vpcM8errYS7xEczwRMA",
    "/ip4/138.201.67.220/tcp/4001/p2p/QmNSYxZAiJHeLdkBg38roksAR9So7Y5eojks1yjEcUtZ7i",
    "/ip4/138.201.68.74/tcp/4001/p2p/QmdnXwLrC8p1ueiq2Qya8joNvk3TVVDAut7PrikmZwubtR",
    "/ip4/94.130.135.167/tcp/4001/p2p/QmUEMvxS2e7iDrereVYc5SWPauXPyNwxcy9BXZrC1QTcHE",
];

const DEFAULTS: &[(&str, &str)] = &[
    ("LogToStdout", ""),
    ("StatsFile", "peersStat.dat"),
    ("StatsInterval", "5s"),
    ("DateFormat", DEFAULT_DATE_FORMAT),
    ("MeasureConnections", ""),
    ("DHTPeers", ""),
    ("DHTConnsPerSec", "5"),
    ("Snapshots", ""),
    ("SnapshotInterval", "10m"),
    ("DHTCrawlInterval", ""),
    ("DHTCrawlOut", "crawls"),
    ("DHTCacheFile", "crawls/nodes.cache"),
    ("Bootstrap", ""),
    ("DialTimeout", "10s"),
];

const USAGE: &str = "\
Usage: peerwatch connect [options]

General options:
Help                      Show this help message and quit
LogToStdout               Log every stats row
StatsFile=<file>          Write to stats file <file> (default: peersStat.dat)
StatsInterval=<dur>       Stats collecting interval (default: 5s) (units: ms, s, m, h)
DateFormat=<format>       strftime date format for file names (default: %y-%m-%d--%H:%M:%S)
MeasureConnections=<file> Track mean connection attempt time and write it to <file>
DialTimeout=<dur>         Give up on a single address after <dur> (default: 10s)
Bootstrap=<file>          Multi-addresses to bootstrap from, one per line
                          (default: built-in list)

Snapshot options:
Snapshots=<dir>           Write snapshots of known/connected/... peers to files in <dir>
SnapshotInterval=<dur>    Snapshot interval (default: 10m)

DHT scan options:
DHTPeers=<file>           Dial the peers of the crawl file <file>
DHTConnsPerSec=<value>    Start at most <value> connections to DHT peers per second (default: 5)

DHT crawl options:
DHTCrawlInterval=<dur>    Import a DHT crawl every <dur> (default: off)
DHTCrawlOut=<dir>         Directory of the crawl output files (default: crawls)
DHTCacheFile=<file>       Cache of reachable crawl nodes (default: crawls/nodes.cache;
                          empty to disable caching)";

fn bootstrap_peers(config: &ConfigTable) -> Result<Vec<PeerAddrInfo>, input::InputError> {
    match config.optional("Bootstrap") {
        Some(path) => input::load_bootstrap_file(Path::new(path)),
        None => input::parse_bootstrap_addrs(BOOTSTRAP_PEERS),
    }
}

fn settings(config: &ConfigTable) -> Result<WorkerSettings, Box<dyn std::error::Error + Send + Sync>> {
    Ok(WorkerSettings {
        bootstrap: bootstrap_peers(config)?,
        stats_file: PathBuf::from(config.required("StatsFile")?),
        stats_interval: config.duration("StatsInterval")?,
        log_to_stdout: config.flag("LogToStdout"),
        measure_connections: config.optional("MeasureConnections").map(PathBuf::from),
        dht_peers: config.optional("DHTPeers").map(PathBuf::from),
        dht_conns_per_sec: config.number("DHTConnsPerSec")?,
        snapshots: config.optional("Snapshots").map(PathBuf::from),
        snapshot_interval: config.duration("SnapshotInterval")?,
        date_format: config.date_format("DateFormat")?.to_string(),
        crawl_interval: config.optional_duration("DHTCrawlInterval")?,
        crawl_out: PathBuf::from(config.get("DHTCrawlOut")),
        cache_file: config.optional("DHTCacheFile").map(PathBuf::from),
    })
}

pub async fn run<S: AsRef<str>>(args: &[S]) -> CommandResult {
    let Some(config) = parse_options(DEFAULTS, &[], USAGE, args)? else {
        return Ok(());
    };
    let settings = settings(&config)?;
    let network: SharedNetwork = Arc::new(TcpNetwork::new(config.duration("DialTimeout")?));
    let crawler: SharedCrawler = Arc::new(CrawlImporter::new(
        &settings.crawl_out,
        settings.date_format.as_str(),
    ));

    let ctx = RunContext::new();
    tokio::spawn({
        let shutdown = ctx.shutdown.clone();
        async move {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
            shutdown.trigger();
        }
    });

    info!("Press Ctrl-C to stop");
    workers::run_workers(ctx, network, crawler, settings).await?;
    Ok(())
}
