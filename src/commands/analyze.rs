use std::fmt::Write as _;
use std::path::Path;

use super::{parse_options, CommandResult};
use crate::analysis::{directions, ComparisonResult, SnapshotMaps};
use crate::config::{ConfigError, ConfigTable};
use crate::correlator::{self, parse_timestamp, FilesForAnalysis, DEFAULT_DATE_FORMAT};

const DEFAULTS: &[(&str, &str)] = &[
    ("DateFormat", DEFAULT_DATE_FORMAT),
    ("Timestamp", ""),
    ("DHTCrawlDir", "crawls"),
    ("SnapshotDir", "snapshots"),
    ("SnapshotTS", ""),
];

const USAGE: &str = "\
Usage: peerwatch analyze [arguments]

Required arguments:
Timestamp=<value>         Timestamp to use (see DateFormat); the next crawl and
                          snapshots from this point on will be used

Optional arguments:
DateFormat=<format>       strftime date format (default: %y-%m-%d--%H:%M:%S)
DHTCrawlDir=<dir>         Directory in which the crawl output files are located (default: crawls)
SnapshotDir=<dir>         Directory in which the snapshots are located (default: snapshots)
SnapshotTS=<value>        Timestamp to use for snapshots (if given, Timestamp is
                          used for the crawl only)";

fn timestamp(config: &ConfigTable, key: &str, date_format: &str) -> Result<chrono::NaiveDateTime, ConfigError> {
    parse_timestamp(config.get(key), date_format).ok_or_else(|| ConfigError::InvalidValue {
        key: key.to_string(),
        value: config.get(key).to_string(),
        reason: format!("does not match date format {date_format}"),
    })
}

pub fn describe_files(files: &FilesForAnalysis) -> String {
    let mut out = String::new();
    if let Some(crawl) = &files.visited_peers {
        let _ = writeln!(out, "Using DHT crawl file: {crawl}");
    }
    let _ = writeln!(out, "Using known peers snapshot file: {}", files.known);
    let _ = writeln!(out, "Using connected peers snapshot file: {}", files.connected);
    let _ = writeln!(out, "Using established connections snapshot file: {}", files.established);
    let _ = writeln!(out, "Using successful connections snapshot file: {}", files.successful);
    let _ = writeln!(out, "Using failed connections snapshot file: {}", files.failed);
    out
}

pub fn describe_comparison(result: &ComparisonResult, inbound: usize, outbound: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Reachable DHT peers: {} (total: {})",
        result.reachable_dht_peers, result.dht_peers
    );
    let _ = writeln!(
        out,
        "Peers known: {}; connected: {} (inbound: {}, outbound: {})",
        result.known_peers, result.connected_peers, inbound, outbound
    );
    let _ = writeln!(
        out,
        "Connections successful: {}; failed: {}\n",
        result.successful_connections, result.failed_connections
    );
    for (label, value) in [
        ("DHT-reachable, but not known", result.dht_but_not_known),
        ("DHT-reachable, but not connected", result.dht_but_not_connected),
        ("DHT-reachable, but not successful", result.dht_but_not_successful),
        ("DHT-reachable, but failed", result.dht_but_failed),
        ("Known, but not in DHT crawl", result.known_but_not_dht),
        ("Connected, but not in DHT crawl", result.connected_but_not_dht),
        (
            "Connected, but not marked as reachable in DHT crawl",
            result.connected_but_not_dht_reachable,
        ),
        ("Successful, but not in DHT crawl", result.successful_but_not_dht),
        (
            "Successful, but not DHT-reachable",
            result.successful_but_not_dht_reachable,
        ),
    ] {
        let _ = writeln!(out, "{label}: {value}");
    }
    out
}

pub fn analyze(
    crawl_dir: &Path,
    snapshot_dir: &Path,
    crawl_ts: chrono::NaiveDateTime,
    snapshot_ts: chrono::NaiveDateTime,
    date_format: &str,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let candidates = correlator::list_candidates(&[crawl_dir, snapshot_dir])?;
    let files = correlator::files_for_analysis(&candidates, Some(crawl_ts), snapshot_ts, date_format)?;
    let maps = SnapshotMaps::load(&files)?;
    let (inbound, outbound) = directions(&maps.connected);

    Ok(format!(
        "{}\n{}",
        describe_files(&files),
        describe_comparison(&maps.compare(), inbound, outbound)
    ))
}

pub fn run<S: AsRef<str>>(args: &[S]) -> CommandResult {
    let Some(config) = parse_options(DEFAULTS, &["Timestamp"], USAGE, args)? else {
        return Ok(());
    };
    let date_format = config.date_format("DateFormat")?;
    let crawl_ts = timestamp(&config, "Timestamp", date_format)?;
    let snapshot_ts = match config.optional("SnapshotTS") {
        Some(_) => timestamp(&config, "SnapshotTS", date_format)?,
        None => crawl_ts,
    };

    let report = analyze(
        Path::new(config.get("DHTCrawlDir")),
        Path::new(config.get("SnapshotDir")),
        crawl_ts,
        snapshot_ts,
        date_format,
    )?;
    print!("{report}");
    Ok(())
}
