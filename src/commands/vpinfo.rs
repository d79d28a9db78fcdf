use std::fmt::Write as _;
use std::path::Path;

use super::{parse_options, CommandResult};
use crate::input::{self, CrawlFile};

const DEFAULTS: &[(&str, &str)] = &[("Limit", "10")];

const USAGE: &str = "\
Usage: peerwatch vpinfo <file> [options]

Options:
Limit=<n>                 Number of peers to list (default: 10)";

/// Human-readable dump of a crawl file: totals, then up to `limit` peers in
/// id order with their multi-addresses.
pub fn describe(crawl: &CrawlFile, limit: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Total number of peers: {}", crawl.nodes.len());
    let reachable = crawl.nodes.values().filter(|p| p.reachable).count();
    let _ = writeln!(out, "Reachable peers: {}", reachable);
    if !crawl.start_timestamp.is_empty() {
        let _ = writeln!(out, "Crawl: {} to {}", crawl.start_timestamp, crawl.end_timestamp);
    }
    out.push('\n');

    let mut peers: Vec<_> = crawl.nodes.values().collect();
    peers.sort_by(|a, b| a.id.cmp(&b.id));
    for peer in peers.into_iter().take(limit) {
        let _ = writeln!(out, "ID: {}", peer.id);
        if !peer.agent_version.is_empty() {
            let _ = writeln!(out, "Agent: {}", peer.agent_version);
        }
        for (i, addr) in peer.addrs.iter().enumerate() {
            let _ = writeln!(out, "MA{}: {}", i, addr);
        }
        out.push('\n');
    }
    out
}

pub fn run<S: AsRef<str>>(file: &Path, args: &[S]) -> CommandResult {
    let Some(config) = parse_options(DEFAULTS, &[], USAGE, args)? else {
        return Ok(());
    };
    let limit: usize = config.number("Limit")?;
    let crawl = input::load_crawl_file(file)?;
    print!("{}", describe(&crawl, limit));
    Ok(())
}
