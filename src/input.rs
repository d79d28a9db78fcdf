use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::correlator::Category;
use crate::peers::{ConnectedPeer, ConnectionInfo, Direction, PeerAddrInfo, PeerId, VisitedPeer};

static PEER_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(?:p2p|ipfs)/([^/]+)$").expect("peer suffix pattern is valid")
});

#[derive(Debug, Error)]
pub enum InputError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: JSON decode error: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path}, line {line}: {reason}")]
    InvalidRow {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("invalid multi-address {0:?}")]
    InvalidAddress(String),
    #[error("date format {0:?} cannot be rendered")]
    DateFormat(String),
}

fn io_error(path: &Path) -> impl Fn(std::io::Error) -> InputError + '_ {
    move |source| InputError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// On-disk layout of a crawl report (`visitedPeers_*.json`) and of the node
/// cache.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CrawlFileJson {
    #[serde(default)]
    pub start_timestamp: String,
    #[serde(default)]
    pub end_timestamp: String,
    #[serde(rename = "Nodes", default)]
    pub nodes: Vec<CrawlNodeJson>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlNodeJson {
    #[serde(rename = "NodeID")]
    pub node_id: String,
    #[serde(rename = "MultiAddrs", default)]
    pub multi_addrs: Vec<String>,
    #[serde(default)]
    pub reachable: bool,
    #[serde(default)]
    pub agent_version: String,
}

impl From<&VisitedPeer> for CrawlNodeJson {
    fn from(peer: &VisitedPeer) -> Self {
        CrawlNodeJson {
            node_id: peer.id.to_string(),
            multi_addrs: peer.addrs.clone(),
            reachable: peer.reachable,
            agent_version: peer.agent_version.clone(),
        }
    }
}

/// A decoded crawl file.
#[derive(Debug, Default)]
pub struct CrawlFile {
    pub start_timestamp: String,
    pub end_timestamp: String,
    pub nodes: HashMap<PeerId, VisitedPeer>,
}

pub fn load_crawl_file(path: &Path) -> Result<CrawlFile, InputError> {
    let file = File::open(path).map_err(io_error(path))?;
    let decoded: CrawlFileJson =
        serde_json::from_reader(BufReader::new(file)).map_err(|source| InputError::Json {
            path: path.to_path_buf(),
            source,
        })?;

    let mut nodes = HashMap::with_capacity(decoded.nodes.len());
    for node in decoded.nodes {
        let id: PeerId = match node.node_id.parse() {
            Ok(id) => id,
            Err(e) => {
                warn!("Skipping node with bad peer id in {}: {}", path.display(), e);
                continue;
            }
        };
        for addr in &node.multi_addrs {
            validate_multiaddr(addr)?;
        }
        nodes.insert(
            id.clone(),
            VisitedPeer {
                id,
                addrs: node.multi_addrs,
                reachable: node.reachable,
                agent_version: node.agent_version,
            },
        );
    }

    Ok(CrawlFile {
        start_timestamp: decoded.start_timestamp,
        end_timestamp: decoded.end_timestamp,
        nodes,
    })
}

pub fn load_visited_peers(path: &Path) -> Result<HashMap<PeerId, VisitedPeer>, InputError> {
    Ok(load_crawl_file(path)?.nodes)
}

/// Write a crawl file (also used for the node cache).
pub fn save_crawl_file<'a>(
    path: &Path,
    start_timestamp: &str,
    end_timestamp: &str,
    nodes: impl IntoIterator<Item = &'a VisitedPeer>,
) -> Result<(), InputError> {
    let contents = CrawlFileJson {
        start_timestamp: start_timestamp.to_string(),
        end_timestamp: end_timestamp.to_string(),
        nodes: nodes.into_iter().map(CrawlNodeJson::from).collect(),
    };
    let json_err = |source| InputError::Json {
        path: path.to_path_buf(),
        source,
    };
    let bytes = serde_json::to_vec_pretty(&contents).map_err(json_err)?;
    write_atomically(path, &bytes)
}

fn validate_multiaddr(addr: &str) -> Result<(), InputError> {
    if !addr.starts_with('/') || addr.len() < 2 || addr.contains(char::is_whitespace) {
        return Err(InputError::InvalidAddress(addr.to_string()));
    }
    Ok(())
}

fn rows(path: &Path) -> Result<Vec<(usize, String)>, InputError> {
    let content = fs::read_to_string(path).map_err(io_error(path))?;
    Ok(content
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim().to_string()))
        .filter(|(_, line)| !line.is_empty())
        .collect())
}

/// Load a `connected_*.csv` snapshot: `peerID;direction;proto,proto,...`.
pub fn load_connected_peers(path: &Path) -> Result<HashMap<PeerId, ConnectedPeer>, InputError> {
    let mut peers = HashMap::new();
    for (line, row) in rows(path)? {
        let invalid = |reason: String| InputError::InvalidRow {
            path: path.to_path_buf(),
            line,
            reason,
        };
        let fields: Vec<&str> = row.split(';').collect();
        let [id, direction, protocols, ..] = fields.as_slice() else {
            return Err(invalid(format!(
                "expected at least 3 fields, found {}",
                fields.len()
            )));
        };

        let id: PeerId = id.parse().map_err(|e| invalid(format!("{e}")))?;
        let direction = direction
            .parse::<u8>()
            .ok()
            .and_then(Direction::from_code)
            .ok_or_else(|| invalid(format!("bad direction {direction:?}")))?;
        let protocols = protocols
            .split(',')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();

        peers.insert(
            id.clone(),
            ConnectedPeer {
                id,
                direction,
                protocols,
            },
        );
    }
    Ok(peers)
}

/// Load a one-peer-per-line snapshot (known, established, successful, failed).
pub fn load_peer_list(path: &Path) -> Result<HashSet<PeerId>, InputError> {
    rows(path)?
        .into_iter()
        .map(|(line, row)| {
            row.parse().map_err(|e| InputError::InvalidRow {
                path: path.to_path_buf(),
                line,
                reason: format!("{e}"),
            })
        })
        .collect()
}

/// Parse bootstrap multi-addresses ending in `/p2p/<id>` (or `/ipfs/<id>`).
/// Addresses of the same peer are merged, in input order.
pub fn parse_bootstrap_addrs<S: AsRef<str>>(
    addrs: &[S],
) -> Result<Vec<PeerAddrInfo>, InputError> {
    let mut infos: Vec<PeerAddrInfo> = Vec::new();
    for addr in addrs {
        let addr = addr.as_ref().trim();
        if addr.is_empty() || addr.starts_with('#') {
            continue;
        }
        validate_multiaddr(addr)?;
        let id: PeerId = PEER_SUFFIX
            .captures(addr)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| InputError::InvalidAddress(addr.to_string()))?;

        match infos.iter_mut().find(|info| info.id == id) {
            Some(info) => info.addrs.push(addr.to_string()),
            None => infos.push(PeerAddrInfo {
                id,
                addrs: vec![addr.to_string()],
            }),
        }
    }
    Ok(infos)
}

pub fn load_bootstrap_file(path: &Path) -> Result<Vec<PeerAddrInfo>, InputError> {
    let lines: Vec<String> = rows(path)?.into_iter().map(|(_, row)| row).collect();
    parse_bootstrap_addrs(&lines)
}

pub fn peer_rows<'a>(peers: impl IntoIterator<Item = &'a PeerId>) -> Vec<String> {
    peers.into_iter().map(PeerId::to_string).collect()
}

pub fn connection_rows(connections: &[ConnectionInfo]) -> Vec<String> {
    connections
        .iter()
        .map(|c| {
            format!(
                "{};{};{}",
                c.peer,
                c.direction.code(),
                c.protocols.join(",")
            )
        })
        .collect()
}

/// Write `<dir>/<category>_<timestamp>.csv` atomically and return its path.
pub fn write_snapshot(
    dir: &Path,
    category: Category,
    date_format: &str,
    at: NaiveDateTime,
    rows: &[String],
) -> Result<PathBuf, InputError> {
    let mut filename = String::from(category.prefix());
    write!(filename, "{}", at.format(date_format))
        .map_err(|_| InputError::DateFormat(date_format.to_string()))?;
    filename.push_str(".csv");

    let mut content = String::with_capacity(rows.iter().map(|r| r.len() + 1).sum());
    for row in rows {
        content.push_str(row);
        content.push('\n');
    }

    let path = dir.join(filename);
    write_atomically(&path, content.as_bytes())?;
    Ok(path)
}

/// Write to a temporary sibling, sync, then rename over `path`.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), InputError> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    {
        let file = File::create(&tmp_path).map_err(io_error(&tmp_path))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes).map_err(io_error(&tmp_path))?;
        let file = writer
            .into_inner()
            .map_err(|e| io_error(&tmp_path)(e.into_error()))?;
        file.sync_all().map_err(io_error(&tmp_path))?;
    }
    fs::rename(&tmp_path, path).map_err(io_error(path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{parse_timestamp, DEFAULT_DATE_FORMAT};

    fn id(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    #[test]
    fn test_load_crawl_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("visitedPeers_x.json");
        fs::write(
            &path,
            r#"{
                "start_timestamp": "20-01-01--00:00:00",
                "end_timestamp": "20-01-01--00:20:00",
                "Nodes": [
                    {"NodeID": "QmA", "MultiAddrs": ["/ip4/10.0.0.1/tcp/4001"], "reachable": true, "agent_version": "go-ipfs/0.5.0"},
                    {"NodeID": "QmB", "MultiAddrs": []},
                    {"NodeID": "", "MultiAddrs": []}
                ]
            }"#,
        )
        .unwrap();

        let crawl = load_crawl_file(&path).unwrap();
        assert_eq!(crawl.start_timestamp, "20-01-01--00:00:00");
        assert_eq!(crawl.nodes.len(), 2);
        let a = &crawl.nodes[&id("QmA")];
        assert!(a.reachable);
        assert_eq!(a.agent_version, "go-ipfs/0.5.0");
        assert!(!crawl.nodes[&id("QmB")].reachable);
    }

    #[test]
    fn test_load_crawl_file_rejects_bad_json_and_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_crawl_file(&path), Err(InputError::Json { .. })));

        fs::write(&path, r#"{"Nodes": [{"NodeID": "QmA", "MultiAddrs": ["ip4 nope"]}]}"#).unwrap();
        assert!(matches!(load_crawl_file(&path), Err(InputError::InvalidAddress(_))));

        assert!(matches!(
            load_crawl_file(&dir.path().join("missing.json")),
            Err(InputError::Io { .. })
        ));
    }

    #[test]
    fn test_crawl_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.cache");
        let peer = VisitedPeer {
            id: id("QmA"),
            addrs: vec!["/ip4/10.0.0.1/tcp/4001".into()],
            reachable: true,
            agent_version: "agent".into(),
        };
        save_crawl_file(&path, "s", "e", [&peer]).unwrap();
        let loaded = load_visited_peers(&path).unwrap();
        assert_eq!(loaded[&peer.id], peer);
        assert!(!dir.path().join("nodes.cache.tmp").exists());
    }

    #[test]
    fn test_load_connected_peers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connected.csv");
        fs::write(&path, "QmA;1;/ipfs/id/1.0.0,/ipfs/kad/1.0.0\n\nQmB;2;\n").unwrap();

        let peers = load_connected_peers(&path).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[&id("QmA")].direction, Direction::Inbound);
        assert_eq!(peers[&id("QmA")].protocols.len(), 2);
        assert!(peers[&id("QmB")].protocols.is_empty());

        fs::write(&path, "QmA;1\n").unwrap();
        assert!(matches!(
            load_connected_peers(&path),
            Err(InputError::InvalidRow { line: 1, .. })
        ));
        fs::write(&path, "QmA;x;\n").unwrap();
        assert!(load_connected_peers(&path).is_err());
    }

    #[test]
    fn test_load_peer_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known.csv");
        fs::write(&path, "QmA\nQmB\n\nQmA\n").unwrap();
        let peers = load_peer_list(&path).unwrap();
        assert_eq!(peers.len(), 2);

        fs::write(&path, "QmA\nQm B\n").unwrap();
        assert!(matches!(
            load_peer_list(&path),
            Err(InputError::InvalidRow { line: 2, .. })
        ));
    }

    #[test]
    fn test_parse_bootstrap_addrs_merges_peers() {
        let infos = parse_bootstrap_addrs(&[
            "/ip4/138.201.67.219/tcp/4001/p2p/QmUd6zHcbkbcs7SMxwLs48qZVX3vpcM8errYS7xEczwRMA",
            "# comment",
            "/ip6/::1/tcp/4001/ipfs/QmUd6zHcbkbcs7SMxwLs48qZVX3vpcM8errYS7xEczwRMA",
            "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
        ])
        .unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].addrs.len(), 2);
        assert_eq!(
            infos[1].id.as_str(),
            "QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN"
        );

        assert!(parse_bootstrap_addrs(&["/ip4/1.2.3.4/tcp/4001"]).is_err());
    }

    #[test]
    fn test_write_snapshot_round_trips_through_loaders() {
        let dir = tempfile::tempdir().unwrap();
        let at = parse_timestamp("20-01-01--00:10:00", DEFAULT_DATE_FORMAT).unwrap();

        let known = [id("QmA"), id("QmB")];
        let path = write_snapshot(
            dir.path(),
            Category::Known,
            DEFAULT_DATE_FORMAT,
            at,
            &peer_rows(&known),
        )
        .unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "known_20-01-01--00:10:00.csv"
        );
        assert_eq!(load_peer_list(&path).unwrap().len(), 2);

        let conns = [ConnectionInfo {
            peer: id("QmA"),
            direction: Direction::Outbound,
            address: "/ip4/10.0.0.1/tcp/4001".into(),
            protocols: vec!["/ipfs/ping/1.0.0".into()],
        }];
        let path = write_snapshot(
            dir.path(),
            Category::Connected,
            DEFAULT_DATE_FORMAT,
            at,
            &connection_rows(&conns),
        )
        .unwrap();
        let loaded = load_connected_peers(&path).unwrap();
        assert_eq!(loaded[&id("QmA")].direction, Direction::Outbound);
    }
}
