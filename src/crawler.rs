use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::correlator::{self, Category, CorrelatorError};
use crate::input::{self, InputError};
use crate::peers::{PeerAddrInfo, PeerId, VisitedPeer};

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("no new crawl available in {0}")]
    NothingNew(PathBuf),
    #[error("could not access or create {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Correlator(#[from] CorrelatorError),
}

/// Result of one crawl. Timestamps are already rendered in the date format
/// used for file names.
#[derive(Clone, Debug, Default)]
pub struct CrawlReport {
    pub start_timestamp: String,
    pub end_timestamp: String,
    pub nodes: Vec<VisitedPeer>,
}

impl CrawlReport {
    pub fn reachable(&self) -> impl Iterator<Item = &VisitedPeer> {
        self.nodes.iter().filter(|node| node.reachable)
    }

    pub fn filename(&self) -> String {
        format!(
            "{}{}_{}.json",
            Category::VisitedPeers.prefix(),
            self.start_timestamp,
            self.end_timestamp
        )
    }
}

#[async_trait]
pub trait DhtCrawler: Send + Sync {
    async fn crawl(&self, seeds: &[PeerAddrInfo]) -> Result<CrawlReport, CrawlError>;
}

/// Hands out crawl files written into a directory by an external crawler,
/// newest first, each at most once.
pub struct CrawlImporter {
    crawl_dir: PathBuf,
    date_format: String,
    last_imported: Mutex<Option<NaiveDateTime>>,
}

impl CrawlImporter {
    pub fn new(crawl_dir: impl Into<PathBuf>, date_format: impl Into<String>) -> Self {
        Self {
            crawl_dir: crawl_dir.into(),
            date_format: date_format.into(),
            last_imported: Mutex::new(None),
        }
    }
}

#[async_trait]
impl DhtCrawler for CrawlImporter {
    async fn crawl(&self, seeds: &[PeerAddrInfo]) -> Result<CrawlReport, CrawlError> {
        debug!("Importing crawl from {} ({} seeds unused)", self.crawl_dir.display(), seeds.len());

        let candidates = correlator::list_candidates(&[&self.crawl_dir])?;
        let Some((started, file)) =
            correlator::newest(&candidates, Category::VisitedPeers.prefix(), &self.date_format)
        else {
            return Err(CrawlError::NothingNew(self.crawl_dir.clone()));
        };

        {
            let mut last = self.last_imported.lock();
            if last.is_some_and(|last| last >= started) {
                return Err(CrawlError::NothingNew(self.crawl_dir.clone()));
            }
            *last = Some(started);
        }

        let crawl = input::load_crawl_file(&file.path())?;
        let mut nodes: Vec<VisitedPeer> = crawl.nodes.into_values().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let start_timestamp = if crawl.start_timestamp.is_empty() {
            started.format(&self.date_format).to_string()
        } else {
            crawl.start_timestamp
        };
        Ok(CrawlReport {
            start_timestamp,
            end_timestamp: crawl.end_timestamp,
            nodes,
        })
    }
}

/// Reachable nodes from the node cache. A missing or broken cache is empty.
pub fn restore_node_cache(path: &Path) -> Vec<PeerAddrInfo> {
    match input::load_visited_peers(path) {
        Ok(nodes) => {
            let mut infos: Vec<PeerAddrInfo> = nodes
                .values()
                .filter(|node| node.reachable)
                .map(VisitedPeer::addr_info)
                .collect();
            infos.sort_by(|a, b| a.id.cmp(&b.id));
            infos
        }
        Err(e) => {
            debug!("Node cache not restored: {}", e);
            vec![]
        }
    }
}

pub fn save_node_cache(report: &CrawlReport, path: &Path) -> Result<(), CrawlError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }
    input::save_crawl_file(
        path,
        &report.start_timestamp,
        &report.end_timestamp,
        report.reachable(),
    )?;
    Ok(())
}

fn ensure_dir(path: &Path) -> Result<(), CrawlError> {
    fs::create_dir_all(path).map_err(|source| CrawlError::OutputDir {
        path: path.to_path_buf(),
        source,
    })
}

/// One crawl round: seed from bootstrap peers and the node cache, crawl,
/// persist the report and the cache, return the reachable nodes.
pub struct CrawlRound<'a> {
    pub out_dir: &'a Path,
    pub cache_file: Option<&'a Path>,
}

impl CrawlRound<'_> {
    pub async fn run(
        &self,
        crawler: &dyn DhtCrawler,
        bootstrap: &[PeerAddrInfo],
    ) -> Result<HashMap<PeerId, PeerAddrInfo>, CrawlError> {
        ensure_dir(self.out_dir)?;

        let mut seeds = bootstrap.to_vec();
        if let Some(cache) = self.cache_file {
            seeds.extend(restore_node_cache(cache));
        }

        let report = crawler.crawl(&seeds).await?;
        info!(
            "Crawl {} - {}: {} nodes, {} reachable",
            report.start_timestamp,
            report.end_timestamp,
            report.nodes.len(),
            report.reachable().count()
        );

        let report_path = self.out_dir.join(report.filename());
        if !report_path.exists() {
            input::save_crawl_file(
                &report_path,
                &report.start_timestamp,
                &report.end_timestamp,
                &report.nodes,
            )?;
        }
        if let Some(cache) = self.cache_file {
            if let Err(e) = save_node_cache(&report, cache) {
                warn!("Could not save node cache: {}", e);
            }
        }

        Ok(report
            .reachable()
            .map(|node| (node.id.clone(), node.addr_info()))
            .collect())
    }
}
