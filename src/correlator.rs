use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use thiserror::Error;

pub const DEFAULT_DATE_FORMAT: &str = "%y-%m-%d--%H:%M:%S";

#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error("directory {dir} could not be read: {source}")]
    ListDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no matching {0} file found")]
    NoMatchingFile(Category),
}

/// Kinds of files produced by the live runtime and the crawler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    VisitedPeers,
    Known,
    Connected,
    Established,
    Successful,
    Failed,
}

impl Category {
    #[cfg(test)]
    pub const SNAPSHOTS: [Category; 5] = [
        Category::Known,
        Category::Connected,
        Category::Established,
        Category::Successful,
        Category::Failed,
    ];

    /// Filename prefix, including the trailing underscore.
    pub fn prefix(self) -> &'static str {
        match self {
            Category::VisitedPeers => "visitedPeers_",
            Category::Known => "known_",
            Category::Connected => "connected_",
            Category::Established => "established_",
            Category::Successful => "successful_",
            Category::Failed => "failed_",
        }
    }

    pub fn name(self) -> &'static str {
        let prefix = self.prefix();
        &prefix[..prefix.len() - 1]
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Category::VisitedPeers => "DHT crawl",
            Category::Known => "known peers snapshot",
            Category::Connected => "connected peers snapshot",
            Category::Established => "established connections snapshot",
            Category::Successful => "successful connections snapshot",
            Category::Failed => "failed connections snapshot",
        };
        f.write_str(label)
    }
}

/// One file found while scanning the input directories.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotFile {
    pub filename: String,
    pub directory: PathBuf,
}

impl SnapshotFile {
    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.filename)
    }

    /// Timestamp encoded after `prefix`, if the name matches and parses.
    pub fn timestamp(&self, prefix: &str, date_format: &str) -> Option<NaiveDateTime> {
        let rest = self.filename.strip_prefix(prefix)?;
        parse_timestamp_prefix(rest, date_format)
    }
}

impl fmt::Display for SnapshotFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

/// Parse a timestamp at the start of `text`, ignoring any trailing characters.
/// Date-only patterns resolve to midnight.
pub fn parse_timestamp_prefix(text: &str, date_format: &str) -> Option<NaiveDateTime> {
    if let Ok((ts, _)) = NaiveDateTime::parse_and_remainder(text, date_format) {
        return Some(ts);
    }
    NaiveDate::parse_and_remainder(text, date_format)
        .ok()
        .map(|(date, _)| date.and_time(NaiveTime::MIN))
}

/// Parse a user-supplied timestamp that must match `date_format` completely.
pub fn parse_timestamp(text: &str, date_format: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, date_format)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, date_format)
                .ok()
                .map(|date| date.and_time(NaiveTime::MIN))
        })
}

/// Collect the file names of every directory, tagged with their directory.
/// Not recursive; duplicates across directories are kept.
pub fn list_candidates<P: AsRef<Path>>(dirs: &[P]) -> Result<Vec<SnapshotFile>, CorrelatorError> {
    let mut candidates = Vec::new();
    for dir in dirs {
        let dir = dir.as_ref();
        let list_err = |source| CorrelatorError::ListDir {
            dir: dir.to_path_buf(),
            source,
        };
        for entry in fs::read_dir(dir).map_err(list_err)? {
            let entry = entry.map_err(list_err)?;
            // names that are not valid UTF-8 can never match a prefix
            if let Ok(filename) = entry.file_name().into_string() {
                candidates.push(SnapshotFile {
                    filename,
                    directory: dir.to_path_buf(),
                });
            }
        }
    }
    Ok(candidates)
}

/// Timestamps of all candidates of one category, in candidate order.
pub fn timestamps_of(
    candidates: &[SnapshotFile],
    prefix: &str,
    date_format: &str,
) -> Vec<NaiveDateTime> {
    candidates
        .iter()
        .filter_map(|c| c.timestamp(prefix, date_format))
        .collect()
}

/// Sorted, deduplicated timestamps of one category.
pub fn sorted_timestamps(
    candidates: &[SnapshotFile],
    prefix: &str,
    date_format: &str,
) -> Vec<NaiveDateTime> {
    let mut timestamps = timestamps_of(candidates, prefix, date_format);
    timestamps.sort();
    timestamps.dedup();
    timestamps
}

/// The candidate nearest at or after `target`. Candidates before `target` are
/// never returned. Equal distances resolve to the smallest filename, then the
/// smallest directory.
pub fn closest<'a>(
    candidates: &'a [SnapshotFile],
    prefix: &str,
    target: NaiveDateTime,
    date_format: &str,
) -> Option<&'a SnapshotFile> {
    candidates
        .iter()
        .filter_map(|c| {
            let distance = c.timestamp(prefix, date_format)? - target;
            (distance >= chrono::Duration::zero()).then_some((distance, c))
        })
        .min_by(|(da, a), (db, b)| {
            da.cmp(db)
                .then_with(|| a.filename.cmp(&b.filename))
                .then_with(|| a.directory.cmp(&b.directory))
        })
        .map(|(_, c)| c)
}

/// The latest candidate of a category.
pub fn newest<'a>(
    candidates: &'a [SnapshotFile],
    prefix: &str,
    date_format: &str,
) -> Option<(NaiveDateTime, &'a SnapshotFile)> {
    candidates
        .iter()
        .filter_map(|c| Some((c.timestamp(prefix, date_format)?, c)))
        .max_by(|(ta, a), (tb, b)| ta.cmp(tb).then_with(|| b.filename.cmp(&a.filename)))
}

/// One file per category, chosen for a crawl instant and a snapshot instant.
#[derive(Clone, Debug)]
pub struct FilesForAnalysis {
    pub visited_peers: Option<SnapshotFile>,
    pub known: SnapshotFile,
    pub connected: SnapshotFile,
    pub established: SnapshotFile,
    pub successful: SnapshotFile,
    pub failed: SnapshotFile,
}

/// Select the files to analyse. The crawl file is only looked up when
/// `crawl_ts` is given; every snapshot category is required.
pub fn files_for_analysis(
    candidates: &[SnapshotFile],
    crawl_ts: Option<NaiveDateTime>,
    snapshot_ts: NaiveDateTime,
    date_format: &str,
) -> Result<FilesForAnalysis, CorrelatorError> {
    let pick = |category: Category, ts: NaiveDateTime| {
        closest(candidates, category.prefix(), ts, date_format)
            .cloned()
            .ok_or(CorrelatorError::NoMatchingFile(category))
    };

    let visited_peers = match crawl_ts {
        Some(ts) => Some(pick(Category::VisitedPeers, ts)?),
        None => None,
    };

    Ok(FilesForAnalysis {
        visited_peers,
        known: pick(Category::Known, snapshot_ts)?,
        connected: pick(Category::Connected, snapshot_ts)?,
        established: pick(Category::Established, snapshot_ts)?,
        successful: pick(Category::Successful, snapshot_ts)?,
        failed: pick(Category::Failed, snapshot_ts)?,
    })
}
