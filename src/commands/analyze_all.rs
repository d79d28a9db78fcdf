use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::TimeDelta;
use tracing::{debug, info};

use super::{parse_options, CommandResult};
use crate::analysis::SnapshotMaps;
use crate::churn::{self, ChurnError, ConnectionDurations, Snapshot};
use crate::correlator::{self, Category, SnapshotFile, DEFAULT_DATE_FORMAT};
use crate::stats::StatsRegistry;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Snapshot offsets after each crawl start, in minutes.
const COMPARISON_OFFSETS: [i64; 4] = [0, 10, 20, 30];

const DEFAULTS: &[(&str, &str)] = &[
    ("DateFormat", DEFAULT_DATE_FORMAT),
    ("DHTCrawlDir", "crawls"),
    ("SnapshotDir", "snapshots"),
    ("OutputDir", "analysis_result"),
    ("SkipComparisons", ""),
    ("SkipChurn", ""),
    ("SkipTotal", ""),
];

const USAGE: &str = "\
Usage: peerwatch analyze-all [options]

Options:
DateFormat=<format>       strftime date format (default: %y-%m-%d--%H:%M:%S)
DHTCrawlDir=<dir>         Directory in which the crawl output files are located (default: crawls)
SnapshotDir=<dir>         Directory in which the snapshots are located (default: snapshots)
OutputDir=<dir>           Directory to which the output files will be saved
                          (default: analysis_result)
SkipComparisons           Do not calculate comparisons
SkipChurn                 Do not calculate churn
SkipTotal                 Do not record total numbers";

/// Compare every crawl with the snapshots taken at each offset after it.
/// Offsets without a complete set of snapshot files are skipped. Returns the
/// number of rows written.
pub fn comparisons(
    registry: &StatsRegistry,
    candidates: &[SnapshotFile],
    date_format: &str,
    out_dir: &Path,
) -> Result<usize, BoxError> {
    let crawl_timestamps =
        correlator::sorted_timestamps(candidates, Category::VisitedPeers.prefix(), date_format);

    let mut outputs = Vec::with_capacity(COMPARISON_OFFSETS.len());
    for minutes in COMPARISON_OFFSETS {
        let file = registry.open(out_dir.join(format!("comparison_{minutes}m.dat")))?;
        outputs.push((TimeDelta::minutes(minutes), file));
    }

    let mut rows = 0;
    for ts in crawl_timestamps {
        for (offset, output) in &outputs {
            let files = match correlator::files_for_analysis(candidates, Some(ts), ts + *offset, date_format) {
                Ok(files) => files,
                Err(e) => {
                    debug!("Skipping crawl {} at +{}m: {}", ts, offset.num_minutes(), e);
                    continue;
                }
            };
            let maps = SnapshotMaps::load(&files)?;
            output.append_ints(&maps.compare().as_row());
            rows += 1;
        }
    }

    for (_, output) in &outputs {
        registry.close(output)?;
    }
    Ok(rows)
}

/// Walk the known-peers snapshots in order, writing churn rows and, unless
/// `skip_total`, per-snapshot totals.
pub fn churn_series(
    registry: &StatsRegistry,
    candidates: &[SnapshotFile],
    date_format: &str,
    out_dir: &Path,
    skip_total: bool,
) -> Result<ConnectionDurations, BoxError> {
    let timestamps = correlator::sorted_timestamps(candidates, Category::Known.prefix(), date_format);
    if timestamps.len() < 2 {
        return Err(ChurnError::TooFewSnapshots(timestamps.len()).into());
    }

    let churn_file = registry.open(out_dir.join("churn.dat"))?;
    let total_file = match skip_total {
        true => None,
        false => Some(registry.open(out_dir.join("total.dat"))?),
    };

    // snapshots are loaded lazily while the analyzer walks them; the first
    // load error ends the walk
    let mut load_error = None;
    let snapshots = timestamps
        .into_iter()
        .filter_map(|ts| match correlator::files_for_analysis(candidates, None, ts, date_format) {
            Ok(files) => Some((ts, files)),
            Err(e) => {
                debug!("Skipping snapshot {}: {}", ts, e);
                None
            }
        })
        .map_while(|(ts, files)| match SnapshotMaps::load(&files) {
            Ok(maps) => {
                if let Some(total) = &total_file {
                    total.append_ints(&maps.totals_row());
                }
                Some(Snapshot {
                    timestamp: ts,
                    connected: maps.connected.into_keys().collect(),
                    known: maps.known,
                })
            }
            Err(e) => {
                load_error = Some(e);
                None
            }
        });
    let report = churn::churn(snapshots);
    if let Some(e) = load_error {
        return Err(e.into());
    }
    let report = report?;

    for record in &report.records {
        churn_file.append_ints(&record.as_row());
    }
    registry.close(&churn_file)?;
    if let Some(total) = &total_file {
        registry.close(total)?;
    }
    debug!("Churn over {} snapshots", report.records.len());
    Ok(report.durations)
}

pub fn describe_durations(durations: &ConnectionDurations) -> String {
    let mut out = String::from("Please note: Precision is limited by the snapshot interval\n");
    match durations.summary() {
        Some(summary) => {
            let _ = writeln!(out, "Mean connection duration in minutes: {:.6}", summary.mean);
            let _ = writeln!(out, "Median connection duration in minutes: {:.6}", summary.median);
            let _ = writeln!(out, "Shortest connection duration in minutes: {:.6}", summary.min);
            let _ = writeln!(out, "Longest connection duration in minutes: {:.6}", summary.max);
        }
        None => out.push_str("No connections observed\n"),
    }
    out
}

pub async fn run<S: AsRef<str>>(args: &[S]) -> CommandResult {
    let Some(config) = parse_options(DEFAULTS, &[], USAGE, args)? else {
        return Ok(());
    };
    let date_format = config.date_format("DateFormat")?.to_string();
    let out_dir = PathBuf::from(config.get("OutputDir"));
    fs::create_dir_all(&out_dir)?;

    let candidates = Arc::new(correlator::list_candidates(&[
        config.get("DHTCrawlDir"),
        config.get("SnapshotDir"),
    ])?);
    let registry = StatsRegistry::new();

    let comparison_task = (!config.flag("SkipComparisons")).then(|| {
        let (registry, candidates) = (registry.clone(), candidates.clone());
        let (date_format, out_dir) = (date_format.clone(), out_dir.clone());
        tokio::task::spawn_blocking(move || comparisons(&registry, &candidates, &date_format, &out_dir))
    });
    let churn_task = (!config.flag("SkipChurn")).then(|| {
        let (registry, candidates) = (registry.clone(), candidates.clone());
        let (date_format, out_dir) = (date_format.clone(), out_dir.clone());
        let skip_total = config.flag("SkipTotal");
        tokio::task::spawn_blocking(move || {
            churn_series(&registry, &candidates, &date_format, &out_dir, skip_total)
        })
    });

    if let Some(task) = comparison_task {
        let rows = task.await??;
        info!("Wrote {} comparison rows to {}", rows, out_dir.display());
    }
    if let Some(task) = churn_task {
        let durations = task.await??;
        print!("{}", describe_durations(&durations));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::read_columns;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    fn snapshot(dir: &Path, at: &str, known: &[&str], connected: &[&str]) {
        let lines = |ids: &[&str], suffix: &str| ids.iter().map(|id| format!("{id}{suffix}\n")).collect::<String>();
        write(dir, &format!("known_{at}.csv"), &lines(known, ""));
        write(dir, &format!("connected_{at}.csv"), &lines(connected, ";2;"));
        write(dir, &format!("established_{at}.csv"), &lines(connected, ""));
        write(dir, &format!("successful_{at}.csv"), "A\n");
        write(dir, &format!("failed_{at}.csv"), "");
    }

    /// A crawl at 00:00 and snapshots at 00:00, 00:10 and 00:20. A is
    /// connected for the first two, C from 00:10 on.
    fn fixture() -> (tempfile::TempDir, tempfile::TempDir) {
        let crawls = tempfile::tempdir().unwrap();
        let snapshots = tempfile::tempdir().unwrap();
        write(
            crawls.path(),
            "visitedPeers_20-01-01--00:00:00_20-01-01--00:04:00.json",
            r#"{"Nodes": [{"NodeID": "A", "MultiAddrs": [], "reachable": true}]}"#,
        );
        snapshot(snapshots.path(), "20-01-01--00:00:00", &["A", "B"], &["A"]);
        snapshot(snapshots.path(), "20-01-01--00:10:00", &["A", "B", "C"], &["A", "C"]);
        snapshot(snapshots.path(), "20-01-01--00:20:00", &["C"], &["C"]);
        (crawls, snapshots)
    }

    #[test]
    fn test_comparisons_per_offset() {
        let (crawls, snapshots) = fixture();
        let out = tempfile::tempdir().unwrap();
        let candidates = correlator::list_candidates(&[crawls.path(), snapshots.path()]).unwrap();
        let registry = StatsRegistry::new();

        let rows = comparisons(&registry, &candidates, DEFAULT_DATE_FORMAT, out.path()).unwrap();
        assert_eq!(rows, 3);
        assert_eq!(registry.len(), 0);

        let at_start = read_columns(&out.path().join("comparison_0m.dat")).unwrap();
        assert_eq!(at_start.len(), 15);
        // dht peers, reachable, known, connected
        assert_eq!(at_start[0], vec![1.0]);
        assert_eq!(at_start[1], vec![1.0]);
        assert_eq!(at_start[2], vec![2.0]);
        assert_eq!(at_start[3], vec![1.0]);

        let later = read_columns(&out.path().join("comparison_20m.dat")).unwrap();
        // A is no longer known 20 minutes in
        assert_eq!(later[6], vec![1.0]);

        // no snapshot at or after 00:30
        assert!(read_columns(&out.path().join("comparison_30m.dat")).unwrap().is_empty());
    }

    #[test]
    fn test_churn_series() {
        let (_crawls, snapshots) = fixture();
        let out = tempfile::tempdir().unwrap();
        let candidates = correlator::list_candidates(&[snapshots.path()]).unwrap();
        let registry = StatsRegistry::new();

        let durations =
            churn_series(&registry, &candidates, DEFAULT_DATE_FORMAT, out.path(), false).unwrap();

        let churn = read_columns(&out.path().join("churn.dat")).unwrap();
        assert_eq!(churn[0], vec![2.0, 1.0, 0.0]);
        assert_eq!(churn[1], vec![1.0, 1.0, 0.0]);
        assert_eq!(churn[2], vec![0.0, 0.0, 1.0]);

        let total = read_columns(&out.path().join("total.dat")).unwrap();
        assert_eq!(total[0], vec![2.0, 3.0, 1.0]);
        assert_eq!(total[1], vec![1.0, 2.0, 1.0]);

        let mut minutes = durations.minutes();
        minutes.sort_by(f64::total_cmp);
        assert_eq!(minutes, vec![10.0, 20.0]);

        let text = describe_durations(&durations);
        assert!(text.contains("Mean connection duration in minutes: 15.000000"));
        assert!(text.contains("Median connection duration in minutes: 20.000000"));
        assert!(text.contains("Shortest connection duration in minutes: 10.000000"));
    }

    #[test]
    fn test_churn_needs_two_snapshots() {
        let snapshots = tempfile::tempdir().unwrap();
        snapshot(snapshots.path(), "20-01-01--00:00:00", &["A"], &[]);
        let out = tempfile::tempdir().unwrap();
        let candidates = correlator::list_candidates(&[snapshots.path()]).unwrap();

        let err = churn_series(&StatsRegistry::new(), &candidates, DEFAULT_DATE_FORMAT, out.path(), true)
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot calculate churn with less than 2 snapshots (got 1)");
        assert!(!out.path().join("total.dat").exists());
    }

    #[tokio::test]
    async fn test_run_writes_output_dir() {
        let (crawls, snapshots) = fixture();
        let out = tempfile::tempdir().unwrap();
        let out_dir = out.path().join("result");

        run(&[
            format!("DHTCrawlDir={}", crawls.path().display()),
            format!("SnapshotDir={}", snapshots.path().display()),
            format!("OutputDir={}", out_dir.display()),
            "SkipTotal".to_string(),
        ])
        .await
        .unwrap();

        assert!(out_dir.join("comparison_10m.dat").exists());
        assert!(out_dir.join("churn.dat").exists());
        assert!(!out_dir.join("total.dat").exists());
    }
}
