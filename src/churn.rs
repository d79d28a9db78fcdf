use std::collections::{HashMap, HashSet};

use chrono::{NaiveDateTime, TimeDelta};
use thiserror::Error;

use crate::peers::PeerId;
use crate::stats::{summarize, Summary};

#[derive(Debug, Error, PartialEq)]
pub enum ChurnError {
    #[error("cannot calculate churn with less than 2 snapshots (got {0})")]
    TooFewSnapshots(usize),
}

/// Changes observed at one snapshot relative to the previous one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChurnRecord {
    pub timestamp: NaiveDateTime,
    pub newly_known: usize,
    pub newly_connected: usize,
    pub connections_lost: usize,
}

impl ChurnRecord {
    pub fn as_row(&self) -> [usize; 3] {
        [self.newly_known, self.newly_connected, self.connections_lost]
    }
}

/// Connection lifetime of every peer that was ever connected. A peer that
/// reconnects keeps the length of its latest connection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionDurations {
    pub per_peer: HashMap<PeerId, TimeDelta>,
}

impl ConnectionDurations {
    fn record(&mut self, peer: PeerId, duration: TimeDelta) {
        self.per_peer.insert(peer, duration);
    }

    pub fn get(&self, peer: &PeerId) -> Option<TimeDelta> {
        self.per_peer.get(peer).copied()
    }

    pub fn minutes(&self) -> Vec<f64> {
        self.per_peer
            .values()
            .map(|d| d.num_milliseconds() as f64 / 60_000.0)
            .collect()
    }

    /// `None` when no peer was ever connected.
    pub fn summary(&self) -> Option<Summary> {
        summarize(&self.minutes())
    }
}

/// One point of the snapshot sequence.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub timestamp: NaiveDateTime,
    pub known: HashSet<PeerId>,
    pub connected: HashSet<PeerId>,
}

#[derive(Clone, Debug)]
pub struct ChurnReport {
    pub records: Vec<ChurnRecord>,
    pub durations: ConnectionDurations,
}

// Snapshots must arrive in chronological order; nothing here sorts them.
#[derive(Debug, Default)]
pub struct ChurnAnalyzer {
    previous_known: HashSet<PeerId>,
    open_connections: HashMap<PeerId, NaiveDateTime>,
    durations: ConnectionDurations,
    last_timestamp: Option<NaiveDateTime>,
    observed: usize,
}

impl ChurnAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next snapshot. `known` replaces the retained known set.
    pub fn observe(
        &mut self,
        timestamp: NaiveDateTime,
        known: HashSet<PeerId>,
        connected: &HashSet<PeerId>,
    ) -> ChurnRecord {
        let newly_known = known
            .iter()
            .filter(|id| !self.previous_known.contains(*id))
            .count();
        self.previous_known = known;

        let mut connections_lost = 0;
        let durations = &mut self.durations;
        self.open_connections.retain(|id, started| {
            if connected.contains(id) {
                return true;
            }
            durations.record(id.clone(), timestamp - *started);
            connections_lost += 1;
            false
        });

        let mut newly_connected = 0;
        for id in connected {
            if !self.open_connections.contains_key(id) {
                self.open_connections.insert(id.clone(), timestamp);
                newly_connected += 1;
            }
        }

        self.last_timestamp = Some(timestamp);
        self.observed += 1;

        ChurnRecord {
            timestamp,
            newly_known,
            newly_connected,
            connections_lost,
        }
    }

    /// Close every still-open connection against the last snapshot.
    pub fn finish(mut self) -> Result<ConnectionDurations, ChurnError> {
        let last = match self.last_timestamp {
            Some(last) if self.observed >= 2 => last,
            _ => return Err(ChurnError::TooFewSnapshots(self.observed)),
        };
        for (id, started) in self.open_connections.drain() {
            self.durations.record(id, last - started);
        }
        Ok(self.durations)
    }
}

/// Run the analyzer over caller-sorted snapshots. Snapshots are consumed one
/// at a time, so a lazy iterator keeps only one of them in memory.
pub fn churn(snapshots: impl IntoIterator<Item = Snapshot>) -> Result<ChurnReport, ChurnError> {
    let mut analyzer = ChurnAnalyzer::new();
    let records = snapshots
        .into_iter()
        .map(|s| analyzer.observe(s.timestamp, s.known, &s.connected))
        .collect();

    Ok(ChurnReport {
        records,
        durations: analyzer.finish()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{parse_timestamp, DEFAULT_DATE_FORMAT};

    fn ts(text: &str) -> NaiveDateTime {
        parse_timestamp(text, DEFAULT_DATE_FORMAT).unwrap()
    }

    fn set(peers: &[&str]) -> HashSet<PeerId> {
        peers.iter().map(|p| p.parse().unwrap()).collect()
    }

    fn snapshot(at: &str, known: &[&str], connected: &[&str]) -> Snapshot {
        Snapshot {
            timestamp: ts(at),
            known: set(known),
            connected: set(connected),
        }
    }

    #[test]
    fn test_known_then_connected_peer() {
        let report = churn(vec![
            snapshot("20-01-01--00:00:00", &["X"], &[]),
            snapshot("20-01-01--00:10:00", &[], &["X"]),
            snapshot("20-01-01--00:20:00", &[], &["X"]),
        ])
        .unwrap();

        let rows: Vec<[usize; 3]> = report.records.iter().map(ChurnRecord::as_row).collect();
        assert_eq!(rows, vec![[1, 0, 0], [0, 1, 0], [0, 0, 0]]);

        assert_eq!(report.durations.per_peer.len(), 1);
        assert_eq!(report.durations.get(&"X".parse().unwrap()), Some(TimeDelta::minutes(10)));
        assert_eq!(report.durations.minutes(), vec![10.0]);
    }

    #[test]
    fn test_lost_and_reconnected_peer() {
        let report = churn(vec![
            snapshot("20-01-01--00:00:00", &["A", "B"], &["A"]),
            snapshot("20-01-01--00:30:00", &["A", "B", "C"], &[]),
            snapshot("20-01-01--00:40:00", &["C"], &["A"]),
            snapshot("20-01-01--01:00:00", &["C"], &["A"]),
        ])
        .unwrap();

        assert_eq!(report.records[0].as_row(), [2, 1, 0]);
        assert_eq!(report.records[1].as_row(), [1, 0, 1]);
        // C was already known at the previous snapshot
        assert_eq!(report.records[2].as_row(), [0, 1, 0]);
        assert_eq!(report.records[3].as_row(), [0, 0, 0]);

        // one entry per peer: the second connection replaces the first
        assert_eq!(report.durations.per_peer.len(), 1);
        assert_eq!(report.durations.get(&"A".parse().unwrap()), Some(TimeDelta::minutes(20)));
        assert_eq!(report.durations.minutes(), vec![20.0]);
    }

    #[test]
    fn test_peer_first_connected_in_last_snapshot_is_not_lost() {
        let mut analyzer = ChurnAnalyzer::new();
        analyzer.observe(ts("20-01-01--00:00:00"), set(&[]), &set(&[]));
        let last = analyzer.observe(ts("20-01-01--00:10:00"), set(&["Z"]), &set(&["Z"]));
        assert_eq!(last.connections_lost, 0);
        assert_eq!(last.newly_connected, 1);

        let durations = analyzer.finish().unwrap();
        assert_eq!(durations.get(&"Z".parse().unwrap()), Some(TimeDelta::zero()));
    }

    #[test]
    fn test_too_few_snapshots() {
        assert_eq!(
            churn(vec![snapshot("20-01-01--00:00:00", &["A"], &["A"])]).unwrap_err(),
            ChurnError::TooFewSnapshots(1)
        );
        assert_eq!(churn(Vec::new()).unwrap_err(), ChurnError::TooFewSnapshots(0));

        let mut analyzer = ChurnAnalyzer::new();
        analyzer.observe(ts("20-01-01--00:00:00"), set(&[]), &set(&[]));
        assert_eq!(analyzer.finish(), Err(ChurnError::TooFewSnapshots(1)));
    }

    #[test]
    fn test_no_connections_has_no_summary() {
        let report = churn(vec![
            snapshot("20-01-01--00:00:00", &["A"], &[]),
            snapshot("20-01-01--00:10:00", &["A"], &[]),
        ])
        .unwrap();
        assert!(report.durations.per_peer.is_empty());
        assert_eq!(report.durations.summary(), None);
    }

    #[test]
    fn test_duration_summary_uses_midpoint_index() {
        let report = churn(vec![
            snapshot("20-01-01--00:00:00", &[], &["A", "B", "C", "D"]),
            snapshot("20-01-01--00:10:00", &[], &["B", "C", "D"]),
            snapshot("20-01-01--00:20:00", &[], &["C", "D"]),
            snapshot("20-01-01--00:40:00", &[], &["D"]),
        ])
        .unwrap();

        let summary = report.durations.summary().unwrap();
        assert_eq!(summary.count, 4);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 40.0);
        assert_eq!(summary.median, 40.0);
        assert_eq!(summary.mean, 27.5);
    }
}
