use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("stats file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("stats file {path}, line {line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// Called with every appended row while the sink lock is held.
pub type RowObserver = Box<dyn Fn(&[f64]) + Send + Sync>;

pub struct StatsFile {
    path: PathBuf,
    rows: Mutex<Vec<Vec<f64>>>,
    // serializes flushes; appends only take `rows`
    writer: Mutex<()>,
    observer: Option<RowObserver>,
}

impl StatsFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_row(&self, values: Vec<f64>) {
        let mut rows = self.rows.lock();
        if let Some(observer) = &self.observer {
            observer(&values);
        }
        rows.push(values);
    }

    pub fn append_ints(&self, values: &[usize]) {
        self.append_row(values.iter().map(|v| *v as f64).collect());
    }

    #[cfg(test)]
    pub fn buffered_rows(&self) -> usize {
        self.rows.lock().len()
    }

    /// Write all buffered rows to disk and sync. On error the file is cut
    /// back to its previous length and the rows stay buffered for the next
    /// flush.
    pub fn flush(&self) -> Result<(), StatsError> {
        let _writer = self.writer.lock();
        let taken = std::mem::take(&mut *self.rows.lock());
        if taken.is_empty() {
            return Ok(());
        }

        match self.write_rows(&taken) {
            Ok(()) => {
                debug!("Flushed {} rows to {}", taken.len(), self.path.display());
                Ok(())
            }
            Err(e) => {
                let mut rows = self.rows.lock();
                let appended = std::mem::replace(&mut *rows, taken);
                rows.extend(appended);
                Err(e)
            }
        }
    }

    fn write_rows(&self, rows: &[Vec<f64>]) -> Result<(), StatsError> {
        let mut content = String::new();
        for row in rows {
            for (i, value) in row.iter().enumerate() {
                if i > 0 {
                    content.push('\t');
                }
                let _ = write!(content, "{:.6}", value);
            }
            content.push('\n');
        }

        let io_err = |source| StatsError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();
        append_or_rollback(
            &mut file,
            content.as_bytes(),
            |f| f.sync_all(),
            |f| {
                let _ = f.set_len(len);
            },
        )
        .map_err(io_err)
    }
}

fn append_or_rollback<W: Write>(
    out: &mut W,
    content: &[u8],
    commit: impl FnOnce(&mut W) -> io::Result<()>,
    rollback: impl FnOnce(&mut W),
) -> io::Result<()> {
    match out.write_all(content).and_then(|_| commit(out)) {
        Ok(()) => Ok(()),
        Err(e) => {
            rollback(out);
            Err(e)
        }
    }
}

/// Owner of every open [`StatsFile`] of one run.
#[derive(Clone, Default)]
pub struct StatsRegistry {
    files: Arc<Mutex<HashMap<PathBuf, Arc<StatsFile>>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (truncating) the output file and register it. Opening a path
    /// that is already registered returns the existing handle untouched.
    pub fn open(&self, path: impl Into<PathBuf>) -> Result<Arc<StatsFile>, StatsError> {
        self.register(path.into(), None)
    }

    pub fn open_with_observer(
        &self,
        path: impl Into<PathBuf>,
        observer: RowObserver,
    ) -> Result<Arc<StatsFile>, StatsError> {
        self.register(path.into(), Some(observer))
    }

    fn register(
        &self,
        path: PathBuf,
        observer: Option<RowObserver>,
    ) -> Result<Arc<StatsFile>, StatsError> {
        let mut files = self.files.lock();
        if let Some(existing) = files.get(&path) {
            debug!("Stats file {} already open, sharing it", path.display());
            return Ok(existing.clone());
        }

        File::create(&path).map_err(|source| StatsError::Io {
            path: path.clone(),
            source,
        })?;
        let file = Arc::new(StatsFile {
            path: path.clone(),
            rows: Mutex::new(Vec::new()),
            writer: Mutex::new(()),
            observer,
        });
        files.insert(path, file.clone());
        Ok(file)
    }

    /// Flush one file and drop it from the registry.
    pub fn close(&self, file: &StatsFile) -> Result<(), StatsError> {
        let result = file.flush();
        self.files.lock().remove(file.path());
        result
    }

    pub fn flush_all(&self) -> Vec<StatsError> {
        let files: Vec<Arc<StatsFile>> = self.files.lock().values().cloned().collect();
        files.iter().filter_map(|f| f.flush().err()).collect()
    }

    pub fn close_all(&self) -> Vec<StatsError> {
        let files: Vec<Arc<StatsFile>> = self.files.lock().drain().map(|(_, f)| f).collect();
        files.iter().filter_map(|f| f.flush().err()).collect()
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    /// Element at index `count / 2` of the ascending sort.
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

pub fn summarize(values: &[f64]) -> Option<Summary> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let count = sorted.len();
    let mean = sorted.iter().sum::<f64>() / count as f64;
    Some(Summary {
        count,
        mean,
        median: sorted[count / 2],
        min: sorted[0],
        max: sorted[count - 1],
    })
}

/// Read a stats file back into columns.
pub fn read_columns(path: &Path) -> Result<Vec<Vec<f64>>, StatsError> {
    let content = fs::read_to_string(path).map_err(|source| StatsError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut columns: Vec<Vec<f64>> = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parse_err = |reason: String| StatsError::Parse {
            path: path.to_path_buf(),
            line: idx + 1,
            reason,
        };
        let values = line
            .split('\t')
            .map(|v| v.trim().parse::<f64>().map_err(|e| parse_err(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;

        if columns.is_empty() {
            columns = vec![Vec::new(); values.len()];
        } else if values.len() != columns.len() {
            return Err(parse_err(format!(
                "expected {} columns, found {}",
                columns.len(),
                values.len()
            )));
        }
        for (column, value) in columns.iter_mut().zip(values) {
            column.push(value);
        }
    }
    Ok(columns)
}

pub fn summarize_columns(path: &Path) -> Result<Vec<Summary>, StatsError> {
    Ok(read_columns(path)?
        .iter()
        .filter_map(|column| summarize(column))
        .collect())
}
