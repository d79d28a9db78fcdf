use std::fmt::Write as _;
use std::path::Path;

use super::CommandResult;
use crate::stats::{self, Summary};

/// Per-column summary, columns numbered from 1.
pub fn describe(summaries: &[Summary]) -> String {
    let mut out = String::new();
    for (i, s) in summaries.iter().enumerate() {
        let col = i + 1;
        let _ = writeln!(out, "Col {col} mean: {}", s.mean);
        let _ = writeln!(out, "Col {col} median: {}", s.median);
        let _ = writeln!(out, "Col {col} min/max: {} / {}\n", s.min, s.max);
    }
    out
}

pub fn run(file: &Path) -> CommandResult {
    let summaries = stats::summarize_columns(file)?;
    print!("{}", describe(&summaries));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peersStat.dat");
        std::fs::write(&path, "1.000000\t10.000000\n4.000000\t20.000000\n\n7.000000\t60.000000\n").unwrap();

        let text = describe(&stats::summarize_columns(&path).unwrap());
        assert_eq!(
            text,
            "Col 1 mean: 4\nCol 1 median: 4\nCol 1 min/max: 1 / 7\n\n\
             Col 2 mean: 30\nCol 2 median: 20\nCol 2 min/max: 10 / 60\n\n"
        );
    }

    #[test]
    fn test_ragged_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.dat");
        std::fs::write(&path, "1\t2\n3\n").unwrap();
        assert!(run(&path).is_err());
    }
}
