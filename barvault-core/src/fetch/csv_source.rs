//! CSV file source: one `{dir}/{symbol}.csv` per symbol with a
//! `timestamp,open,high,low,close,volume` header.

use super::{DataFetcher, FetchError};
use crate::domain::{Bar, Frequency};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

#[derive(Debug, Clone)]
pub struct CsvFetcher {
    dir: PathBuf,
}

impl CsvFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{symbol}.csv"))
    }
}

/// Accepts `2024-01-02`, `2024-01-02 09:30:00` and `2024-01-02T09:30:00`.
fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

impl DataFetcher for CsvFetcher {
    fn name(&self) -> &str {
        "csv"
    }

    fn fetch(
        &self,
        symbol: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
        _frequency: Frequency,
    ) -> Result<Vec<Bar>, FetchError> {
        let path = self.path_for(symbol);
        if !path.is_file() {
            return Err(FetchError::NotFound {
                symbol: symbol.to_string(),
            });
        }
        let mut reader = csv::Reader::from_path(&path)
            .map_err(|e| FetchError::Network(format!("{}: {e}", path.display())))?;

        let mut bars = Vec::new();
        for (line, record) in reader.deserialize::<CsvRow>().enumerate() {
            let row = record.map_err(|e| FetchError::Validation(format!("row {}: {e}", line + 1)))?;
            let timestamp = parse_timestamp(&row.timestamp).ok_or_else(|| {
                FetchError::Validation(format!("row {}: bad timestamp '{}'", line + 1, row.timestamp))
            })?;
            if timestamp < start || timestamp > end {
                continue;
            }
            bars.push(Bar::new(timestamp, row.open, row.high, row.low, row.close, row.volume));
        }
        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn reads_rows_inside_range() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("SPY.csv"),
            "timestamp,open,high,low,close,volume\n\
             2024-01-01,1,2,0.5,1.5,100\n\
             2024-01-02 00:00:00,2,3,1.5,2.5,200\n\
             2024-01-03T00:00:00,3,4,2.5,3.5,300\n",
        )
        .unwrap();
        let f = CsvFetcher::new(dir.path());
        let bars = f.fetch("SPY", day(2), day(3), Frequency::Daily).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, 2.5);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = CsvFetcher::new(dir.path())
            .fetch("NOPE", day(1), day(2), Frequency::Daily)
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound { .. }));
    }

    #[test]
    fn bad_timestamp_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("X.csv"),
            "timestamp,open,high,low,close,volume\nyesterday,1,1,1,1,1\n",
        )
        .unwrap();
        let err = CsvFetcher::new(dir.path())
            .fetch("X", day(1), day(2), Frequency::Daily)
            .unwrap_err();
        assert!(matches!(err, FetchError::Validation(_)));
    }
}
