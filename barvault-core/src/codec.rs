//! Parquet encoding of bar batches.
//!
//! Partition files hold one column per field; `timestamp` is stored as a
//! millisecond `Datetime`. Both engines share these helpers so a file written
//! by one is byte-compatible with the other.

use crate::domain::Bar;
use crate::error::StoreError;
use chrono::{DateTime, NaiveDateTime};
use polars::prelude::*;
use std::fs;
use std::io::Cursor;
use std::path::Path;

/// Columns every partition file must carry.
pub const COLUMNS: [&str; 6] = ["timestamp", "open", "high", "low", "close", "volume"];

pub(crate) fn to_millis(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

/// Convert bars to a Polars DataFrame.
pub fn bars_to_dataframe(bars: &[Bar]) -> Result<DataFrame, StoreError> {
    let timestamps: Vec<i64> = bars.iter().map(|b| to_millis(b.timestamp)).collect();
    let opens: Vec<f64> = bars.iter().map(|b| b.open).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    DataFrame::new(vec![
        Column::new("timestamp".into(), timestamps)
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
            .map_err(|e| StoreError::Parquet(format!("timestamp cast: {e}")))?,
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
    ])
    .map_err(|e| StoreError::Parquet(format!("dataframe creation: {e}")))
}

/// Convert a DataFrame back to bars, checking the schema on the way.
pub fn dataframe_to_bars(df: &DataFrame) -> Result<Vec<Bar>, StoreError> {
    for name in COLUMNS {
        if df.column(name).is_err() {
            return Err(StoreError::Parquet(format!("missing column '{name}'")));
        }
    }

    let column_err = |name: &str, e: PolarsError| StoreError::Parquet(format!("{name} column: {e}"));

    let timestamps = df
        .column("timestamp")
        .and_then(|c| c.cast(&DataType::Int64))
        .map_err(|e| column_err("timestamp", e))?;
    let ts_ca = timestamps.i64().map_err(|e| column_err("timestamp", e))?;

    let float = |name: &str| -> Result<Float64Chunked, StoreError> {
        df.column(name)
            .and_then(|c| c.cast(&DataType::Float64))
            .and_then(|c| c.f64().cloned())
            .map_err(|e| column_err(name, e))
    };
    let open_ca = float("open")?;
    let high_ca = float("high")?;
    let low_ca = float("low")?;
    let close_ca = float("close")?;
    let vol_ca = float("volume")?;

    let n = df.height();
    let mut bars = Vec::with_capacity(n);
    for i in 0..n {
        let ms = ts_ca
            .get(i)
            .ok_or_else(|| StoreError::Parquet(format!("null timestamp at row {i}")))?;
        let timestamp = from_millis(ms)
            .ok_or_else(|| StoreError::Parquet(format!("timestamp out of range at row {i}")))?;
        bars.push(Bar {
            timestamp,
            open: open_ca.get(i).unwrap_or(f64::NAN),
            high: high_ca.get(i).unwrap_or(f64::NAN),
            low: low_ca.get(i).unwrap_or(f64::NAN),
            close: close_ca.get(i).unwrap_or(f64::NAN),
            volume: vol_ca.get(i).unwrap_or(0.0),
        });
    }
    Ok(bars)
}

/// Encode bars as an in-memory Parquet file.
pub fn encode(bars: &[Bar]) -> Result<Vec<u8>, StoreError> {
    let mut df = bars_to_dataframe(bars)?;
    let mut buf = Vec::new();
    ParquetWriter::new(&mut buf)
        .finish(&mut df)
        .map_err(|e| StoreError::Parquet(format!("write parquet: {e}")))?;
    Ok(buf)
}

/// Decode an in-memory Parquet file.
pub fn decode(bytes: Vec<u8>) -> Result<Vec<Bar>, StoreError> {
    let df = ParquetReader::new(Cursor::new(bytes))
        .finish()
        .map_err(|e| StoreError::Parquet(format!("read parquet: {e}")))?;
    dataframe_to_bars(&df)
}

/// Read a partition file. `Ok(None)` if it does not exist.
pub fn read_file(path: &Path) -> Result<Option<Vec<Bar>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => decode(bytes)
            .map(Some)
            .map_err(|e| StoreError::Parquet(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path)(e)),
    }
}
