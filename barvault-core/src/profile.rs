//! Column-level statistics stored next to a dataset (`.profile.json`).

use crate::domain::Bar;
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatValue::Number(v) => write!(f, "{v:.4}"),
            StatValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub name: String,
    pub dtype: String,
    pub total_count: usize,
    /// Nulls and NaNs.
    pub null_count: usize,
    pub unique_count: usize,
    pub min: Option<StatValue>,
    pub max: Option<StatValue>,
    pub mean: Option<f64>,
    pub std: Option<f64>,
}

impl ColumnProfile {
    fn numeric(name: &str, values: impl Iterator<Item = f64>) -> Self {
        let values: Vec<f64> = values.collect();
        let finite: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        let unique: HashSet<u64> = finite.iter().map(|v| v.to_bits()).collect();

        let (min, max, mean, std) = if finite.is_empty() {
            (None, None, None, None)
        } else {
            let n = finite.len() as f64;
            let mean = finite.iter().sum::<f64>() / n;
            let std = if finite.len() > 1 {
                (finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
            } else {
                0.0
            };
            let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
            let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (
                Some(StatValue::Number(min)),
                Some(StatValue::Number(max)),
                Some(mean),
                Some(std),
            )
        };

        Self {
            name: name.to_string(),
            dtype: "f64".to_string(),
            total_count: values.len(),
            null_count: values.len() - finite.len(),
            unique_count: unique.len(),
            min,
            max,
            mean,
            std,
        }
    }

    fn timestamps(values: &[NaiveDateTime]) -> Self {
        let unique: HashSet<&NaiveDateTime> = values.iter().collect();
        Self {
            name: "timestamp".to_string(),
            dtype: "datetime[ms]".to_string(),
            total_count: values.len(),
            null_count: 0,
            unique_count: unique.len(),
            min: values.iter().min().map(|t| StatValue::Text(t.to_string())),
            max: values.iter().max().map(|t| StatValue::Text(t.to_string())),
            mean: None,
            std: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetProfile {
    pub total_rows: usize,
    pub total_columns: usize,
    pub columns: Vec<ColumnProfile>,
    pub generated_at: NaiveDateTime,
    pub source: String,
    pub date_range_start: Option<NaiveDateTime>,
    pub date_range_end: Option<NaiveDateTime>,
}

impl DatasetProfile {
    pub fn from_bars(bars: &[Bar], source: impl Into<String>) -> Self {
        let timestamps: Vec<NaiveDateTime> = bars.iter().map(|b| b.timestamp).collect();
        let columns = vec![
            ColumnProfile::timestamps(&timestamps),
            ColumnProfile::numeric("open", bars.iter().map(|b| b.open)),
            ColumnProfile::numeric("high", bars.iter().map(|b| b.high)),
            ColumnProfile::numeric("low", bars.iter().map(|b| b.low)),
            ColumnProfile::numeric("close", bars.iter().map(|b| b.close)),
            ColumnProfile::numeric("volume", bars.iter().map(|b| b.volume)),
        ];
        Self {
            total_rows: bars.len(),
            total_columns: columns.len(),
            columns,
            generated_at: Utc::now().naive_utc(),
            source: source.into(),
            date_range_start: timestamps.iter().min().copied(),
            date_range_end: timestamps.iter().max().copied(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnProfile> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Human-readable report.
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Dataset profile (generated {})", self.generated_at),
            format!("  Rows: {}", self.total_rows),
            format!("  Columns: {}", self.total_columns),
        ];
        if let (Some(start), Some(end)) = (self.date_range_start, self.date_range_end) {
            lines.push(format!("  Date range: {start} to {end}"));
        }
        lines.push(String::new());
        lines.push("  Column details:".to_string());
        for col in &self.columns {
            let null_pct = if col.total_count > 0 {
                col.null_count as f64 / col.total_count as f64 * 100.0
            } else {
                0.0
            };
            let mut line = format!(
                "    {}: {} ({} unique, {null_pct:.1}% null)",
                col.name, col.dtype, col.unique_count
            );
            if let (Some(mean), Some(std)) = (col.mean, col.std) {
                line.push_str(&format!(" [mean={mean:.4}, std={std:.4}]"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn bars() -> Vec<Bar> {
        let d = |day| {
            NaiveDate::from_ymd_opt(2024, 1, day)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        };
        vec![
            Bar::new(d(1), 1.0, 2.0, 0.5, 1.0, 100.0),
            Bar::new(d(2), 2.0, 3.0, 1.5, 3.0, 100.0),
            Bar::new(d(3), f64::NAN, 4.0, 2.5, 5.0, 300.0),
        ]
    }

    #[test]
    fn computes_column_stats() {
        let profile = DatasetProfile::from_bars(&bars(), "unit");
        assert_eq!(profile.total_rows, 3);
        let close = profile.column("close").unwrap();
        assert_eq!(close.mean, Some(3.0));
        assert_eq!(close.std, Some(2.0));
        assert_eq!(close.min, Some(StatValue::Number(1.0)));
        let open = profile.column("open").unwrap();
        assert_eq!(open.null_count, 1);
        assert_eq!(profile.column("volume").unwrap().unique_count, 2);
        assert!(profile.summary().contains("Rows: 3"));
    }

    #[test]
    fn empty_batch_has_no_stats() {
        let profile = DatasetProfile::from_bars(&[], "unit");
        assert_eq!(profile.column("close").unwrap().mean, None);
        assert!(profile.date_range_start.is_none());
    }

    #[test]
    fn serde_roundtrip() {
        let profile = DatasetProfile::from_bars(&bars()[..2], "unit");
        let json = serde_json::to_string(&profile).unwrap();
        let back: DatasetProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back.total_rows, 2);
        assert_eq!(back.date_range_end, profile.date_range_end);
        assert!(matches!(
            back.column("timestamp").unwrap().min,
            Some(StatValue::Text(_))
        ));
        assert_eq!(
            back.column("volume").unwrap().min,
            Some(StatValue::Number(100.0))
        );
    }
}
