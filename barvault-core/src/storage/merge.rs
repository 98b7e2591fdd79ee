//! Batch normalization and merge-on-write.

use crate::domain::Bar;

/// Per-merge row accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Timestamps that were not stored before.
    pub inserted: usize,
    /// Stored timestamps whose values changed.
    pub updated: usize,
    /// Stored timestamps re-written with identical values.
    pub unchanged: usize,
}

impl MergeStats {
    pub fn changed(&self) -> bool {
        self.inserted + self.updated > 0
    }
}

/// Sort by timestamp and resolve duplicates last-write-wins.
///
/// The sort is stable, so among rows sharing a timestamp the one that came
/// last in the input survives.
pub fn normalize(mut batch: Vec<Bar>) -> Vec<Bar> {
    batch.sort_by_key(|b| b.timestamp);
    let mut out: Vec<Bar> = Vec::with_capacity(batch.len());
    for bar in batch {
        match out.last_mut() {
            Some(last) if last.timestamp == bar.timestamp => *last = bar,
            _ => out.push(bar),
        }
    }
    out
}

/// Whether a batch is strictly increasing in time.
pub fn is_normalized(batch: &[Bar]) -> bool {
    batch.windows(2).all(|w| w[0].timestamp < w[1].timestamp)
}

/// Merge two normalized batches; on a shared timestamp `incoming` wins.
pub fn merge(existing: &[Bar], incoming: &[Bar]) -> (Vec<Bar>, MergeStats) {
    let mut out = Vec::with_capacity(existing.len() + incoming.len());
    let mut stats = MergeStats::default();
    let (mut i, mut j) = (0, 0);

    while i < existing.len() && j < incoming.len() {
        let (old, new) = (existing[i], incoming[j]);
        if old.timestamp < new.timestamp {
            out.push(old);
            i += 1;
        } else if new.timestamp < old.timestamp {
            out.push(new);
            stats.inserted += 1;
            j += 1;
        } else {
            if old == new {
                stats.unchanged += 1;
            } else {
                stats.updated += 1;
            }
            out.push(new);
            i += 1;
            j += 1;
        }
    }
    out.extend_from_slice(&existing[i..]);
    stats.inserted += incoming.len() - j;
    out.extend_from_slice(&incoming[j..]);

    (out, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn normalize_sorts_and_keeps_last_duplicate() {
        let batch = vec![
            Bar::flat(day(3), 3.0, 1.0),
            Bar::flat(day(1), 1.0, 1.0),
            Bar::flat(day(3), 30.0, 1.0),
            Bar::flat(day(2), 2.0, 1.0),
        ];
        let out = normalize(batch);
        assert!(is_normalized(&out));
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].close, 30.0);
    }

    #[test]
    fn merge_counts_inserts_updates_and_unchanged() {
        let existing = vec![
            Bar::flat(day(1), 1.0, 1.0),
            Bar::flat(day(2), 2.0, 1.0),
            Bar::flat(day(4), 4.0, 1.0),
        ];
        let incoming = vec![
            Bar::flat(day(2), 2.0, 1.0),
            Bar::flat(day(3), 3.0, 1.0),
            Bar::flat(day(4), 40.0, 1.0),
            Bar::flat(day(5), 5.0, 1.0),
        ];
        let (merged, stats) = merge(&existing, &incoming);
        assert_eq!(
            stats,
            MergeStats {
                inserted: 2,
                updated: 1,
                unchanged: 1
            }
        );
        assert_eq!(merged.len(), 5);
        assert!(is_normalized(&merged));
        assert_eq!(merged[3].close, 40.0);
    }

    #[test]
    fn merge_into_empty_inserts_everything() {
        let incoming = vec![Bar::flat(day(1), 1.0, 1.0)];
        let (merged, stats) = merge(&[], &incoming);
        assert_eq!(merged, incoming);
        assert_eq!(stats.inserted, 1);
        assert!(stats.changed());
    }
}
