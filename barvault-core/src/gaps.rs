//! Gap detection on a dataset's native time grid.
//!
//! A gap is reported between two consecutive stored timestamps when the
//! elapsed time exceeds `step × (1 + tolerance)` and at least one trading
//! grid point lies strictly between them. Weekends and configured holidays
//! are not trading points under [`MarketCalendar::Weekdays`].

use crate::domain::TimeRange;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub const DEFAULT_GAP_TOLERANCE: f64 = 0.5;

/// A hole in a stored series. `start` and `end` are the present timestamps
/// bracketing it; the missing points lie strictly between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gap {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub missing_count: usize,
}

impl Gap {
    /// Gap whose interior is exactly `range`, for re-fetching a known span.
    pub fn from_range(range: TimeRange, step: Duration) -> Self {
        let points = if range.is_empty() || step <= Duration::zero() {
            0
        } else {
            ((range.end - range.start).num_milliseconds() / step.num_milliseconds()) as usize + 1
        };
        Self {
            start: range.start - step,
            end: range.end + step,
            missing_count: points,
        }
    }

    /// Inclusive interior range to request from a provider.
    pub fn fetch_window(&self, step: Duration) -> TimeRange {
        TimeRange::new(self.start + step, self.end - step)
    }
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}) missing {}",
            self.start, self.end, self.missing_count
        )
    }
}

/// Which grid points are expected to carry data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketCalendar {
    /// Every grid point is a trading point (crypto, FX aggregates).
    #[default]
    Continuous,
    /// Monday to Friday, minus the listed holidays.
    Weekdays {
        #[serde(default)]
        holidays: BTreeSet<NaiveDate>,
    },
}

impl MarketCalendar {
    pub fn weekdays() -> Self {
        MarketCalendar::Weekdays {
            holidays: BTreeSet::new(),
        }
    }

    pub fn with_holidays(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        MarketCalendar::Weekdays {
            holidays: holidays.into_iter().collect(),
        }
    }

    pub fn is_trading(&self, ts: NaiveDateTime) -> bool {
        match self {
            MarketCalendar::Continuous => true,
            MarketCalendar::Weekdays { holidays } => {
                !matches!(ts.weekday(), Weekday::Sat | Weekday::Sun)
                    && !holidays.contains(&ts.date())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct GapDetector {
    tolerance: f64,
    calendar: MarketCalendar,
}

impl Default for GapDetector {
    fn default() -> Self {
        Self::new(DEFAULT_GAP_TOLERANCE, MarketCalendar::default())
    }
}

impl GapDetector {
    pub fn new(tolerance: f64, calendar: MarketCalendar) -> Self {
        Self {
            tolerance: tolerance.max(0.0),
            calendar,
        }
    }

    pub fn calendar(&self) -> &MarketCalendar {
        &self.calendar
    }

    /// Gaps in a sorted timestamp series.
    pub fn detect(&self, timestamps: &[NaiveDateTime], step: Duration) -> Vec<Gap> {
        detect(timestamps, step, self.tolerance, &self.calendar)
    }
}

/// Walk consecutive pairs of `timestamps` (sorted ascending) and report every
/// hole containing at least one trading grid point.
pub fn detect(
    timestamps: &[NaiveDateTime],
    step: Duration,
    tolerance: f64,
    calendar: &MarketCalendar,
) -> Vec<Gap> {
    if step <= Duration::zero() {
        return Vec::new();
    }
    let threshold_ms = step.num_milliseconds() as f64 * (1.0 + tolerance.max(0.0));

    timestamps
        .windows(2)
        .filter_map(|pair| {
            let (prev, next) = (pair[0], pair[1]);
            if ((next - prev).num_milliseconds() as f64) <= threshold_ms {
                return None;
            }
            let mut missing = 0;
            let mut t = prev + step;
            while t < next {
                if calendar.is_trading(t) {
                    missing += 1;
                }
                t += step;
            }
            (missing > 0).then_some(Gap {
                start: prev,
                end: next,
                missing_count: missing,
            })
        })
        .collect()
}

/// Coalesce touching or overlapping gaps so each span is fetched once.
///
/// Touching gaps (one's `end` is the next one's `start`) are disjoint and
/// their counts add up. For partial overlaps the summed count is an upper
/// bound; a contained gap contributes nothing beyond the larger count.
pub fn merge_gaps(mut gaps: Vec<Gap>) -> Vec<Gap> {
    gaps.sort_by_key(|g| (g.start, g.end));
    let mut out: Vec<Gap> = Vec::with_capacity(gaps.len());
    for gap in gaps {
        match out.last_mut() {
            Some(last) if gap.start <= last.end => {
                if gap.end <= last.end {
                    last.missing_count = last.missing_count.max(gap.missing_count);
                } else {
                    last.missing_count += gap.missing_count;
                    last.end = gap.end;
                }
            }
            _ => out.push(gap),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn weekdays_of_january() -> Vec<NaiveDateTime> {
        (1..=31)
            .map(|d| day(1, d))
            .filter(|ts| !matches!(ts.weekday(), Weekday::Sat | Weekday::Sun))
            .collect()
    }

    #[test]
    fn complete_weekday_series_has_no_gaps() {
        let gaps = detect(
            &weekdays_of_january(),
            Duration::days(1),
            DEFAULT_GAP_TOLERANCE,
            &MarketCalendar::weekdays(),
        );
        assert!(gaps.is_empty());
    }

    #[test]
    fn continuous_calendar_flags_weekends() {
        let gaps = detect(
            &weekdays_of_january(),
            Duration::days(1),
            DEFAULT_GAP_TOLERANCE,
            &MarketCalendar::Continuous,
        );
        // Four weekends fall inside January 2024 after the 1st (a Monday).
        assert_eq!(gaps.len(), 4);
        assert!(gaps.iter().all(|g| g.missing_count == 2));
    }

    #[test]
    fn one_missing_weekday_is_one_gap_of_one() {
        let mut series = weekdays_of_january();
        series.retain(|ts| *ts != day(1, 17));
        let gaps = detect(
            &series,
            Duration::days(1),
            DEFAULT_GAP_TOLERANCE,
            &MarketCalendar::weekdays(),
        );
        assert_eq!(
            gaps,
            vec![Gap {
                start: day(1, 16),
                end: day(1, 18),
                missing_count: 1
            }]
        );
    }

    #[test]
    fn holidays_are_not_gaps() {
        let mut series = weekdays_of_january();
        series.retain(|ts| *ts != day(1, 15));
        let calendar = MarketCalendar::with_holidays([day(1, 15).date()]);
        assert!(detect(&series, Duration::days(1), 0.5, &calendar).is_empty());
    }

    #[test]
    fn tolerance_absorbs_jitter() {
        let series = vec![day(1, 1), day(1, 1) + Duration::hours(30)];
        assert!(detect(&series, Duration::days(1), 0.5, &MarketCalendar::Continuous).is_empty());
        assert_eq!(
            detect(&series, Duration::days(1), 0.1, &MarketCalendar::Continuous).len(),
            1
        );
    }

    #[test]
    fn fetch_window_is_the_interior() {
        let gap = Gap {
            start: day(1, 4),
            end: day(1, 6),
            missing_count: 1,
        };
        assert_eq!(
            gap.fetch_window(Duration::days(1)),
            TimeRange::new(day(1, 5), day(1, 5))
        );
        let back = Gap::from_range(TimeRange::new(day(1, 5), day(1, 5)), Duration::days(1));
        assert_eq!(back, gap);
    }

    #[test]
    fn merge_coalesces_touching_and_overlapping() {
        let g = |a, b, n| Gap {
            start: day(1, a),
            end: day(1, b),
            missing_count: n,
        };
        let merged = merge_gaps(vec![g(10, 12, 1), g(1, 3, 1), g(3, 6, 2), g(4, 5, 1)]);
        assert_eq!(merged, vec![g(1, 6, 3), g(10, 12, 1)]);
    }

    #[test]
    fn calendar_serde_is_tagged() {
        let cal = MarketCalendar::with_holidays([day(12, 25).date()]);
        let json = serde_json::to_string(&cal).unwrap();
        assert!(json.contains("\"kind\":\"weekdays\""));
        let back: MarketCalendar = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cal);
    }
}
