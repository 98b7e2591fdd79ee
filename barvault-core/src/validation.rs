//! Batch validation before anything is written.
//!
//! A validator reports every violation it finds; the update manager rejects
//! the whole batch if the list is non-empty.

use crate::domain::Bar;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rule a row broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    NonFinite,
    NonPositivePrice,
    HighBelowLow,
    OpenOutOfRange,
    CloseOutOfRange,
    NegativeVolume,
    NonIncreasingTimestamp,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Rule::NonFinite => "non-finite value",
            Rule::NonPositivePrice => "non-positive price",
            Rule::HighBelowLow => "high below low",
            Rule::OpenOutOfRange => "open outside [low, high]",
            Rule::CloseOutOfRange => "close outside [low, high]",
            Rule::NegativeVolume => "negative volume",
            Rule::NonIncreasingTimestamp => "timestamp not after previous row",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Row index within the checked batch.
    pub index: usize,
    pub timestamp: NaiveDateTime,
    pub rule: Rule,
    pub detail: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row {} ({}): {}: {}",
            self.index, self.timestamp, self.rule, self.detail
        )
    }
}

pub trait BatchValidator: Send + Sync {
    fn check(&self, batch: &[Bar]) -> Vec<Violation>;
}

/// Accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopValidator;

impl BatchValidator for NoopValidator {
    fn check(&self, _batch: &[Bar]) -> Vec<Violation> {
        Vec::new()
    }
}

/// Structural OHLCV checks.
#[derive(Debug, Default, Clone, Copy)]
pub struct OhlcvValidator;

impl BatchValidator for OhlcvValidator {
    fn check(&self, batch: &[Bar]) -> Vec<Violation> {
        let mut violations = Vec::new();
        let mut push = |index: usize, bar: &Bar, rule: Rule, detail: String| {
            violations.push(Violation {
                index,
                timestamp: bar.timestamp,
                rule,
                detail,
            });
        };

        for (i, bar) in batch.iter().enumerate() {
            let values = [bar.open, bar.high, bar.low, bar.close, bar.volume];
            if values.iter().any(|v| !v.is_finite()) {
                push(i, bar, Rule::NonFinite, format!("{values:?}"));
                continue;
            }
            if bar.open <= 0.0 || bar.high <= 0.0 || bar.low <= 0.0 || bar.close <= 0.0 {
                push(
                    i,
                    bar,
                    Rule::NonPositivePrice,
                    format!("o={} h={} l={} c={}", bar.open, bar.high, bar.low, bar.close),
                );
            }
            if bar.high < bar.low {
                push(i, bar, Rule::HighBelowLow, format!("h={} l={}", bar.high, bar.low));
            } else {
                if bar.open < bar.low || bar.open > bar.high {
                    push(i, bar, Rule::OpenOutOfRange, format!("o={}", bar.open));
                }
                if bar.close < bar.low || bar.close > bar.high {
                    push(i, bar, Rule::CloseOutOfRange, format!("c={}", bar.close));
                }
            }
            if bar.volume < 0.0 {
                push(i, bar, Rule::NegativeVolume, format!("v={}", bar.volume));
            }
            if i > 0 && batch[i - 1].timestamp >= bar.timestamp {
                push(
                    i,
                    bar,
                    Rule::NonIncreasingTimestamp,
                    format!("previous {}", batch[i - 1].timestamp),
                );
            }
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn clean_batch_passes() {
        let batch = vec![
            Bar::new(ts(1), 10.0, 11.0, 9.0, 10.5, 100.0),
            Bar::new(ts(2), 10.5, 12.0, 10.0, 11.0, 0.0),
        ];
        assert!(OhlcvValidator.check(&batch).is_empty());
    }

    #[test]
    fn reports_each_rule() {
        let batch = vec![
            Bar::new(ts(2), 10.0, 9.0, 11.0, 10.0, 1.0),
            Bar::new(ts(1), 0.0, 1.0, 0.5, 0.7, -1.0),
            Bar::new(ts(3), f64::NAN, 1.0, 1.0, 1.0, 1.0),
            Bar::new(ts(4), 5.0, 6.0, 4.0, 7.0, 1.0),
        ];
        let rules: Vec<(usize, Rule)> = OhlcvValidator
            .check(&batch)
            .into_iter()
            .map(|v| (v.index, v.rule))
            .collect();
        assert!(rules.contains(&(0, Rule::HighBelowLow)));
        assert!(rules.contains(&(1, Rule::NonPositivePrice)));
        assert!(rules.contains(&(1, Rule::OpenOutOfRange)));
        assert!(rules.contains(&(1, Rule::NegativeVolume)));
        assert!(rules.contains(&(1, Rule::NonIncreasingTimestamp)));
        assert!(rules.contains(&(2, Rule::NonFinite)));
        assert!(rules.contains(&(3, Rule::CloseOutOfRange)));
    }

    #[test]
    fn noop_accepts_anything() {
        let batch = vec![Bar::new(ts(1), -1.0, -1.0, -1.0, -1.0, -1.0)];
        assert!(NoopValidator.check(&batch).is_empty());
    }
}
