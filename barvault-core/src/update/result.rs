use super::UpdateStrategy;
use crate::domain::DatasetKey;
use crate::error::FailureKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Update cycle states, in the order a successful cycle visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateState {
    Init,
    RangeComputed,
    Fetching,
    Validating,
    GapChecking,
    Backfilling,
    Writing,
    MetadataUpdate,
    Done,
    Failed,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateState::Init => "INIT",
            UpdateState::RangeComputed => "RANGE_COMPUTED",
            UpdateState::Fetching => "FETCHING",
            UpdateState::Validating => "VALIDATING",
            UpdateState::GapChecking => "GAP_CHECKING",
            UpdateState::Backfilling => "BACKFILLING",
            UpdateState::Writing => "WRITING",
            UpdateState::MetadataUpdate => "METADATA_UPDATE",
            UpdateState::Done => "DONE",
            UpdateState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateError {
    /// State the cycle was in when this went wrong.
    pub state: UpdateState,
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.state, self.kind, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateResult {
    pub key: DatasetKey,
    pub strategy: UpdateStrategy,
    pub success: bool,
    pub rows_added: usize,
    pub rows_updated: usize,
    pub gaps_filled: usize,
    pub duration: Duration,
    pub errors: Vec<UpdateError>,
    pub final_state: UpdateState,
    /// Every state visited, in order.
    pub states: Vec<UpdateState>,
}

impl UpdateResult {
    pub(crate) fn start(key: DatasetKey, strategy: UpdateStrategy) -> Self {
        Self {
            key,
            strategy,
            success: false,
            rows_added: 0,
            rows_updated: 0,
            gaps_filled: 0,
            duration: Duration::ZERO,
            errors: Vec::new(),
            final_state: UpdateState::Init,
            states: vec![UpdateState::Init],
        }
    }

    pub fn first_error_kind(&self) -> Option<FailureKind> {
        self.errors.first().map(|e| e.kind)
    }
}

impl fmt::Display for UpdateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.success { "OK" } else { "FAIL" };
        write!(
            f,
            "{status:<4} {} [{}] +{} ~{} gaps={} in {:.2}s",
            self.key,
            self.strategy,
            self.rows_added,
            self.rows_updated,
            self.gaps_filled,
            self.duration.as_secs_f64()
        )?;
        for error in &self.errors {
            write!(f, "\n     {error}")?;
        }
        Ok(())
    }
}
