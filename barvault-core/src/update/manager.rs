//! Update orchestration: one cycle per dataset.
//!
//! ```text
//! INIT -> RANGE_COMPUTED -> FETCHING -> VALIDATING -> GAP_CHECKING -> WRITING -> METADATA_UPDATE -> DONE
//! INIT -> RANGE_COMPUTED -> GAP_CHECKING -> BACKFILLING -> WRITING -> METADATA_UPDATE -> DONE   (BACKFILL)
//! any state -> FAILED
//! ```
//!
//! The dataset lock is held for the whole cycle, so the window computed
//! from metadata is still valid when the rows are written. Nothing on disk
//! changes before WRITING.

use super::result::{UpdateError, UpdateResult, UpdateState};
use super::strategy::{UpdateRequest, UpdateStrategy};
use crate::clock::Clock;
use crate::domain::{Bar, DatasetKey, TimeRange};
use crate::error::{FailureKind, GapFailure, StoreError};
use crate::fetch::{DataFetcher, FetchError};
use crate::gaps::{merge_gaps, Gap, GapDetector, MarketCalendar, DEFAULT_GAP_TOLERANCE};
use crate::lock::LockGuard;
use crate::metadata::{
    health_of, DatasetExtent, MetadataDelta, MetadataRecord, MetadataTracker, UpdateHistoryEntry,
};
use crate::partition::PartitionKey;
use crate::profile::DatasetProfile;
use crate::storage::{normalize, StorageEngine};
use crate::transaction::{DeletePartition, PutMetadata, TransactionCoordinator, WritePartition};
use crate::validation::{BatchValidator, OhlcvValidator};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Knobs that apply to every dataset a manager updates.
#[derive(Debug, Clone)]
pub struct UpdateSettings {
    /// Where INCREMENTAL / APPEND_ONLY start when a dataset has no metadata.
    pub bootstrap_start: NaiveDateTime,
    /// FULL_REFRESH window when the request has no explicit start.
    pub default_history: Duration,
    /// INCREMENTAL never reaches further back than this.
    pub default_lookback: Duration,
    pub gap_tolerance: f64,
    /// Write `.profile.json` after each cycle that changed data.
    pub generate_profile: bool,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            bootstrap_start: NaiveDate::from_ymd_opt(2020, 1, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .unwrap_or_default(),
            default_history: Duration::days(365),
            default_lookback: Duration::days(7),
            gap_tolerance: DEFAULT_GAP_TOLERANCE,
            generate_profile: false,
        }
    }
}

/// Why a cycle failed, and the range the next cycle should retry.
struct CycleFailure {
    error: StoreError,
    range: Option<TimeRange>,
    /// The history entry for this failure is already written.
    recorded: bool,
}

impl CycleFailure {
    fn new(error: StoreError, range: Option<TimeRange>) -> Self {
        Self {
            error,
            range,
            recorded: false,
        }
    }

    fn early(error: StoreError) -> Self {
        Self::new(error, None)
    }
}

/// Accumulates the visible trace of one cycle.
struct Cycle {
    result: UpdateResult,
}

impl Cycle {
    fn enter(&mut self, state: UpdateState) {
        debug!(
            key = %self.result.key,
            from = %self.result.final_state,
            to = %state,
            "update state"
        );
        self.result.final_state = state;
        self.result.states.push(state);
    }

    fn error(&mut self, kind: FailureKind, message: String) {
        self.result.errors.push(UpdateError {
            state: self.result.final_state,
            kind,
            message,
        });
    }
}

pub struct UpdateManager {
    engine: StorageEngine,
    metadata: MetadataTracker,
    coordinator: TransactionCoordinator,
    fetchers: HashMap<String, Arc<dyn DataFetcher>>,
    validator: Arc<dyn BatchValidator>,
    clock: Arc<dyn Clock>,
    settings: UpdateSettings,
}

impl UpdateManager {
    pub fn new(engine: StorageEngine, clock: Arc<dyn Clock>) -> Self {
        let metadata = MetadataTracker::new(&engine, clock.clone());
        let coordinator = TransactionCoordinator::new(engine.clone(), metadata.clone());
        Self {
            engine,
            metadata,
            coordinator,
            fetchers: HashMap::new(),
            validator: Arc::new(OhlcvValidator),
            clock,
            settings: UpdateSettings::default(),
        }
    }

    /// Serve datasets whose key names `provider` from `fetcher`.
    pub fn with_fetcher(mut self, provider: impl Into<String>, fetcher: Arc<dyn DataFetcher>) -> Self {
        self.fetchers.insert(provider.into(), fetcher);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn BatchValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_settings(mut self, settings: UpdateSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.metadata = self.metadata.with_stale_after(stale_after);
        self.coordinator = TransactionCoordinator::new(self.engine.clone(), self.metadata.clone());
        self
    }

    pub fn engine(&self) -> &StorageEngine {
        &self.engine
    }

    pub fn metadata(&self) -> &MetadataTracker {
        &self.metadata
    }

    pub fn settings(&self) -> &UpdateSettings {
        &self.settings
    }

    /// Run one update cycle. Never returns an error: failures are reported
    /// in the result and recorded in the dataset's history.
    pub fn update(&self, request: &UpdateRequest) -> UpdateResult {
        let started = Instant::now();
        let mut cycle = Cycle {
            result: UpdateResult::start(request.key.clone(), request.strategy),
        };

        match self.run_cycle(request, &mut cycle) {
            Ok(()) => {
                cycle.result.success = true;
                cycle.enter(UpdateState::Done);
            }
            Err(failure) => {
                if !matches!(failure.error, StoreError::GapFetch { .. }) {
                    cycle.error(failure.error.kind(), failure.error.to_string());
                }
                cycle.enter(UpdateState::Failed);
                if !failure.recorded {
                    self.record_failure(request, &failure);
                }
            }
        }

        cycle.result.duration = started.elapsed();
        let r = &cycle.result;
        info!(
            key = %r.key,
            strategy = %r.strategy,
            success = r.success,
            rows_added = r.rows_added,
            rows_updated = r.rows_updated,
            gaps_filled = r.gaps_filled,
            "update finished"
        );
        cycle.result
    }

    /// Run independent cycles in parallel. One dataset failing never stops
    /// the others. Results come back in request order.
    pub fn update_many(&self, requests: &[UpdateRequest]) -> Vec<UpdateResult> {
        requests.par_iter().map(|r| self.update(r)).collect()
    }

    fn record_failure(&self, request: &UpdateRequest, failure: &CycleFailure) {
        // Recording needs the lock we just failed to get.
        if failure.error.is_recoverable() {
            return;
        }
        let entry = UpdateHistoryEntry::failure(
            self.clock.now(),
            request.strategy,
            failure.error.kind(),
            failure.error.to_string(),
            failure.range,
        );
        if let Err(e) = self.metadata.record_failure(&request.key, entry) {
            warn!(key = %request.key, error = %e, "could not record failed update");
        }
    }

    fn run_cycle(&self, request: &UpdateRequest, cycle: &mut Cycle) -> Result<(), CycleFailure> {
        let guard = self
            .engine
            .lock_dataset(&request.key)
            .map_err(CycleFailure::early)?;
        let record = self.metadata.get(&request.key).map_err(CycleFailure::early)?;
        let retry = record
            .as_ref()
            .filter(|_| request.strategy.resumes())
            .and_then(|r| r.update_history.pending_retry());
        if let Some(range) = retry {
            info!(key = %request.key, %range, "retrying range of last failed cycle");
        }

        // Slow fetches must not let a waiter reclaim the lock mid-cycle.
        guard.keep_alive(|| match request.strategy {
            UpdateStrategy::Incremental | UpdateStrategy::AppendOnly => {
                self.run_windowed(request, cycle, record.as_ref(), retry, &guard)
            }
            UpdateStrategy::FullRefresh => self.run_full_refresh(request, cycle, record, &guard),
            UpdateStrategy::Backfill => {
                self.run_backfill(request, cycle, record.as_ref(), retry, &guard)
            }
        })?;

        if self.settings.generate_profile && cycle.result.rows_added + cycle.result.rows_updated > 0 {
            self.write_profile(&request.key);
        }
        Ok(())
    }

    /// INCREMENTAL and APPEND_ONLY.
    fn run_windowed(
        &self,
        request: &UpdateRequest,
        cycle: &mut Cycle,
        record: Option<&MetadataRecord>,
        retry: Option<TimeRange>,
        guard: &LockGuard,
    ) -> Result<(), CycleFailure> {
        let key = &request.key;
        let step = key.frequency.step();
        let now = self.clock.now();
        let last = record.and_then(|r| r.last_timestamp);
        let lookback = request.lookback.unwrap_or(self.settings.default_lookback);

        let start = match (request.strategy, last) {
            (UpdateStrategy::Incremental, Some(last)) => (last + step).max(now - lookback),
            (_, Some(last)) => last + step,
            (_, None) => request.start.unwrap_or(self.settings.bootstrap_start),
        };
        let mut windows: Vec<TimeRange> = retry.into_iter().collect();
        let window = TimeRange::new(start, now);
        if !window.is_empty() {
            windows.push(window);
        }
        let attempted = windows.iter().copied().reduce(|a, b| a.union(&b));
        cycle.enter(UpdateState::RangeComputed);

        cycle.enter(UpdateState::Fetching);
        let mut fetched = Vec::new();
        for window in &windows {
            let rows = self
                .fetch(key, *window)
                .map_err(|e| CycleFailure::new(e, attempted))?;
            guard
                .renew()
                .map_err(|e| CycleFailure::new(e, attempted))?;
            fetched.extend(rows);
        }

        cycle.enter(UpdateState::Validating);
        let mut batch = normalize(fetched);
        if request.strategy == UpdateStrategy::AppendOnly {
            if let Some(last) = last {
                let before = batch.len();
                batch.retain(|b| b.timestamp > last);
                if batch.len() < before {
                    debug!(key = %key, dropped = before - batch.len(), "dropped rows at or before last stored bar");
                }
            }
        }
        self.validate(&batch)
            .map_err(|e| CycleFailure::new(e, attempted))?;

        cycle.enter(UpdateState::GapChecking);
        let all = self
            .merged_timestamps(key, &batch)
            .map_err(|e| CycleFailure::new(e, attempted))?;
        let known_gaps = self.detector(&request.calendar).detect(&all, step);

        cycle.enter(UpdateState::Writing);
        guard
            .renew()
            .map_err(|e| CycleFailure::new(e, attempted))?;
        let stats = self
            .engine
            .write(key, batch)
            .map_err(|e| CycleFailure::new(e, attempted))?;
        cycle.result.rows_added = stats.inserted;
        cycle.result.rows_updated = stats.updated;

        cycle.enter(UpdateState::MetadataUpdate);
        guard
            .renew()
            .map_err(|e| CycleFailure::new(e, attempted))?;
        let entry = UpdateHistoryEntry::success(
            now,
            request.strategy,
            stats.inserted,
            stats.updated,
            attempted,
        );
        let delta = MetadataDelta::success(entry, 0, None)
            .with_reset(DatasetExtent::of_sorted(&all))
            .with_known_gaps(known_gaps);
        self.metadata
            .update(key, delta)
            .map_err(|e| CycleFailure::new(e, attempted))?;
        Ok(())
    }

    fn run_full_refresh(
        &self,
        request: &UpdateRequest,
        cycle: &mut Cycle,
        record: Option<MetadataRecord>,
        guard: &LockGuard,
    ) -> Result<(), CycleFailure> {
        let key = &request.key;
        let now = self.clock.now();
        let window = TimeRange::new(
            request.start.unwrap_or(now - self.settings.default_history),
            now,
        );
        cycle.enter(UpdateState::RangeComputed);

        cycle.enter(UpdateState::Fetching);
        let fetched = self
            .fetch(key, window)
            .map_err(|e| CycleFailure::new(e, Some(window)))?;

        cycle.enter(UpdateState::Validating);
        let batch = normalize(fetched);
        if batch.is_empty() {
            return Err(CycleFailure::new(
                StoreError::Fetch(FetchError::Validation(format!(
                    "provider returned no rows for {window}; stored data kept"
                ))),
                Some(window),
            ));
        }
        self.validate(&batch)
            .map_err(|e| CycleFailure::new(e, Some(window)))?;

        cycle.enter(UpdateState::GapChecking);
        let timestamps: Vec<NaiveDateTime> = batch.iter().map(|b| b.timestamp).collect();
        let known_gaps = self.detector(&request.calendar).detect(&timestamps, key.frequency.step());

        cycle.enter(UpdateState::Writing);
        let granularity = self.engine.scheme().granularity_for(key.frequency);
        let mut groups: BTreeMap<PartitionKey, Vec<Bar>> = BTreeMap::new();
        for bar in &batch {
            groups
                .entry(PartitionKey::for_timestamp(bar.timestamp, granularity))
                .or_default()
                .push(*bar);
        }

        let mut next = record.unwrap_or_else(|| MetadataRecord::new(key.clone(), now));
        next.first_timestamp = timestamps.first().copied();
        next.last_timestamp = timestamps.last().copied();
        next.row_count = batch.len();
        next.known_gaps = known_gaps;
        next.update_history.push(UpdateHistoryEntry::success(
            now,
            UpdateStrategy::FullRefresh,
            batch.len(),
            0,
            Some(window),
        ));
        next.health = health_of(&next, now, self.metadata.stale_after());
        next.updated_at = now;

        let existing = self
            .engine
            .list_partitions(key)
            .map_err(|e| CycleFailure::new(e, Some(window)))?;
        let mut tx = self.coordinator.begin();
        for partition in existing {
            tx.add_operation(DeletePartition::new(key.clone(), partition));
        }
        for (partition, rows) in groups {
            tx.add_operation(WritePartition::new(key.clone(), partition, rows));
        }
        tx.add_operation(PutMetadata::new(key.clone(), Some(next)));
        guard
            .renew()
            .map_err(|e| CycleFailure::new(e, Some(window)))?;
        self.coordinator
            .commit(&mut tx)
            .map_err(|e| CycleFailure::new(e, Some(window)))?;
        cycle.result.rows_added = batch.len();

        // The record was replaced inside the transaction.
        cycle.enter(UpdateState::MetadataUpdate);
        Ok(())
    }

    fn run_backfill(
        &self,
        request: &UpdateRequest,
        cycle: &mut Cycle,
        record: Option<&MetadataRecord>,
        retry: Option<TimeRange>,
        guard: &LockGuard,
    ) -> Result<(), CycleFailure> {
        let key = &request.key;
        let step = key.frequency.step();
        let now = self.clock.now();
        cycle.enter(UpdateState::RangeComputed);

        cycle.enter(UpdateState::GapChecking);
        let stored = self
            .stored_timestamps(key)
            .map_err(|e| CycleFailure::new(e, retry))?;
        let mut gaps = self.detector(&request.calendar).detect(&stored, step);
        gaps.extend(retry.map(|r| Gap::from_range(r, step)));
        let gaps = merge_gaps(gaps);
        debug!(key = %key, gaps = gaps.len(), stored = stored.len(), "gaps to backfill");

        cycle.enter(UpdateState::Backfilling);
        let mut fetched = Vec::new();
        let mut failures: Vec<GapFailure> = Vec::new();
        for gap in &gaps {
            let window = gap.fetch_window(step);
            let rows = self.fetch(key, window).and_then(|rows| {
                let mut rows = normalize(rows);
                rows.retain(|b| window.contains(b.timestamp));
                self.validate(&rows).map(|()| rows)
            });
            guard
                .renew()
                .map_err(|e| CycleFailure::new(e, retry))?;
            match rows {
                Ok(rows) => {
                    cycle.result.gaps_filled += 1;
                    fetched.extend(rows);
                }
                Err(e) => {
                    warn!(key = %key, %window, error = %e, "backfill range failed");
                    cycle.error(FailureKind::GapFetch, format!("{window}: {e}"));
                    failures.push(GapFailure {
                        gap: *gap,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }
        let batch = normalize(fetched);

        cycle.enter(UpdateState::Writing);
        let all = merge_timestamps(stored, &batch);
        guard
            .renew()
            .map_err(|e| CycleFailure::new(e, retry))?;
        let stats = self
            .engine
            .write(key, batch)
            .map_err(|e| CycleFailure::new(e, retry))?;
        cycle.result.rows_added = stats.inserted;
        cycle.result.rows_updated = stats.updated;

        cycle.enter(UpdateState::MetadataUpdate);
        guard
            .renew()
            .map_err(|e| CycleFailure::new(e, retry))?;
        let known_gaps = self.detector(&request.calendar).detect(&all, step);
        let failed_range = failures
            .iter()
            .map(|f| f.gap.fetch_window(step))
            .reduce(|a, b| a.union(&b));
        let entry = match failed_range {
            None => UpdateHistoryEntry::success(
                now,
                UpdateStrategy::Backfill,
                stats.inserted,
                stats.updated,
                gaps.iter().map(|g| g.fetch_window(step)).reduce(|a, b| a.union(&b)),
            ),
            Some(range) => UpdateHistoryEntry {
                rows_added: stats.inserted,
                rows_updated: stats.updated,
                ..UpdateHistoryEntry::failure(
                    now,
                    UpdateStrategy::Backfill,
                    FailureKind::GapFetch,
                    format!("{} of {} range(s) failed", failures.len(), gaps.len()),
                    Some(range),
                )
            },
        };
        let delta = MetadataDelta::success(entry, 0, None)
            .with_reset(DatasetExtent::of_sorted(&all))
            .with_known_gaps(known_gaps);
        self.metadata
            .update(key, delta)
            .map_err(|e| CycleFailure::new(e, failed_range))?;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CycleFailure {
                error: StoreError::GapFetch { failures },
                range: failed_range,
                recorded: true,
            })
        }
    }

    fn fetcher_for(&self, key: &DatasetKey) -> Result<&Arc<dyn DataFetcher>, StoreError> {
        self.fetchers.get(&key.provider).ok_or_else(|| {
            StoreError::Fetch(FetchError::Configuration(format!(
                "no fetcher registered for provider '{}'",
                key.provider
            )))
        })
    }

    fn fetch(&self, key: &DatasetKey, window: TimeRange) -> Result<Vec<Bar>, StoreError> {
        let fetcher = self.fetcher_for(key)?;
        let bars = fetcher.fetch(&key.symbol, window.start, window.end, key.frequency)?;
        debug!(key = %key, %window, rows = bars.len(), fetcher = fetcher.name(), "fetched");
        Ok(bars)
    }

    fn validate(&self, batch: &[Bar]) -> Result<(), StoreError> {
        let violations = self.validator.check(batch);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(StoreError::DataValidation { violations })
        }
    }

    fn detector(&self, calendar: &MarketCalendar) -> GapDetector {
        GapDetector::new(self.settings.gap_tolerance, calendar.clone())
    }

    fn stored_timestamps(&self, key: &DatasetKey) -> Result<Vec<NaiveDateTime>, StoreError> {
        Ok(self
            .engine
            .read_all(key)?
            .into_iter()
            .map(|b| b.timestamp)
            .collect())
    }

    /// Timestamps the dataset will hold once `batch` is written.
    fn merged_timestamps(
        &self,
        key: &DatasetKey,
        batch: &[Bar],
    ) -> Result<Vec<NaiveDateTime>, StoreError> {
        Ok(merge_timestamps(self.stored_timestamps(key)?, batch))
    }

    fn write_profile(&self, key: &DatasetKey) {
        let source = self
            .fetchers
            .get(&key.provider)
            .map(|f| f.name().to_string())
            .unwrap_or_default();
        let result = self
            .engine
            .read_all(key)
            .and_then(|bars| self.metadata.write_profile(key, &DatasetProfile::from_bars(&bars, source)));
        if let Err(e) = result {
            warn!(key = %key, error = %e, "could not write dataset profile");
        }
    }
}

fn merge_timestamps(mut stored: Vec<NaiveDateTime>, batch: &[Bar]) -> Vec<NaiveDateTime> {
    stored.extend(batch.iter().map(|b| b.timestamp));
    stored.sort();
    stored.dedup();
    stored
}
