//! Trailing-window replace: delete a period's rows, harvest it again, reload.

use std::fmt;

use aptdata_core::{Period, Region};
use aptdata_storage::sql;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::harvest::{normalize_items, Harvester};
use crate::loader::{BatchLoader, LoadTally, UnitOutcome};
use crate::SyncError;

pub const MAX_WINDOW: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodState {
    Pending,
    Deleting,
    Fetching,
    Inserting,
    Done,
    Failed,
}

impl fmt::Display for PeriodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeriodState::Pending => "PENDING",
            PeriodState::Deleting => "DELETING",
            PeriodState::Fetching => "FETCHING",
            PeriodState::Inserting => "INSERTING",
            PeriodState::Done => "DONE",
            PeriodState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PeriodReport {
    pub period: Period,
    pub state: PeriodState,
    pub deleted: u64,
    pub fetched: usize,
    pub tally: LoadTally,
    /// Rows tagged with the period after the reload, when the store can say.
    pub stored: Option<i64>,
}

impl PeriodReport {
    fn new(period: Period) -> Self {
        Self {
            period,
            state: PeriodState::Pending,
            deleted: 0,
            fetched: 0,
            tally: LoadTally::default(),
            stored: None,
        }
    }
}

/// The `months` periods ending with the month of `today`, oldest first.
/// The size is clamped to `1..=12`.
pub fn window_periods(today: NaiveDate, months: usize) -> Vec<Period> {
    Period::trailing(today, months.clamp(1, MAX_WINDOW))
}

pub struct WindowSynchronizer {
    harvester: Harvester,
    regions: Vec<Region>,
    run_key: String,
}

impl WindowSynchronizer {
    /// `run_key` scopes checkpoint units so a rerun of the same run resumes
    /// while a later run replaces the window again.
    pub fn new(harvester: Harvester, regions: Vec<Region>, run_key: impl Into<String>) -> Self {
        Self {
            harvester,
            regions,
            run_key: run_key.into(),
        }
    }

    pub fn unit_id(&self, period: Period) -> String {
        format!("window:{}:{period}", self.run_key)
    }

    /// Synchronize `periods` in chronological order. The first failing period
    /// stops the run; earlier periods stay checkpointed.
    pub async fn run(&self, loader: &mut BatchLoader, periods: &[Period]) -> Result<Vec<PeriodReport>, SyncError> {
        let mut ordered = periods.to_vec();
        ordered.sort();
        ordered.dedup();

        info!(
            periods = ordered.len(),
            regions = self.regions.len(),
            run_key = %self.run_key,
            "window sync starting"
        );
        let mut reports = Vec::with_capacity(ordered.len());
        for period in ordered {
            let report = self
                .sync_period(loader, period)
                .instrument(info_span!("sync_period", %period))
                .await?;
            reports.push(report);
        }
        Ok(reports)
    }

    async fn sync_period(&self, loader: &mut BatchLoader, period: Period) -> Result<PeriodReport, SyncError> {
        let unit = self.unit_id(period);
        let mut report = PeriodReport::new(period);

        // A completed period must not be deleted again within the same run.
        if loader.is_complete(&unit) {
            info!("period already synchronized");
            report.state = PeriodState::Done;
            return Ok(report);
        }

        let failed = |stage: PeriodState, err: SyncError| {
            warn!(%stage, error = %err, "period failed");
            SyncError::PeriodFailed {
                period,
                stage,
                source: Box::new(err),
            }
        };

        report.state = PeriodState::Deleting;
        report.deleted = loader
            .execute_with_retry(&format!("{unit}:delete"), &sql::delete_trades_for_period(period))
            .await
            .map_err(|err| failed(PeriodState::Deleting, err))?;
        debug!(deleted = report.deleted, "existing rows removed");

        report.state = PeriodState::Fetching;
        let items = self
            .harvester
            .harvest_period(&self.regions, period)
            .await
            .map_err(|err| failed(PeriodState::Fetching, err))?;
        report.fetched = items.len();

        report.state = PeriodState::Inserting;
        let records = normalize_items(&items, self.harvester.normalize_config());
        let outcome = loader
            .load_unit(&unit, records)
            .await
            .map_err(|err| failed(PeriodState::Inserting, err))?;
        if let UnitOutcome::Loaded(tally) = outcome {
            report.tally = tally;
        }

        report.stored = loader
            .store()
            .query_count(&sql::count_trades_for_period(period))
            .await
            .ok();
        report.state = PeriodState::Done;
        info!(
            deleted = report.deleted,
            fetched = report.fetched,
            tally = %report.tally,
            "period synchronized"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{LoadLimits, RecordError};
    use crate::testing::{january, trade_item, ScriptedSource};
    use aptdata_core::normalize::{normalize_trade, NormalizeConfig};
    use aptdata_core::{TradeRecord, SEOUL_DISTRICTS};
    use aptdata_storage::{BackoffPolicy, CheckpointStore, DryRunStore, SqliteStore, Store};
    use std::sync::Arc;
    use std::time::Duration;

    const GANGNAM: &str = "11680";

    fn gangnam() -> Vec<Region> {
        SEOUL_DISTRICTS
            .iter()
            .copied()
            .filter(|r| r.code == GANGNAM)
            .collect()
    }

    fn synchronizer(source: Arc<ScriptedSource>) -> WindowSynchronizer {
        let harvester = Harvester::new(source, Duration::ZERO, 100, NormalizeConfig::default());
        WindowSynchronizer::new(harvester, gangnam(), "20240315")
    }

    fn loader(store: Arc<dyn Store>) -> BatchLoader {
        BatchLoader::new(
            store,
            CheckpointStore::ephemeral(),
            LoadLimits::default(),
            BackoffPolicy {
                max_attempts: 1,
                ..BackoffPolicy::default()
            },
        )
    }

    async fn sqlite() -> Arc<dyn Store> {
        let store = SqliteStore::in_memory().await.expect("sqlite");
        store.execute(&sql::schema()).await.expect("schema");
        Arc::new(store)
    }

    async fn preload(store: &Arc<dyn Store>, period: Period, seeds: std::ops::Range<usize>) {
        let records: Vec<Result<TradeRecord, RecordError>> = seeds
            .map(|n| {
                Ok(normalize_trade(&trade_item(GANGNAM, period, n), &NormalizeConfig::default())
                    .expect("record"))
            })
            .collect();
        loader(store.clone())
            .load_unit(&format!("seed:{period}"), records)
            .await
            .expect("preload");
    }

    async fn stored(store: &Arc<dyn Store>, period: Period) -> i64 {
        store
            .query_count(&sql::count_trades_for_period(period))
            .await
            .expect("count")
    }

    #[test]
    fn window_size_is_clamped() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 15).expect("date");
        assert_eq!(window_periods(today, 0).len(), 1);
        assert_eq!(window_periods(today, 40).len(), MAX_WINDOW);
        let three = window_periods(today, 3);
        assert_eq!(three.first().map(Period::code).as_deref(), Some("202401"));
        assert_eq!(three.last().map(Period::code).as_deref(), Some("202403"));
    }

    #[tokio::test]
    async fn replaced_period_holds_exactly_the_fresh_rows() {
        let store = sqlite().await;
        let december = january().shift(-1);
        preload(&store, january(), 100..108).await;
        preload(&store, december, 0..2).await;

        let source = Arc::new(ScriptedSource::default());
        source.put(GANGNAM, january(), (0..5).map(|n| trade_item(GANGNAM, january(), n)).collect());

        let mut loader = loader(store.clone());
        let reports = synchronizer(source)
            .run(&mut loader, &[january()])
            .await
            .expect("sync");

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].state, PeriodState::Done);
        assert_eq!(reports[0].deleted, 8);
        assert_eq!(reports[0].fetched, 5);
        assert_eq!(reports[0].stored, Some(5));
        assert_eq!(stored(&store, january()).await, 5);
        assert_eq!(stored(&store, december).await, 2);
    }

    #[tokio::test]
    async fn failed_period_aborts_the_rest_of_the_window() {
        let store = sqlite().await;
        let december = january().shift(-1);
        let february = january().shift(1);
        preload(&store, january(), 0..3).await;
        preload(&store, february, 0..4).await;

        let source = Arc::new(ScriptedSource::default().failing_target(GANGNAM, january()));
        source.put(GANGNAM, december, vec![trade_item(GANGNAM, december, 1)]);
        source.put(GANGNAM, february, vec![trade_item(GANGNAM, february, 1)]);

        let mut loader = loader(store.clone());
        let sync = synchronizer(source);
        let err = sync
            .run(&mut loader, &[february, january(), december])
            .await
            .unwrap_err();

        match err {
            SyncError::PeriodFailed { period, stage, .. } => {
                assert_eq!(period, january());
                assert_eq!(stage, PeriodState::Fetching);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(loader.is_complete(&sync.unit_id(december)));
        assert!(!loader.is_complete(&sync.unit_id(january())));
        assert_eq!(stored(&store, december).await, 1);
        assert_eq!(stored(&store, january()).await, 0);
        assert_eq!(stored(&store, february).await, 4);
    }

    #[tokio::test]
    async fn rerun_skips_periods_already_replaced() {
        let store = sqlite().await;
        let source = Arc::new(ScriptedSource::default());
        source.put(GANGNAM, january(), (0..3).map(|n| trade_item(GANGNAM, january(), n)).collect());

        let mut loader = loader(store.clone());
        let sync = synchronizer(source.clone());
        sync.run(&mut loader, &[january()]).await.expect("first");
        let calls = source.calls();

        let reports = sync.run(&mut loader, &[january()]).await.expect("second");
        assert_eq!(reports[0].state, PeriodState::Done);
        assert_eq!(reports[0].deleted, 0);
        assert_eq!(source.calls(), calls);
        assert_eq!(stored(&store, january()).await, 3);
    }

    #[tokio::test]
    async fn dry_run_leaves_the_store_untouched() {
        let store = sqlite().await;
        preload(&store, january(), 100..104).await;

        let source = Arc::new(ScriptedSource::default());
        source.put(GANGNAM, january(), (0..5).map(|n| trade_item(GANGNAM, january(), n)).collect());

        let dry: Arc<dyn Store> = Arc::new(DryRunStore::new(Some(store.clone())));
        let mut loader = loader(dry);
        let reports = synchronizer(source)
            .run(&mut loader, &[january()])
            .await
            .expect("dry run");

        assert_eq!(reports[0].deleted, 0);
        assert_eq!(reports[0].fetched, 5);
        assert_eq!(reports[0].tally.inserted, 0);
        assert_eq!(stored(&store, january()).await, 4);
    }
}
