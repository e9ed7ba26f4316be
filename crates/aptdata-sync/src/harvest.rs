//! Paginated, paced harvesting of the trade endpoint and the JSONL archive it
//! writes to.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use aptdata_adapters::api::MAX_PAGE_SIZE;
use aptdata_adapters::{ApiError, PageSource};
use aptdata_core::normalize::{normalize_trade, NormalizeConfig};
use aptdata_core::{Period, RawItem, Region, TradeRecord};
use aptdata_storage::{sql, CallPacer, HouseholdLedger, TargetRegistry};
use glob::glob;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::loader::{BatchLoader, RecordError};
use crate::SyncError;

/// Upper bound on pages followed for one target.
pub const DEFAULT_MAX_PAGES: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestMode {
    /// Items are normalized as they arrive and archived as [`TradeRecord`]s.
    Normalized,
    /// Upstream field maps are archived untouched.
    Raw,
}

impl HarvestMode {
    pub fn dir_name(self) -> &'static str {
        match self {
            HarvestMode::Normalized => "normalized",
            HarvestMode::Raw => "raw",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HarvestSummary {
    pub completed: usize,
    pub errored: usize,
    pub items: u64,
    pub rejected: u64,
}

pub fn normalize_items<'a>(
    items: &'a [RawItem],
    config: &'a NormalizeConfig,
) -> impl Iterator<Item = Result<TradeRecord, RecordError>> + 'a {
    items
        .iter()
        .map(move |item| normalize_trade(item, config).map_err(RecordError::from))
}

pub struct Harvester {
    source: Arc<dyn PageSource>,
    pacer: CallPacer,
    page_size: u32,
    max_pages: u32,
    normalize: NormalizeConfig,
}

impl Harvester {
    pub fn new(
        source: Arc<dyn PageSource>,
        call_delay: Duration,
        page_size: u32,
        normalize: NormalizeConfig,
    ) -> Self {
        Self {
            source,
            pacer: CallPacer::new(call_delay),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            max_pages: DEFAULT_MAX_PAGES,
            normalize,
        }
    }

    pub fn normalize_config(&self) -> &NormalizeConfig {
        &self.normalize
    }

    /// Follow pagination for one target until the reported total is reached
    /// or a page comes back empty.
    pub async fn fetch_target(&self, region_code: &str, period: Period) -> Result<Vec<RawItem>, ApiError> {
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            self.pacer.wait().await;
            let result = self
                .source
                .fetch_trade_page(region_code, period, page, self.page_size)
                .await?;
            let received = result.items.len();
            items.extend(result.items);
            debug!(page, received, total = result.total_count, "page fetched");

            if received == 0 || items.len() as u64 >= result.total_count {
                break;
            }
            if page >= self.max_pages {
                warn!(page, total = result.total_count, "page limit reached before total");
                break;
            }
            page += 1;
        }
        Ok(items)
    }

    /// Work through every pending target in registry order. A failing target
    /// is marked `error` and the run moves on.
    pub async fn run(
        &self,
        registry: &mut TargetRegistry,
        mode: HarvestMode,
        archive: &Archive,
    ) -> Result<HarvestSummary, SyncError> {
        let positions = registry.pending_positions();
        info!(pending = positions.len(), mode = mode.dir_name(), "harvest starting");

        let mut summary = HarvestSummary::default();
        for position in positions {
            let Some(target) = registry.target(position).cloned() else {
                continue;
            };
            let span = info_span!(
                "harvest_target",
                region = %target.region_code,
                period = %target.period
            );

            match self
                .fetch_target(&target.region_code, target.period)
                .instrument(span.clone())
                .await
            {
                Ok(items) => {
                    let written = archive
                        .write_target(mode, &target.region_code, target.period, &items, &self.normalize)
                        .await?;
                    registry.record_completed(position, items.len() as u64).await?;
                    summary.completed += 1;
                    summary.items += items.len() as u64;
                    summary.rejected += written.rejected;
                    span.in_scope(|| info!(items = items.len(), "target completed"));
                }
                Err(err) => {
                    registry.record_error(position).await?;
                    summary.errored += 1;
                    span.in_scope(|| warn!(error = %err, "target failed"));
                }
            }
        }

        info!(
            completed = summary.completed,
            errored = summary.errored,
            items = summary.items,
            "harvest finished"
        );
        Ok(summary)
    }

    /// Every region for one period; any failing region fails the period.
    pub async fn harvest_period(&self, regions: &[Region], period: Period) -> Result<Vec<RawItem>, SyncError> {
        let mut items = Vec::new();
        for region in regions {
            let fetched = self
                .fetch_target(region.code, period)
                .instrument(info_span!("harvest_target", region = region.code, %period))
                .await?;
            items.extend(fetched);
        }
        Ok(items)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveWrite {
    pub written: u64,
    pub rejected: u64,
}

/// JSON lines under `<root>/<mode>/<YYYY>/<YYYYMM>/<region>.jsonl`, one file
/// per harvest target. A file is written whole and never grows afterwards.
#[derive(Debug, Clone)]
pub struct Archive {
    root: PathBuf,
}

impl Archive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, mode: HarvestMode, region_code: &str, period: Period) -> PathBuf {
        self.root
            .join(mode.dir_name())
            .join(format!("{:04}", period.year()))
            .join(period.code())
            .join(format!("{region_code}.jsonl"))
    }

    pub async fn write_target(
        &self,
        mode: HarvestMode,
        region_code: &str,
        period: Period,
        items: &[RawItem],
        config: &NormalizeConfig,
    ) -> io::Result<ArchiveWrite> {
        let mut report = ArchiveWrite::default();
        if items.is_empty() {
            return Ok(report);
        }

        let mut buf = Vec::new();
        for item in items {
            match mode {
                HarvestMode::Raw => serde_json::to_writer(&mut buf, item)?,
                HarvestMode::Normalized => match normalize_trade(item, config) {
                    Ok(record) => serde_json::to_writer(&mut buf, &record)?,
                    Err(err) => {
                        debug!(error = %err, "item rejected during harvest");
                        report.rejected += 1;
                        continue;
                    }
                },
            }
            buf.push(b'\n');
            report.written += 1;
        }

        let path = self.path_for(mode, region_code, period);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("jsonl.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        Ok(report)
    }

    /// Archive files for `mode`, sorted so older periods load first.
    pub fn files(&self, mode: HarvestMode) -> anyhow::Result<Vec<PathBuf>> {
        let base = self.root.join(mode.dir_name());
        let pattern = format!(
            "{}/*/*/*.jsonl",
            glob::Pattern::escape(&base.to_string_lossy())
        );
        let mut files = Vec::new();
        for entry in glob(&pattern).with_context(|| format!("bad archive pattern {pattern}"))? {
            files.push(entry.context("reading archive directory")?);
        }
        files.sort();
        Ok(files)
    }

    /// Checkpoint unit id of an archive file: its path below the root.
    pub fn unit_id(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    pub async fn read_records(
        &self,
        mode: HarvestMode,
        path: &Path,
        config: &NormalizeConfig,
    ) -> io::Result<Vec<Result<TradeRecord, RecordError>>> {
        let text = tokio::fs::read_to_string(path).await?;
        let records = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| match mode {
                HarvestMode::Normalized => serde_json::from_str::<TradeRecord>(line)
                    .map_err(|err| RecordError::Malformed(err.to_string())),
                HarvestMode::Raw => serde_json::from_str::<RawItem>(line)
                    .map_err(|err| RecordError::Malformed(err.to_string()))
                    .and_then(|item| normalize_trade(&item, config).map_err(RecordError::from)),
            })
            .collect();
        Ok(records)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichSummary {
    pub found: u64,
    pub failed: u64,
    pub settled: u64,
    pub rows_updated: u64,
}

/// Looks up household counts per complex and writes them back to the store.
pub struct HouseholdEnricher {
    source: Arc<dyn PageSource>,
    pacer: CallPacer,
}

impl HouseholdEnricher {
    pub fn new(source: Arc<dyn PageSource>, call_delay: Duration) -> Self {
        Self {
            source,
            pacer: CallPacer::new(call_delay),
        }
    }

    pub async fn run(
        &self,
        codes: &[String],
        ledger: &mut HouseholdLedger,
        loader: &BatchLoader,
    ) -> Result<EnrichSummary, SyncError> {
        let mut summary = EnrichSummary::default();
        for code in codes {
            // Known counts are reapplied without another lookup.
            if let Some(count) = ledger.counts().get(code).copied() {
                summary.rows_updated += self.apply(loader, code, count).await?;
                summary.settled += 1;
                continue;
            }
            if ledger.is_settled(code) {
                summary.settled += 1;
                continue;
            }

            self.pacer.wait().await;
            match self.source.fetch_household_count(code).await {
                Ok(Some(count)) => {
                    summary.rows_updated += self.apply(loader, code, count).await?;
                    ledger.record(code, Some(count)).await?;
                    summary.found += 1;
                }
                Ok(None) => {
                    debug!(kapt_code = %code, "no household count upstream");
                    ledger.record(code, None).await?;
                    summary.failed += 1;
                }
                Err(err) => {
                    warn!(kapt_code = %code, error = %err, "household lookup failed");
                    ledger.record(code, None).await?;
                    summary.failed += 1;
                }
            }
        }
        info!(
            found = summary.found,
            failed = summary.failed,
            settled = summary.settled,
            "household enrichment finished"
        );
        Ok(summary)
    }

    async fn apply(&self, loader: &BatchLoader, code: &str, count: u32) -> Result<u64, SyncError> {
        loader
            .execute_with_retry(&format!("households:{code}"), &sql::household_update(code, count))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoadLimits;
    use crate::testing::{january, trade_item, ScriptedSource};
    use aptdata_core::{TargetStatus, SEOUL_DISTRICTS};
    use aptdata_storage::{BackoffPolicy, CheckpointStore, SqliteStore, Store};
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn harvester(source: Arc<ScriptedSource>, page_size: u32) -> Harvester {
        Harvester::new(source, Duration::ZERO, page_size, NormalizeConfig::default())
    }

    #[tokio::test]
    async fn pagination_stops_at_reported_total() {
        let source = Arc::new(ScriptedSource::default());
        source.put("11680", january(), (0..5).map(|n| trade_item("11680", january(), n)).collect());

        let items = harvester(source.clone(), 2)
            .fetch_target("11680", january())
            .await
            .expect("fetch");
        assert_eq!(items.len(), 5);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn fixture_pages_are_followed() {
        let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
        let source = Arc::new(aptdata_adapters::FixturePageSource::new(root));
        let harvester = Harvester::new(source, Duration::ZERO, 2, NormalizeConfig::default());
        let items = harvester.fetch_target("11680", january()).await.expect("fetch");
        assert_eq!(items.len(), 3);
    }

    #[tokio::test]
    async fn completed_targets_are_never_refetched() {
        let dir = tempdir().expect("tempdir");
        let registry_path = dir.path().join("targets.json");
        let archive = Archive::new(dir.path().join("archive"));
        let regions = &SEOUL_DISTRICTS[..2];
        let today = NaiveDate::from_ymd_opt(2024, 2, 15).expect("date");

        let source = Arc::new(ScriptedSource::default());
        for region in regions {
            source.put(region.code, january(), vec![trade_item(region.code, january(), 1)]);
        }

        let mut registry = TargetRegistry::open(&registry_path).await.expect("open");
        registry.regenerate(regions, 2024, 1, today);
        registry.save().await.expect("save");
        assert_eq!(registry.targets().len(), 4);

        let summary = harvester(source.clone(), 100)
            .run(&mut registry, HarvestMode::Normalized, &archive)
            .await
            .expect("first run");
        assert_eq!(summary.completed, 4);
        assert_eq!(summary.items, 2);
        let first_calls = source.calls();

        let mut reopened = TargetRegistry::open(&registry_path).await.expect("reopen");
        reopened.regenerate(regions, 2024, 1, today);
        let summary = harvester(source.clone(), 100)
            .run(&mut reopened, HarvestMode::Normalized, &archive)
            .await
            .expect("second run");
        assert_eq!(summary, HarvestSummary::default());
        assert_eq!(source.calls(), first_calls);
    }

    #[tokio::test]
    async fn failing_target_is_marked_and_run_continues() {
        let dir = tempdir().expect("tempdir");
        let archive = Archive::new(dir.path().join("archive"));
        let regions = &SEOUL_DISTRICTS[..3];
        let failing = regions[1].code;
        let source = Arc::new(ScriptedSource::default().failing_target(failing, january()));
        source.put(regions[2].code, january(), vec![trade_item(regions[2].code, january(), 7)]);

        let mut registry = TargetRegistry::open(dir.path().join("targets.json")).await.expect("open");
        let today = NaiveDate::from_ymd_opt(2024, 1, 20).expect("date");
        registry.regenerate(regions, 2024, 1, today);

        let summary = harvester(source, 100)
            .run(&mut registry, HarvestMode::Raw, &archive)
            .await
            .expect("run");
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.errored, 1);

        let statuses: Vec<_> = registry.targets().iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![TargetStatus::Completed, TargetStatus::Error, TargetStatus::Completed]
        );
        assert_eq!(registry.targets()[1].attempt, 1);

        let files = archive.files(HarvestMode::Raw).expect("files");
        assert_eq!(files.len(), 1);
        assert_eq!(
            archive.unit_id(&files[0]),
            format!("raw/2024/202401/{}.jsonl", regions[2].code)
        );
        let records = archive
            .read_records(HarvestMode::Raw, &files[0], &NormalizeConfig::default())
            .await
            .expect("read");
        assert_eq!(records.len(), 1);
        assert!(records[0].is_ok());
    }

    #[tokio::test]
    async fn malformed_archive_lines_are_reported_per_line() {
        let dir = tempdir().expect("tempdir");
        let archive = Archive::new(dir.path());
        let path = archive.path_for(HarvestMode::Normalized, "11680", january());
        tokio::fs::create_dir_all(path.parent().expect("parent")).await.expect("mkdir");
        tokio::fs::write(&path, "{not json}\n\n").await.expect("write");

        let records = archive
            .read_records(HarvestMode::Normalized, &path, &NormalizeConfig::default())
            .await
            .expect("read");
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], Err(RecordError::Malformed(_))));
    }

    #[tokio::test]
    async fn household_counts_update_the_store_once() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteStore::in_memory().await.expect("sqlite");
        store.execute(&sql::schema()).await.expect("schema");
        store
            .execute(
                "INSERT INTO apt_mgmt_fee (kapt_code, apt_nm, sido, sgg_nm, billing_ym, common_mgmt_total) \
                 VALUES ('A1', '개포', '서울특별시', '강남구', '202401', 3000), \
                        ('A2', '대치', '서울특별시', '강남구', '202401', 100);",
            )
            .await
            .expect("seed");
        let store: Arc<dyn Store> = Arc::new(store);

        let source = Arc::new(ScriptedSource::default().with_household("A1", 10));
        let loader = BatchLoader::new(
            store.clone(),
            CheckpointStore::ephemeral(),
            LoadLimits::default(),
            BackoffPolicy::default(),
        );
        let mut ledger = HouseholdLedger::open(dir.path()).await.expect("ledger");
        let codes = store
            .query_strings(&sql::complexes_missing_households())
            .await
            .expect("codes");
        assert_eq!(codes, vec!["A1".to_string(), "A2".to_string()]);

        let enricher = HouseholdEnricher::new(source.clone(), Duration::ZERO);
        let summary = enricher.run(&codes, &mut ledger, &loader).await.expect("enrich");
        assert_eq!(summary.found, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.rows_updated, 1);
        assert_eq!(ledger.counts().get("A1"), Some(&10));
        assert!(ledger.progress().failed.contains("A2"));

        let per_hh = store
            .query_count("SELECT common_per_hh FROM apt_mgmt_fee WHERE kapt_code = 'A1'")
            .await
            .expect("per hh");
        assert_eq!(per_hh, 300);

        let lookups = source.household_calls();
        let remaining = store
            .query_strings(&sql::complexes_missing_households())
            .await
            .expect("codes");
        enricher.run(&remaining, &mut ledger, &loader).await.expect("rerun");
        assert_eq!(source.household_calls(), lookups);
    }
}
