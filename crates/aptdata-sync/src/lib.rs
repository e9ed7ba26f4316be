//! Pipeline orchestration: sheet and archive loads, harvests, window sync.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aptdata_adapters::api::{DEFAULT_BASE_URL, MAX_PAGE_SIZE};
use aptdata_adapters::sheet::HEADER_ROWS;
use aptdata_adapters::{ApiError, FixturePageSource, PageSource, PublicDataClient, ReaderOptions, RowFilter, SheetPackage};
use aptdata_core::normalize::{normalize_fee_row, MgmtFeeColumns, NormalizeConfig};
use aptdata_core::{Period, SEOUL_DISTRICTS};
use aptdata_storage::{
    read_household_counts, sql, BackoffPolicy, CheckpointStore, D1Config, D1Store, DryRunStore,
    HouseholdLedger, HttpClientConfig, HttpFetcher, RegistrySummary, SqliteStore, StateError, Store,
    StoreError, TargetRegistry,
};
use chrono::Local;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod harvest;
pub mod loader;
pub mod window;

pub use harvest::{Archive, EnrichSummary, HarvestMode, HarvestSummary, Harvester, HouseholdEnricher};
pub use loader::{BatchLoader, LoadLimits, LoadTally, RecordError, UnitOutcome};
pub use window::{window_periods, PeriodReport, PeriodState, WindowSynchronizer, MAX_WINDOW};

pub const CRATE_NAME: &str = "aptdata-sync";

/// Failures that end a run. Everything recoverable is counted instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Checkpoint(#[from] StateError),
    #[error("missing required credential {0}")]
    MissingCredential(&'static str),
    #[error("{unit}: store rejected the statement after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        unit: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("period {period} failed while {stage}: {source}")]
    PeriodFailed {
        period: Period,
        stage: PeriodState,
        #[source]
        source: Box<SyncError>,
    },
    #[error("reading source: {0}")]
    Source(#[from] std::io::Error),
    #[error(transparent)]
    Api(#[from] ApiError),
}

const API_KEY_VAR: &str = "DATA_GO_KR_API_KEY";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    /// Live store; selected only when every credential is present.
    pub d1: Option<D1Config>,
    pub api_key: Option<String>,
    pub api_base_url: String,
    pub fixtures_dir: Option<PathBuf>,
    pub page_size: u32,
    pub call_delay: Duration,
    pub batch_rows: usize,
    pub max_statement_bytes: usize,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub update_months: usize,
    pub normalize: NormalizeConfig,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_present(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let max_statement_bytes = env_or("APTDATA_MAX_STATEMENT_BYTES", 100_000);
        let http_timeout_secs = env_or("APTDATA_HTTP_TIMEOUT_SECS", 20);
        let d1 = match (
            env_present("CLOUDFLARE_ACCOUNT_ID"),
            env_present("CLOUDFLARE_API_TOKEN"),
            env_present("D1_DATABASE_ID"),
        ) {
            (Some(account_id), Some(api_token), Some(database_id)) => Some(D1Config {
                account_id,
                database_id,
                api_token,
                max_statement_bytes,
                timeout: Duration::from_secs(http_timeout_secs),
            }),
            _ => None,
        };

        Self {
            database_url: env_string("DATABASE_URL", "sqlite://aptdata.db?mode=rwc"),
            d1,
            api_key: env_present(API_KEY_VAR),
            api_base_url: env_string("APTDATA_API_BASE_URL", DEFAULT_BASE_URL),
            fixtures_dir: env_present("APTDATA_FIXTURES_DIR").map(PathBuf::from),
            page_size: env_or("APTDATA_PAGE_SIZE", MAX_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
            call_delay: Duration::from_millis(env_or("APTDATA_CALL_DELAY_MS", 300)),
            batch_rows: env_or("APTDATA_BATCH_SIZE", 200),
            max_statement_bytes,
            max_attempts: env_or("APTDATA_MAX_ATTEMPTS", 3),
            retry_base: Duration::from_millis(env_or("APTDATA_RETRY_BASE_MS", 5_000)),
            state_dir: PathBuf::from(env_string("APTDATA_STATE_DIR", "./state")),
            data_dir: PathBuf::from(env_string("APTDATA_DATA_DIR", "./raw-data")),
            update_months: env_or("UPDATE_MONTHS", 3usize).clamp(1, MAX_WINDOW),
            normalize: NormalizeConfig {
                price_precision: env_or("APTDATA_PRICE_PRECISION", 1),
                region_prefix: env_string("APTDATA_REGION_PREFIX", "서울"),
            },
            http_timeout_secs,
            user_agent: env_string("APTDATA_USER_AGENT", "aptdata-bot/0.1"),
            scheduler_enabled: std::env::var("APTDATA_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: env_string("SYNC_CRON", "0 0 4 * * *"),
        }
    }

    pub fn limits(&self) -> LoadLimits {
        LoadLimits {
            batch_rows: self.batch_rows.max(1),
            max_statement_bytes: self.max_statement_bytes,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: self.retry_base,
            max_delay: (self.retry_base * 12).max(Duration::from_secs(1)),
        }
    }
}

/// Select the store once: D1 when configured, SQLite otherwise, wrapped for
/// dry runs. A dry run opens SQLite read-only and never creates the file.
pub async fn connect_store(config: &SyncConfig, dry_run: bool) -> Result<Arc<dyn Store>> {
    if let Some(d1) = &config.d1 {
        let live: Arc<dyn Store> = Arc::new(D1Store::new(d1.clone()).context("building D1 client")?);
        info!(store = live.name(), dry_run, "store selected");
        return Ok(if dry_run {
            Arc::new(DryRunStore::new(Some(live)))
        } else {
            live
        });
    }

    if !dry_run {
        let live = SqliteStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening {}", config.database_url))?;
        info!(store = live.name(), dry_run, "store selected");
        return Ok(Arc::new(live));
    }

    let inner: Option<Arc<dyn Store>> = match SqliteStore::connect_read_only(&config.database_url).await {
        Ok(store) => Some(Arc::new(store)),
        Err(err) => {
            warn!(url = %config.database_url, error = %err, "no readable database; dry run continues without one");
            None
        }
    };
    info!(store = "sqlite", dry_run, "store selected");
    Ok(Arc::new(DryRunStore::new(inner)))
}

pub struct Pipeline {
    config: SyncConfig,
    store: Arc<dyn Store>,
    dry_run: bool,
    run_id: Uuid,
}

impl Pipeline {
    pub async fn new(config: SyncConfig, dry_run: bool) -> Result<Self> {
        let store = connect_store(&config, dry_run).await?;
        Ok(Self::with_store(config, store, dry_run))
    }

    pub fn with_store(config: SyncConfig, store: Arc<dyn Store>, dry_run: bool) -> Self {
        let run_id = Uuid::new_v4();
        info!(%run_id, store = store.name(), dry_run, "pipeline ready");
        Self {
            config,
            store,
            dry_run,
            run_id,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    async fn checkpoint(&self, file: &str) -> Result<CheckpointStore, SyncError> {
        if self.dry_run {
            return Ok(CheckpointStore::ephemeral());
        }
        Ok(CheckpointStore::open(self.config.state_dir.join(file)).await?)
    }

    fn loader(&self, checkpoint: CheckpointStore) -> BatchLoader {
        BatchLoader::new(
            self.store.clone(),
            checkpoint,
            self.config.limits(),
            self.config.backoff(),
        )
    }

    fn page_source(&self) -> Result<Arc<dyn PageSource>> {
        if let Some(dir) = &self.config.fixtures_dir {
            info!(dir = %dir.display(), "serving pages from fixtures");
            return Ok(Arc::new(FixturePageSource::new(dir.clone())));
        }
        let key = self
            .config
            .api_key
            .clone()
            .ok_or(SyncError::MissingCredential(API_KEY_VAR))?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.config.http_timeout_secs),
            user_agent: Some(self.config.user_agent.clone()),
            ..HttpClientConfig::default()
        })?;
        Ok(Arc::new(PublicDataClient::new(
            http,
            self.config.api_base_url.clone(),
            key,
        )))
    }

    fn harvester(&self) -> Result<Harvester> {
        Ok(Harvester::new(
            self.page_source()?,
            self.config.call_delay,
            self.config.page_size,
            self.config.normalize.clone(),
        ))
    }

    pub async fn migrate(&self) -> Result<()> {
        self.loader(CheckpointStore::ephemeral())
            .execute_with_retry("migrate", &sql::schema())
            .await?;
        info!("schema ready");
        Ok(())
    }

    /// Stream one worksheet part into the fee table as a single load unit.
    pub async fn load_sheet(&self, path: &Path, part: &str, households: Option<&Path>) -> Result<LoadTally> {
        let counts: Option<BTreeMap<String, u32>> = match households {
            Some(file) => Some(read_household_counts(file).await?),
            None => None,
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let unit = format!("sheet:{file_name}:{part}");

        let mut loader = self.loader(self.checkpoint("load-checkpoint.json").await?);
        let mut package = SheetPackage::open(path)?;
        let options = ReaderOptions {
            header_rows: HEADER_ROWS,
            filter: Some(RowFilter::leading(self.config.normalize.region_prefix.clone())),
        };
        let mut rows = package.rows(part, options)?;
        let columns = MgmtFeeColumns::default();
        let records = rows.by_ref().map(|row| match row {
            Ok(source) => normalize_fee_row(&source.row, &columns, counts.as_ref()).map_err(RecordError::from),
            Err(err) => Err(RecordError::Read(err)),
        });
        loader.load_unit(&unit, records).await?;

        let stats = rows.stats();
        info!(
            unit = %unit,
            rows_seen = stats.rows_seen,
            filtered = stats.filtered,
            emitted = stats.emitted,
            malformed_cells = stats.malformed_cells,
            malformed_rows = stats.malformed_rows,
            "sheet streamed"
        );
        Ok(loader.tally())
    }

    pub async fn init_targets(&self, start_year: i32, years: u32) -> Result<RegistrySummary> {
        let mut registry = TargetRegistry::open(self.config.state_dir.join("targets.json")).await?;
        let total = registry.regenerate(&SEOUL_DISTRICTS, start_year, years, Local::now().date_naive());
        registry.save().await?;
        let summary = registry.summary();
        info!(total, pending = summary.pending, completed = summary.completed, "targets generated");
        Ok(summary)
    }

    pub async fn harvest(&self, mode: HarvestMode) -> Result<HarvestSummary> {
        let harvester = self.harvester()?;
        let mut registry = TargetRegistry::open(self.config.state_dir.join("targets.json")).await?;
        if registry.targets().is_empty() {
            warn!(path = %registry.path().display(), "no targets registered; run init-targets first");
        }
        let archive = Archive::new(self.config.data_dir.clone());
        Ok(harvester.run(&mut registry, mode, &archive).await?)
    }

    /// Load every archive file of `mode`; each file is one checkpointed unit.
    pub async fn load_archive(&self, mode: HarvestMode) -> Result<LoadTally> {
        let archive = Archive::new(self.config.data_dir.clone());
        let mut loader = self.loader(self.checkpoint("archive-checkpoint.json").await?);
        let files = archive.files(mode)?;
        info!(files = files.len(), root = %archive.root().display(), "loading archive");

        for path in files {
            let unit = archive.unit_id(&path);
            if loader.is_complete(&unit) {
                continue;
            }
            let records = archive
                .read_records(mode, &path, &self.config.normalize)
                .await
                .map_err(SyncError::from)?;
            loader.load_unit(&unit, records).await?;
        }
        Ok(loader.tally())
    }

    pub async fn sync_window(&self, months: usize) -> Result<Vec<PeriodReport>> {
        let today = Local::now().date_naive();
        let periods = window_periods(today, months);
        let synchronizer = WindowSynchronizer::new(
            self.harvester()?,
            SEOUL_DISTRICTS.to_vec(),
            today.format("%Y%m%d").to_string(),
        );
        let mut loader = self.loader(self.checkpoint("window-checkpoint.json").await?);
        Ok(synchronizer.run(&mut loader, &periods).await?)
    }

    pub async fn harvest_households(&self) -> Result<EnrichSummary> {
        let codes = self
            .store
            .query_strings(&sql::complexes_missing_households())
            .await
            .context("listing complexes without household counts")?;
        info!(complexes = codes.len(), "household lookup starting");

        let enricher = HouseholdEnricher::new(self.page_source()?, self.config.call_delay);
        let mut ledger = HouseholdLedger::open(&self.config.state_dir).await?;
        let loader = self.loader(CheckpointStore::ephemeral());
        Ok(enricher.run(&codes, &mut ledger, &loader).await?)
    }

    /// Cron job running the window sync; `None` unless enabled by config or `force`.
    pub async fn maybe_build_scheduler(self: Arc<Self>, force: bool) -> Result<Option<JobScheduler>> {
        if !(force || self.config.scheduler_enabled) {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let months = self.config.update_months;
        let pipeline = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.sync_window(months).await {
                    Ok(reports) => info!(periods = reports.len(), "scheduled window sync finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled window sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(root: &Path) -> SyncConfig {
        SyncConfig {
            database_url: "sqlite::memory:".to_string(),
            d1: None,
            api_key: None,
            api_base_url: DEFAULT_BASE_URL.to_string(),
            fixtures_dir: None,
            page_size: 2,
            call_delay: Duration::ZERO,
            batch_rows: 50,
            max_statement_bytes: 100_000,
            max_attempts: 1,
            retry_base: Duration::from_millis(1),
            state_dir: root.join("state"),
            data_dir: root.join("raw-data"),
            update_months: 1,
            normalize: NormalizeConfig::default(),
            http_timeout_secs: 5,
            user_agent: "aptdata-test".to_string(),
            scheduler_enabled: false,
            sync_cron: "0 0 4 * * *".to_string(),
        }
    }

    async fn sqlite_pipeline(config: SyncConfig) -> Pipeline {
        let store = SqliteStore::in_memory().await.expect("sqlite");
        Pipeline::with_store(config, Arc::new(store), false)
    }

    #[tokio::test]
    async fn live_harvest_requires_the_api_key() {
        let dir = tempdir().expect("tempdir");
        let pipeline = sqlite_pipeline(test_config(dir.path())).await;
        let err = pipeline.harvest(HarvestMode::Raw).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::MissingCredential(API_KEY_VAR))
        ));
    }

    #[tokio::test]
    async fn fixture_archive_round_trips_into_the_store() {
        let dir = tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        config.fixtures_dir = Some(Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures"));
        let pipeline = sqlite_pipeline(config).await;
        pipeline.migrate().await.expect("migrate");

        // Only one region and month is registered by hand.
        let registry_path = dir.path().join("state/targets.json");
        let mut registry = TargetRegistry::open(&registry_path).await.expect("registry");
        let gangnam: Vec<_> = SEOUL_DISTRICTS.iter().copied().filter(|r| r.code == "11680").collect();
        registry.regenerate(&gangnam, 2024, 1, chrono::NaiveDate::from_ymd_opt(2024, 1, 31).expect("date"));
        registry.save().await.expect("save");

        let summary = pipeline.harvest(HarvestMode::Raw).await.expect("harvest");
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.items, 3);

        let tally = pipeline.load_archive(HarvestMode::Raw).await.expect("load");
        assert_eq!(tally, LoadTally { inserted: 3, skipped: 0, failed: 0 });

        let again = pipeline.load_archive(HarvestMode::Raw).await.expect("reload");
        assert_eq!(again, LoadTally::default());
    }

    #[tokio::test]
    async fn targets_harvested_after_a_load_are_picked_up_by_the_next_load() {
        let dir = tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        config.fixtures_dir = Some(Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures"));
        let pipeline = sqlite_pipeline(config).await;
        pipeline.migrate().await.expect("migrate");

        let today = chrono::NaiveDate::from_ymd_opt(2024, 1, 31).expect("date");
        let january = Period::new(2024, 1).expect("period");
        let pick = |codes: &[&str]| -> Vec<_> {
            SEOUL_DISTRICTS
                .iter()
                .copied()
                .filter(|r| codes.contains(&r.code))
                .collect()
        };
        let registry_path = dir.path().join("state/targets.json");

        // 11140 answers with an upstream error and stays errored.
        let mut registry = TargetRegistry::open(&registry_path).await.expect("registry");
        registry.regenerate(&pick(&["11110", "11140"]), 2024, 1, today);
        registry.save().await.expect("save");
        let summary = pipeline.harvest(HarvestMode::Raw).await.expect("harvest");
        assert_eq!((summary.completed, summary.errored), (1, 1));
        let first = pipeline.load_archive(HarvestMode::Raw).await.expect("load");
        assert_eq!(first.inserted, 1);

        let mut registry = TargetRegistry::open(&registry_path).await.expect("registry");
        registry.regenerate(&pick(&["11680"]), 2024, 1, today);
        registry.save().await.expect("save");
        let summary = pipeline.harvest(HarvestMode::Raw).await.expect("harvest");
        assert_eq!((summary.completed, summary.items), (1, 3));

        let second = pipeline.load_archive(HarvestMode::Raw).await.expect("reload");
        assert_eq!(second.inserted, 3);
        let stored = pipeline
            .store
            .query_count(&sql::count_trades_for_period(january))
            .await
            .expect("count");
        assert_eq!(stored, 4);
    }

    #[tokio::test]
    async fn dry_run_does_not_create_the_database_file() {
        let dir = tempdir().expect("tempdir");
        let db = dir.path().join("aptdata.db");
        let mut config = test_config(dir.path());
        config.database_url = format!("sqlite://{}?mode=rwc", db.display());

        let pipeline = Pipeline::new(config, true).await.expect("dry pipeline");
        pipeline.migrate().await.expect("dry migrate");
        assert!(!db.exists());
    }

    #[test]
    fn config_derives_limits_and_backoff() {
        let config = test_config(Path::new("/tmp"));
        assert_eq!(config.limits().batch_rows, 50);
        let backoff = config.backoff();
        assert_eq!(backoff.max_attempts, 1);
        assert!(!backoff.allows_retry_after(1));
    }
}
