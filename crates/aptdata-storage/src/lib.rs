//! Persisted progress state, store backends and HTTP utilities.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use aptdata_core::{HarvestTarget, Period, Region, TargetStatus};
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub mod sql;
mod store;

pub use store::{D1Config, D1Store, DryRunStore, SqliteStore, Store, StoreError};

pub const CRATE_NAME: &str = "aptdata-storage";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {} is not valid JSON: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StateError + '_ {
    move |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read a JSON state file; a missing file yields `T::default()`.
pub async fn read_json_or_default<T>(path: &Path) -> Result<T, StateError>
where
    T: DeserializeOwned + Default,
{
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StateError::Corrupt {
            path: path.to_path_buf(),
            source,
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(io_error(path)(err)),
    }
}

/// Replace a JSON state file via temp-file + rename so readers never see a torn write.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StateError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await.map_err(io_error(&parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_error(&temp_path))?;
    file.write_all(&bytes).await.map_err(io_error(&temp_path))?;
    file.sync_all().await.map_err(io_error(&temp_path))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_error(path)(err));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadCheckpoint {
    #[serde(default)]
    pub completed_units: BTreeSet<String>,
    #[serde(default)]
    pub total_rows: u64,
}

/// Load checkpoint read once at startup and rewritten after every completed unit.
#[derive(Debug)]
pub struct CheckpointStore {
    path: Option<PathBuf>,
    state: LoadCheckpoint,
}

impl CheckpointStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let state = read_json_or_default(&path).await?;
        Ok(Self {
            path: Some(path),
            state,
        })
    }

    /// In-memory only; nothing is written (dry runs).
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            state: LoadCheckpoint::default(),
        }
    }

    pub fn is_complete(&self, unit: &str) -> bool {
        self.state.completed_units.contains(unit)
    }

    pub fn total_rows(&self) -> u64 {
        self.state.total_rows
    }

    pub fn completed_units(&self) -> usize {
        self.state.completed_units.len()
    }

    pub async fn mark_complete(&mut self, unit: &str, rows: u64) -> Result<(), StateError> {
        if !self.state.completed_units.insert(unit.to_string()) {
            return Ok(());
        }
        self.state.total_rows += rows;
        match &self.path {
            Some(path) => write_json_atomic(path, &self.state).await,
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    pub pending: usize,
    pub completed: usize,
    pub error: usize,
}

/// Harvest targets persisted as a JSON array, rewritten after each outcome.
#[derive(Debug)]
pub struct TargetRegistry {
    path: PathBuf,
    targets: Vec<HarvestTarget>,
}

impl TargetRegistry {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let targets = read_json_or_default(&path).await?;
        Ok(Self { path, targets })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn targets(&self) -> &[HarvestTarget] {
        &self.targets
    }

    /// Add the region x month key space from January of `start_year` through
    /// `years` years, never past the month of `today`. Existing targets are
    /// kept as they are, including ones outside the range; only missing keys
    /// are added as pending.
    pub fn regenerate(
        &mut self,
        regions: &[Region],
        start_year: i32,
        years: u32,
        today: NaiveDate,
    ) -> usize {
        let Some(start) = Period::new(start_year, 1) else {
            return self.targets.len();
        };
        let last = start.shift(years as i32 * 12 - 1).min(Period::from_date(today));

        let known: BTreeSet<(String, Period)> = self.targets.iter().map(HarvestTarget::key).collect();
        for period in Period::range(start, last) {
            for region in regions {
                if !known.contains(&(region.code.to_string(), period)) {
                    self.targets.push(HarvestTarget::pending(region, period));
                }
            }
        }
        self.targets
            .sort_by(|a, b| (a.period, &a.region_code).cmp(&(b.period, &b.region_code)));
        self.targets.len()
    }

    pub fn pending_positions(&self) -> Vec<usize> {
        self.targets
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_pending())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn target(&self, position: usize) -> Option<&HarvestTarget> {
        self.targets.get(position)
    }

    pub async fn record_completed(&mut self, position: usize, count: u64) -> Result<(), StateError> {
        if let Some(target) = self.targets.get_mut(position) {
            target.attempt += 1;
            target.mark_completed(count);
        }
        self.save().await
    }

    pub async fn record_error(&mut self, position: usize) -> Result<(), StateError> {
        if let Some(target) = self.targets.get_mut(position) {
            target.attempt += 1;
            target.mark_error();
        }
        self.save().await
    }

    pub fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary::default();
        for target in &self.targets {
            match target.status {
                TargetStatus::Pending => summary.pending += 1,
                TargetStatus::Completed => summary.completed += 1,
                TargetStatus::Error => summary.error += 1,
            }
        }
        summary
    }

    pub async fn save(&self) -> Result<(), StateError> {
        write_json_atomic(&self.path, &self.targets).await
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HouseholdProgress {
    #[serde(default)]
    pub done: BTreeSet<String>,
    #[serde(default)]
    pub failed: BTreeSet<String>,
}

/// Household counts per complex plus lookup progress, kept in two files.
#[derive(Debug)]
pub struct HouseholdLedger {
    counts_path: PathBuf,
    progress_path: PathBuf,
    counts: BTreeMap<String, u32>,
    progress: HouseholdProgress,
}

impl HouseholdLedger {
    pub const COUNTS_FILE: &'static str = "households.json";
    pub const PROGRESS_FILE: &'static str = "households-progress.json";

    pub async fn open(state_dir: &Path) -> Result<Self, StateError> {
        let counts_path = state_dir.join(Self::COUNTS_FILE);
        let progress_path = state_dir.join(Self::PROGRESS_FILE);
        Ok(Self {
            counts: read_json_or_default(&counts_path).await?,
            progress: read_json_or_default(&progress_path).await?,
            counts_path,
            progress_path,
        })
    }

    pub fn counts(&self) -> &BTreeMap<String, u32> {
        &self.counts
    }

    pub fn progress(&self) -> &HouseholdProgress {
        &self.progress
    }

    pub fn is_settled(&self, code: &str) -> bool {
        self.progress.done.contains(code) || self.progress.failed.contains(code)
    }

    pub async fn record(&mut self, code: &str, count: Option<u32>) -> Result<(), StateError> {
        match count {
            Some(count) => {
                self.counts.insert(code.to_string(), count);
                self.progress.done.insert(code.to_string());
                write_json_atomic(&self.counts_path, &self.counts).await?;
            }
            None => {
                self.progress.failed.insert(code.to_string());
            }
        }
        write_json_atomic(&self.progress_path, &self.progress).await
    }
}

/// Read a household count map written by [`HouseholdLedger`].
pub async fn read_household_counts(path: &Path) -> Result<BTreeMap<String, u32>, StateError> {
    match fs::try_exists(path).await {
        Ok(true) => read_json_or_default(path).await,
        Ok(false) => Err(StateError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "household file not found"),
        }),
        Err(err) => Err(io_error(path)(err)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded retry schedule: attempt `n` (1-based) waits `base_delay * n`, capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.max(1)).min(self.max_delay)
    }

    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Enforces a minimum gap between consecutive upstream calls.
#[derive(Debug)]
pub struct CallPacer {
    interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl CallPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_call: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn wait(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {path}")]
    HttpStatus { status: u16, path: String },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// GET with transport-level retries. Only the URL path is logged; query
    /// strings carry credentials.
    pub async fn fetch_bytes(&self, label: &str, url: reqwest::Url) -> Result<FetchedResponse, FetchError> {
        let path = url.path().to_string();
        let span = info_span!("http_fetch", label, path = %path);

        async move {
            let mut attempt = 1;
            loop {
                match self.client.get(url.clone()).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse { status, body });
                        }
                        if classify_status(status) == RetryDisposition::Retryable
                            && self.backoff.allows_retry_after(attempt)
                        {
                            warn!(attempt, status = status.as_u16(), "retrying upstream call");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            path: path.clone(),
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && self.backoff.allows_retry_after(attempt)
                        {
                            warn!(attempt, error = %err, "retrying upstream call");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}
