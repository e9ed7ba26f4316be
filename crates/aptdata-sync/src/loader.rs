//! Checkpointed, size-bounded batch loading.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use aptdata_core::ValidationError;
use aptdata_storage::sql::{insert_prefix, Loadable};
use aptdata_storage::{BackoffPolicy, CheckpointStore, RetryDisposition, Store};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::SyncError;

/// Why a record never reached a batch.
#[derive(Debug)]
pub enum RecordError {
    /// Missing key field; skipped and counted.
    Invalid(ValidationError),
    /// Unparsable source line; skipped and counted.
    Malformed(String),
    /// The source itself failed; aborts the unit.
    Read(std::io::Error),
}

impl From<ValidationError> for RecordError {
    fn from(err: ValidationError) -> Self {
        RecordError::Invalid(err)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadTally {
    pub inserted: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl LoadTally {
    pub fn absorb(&mut self, other: LoadTally) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

impl fmt::Display for LoadTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inserted={} skipped={} failed={}",
            self.inserted, self.skipped, self.failed
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoadLimits {
    pub batch_rows: usize,
    /// Statements must stay strictly below this many bytes.
    pub max_statement_bytes: usize,
}

impl Default for LoadLimits {
    fn default() -> Self {
        Self {
            batch_rows: 200,
            max_statement_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    AlreadyComplete,
    Loaded(LoadTally),
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Added,
    /// Batch is at capacity; flush and push the tuple again.
    Full(String),
    /// The tuple alone would exceed the statement ceiling.
    TooLarge(String),
}

/// Accumulates value tuples for one multi-row insert.
#[derive(Debug)]
pub struct StatementBuilder {
    prefix: String,
    tuples: Vec<String>,
    bytes: usize,
    limits: LoadLimits,
}

impl StatementBuilder {
    pub fn new(prefix: String, limits: LoadLimits) -> Self {
        Self {
            prefix,
            tuples: Vec::new(),
            bytes: 0,
            limits,
        }
    }

    pub fn for_records<R: Loadable>(limits: LoadLimits) -> Self {
        Self::new(insert_prefix::<R>(), limits)
    }

    fn statement_len(&self, extra: usize) -> usize {
        // prefix + tuples joined by ',' + ';'
        self.prefix.len() + self.bytes + extra + 1
    }

    pub fn push(&mut self, tuple: String) -> PushOutcome {
        if self.prefix.len() + tuple.len() + 1 >= self.limits.max_statement_bytes {
            return PushOutcome::TooLarge(tuple);
        }
        let separator = usize::from(!self.tuples.is_empty());
        if self.tuples.len() >= self.limits.batch_rows.max(1)
            || self.statement_len(tuple.len() + separator) >= self.limits.max_statement_bytes
        {
            return PushOutcome::Full(tuple);
        }
        self.bytes += tuple.len() + separator;
        self.tuples.push(tuple);
        PushOutcome::Added
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Drain the pending tuples into one statement and its row count.
    pub fn take(&mut self) -> Option<(String, usize)> {
        if self.tuples.is_empty() {
            return None;
        }
        let rows = self.tuples.len();
        let statement = format!("{}{};", self.prefix, self.tuples.join(","));
        self.tuples.clear();
        self.bytes = 0;
        Some((statement, rows))
    }
}

/// Groups records into bounded insert statements, retries failed batches and
/// records each unit in the checkpoint once all of its batches succeeded.
pub struct BatchLoader {
    store: Arc<dyn Store>,
    checkpoint: CheckpointStore,
    limits: LoadLimits,
    backoff: BackoffPolicy,
    tally: LoadTally,
}

impl BatchLoader {
    pub fn new(
        store: Arc<dyn Store>,
        checkpoint: CheckpointStore,
        limits: LoadLimits,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            checkpoint,
            limits,
            backoff,
            tally: LoadTally::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    pub fn tally(&self) -> LoadTally {
        self.tally
    }

    pub fn is_complete(&self, unit: &str) -> bool {
        self.checkpoint.is_complete(unit)
    }

    /// Run one statement with the loader's retry policy.
    pub async fn execute_with_retry(&self, label: &str, sql: &str) -> Result<u64, SyncError> {
        let mut attempt = 1;
        loop {
            match self.store.execute(sql).await {
                Ok(affected) => return Ok(affected),
                Err(err) => {
                    if err.disposition() == RetryDisposition::Retryable
                        && self.backoff.allows_retry_after(attempt)
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(
                            label,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "statement failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    error!(label, attempt, error = %err, "statement failed, giving up");
                    return Err(SyncError::RetriesExhausted {
                        unit: label.to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    async fn flush(
        &self,
        unit: &str,
        builder: &mut StatementBuilder,
        batch_no: &mut usize,
        tally: &mut LoadTally,
    ) -> Result<(), SyncError> {
        let Some((statement, rows)) = builder.take() else {
            return Ok(());
        };
        *batch_no += 1;
        let label = format!("{unit}#{batch_no}");
        match self.execute_with_retry(&label, &statement).await {
            Ok(affected) => {
                let affected = affected.min(rows as u64);
                tally.inserted += affected;
                tally.skipped += rows as u64 - affected;
                debug!(batch = *batch_no, rows, inserted = affected, bytes = statement.len(), "batch applied");
                Ok(())
            }
            Err(err) => {
                tally.failed += rows as u64;
                Err(err)
            }
        }
    }

    /// Load one source unit. Completed units are skipped without touching
    /// `records`; duplicate natural keys within the unit are skipped.
    pub async fn load_unit<R, I>(&mut self, unit: &str, records: I) -> Result<UnitOutcome, SyncError>
    where
        R: Loadable,
        I: IntoIterator<Item = Result<R, RecordError>>,
    {
        if self.checkpoint.is_complete(unit) {
            info!(unit, "unit already complete, skipping");
            return Ok(UnitOutcome::AlreadyComplete);
        }

        let span = info_span!("load_unit", unit);
        let result = self.load_records(unit, records).instrument(span).await;
        match result {
            Ok(tally) => {
                self.checkpoint.mark_complete(unit, tally.inserted).await?;
                self.tally.absorb(tally);
                info!(unit, %tally, total_rows = self.checkpoint.total_rows(), "unit complete");
                Ok(UnitOutcome::Loaded(tally))
            }
            Err((tally, err)) => {
                self.tally.absorb(tally);
                Err(err)
            }
        }
    }

    async fn load_records<R, I>(&self, unit: &str, records: I) -> Result<LoadTally, (LoadTally, SyncError)>
    where
        R: Loadable,
        I: IntoIterator<Item = Result<R, RecordError>>,
    {
        let mut tally = LoadTally::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut builder = StatementBuilder::for_records::<R>(self.limits);
        let mut batch_no = 0;

        for record in records {
            let record = match record {
                Ok(record) => record,
                Err(RecordError::Read(err)) => return Err((tally, SyncError::Source(err))),
                Err(RecordError::Invalid(err)) => {
                    debug!(error = %err, "record rejected");
                    tally.skipped += 1;
                    continue;
                }
                Err(RecordError::Malformed(reason)) => {
                    debug!(%reason, "malformed record");
                    tally.skipped += 1;
                    continue;
                }
            };

            if !seen.insert(record.natural_key()) {
                tally.skipped += 1;
                continue;
            }

            let tuple = match builder.push(record.sql_values()) {
                PushOutcome::Added => continue,
                PushOutcome::TooLarge(tuple) => {
                    warn!(bytes = tuple.len(), "record exceeds the statement ceiling on its own");
                    tally.failed += 1;
                    continue;
                }
                PushOutcome::Full(tuple) => tuple,
            };

            if let Err(err) = self.flush(unit, &mut builder, &mut batch_no, &mut tally).await {
                return Err((tally, err));
            }
            // The builder is empty and the tuple passed the size check above.
            if let PushOutcome::TooLarge(_) | PushOutcome::Full(_) = builder.push(tuple) {
                tally.failed += 1;
            }
        }

        if let Err(err) = self.flush(unit, &mut builder, &mut batch_no, &mut tally).await {
            return Err((tally, err));
        }
        Ok(tally)
    }
}
