use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, info};

use crate::RetryDisposition;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store rejected statement (status {status}): {message}")]
    Remote { status: u16, message: String },
    #[error("statement is {bytes} bytes, over the {limit} byte ceiling")]
    Oversize { bytes: usize, limit: usize },
    #[error("unexpected store response: {0}")]
    Decode(String),
}

impl StoreError {
    /// Oversize and malformed responses fail the same way on every attempt.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Oversize { .. } | StoreError::Decode(_) => RetryDisposition::NonRetryable,
            _ => RetryDisposition::Retryable,
        }
    }
}

/// Whole-statement write interface shared by every backend.
#[async_trait]
pub trait Store: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one statement (or script); returns rows affected.
    async fn execute(&self, sql: &str) -> Result<u64, StoreError>;

    /// First column of the first row as an integer.
    async fn query_count(&self, sql: &str) -> Result<i64, StoreError>;

    /// First column of every row as text.
    async fn query_strings(&self, sql: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with(SqliteConnectOptions::from_str(url)?.create_if_missing(true)).await
    }

    /// Opens an existing database without write access; a missing file is an
    /// error rather than created.
    pub async fn connect_read_only(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(false)
            .read_only(true);
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        // One connection: the store takes a single in-flight statement, and an
        // in-memory database lives exactly as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn execute(&self, sql: &str) -> Result<u64, StoreError> {
        let result = sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn query_count(&self, sql: &str) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar::<_, i64>(sql).fetch_one(&self.pool).await?)
    }

    async fn query_strings(&self, sql: &str) -> Result<Vec<String>, StoreError> {
        Ok(sqlx::query_scalar::<_, String>(sql)
            .fetch_all(&self.pool)
            .await?)
    }
}

#[derive(Debug, Clone)]
pub struct D1Config {
    pub account_id: String,
    pub database_id: String,
    pub api_token: String,
    pub max_statement_bytes: usize,
    pub timeout: Duration,
}

/// Cloudflare D1 over its HTTP query endpoint.
#[derive(Debug, Clone)]
pub struct D1Store {
    client: reqwest::Client,
    endpoint: String,
    api_token: String,
    max_statement_bytes: usize,
}

#[derive(Debug, Deserialize)]
struct D1Response {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<D1Message>,
    #[serde(default)]
    result: Vec<D1Result>,
}

#[derive(Debug, Deserialize)]
struct D1Message {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct D1Result {
    #[serde(default)]
    results: Vec<serde_json::Map<String, Value>>,
    #[serde(default)]
    meta: D1Meta,
}

#[derive(Debug, Default, Deserialize)]
struct D1Meta {
    #[serde(default)]
    changes: u64,
}

impl D1Store {
    pub fn new(config: D1Config) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!(
                "https://api.cloudflare.com/client/v4/accounts/{}/d1/database/{}/query",
                config.account_id, config.database_id
            ),
            api_token: config.api_token,
            max_statement_bytes: config.max_statement_bytes,
        })
    }

    async fn query(&self, sql: &str) -> Result<Vec<D1Result>, StoreError> {
        if sql.len() > self.max_statement_bytes {
            return Err(StoreError::Oversize {
                bytes: sql.len(),
                limit: self.max_statement_bytes,
            });
        }

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({ "sql": sql }))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;

        let parsed: D1Response = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(StoreError::Remote {
                    status: status.as_u16(),
                    message: truncate(&text, 200).to_string(),
                })
            }
            Err(err) => return Err(StoreError::Decode(err.to_string())),
        };

        if !status.is_success() || !parsed.success {
            let message = parsed
                .errors
                .iter()
                .map(|e| format!("[{}] {}", e.code, e.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(StoreError::Remote {
                status: status.as_u16(),
                message,
            });
        }
        Ok(parsed.result)
    }
}

fn first_column(row: &serde_json::Map<String, Value>) -> Option<&Value> {
    row.values().next()
}

#[async_trait]
impl Store for D1Store {
    fn name(&self) -> &'static str {
        "d1"
    }

    async fn execute(&self, sql: &str) -> Result<u64, StoreError> {
        let results = self.query(sql).await?;
        Ok(results.iter().map(|r| r.meta.changes).sum())
    }

    async fn query_count(&self, sql: &str) -> Result<i64, StoreError> {
        let results = self.query(sql).await?;
        results
            .first()
            .and_then(|r| r.results.first())
            .and_then(first_column)
            .and_then(Value::as_i64)
            .ok_or_else(|| StoreError::Decode("count query returned no integer".to_string()))
    }

    async fn query_strings(&self, sql: &str) -> Result<Vec<String>, StoreError> {
        let results = self.query(sql).await?;
        Ok(results
            .first()
            .map(|r| {
                r.results
                    .iter()
                    .filter_map(first_column)
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s.clone()),
                        Value::Null => None,
                        other => Some(other.to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Logs writes instead of executing them; reads go to the wrapped store when present.
#[derive(Clone, Default)]
pub struct DryRunStore {
    inner: Option<Arc<dyn Store>>,
}

impl DryRunStore {
    pub fn new(inner: Option<Arc<dyn Store>>) -> Self {
        Self { inner }
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl Store for DryRunStore {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    async fn execute(&self, sql: &str) -> Result<u64, StoreError> {
        info!(bytes = sql.len(), preview = truncate(sql, 120), "[dry-run] statement skipped");
        Ok(0)
    }

    async fn query_count(&self, sql: &str) -> Result<i64, StoreError> {
        match &self.inner {
            Some(inner) => inner.query_count(sql).await,
            None => {
                debug!("[dry-run] no backing store, count reported as 0");
                Ok(0)
            }
        }
    }

    async fn query_strings(&self, sql: &str) -> Result<Vec<String>, StoreError> {
        match &self.inner {
            Some(inner) => inner.query_strings(sql).await,
            None => Ok(Vec::new()),
        }
    }
}
