//! Outbound HTTP with bounded retry plus the flat-file dataset store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use decl_core::{DatasetMetadata, FailedItem, JobId, Record};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "decl-storage";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115.0.0.0 Safari/537.36";

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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {source}")]
    InvalidJson {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// True when the failure belongs to the retried class (even if retries ran out).
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            FetchError::InvalidJson { .. } => false,
        }
    }

    /// Short human-readable description used as a per-item failure reason.
    pub fn summary(&self) -> String {
        match self {
            FetchError::HttpStatus { status, .. } => format!("API Error {status}"),
            FetchError::Request(err) if err.is_timeout() => "Timeout".to_string(),
            FetchError::Request(err) if err.is_connect() => "Connection failed".to_string(),
            FetchError::Request(err) => err.to_string(),
            FetchError::InvalidJson { .. } => "Invalid JSON".to_string(),
        }
    }
}

/// Shared reqwest client with a process-wide request cap and bounded exponential backoff.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        let body = self
            .send_with_retry("GET", url, || self.client.get(url))
            .instrument(info_span!("http_fetch", method = "GET", url))
            .await?;
        parse_json(url, &body)
    }

    pub async fn post_json(&self, url: &str, payload: &JsonValue) -> Result<JsonValue, FetchError> {
        let body = self
            .send_with_retry("POST", url, || self.client.post(url).json(payload))
            .instrument(info_span!("http_fetch", method = "POST", url))
            .await?;
        parse_json(url, &body)
    }

    async fn send_with_retry<F>(&self, method: &str, url: &str, build: F) -> Result<Vec<u8>, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        for attempt in 0..=self.backoff.max_retries {
            let retries_left = attempt < self.backoff.max_retries;
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    if classify_status(status) == RetryDisposition::Retryable && retries_left {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(method, url, %status, attempt, ?delay, "retrying transient status");
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && retries_left {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(method, url, error = %err, attempt, ?delay, "retrying failed request");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    warn!(method, url, error = %err, "request failed");
                    return Err(FetchError::Request(err));
                }
            }
        }

        unreachable!("the final attempt always returns")
    }
}

fn parse_json(url: &str, body: &[u8]) -> Result<JsonValue, FetchError> {
    serde_json::from_slice(body).map_err(|source| FetchError::InvalidJson {
        url: url.to_string(),
        source,
    })
}

/// A persisted dataset as read back from the store.
#[derive(Debug, Clone)]
pub struct StoredDataset {
    pub records: Vec<Record>,
    pub metadata: DatasetMetadata,
}

/// Durable storage for finished datasets, keyed by job id.
#[async_trait]
pub trait DatasetStore: Send + Sync {
    async fn save(
        &self,
        records: &[Record],
        metadata: DatasetMetadata,
        failures: &[FailedItem],
    ) -> anyhow::Result<DatasetMetadata>;

    async fn load(&self, task_id: JobId) -> anyhow::Result<Option<StoredDataset>>;

    async fn load_metadata(&self, task_id: JobId) -> anyhow::Result<Option<DatasetMetadata>>;

    /// All stored metadata, newest first.
    async fn history(&self) -> anyhow::Result<Vec<DatasetMetadata>>;
}

/// Stores `{task_id}.records.json` + `{task_id}.json` pairs under one directory.
#[derive(Debug, Clone)]
pub struct FileDatasetStore {
    root: PathBuf,
}

impl FileDatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn records_path(&self, task_id: JobId) -> PathBuf {
        self.root.join(format!("{task_id}.records.json"))
    }

    fn metadata_path(&self, task_id: JobId) -> PathBuf {
        self.root.join(format!("{task_id}.json"))
    }

    /// Writes through a temp file in the same directory and renames into place.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }

    async fn read_metadata_file(path: &Path) -> anyhow::Result<DatasetMetadata> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[async_trait]
impl DatasetStore for FileDatasetStore {
    async fn save(
        &self,
        records: &[Record],
        mut metadata: DatasetMetadata,
        failures: &[FailedItem],
    ) -> anyhow::Result<DatasetMetadata> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating {}", self.root.display()))?;

        let records_json = serde_json::to_vec(records).context("serializing records")?;
        metadata.failed_ids = failures.to_vec();
        metadata.saved_at = Utc::now();
        metadata.records_sha256 = Some(Self::sha256_hex(&records_json));

        let metadata_json =
            serde_json::to_vec_pretty(&metadata).context("serializing dataset metadata")?;

        // Records land first so a visible metadata file always has its data.
        self.write_atomic(&self.records_path(metadata.task_id), &records_json)
            .await?;
        self.write_atomic(&self.metadata_path(metadata.task_id), &metadata_json)
            .await?;
        Ok(metadata)
    }

    async fn load(&self, task_id: JobId) -> anyhow::Result<Option<StoredDataset>> {
        let Some(metadata) = self.load_metadata(task_id).await? else {
            return Ok(None);
        };
        let records_path = self.records_path(task_id);
        if !fs::try_exists(&records_path)
            .await
            .with_context(|| format!("checking {}", records_path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&records_path)
            .await
            .with_context(|| format!("reading {}", records_path.display()))?;
        let records = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", records_path.display()))?;
        Ok(Some(StoredDataset { records, metadata }))
    }

    async fn load_metadata(&self, task_id: JobId) -> anyhow::Result<Option<DatasetMetadata>> {
        let path = self.metadata_path(task_id);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        Self::read_metadata_file(&path).await.map(Some)
    }

    async fn history(&self) -> anyhow::Result<Vec<DatasetMetadata>> {
        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking {}", self.root.display()))?
        {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading {}", self.root.display()))?;
        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json") || name.ends_with(".records.json") || name.starts_with('.') {
                continue;
            }
            match Self::read_metadata_file(&path).await {
                Ok(meta) => items.push(meta),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable metadata"),
            }
        }
        items.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(items)
    }
}

/// Union of record columns in first-seen order.
pub fn union_columns(records: &[Record]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for column in record.columns() {
            if !columns.iter().any(|c| c == column) {
                columns.push(column.clone());
            }
        }
    }
    columns
}

/// Renders records as CSV with a union-of-columns header; absent and null cells stay blank.
pub fn records_to_csv(records: &[Record]) -> String {
    let columns = union_columns(records);
    let mut out = String::new();
    push_csv_line(&mut out, columns.iter().map(String::as_str));
    for record in records {
        let cells = columns
            .iter()
            .map(|c| csv_cell(record.get(c)))
            .collect::<Vec<_>>();
        push_csv_line(&mut out, cells.iter().map(String::as_str));
    }
    out
}

fn csv_cell(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn push_csv_line<'a>(out: &mut String, cells: impl Iterator<Item = &'a str>) {
    let mut first = true;
    for cell in cells {
        if !first {
            out.push(',');
        }
        first = false;
        if cell.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&cell.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(cell);
        }
    }
    out.push('\n');
}
