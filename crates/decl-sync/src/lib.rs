//! Collection engine: admission control, parallel section fetch, merge and job lifecycle.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use decl_adapters::{
    fetch_section, list_declarations, normalize, unique_ids, AdapterError, DeclarationsApi,
    HttpDeclarationsApi, NormalizedSection, SectionCatalog, SectionPath, DEFAULT_BASE_URL,
};
use decl_core::{
    DatasetMetadata, Declaration, DeclarationId, FailedItem, FailureReason, Filter, FilterError,
    JobId, JobState, JobStatus, Record, Section,
};
use decl_storage::{
    BackoffPolicy, DatasetStore, FileDatasetStore, HttpClientConfig, HttpFetcher,
    DEFAULT_USER_AGENT,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "decl-sync";

/// Upper bound on how long the fetch loop waits before re-checking the stop signal.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_base_url: String,
    pub max_workers: usize,
    pub max_jobs: usize,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub user_agent: String,
    pub data_dir: PathBuf,
    pub sections_file: Option<PathBuf>,
    pub job_retention: Duration,
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_BASE_URL.to_string(),
            max_workers: 3,
            max_jobs: 2,
            http_timeout_secs: 30,
            max_retries: 5,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            data_dir: PathBuf::from("./temp_data"),
            sections_file: None,
            job_retention: Duration::from_secs(3600),
            poll_interval: POLL_INTERVAL,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base_url: env_or("DECL_API_BASE_URL", defaults.api_base_url),
            max_workers: env_or("DECL_MAX_WORKERS", defaults.max_workers).max(1),
            max_jobs: env_or("DECL_MAX_JOBS", defaults.max_jobs).max(1),
            http_timeout_secs: env_or("DECL_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            max_retries: env_or("DECL_MAX_RETRIES", defaults.max_retries),
            user_agent: env_or("DECL_USER_AGENT", defaults.user_agent),
            data_dir: std::env::var("DECL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            sections_file: std::env::var("DECL_SECTIONS_FILE").ok().map(PathBuf::from),
            job_retention: Duration::from_secs(env_or(
                "DECL_JOB_RETENTION_SECS",
                defaults.job_retention.as_secs(),
            )),
            poll_interval: defaults.poll_interval,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            // every running job's workers plus its listing call
            global_concurrency: self.max_jobs * (self.max_workers + 1),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..BackoffPolicy::default()
            },
        }
    }

    pub fn load_catalog(&self) -> Result<SectionCatalog> {
        match &self.sections_file {
            Some(path) => SectionCatalog::from_path(path),
            None => Ok(SectionCatalog::builtin()),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Server is busy (max {capacity} jobs running). Please try again in a few minutes.")]
    CapacityExceeded { capacity: usize },
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error(transparent)]
    InvalidFilter(#[from] FilterError),
    #[error(transparent)]
    Section(#[from] AdapterError),
}

/// Process-wide cap on concurrently running jobs. Acquisition never waits.
#[derive(Debug)]
pub struct AdmissionController {
    capacity: usize,
    slots: Arc<Semaphore>,
}

/// A held job slot; dropping it returns the slot exactly once.
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            slots: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn try_acquire(&self) -> Result<AdmissionSlot, EngineError> {
        Arc::clone(&self.slots)
            .try_acquire_owned()
            .map(|permit| AdmissionSlot { _permit: permit })
            .map_err(|_| EngineError::CapacityExceeded {
                capacity: self.capacity,
            })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

/// Successful sections and failures for one fan-out fetch.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub sections: BTreeMap<DeclarationId, Section>,
    pub failures: Vec<FailedItem>,
    pub completed: usize,
    pub cancelled: bool,
}

enum ItemOutcome {
    Fetched(Section),
    Failed(FailureReason),
    Cancelled,
}

/// Fans detail requests out over a fixed-size worker pool.
pub struct RowFetcher {
    api: Arc<dyn DeclarationsApi>,
    max_workers: usize,
    poll_interval: Duration,
}

impl RowFetcher {
    pub fn new(api: Arc<dyn DeclarationsApi>, max_workers: usize, poll_interval: Duration) -> Self {
        Self {
            api,
            max_workers: max_workers.max(1),
            poll_interval,
        }
    }

    /// Fetches one section per id.
    ///
    /// Completions are reaped with a bounded wait so the stop signal is observed at
    /// least every `poll_interval`. Once it is set, queued work is aborted and results
    /// still in flight are discarded rather than recorded as failures.
    /// `on_progress(completed, total)` runs after every recorded completion.
    pub async fn fetch<F>(
        &self,
        ids: &[DeclarationId],
        path: &SectionPath,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> FetchOutcome
    where
        F: FnMut(usize, usize),
    {
        let ids = unique_ids(ids);
        let total = ids.len();
        let mut outcome = FetchOutcome::default();

        let permits = Arc::new(Semaphore::new(self.max_workers));
        let path = Arc::new(path.clone());
        let mut tasks = JoinSet::new();
        let mut id_by_task = HashMap::with_capacity(total);

        for id in ids {
            let api = Arc::clone(&self.api);
            let permits = Arc::clone(&permits);
            let path = Arc::clone(&path);
            let cancel = cancel.clone();
            let handle = tasks.spawn(async move {
                fetch_one(api.as_ref(), id, &path, &permits, &cancel).await
            });
            id_by_task.insert(handle.id(), id);
        }

        while !tasks.is_empty() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                tasks.abort_all();
                break;
            }

            let joined = match tokio::time::timeout(self.poll_interval, tasks.join_next_with_id()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(joined)) => joined,
            };

            let (task_id, item) = match joined {
                Ok((task_id, item)) => (task_id, item),
                Err(err) => (
                    err.id(),
                    ItemOutcome::Failed(FailureReason::Permanent(format!("worker failed: {err}"))),
                ),
            };
            let Some(&id) = id_by_task.get(&task_id) else {
                continue;
            };

            match item {
                ItemOutcome::Fetched(section) => {
                    outcome.sections.insert(id, section);
                }
                ItemOutcome::Failed(reason) => {
                    warn!(declaration_id = id, %reason, "section fetch failed");
                    outcome.failures.push(FailedItem::new(id, reason));
                }
                ItemOutcome::Cancelled => continue,
            }

            outcome.completed += 1;
            on_progress(outcome.completed, total);
        }

        outcome
    }
}

async fn fetch_one(
    api: &dyn DeclarationsApi,
    id: DeclarationId,
    path: &SectionPath,
    permits: &Semaphore,
    cancel: &CancellationToken,
) -> ItemOutcome {
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return ItemOutcome::Cancelled,
        permit = permits.acquire() => match permit {
            Ok(permit) => permit,
            Err(_) => return ItemOutcome::Cancelled,
        },
    };
    if cancel.is_cancelled() {
        return ItemOutcome::Cancelled;
    }

    match fetch_section(api, id, path).await {
        // A section that arrives after the stop is still kept.
        Ok(section) => ItemOutcome::Fetched(section),
        Err(_) if cancel.is_cancelled() => ItemOutcome::Cancelled,
        Err(err) => ItemOutcome::Failed(err.failure_reason()),
    }
}

/// Flattened dataset plus the failures that excluded declarations from it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutput {
    pub records: Vec<Record>,
    pub failures: Vec<FailedItem>,
}

/// Joins declaration metadata with normalized rows.
///
/// Failed ids are dropped entirely. A declaration with no rows yields exactly one
/// record with every known header set to null; otherwise one record per row.
pub fn merge(
    declarations: &[Declaration],
    sections: &BTreeMap<DeclarationId, NormalizedSection>,
    failures: Vec<FailedItem>,
) -> MergeOutput {
    let failed: HashSet<DeclarationId> = failures.iter().map(|f| f.id).collect();
    let mut records = Vec::with_capacity(declarations.len());

    for declaration in declarations {
        if failed.contains(&declaration.id) {
            continue;
        }
        let base = declaration.to_record();
        let normalized = sections.get(&declaration.id);
        let rows = normalized
            .map(NormalizedSection::normalized_rows)
            .unwrap_or_default();

        if rows.is_empty() {
            let mut record = base;
            for header in normalized.map(|n| n.headers.as_slice()).unwrap_or_default() {
                record.insert(header.clone(), JsonValue::Null);
            }
            records.push(record);
            continue;
        }

        for row in rows {
            let mut record = base.clone();
            for (header, value) in row.0 {
                record.insert(header, value);
            }
            records.push(record);
        }
    }

    MergeOutput { records, failures }
}

struct JobSlot {
    state: JobState,
    sealed: bool,
}

/// Shared handle to one job: its filter, stop signal and synchronized state.
pub struct JobHandle {
    id: JobId,
    filter: Filter,
    cancel: CancellationToken,
    slot: Mutex<JobSlot>,
}

impl JobHandle {
    fn new(id: JobId, filter: Filter) -> Self {
        Self {
            id,
            filter,
            cancel: CancellationToken::new(),
            slot: Mutex::new(JobSlot {
                state: JobState::new(Utc::now()),
                sealed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn snapshot(&self) -> JobState {
        self.lock().state.clone()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signals the job to stop. Idempotent; false once the job has finished or
    /// started persisting its result.
    pub fn request_stop(&self) -> bool {
        let mut slot = self.lock();
        if slot.sealed {
            return false;
        }
        let signalled = slot.state.request_stop();
        if signalled {
            self.cancel.cancel();
        }
        signalled
    }

    fn set_message(&self, message: &str) {
        self.lock().state.set_message(message);
    }

    fn begin_processing(&self, total: usize, message: &str) {
        self.lock().state.begin_processing(total, message);
    }

    fn record_progress(&self, completed: usize, total: usize) {
        self.lock().state.record_progress(completed, total);
    }

    /// Closes the job to further stop requests; returns whether a stop was requested.
    fn seal(&self) -> bool {
        let mut slot = self.lock();
        slot.sealed = true;
        self.cancel.is_cancelled()
    }

    fn finish(&self, status: JobStatus, message: &str) -> bool {
        self.lock().state.finish(status, message, Utc::now())
    }

    fn expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        let slot = self.lock();
        match (slot.state.status.is_terminal(), slot.state.finished_at) {
            (true, Some(finished_at)) => now
                .signed_duration_since(finished_at)
                .to_std()
                .map(|age| age >= retention)
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Live-job table. Terminal jobs are evicted once `retention` has passed.
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, Arc<JobHandle>>>,
    retention: Duration,
}

impl JobRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Arc<JobHandle>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, job: Arc<JobHandle>) {
        self.lock().insert(job.id(), job);
    }

    pub fn get(&self, id: JobId) -> Option<Arc<JobHandle>> {
        self.evict_expired(Utc::now());
        self.lock().get(&id).cloned()
    }

    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, job| !job.expired(now, self.retention));
        before - jobs.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// What a finished job handed to the dataset store.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub status: JobStatus,
    pub total_declarations: usize,
    pub total_rows: usize,
    pub failed: usize,
}

struct EngineInner {
    config: EngineConfig,
    api: Arc<dyn DeclarationsApi>,
    catalog: SectionCatalog,
    store: Arc<dyn DatasetStore>,
    admission: AdmissionController,
    registry: JobRegistry,
}

/// Entry point for the orchestration layer: start, observe and stop collection jobs.
#[derive(Clone)]
pub struct CollectionEngine {
    inner: Arc<EngineInner>,
}

impl CollectionEngine {
    pub fn new(
        config: EngineConfig,
        api: Arc<dyn DeclarationsApi>,
        catalog: SectionCatalog,
        store: Arc<dyn DatasetStore>,
    ) -> Self {
        let admission = AdmissionController::new(config.max_jobs);
        let registry = JobRegistry::new(config.job_retention);
        Self {
            inner: Arc::new(EngineInner {
                config,
                api,
                catalog,
                store,
                admission,
                registry,
            }),
        }
    }

    /// Wires the HTTP API client, section catalog and file store from `config`.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let api = HttpDeclarationsApi::new(http, config.api_base_url.clone());
        let catalog = config.load_catalog().context("loading section catalog")?;
        let store = FileDatasetStore::new(config.data_dir.clone());
        Ok(Self::new(config, Arc::new(api), catalog, Arc::new(store)))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &SectionCatalog {
        &self.inner.catalog
    }

    pub fn store(&self) -> Arc<dyn DatasetStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn available_slots(&self) -> usize {
        self.inner.admission.available()
    }

    /// Validates the filter, takes an admission slot and spawns the job.
    /// Must be called from within a tokio runtime.
    pub fn start_job(&self, filter: Filter) -> Result<JobId, EngineError> {
        let filter = filter.sanitized()?;
        let path = self.inner.catalog.resolve(&filter.section)?;
        let slot = self.inner.admission.try_acquire()?;

        let job = Arc::new(JobHandle::new(Uuid::new_v4(), filter));
        let job_id = job.id();
        self.inner.registry.insert(Arc::clone(&job));
        info!(%job_id, section = %job.filter().section, year = job.filter().year, "collection job admitted");

        let inner = Arc::clone(&self.inner);
        let work = tokio::spawn({
            let job = Arc::clone(&job);
            async move { inner.collect(&job, &path).await }
        });
        tokio::spawn(async move {
            let _slot = slot;
            let failure = match work.await {
                Ok(Ok(summary)) => {
                    info!(
                        %job_id,
                        status = %summary.status,
                        declarations = summary.total_declarations,
                        rows = summary.total_rows,
                        failed = summary.failed,
                        "collection job finished"
                    );
                    None
                }
                Ok(Err(err)) => Some(format!("{err:#}")),
                Err(err) => Some(format!("job task failed: {err}")),
            };
            if let Some(message) = failure {
                error!(%job_id, error = %message, "collection job failed");
                job.finish(JobStatus::Error, &format!("Error: {message}"));
            }
        });

        Ok(job_id)
    }

    pub fn query_status(&self, id: JobId) -> Result<JobState, EngineError> {
        self.inner
            .registry
            .get(id)
            .map(|job| job.snapshot())
            .ok_or(EngineError::NotFound(id))
    }

    /// True iff the job exists and was signalled to stop.
    pub fn request_stop(&self, id: JobId) -> bool {
        match self.inner.registry.get(id) {
            Some(job) => {
                let signalled = job.request_stop();
                if signalled {
                    info!(job_id = %id, "stop requested");
                }
                signalled
            }
            None => false,
        }
    }

    pub fn evict_expired(&self) -> usize {
        self.inner.registry.evict_expired(Utc::now())
    }

    pub fn tracked_jobs(&self) -> usize {
        self.inner.registry.len()
    }

    /// Polls until the job reaches a terminal status.
    pub async fn wait_for_terminal(&self, id: JobId, every: Duration) -> Result<JobState, EngineError> {
        loop {
            let state = self.query_status(id)?;
            if state.status.is_terminal() {
                return Ok(state);
            }
            tokio::time::sleep(every).await;
        }
    }

    /// Periodically evicts expired jobs until the engine is dropped.
    pub fn spawn_eviction_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let evicted = inner.registry.evict_expired(Utc::now());
                if evicted > 0 {
                    info!(evicted, "evicted expired jobs");
                }
            }
        })
    }
}

impl EngineInner {
    async fn collect(&self, job: &JobHandle, path: &SectionPath) -> Result<JobSummary> {
        let job_id = job.id();
        job.set_message("Fetching initial declarations list...");
        let listing = list_declarations(self.api.as_ref(), job.filter(), &job.cancel).await;
        info!(%job_id, declarations = listing.len(), "declarations listed");

        if listing.is_empty() {
            let stopped = job.seal();
            let (status, message) = if stopped {
                (JobStatus::Stopped, "Process stopped by user.")
            } else {
                (JobStatus::Finished, "No declarations found.")
            };
            self.persist(job, &MergeOutput::default(), 0, status).await?;
            job.finish(status, message);
            return Ok(JobSummary {
                status,
                total_declarations: 0,
                total_rows: 0,
                failed: 0,
            });
        }

        job.begin_processing(listing.len(), "Downloading detailed row data...");
        let fetcher = RowFetcher::new(
            Arc::clone(&self.api),
            self.config.max_workers,
            self.config.poll_interval,
        );
        let fetched = fetcher
            .fetch(&listing.ids, path, &job.cancel, |completed, total| {
                job.record_progress(completed, total)
            })
            .await;
        if fetched.cancelled {
            info!(%job_id, completed = fetched.completed, "fetch stopped early");
        }

        job.set_message("Formatting data...");
        let normalized = fetched
            .sections
            .iter()
            .map(|(id, section)| (*id, normalize(section)))
            .collect::<BTreeMap<_, _>>();
        let merged = merge(&listing.declarations, &normalized, fetched.failures);

        let stopped = job.seal();
        let (status, message) = if stopped {
            (JobStatus::Stopped, "Process stopped by user.")
        } else {
            (JobStatus::Finished, "Complete")
        };
        self.persist(job, &merged, listing.len(), status).await?;
        job.finish(status, message);

        Ok(JobSummary {
            status,
            total_declarations: listing.len(),
            total_rows: merged.records.len(),
            failed: merged.failures.len(),
        })
    }

    async fn persist(
        &self,
        job: &JobHandle,
        merged: &MergeOutput,
        total_declarations: usize,
        status: JobStatus,
    ) -> Result<()> {
        let metadata = DatasetMetadata {
            task_id: job.id(),
            filters: job.filter().clone(),
            status,
            total_declarations,
            total_rows: merged.records.len(),
            stopped_early: status == JobStatus::Stopped,
            failed_ids: Vec::new(),
            saved_at: Utc::now(),
            records_sha256: None,
        };
        self.store
            .save(&merged.records, metadata, &merged.failures)
            .await
            .with_context(|| format!("saving dataset for job {}", job.id()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use decl_adapters::{classify_section, ListingQuery};
    use decl_storage::FetchError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn declarations(ids: &[i64]) -> Vec<Declaration> {
        ids.iter()
            .map(|id| serde_json::from_value(json!({"id": id, "name": format!("decl-{id}")})).unwrap())
            .collect()
    }

    /// Detail documents keyed by id; ids without a document answer 404.
    struct DetailApi {
        details: HashMap<DeclarationId, JsonValue>,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DeclarationsApi for DetailApi {
        async fn list(&self, _query: &ListingQuery) -> Result<JsonValue, AdapterError> {
            Ok(json!({"data": []}))
        }

        async fn detail(&self, id: DeclarationId) -> Result<JsonValue, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.details.get(&id).cloned().ok_or_else(|| {
                AdapterError::Fetch(FetchError::HttpStatus {
                    status: 404,
                    url: format!("/declaration/{id}"),
                })
            })
        }
    }

    fn root_path() -> SectionPath {
        SectionPath::parse("['section']").unwrap()
    }

    #[test]
    fn admission_is_fail_fast_and_released_on_drop() {
        let admission = AdmissionController::new(2);
        let first = admission.try_acquire().expect("slot 1");
        let _second = admission.try_acquire().expect("slot 2");
        assert!(matches!(
            admission.try_acquire(),
            Err(EngineError::CapacityExceeded { capacity: 2 })
        ));
        drop(first);
        assert_eq!(admission.available(), 1);
        assert!(admission.try_acquire().is_ok());
    }

    #[test]
    fn merge_matches_partial_failure_scenario() {
        let decls = declarations(&[1, 2, 3]);
        let mut sections = BTreeMap::new();
        sections.insert(
            1,
            normalize(&classify_section(json!({
                "headerItems": [{"name": "A"}, {"name": "B"}],
                "rows": [[10, 20]]
            }))),
        );
        sections.insert(3, normalize(&classify_section(json!([]))));
        let failures = vec![FailedItem::new(2, FailureReason::Permanent("API Error 404".into()))];

        let merged = merge(&decls, &sections, failures.clone());
        assert_eq!(merged.failures, failures);
        assert_eq!(merged.records.len(), 2);
        assert_eq!(
            serde_json::to_value(&merged.records[0]).unwrap(),
            json!({"id": 1, "name": "decl-1", "A": 10, "B": 20})
        );
        assert_eq!(
            serde_json::to_value(&merged.records[1]).unwrap(),
            json!({"id": 3, "name": "decl-3"})
        );
    }

    #[test]
    fn merge_emits_one_null_record_for_zero_rows() {
        let decls = declarations(&[7]);
        let mut sections = BTreeMap::new();
        sections.insert(
            7,
            normalize(&classify_section(json!({
                "headerItems": [{"name": "Area"}, {"name": "Owner"}],
                "rows": []
            }))),
        );

        let merged = merge(&decls, &sections, Vec::new());
        assert_eq!(merged.records.len(), 1);
        let record = &merged.records[0];
        assert_eq!(record.get("Area"), Some(&JsonValue::Null));
        assert_eq!(record.get("Owner"), Some(&JsonValue::Null));
    }

    #[test]
    fn merge_keeps_sparse_row_headers_unset() {
        let decls = declarations(&[4]);
        let mut sections = BTreeMap::new();
        sections.insert(
            4,
            normalize(&classify_section(json!([
                {"cells": [{"title": "Bank", "value": "X"}]},
                {"cells": [{"title": "Amount", "value": 5}]}
            ]))),
        );
        let merged = merge(&decls, &sections, Vec::new());
        assert_eq!(merged.records.len(), 2);
        assert!(merged.records[0].contains("Bank"));
        assert!(!merged.records[0].contains("Amount"));
        assert!(!merged.records[1].contains("Bank"));
    }

    #[tokio::test]
    async fn fetcher_partitions_successes_and_failures() {
        let mut details = HashMap::new();
        details.insert(1, json!({"section": {"headerItems": [{"name": "A"}], "rows": [[1]]}}));
        details.insert(3, json!({"other": true}));
        let api = Arc::new(DetailApi {
            details,
            delay: Duration::from_millis(5),
            calls: AtomicUsize::new(0),
        });

        let fetcher = RowFetcher::new(api.clone(), 2, Duration::from_millis(20));
        let mut progress = Vec::new();
        let outcome = fetcher
            .fetch(&[1, 2, 3, 1], &root_path(), &CancellationToken::new(), |done, total| {
                progress.push((done, total))
            })
            .await;

        assert!(!outcome.cancelled);
        assert_eq!(outcome.completed, 3);
        assert_eq!(outcome.sections.keys().copied().collect::<Vec<_>>(), vec![1]);
        let mut failures = outcome.failures.clone();
        failures.sort_by_key(|f| f.id);
        assert_eq!(
            failures,
            vec![
                FailedItem::new(2, FailureReason::Permanent("API Error 404".into())),
                FailedItem::new(3, FailureReason::SectionNotFound),
            ]
        );
        assert_eq!(progress, vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fetcher_stops_without_recording_discarded_work() {
        let details = (1..=20).map(|id| (id, json!({"section": []}))).collect();
        let api = Arc::new(DetailApi {
            details,
            delay: Duration::from_secs(30),
            calls: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let fetcher = RowFetcher::new(api.clone(), 3, Duration::from_millis(20));
        let ids: Vec<_> = (1..=20).collect();
        let started = std::time::Instant::now();
        let outcome = fetcher.fetch(&ids, &root_path(), &cancel, |_, _| {}).await;

        assert!(outcome.cancelled);
        assert!(outcome.sections.is_empty());
        assert!(outcome.failures.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(api.calls.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn registry_evicts_only_expired_terminal_jobs() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let running = Arc::new(JobHandle::new(Uuid::new_v4(), Filter::new("income", 2024)));
        let done = Arc::new(JobHandle::new(Uuid::new_v4(), Filter::new("income", 2024)));
        done.finish(JobStatus::Finished, "Complete");
        registry.insert(running.clone());
        registry.insert(done.clone());

        assert_eq!(registry.evict_expired(Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(registry.evict_expired(later), 1);
        assert!(registry.get(running.id()).is_some());
        assert!(registry.get(done.id()).is_none());
    }

    #[test]
    fn sealed_job_refuses_stop() {
        let job = JobHandle::new(Uuid::new_v4(), Filter::new("income", 2024));
        assert!(job.request_stop());
        assert!(job.request_stop());
        assert!(job.seal());

        let other = JobHandle::new(Uuid::new_v4(), Filter::new("income", 2024));
        assert!(!other.seal());
        assert!(!other.request_stop());
        assert!(!other.is_stop_requested());
    }

    #[test]
    fn http_config_scales_with_job_capacity() {
        let config = EngineConfig {
            max_jobs: 2,
            max_workers: 3,
            max_retries: 4,
            ..Default::default()
        };
        let http = config.http_client_config();
        assert_eq!(http.global_concurrency, 8);
        assert_eq!(http.backoff.max_retries, 4);
        assert_eq!(http.timeout, Duration::from_secs(30));
    }
}
