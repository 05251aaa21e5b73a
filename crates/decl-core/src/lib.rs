//! Core domain model for the declaration collector.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "decl-core";

/// Largest page the listing endpoint accepts.
pub const MAX_PAGE_SIZE: u32 = 100;

pub type DeclarationId = i64;
pub type JobId = Uuid;

fn default_limit() -> u32 {
    MAX_PAGE_SIZE
}

/// Immutable criteria for one collection job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Section catalog name (or inline path) of the nested detail table to collect.
    #[serde(alias = "row_name")]
    pub section: String,
    pub year: i32,
    #[serde(default)]
    pub declarant_type: Option<i64>,
    #[serde(default, rename = "type", alias = "t_type")]
    pub declaration_type: Option<i64>,
    #[serde(default, alias = "inst_group")]
    pub institution_group: Option<i64>,
    #[serde(default)]
    pub institution: Option<i64>,
    #[serde(default)]
    pub offset: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub retry_ids: BTreeSet<DeclarationId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("section name is required")]
    MissingSection,
    #[error("year must be positive, got {0}")]
    InvalidYear(i32),
}

impl Filter {
    pub fn new(section: impl Into<String>, year: i32) -> Self {
        Self {
            section: section.into(),
            year,
            declarant_type: None,
            declaration_type: None,
            institution_group: None,
            institution: None,
            offset: 0,
            limit: MAX_PAGE_SIZE,
            retry_ids: BTreeSet::new(),
        }
    }

    /// Normalizes caller input: non-positive optional criteria count as unset and
    /// `limit` is clamped to `1..=MAX_PAGE_SIZE` (zero meaning a full page).
    pub fn sanitized(mut self) -> Result<Self, FilterError> {
        self.section = self.section.trim().to_string();
        if self.section.is_empty() {
            return Err(FilterError::MissingSection);
        }
        if self.year <= 0 {
            return Err(FilterError::InvalidYear(self.year));
        }
        for slot in [
            &mut self.declarant_type,
            &mut self.declaration_type,
            &mut self.institution_group,
            &mut self.institution,
        ] {
            if slot.is_some_and(|v| v <= 0) {
                *slot = None;
            }
        }
        self.limit = clamp_limit(self.limit);
        Ok(self)
    }

    pub fn is_retry(&self) -> bool {
        !self.retry_ids.is_empty()
    }
}

pub fn clamp_limit(limit: u32) -> u32 {
    if limit == 0 {
        MAX_PAGE_SIZE
    } else {
        limit.min(MAX_PAGE_SIZE)
    }
}

/// One listed source record: an integer id plus whatever fields the API returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    pub id: DeclarationId,
    #[serde(flatten)]
    pub fields: Map<String, JsonValue>,
}

impl Declaration {
    /// Metadata copy used as the base of every output record (`id` first).
    pub fn to_record(&self) -> Record {
        let mut map = Map::with_capacity(self.fields.len() + 1);
        map.insert("id".to_string(), JsonValue::from(self.id));
        for (key, value) in &self.fields {
            if key != "id" {
                map.insert(key.clone(), value.clone());
            }
        }
        Record(map)
    }
}

/// Header descriptor plus row list of a tabular section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub title: Option<String>,
    pub value: JsonValue,
}

/// Raw nested detail payload fetched for one declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Section {
    Tabular(Table),
    Cells { cells: Vec<Cell> },
    Rows { rows: Vec<JsonValue> },
    Absent,
}

/// Ordered header/value pairs derived from one section row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizedRow(pub Vec<(String, JsonValue)>);

impl NormalizedRow {
    pub fn headers(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(h, _)| h.as_str())
    }
}

/// Flattened output unit: declaration metadata plus one column per row header.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub Map<String, JsonValue>);

impl Record {
    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.0.get(column)
    }

    pub fn insert(&mut self, column: impl Into<String>, value: JsonValue) {
        self.0.insert(column.into(), value);
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Closed per-item failure taxonomy. Serialized as its display text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum FailureReason {
    /// Timeout, connection failure or 429/5xx after retries were exhausted.
    Transient(String),
    /// Non-retryable HTTP outcome (4xx other than 429).
    Permanent(String),
    InvalidJson,
    SectionNotFound,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Transient(detail) | FailureReason::Permanent(detail) => {
                f.write_str(detail)
            }
            FailureReason::InvalidJson => f.write_str("Invalid JSON"),
            FailureReason::SectionNotFound => f.write_str("Data section not found"),
        }
    }
}

impl From<FailureReason> for String {
    fn from(reason: FailureReason) -> Self {
        reason.to_string()
    }
}

impl From<String> for FailureReason {
    /// Recovers the variant from stored text; unrecognized text is permanent.
    fn from(text: String) -> Self {
        let transient = text == "Timeout"
            || text == "Connection failed"
            || text
                .strip_prefix("API Error ")
                .and_then(|code| code.parse::<u16>().ok())
                .is_some_and(|code| code == 429 || code >= 500);
        match text.as_str() {
            "Invalid JSON" => FailureReason::InvalidJson,
            "Data section not found" => FailureReason::SectionNotFound,
            _ if transient => FailureReason::Transient(text),
            _ => FailureReason::Permanent(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub id: DeclarationId,
    pub reason: FailureReason,
}

impl FailedItem {
    pub fn new(id: DeclarationId, reason: FailureReason) -> Self {
        Self { id, reason }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Initializing,
    Processing,
    Stopping,
    Stopped,
    Finished,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Stopped | JobStatus::Finished | JobStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Initializing => "initializing",
            JobStatus::Processing => "processing",
            JobStatus::Stopping => "stopping",
            JobStatus::Stopped => "stopped",
            JobStatus::Finished => "finished",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable snapshot of one job.
///
/// Every mutator is a no-op once the status is terminal, and `stopping` can only
/// be left towards a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub status: JobStatus,
    pub progress: usize,
    pub total: usize,
    pub message: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobState {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Initializing,
            progress: 0,
            total: 0,
            message: "Starting collection...".to_string(),
            start_time,
            finished_at: None,
        }
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        if !self.status.is_terminal() {
            self.message = message.into();
        }
    }

    /// Enters the fetch phase with the expected item count.
    pub fn begin_processing(&mut self, total: usize, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.total = total;
        self.message = message.into();
        if self.status == JobStatus::Initializing {
            self.status = JobStatus::Processing;
        }
    }

    pub fn record_progress(&mut self, completed: usize, total: usize) {
        if self.status.is_terminal() {
            return;
        }
        self.progress = completed;
        self.total = total;
        if self.status == JobStatus::Initializing {
            self.status = JobStatus::Processing;
        }
        if self.status == JobStatus::Processing {
            self.message = format!("Processed {completed} of {total} items...");
        }
    }

    /// Marks the job as stopping. Returns false when the job already finished.
    pub fn request_stop(&mut self) -> bool {
        match self.status {
            JobStatus::Initializing | JobStatus::Processing => {
                self.status = JobStatus::Stopping;
                self.message = "Stopping...".to_string();
                true
            }
            JobStatus::Stopping => true,
            _ => false,
        }
    }

    /// Moves into a terminal status. Returns false if the job was already terminal.
    pub fn finish(&mut self, status: JobStatus, message: impl Into<String>, at: DateTime<Utc>) -> bool {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.message = message.into();
        self.finished_at = Some(at);
        true
    }
}

/// Persisted description of a finished (or stopped) dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub task_id: JobId,
    pub filters: Filter,
    pub status: JobStatus,
    pub total_declarations: usize,
    pub total_rows: usize,
    #[serde(default)]
    pub stopped_early: bool,
    #[serde(default)]
    pub failed_ids: Vec<FailedItem>,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub records_sha256: Option<String>,
}
