//! Remote declarations API contract, listing, section paths and shape normalization.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use decl_core::{
    clamp_limit, Cell, Declaration, DeclarationId, FailureReason, Filter, NormalizedRow, Section,
    Table,
};
use decl_storage::{FetchError, HttpFetcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "decl-adapters";

pub const DEFAULT_BASE_URL: &str = "https://file-online.cpcarmenia.am/armepdwebservice/v1";

const DEFAULT_SECTIONS_YAML: &str = include_str!("../sections.yaml");

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("data section not found")]
    SectionNotFound,
    #[error("unknown section {0:?}")]
    UnknownSection(String),
    #[error("invalid section path {0:?}")]
    InvalidPath(String),
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    /// Maps a per-item error onto the closed failure taxonomy.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            AdapterError::Fetch(FetchError::InvalidJson { .. }) => FailureReason::InvalidJson,
            AdapterError::Fetch(err) if err.is_transient() => FailureReason::Transient(err.summary()),
            AdapterError::Fetch(err) => FailureReason::Permanent(err.summary()),
            AdapterError::SectionNotFound => FailureReason::SectionNotFound,
            other => FailureReason::Permanent(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Paging {
    pub offset: u32,
    pub limit: u32,
}

/// Body of the listing POST: `{filter: {...}, paging: {offset, limit}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingQuery {
    pub filter: Map<String, JsonValue>,
    pub paging: Paging,
}

impl ListingQuery {
    /// Unset optional criteria are omitted entirely rather than sent as null.
    pub fn from_filter(filter: &Filter) -> Self {
        let mut api_filter = Map::new();
        api_filter.insert("year".to_string(), JsonValue::from(filter.year));
        let optional = [
            ("declarantType", filter.declarant_type),
            ("type", filter.declaration_type),
            ("institutionGroup", filter.institution_group),
            ("institution", filter.institution),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                api_filter.insert(key.to_string(), JsonValue::from(value));
            }
        }
        Self {
            filter: api_filter,
            paging: Paging {
                offset: filter.offset,
                limit: clamp_limit(filter.limit),
            },
        }
    }
}

#[async_trait]
pub trait DeclarationsApi: Send + Sync {
    /// One page of the filtered declarations listing, as returned by the API.
    async fn list(&self, query: &ListingQuery) -> Result<JsonValue, AdapterError>;

    /// Full detail document for one declaration.
    async fn detail(&self, id: DeclarationId) -> Result<JsonValue, AdapterError>;
}

#[derive(Debug)]
pub struct HttpDeclarationsApi {
    http: HttpFetcher,
    base_url: String,
}

impl HttpDeclarationsApi {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl DeclarationsApi for HttpDeclarationsApi {
    async fn list(&self, query: &ListingQuery) -> Result<JsonValue, AdapterError> {
        let url = format!("{}/declarations", self.base_url);
        let payload = serde_json::to_value(query)
            .map_err(|e| AdapterError::Message(format!("encoding listing query: {e}")))?;
        Ok(self.http.post_json(&url, &payload).await?)
    }

    async fn detail(&self, id: DeclarationId) -> Result<JsonValue, AdapterError> {
        let url = format!("{}/declaration/{id}", self.base_url);
        Ok(self.http.get_json(&url).await?)
    }
}

/// Listed declarations plus their ids, in listing order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Listing {
    pub declarations: Vec<Declaration>,
    pub ids: Vec<DeclarationId>,
}

impl Listing {
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.declarations.len()
    }
}

/// Issues the listing query for `filter`.
///
/// Fails soft: cancellation before the call or any request failure yields an empty
/// listing. A non-empty `retry_ids` narrows the response to exactly those ids.
pub async fn list_declarations(
    api: &dyn DeclarationsApi,
    filter: &Filter,
    cancel: &CancellationToken,
) -> Listing {
    if cancel.is_cancelled() {
        return Listing::default();
    }

    let query = ListingQuery::from_filter(filter);
    let response = match api.list(&query).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, year = filter.year, "declaration listing failed");
            return Listing::default();
        }
    };

    let items: &[JsonValue] = match response.get("data").and_then(JsonValue::as_array) {
        Some(items) => items.as_slice(),
        None => &[],
    };

    let mut listing = Listing::default();
    for item in items {
        let declaration: Declaration = match serde_json::from_value(item.clone()) {
            Ok(declaration) => declaration,
            Err(err) => {
                warn!(error = %err, "skipping listed declaration without an integer id");
                continue;
            }
        };
        if filter.is_retry() && !filter.retry_ids.contains(&declaration.id) {
            continue;
        }
        listing.ids.push(declaration.id);
        listing.declarations.push(declaration);
    }
    debug!(listed = items.len(), kept = listing.len(), "declaration listing parsed");
    listing
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Key/index chain locating a section inside a detail document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionPath(Vec<PathSegment>);

impl SectionPath {
    /// Parses `['data']['sections'][2]['value']`-style paths; all-digit segments are indices.
    pub fn parse(text: &str) -> Result<Self, AdapterError> {
        let re = Regex::new(r#"\[['"]?(.+?)['"]?\]"#)
            .map_err(|e| AdapterError::Message(e.to_string()))?;
        let segments = re
            .captures_iter(text)
            .map(|caps| {
                let raw = &caps[1];
                if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
                    raw.parse()
                        .map(PathSegment::Index)
                        .map_err(|_| AdapterError::InvalidPath(raw.to_string()))
                } else {
                    Ok(PathSegment::Key(raw.to_string()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        if segments.is_empty() {
            return Err(AdapterError::InvalidPath(text.to_string()));
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    /// Walks the document; a missing key, wrong container type or out-of-range index yields `None`.
    pub fn resolve(&self, mut value: JsonValue) -> Option<JsonValue> {
        for segment in &self.0 {
            let next = match segment {
                PathSegment::Key(key) => value.get_mut(key.as_str())?,
                PathSegment::Index(index) => value.get_mut(*index)?,
            };
            value = next.take();
        }
        Some(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionEntry {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SectionCatalogFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    sections: Vec<SectionEntry>,
}

/// Named section paths available to collection jobs.
#[derive(Debug, Clone)]
pub struct SectionCatalog {
    entries: Vec<SectionEntry>,
}

impl SectionCatalog {
    pub fn builtin() -> Self {
        Self::from_yaml_str(DEFAULT_SECTIONS_YAML).expect("embedded sections.yaml is valid")
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: SectionCatalogFile = serde_yaml::from_str(text).context("parsing section catalog")?;
        for entry in &file.sections {
            SectionPath::parse(&entry.path)
                .with_context(|| format!("section {:?} has an invalid path", entry.name))?;
        }
        Ok(Self {
            entries: file.sections,
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn entries(&self) -> &[SectionEntry] {
        &self.entries
    }

    /// Looks up a section by name; a value starting with `[` is taken as an inline path.
    pub fn resolve(&self, section: &str) -> Result<SectionPath, AdapterError> {
        let section = section.trim();
        if section.starts_with('[') {
            return SectionPath::parse(section);
        }
        let entry = self
            .entries
            .iter()
            .find(|e| e.name == section)
            .ok_or_else(|| AdapterError::UnknownSection(section.to_string()))?;
        SectionPath::parse(&entry.path)
    }
}

/// Fetches one declaration's detail document and extracts its section.
pub async fn fetch_section(
    api: &dyn DeclarationsApi,
    id: DeclarationId,
    path: &SectionPath,
) -> Result<Section, AdapterError> {
    let document = api.detail(id).await?;
    let raw = path.resolve(document).ok_or(AdapterError::SectionNotFound)?;
    Ok(classify_section(raw))
}

fn is_tabular(value: &JsonValue) -> bool {
    value.as_object().is_some_and(|m| m.contains_key("rows"))
}

fn header_names(items: Option<&JsonValue>) -> Vec<String> {
    let Some(items) = items.and_then(JsonValue::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| match item {
            JsonValue::String(name) => name.clone(),
            other => other
                .get("name")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string)
                .unwrap_or_else(|| synthetic_header(i)),
        })
        .collect()
}

fn synthetic_header(index: usize) -> String {
    format!("col_{}", index + 1)
}

fn title_of(cell: &JsonValue) -> Option<String> {
    cell.get("title")
        .and_then(JsonValue::as_str)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
}

fn into_array(value: Option<JsonValue>) -> Vec<JsonValue> {
    match value {
        Some(JsonValue::Array(items)) => items,
        _ => Vec::new(),
    }
}

/// Determines the runtime shape of a raw section payload.
pub fn classify_section(value: JsonValue) -> Section {
    match value {
        JsonValue::Object(mut map) if map.contains_key("rows") => {
            let headers = header_names(map.get("headerItems"));
            let rows = into_array(map.remove("rows"));
            Section::Tabular(Table { headers, rows })
        }
        JsonValue::Object(mut map) if map.contains_key("cells") => {
            let cells = into_array(map.remove("cells"))
                .into_iter()
                .map(|cell| Cell {
                    title: title_of(&cell),
                    value: cell.get("value").cloned().unwrap_or(JsonValue::Null),
                })
                .collect();
            Section::Cells { cells }
        }
        JsonValue::Array(rows) => Section::Rows { rows },
        _ => Section::Absent,
    }
}

/// Section-level headers plus raw rows, ready for per-row extraction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizedSection {
    pub headers: Vec<String>,
    pub rows: Vec<JsonValue>,
}

impl NormalizedSection {
    /// Pairs every row with its effective headers: the section headers when present,
    /// otherwise the row's own. Missing trailing values become null.
    pub fn normalized_rows(&self) -> Vec<NormalizedRow> {
        self.rows
            .iter()
            .map(|row| {
                let (row_headers, mut values) = extract_row_values(row);
                let headers = if self.headers.is_empty() {
                    row_headers
                } else {
                    self.headers.clone()
                };
                values.resize(values.len().max(headers.len()), JsonValue::Null);
                NormalizedRow(headers.into_iter().zip(values).collect())
            })
            .collect()
    }
}

/// Converts a section into `(headers, rows)`; unsupported shapes degrade to empty.
pub fn normalize(section: &Section) -> NormalizedSection {
    match section {
        Section::Tabular(table) => NormalizedSection {
            headers: table.headers.clone(),
            rows: table.rows.clone(),
        },
        Section::Cells { cells } => cells
            .iter()
            .find(|cell| is_tabular(&cell.value))
            .map(|cell| match classify_section(cell.value.clone()) {
                Section::Tabular(table) => NormalizedSection {
                    headers: table.headers,
                    rows: table.rows,
                },
                _ => NormalizedSection::default(),
            })
            .unwrap_or_default(),
        Section::Rows { rows } => NormalizedSection {
            headers: Vec::new(),
            rows: rows.clone(),
        },
        Section::Absent => NormalizedSection::default(),
    }
}

/// Headers and values of a single row: a bare list gets `col_1..col_n`, a cell list
/// uses each cell's title (falling back to `col_i`). Anything else is empty.
pub fn extract_row_values(row: &JsonValue) -> (Vec<String>, Vec<JsonValue>) {
    match row {
        JsonValue::Array(values) => (
            (0..values.len()).map(synthetic_header).collect(),
            values.clone(),
        ),
        JsonValue::Object(map) => match map.get("cells").and_then(JsonValue::as_array) {
            Some(cells) => cells
                .iter()
                .enumerate()
                .map(|(i, cell)| {
                    (
                        title_of(cell).unwrap_or_else(|| synthetic_header(i)),
                        cell.get("value").cloned().unwrap_or(JsonValue::Null),
                    )
                })
                .unzip(),
            None => (Vec::new(), Vec::new()),
        },
        _ => (Vec::new(), Vec::new()),
    }
}

/// Distinct ids in listing order; later duplicates are dropped.
pub fn unique_ids(ids: &[DeclarationId]) -> Vec<DeclarationId> {
    let mut seen = BTreeSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use decl_storage::{BackoffPolicy, HttpClientConfig};
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http_api(base_url: &str) -> HttpDeclarationsApi {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            ..Default::default()
        })
        .expect("client");
        HttpDeclarationsApi::new(http, base_url)
    }

    fn listing_body() -> JsonValue {
        json!({"data": [
            {"id": 1, "name": "Ani", "position": "Minister"},
            {"id": 2, "name": "Aram", "position": "Deputy"},
            {"id": 3, "name": "Gor", "position": "Advisor"}
        ]})
    }

    #[test]
    fn listing_query_omits_unset_criteria() {
        let mut filter = Filter::new("income", 2024);
        filter.institution = Some(12);
        filter.limit = 250;
        let body = serde_json::to_value(ListingQuery::from_filter(&filter)).unwrap();
        assert_eq!(
            body,
            json!({"filter": {"year": 2024, "institution": 12}, "paging": {"offset": 0, "limit": 100}})
        );
    }

    #[test]
    fn path_parsing_handles_keys_and_indices() {
        let path = SectionPath::parse(r#"['data']["sections"][2]['value']"#).unwrap();
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key("data".into()),
                PathSegment::Key("sections".into()),
                PathSegment::Index(2),
                PathSegment::Key("value".into()),
            ]
        );
        assert!(matches!(
            SectionPath::parse("data.sections"),
            Err(AdapterError::InvalidPath(_))
        ));
    }

    #[test]
    fn path_resolution_fails_soft_on_shape_mismatch() {
        let doc = json!({"data": {"sections": [{"value": [1]}, {"value": null}]}});
        let ok = SectionPath::parse("['data']['sections'][0]['value']").unwrap();
        assert_eq!(ok.resolve(doc.clone()), Some(json!([1])));

        let null = SectionPath::parse("['data']['sections'][1]['value']").unwrap();
        assert_eq!(null.resolve(doc.clone()), Some(JsonValue::Null));

        for bad in [
            "['data']['sections'][5]['value']",
            "['data']['missing']",
            "['data'][0]",
            "['data']['sections']['value']",
        ] {
            assert_eq!(SectionPath::parse(bad).unwrap().resolve(doc.clone()), None, "{bad}");
        }
    }

    #[test]
    fn builtin_catalog_resolves_names_and_inline_paths() {
        let catalog = SectionCatalog::builtin();
        assert!(!catalog.entries().is_empty());
        assert!(catalog.resolve("income").is_ok());
        assert!(catalog.resolve("['a'][0]").is_ok());
        assert!(matches!(
            catalog.resolve("nope"),
            Err(AdapterError::UnknownSection(name)) if name == "nope"
        ));
    }

    #[test]
    fn catalog_rejects_invalid_paths() {
        let yaml = "version: 1\nsections:\n  - name: broken\n    path: data.value\n";
        assert!(SectionCatalog::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn tabular_section_normalizes_to_headers_and_rows() {
        let section = classify_section(json!({
            "headerItems": [{"name": "A"}, {"name": "B"}],
            "rows": [[10, 20], [30]]
        }));
        let normalized = normalize(&section);
        assert_eq!(normalized.headers, vec!["A", "B"]);
        let rows = normalized.normalized_rows();
        assert_eq!(
            rows[0].0,
            vec![("A".to_string(), json!(10)), ("B".to_string(), json!(20))]
        );
        assert_eq!(
            rows[1].0,
            vec![("A".to_string(), json!(30)), ("B".to_string(), JsonValue::Null)]
        );
    }

    #[test]
    fn cell_wrapped_section_adopts_first_tabular_cell() {
        let section = classify_section(json!({"cells": [
            {"title": "note", "value": "n/a"},
            {"title": "first", "value": {"headerItems": [{"name": "X"}], "rows": [[1]]}},
            {"title": "second", "value": {"headerItems": [{"name": "Y"}], "rows": [[2]]}}
        ]}));
        assert!(matches!(section, Section::Cells { .. }));
        let normalized = normalize(&section);
        assert_eq!(normalized.headers, vec!["X"]);
        assert_eq!(normalized.rows, vec![json!([1])]);
    }

    #[test]
    fn bare_list_uses_row_level_headers() {
        let section = classify_section(json!([
            {"cells": [{"title": "Owner", "value": "Ani"}, {"value": 5}]},
            ["x", "y"],
            "junk"
        ]));
        let rows = normalize(&section).normalized_rows();
        assert_eq!(
            rows[0].0,
            vec![("Owner".to_string(), json!("Ani")), ("col_2".to_string(), json!(5))]
        );
        assert_eq!(rows[1].headers().collect::<Vec<_>>(), vec!["col_1", "col_2"]);
        assert!(rows[2].0.is_empty());
    }

    #[test]
    fn unexpected_shapes_degrade_to_empty() {
        for raw in [JsonValue::Null, json!("text"), json!(7), json!({"other": 1})] {
            let section = classify_section(raw);
            assert_eq!(section, Section::Absent);
            assert_eq!(normalize(&section), NormalizedSection::default());
        }
        let no_table = classify_section(json!({"cells": [{"value": 1}]}));
        assert_eq!(normalize(&no_table), NormalizedSection::default());
    }

    #[test]
    fn normalization_is_idempotent() {
        let section = classify_section(json!({
            "headerItems": [{"name": "A"}, "B", {}],
            "rows": [[1, 2, 3]]
        }));
        let first = normalize(&section);
        let second = normalize(&section);
        assert_eq!(first, second);
        assert_eq!(first.headers, vec!["A", "B", "col_3"]);
        assert_eq!(first.normalized_rows(), second.normalized_rows());
    }

    #[test]
    fn unique_ids_keep_first_occurrence() {
        assert_eq!(unique_ids(&[3, 1, 3, 2, 1]), vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn lister_posts_filter_and_parses_declarations() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/declarations"))
            .and(body_json(json!({
                "filter": {"year": 2024, "declarantType": 1},
                "paging": {"offset": 0, "limit": 100}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing_body()))
            .expect(1)
            .mount(&server)
            .await;

        let mut filter = Filter::new("income", 2024);
        filter.declarant_type = Some(1);
        let listing =
            list_declarations(&http_api(&server.uri()), &filter, &CancellationToken::new()).await;
        assert_eq!(listing.ids, vec![1, 2, 3]);
        assert_eq!(listing.declarations[1].fields["name"], json!("Aram"));
    }

    #[tokio::test]
    async fn lister_narrows_to_retry_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing_body()))
            .mount(&server)
            .await;

        let mut filter = Filter::new("income", 2024);
        filter.retry_ids = [3, 99].into_iter().collect();
        let listing =
            list_declarations(&http_api(&server.uri()), &filter, &CancellationToken::new()).await;
        assert_eq!(listing.ids, vec![3]);
    }

    #[tokio::test]
    async fn lister_fails_soft_and_honours_preflight_cancel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        let api = http_api(&server.uri());
        let filter = Filter::new("income", 2024);

        assert!(list_declarations(&api, &filter, &CancellationToken::new())
            .await
            .is_empty());

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(list_declarations(&api, &filter, &cancelled).await.is_empty());
    }

    #[tokio::test]
    async fn fetch_section_classifies_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/declaration/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"sections": [{"value": {"headerItems": [{"name": "A"}], "rows": [[1]]}}]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/declaration/2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/declaration/3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
            .mount(&server)
            .await;

        let api = http_api(&server.uri());
        let path = SectionCatalog::builtin().resolve("income").unwrap();

        let section = fetch_section(&api, 1, &path).await.expect("section");
        assert!(matches!(section, Section::Tabular(_)));

        let err = fetch_section(&api, 2, &path).await.unwrap_err();
        assert_eq!(err.failure_reason(), FailureReason::Permanent("API Error 404".into()));

        let err = fetch_section(&api, 3, &path).await.unwrap_err();
        assert_eq!(err.failure_reason(), FailureReason::SectionNotFound);
    }

    #[tokio::test]
    async fn fetch_section_reports_exhausted_retries_and_bad_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/declaration/4"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/declaration/5"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/declaration/6"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..Default::default()
        })
        .expect("client");
        let api = HttpDeclarationsApi::new(http, server.uri());
        let path = SectionCatalog::builtin().resolve("income").unwrap();

        let err = fetch_section(&api, 4, &path).await.unwrap_err();
        assert_eq!(err.failure_reason(), FailureReason::Transient("API Error 503".into()));

        let err = fetch_section(&api, 5, &path).await.unwrap_err();
        assert_eq!(err.failure_reason(), FailureReason::Transient("API Error 429".into()));

        let err = fetch_section(&api, 6, &path).await.unwrap_err();
        assert_eq!(err.failure_reason(), FailureReason::InvalidJson);
    }
}
