//! Core domain model for FOIS dashboard sync: endpoints, zone filters and
//! the tabular dataset handed from the API client to the sinks.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;

use chrono::format::{Item, StrftimeItems};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "fois-core";

/// Synthetic business-date column prepended to every stored dataset.
pub const TDATE_COLUMN: &str = "TDATE";

/// Prefix of every sink storage unit (table or tab).
pub const STORAGE_PREFIX: &str = "df_";

/// Placeholder replaced by the bearer token in `auth_header_template`.
pub const TOKEN_PLACEHOLDER: &str = "@token";

/// ISO date format used for `TDATE` at the sink boundary.
pub const SINK_DATE_FORMAT: &str = "%Y-%m-%d";

/// Largest accepted `date_offset_days`.
pub const MAX_DATE_OFFSET_DAYS: i64 = 366;

const DEFAULT_BASE_URL: &str =
    "https://gw.crisapis.indianrail.gov.in/t/fois.cris.in/foisrlydashb/1.0";

/// Which columns carry the operating zone of a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ZoneFilter {
    /// Keep every row.
    #[default]
    KeepAll,
    /// Keep rows whose column equals the zone code.
    Column(String),
    /// Keep rows where any of the columns equals the zone code.
    AnyOf(Vec<String>),
}

impl ZoneFilter {
    pub fn columns(&self) -> Vec<&str> {
        match self {
            Self::KeepAll => Vec::new(),
            Self::Column(column) => vec![column.as_str()],
            Self::AnyOf(columns) => columns.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneFilterOutcome {
    KeptAll,
    Applied { kept: usize, dropped: usize },
    /// None of the filter columns exist in the dataset; rows were left untouched.
    ColumnsMissing,
}

/// Static description of one upstream dashboard endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    #[serde(default = "default_date_offset_days")]
    pub date_offset_days: i64,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    #[serde(default = "default_query_date_param")]
    pub query_date_param: String,
    #[serde(default = "default_auth_header_template")]
    pub auth_header_template: String,
    #[serde(default = "default_headers")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub zone_filter: ZoneFilter,
}

fn default_date_offset_days() -> i64 {
    1
}

fn default_date_format() -> String {
    "%d-%m-%Y".to_string()
}

fn default_query_date_param() -> String {
    "date".to_string()
}

fn default_auth_header_template() -> String {
    format!("Bearer {TOKEN_PLACEHOLDER}")
}

fn default_headers() -> BTreeMap<String, String> {
    BTreeMap::from([("accept".to_string(), "*/*".to_string())])
}

impl Endpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>, zone_filter: ZoneFilter) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            date_offset_days: default_date_offset_days(),
            date_format: default_date_format(),
            query_date_param: default_query_date_param(),
            auth_header_template: default_auth_header_template(),
            headers: default_headers(),
            zone_filter,
        }
    }

    /// Sink storage unit name, e.g. `df_fois_indent_data`.
    pub fn storage_name(&self) -> String {
        format!("{STORAGE_PREFIX}{}", self.name)
    }

    /// Last URL path segment, e.g. `pndgindt`.
    pub fn path_key(&self) -> &str {
        self.url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }

    pub fn target_date(&self, today: NaiveDate) -> NaiveDate {
        today - Duration::days(self.date_offset_days)
    }

    /// Date as sent in the query string. Callers must have validated the format.
    pub fn format_query_date(&self, date: NaiveDate) -> String {
        date.format(&self.date_format).to_string()
    }

    pub fn authorization_header(&self, token: &str) -> String {
        self.auth_header_template.replace(TOKEN_PLACEHOLDER, token)
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.name.trim().is_empty() {
            return Err(CatalogError::MissingName {
                url: self.url.clone(),
            });
        }
        if StrftimeItems::new(&self.date_format).any(|item| matches!(item, Item::Error)) {
            return Err(CatalogError::InvalidDateFormat {
                name: self.name.clone(),
                format: self.date_format.clone(),
            });
        }
        // Time and zone specifiers fail at format time on a bare date.
        let mut sample = String::new();
        if write!(sample, "{}", NaiveDate::default().format(&self.date_format)).is_err() {
            return Err(CatalogError::UnsupportedDateFormat {
                name: self.name.clone(),
                format: self.date_format.clone(),
            });
        }
        if !(0..=MAX_DATE_OFFSET_DAYS).contains(&self.date_offset_days) {
            return Err(CatalogError::DateOffsetOutOfRange {
                name: self.name.clone(),
                days: self.date_offset_days,
            });
        }
        if !self.auth_header_template.contains(TOKEN_PLACEHOLDER) {
            return Err(CatalogError::MissingTokenPlaceholder {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

pub fn format_sink_date(date: NaiveDate) -> String {
    date.format(SINK_DATE_FORMAT).to_string()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("endpoint catalog is empty")]
    Empty,
    #[error("endpoint with url {url} has no name")]
    MissingName { url: String },
    #[error("duplicate endpoint name {0}")]
    DuplicateName(String),
    #[error("endpoint {name}: invalid date format {format:?}")]
    InvalidDateFormat { name: String, format: String },
    #[error("endpoint {name}: date format {format:?} needs fields a calendar date lacks")]
    UnsupportedDateFormat { name: String, format: String },
    #[error("endpoint {name}: date_offset_days {days} is outside 0-{MAX_DATE_OFFSET_DAYS}")]
    DateOffsetOutOfRange { name: String, days: i64 },
    #[error("endpoint {name}: auth header template lacks the {TOKEN_PLACEHOLDER} placeholder")]
    MissingTokenPlaceholder { name: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("endpoint index {key} is out of range (1-{len})")]
    OutOfRange { key: String, len: usize },
    #[error("endpoint '{key}' is not valid; known endpoints: {known}")]
    Unknown { key: String, known: String },
}

/// Ordered, validated set of endpoints known to the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCatalog {
    endpoints: Vec<Endpoint>,
}

impl EndpointCatalog {
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self, CatalogError> {
        if endpoints.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut seen = HashSet::new();
        for endpoint in &endpoints {
            endpoint.validate()?;
            if !seen.insert(endpoint.name.as_str()) {
                return Err(CatalogError::DuplicateName(endpoint.name.clone()));
            }
        }
        Ok(Self { endpoints })
    }

    /// The three FOIS dashboard endpoints the sync was built for.
    pub fn builtin() -> Self {
        let endpoint = |name: &str, path: &str, zone_filter: ZoneFilter| {
            Endpoint::new(name, format!("{DEFAULT_BASE_URL}/{path}"), zone_filter)
        };
        Self {
            endpoints: vec![
                endpoint(
                    "fois_indent_data",
                    "pndgindt",
                    ZoneFilter::Column("zone".into()),
                ),
                endpoint(
                    "fois_detn_data",
                    "plctresndttn",
                    ZoneFilter::Column("zone".into()),
                ),
                endpoint(
                    "fois_od_data",
                    "wghtleadntkmfrgt",
                    ZoneFilter::AnyOf(vec!["srczone".into(), "dstnzone".into()]),
                ),
            ],
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Resolve a 1-based index, endpoint name, `df_` storage name or URL path key.
    pub fn resolve(&self, key: &str) -> Result<&Endpoint, SelectError> {
        let key = key.trim();
        if !key.is_empty() && key.chars().all(|c| c.is_ascii_digit()) {
            return key
                .parse::<usize>()
                .ok()
                .filter(|idx| (1..=self.endpoints.len()).contains(idx))
                .map(|idx| &self.endpoints[idx - 1])
                .ok_or_else(|| SelectError::OutOfRange {
                    key: key.to_string(),
                    len: self.endpoints.len(),
                });
        }

        self.endpoints
            .iter()
            .find(|e| e.name == key || e.storage_name() == key || e.path_key() == key)
            .ok_or_else(|| SelectError::Unknown {
                key: key.to_string(),
                known: self
                    .endpoints
                    .iter()
                    .map(|e| format!("{} ({})", e.name, e.path_key()))
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

/// Storage type inferred for a column from the first batch written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Date,
    Text,
}

impl ColumnType {
    pub fn infer<'a>(column: &str, cells: impl IntoIterator<Item = &'a JsonValue>) -> Self {
        if column == TDATE_COLUMN {
            return Self::Date;
        }

        let mut seen = false;
        let mut all_int = true;
        let mut all_num = true;
        let mut all_bool = true;
        for cell in cells {
            match cell {
                JsonValue::Null => continue,
                JsonValue::Number(n) => {
                    all_bool = false;
                    if n.as_i64().is_none() {
                        all_int = false;
                    }
                }
                JsonValue::Bool(_) => {
                    all_int = false;
                    all_num = false;
                }
                _ => {
                    all_int = false;
                    all_num = false;
                    all_bool = false;
                }
            }
            seen = true;
        }

        match (seen, all_int, all_num, all_bool) {
            (false, ..) => Self::Text,
            (true, true, _, _) => Self::Integer,
            (true, false, true, _) => Self::Float,
            (true, false, false, true) => Self::Boolean,
            _ => Self::Text,
        }
    }
}

/// Raw upstream body that did not decode into a table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ResponsePayload {
    Json(JsonValue),
    Text(String),
}

/// Tabular view of one API response: ordered columns and aligned rows.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Vec<JsonValue>>,
}

impl Dataset {
    /// Rows must have exactly `columns.len()` cells.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<JsonValue>>) -> Self {
        debug_assert!(rows.iter().all(|r| r.len() == columns.len()));
        Self { columns, rows }
    }

    /// Builds a dataset from a non-empty JSON array of objects. Anything else is
    /// not tabular and yields `None`.
    pub fn from_json_records(value: &JsonValue) -> Option<Self> {
        let records = value.as_array()?;
        if records.is_empty() {
            return None;
        }

        let mut objects = Vec::with_capacity(records.len());
        for record in records {
            objects.push(record.as_object()?);
        }

        let mut columns: Vec<String> = Vec::new();
        let mut known = HashSet::new();
        for object in &objects {
            for key in object.keys() {
                if known.insert(key.as_str()) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = objects
            .iter()
            .map(|object| {
                columns
                    .iter()
                    .map(|c| object.get(c).cloned().unwrap_or(JsonValue::Null))
                    .collect()
            })
            .collect();

        Some(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<JsonValue>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column_types(&self) -> Vec<(String, ColumnType)> {
        self.columns
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let ty = ColumnType::infer(name, self.rows.iter().map(|row| &row[idx]));
                (name.clone(), ty)
            })
            .collect()
    }

    pub fn retain_zone(&mut self, filter: &ZoneFilter, zone: &str) -> ZoneFilterOutcome {
        let wanted = filter.columns();
        if wanted.is_empty() {
            return ZoneFilterOutcome::KeptAll;
        }

        let indices: Vec<usize> = wanted.iter().filter_map(|c| self.column_index(c)).collect();
        if indices.is_empty() {
            return ZoneFilterOutcome::ColumnsMissing;
        }

        let before = self.rows.len();
        self.rows.retain(|row| {
            indices
                .iter()
                .any(|&idx| matches!(&row[idx], JsonValue::String(s) if s == zone))
        });
        ZoneFilterOutcome::Applied {
            kept: self.rows.len(),
            dropped: before - self.rows.len(),
        }
    }

    /// Prepends `TDATE` (ISO formatted) to every row, replacing any upstream column of
    /// the same name.
    pub fn stamp_date(&mut self, date: NaiveDate) {
        if let Some(idx) = self.column_index(TDATE_COLUMN) {
            self.columns.remove(idx);
            for row in &mut self.rows {
                row.remove(idx);
            }
        }

        let stamp = JsonValue::String(format_sink_date(date));
        self.columns.insert(0, TDATE_COLUMN.to_string());
        for row in &mut self.rows {
            row.insert(0, stamp.clone());
        }
    }

    /// Cells rendered as text for sinks; `None` for JSON null.
    pub fn text_rows(&self) -> impl Iterator<Item = Vec<Option<String>>> + '_ {
        self.rows
            .iter()
            .map(|row| row.iter().map(cell_to_text).collect())
    }
}

pub fn cell_to_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}
