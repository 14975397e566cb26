//! Google Sheets sink over the v4 REST API: one tab per dataset, header row first.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use fois_core::{format_sink_date, Dataset, TDATE_COLUMN};
use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use crate::{
    aligned_text_rows, classify_reqwest_error, classify_status, unknown_columns, Sink, SinkError,
};

pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const SHEETS_BASE_URL: &str = "https://sheets.googleapis.com";

/// Extra grid space reserved when a tab is created.
const SPARE_ROWS: usize = 10;
const SPARE_COLUMNS: usize = 5;

#[async_trait]
pub trait SheetsAuth: Send + Sync {
    async fn bearer_token(&self) -> Result<String, SinkError>;
}

/// Pre-issued bearer token.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl SheetsAuth for StaticToken {
    async fn bearer_token(&self) -> Result<String, SinkError> {
        Ok(self.0.clone())
    }
}

/// Service-account key file (the `gs_credentials.json` of the deployment).
pub struct ServiceAccountAuth {
    account: CustomServiceAccount,
}

impl ServiceAccountAuth {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref();
        let account = CustomServiceAccount::from_file(path).map_err(|err| {
            SinkError::Permanent(format!(
                "loading service account {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self { account })
    }
}

#[async_trait]
impl SheetsAuth for ServiceAccountAuth {
    async fn bearer_token(&self) -> Result<String, SinkError> {
        let token = self
            .account
            .token(&[SHEETS_SCOPE])
            .await
            .map_err(|err| SinkError::Transient(format!("google token: {err}")))?;
        Ok(token.as_str().to_string())
    }
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

pub struct SheetsSink {
    http: reqwest::Client,
    base_url: String,
    spreadsheet_id: String,
    auth: Arc<dyn SheetsAuth>,
}

impl SheetsSink {
    pub fn new(
        http: reqwest::Client,
        spreadsheet_id: impl Into<String>,
        auth: Arc<dyn SheetsAuth>,
    ) -> Self {
        Self {
            http,
            base_url: SHEETS_BASE_URL.to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            auth,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// `{base}/v4/spreadsheets/{id}{id_suffix}/{segments...}`
    fn url(&self, id_suffix: &str, segments: &[&str]) -> Result<Url, SinkError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| SinkError::Permanent(format!("invalid sheets base url: {err}")))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| SinkError::Permanent("sheets base url cannot be a base".into()))?;
            path.pop_if_empty()
                .extend(["v4", "spreadsheets"])
                .push(&format!("{}{id_suffix}", self.spreadsheet_id))
                .extend(segments);
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<JsonValue>,
    ) -> Result<String, SinkError> {
        let token = self.auth.bearer_token().await?;
        let mut request = self.http.request(method, url.clone()).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let resp = request.send().await.map_err(|err| {
            SinkError::from_disposition(classify_reqwest_error(&err), format!("{url}: {err}"))
        })?;
        let status = resp.status();
        let text = resp.text().await.map_err(|err| {
            SinkError::from_disposition(classify_reqwest_error(&err), format!("{url}: {err}"))
        })?;

        if !status.is_success() {
            return Err(SinkError::from_disposition(
                classify_status(status),
                format!("sheets api http {} for {url}: {text}", status.as_u16()),
            ));
        }
        Ok(text)
    }

    async fn tab_titles(&self) -> Result<Vec<String>, SinkError> {
        let mut url = self.url("", &[])?;
        url.query_pairs_mut()
            .append_pair("fields", "sheets.properties.title");
        let body = self.send(Method::GET, url, None).await?;
        let meta: SpreadsheetMeta = parse(&body)?;
        Ok(meta.sheets.into_iter().map(|s| s.properties.title).collect())
    }

    async fn read_values(&self, tab: &str) -> Result<Vec<Vec<String>>, SinkError> {
        let url = self.url("", &["values", &a1_range(tab)])?;
        let body = self.send(Method::GET, url, None).await?;
        let range: ValueRange = parse(&body)?;
        Ok(range
            .values
            .into_iter()
            .map(|row| row.iter().map(value_text).collect())
            .collect())
    }

    async fn add_tab(&self, tab: &str, rows: usize, columns: usize) -> Result<(), SinkError> {
        let url = self.url(":batchUpdate", &[])?;
        let body = json!({
            "requests": [{
                "addSheet": {
                    "properties": {
                        "title": tab,
                        "gridProperties": {
                            "rowCount": rows + SPARE_ROWS,
                            "columnCount": columns + SPARE_COLUMNS,
                        }
                    }
                }
            }]
        });
        self.send(Method::POST, url, Some(body)).await?;
        info!(tab, "created worksheet");
        Ok(())
    }

    async fn append(&self, tab: &str, values: Vec<Vec<String>>) -> Result<(), SinkError> {
        let mut url = self.url("", &["values", &format!("{}:append", a1_range(tab))])?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        self.send(Method::POST, url, Some(json!({ "values": values })))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Sink for SheetsSink {
    fn describe(&self) -> &str {
        "google-sheets"
    }

    async fn exists(&self, dataset: &str, date: NaiveDate) -> Result<bool, SinkError> {
        if !self.tab_titles().await?.iter().any(|t| t == dataset) {
            debug!(dataset, "worksheet absent");
            return Ok(false);
        }

        let values = self.read_values(dataset).await?;
        let Some((header, rows)) = values.split_first() else {
            return Ok(false);
        };
        let Some(idx) = header.iter().position(|h| h == TDATE_COLUMN) else {
            return Ok(false);
        };

        let wanted = format_sink_date(date);
        Ok(rows
            .iter()
            .any(|row| row.get(idx).map(String::as_str) == Some(wanted.as_str())))
    }

    async fn store(&self, dataset: &str, data: &Dataset) -> Result<usize, SinkError> {
        let fresh = !self.tab_titles().await?.iter().any(|t| t == dataset);
        let header = if fresh {
            self.add_tab(dataset, data.len() + 1, data.columns().len())
                .await?;
            None
        } else {
            self.read_values(dataset)
                .await?
                .into_iter()
                .next()
                .filter(|row| row.iter().any(|cell| !cell.is_empty()))
        };

        let (columns, mut values) = match header {
            Some(existing) => {
                let unknown = unknown_columns(&existing, data);
                if !unknown.is_empty() {
                    return Err(SinkError::SchemaMismatch {
                        table: dataset.to_string(),
                        columns: unknown.into_iter().map(str::to_string).collect(),
                    });
                }
                (existing, Vec::new())
            }
            None => {
                let columns = data.columns().to_vec();
                (columns.clone(), vec![columns])
            }
        };

        let rows = aligned_text_rows(&columns, data);
        let written = rows.len();
        values.extend(
            rows.into_iter()
                .map(|row| row.into_iter().map(Option::unwrap_or_default).collect()),
        );
        self.append(dataset, values).await?;
        info!(tab = dataset, written, "rows appended to worksheet");
        Ok(written)
    }
}

fn parse<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, SinkError> {
    serde_json::from_str(body)
        .map_err(|err| SinkError::Permanent(format!("unexpected sheets response: {err}")))
}

fn value_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// A1 range covering a whole tab; titles outside `[A-Za-z0-9_]` are single-quoted.
fn a1_range(tab: &str) -> String {
    if tab.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        tab.to_string()
    } else {
        format!("'{}'", tab.replace('\'', "''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    const TAB: &str = "df_fois_indent_data";

    fn sink(server: &MockServer) -> SheetsSink {
        SheetsSink::new(
            reqwest::Client::new(),
            "sheet-1",
            Arc::new(StaticToken("gtok".into())),
        )
        .with_base_url(server.uri())
    }

    async fn mount_tabs(server: &MockServer, titles: &[&str]) {
        let sheets: Vec<JsonValue> = titles
            .iter()
            .map(|t| json!({"properties": {"title": t}}))
            .collect();
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/v4/spreadsheets/sheet-1"))
            .and(matchers::query_param("fields", "sheets.properties.title"))
            .and(matchers::header("authorization", "Bearer gtok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sheets": sheets })))
            .mount(server)
            .await;
    }

    async fn mount_values(server: &MockServer, values: JsonValue) {
        Mock::given(matchers::method("GET"))
            .and(matchers::path(format!("/v4/spreadsheets/sheet-1/values/{TAB}")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"range": TAB, "values": values})),
            )
            .mount(server)
            .await;
    }

    fn stamped() -> Dataset {
        let mut data = Dataset::from_json_records(&json!([{"zone": "WR", "rakes": 3}]))
            .expect("tabular");
        data.stamp_date(NaiveDate::from_ymd_opt(2026, 10, 17).expect("date"));
        data
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 17).expect("date")
    }

    #[tokio::test]
    async fn missing_tab_means_not_present() {
        let server = MockServer::start().await;
        mount_tabs(&server, &["Sheet1"]).await;
        assert!(!sink(&server).exists(TAB, date()).await.expect("exists"));
    }

    #[tokio::test]
    async fn finds_date_by_scanning_tdate_column() {
        let server = MockServer::start().await;
        mount_tabs(&server, &[TAB]).await;
        mount_values(
            &server,
            json!([["zone", "TDATE"], ["WR", "2026-10-16"], ["WR", "2026-10-17"]]),
        )
        .await;

        let sink = sink(&server);
        assert!(sink.exists(TAB, date()).await.expect("exists"));
        assert!(!sink
            .exists(TAB, NaiveDate::from_ymd_opt(2026, 10, 18).expect("date"))
            .await
            .expect("exists"));
    }

    #[tokio::test]
    async fn tab_without_tdate_header_is_not_present() {
        let server = MockServer::start().await;
        mount_tabs(&server, &[TAB]).await;
        mount_values(&server, json!([["zone"], ["2026-10-17"]])).await;
        assert!(!sink(&server).exists(TAB, date()).await.expect("exists"));
    }

    #[tokio::test]
    async fn fresh_tab_is_created_with_header_then_rows() {
        let server = MockServer::start().await;
        mount_tabs(&server, &[]).await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/v4/spreadsheets/sheet-1:batchUpdate"))
            .and(matchers::body_json(json!({
                "requests": [{"addSheet": {"properties": {
                    "title": TAB,
                    "gridProperties": {"rowCount": 12, "columnCount": 8}
                }}}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path(format!("/v4/spreadsheets/sheet-1/values/{TAB}:append")))
            .and(matchers::query_param("valueInputOption", "RAW"))
            .and(matchers::body_json(json!({
                "values": [["TDATE", "zone", "rakes"], ["2026-10-17", "WR", "3"]]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let written = sink(&server).store(TAB, &stamped()).await.expect("store");
        assert_eq!(written, 1);
    }

    #[tokio::test]
    async fn existing_tab_gets_rows_in_header_order() {
        let server = MockServer::start().await;
        mount_tabs(&server, &[TAB]).await;
        mount_values(&server, json!([["TDATE", "rakes", "zone"]])).await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path(format!("/v4/spreadsheets/sheet-1/values/{TAB}:append")))
            .and(matchers::body_json(json!({
                "values": [["2026-10-17", "3", "WR"]]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        sink(&server).store(TAB, &stamped()).await.expect("store");
    }

    #[tokio::test]
    async fn existing_header_is_never_widened() {
        let server = MockServer::start().await;
        mount_tabs(&server, &[TAB]).await;
        mount_values(&server, json!([["TDATE", "zone"]])).await;

        let err = sink(&server).store(TAB, &stamped()).await.unwrap_err();
        assert!(matches!(err, SinkError::SchemaMismatch { ref columns, .. } if columns == &["rakes"]));
    }

    #[tokio::test]
    async fn server_errors_are_transient_and_client_errors_are_not() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("backend error"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(matchers::method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let sink = sink(&server);
        assert!(matches!(
            sink.exists(TAB, date()).await,
            Err(SinkError::Transient(_))
        ));
        assert!(matches!(
            sink.exists(TAB, date()).await,
            Err(SinkError::Permanent(_))
        ));
    }

    #[test]
    fn ranges_with_spaces_are_quoted() {
        assert_eq!(a1_range("df_x"), "df_x");
        assert_eq!(a1_range("Raw data"), "'Raw data'");
        assert_eq!(a1_range("it's"), "'it''s'");
    }
}
