use chrono::{Local, NaiveDate};
use fois_api::{AuthError, DashboardClient, FetchError, FetchedBody, TokenManager};
use fois_core::{format_sink_date, Dataset, Endpoint, ResponsePayload, ZoneFilterOutcome};
use fois_storage::{store_with_retry, BackoffPolicy, Sink, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub zone_code: String,
    pub store_retry: BackoffPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            zone_code: "WR".to_string(),
            store_retry: BackoffPolicy::default(),
        }
    }
}

/// What happened to one endpoint on one date. None of these are failures.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// The date is already present in the sink.
    Skipped { date: NaiveDate },
    /// The response was tabular but no row matched the zone.
    Empty { date: NaiveDate, fetched: usize },
    /// The response was not a non-empty array of objects.
    NonTabular {
        date: NaiveDate,
        payload: ResponsePayload,
    },
    Stored {
        date: NaiveDate,
        rows: usize,
        dataset: Dataset,
    },
}

impl SyncOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Skipped { .. } => "skipped",
            Self::Empty { .. } => "empty",
            Self::NonTabular { .. } => "non_tabular",
            Self::Stored { .. } => "stored",
        }
    }

    pub fn date(&self) -> NaiveDate {
        match self {
            Self::Skipped { date }
            | Self::Empty { date, .. }
            | Self::NonTabular { date, .. }
            | Self::Stored { date, .. } => *date,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Fetch(err) if err.is_unauthorized())
    }
}

/// Runs one endpoint end to end against a sink.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    client: DashboardClient,
    settings: EngineSettings,
}

impl SyncEngine {
    pub fn new(client: DashboardClient, settings: EngineSettings) -> Self {
        Self { client, settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn run_endpoint(
        &self,
        endpoint: &Endpoint,
        tokens: &mut TokenManager,
        sink: &dyn Sink,
    ) -> Result<SyncOutcome, SyncError> {
        self.run_endpoint_on(endpoint, tokens, sink, Local::now().date_naive())
            .await
    }

    /// Same as [`SyncEngine::run_endpoint`] with an explicit calendar "today".
    pub async fn run_endpoint_on(
        &self,
        endpoint: &Endpoint,
        tokens: &mut TokenManager,
        sink: &dyn Sink,
        today: NaiveDate,
    ) -> Result<SyncOutcome, SyncError> {
        let date = endpoint.target_date(today);
        let span = info_span!(
            "sync_endpoint",
            endpoint = %endpoint.name,
            date = %format_sink_date(date),
            sink = sink.describe()
        );
        self.sync(endpoint, tokens, sink, date).instrument(span).await
    }

    async fn sync(
        &self,
        endpoint: &Endpoint,
        tokens: &mut TokenManager,
        sink: &dyn Sink,
        date: NaiveDate,
    ) -> Result<SyncOutcome, SyncError> {
        let dataset_name = endpoint.storage_name();

        let already_stored =
            sink.exists(&dataset_name, date)
                .await
                .map_err(|source| StoreError::Lookup {
                    dataset: dataset_name.clone(),
                    source,
                })?;
        if already_stored {
            info!("date already stored, skipping");
            return Ok(SyncOutcome::Skipped { date });
        }

        let query_date = endpoint.format_query_date(date);
        let body = match self.fetch(endpoint, tokens, &query_date).await {
            Err(err) if err.is_unauthorized() => {
                warn!("upstream answered 401, re-authenticating once");
                tokens.invalidate();
                self.fetch(endpoint, tokens, &query_date).await?
            }
            other => other?,
        };

        let payload = body.decode();
        let parsed = match &payload {
            ResponsePayload::Json(value) => Dataset::from_json_records(value),
            ResponsePayload::Text(_) => None,
        };
        let Some(mut dataset) = parsed else {
            warn!(status = body.status, "response is not a table of records");
            return Ok(SyncOutcome::NonTabular { date, payload });
        };

        let fetched = dataset.len();
        match dataset.retain_zone(&endpoint.zone_filter, &self.settings.zone_code) {
            ZoneFilterOutcome::KeptAll => debug!(rows = fetched, "no zone filter"),
            ZoneFilterOutcome::Applied { kept, dropped } => {
                debug!(zone = %self.settings.zone_code, kept, dropped, "zone filter applied")
            }
            ZoneFilterOutcome::ColumnsMissing => warn!(
                columns = ?endpoint.zone_filter.columns(),
                "zone columns absent, keeping all rows"
            ),
        }
        if dataset.is_empty() {
            info!(fetched, zone = %self.settings.zone_code, "no rows for zone");
            return Ok(SyncOutcome::Empty { date, fetched });
        }

        dataset.stamp_date(date);
        let rows =
            store_with_retry(sink, &self.settings.store_retry, &dataset_name, &dataset).await?;
        info!(rows, dataset = %dataset_name, "rows stored");

        Ok(SyncOutcome::Stored {
            date,
            rows,
            dataset,
        })
    }

    async fn fetch(
        &self,
        endpoint: &Endpoint,
        tokens: &mut TokenManager,
        query_date: &str,
    ) -> Result<FetchedBody, SyncError> {
        let token = tokens.ensure_valid_token().await?;
        Ok(self.client.fetch(endpoint, query_date, &token).await?)
    }
}
