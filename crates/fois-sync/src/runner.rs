use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveDate, Utc};
use fois_api::TokenManager;
use fois_core::{Endpoint, EndpointCatalog, SelectError};
use fois_storage::Sink;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::engine::{SyncEngine, SyncOutcome};

#[derive(Debug, Clone, Serialize)]
pub struct EndpointReport {
    pub endpoint: String,
    pub dataset: String,
    pub outcome: Option<SyncOutcome>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl EndpointReport {
    pub fn status(&self) -> &'static str {
        match &self.outcome {
            Some(outcome) => outcome.label(),
            None => "failed",
        }
    }

    pub fn rows_stored(&self) -> usize {
        match &self.outcome {
            Some(SyncOutcome::Stored { rows, .. }) => *rows,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reports: Vec<EndpointReport>,
}

impl RunSummary {
    fn count(&self, status: &str) -> usize {
        self.reports.iter().filter(|r| r.status() == status).count()
    }

    pub fn stored(&self) -> usize {
        self.count("stored")
    }

    pub fn skipped(&self) -> usize {
        self.count("skipped")
    }

    pub fn empty(&self) -> usize {
        self.count("empty")
    }

    pub fn non_tabular(&self) -> usize {
        self.count("non_tabular")
    }

    pub fn failed(&self) -> usize {
        self.count("failed")
    }

    pub fn rows_stored(&self) -> usize {
        self.reports.iter().map(EndpointReport::rows_stored).sum()
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }
}

/// Sequential driver over the endpoint catalog. Owns the token session for the
/// duration of a run and revokes it when the run ends.
pub struct Runner {
    catalog: EndpointCatalog,
    engine: SyncEngine,
    tokens: TokenManager,
    sink: Arc<dyn Sink>,
    call_delay: Duration,
    today: Option<NaiveDate>,
}

impl Runner {
    pub fn new(
        catalog: EndpointCatalog,
        engine: SyncEngine,
        tokens: TokenManager,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            catalog,
            engine,
            tokens,
            sink,
            call_delay: Duration::from_secs(1),
            today: None,
        }
    }

    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    /// Pins the calendar date target dates are computed from.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn catalog(&self) -> &EndpointCatalog {
        &self.catalog
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub async fn run_all(&mut self) -> RunSummary {
        let endpoints = self.catalog.endpoints().to_vec();
        self.run(&endpoints).await
    }

    /// Resolves `key` before any network work; see [`EndpointCatalog::resolve`].
    pub async fn run_by_name_or_index(&mut self, key: &str) -> Result<RunSummary, SelectError> {
        let endpoint = self.catalog.resolve(key)?.clone();
        Ok(self.run(std::slice::from_ref(&endpoint)).await)
    }

    async fn run(&mut self, endpoints: &[Endpoint]) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let today = self.today.unwrap_or_else(|| Local::now().date_naive());
        info!(%run_id, endpoints = endpoints.len(), sink = self.sink.describe(), "sync run started");

        let mut reports = Vec::with_capacity(endpoints.len());
        for (idx, endpoint) in endpoints.iter().enumerate() {
            if idx > 0 && !self.call_delay.is_zero() {
                tokio::time::sleep(self.call_delay).await;
            }

            let started = Instant::now();
            let result = self
                .engine
                .run_endpoint_on(endpoint, &mut self.tokens, self.sink.as_ref(), today)
                .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let report = match result {
                Ok(outcome) => {
                    info!(endpoint = %endpoint.name, status = outcome.label(), elapsed_ms, "endpoint finished");
                    EndpointReport {
                        endpoint: endpoint.name.clone(),
                        dataset: endpoint.storage_name(),
                        outcome: Some(outcome),
                        error: None,
                        elapsed_ms,
                    }
                }
                Err(err) => {
                    error!(endpoint = %endpoint.name, error = %err, elapsed_ms, "endpoint failed");
                    EndpointReport {
                        endpoint: endpoint.name.clone(),
                        dataset: endpoint.storage_name(),
                        outcome: None,
                        error: Some(err.to_string()),
                        elapsed_ms,
                    }
                }
            };
            reports.push(report);
        }

        self.tokens.revoke().await;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            reports,
        };
        info!(
            %run_id,
            stored = summary.stored(),
            skipped = summary.skipped(),
            empty = summary.empty(),
            non_tabular = summary.non_tabular(),
            failed = summary.failed(),
            rows = summary.rows_stored(),
            "sync run finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use crate::testing::{fixed_today, CountingSink, FailingSink, Upstream};
    use fois_api::DashboardClient;
    use fois_core::ZoneFilter;
    use fois_storage::{BackoffPolicy, MemorySink, SinkError};
    use serde_json::json;

    fn runner(upstream: &Upstream, sink: Arc<dyn Sink>) -> Runner {
        let catalog = EndpointCatalog::new(vec![
            upstream.endpoint("fois_indent_data", "pndgindt", ZoneFilter::Column("zone".into())),
            upstream.endpoint("fois_detn_data", "plctresndttn", ZoneFilter::Column("zone".into())),
            upstream.endpoint(
                "fois_od_data",
                "wghtleadntkmfrgt",
                ZoneFilter::AnyOf(vec!["srczone".into(), "dstnzone".into()]),
            ),
        ])
        .expect("catalog");
        let engine = SyncEngine::new(
            DashboardClient::new(upstream.http.clone()),
            EngineSettings {
                zone_code: "WR".into(),
                store_retry: BackoffPolicy::fixed(3, Duration::ZERO),
            },
        );
        Runner::new(catalog, engine, upstream.token_manager(), sink)
            .with_call_delay(Duration::ZERO)
            .with_today(fixed_today())
    }

    #[tokio::test]
    async fn run_all_shares_one_token_and_revokes_it() {
        let upstream = Upstream::start().await;
        upstream.token_ok(3600).await;
        upstream.revoke_ok().await;
        upstream
            .dataset_ok("pndgindt", "16-10-2026", json!([{"zone": "WR", "rakes": 3}]))
            .await;
        upstream
            .dataset_ok("plctresndttn", "16-10-2026", json!([{"zone": "CR"}]))
            .await;
        upstream
            .dataset_ok(
                "wghtleadntkmfrgt",
                "16-10-2026",
                json!([{"srczone": "NR", "dstnzone": "WR", "nmt": 12.5}]),
            )
            .await;

        let sink = Arc::new(MemorySink::new());
        let mut runner = runner(&upstream, sink.clone());
        let summary = runner.run_all().await;

        let statuses: Vec<_> = summary.reports.iter().map(EndpointReport::status).collect();
        assert_eq!(statuses, ["stored", "empty", "stored"]);
        assert_eq!(summary.rows_stored(), 2);
        assert!(!summary.has_failures());
        assert_eq!(runner.tokens().exchange_count(), 1);
        assert!(!runner.tokens().has_token());
        assert_eq!(upstream.revoke_requests().await, 1);
        assert_eq!(
            sink.table_names().await,
            vec!["df_fois_indent_data".to_string(), "df_fois_od_data".to_string()]
        );
    }

    #[tokio::test]
    async fn one_failing_endpoint_does_not_stop_the_rest() {
        let upstream = Upstream::start().await;
        upstream.token_ok(3600).await;
        upstream.revoke_ok().await;
        upstream.dataset_status("pndgindt", 500).await;
        upstream
            .dataset_ok("plctresndttn", "16-10-2026", json!([{"zone": "WR"}]))
            .await;
        upstream
            .dataset_text("wghtleadntkmfrgt", "16-10-2026", "not json at all")
            .await;

        let sink = Arc::new(CountingSink::new(MemorySink::new()));
        let mut runner = runner(&upstream, sink.clone());
        let summary = runner.run_all().await;

        let statuses: Vec<_> = summary.reports.iter().map(EndpointReport::status).collect();
        assert_eq!(statuses, ["failed", "stored", "non_tabular"]);
        assert!(summary.has_failures());
        assert!(summary.reports[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("500")));
        assert_eq!(sink.store_calls(), 1);
        assert_eq!(upstream.revoke_requests().await, 1);
    }

    #[tokio::test]
    async fn exhausted_store_is_recorded_and_the_run_continues() {
        let upstream = Upstream::start().await;
        upstream.token_ok(3600).await;
        upstream.revoke_ok().await;
        upstream
            .dataset_ok("pndgindt", "16-10-2026", json!([{"zone": "WR"}]))
            .await;
        upstream
            .dataset_ok("plctresndttn", "16-10-2026", json!([{"zone": "WR", "hours": 7}]))
            .await;
        upstream
            .dataset_ok(
                "wghtleadntkmfrgt",
                "16-10-2026",
                json!([{"srczone": "WR", "dstnzone": "CR"}]),
            )
            .await;

        let sink = Arc::new(FailingSink::on_store(
            MemorySink::new(),
            "df_fois_indent_data",
            SinkError::Transient("connection refused".into()),
        ));
        let mut runner = runner(&upstream, sink.clone());
        let summary = runner.run_all().await;

        let statuses: Vec<_> = summary.reports.iter().map(EndpointReport::status).collect();
        assert_eq!(statuses, ["failed", "stored", "stored"]);
        assert_eq!(summary.failed(), 1);
        assert!(summary.reports[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("after 3 attempts")));
        assert_eq!(sink.store_attempts(), 3);
        assert_eq!(upstream.dataset_requests("plctresndttn").await, 1);
        assert_eq!(upstream.dataset_requests("wghtleadntkmfrgt").await, 1);
        assert_eq!(upstream.revoke_requests().await, 1);
        assert!(!runner.tokens().has_token());
    }

    #[tokio::test]
    async fn lookup_failure_skips_the_fetch_for_that_endpoint_only() {
        let upstream = Upstream::start().await;
        upstream.token_ok(3600).await;
        upstream.revoke_ok().await;
        upstream
            .dataset_ok("plctresndttn", "16-10-2026", json!([{"zone": "WR"}]))
            .await;

        let sink = Arc::new(FailingSink::on_exists(
            MemorySink::new(),
            "df_fois_detn_data",
            SinkError::Permanent("permission denied".into()),
        ));
        let mut runner = runner(&upstream, sink.clone());
        let summary = runner.run_by_name_or_index("plctresndttn").await.expect("select");

        assert_eq!(summary.failed(), 1);
        assert!(summary.reports[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("existence check on df_fois_detn_data")));
        assert_eq!(upstream.dataset_requests("plctresndttn").await, 0);
        assert_eq!(sink.store_attempts(), 0);
    }

    #[tokio::test]
    async fn second_run_on_the_same_day_skips_everything() {
        let upstream = Upstream::start().await;
        upstream.token_ok(3600).await;
        upstream.revoke_ok().await;
        upstream
            .dataset_ok("plctresndttn", "16-10-2026", json!([{"zone": "WR"}]))
            .await;

        let sink = Arc::new(CountingSink::new(MemorySink::new()));
        let mut runner = runner(&upstream, sink.clone());
        let first = runner.run_by_name_or_index("2").await.expect("select");
        let second = runner
            .run_by_name_or_index("df_fois_detn_data")
            .await
            .expect("select");

        assert_eq!(first.stored(), 1);
        assert_eq!(second.skipped(), 1);
        assert_eq!(sink.store_calls(), 1);
        assert_eq!(upstream.dataset_requests("plctresndttn").await, 1);
    }

    #[tokio::test]
    async fn invalid_selection_fails_before_network() {
        let upstream = Upstream::start().await;
        let mut runner = runner(&upstream, Arc::new(MemorySink::new()));

        for key in ["0", "4", "unknown_data"] {
            let err = runner.run_by_name_or_index(key).await.unwrap_err();
            match key {
                "unknown_data" => assert!(matches!(err, SelectError::Unknown { .. })),
                _ => assert!(matches!(err, SelectError::OutOfRange { len: 3, .. })),
            }
        }
        assert_eq!(upstream.total_requests().await, 0);
    }

    #[tokio::test]
    async fn every_identifier_form_selects_the_same_endpoint() {
        let upstream = Upstream::start().await;
        let runner = runner(&upstream, Arc::new(MemorySink::new()));
        for key in ["2", "fois_detn_data", "df_fois_detn_data", "plctresndttn"] {
            assert_eq!(
                runner.catalog().resolve(key).expect("resolve").name,
                "fois_detn_data"
            );
        }
    }
}
