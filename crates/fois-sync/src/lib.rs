//! Sync orchestration: configuration, the per-endpoint engine, the sequential
//! runner and the cron daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use fois_api::{build_http_client, DashboardClient, TokenManager};
use fois_storage::{MemorySink, PostgresSink, ServiceAccountAuth, SheetsSink, Sink};
use tracing::info;

mod config;
mod engine;
mod runner;
mod schedule;

pub use config::{load_endpoint_file, ConfigError, SinkKind, SyncConfig};
pub use engine::{EngineSettings, SyncEngine, SyncError, SyncOutcome};
pub use fois_core::SelectError;
pub use runner::{EndpointReport, RunSummary, Runner};
pub use schedule::{build_scheduler, parse_cron_list, run_until_ctrl_c};

pub const CRATE_NAME: &str = "fois-sync";

/// Opens the sink selected by `config.sink`.
pub async fn connect_sink(config: &SyncConfig) -> Result<Arc<dyn Sink>> {
    config.validate_sink()?;
    let sink: Arc<dyn Sink> = match config.sink {
        SinkKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or(ConfigError::Missing("DATABASE_URL"))?;
            Arc::new(
                PostgresSink::connect(url)
                    .await
                    .context("connecting postgres sink")?,
            )
        }
        SinkKind::Sheets => {
            let spreadsheet_id = config
                .spreadsheet_id
                .clone()
                .ok_or(ConfigError::Missing("GSHEET_ID"))?;
            let auth = ServiceAccountAuth::from_file(&config.google_credentials_path)
                .with_context(|| {
                    format!(
                        "loading service account {}",
                        config.google_credentials_path.display()
                    )
                })?;
            let http = build_http_client(&config.http_client_config())
                .context("building sheets http client")?;
            Arc::new(SheetsSink::new(http, spreadsheet_id, Arc::new(auth)))
        }
        SinkKind::Memory => Arc::new(MemorySink::new()),
    };
    info!(sink = sink.describe(), "sink ready");
    Ok(sink)
}

/// Wires the catalog, token session and engine from `config` around `sink`.
pub fn build_runner(config: &SyncConfig, sink: Arc<dyn Sink>) -> Result<Runner> {
    let catalog = config.load_catalog()?;
    let http =
        build_http_client(&config.http_client_config()).context("building upstream http client")?;
    let tokens = TokenManager::new(
        http.clone(),
        config.credentials.clone(),
        config.token_endpoints.clone(),
    );
    let engine = SyncEngine::new(DashboardClient::new(http), config.engine_settings());
    Ok(Runner::new(catalog, engine, tokens, sink).with_call_delay(config.call_delay))
}
