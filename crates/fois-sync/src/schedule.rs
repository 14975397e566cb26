use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::runner::Runner;

/// Registers one `run_all` job per cron expression. Firings share the runner
/// through the mutex, so a slow run delays the next one instead of overlapping it.
pub async fn build_scheduler(crons: &[String], runner: Arc<Mutex<Runner>>) -> Result<JobScheduler> {
    if crons.is_empty() {
        bail!("FOIS_SYNC_CRON has no cron expressions");
    }
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in crons {
        let runner = runner.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let runner = runner.clone();
            Box::pin(async move {
                let mut runner = runner.lock().await;
                let summary = runner.run_all().await;
                if summary.has_failures() {
                    warn!(run_id = %summary.run_id, failed = summary.failed(), "scheduled run had failures");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%cron, "sync job scheduled");
    }
    Ok(sched)
}

/// Runs the scheduler until Ctrl-C.
pub async fn run_until_ctrl_c(crons: &[String], runner: Arc<Mutex<Runner>>) -> Result<()> {
    let mut sched = build_scheduler(crons, runner).await?;
    sched.start().await.context("starting scheduler")?;
    info!("scheduler running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

/// Splits `FOIS_SYNC_CRON` on `;` so several firings can be configured.
pub fn parse_cron_list(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fois_api::{ClientCredentials, DashboardClient, TokenEndpoints, TokenManager};
    use fois_core::EndpointCatalog;
    use fois_storage::MemorySink;

    use crate::engine::{EngineSettings, SyncEngine};

    fn idle_runner() -> Arc<Mutex<Runner>> {
        let http = reqwest::Client::new();
        let tokens = TokenManager::new(
            http.clone(),
            ClientCredentials::new("id", "secret"),
            TokenEndpoints {
                token_url: "http://127.0.0.1:9/token".into(),
                revoke_url: "http://127.0.0.1:9/revoke".into(),
            },
        );
        let engine = SyncEngine::new(DashboardClient::new(http), EngineSettings::default());
        Arc::new(Mutex::new(Runner::new(
            EndpointCatalog::builtin(),
            engine,
            tokens,
            Arc::new(MemorySink::new()),
        )))
    }

    #[tokio::test]
    async fn empty_cron_list_is_rejected() {
        let crons = parse_cron_list(" ; ");
        let err = build_scheduler(&crons, idle_runner()).await.err().unwrap();
        assert!(err.to_string().contains("FOIS_SYNC_CRON"), "{err:#}");
    }

    #[tokio::test]
    async fn invalid_cron_expression_is_rejected() {
        let crons = vec!["every morning".to_string()];
        let err = build_scheduler(&crons, idle_runner()).await.err().unwrap();
        assert!(format!("{err:#}").contains("every morning"), "{err:#}");
    }

    #[test]
    fn cron_list_splits_on_semicolons() {
        assert_eq!(
            parse_cron_list("0 30 6 * * *; 0 0 18 * * * ;"),
            vec!["0 30 6 * * *".to_string(), "0 0 18 * * *".to_string()]
        );
        assert!(parse_cron_list("  ").is_empty());
    }
}
