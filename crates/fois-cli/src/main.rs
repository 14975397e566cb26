use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fois_core::EndpointCatalog;
use fois_sync::{
    build_runner, connect_sink, load_endpoint_file, parse_cron_list, run_until_ctrl_c,
    RunSummary, SinkKind, SyncConfig,
};
use tokio::sync::Mutex;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fois-sync")]
#[command(about = "Daily FOIS dashboard extract into Postgres or Google Sheets")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    sync: SyncArgs,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync every endpoint, or one with --endpoint (default)
    Sync(SyncArgs),
    /// Print the endpoint catalog with indices
    List,
    /// Run `sync` on the FOIS_SYNC_CRON schedule until Ctrl-C
    Schedule {
        #[arg(long)]
        sink: Option<SinkKind>,
    },
}

#[derive(Debug, Args, Default)]
struct SyncArgs {
    /// 1-based index, endpoint name, df_ name or URL path key
    #[arg(long)]
    endpoint: Option<String>,

    /// Overrides FOIS_SINK
    #[arg(long)]
    sink: Option<SinkKind>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(err) = init_logging(&cli.log_level) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Some(Commands::Sync(args)) => sync(args).await,
        None => sync(cli.sync).await,
        Some(Commands::List) => {
            list()?;
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Schedule { sink }) => {
            let config = load_config(sink)?;
            let sink = connect_sink(&config).await?;
            let runner = build_runner(&config, sink)?;
            let crons = parse_cron_list(&config.sync_cron);
            run_until_ctrl_c(&crons, Arc::new(Mutex::new(runner))).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn sync(args: SyncArgs) -> Result<ExitCode> {
    let config = load_config(args.sink)?;

    if let Some(key) = &args.endpoint {
        let catalog = config.load_catalog()?;
        if let Err(err) = catalog.resolve(key) {
            eprintln!("error: {err}");
            return Ok(ExitCode::from(2));
        }
    }

    let sink = connect_sink(&config).await?;
    let mut runner = build_runner(&config, sink)?;
    let summary = match &args.endpoint {
        Some(key) => runner.run_by_name_or_index(key).await?,
        None => runner.run_all().await,
    };

    print_summary(&summary);
    Ok(if summary.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Environment (after `.env`) with an optional `--sink` override.
fn load_config(sink: Option<SinkKind>) -> Result<SyncConfig> {
    let sink_override = sink.map(|kind| kind.as_str().to_string());
    SyncConfig::from_lookup(|key| match (key, &sink_override) {
        ("FOIS_SINK", Some(value)) => Some(value.clone()),
        _ => std::env::var(key).ok(),
    })
    .context("loading configuration")
}

fn list() -> Result<()> {
    let catalog = match std::env::var_os("FOIS_ENDPOINTS_FILE") {
        Some(path) => load_endpoint_file(Path::new(&path))?,
        None => EndpointCatalog::builtin(),
    };
    for (idx, endpoint) in catalog.endpoints().iter().enumerate() {
        println!(
            "{}. {:<18} {:<18} {}  ({})",
            idx + 1,
            endpoint.name,
            endpoint.path_key(),
            endpoint.storage_name(),
            endpoint.url
        );
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    for report in &summary.reports {
        match &report.error {
            Some(err) => println!("{:<18} failed       {err}", report.endpoint),
            None => println!(
                "{:<18} {:<12} rows={} {}ms",
                report.endpoint,
                report.status(),
                report.rows_stored(),
                report.elapsed_ms
            ),
        }
    }
    println!(
        "sync complete: run_id={} stored={} skipped={} empty={} non_tabular={} failed={}",
        summary.run_id,
        summary.stored(),
        summary.skipped(),
        summary.empty(),
        summary.non_tabular(),
        summary.failed()
    );
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow::anyhow!("invalid log level: {e}"))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    Ok(())
}
