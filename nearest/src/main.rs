mod config;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use config::{CommonConfig, Config, ConfigError};
use metrics_exporter_statsd::{StatsdBuilder, StatsdError};
use rtt::import::ImportError;
use rtt::{RttError, Service};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(version, about = "Resolves clients to the site with the lowest measured RTT")]
struct Cli {
    #[arg(long, short, default_value = "nearest.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve resolution requests and import triggers over HTTP
    Serve,
    /// Import a single day of RTT data
    ImportDay {
        #[arg(long)]
        date: NaiveDate,
    },
    /// Import the most recent complete day
    ImportDaily,
    /// Import every day since the first day with data
    ImportAll,
    /// Import every day after the last successful import
    CatchUp,
}

#[derive(thiserror::Error, Debug)]
enum MainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Rtt(#[from] RttError),
    #[error("import failed: {0}")]
    Import(#[from] ImportError),
    #[error("could not build statsd recorder: {0}")]
    Statsd(#[from] StatsdError),
    #[error("a metrics recorder is already installed")]
    MetricsRecorder,
    #[error("{0} day(s) failed to import")]
    IncompleteImport(usize),
}

fn init_observability(common: &CommonConfig) -> Result<Option<sentry::ClientInitGuard>, MainError> {
    let sentry_guard = common.logging.as_ref().map(|logging| {
        sentry::init((
            logging.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    let sentry_layer = sentry_guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(sentry_layer)
        .init();

    if let Some(metrics) = &common.metrics {
        let recorder = StatsdBuilder::from(metrics.statsd_host.as_str(), metrics.statsd_port)
            .build(Some("nearest"))?;
        metrics::set_global_recorder(recorder).map_err(|_| MainError::MetricsRecorder)?;
        tracing::info!(
            host = %metrics.statsd_host,
            port = metrics.statsd_port,
            "sending metrics to statsd"
        );
    }
    shared::metrics_defs::describe_all(rtt::metrics_defs::ALL_METRICS);

    Ok(sentry_guard)
}

#[tokio::main]
async fn main() -> Result<(), MainError> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;
    let _sentry = init_observability(&config.common)?;

    let service = Service::build(&config.rtt)?;

    match cli.command {
        CliCommand::Serve => {
            tracing::info!("starting resolver");
            service.serve().await?;
        }
        CliCommand::ImportDay { date } => {
            let report = service.importer()?.import_day(date).await?;
            tracing::info!(day = %report.day, recorded = report.recorded, "import done");
        }
        CliCommand::ImportDaily => {
            let report = service.importer()?.import_daily(Utc::now()).await?;
            tracing::info!(day = %report.day, recorded = report.recorded, "import done");
        }
        CliCommand::ImportAll => {
            let report = service.importer()?.import_all(Utc::now()).await;
            if !report.failed.is_empty() {
                return Err(MainError::IncompleteImport(report.failed.len()));
            }
        }
        CliCommand::CatchUp => {
            let report = service.importer()?.catch_up(Utc::now()).await?;
            if !report.failed.is_empty() {
                return Err(MainError::IncompleteImport(report.failed.len()));
            }
        }
    }

    Ok(())
}
