use std::path::PathBuf;

use anyhow::anyhow;
use clap::{Parser, ValueEnum};
use gantry_core::runner::{Pipeline, PipelineConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod infra;
mod provider;

use config::Config;

/// An xDS control plane for Gateway API style resources.
///
/// Gantry watches a file containing Gateways, routes, and backends, translates
/// them, and serves the result to a fleet of Envoy proxies over xDS.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// A YAML configuration file.
    #[arg(long, env = "GANTRY_CONFIG")]
    config: Option<PathBuf>,

    /// A YAML file containing the Resource Graph to serve.
    #[arg(long, env = "GANTRY_RESOURCES")]
    resources: PathBuf,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// The log filter to use if RUST_LOG isn't set. Overrides the config file.
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Default)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    init_logging(args.log_format, log_level)?;

    let server = config.server_config()?;
    let pipeline = Pipeline::new();
    let cancel = CancellationToken::new();

    let running = pipeline.start(
        PipelineConfig {
            controller_name: config.controller_name.clone(),
            merge_gateways: config.merge_gateways,
            xds_server: Some(server),
            backoff: config.backoff.clone(),
        },
        infra::LoggingInfraManager,
        &cancel,
    );

    let file_provider = provider::FileProvider {
        path: args.resources,
        controller_name: config.controller_name.clone(),
        gateway_class_name: config.gateway_class_name.clone(),
        poll_interval: config.provider.poll_interval.into(),
    };
    let provider = tokio::spawn(
        file_provider.run(pipeline.stores.provider.clone(), cancel.child_token()),
    );

    shutdown_signal().await;
    tracing::info!("shutting down");

    cancel.cancel();
    running.wait().await;
    provider.await?;

    Ok(())
}

fn init_logging(format: LogFormat, default_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let res = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    res.map_err(|e| anyhow!(e))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(err = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(err = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => (),
        _ = terminate => (),
    }
}
