use clap::{Parser, Subcommand};
use metrics_exporter_statsd::StatsdBuilder;
use std::error::Error;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;

use config::{Config, LoggingConfig, MetricsConfig};

#[derive(Parser)]
#[command(version, about = "Plugin backend bridging the host platform and the on-call service")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the plugin routes and the request proxy
    Run {
        #[arg(long, default_value = "bridge.yaml")]
        config_file_path: PathBuf,
    },
    /// Parse and validate a config file, then exit
    CheckConfig {
        #[arg(long, default_value = "bridge.yaml")]
        config_file_path: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    match cli.command {
        CliCommand::CheckConfig { config_file_path } => {
            let config = Config::from_file(&config_file_path)?;
            println!("{config:#?}");
            Ok(())
        }
        CliCommand::Run { config_file_path } => {
            let config = Config::from_file(&config_file_path)?;
            let _sentry = init_logging(&config.common.logging);
            if let Some(metrics) = &config.common.metrics {
                init_metrics(metrics)?;
            }

            let runtime = tokio::runtime::Runtime::new()?;
            tracing::info!(
                host = %config.bridge.listener.host,
                port = config.bridge.listener.port,
                "starting bridge"
            );
            runtime.block_on(proxy::run(config.bridge))?;
            Ok(())
        }
    }
}

/// Installs the global subscriber. The returned guard flushes Sentry on drop.
fn init_logging(config: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.level.as_deref().unwrap_or("info"))
    });

    let guard = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), Box<dyn Error>> {
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some(config.prefix.as_str()))?;
    metrics::set_global_recorder(recorder)
        .map_err(|e| format!("could not install metrics recorder: {e}"))?;

    shared::metrics_defs::describe_all(directory::metrics_defs::ALL_METRICS);
    shared::metrics_defs::describe_all(proxy::metrics_defs::ALL_METRICS);
    Ok(())
}
