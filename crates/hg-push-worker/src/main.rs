use clap::{Parser, ValueEnum};
use hg_push_worker::handler::handler_from_config;
use hg_push_worker::metrics::{self, WorkerMetrics};
use hg_push_worker::reporter::reporter_from_config;
use hg_push_worker::{PushConsumer, Worker, WorkerConfig};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "hg-push-worker")]
#[command(about = "Consumes hg push notifications and hands them to the push handler", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Broker URI
    #[arg(short, long, env = "HG_PUSH_TRANSPORT")]
    transport: Option<String>,

    /// Consecutive failures tolerated before the worker stops
    #[arg(long)]
    max_retries: Option<u32>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    match args.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        WorkerConfig::from_file(config_path)?
    } else {
        tracing::warn!("No config file given, using defaults");
        WorkerConfig::default()
    };

    // Override with CLI args
    if let Some(transport) = args.transport {
        config.transport = transport;
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    config.validate()?;

    let metrics_config = config.metrics.clone().unwrap_or_default();
    let metrics = Arc::new(WorkerMetrics::new(metrics_config.namespace.as_deref())?);
    if let Some(port) = metrics_config.listen_port {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(metrics, port).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    let reporter = reporter_from_config(config.error_reporting.as_ref())?;
    let handler = handler_from_config(&config.handler);

    let consumer = PushConsumer::new(handler, reporter, metrics, config.retry_policy())
        .with_handler_timeout(config.handler_timeout())
        .with_unroutable(config.unroutable);

    let mut worker = Worker::new(config, consumer);
    worker.run(shutdown_signal()).await?;

    tracing::info!("Worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
