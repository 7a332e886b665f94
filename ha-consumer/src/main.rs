use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use ha_consumer::config::Config;
use ha_consumer::server::{self, AppState};
use ha_consumer::service::HaConsumerService;

#[tokio::main]
async fn main() -> Result<()> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    tracing_subscriber::registry().with(log_layer).init();

    info!("Starting HA consumer");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;

    info!("Configuration loaded: {:?}", config);

    let metrics = server::setup_metrics_recorder()?;

    let service = HaConsumerService::new(config.clone())
        .await
        .context("Failed to create HA consumer service. Check your Kafka connection and snapshot directory.")?;

    let router = server::router(AppState {
        status: service.status(),
        leadership: service.leadership_notifier(),
    });
    let router = server::with_metrics_routes(router, metrics);

    let bind = config.bind_address();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(router, &bind).await {
            error!("HTTP server stopped: {e:#}");
        }
    });
    info!("Started HTTP server on {}", config.bind_address());

    let result = service.run().await;

    server_handle.abort();

    let summary = result?;
    info!(exit_reason = ?summary.exit_reason, "Shut down cleanly");
    Ok(())
}
