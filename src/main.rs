use anyhow::{Context, Result};
use feeder::{
    Dispatcher, HttpDownstream,
    config::{self, CONFIG_PATH_VAR},
    queue::rabbitmq::RabbitMq,
};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; the environment may be set some other way.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(ErrorLayer::default())
        .init();

    let config_path = config::config_path();
    let required = std::env::var_os(CONFIG_PATH_VAR).is_some();
    let config = config::load_config(&config_path, required)
        .with_context(|| format!("Failed to load config from {config_path:?}"))?;
    tracing::info!(
        feed = ?config.feed,
        queue = config.queue_name(),
        base_url = %config.base_url,
        concurrency = config.concurrency,
        "Configuration loaded",
    );

    let downstream = HttpDownstream::new(&config.downstream_settings()?)
        .context("Failed to build downstream client")?;
    let queue = RabbitMq::open(config.rabbitmq_settings())
        .await
        .context("Failed to connect to the broker")?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let result = Dispatcher::new(queue, downstream, config.feed)
        .concurrency(config.concurrency)
        .shutdown_grace(config.shutdown_grace())
        .run(cancel)
        .await;

    // The loop itself never fails; a close error is only worth a log line.
    if let Err(error) = result {
        tracing::warn!(?error, "Broker connection did not close cleanly");
    }
    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(?error, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                tracing::error!(?error, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
    cancel.cancel();
}
