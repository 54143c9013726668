use std::path::PathBuf;

use enlist::config::Configuration;
use enlist::{app, initialize_state, telemetry};
use tokio::signal;

const CONFIG_PATH_ENV: &str = "ENLIST_CONFIG";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let guard = telemetry::init();

    let metrics = match telemetry::setup_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(error = %err, "prometheus recorder not installed");
            None
        },
    };

    // read configuration file. let it in memory.
    let config = Configuration::default()
        .path(std::env::var(CONFIG_PATH_ENV).map(PathBuf::from).unwrap_or_default())
        .read();

    let state = initialize_state(config.clone(), metrics).await?;
    let runner = state.runner.clone();

    let listener = tokio::net::TcpListener::bind(&config.address).await?;
    tracing::info!(address = %config.address, "server started");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Requests are done; let welcome mails leave before exiting.
    let report = runner
        .shutdown(config.runner.shutdown_timeout())
        .await;
    if !report.drained() {
        tracing::error!(pending = report.pending, "exiting with undrained background tasks");
    }

    guard.shutdown();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            },
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
