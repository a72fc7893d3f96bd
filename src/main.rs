//! Barman Cloud ObjectStore Operator
//!
//! Main entry point for the operator. Sets up the Kubernetes client,
//! runs the ObjectStore controller and the metrics server.

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use barman_cloud_operator::{
    config::{LogFormat, OperatorConfig},
    controllers::{self, Context},
    metrics,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();
    config.validate()?;

    // Initialize tracing
    init_tracing(config.log_format);

    info!("Starting Barman Cloud ObjectStore Operator");

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let shutdown = CancellationToken::new();
    let metrics_port = config.metrics_port;
    let context = Arc::new(Context::new(client.clone(), config, shutdown.clone()));

    // Start metrics server
    let mut metrics_handle = tokio::spawn(metrics::serve(metrics_port, shutdown.clone()));
    info!("Metrics server starting on port {}", metrics_port);

    let mut controller = tokio::spawn(controllers::run(client, context));

    // Handle graceful shutdown
    let mut failure: Option<anyhow::Error> = None;
    tokio::select! {
        result = &mut controller => {
            failure = Some(match result {
                Ok(Ok(())) => anyhow::anyhow!("ObjectStore controller exited unexpectedly"),
                Ok(Err(e)) => e.into(),
                Err(e) => e.into(),
            });
        }
        result = &mut metrics_handle => {
            failure = Some(match result {
                Ok(Ok(())) => anyhow::anyhow!("Metrics server exited unexpectedly"),
                Ok(Err(e)) => e,
                Err(e) => e.into(),
            });
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    // Abort in-flight store calls and let the controller drain
    shutdown.cancel();
    metrics::OPERATOR_HEALTH.set(0.0);
    if !controller.is_finished() {
        match controller.await {
            Ok(Err(e)) => warn!(error = %e, "Controller stopped with an error"),
            Err(e) => warn!(error = %e, "Controller task did not stop cleanly"),
            Ok(Ok(())) => {}
        }
    }

    if let Some(e) = failure {
        error!(error = %e, "Barman Cloud ObjectStore Operator failed");
        return Err(e);
    }
    info!("Barman Cloud ObjectStore Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
