mod bootstrap;
mod health;
mod model_client;
mod sweeps;
mod webhook;

use anyhow::Result;
use liaison_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) {
    use liaison_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Config and logging come up before anything can fail loudly.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    // The health listener gets the host part of the bind address and its
    // own port.
    let host = app
        .config
        .server
        .bind_address
        .rsplit_once(':')
        .map(|(host, _)| host.to_string())
        .unwrap_or_else(|| app.config.server.bind_address.clone());
    health::spawn(&host, app.config.server.health_check_port, app.db_pool.clone()).await?;

    let sweep_tasks = sweeps::spawn(
        &app.config.sweeps,
        app.context.clone(),
        app.escalations.clone(),
        app.gate.clone(),
    );

    let router = webhook::router(webhook::AppState {
        orchestrator: app.orchestrator.clone(),
        escalations: app.escalations.clone(),
        gate: app.gate.clone(),
        context: app.context.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&app.config.server.bind_address).await?;
    tracing::info!(
        event_name = "server_started",
        bind_address = %app.config.server.bind_address,
        sweeps = sweep_tasks.len(),
    );

    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown()).await?;

    for task in sweep_tasks {
        task.abort();
    }
    tracing::info!(event_name = "server_stopped");

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(event_name = "shutdown_signal_failed", error = %error);
    }
}
