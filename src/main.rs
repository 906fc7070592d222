use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use hearth::config::{Configuration, Secrets};
use hearth::{app, initialize_state, session_layer, telemetry};
use tokio::net::TcpListener;

/// Environment variable overriding the configuration file path.
const CONFIG_PATH_ENV: &str = "HEARTH_CONFIG";
/// How often idle rate limit buckets are dropped.
const LIMITER_PURGE_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let log_filter = telemetry::setup_tracing();

    let config_path = std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_default();
    let config = Configuration::default().path(config_path).read()?;

    if let Some(log_filter) = &log_filter {
        log_filter.set_level(&config.log_level);
    }

    let secrets = Secrets::from_env()?;

    let metrics = if config.metrics {
        Some(telemetry::setup_metrics_recorder()?)
    } else {
        None
    };

    let (state, store) = initialize_state(config.clone(), &secrets, metrics).await?;
    let sessions = session_layer(store, &config.session);

    tokio::spawn(state.limiter.clone().purge_every(LIMITER_PURGE_PERIOD));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(%addr, version = config.version(), "server listening");

    axum::serve(
        listener,
        app(state, sessions).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "cannot listen for shutdown signal");
        }
        tracing::info!("gracefully shutdown");
    })
    .await?;

    Ok(())
}
