//! Voice bridge server binary.
//!
//! Reads configuration from the environment, runs the startup canary
//! against the realtime model endpoint, and serves carrier media
//! streams until ctrl-c.

use covevoice::{server, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("covevoice-server starting");

    let config = Config::from_env().map_err(|e| {
        tracing::error!(error = %e, "configuration invalid");
        anyhow::anyhow!("configuration invalid: {e}")
    })?;

    server::run(config).await.map_err(|e| {
        tracing::error!(error = %e, "server exited with error");
        anyhow::anyhow!("server failed: {e}")
    })?;

    tracing::info!("covevoice-server shut down cleanly");
    Ok(())
}
