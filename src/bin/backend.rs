use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{signal, task};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tubegrab::{
    audio::sweep_stale,
    config::load_settings,
    preflight::ensure_not_root,
    server::{AppState, router},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream YouTube downloads over HTTP.")]
struct Cli {
    #[arg(
        long = "config",
        value_name = "PATH",
        help = "Env file to read (default /etc/tubegrab-env, optional)"
    )]
    config: Option<PathBuf>,
    #[arg(long = "host", value_name = "ADDR", help = "Override the listen address")]
    host: Option<String>,
    #[arg(short = 'p', long = "port", value_name = "PORT", help = "Override the listen port")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tubegrab=info")),
        )
        .init();

    let cli = Cli::parse();
    ensure_not_root("tubegrab-server")?;

    let mut settings = load_settings(cli.config.as_deref()).context("loading configuration")?;
    if let Some(host) = cli.host {
        settings.host = host;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }
    settings.toolchain.report_missing();

    let temp_dir = settings.temp_dir.clone();
    let max_age = settings.transfer_timeout;
    let swept = task::spawn_blocking(move || sweep_stale(&temp_dir, max_age))
        .await
        .context("sweeping scratch directory")?;
    if swept > 0 {
        info!(removed = swept, "removed stale scratch entries");
    }

    let addr = (settings.host.clone(), settings.port);
    let app = router(AppState::new(settings));
    let listener = tokio::net::TcpListener::bind((addr.0.as_str(), addr.1))
        .await
        .with_context(|| format!("binding {}:{}", addr.0, addr.1))?;
    info!(host = %addr.0, port = addr.1, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
    info!("shutting down; in-flight downloads are cancelled");
}
