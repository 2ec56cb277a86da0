use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{fs, signal};
use tracing::{error, info, warn};
use vidtoast::{
    config::{DEFAULT_CONFIG_PATH, EnvConfig, load_server_config},
    server::{AppState, router},
    telemetry::init_tracing,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve, upload and list vidtoast videos.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the env-style config file")]
    config: PathBuf,
    #[arg(long = "host", value_name = "ADDR", help = "Address to bind (default 0.0.0.0)")]
    host: Option<String>,
    #[arg(short = 'p', long = "port", value_name = "PORT", help = "Port to listen on (default 10000)")]
    port: Option<u16>,
    #[arg(
        long = "upload-dir",
        value_name = "PATH",
        help = "Directory holding uploaded videos and thumbnails (default ./uploads)"
    )]
    upload_dir: Option<PathBuf>,
    #[arg(
        long = "database",
        value_name = "PATH",
        help = "SQLite metadata database (default ./vidtoast.db)"
    )]
    database: Option<PathBuf>,
    #[arg(
        long = "log-level",
        value_name = "FILTER",
        default_value = "info",
        help = "Log filter used when RUST_LOG is unset"
    )]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> EnvConfig {
        EnvConfig {
            host: self.host.clone(),
            port: self.port,
            upload_dir: self.upload_dir.clone(),
            database_path: self.database.clone(),
            ..EnvConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let config = load_server_config(&cli.config, cli.overrides())?;
    let thumbnails_dir = config.thumbnails_dir();
    fs::create_dir_all(&thumbnails_dir)
        .await
        .with_context(|| format!("creating {}", thumbnails_dir.display()))?;

    let state = AppState::from_config(&config).context("initializing metadata store")?;
    if let Err(err) = config.media_tools.check_available().await {
        warn!(error = %err, "ffmpeg/ffprobe unavailable; uploads will fail until installed");
    }

    let database = state.store().path().to_path_buf();
    let app = router(state, config.max_upload_bytes);

    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(
        %addr,
        upload_dir = %config.upload_dir.display(),
        database = %database.display(),
        "server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
}
