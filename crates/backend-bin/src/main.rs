use clap::Parser;
use roomcast_backend_lib::{config::Settings, router, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "roomcast", about = "Multi-process chat room relay server")]
struct Cli {
    /// Path to a TOML config file; without it, config.{toml,yaml,json} and
    /// ROOMCAST_* environment variables are merged over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    let state = match settings.redis_url.clone() {
        Some(url) => {
            tracing::info!(%url, "using redis presence and broadcast transport");
            AppState::with_redis(settings, &url).await?
        },
        None => {
            tracing::warn!(
                "no redis_url configured; presence and broadcasts stay within this process"
            );
            AppState::in_process(settings)?
        },
    };
    let state = Arc::new(state);

    let app = router(state.clone());
    let listener = TcpListener::bind(state.settings.bind_addr).await?;
    tracing::info!(addr = %state.settings.bind_addr, "listening");

    axum::serve(listener, app).await?;

    Ok(())
}
