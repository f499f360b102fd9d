// toolora - file processing service
// Serves the tool pipeline over HTTP and sweeps expired artifacts in the background

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use toolora::config::{Args, Config};
use toolora::server::{router, AppState};
use toolora::subprocess::is_installed;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::load(&args).with_context(|| format!("Failed to load configuration from {}", args.config))?;

    if args.validate {
        println!("Configuration is valid");
        return Ok(());
    }

    info!("🧰 Starting toolora");
    info!("   Uploads: {}", config.storage.upload_dir.display());
    info!("   Outputs: {} (ttl {:?})", config.storage.output_dir.display(), config.storage.output_ttl);

    for (program, purpose) in [
        (&config.video.ffmpeg_path, "video tools"),
        (&config.video.ffprobe_path, "video tools"),
        (&config.pdf.qpdf_path, "PDF protect/unlock"),
    ] {
        if !is_installed(program, "--version") {
            warn!("{} not found; {} will fail until it is installed", program.display(), purpose);
        }
    }

    let (state, sweeper) = AppState::from_config(&config).context("Failed to initialize pipeline")?;
    info!(
        "   ✓ {} tools registered, {} video workers",
        state.dispatcher.registry().len(),
        state.video_pool.capacity()
    );

    let shutdown = CancellationToken::new();
    let sweeper_task = sweeper.spawn(shutdown.clone());

    let app = router(state, config.limits.max_request_size);
    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    info!("   ✓ Listening on http://{}", address);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
            signal.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Err(e) = sweeper_task.await {
        warn!("Sweeper task ended abnormally: {}", e);
    }
    info!("👋 toolora stopped");
    Ok(())
}
