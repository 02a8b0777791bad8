use anyhow::{Context, Result};
use clap::Parser;
use parley::config::{default_config_path, ServerConfig};
use parley::engine::{EngineKind, EngineManager};
use parley::server::{self, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Real-time voice and text conversation server
#[derive(Parser, Debug)]
#[command(name = "parley", version, about)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long)]
    host: Option<String>,

    /// Bind port
    #[arg(long)]
    port: Option<u16>,

    /// Unload image engines after every use
    #[arg(long)]
    low_resource: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    info!("Starting parley");
    info!(
        "LLM {} at {}, low-resource mode: {}",
        config.llm.model, config.llm.host, config.low_resource_mode
    );

    let engines =
        Arc::new(EngineManager::from_config(&config).context("Failed to set up engines")?);
    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config, engines.clone());

    // Warm the interactive engines so the first turn does not pay for loading
    let warmup = engines.clone();
    tokio::spawn(async move {
        for kind in [EngineKind::Stt, EngineKind::Llm, EngineKind::Tts] {
            if let Err(e) = warmup.preload(kind).await {
                warn!("Could not preload {}: {}", kind, e);
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Unloading engines");
    engines.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

/// Defaults, then the config file, then the environment, then flags
fn load_config(args: &Args) -> Result<ServerConfig> {
    let path = args
        .config
        .clone()
        .or_else(|| default_config_path().filter(|p| p.exists()));

    let mut config = match path {
        Some(path) => ServerConfig::load(&path)?,
        None => ServerConfig::default(),
    };
    config.apply_env()?;

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(low_resource) = args.low_resource {
        config.low_resource_mode = low_resource;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
