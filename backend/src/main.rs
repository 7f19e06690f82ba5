//! Aido MCP server.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use aido_mcp::{config::Config, create_app_with_state, spawn_session_reaper, state::AppState};

/// Aido - MCP Streamable HTTP server for todo tools
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Interface to bind
    #[arg(long, env = "AIDO_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "AIDO_PORT")]
    port: Option<u16>,

    /// Route serving the MCP endpoint
    #[arg(long, env = "AIDO_MCP_ENDPOINT")]
    endpoint: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "AIDO_LOG_LEVEL")]
    log_level: Option<String>,
}

/// Set up stdout logging, plus a daily rolling file when configured.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_logging(config: &Config) -> Option<WorkerGuard> {
    // Explicit log level wins over RUST_LOG
    let filter = match &config.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let stdout_layer = fmt::layer().with_target(false).compact();

    match &config.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "aido-mcp.log".to_string());
            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .with(
                    fmt::layer()
                        .with_writer(writer)
                        .with_target(false)
                        .with_ansi(false),
                )
                .init();
            info!("Logging to file: {}", path.display());
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration: CLI > env > config files > defaults
    let config = Config::from_figment(args.host, args.port, args.endpoint, args.log_level)?;

    let _log_guard = init_logging(&config);
    info!("Starting Aido MCP server...");

    let state = AppState::new(&config);
    let shutdown = CancellationToken::new();
    let reaper = spawn_session_reaper(state.clone(), shutdown.clone());

    let app = create_app_with_state(state.clone(), config.cors_allowed_origins.clone()).await;

    let addr = config.server_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", listener.local_addr()?);

    // Set up graceful shutdown handler
    let shutdown_signal = {
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down gracefully...");
            shutdown.cancel();
            // Open event streams never finish on their own
            let closed = state.sessions().close_all().await;
            info!("Closed {} MCP session(s)", closed);
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    shutdown.cancel();
    if let Some(reaper) = reaper {
        let _ = reaper.await;
    }
    info!("Server shut down");

    Ok(())
}
