use anyhow::Result;
use clap::{Parser, Subcommand};
use fetchgate_server::config::Config;
use fetchgate_server::{build_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "fetchgate")]
#[command(about = "Concurrency-limited headless-browser fetch gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP gateway.
    Serve,
    /// Check the runtime environment (node/playwright reachable, config
    /// valid, database reachable) without starting the server.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => serve().await,
        Commands::Doctor => doctor().await,
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}

async fn serve() -> Result<()> {
    let config = Config::from_env()?;
    let metrics_handle = fetchgate_server::metrics::install_recorder()?;
    let state = AppState::build(&config, metrics_handle).await?;
    let bind_addr = config.bind_addr.clone();

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(%bind_addr, "fetchgate listening");

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received; draining browsers and proxy state");
            shutdown_state.shutdown().await;
        })
        .await?;

    Ok(())
}


async fn doctor() -> Result<()> {
    let node = fetchgate_engine::shellout::which("node");
    match &node {
        Some(path) => println!("node: found at {}", path.display()),
        None => println!("node: NOT FOUND on PATH (required for the headless browser driver)"),
    }

    match Config::from_env() {
        Ok(config) => {
            println!("config: ok (proxy_type={:?}, max_concurrent_requests={})", config.proxy_type, config.max_concurrent_requests);
            match fetchgate_engine::history::SqliteHistoryStore::connect(&config.database_url).await {
                Ok(_) => println!("database: reachable at {}", config.database_url),
                Err(e) => println!("database: FAILED to connect: {e}"),
            }
        }
        Err(e) => println!("config: FAILED: {e}"),
    }

    Ok(())
}
