use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

mod app;
mod error;
mod flow;
mod http;
mod orchestrate;
mod upstream;

#[derive(Parser)]
#[command(name = "krelay", about = "Multi-protocol AI API gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway.
    Serve {
        /// Listen port (default 8080, or the configured value).
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "krelay_gateway=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { port } => serve(port).await,
    }
}

async fn serve(port_override: Option<u16>) -> anyhow::Result<()> {
    let config = krelay_core::config::ServiceConfig::load(None).unwrap_or_else(|e| {
        tracing::warn!("config load failed ({e}), using defaults");
        krelay_core::config::ServiceConfig::default()
    });

    let accounts = krelay_core::config::load_accounts(&config.accounts_path)?;
    info!(accounts = accounts.len(), path = %config.accounts_path, "accounts loaded");

    let pool = Arc::new(krelay_pool::pool::CredentialPool::new(
        accounts,
        &config.accounts_path,
        config.limits.quota_cooldown_secs,
    ));

    let cancel = CancellationToken::new();
    let maintainer = krelay_pool::maintenance::spawn(pool.clone(), cancel.clone());

    let bind = config.server.bind.clone();
    let port = port_override.unwrap_or(config.server.port);
    let state = Arc::new(app::AppState::new(config, pool));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("krelay gateway listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    let _ = maintainer.await;
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    cancel.cancel();
}
