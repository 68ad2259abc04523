mod config;
mod directory;
mod error;
mod session;
mod socks;
mod tunnel;

use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Cli, ServerConfig};
use crate::directory::Directory;
use crate::session::SessionStore;
use crate::tunnel::{Forwarder, TunnelContext};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let config = ServerConfig::from_cli(Cli::parse());
    let _log_guard = init_logging(config.log_dir.as_deref());

    let directory = Directory::load(&config.config_path).await?;
    directory.spawn_watcher()?;
    let sessions = SessionStore::new();

    // Binding either listener is the one fatal startup condition.
    let http_listener = TcpListener::bind(config.http_listen_addr).await?;
    let socks_listener = TcpListener::bind(config.socks_listen_addr).await?;
    info!("HTTP tunnel listening on http://{}", config.http_listen_addr);
    info!("SOCKS5 listening on {}", config.socks_listen_addr);

    let ctx = Arc::new(TunnelContext {
        directory: Arc::clone(&directory),
        sessions,
        forwarder: Forwarder::new()?,
    });

    // Both serve loops run until the process is told to stop.
    tokio::select! {
        _ = tunnel::serve(http_listener, ctx) => {}
        _ = socks::serve(socks_listener, directory, config.request_timeout) => {}
        _ = signal::ctrl_c() => info!("shutdown signal received"),
    }

    Ok(())
}

fn init_logging(log_dir: Option<&str>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("domain_tunnel=info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, "server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    guard
}
