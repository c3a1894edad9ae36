use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dnscached::config::DEFAULT_BIND_ADDR;
use dnscached::resolver::RecursiveResolver;
use dnscached::server;
use tokio::sync::Notify;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Recursive caching DNS daemon.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(short, long, default_value_t = DEFAULT_BIND_ADDR)]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing()?;

    let args = Cli::parse();
    let resolver = Arc::new(RecursiveResolver::new());
    let shutdown = Arc::new(Notify::new());

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            signal_shutdown.notify_one();
        }
    });

    server::run(resolver, args.bind, shutdown).await
}

fn setup_tracing() -> Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
