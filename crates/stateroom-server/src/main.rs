//! Standalone stateroom server.
//!
//! Runs the shared-state coordination service as its own process, for
//! deployments where workers attach to a long-lived server instead of one
//! launched by their own parent. The bound address is printed on stdout
//! as `STATE_ADDR=host:port` so a supervising process can read it.

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use stateroom_core::StateServer;

#[derive(Parser, Debug)]
#[command(name = "stateroom-server")]
#[command(about = "Shared-state coordination server")]
#[command(version)]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("starting stateroom server");

    let mut handle = StateServer::bind(&format!("{}:{}", args.host, args.port)).await?;

    // Intentional stdout: the supervising process scans for this line.
    println!("STATE_ADDR={}", handle.addr());

    info!("state server running on {}", handle.addr());

    wait_for_shutdown().await;
    info!("shutdown signal received, exiting");
    handle.shutdown();

    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
