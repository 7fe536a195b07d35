//! The patchbay broker daemon.
//!
//! Loads the configuration, builds and recovers each agent's fabric, and
//! serves the RPC surface until interrupted. Exits 0 on a clean shutdown
//! and 1 on any startup failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use patchbay::config;
use patchbay::server;
use patchbay::Broker;

#[derive(Debug, Parser)]
#[command(name = "patchbayd", about = "A broker for layer-2 virtual circuits.")]
struct Args {
    /// Configuration file.
    #[arg(short, long, default_value = "patchbay.toml")]
    config: PathBuf,

    /// Listen address, overriding network.config.server.
    #[arg(short, long)]
    listen: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("startup failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(args: Args) -> anyhow::Result<()> {
    let cfg = config::load(&args.config)
        .with_context(|| format!("loading {:?}", args.config))?;
    if let Some(name) = &cfg.program.name {
        info!(program = %name, "configuration loaded");
    }

    let mut networks = Vec::new();
    for agent in &cfg.agents {
        let built = config::build_agent(agent)
            .await
            .with_context(|| format!("building agent {:?}", agent.name))?;
        built
            .fabric
            .recover()
            .await
            .map_err(|fault| anyhow::anyhow!("recovering agent {:?}: {}", agent.name, fault))?;
        networks.push(built.network);
    }
    let broker = Arc::new(Broker::new(networks));

    let addr = args
        .listen
        .or(cfg.network.config.server)
        .context("no listen address (network.config.server or --listen)")?;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    // on interrupt the server closes the accept socket, then tears down
    // every live connection and waits for it
    let interrupted = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received; closing");
    };
    server::serve_with_shutdown(listener, broker, interrupted)
        .await
        .context("accept loop failed")?;
    Ok(())
}
