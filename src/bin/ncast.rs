//! namecast node runner.
//!
//! Usage:
//!   ncast serve --node a --bind 0.0.0.0:7474
//!   ncast serve --node b --bind 0.0.0.0:7475 --seed 10.0.0.1:7474

use std::net::SocketAddr;

use anyhow::Result;
use clap::{Parser, Subcommand};
use namecast::{Registry, RegistryConfig};
use tokio::signal;

#[derive(Parser)]
#[command(name = "ncast", about = "Distributed name registry node", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a registry node until interrupted.
    Serve {
        /// Node identity; its lexicographic rank is the clash-resolution
        /// order across the cluster.
        #[arg(long)]
        node: String,

        /// Address to bind for mesh communication.
        #[arg(long, default_value = "0.0.0.0:7474")]
        bind: SocketAddr,

        /// Listen address of an existing node to join (repeatable).
        #[arg(long)]
        seed: Vec<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    namecast::init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { node, bind, seed } => {
            let mut config = RegistryConfig::new(node).bind_addr(bind);
            for addr in seed {
                config = config.seed(addr);
            }

            let registry = Registry::start(config).await?;
            println!(
                "namecast node '{}' listening on {}",
                registry.node_id(),
                registry
                    .listen_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "<unbound>".to_string())
            );

            signal::ctrl_c().await?;
            registry.stop().await;
        }
    }

    Ok(())
}
