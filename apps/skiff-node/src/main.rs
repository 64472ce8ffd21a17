mod node;
mod registry;
mod sandbox;
mod supervisor;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use skiff_core::transport::webrtc::WebRtcConfig;
use tokio::sync::watch;

use node::{Node, NodeConfig};
use sandbox::{SandboxConfig, SandboxExecutor};

#[derive(Parser, Debug)]
#[command(name = "skiff-node", about = "Compute node: executes sealed tasks in a sandbox")]
struct Cli {
    /// Rendezvous relay to register with.
    #[arg(long, env = "SKIFF_RELAY_URL", default_value = "http://localhost:10000")]
    relay_url: String,

    /// Container image tasks run in.
    #[arg(long, env = "SKIFF_SANDBOX_IMAGE", default_value = "python:3.11-slim")]
    sandbox_image: String,

    /// Wall-clock limit per task, in seconds.
    #[arg(long, env = "SKIFF_TASK_TIMEOUT_SECS", default_value_t = 30)]
    task_timeout_secs: u64,

    /// Run tasks directly on the host when no container runtime is
    /// available. Only for trusted environments.
    #[arg(long, env = "SKIFF_ALLOW_UNSANDBOXED")]
    allow_unsandboxed: bool,

    /// STUN servers for transport negotiation (repeatable).
    #[arg(long = "stun-server", env = "SKIFF_STUN_SERVERS", value_delimiter = ',')]
    stun_servers: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init()?;
    let cli = Cli::parse();

    let sandbox_config = SandboxConfig {
        image: cli.sandbox_image,
        task_timeout: Duration::from_secs(cli.task_timeout_secs),
        allow_unsandboxed: cli.allow_unsandboxed,
        ..SandboxConfig::default()
    };
    let executor = Arc::new(SandboxExecutor::probe(sandbox_config).await);

    let mut webrtc = WebRtcConfig::default();
    if !cli.stun_servers.is_empty() {
        webrtc.stun_servers = cli.stun_servers;
    }

    let node = Node::new(
        NodeConfig {
            relay_url: cli.relay_url,
            webrtc,
        },
        executor,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(target = "node", "interrupt received");
            let _ = shutdown_tx.send(true);
        }
    });

    node.run(shutdown_rx).await.context("node terminated")
}
