use std::net::SocketAddr;

use clap::Parser;
use envconfig::Envconfig;
use ngc_operator::config::OperatorConfig;
use ngc_operator::runtime::{self, RuntimeOptions};
use ngc_operator::init_tracing;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ngc-operator", about = "Reconciles InferenceStack and GatewayBundle objects across clusters")]
struct Args {
    #[arg(long, default_value = "0.0.0.0:8081")]
    metrics_bind_address: SocketAddr,

    #[arg(long, default_value = "0.0.0.0:8082")]
    health_probe_bind_address: SocketAddr,

    /// Run workers only while holding the leader lease
    #[arg(long)]
    leader_elect: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");
    let args = Args::parse();
    let cfg = OperatorConfig::init_from_env()?;
    // Not `?cfg`: it carries the XC token.
    info!(
        ?args,
        workers = cfg.workers,
        registry = ?cfg.registry_mode(),
        resync_secs = cfg.resync_secs,
        "Starting ngc-operator"
    );

    runtime::run_all(
        cfg,
        RuntimeOptions {
            metrics_addr: args.metrics_bind_address,
            probe_addr: args.health_probe_bind_address,
            leader_elect: args.leader_elect,
        },
    )
    .await
}
