//! Thin binary exercising `nserf` the way a real deployment would: parse a
//! handful of environment variables (argument parsing is the CLI layer's
//! job, out of scope here), bring up an `Agent`, serve RPC, and run until
//! interrupted.

use nserf::agent::Agent;
use nserf::config::Config;
use nserf::rpc;
use std::net::{SocketAddr, ToSocketAddrs};

fn env_addr(key: &str, default: &str) -> SocketAddr {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| default.parse().expect("valid default address"))
}

fn env_seeds(key: &str) -> Vec<SocketAddr> {
    std::env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .filter(|s| !s.trim().is_empty())
                .filter_map(|s| s.trim().to_socket_addrs().ok().and_then(|mut it| it.next()))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> nserf::Result<()> {
    tracing_subscriber::fmt().with_target(false).with_thread_ids(true).init();

    let mut cfg = Config::default();
    cfg.node_name = std::env::var("NSERF_NODE_NAME").unwrap_or_else(|_| cfg.node_name.clone());
    cfg.bind_addr = env_addr("NSERF_BIND_ADDR", "0.0.0.0:7946");
    cfg.start_join = env_seeds("NSERF_JOIN");
    cfg.snapshot_path = std::env::var("NSERF_SNAPSHOT_PATH").ok();

    let rpc_addr = env_addr("NSERF_RPC_ADDR", "127.0.0.1:7373");

    let agent = Agent::create(cfg)?;
    agent.start().await?;
    tracing::info!(node = %agent.local_member().name, "nserf agent started");

    let rpc_agent = agent.clone();
    tokio::spawn(async move {
        if let Err(e) = rpc::serve(rpc_agent, rpc_addr, None).await {
            tracing::error!(error = %e, "rpc server exited");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("received interrupt, leaving cluster");
    agent.leave().await?;

    Ok(())
}
