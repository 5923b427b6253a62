//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p arena_server -- [--config server.json] [--addr 127.0.0.1:40000]
//!                                [--tick-hz 30] [--bots 4] [--run-secs 60]
//!
//! The server listens for clients, runs the fixed timestep simulation and
//! replicates snapshots to every connected peer. Without `--run-secs` it runs
//! until killed.

use std::{env, time::Duration};

use anyhow::Context;
use arena_server::GameServer;
use arena_shared::config::EngineConfig;
use tracing::info;

struct Args {
    cfg: EngineConfig,
    bots: usize,
    run_secs: Option<u64>,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args.get(i + 1).context("--config needs a path")?;
            EngineConfig::load(path)?
        }
        None => EngineConfig::default(),
    };
    let mut bots = 0;
    let mut run_secs = None;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--addr", Some(v)) => cfg.server_addr = v.clone(),
            ("--tick-hz", Some(v)) => cfg.tick_hz = v.parse().context("--tick-hz")?,
            ("--bots", Some(v)) => bots = v.parse().context("--bots")?,
            ("--run-secs", Some(v)) => run_secs = Some(v.parse().context("--run-secs")?),
            ("--config", Some(_)) => {}
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    Ok(Args {
        cfg,
        bots,
        run_secs,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    info!(addr = %args.cfg.server_addr, tick_hz = args.cfg.tick_hz, bots = args.bots, "Starting server");

    let server = GameServer::bind(args.cfg).await.context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");

    if args.bots > 0 {
        server.spawn_bots(args.bots)?;
    }

    match args.run_secs {
        Some(secs) => {
            server
                .run_until(tokio::time::sleep(Duration::from_secs(secs)))
                .await
        }
        None => server.run().await,
    }
}
