//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p arena_client -- [--addr 127.0.0.1:40000] [--name Player] [--run-secs 30]
//!
//! The client connects, walks its player in a slow circle and logs the
//! replicated world once a second. Without `--run-secs` it runs until the
//! server drops it.

use std::{env, time::Duration};

use anyhow::Context;
use arena_client::{input::InputState, GameClient};
use arena_shared::config::EngineConfig;
use tracing::info;

fn parse_args() -> anyhow::Result<(EngineConfig, Option<u64>)> {
    let mut cfg = EngineConfig::default();
    let mut run_secs = None;
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match (args[i].as_str(), args.get(i + 1)) {
            ("--addr", Some(v)) => cfg.server_addr = v.clone(),
            ("--name", Some(v)) => cfg.player_name = v.clone(),
            ("--config", Some(v)) => cfg = EngineConfig::load(v)?,
            ("--run-secs", Some(v)) => run_secs = Some(v.parse().context("--run-secs")?),
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    Ok((cfg, run_secs))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let (cfg, run_secs) = parse_args()?;
    info!(server = %cfg.server_addr, name = %cfg.player_name, "Starting client");

    let mut client = GameClient::connect(&cfg).await.context("connect")?;
    let mut elapsed = 0u64;
    let mut yaw = 0.0f32;

    while client.is_connected() && run_secs.map_or(true, |limit| elapsed < limit) {
        client.set_input(InputState {
            forward: 1.0,
            right: 0.0,
            yaw,
        });
        client.run_for(Duration::from_secs(1)).await;
        yaw = (yaw + 20.0) % 360.0;
        elapsed += 1;

        let env = client.env();
        let position = env
            .local_player()
            .and_then(|id| env.registry().entity(id))
            .and_then(|e| e.world())
            .map(|w| w.position);
        info!(
            snapshot = ?env.last_snapshot(),
            entities = env.registry().len(),
            ?position,
            "Client status"
        );
    }

    if let Some(reason) = client.kick_reason() {
        info!(%reason, "Kicked by server");
    }
    client.disconnect().await;
    Ok(())
}
