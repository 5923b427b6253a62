//! In-process soak run.
//!
//! Usage:
//!   cargo run -p arena_tests --bin soak_runner -- [clients] [bots] [frames]
//!
//! Links one server session with several client sessions through local
//! bridges, drives them for a number of frames with bots fighting players,
//! then checks every client mirrors the server's entity set.

use std::{collections::BTreeSet, sync::Arc, time::Instant};

use anyhow::Context;
use arena_shared::{
    config::EngineConfig,
    entity::{ClassRegistry, DamageOutcome, EntityId, EntityKind},
    net::{NullTransport, Peer, PeerId, Side},
    session::{LocalBridge, SessionTable, SharedSession},
};
use tracing::{info, warn};

fn arg(args: &[String], index: usize, default: usize) -> anyhow::Result<usize> {
    match args.get(index) {
        Some(v) => v.parse().with_context(|| format!("argument {index}: {v:?}")),
        None => Ok(default),
    }
}

fn ids(session: &SharedSession) -> BTreeSet<EntityId> {
    let env = session.lock().unwrap_or_else(|p| p.into_inner());
    env.registry().iter().map(|(_, e)| e.id()).collect()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let clients = arg(&args, 1, 4)?;
    let bots = arg(&args, 2, 8)?;
    let frames = arg(&args, 3, 600)?;

    let cfg = EngineConfig::default();
    let dt = cfg.tick_secs();
    let mut table = SessionTable::new(cfg, ClassRegistry::with_builtin());
    let server = table.create_session("soak", Side::Server, Arc::new(NullTransport))?;

    let mut views = Vec::with_capacity(clients);
    let mut bridges = Vec::with_capacity(clients);
    for i in 0..clients {
        let peer = PeerId(i as u32 + 1);
        let client =
            table.create_session(&format!("view-{i}"), Side::Client, Arc::new(NullTransport))?;
        {
            let mut s = server.lock().unwrap_or_else(|p| p.into_inner());
            let mut c = client.lock().unwrap_or_else(|p| p.into_inner());
            bridges.push(LocalBridge::link(&mut s, &mut c, Peer::new(peer, format!("p{i}")))?);
            s.spawn_player(peer)?;
        }
        views.push(client);
    }

    let mut bot_ids = Vec::with_capacity(bots);
    {
        let mut s = server.lock().unwrap_or_else(|p| p.into_inner());
        for _ in 0..bots {
            let h = s.registry_mut().create(EntityKind::Bot.classname(), None)?;
            if let Some(id) = s.registry().get(h).map(|e| e.id()) {
                s.respawn(id)?;
                bot_ids.push(id);
            }
        }
    }
    info!(clients, bots, frames, "Soak starting");

    let started = Instant::now();
    let mut kills = 0u32;
    for frame in 0..frames {
        {
            let mut s = server.lock().unwrap_or_else(|p| p.into_inner());
            s.step(dt);
            // Every bot shoots a player twice a second.
            if frame % 15 == 0 && clients > 0 {
                for (n, bot) in bot_ids.iter().enumerate() {
                    let peer = PeerId((n % clients) as u32 + 1);
                    let Some(victim) = s.player_of(peer) else { continue };
                    if let Ok(DamageOutcome::Killed(_)) = s.apply_damage(victim, 25, Some(*bot)) {
                        kills += 1;
                        s.respawn(victim)?;
                    }
                }
            }
        }
        for view in &views {
            view.lock().unwrap_or_else(|p| p.into_inner()).step(dt);
        }
    }
    // One more round trip so the last snapshot lands everywhere.
    server.lock().unwrap_or_else(|p| p.into_inner()).step(dt);
    for view in &views {
        view.lock().unwrap_or_else(|p| p.into_inner()).step(dt);
    }

    let expected = ids(&server);
    let mut diverged = 0;
    for (i, view) in views.iter().enumerate() {
        let seen = ids(view);
        if seen != expected {
            diverged += 1;
            warn!(view = i, missing = expected.difference(&seen).count(), extra = seen.difference(&expected).count(), "View diverged");
        }
    }

    let s = server.lock().unwrap_or_else(|p| p.into_inner());
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        ticks = s.lifecycle().tick_count(),
        entities = expected.len(),
        kills,
        think_failures = s.think_failures(),
        diverged,
        "Soak finished"
    );
    anyhow::ensure!(diverged == 0, "{diverged} client views diverged from the server");
    Ok(())
}
