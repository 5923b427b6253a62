//! Dedicated server.
//!
//! Wraps one authoritative [`GameEnvironment`] in real sockets:
//! - TCP: JSON handshake, then reliable router packets as frames
//! - UDP: unreliable router packets, one per datagram
//!
//! Transport tasks never touch entities. They push inbound bytes into the
//! session's queue and the tick loop routes them during early-update, so all
//! gameplay stays on the fixed timestep.
//!
//! Determinism notes:
//! - Keep simulation in a fixed timestep.
//! - Avoid wall-clock-dependent branching in gameplay code.
//! - Use stable ordering when iterating collections.

use std::{
    collections::HashMap,
    future::Future,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use anyhow::Context;
use arena_shared::{
    config::EngineConfig,
    entity::{ClassRegistry, EntityId, EntityKind},
    net::{ChannelTransport, OutboundPacket, Peer, PeerId, Reliability, Side, Target},
    session::{GameEnvironment, SessionTable, SharedSession, KICK_PACKET, SESSION_PORT},
    transport::{
        read_frame, write_frame, ControlMsg, ReliableConn, ReliableListener, MAX_DATAGRAM_LEN,
        PROTOCOL_VERSION,
    },
};
use bytes::Bytes;
use tokio::{
    net::{tcp::OwnedWriteHalf, UdpSocket},
    sync::mpsc,
    task::JoinSet,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// Name of the session every connecting client joins.
pub const MAIN_SESSION: &str = "main";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Where to deliver packets for one connected peer.
struct PeerLink {
    frames: mpsc::UnboundedSender<Bytes>,
    udp_addr: SocketAddr,
}

/// State shared by the tick loop and the transport tasks.
struct Shared {
    cfg: Arc<EngineConfig>,
    session: SharedSession,
    links: Mutex<HashMap<PeerId, PeerLink>>,
    next_peer: AtomicU32,
}

impl Shared {
    fn env(&self) -> MutexGuard<'_, GameEnvironment> {
        lock(&self.session)
    }

    fn links(&self) -> MutexGuard<'_, HashMap<PeerId, PeerLink>> {
        self.links.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn peer_for_addr(&self, addr: SocketAddr) -> Option<PeerId> {
        self.links()
            .iter()
            .find(|(_, link)| link.udp_addr == addr)
            .map(|(id, _)| *id)
    }
}

fn lock(session: &SharedSession) -> MutexGuard<'_, GameEnvironment> {
    session.lock().unwrap_or_else(|p| p.into_inner())
}

/// Game server.
pub struct GameServer {
    shared: Arc<Shared>,
    sessions: SessionTable,
    tcp: ReliableListener,
    udp: Arc<UdpSocket>,
    outbound: mpsc::UnboundedReceiver<OutboundPacket>,
}

impl GameServer {
    /// Binds TCP and UDP on `cfg.server_addr` (same port for both) and
    /// creates the main session.
    pub async fn bind(cfg: EngineConfig) -> anyhow::Result<Self> {
        Self::with_classes(cfg, ClassRegistry::with_builtin()).await
    }

    /// Like [`GameServer::bind`] with a custom class table.
    pub async fn with_classes(cfg: EngineConfig, classes: ClassRegistry) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        // Bind TCP first so an ephemeral port resolves, then put UDP on it.
        let local = tcp.local_addr()?;
        let udp = UdpSocket::bind(local).await.context("udp bind")?;

        let (transport, outbound) = ChannelTransport::new();
        let mut sessions = SessionTable::new(cfg, classes);
        let session = sessions
            .create_session(MAIN_SESSION, Side::Server, Arc::new(transport))
            .context("create main session")?;

        info!(%local, tick_hz = sessions.config().tick_hz, "Server bound");
        Ok(Self {
            shared: Arc::new(Shared {
                cfg: sessions.config().clone(),
                session,
                links: Mutex::new(HashMap::new()),
                next_peer: AtomicU32::new(1),
            }),
            sessions,
            tcp,
            udp: Arc::new(udp),
            outbound,
        })
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.cfg
    }

    /// The authoritative session. Lock it briefly; the tick loop needs it too.
    pub fn session(&self) -> SharedSession {
        self.shared.session.clone()
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Creates `count` server-driven bots.
    pub fn spawn_bots(&self, count: usize) -> anyhow::Result<Vec<EntityId>> {
        let mut env = self.shared.env();
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let handle = env
                .registry_mut()
                .create(EntityKind::Bot.classname(), None)
                .context("spawn bot")?;
            let id = env.registry().get(handle).map(|e| e.id());
            if let Some(id) = id {
                env.respawn(id).context("respawn bot")?;
                ids.push(id);
            }
        }
        info!(count = ids.len(), "Bots spawned");
        Ok(ids)
    }

    /// Runs until the process exits.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Runs accept, datagram and tick loops until `shutdown` resolves, then
    /// closes the session and drops every connection.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let GameServer {
            shared,
            mut sessions,
            tcp,
            udp,
            mut outbound,
        } = self;

        let mut tasks = JoinSet::new();
        tasks.spawn(accept_loop(shared.clone(), tcp));
        tasks.spawn(datagram_loop(shared.clone(), udp.clone()));

        let frame = Duration::from_secs_f64(shared.cfg.tick_secs());
        let mut ticker = time::interval(frame);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = Instant::now();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(packet) = outbound.recv() => dispatch(&shared, &udp, packet).await,
                _ = ticker.tick() => {
                    let now = Instant::now();
                    shared.env().step(now.duration_since(last).as_secs_f64());
                    last = now;
                }
            }
        }

        // Deliver what the last tick produced (kicks in particular).
        while let Ok(packet) = outbound.try_recv() {
            dispatch(&shared, &udp, packet).await;
        }
        shared.links().clear();
        sessions.close(MAIN_SESSION);
        tasks.shutdown().await;
        info!("Server stopped");
        Ok(())
    }
}

/// Hands one posted packet to the sockets.
async fn dispatch(shared: &Shared, udp: &UdpSocket, packet: OutboundPacket) {
    let Target::Peers(peers) = &packet.target else {
        debug!(id = %packet.id, "Server-bound packet posted on the server, dropping");
        return;
    };
    let closes = packet.port == SESSION_PORT && packet.id == KICK_PACKET;

    match packet.reliability {
        Reliability::Reliable => {
            let mut links = shared.links();
            for peer in peers {
                if let Some(link) = links.get(peer) {
                    if link.frames.send(packet.data.clone()).is_err() {
                        debug!(%peer, "Writer gone, dropping frame");
                    }
                }
                // The writer drains the kick, then the stream closes.
                if closes {
                    links.remove(peer);
                }
            }
        }
        Reliability::Unreliable => {
            let addrs: Vec<SocketAddr> = {
                let links = shared.links();
                peers
                    .iter()
                    .filter_map(|p| links.get(p).map(|l| l.udp_addr))
                    .collect()
            };
            for addr in addrs {
                if let Err(e) = udp.send_to(&packet.data, addr).await {
                    debug!(%addr, error = %e, "udp send failed");
                }
            }
        }
    }
}

async fn accept_loop(shared: Arc<Shared>, tcp: ReliableListener) {
    let mut connections = JoinSet::new();
    loop {
        match tcp.accept().await {
            Ok((conn, addr)) => {
                let shared = shared.clone();
                connections.spawn(async move {
                    if let Err(e) = serve_connection(shared, conn, addr).await {
                        warn!(%addr, error = %e, "Connection ended with error");
                    }
                });
            }
            Err(e) => warn!(error = %e, "Accept failed"),
        }
        while connections.try_join_next().is_some() {}
    }
}

async fn datagram_loop(shared: Arc<Shared>, udp: Arc<UdpSocket>) {
    let inbound = shared.env().inbound();
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        match udp.recv_from(&mut buf).await {
            Ok((n, from)) => match shared.peer_for_addr(from) {
                Some(peer) => inbound.push(Some(peer), Bytes::copy_from_slice(&buf[..n])),
                None => debug!(%from, "Datagram from unknown address"),
            },
            Err(e) => {
                debug!(error = %e, "udp recv failed");
                time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// Handshake, then pump frames until either side hangs up.
async fn serve_connection(
    shared: Arc<Shared>,
    mut conn: ReliableConn,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let (name, udp_port) = match conn.recv_control_timeout(HANDSHAKE_TIMEOUT).await? {
        ControlMsg::Hello {
            protocol,
            name,
            udp_port,
        } if protocol == PROTOCOL_VERSION => (name, udp_port),
        ControlMsg::Hello { protocol, .. } => {
            let reason = format!("protocol {protocol} unsupported, expected {PROTOCOL_VERSION}");
            conn.send_control(&ControlMsg::Reject {
                reason: reason.clone(),
            })
            .await?;
            anyhow::bail!(reason);
        }
        other => anyhow::bail!("unexpected handshake msg: {other:?}"),
    };

    let blocked = shared.env().is_name_blocked(&name);
    if blocked {
        info!(%addr, %name, "Blocked client refused");
        conn.send_control(&ControlMsg::Reject {
            reason: format!("{name:?} is blocked from this session"),
        })
        .await?;
        return Ok(());
    }

    let peer = PeerId(shared.next_peer.fetch_add(1, Ordering::Relaxed));
    let admitted = {
        let mut env = shared.env();
        env.register_peer(Peer::new(peer, name.clone()))
            .and_then(|()| env.spawn_player(peer).map(|_| ()))
    };
    if let Err(e) = admitted {
        info!(%addr, %peer, error = %e, "Join refused");
        conn.send_control(&ControlMsg::Reject {
            reason: e.to_string(),
        })
        .await?;
        return Ok(());
    }
    conn.send_control(&ControlMsg::Welcome {
        peer,
        session: MAIN_SESSION.to_string(),
        tick_hz: shared.cfg.tick_hz,
    })
    .await?;

    let udp_addr = SocketAddr::new(addr.ip(), udp_port);
    let (mut reader, writer) = conn.into_split();
    let (frames, rx) = mpsc::unbounded_channel();
    shared
        .links()
        .insert(peer, PeerLink { frames, udp_addr });
    let writer = tokio::spawn(write_frames(writer, rx));
    info!(%peer, %name, %udp_addr, "Client connected");

    let inbound = shared.env().inbound();
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => inbound.push(Some(peer), frame),
            Err(e) => {
                debug!(%peer, error = %e, "Reliable stream closed");
                break;
            }
        }
    }

    shared.links().remove(&peer);
    {
        let mut env = shared.env();
        if env.net().roster().contains(peer) {
            env.remove_peer(peer, "disconnected")?;
        }
    }
    writer.abort();
    info!(%peer, "Client disconnected");
    Ok(())
}

async fn write_frames(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(error = %e, "Reliable write failed");
            break;
        }
    }
}

/// Helper for tests: bind to an ephemeral localhost port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(GameServer, EngineConfig)> {
    let cfg = EngineConfig {
        server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).to_string(),
        tick_hz,
        ..Default::default()
    };
    let server = GameServer::bind(cfg.clone()).await?;
    let cfg = EngineConfig {
        server_addr: server.local_addr()?.to_string(),
        ..cfg
    };
    Ok((server, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ephemeral_bind_resolves_the_port() {
        let (server, cfg) = bind_ephemeral(20).await.unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(cfg.server_addr, addr.to_string());
        assert_eq!(server.sessions().len(), 1);
        assert_eq!(lock(&server.session()).side(), Side::Server);
    }

    #[tokio::test]
    async fn bots_spawn_into_the_main_session() {
        let (server, _) = bind_ephemeral(20).await.unwrap();
        let ids = server.spawn_bots(3).unwrap();
        assert_eq!(ids.len(), 3);
        let session = server.session();
        let env = lock(&session);
        assert_eq!(env.registry().all_of_kind(EntityKind::Bot).len(), 3);
    }

    #[tokio::test]
    async fn run_until_closes_the_session() {
        let (server, _) = bind_ephemeral(50).await.unwrap();
        let session = server.session();
        server
            .run_until(time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();
        let env = lock(&session);
        assert!(env.is_closed());
        assert!(env.lifecycle().is_destroyed());
    }

    #[tokio::test]
    async fn wrong_protocol_is_rejected() {
        let (server, cfg) = bind_ephemeral(20).await.unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let run = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        let mut conn = ReliableConn::connect(cfg.server_addr.parse().unwrap())
            .await
            .unwrap();
        conn.send_control(&ControlMsg::Hello {
            protocol: PROTOCOL_VERSION + 1,
            name: "old".into(),
            udp_port: 1,
        })
        .await
        .unwrap();
        let reply = conn.recv_control_timeout(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(reply, ControlMsg::Reject { .. }));

        stop_tx.send(()).unwrap();
        run.await.unwrap().unwrap();
    }
}
