//! Client implementation.
//!
//! The client maintains:
//! - A reliable stream (handshake, then reliable router packets)
//! - An unreliable datagram socket (snapshots in, own state out)
//! - A client-side session holding the replicated entities
//! - The latest sampled input, applied to the local player every frame

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, MutexGuard,
    },
    time::Duration,
};

use anyhow::Context;
use arena_shared::{
    config::EngineConfig,
    entity::{ClassRegistry, EntityId},
    net::{ChannelTransport, InboundQueue, OutboundPacket, PeerId, Reliability, Side},
    session::{GameEnvironment, SessionTable, SharedSession},
    transport::{
        read_frame, write_frame, ControlMsg, ReliableConn, UnreliableConn, PROTOCOL_VERSION,
    },
};
use tokio::{
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    sync::mpsc,
    task::JoinSet,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::input::{apply_input, InputState};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// High-level game client.
pub struct GameClient {
    peer: PeerId,
    sessions: SessionTable,
    session: SharedSession,
    session_name: String,
    server_addr: SocketAddr,
    input: InputState,
    connected: Arc<AtomicBool>,
    tasks: JoinSet<()>,
}

impl GameClient {
    /// Connects to a server and performs handshake.
    pub async fn connect(cfg: &EngineConfig) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        info!(server = %server_addr, name = %cfg.player_name, "Connecting to server");

        // Bind UDP first so we can tell the server where to send snapshots.
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let unreliable = Arc::new(UnreliableConn::connect(bind, server_addr).await?);
        let udp_port = unreliable.local_addr()?.port();

        let mut reliable = ReliableConn::connect(server_addr).await?;
        reliable
            .send_control(&ControlMsg::Hello {
                protocol: PROTOCOL_VERSION,
                name: cfg.player_name.clone(),
                udp_port,
            })
            .await?;

        let (peer, session_name) = match reliable.recv_control_timeout(HANDSHAKE_TIMEOUT).await? {
            ControlMsg::Welcome { peer, session, .. } => (peer, session),
            ControlMsg::Reject { reason } => anyhow::bail!("server refused the connection: {reason}"),
            other => anyhow::bail!("expected Welcome, got {other:?}"),
        };

        let (transport, outbound) = ChannelTransport::new();
        let mut sessions = SessionTable::new(cfg.clone(), ClassRegistry::with_builtin());
        let session = sessions
            .create_session(&session_name, Side::Client, Arc::new(transport))
            .context("create client session")?;
        let inbound = {
            let mut env = lock(&session);
            env.set_local_peer(peer);
            env.inbound()
        };

        let connected = Arc::new(AtomicBool::new(true));
        let (reader, writer) = reliable.into_split();
        let mut tasks = JoinSet::new();
        tasks.spawn(read_reliable(reader, inbound.clone(), connected.clone()));
        tasks.spawn(read_unreliable(unreliable.clone(), inbound));
        tasks.spawn(write_outbound(outbound, writer, unreliable, connected.clone()));

        info!(%peer, session = %session_name, "Connected to server");
        Ok(Self {
            peer,
            sessions,
            session,
            session_name,
            server_addr,
            input: InputState::default(),
            connected,
            tasks,
        })
    }

    /// Peer id the server assigned.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// The client-side session. Lock it briefly.
    pub fn session(&self) -> SharedSession {
        self.session.clone()
    }

    pub fn env(&self) -> MutexGuard<'_, GameEnvironment> {
        lock(&self.session)
    }

    /// False once the reliable stream closed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The replicated entity this client controls, once received.
    pub fn local_player(&self) -> Option<EntityId> {
        self.env().local_player()
    }

    pub fn kick_reason(&self) -> Option<String> {
        self.env().kick_reason().map(str::to_string)
    }

    pub fn input(&self) -> InputState {
        self.input
    }

    /// Input used from the next frame on.
    pub fn set_input(&mut self, input: InputState) {
        self.input = input;
    }

    /// Moves the local player by the current input, then advances the
    /// session by `dt`. Returns the number of fixed ticks fired.
    pub fn step(&mut self, dt: f64) -> u32 {
        let mut env = lock(&self.session);
        if let Some(id) = env.local_player() {
            if let Some(world) = env.registry_mut().entity_mut(id).and_then(|e| e.world_mut()) {
                apply_input(world, self.input, dt as f32);
            }
        }
        env.step(dt)
    }

    /// Steps at the session tick rate for `duration` of wall time.
    pub async fn run_for(&mut self, duration: Duration) {
        let tick_secs = self.env().config().tick_secs();
        let mut ticker = time::interval(Duration::from_secs_f64(tick_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = Instant::now() + duration;
        let mut last = Instant::now();
        while Instant::now() < deadline {
            ticker.tick().await;
            let now = Instant::now();
            self.step(now.duration_since(last).as_secs_f64());
            last = now;
            if !self.is_connected() {
                break;
            }
        }
    }

    /// Closes the session and both sockets.
    pub async fn disconnect(mut self) {
        self.sessions.close(&self.session_name);
        self.tasks.shutdown().await;
        self.connected.store(false, Ordering::Release);
        info!(peer = %self.peer, "Disconnected");
    }
}

fn lock(session: &SharedSession) -> MutexGuard<'_, GameEnvironment> {
    session.lock().unwrap_or_else(|p| p.into_inner())
}

async fn read_reliable(mut reader: OwnedReadHalf, inbound: InboundQueue, connected: Arc<AtomicBool>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => inbound.push(None, frame),
            Err(e) => {
                info!(error = %e, "Connection to server closed");
                connected.store(false, Ordering::Release);
                return;
            }
        }
    }
}

async fn read_unreliable(udp: Arc<UnreliableConn>, inbound: InboundQueue) {
    loop {
        match udp.recv().await {
            Ok(datagram) => inbound.push(None, datagram),
            Err(e) => {
                debug!(error = %e, "udp recv failed");
                time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn write_outbound(
    mut outbound: mpsc::UnboundedReceiver<OutboundPacket>,
    mut writer: OwnedWriteHalf,
    udp: Arc<UnreliableConn>,
    connected: Arc<AtomicBool>,
) {
    while let Some(packet) = outbound.recv().await {
        let sent = match packet.reliability {
            Reliability::Reliable => write_frame(&mut writer, &packet.data).await,
            Reliability::Unreliable => udp.send(&packet.data).await,
        };
        if let Err(e) = sent {
            debug!(id = %packet.id, error = %e, "Send to server failed");
            if packet.reliability == Reliability::Reliable {
                connected.store(false, Ordering::Release);
                return;
            }
        }
    }
}
