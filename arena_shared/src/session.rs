//! Session environment.
//!
//! A [`GameEnvironment`] is one game session on one side of the wire: its
//! own scheduler, entity registry, packet router and replication state.
//! Sessions are created through a [`SessionTable`], which also runs the
//! "session created" hooks other subsystems use to attach their listeners.
//!
//! Frame order (driven by [`GameEnvironment::step`]):
//! - early-update: route inbound packets, apply snapshots (client)
//! - fixed-tick: flush deferred teardowns, reconcile client states and acks
//!   (server), think, replicate (server) or send own state (client)
//! - late-update: advance remote pose blending (client)

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    config::EngineConfig,
    entity::{ClassRegistry, DamageOutcome, EntityId, EntityKind, Reconciliation, ThinkContext},
    lifecycle::{FixedTick, Lifecycle, TickHandler},
    net::{
        InboundQueue, NetworkContext, NetworkManager, OutboundPacket, Peer, PeerId, Roster,
        RouterError, Side, Target, Transport,
    },
    registry::{EntityHandle, EntityRegistry, RegistryError},
    replication::{ClientReplication, Inbox, ServerReplication},
    signal::{isolated, Connection},
};

pub const SESSION_PORT: &str = "session";
pub const KICK_PACKET: &str = "kick";

/// Session name. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Arc<str>);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session-wide attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("session {0:?} already exists")]
    DuplicateSession(String),
    #[error("{0} is blocked from this session")]
    Blocked(PeerId),
    #[error("{0:?} is blocked from this session")]
    BlockedName(String),
    #[error("{0} is already registered")]
    DuplicatePeer(PeerId),
    #[error("{0} is not registered")]
    UnknownPeer(PeerId),
    #[error("operation is only valid on the {0:?} side")]
    WrongSide(Side),
    #[error("no entity with id {0}")]
    UnknownEntity(EntityId),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Router(#[from] RouterError),
}

enum Replication {
    Server(ServerReplication),
    Client(ClientReplication),
}

/// Everything a session owns besides its scheduler. Receives the
/// scheduler's phases.
struct SessionWorld {
    id: SessionId,
    side: Side,
    config: Arc<EngineConfig>,
    registry: EntityRegistry,
    net: NetworkManager,
    session_ctx: Arc<NetworkContext>,
    replication: Replication,
    players: HashMap<PeerId, EntityId>,
    blocked: HashSet<PeerId>,
    /// Peer ids change on every connection; names survive a reconnect.
    blocked_names: HashSet<String>,
    attributes: BTreeMap<String, AttrValue>,
    damage_enabled: bool,
    time: f64,
    kicks: Inbox<String>,
    kick_reason: Option<String>,
    kick_listener: Connection,
    think_failures: u64,
}

impl SessionWorld {
    fn peers(&self) -> Vec<PeerId> {
        self.net.roster().ids()
    }
}

fn reconcile_client_states(
    session: &SessionId,
    registry: &mut EntityRegistry,
    players: &HashMap<PeerId, EntityId>,
    teleport_threshold: f32,
    repl: &ServerReplication,
) {
    for (peer, mut reader) in repl.take_client_states() {
        let Some(&id) = players.get(&peer) else {
            debug!(%session, %peer, "State from a peer without a player");
            continue;
        };
        let Some(entity) = registry.entity_mut(id) else {
            continue;
        };
        match entity.apply_client_state(&mut reader, teleport_threshold) {
            Ok(Reconciliation::Accepted) => {}
            Ok(Reconciliation::Rejected { distance, .. }) => {
                debug!(%session, %peer, distance, "Client position refused");
            }
            Err(e) => warn!(%session, %peer, error = %e, "Dropping malformed client state"),
        }
    }
}

impl TickHandler for SessionWorld {
    fn early_update(&mut self, _dt: f64) {
        self.net.pump();
        for reason in self.kicks.drain() {
            warn!(session = %self.id, %reason, "Kicked by server");
            self.kick_reason = Some(reason);
        }
        if let Replication::Client(repl) = &mut self.replication {
            repl.process(&mut self.registry);
        }
    }

    fn fixed_tick(&mut self, tick: FixedTick) {
        self.registry.flush_teardown();
        self.time += tick.dt;

        if let Replication::Server(repl) = &mut self.replication {
            repl.process_acks();
            reconcile_client_states(
                &self.id,
                &mut self.registry,
                &self.players,
                self.config.teleport_threshold,
                repl,
            );
        }

        let ctx = ThinkContext {
            dt: tick.dt as f32,
            now: self.time,
        };
        self.think_failures += self.registry.think_all(&ctx) as u64;

        let peers = self.peers();
        match &mut self.replication {
            Replication::Server(repl) => {
                repl.on_fixed_tick(tick.tick, &self.registry, &peers);
            }
            Replication::Client(repl) => {
                repl.send_local_state(&self.registry);
            }
        }
    }

    fn late_update(&mut self, dt: f64) {
        if let Replication::Client(repl) = &mut self.replication {
            repl.advance_interpolation(dt as f32, &mut self.registry);
        }
    }
}

/// One game session.
pub struct GameEnvironment {
    lifecycle: Lifecycle,
    world: SessionWorld,
    closed: bool,
}

impl fmt::Debug for GameEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameEnvironment")
            .field("id", &self.world.id)
            .field("side", &self.world.side)
            .field("entities", &self.world.registry.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl GameEnvironment {
    pub fn new(
        id: SessionId,
        side: Side,
        config: Arc<EngineConfig>,
        classes: Arc<ClassRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, SessionError> {
        let mut net = NetworkManager::new(side, transport, Roster::new());
        let session_ctx = net.context(SESSION_PORT, None)?;
        let replication = match side {
            Side::Server => Replication::Server(ServerReplication::new(
                &mut net,
                config.snapshot_history,
                config.snapshot_interval_ticks,
            )?),
            Side::Client => Replication::Client(ClientReplication::new(
                &mut net,
                config.tick_secs() as f32,
                config.snapshot_history,
            )?),
        };

        let kicks = Inbox::default();
        let kick_listener = match side {
            Side::Client => {
                let inbox = kicks.clone();
                session_ctx.listen(KICK_PACKET, move |mut p| {
                    let reason = p.reader.read_str().unwrap_or_default();
                    inbox.push(reason);
                })?
            }
            Side::Server => Connection::detached(),
        };

        let mut lifecycle = Lifecycle::new(config.tick_hz);
        lifecycle.start();
        info!(session = %id, ?side, tick_hz = config.tick_hz, "Session created");

        Ok(Self {
            lifecycle,
            world: SessionWorld {
                registry: EntityRegistry::new(id.clone(), classes),
                id,
                side,
                config,
                net,
                session_ctx,
                replication,
                players: HashMap::new(),
                blocked: HashSet::new(),
                blocked_names: HashSet::new(),
                attributes: BTreeMap::new(),
                damage_enabled: true,
                time: 0.0,
                kicks,
                kick_reason: None,
                kick_listener,
                think_failures: 0,
            },
            closed: false,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.world.id
    }

    pub fn side(&self) -> Side {
        self.world.side
    }

    pub fn config(&self) -> &EngineConfig {
        &self.world.config
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.world.registry
    }

    pub fn registry_mut(&mut self) -> &mut EntityRegistry {
        &mut self.world.registry
    }

    pub fn net(&self) -> &NetworkManager {
        &self.world.net
    }

    pub fn net_mut(&mut self) -> &mut NetworkManager {
        &mut self.world.net
    }

    /// Where transports deliver inbound data.
    pub fn inbound(&self) -> InboundQueue {
        self.world.net.inbound()
    }

    /// Session time in seconds, advanced by fixed ticks.
    pub fn time(&self) -> f64 {
        self.world.time
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Entity think panics caught so far.
    pub fn think_failures(&self) -> u64 {
        self.world.think_failures
    }

    /// Advances one frame. Returns the number of fixed ticks fired.
    pub fn step(&mut self, dt: f64) -> u32 {
        if self.closed {
            return 0;
        }
        self.lifecycle.step(dt, &mut self.world)
    }

    /// Adds an authenticated peer to the roster.
    pub fn register_peer(&mut self, peer: Peer) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        if self.world.blocked.contains(&peer.id) {
            warn!(session = %self.world.id, peer = %peer.id, "Blocked peer tried to join");
            return Err(SessionError::Blocked(peer.id));
        }
        if self.world.blocked_names.contains(&peer.name) {
            warn!(session = %self.world.id, peer = %peer.id, name = %peer.name, "Blocked name tried to join");
            return Err(SessionError::BlockedName(peer.name));
        }
        let id = peer.id;
        if !self.world.net.roster().insert(peer) {
            return Err(SessionError::DuplicatePeer(id));
        }
        info!(session = %self.world.id, peer = %id, "Peer registered");
        Ok(())
    }

    /// Kicks a peer: sends the reason, destroys its player and forgets it.
    pub fn remove_peer(&mut self, peer: PeerId, reason: &str) -> Result<(), SessionError> {
        if !self.world.net.roster().contains(peer) {
            return Err(SessionError::UnknownPeer(peer));
        }
        if self.world.side == Side::Server {
            match self.world.session_ctx.packet(KICK_PACKET) {
                Ok(mut packet) => match packet.body().write_str(reason) {
                    Ok(_) => {
                        packet.to([peer]).send();
                    }
                    Err(e) => warn!(%peer, error = %e, "Kick reason not sent"),
                },
                Err(e) => error!(%peer, error = %e, "Failed to build kick packet"),
            }
        }
        if let Some(id) = self.world.players.remove(&peer) {
            if let Some(handle) = self.world.registry.by_id(id) {
                self.world.registry.destroy(handle)?;
            }
        }
        if let Replication::Server(repl) = &mut self.world.replication {
            repl.forget_peer(peer);
        }
        self.world.net.roster().remove(peer);
        info!(session = %self.world.id, %peer, %reason, "Peer removed");
        Ok(())
    }

    /// Bars a peer from (re)joining, removing it if present. A registered
    /// peer's name is barred too, so a reconnect under a fresh id is refused.
    pub fn block(&mut self, peer: PeerId, reason: &str) -> Result<(), SessionError> {
        self.world.blocked.insert(peer);
        if let Some(known) = self.world.net.roster().get(peer) {
            self.world.blocked_names.insert(known.name);
            self.remove_peer(peer, reason)?;
        }
        Ok(())
    }

    /// Bars a name without a live connection.
    pub fn block_name(&mut self, name: impl Into<String>) {
        self.world.blocked_names.insert(name.into());
    }

    pub fn unblock(&mut self, peer: PeerId) -> bool {
        self.world.blocked.remove(&peer)
    }

    pub fn unblock_name(&mut self, name: &str) -> bool {
        self.world.blocked_names.remove(name)
    }

    pub fn is_blocked(&self, peer: PeerId) -> bool {
        self.world.blocked.contains(&peer)
    }

    pub fn is_name_blocked(&self, name: &str) -> bool {
        self.world.blocked_names.contains(name)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: AttrValue) {
        self.world.attributes.insert(key.into(), value);
    }

    pub fn attribute(&self, key: &str) -> Option<&AttrValue> {
        self.world.attributes.get(key)
    }

    pub fn attributes(&self) -> &BTreeMap<String, AttrValue> {
        &self.world.attributes
    }

    pub fn damage_enabled(&self) -> bool {
        self.world.damage_enabled
    }

    pub fn set_damage_enabled(&mut self, enabled: bool) {
        self.world.damage_enabled = enabled;
    }

    /// Server only: creates (or recreates) the player entity a peer controls.
    pub fn spawn_player(&mut self, peer: PeerId) -> Result<EntityHandle, SessionError> {
        if self.world.side != Side::Server {
            return Err(SessionError::WrongSide(Side::Server));
        }
        let Some(info) = self.world.net.roster().get(peer) else {
            return Err(SessionError::UnknownPeer(peer));
        };
        if let Some(old) = self.world.players.remove(&peer) {
            if let Some(handle) = self.world.registry.by_id(old) {
                self.world.registry.destroy(handle)?;
            }
        }

        let handle = self
            .world
            .registry
            .create(EntityKind::Player.classname(), None)?;
        let now = self.world.time;
        let protection = self.world.config.spawn_protection_secs;
        let entity = self
            .world
            .registry
            .get_mut(handle)
            .ok_or(RegistryError::Stale(handle))?;
        if let Some(player) = entity.player_mut() {
            player.controller = peer.0 as u64;
            player.display_name = info.name.clone();
        }
        if let Some(health) = entity.health_mut() {
            health.respawn(now, protection);
        }
        let id = entity.id();
        self.world.players.insert(peer, id);
        info!(session = %self.world.id, %peer, entity = %id, "Player spawned");
        Ok(handle)
    }

    /// Refills a health entity and grants spawn protection.
    pub fn respawn(&mut self, id: EntityId) -> Result<(), SessionError> {
        let now = self.world.time;
        let protection = self.world.config.spawn_protection_secs;
        let entity = self
            .world
            .registry
            .entity_mut(id)
            .ok_or(SessionError::UnknownEntity(id))?;
        if let Some(health) = entity.health_mut() {
            health.respawn(now, protection);
        }
        Ok(())
    }

    pub fn player_of(&self, peer: PeerId) -> Option<EntityId> {
        self.world.players.get(&peer).copied()
    }

    /// Applies damage under the session's damage switch. A kill credits the
    /// most recent attacker within the credit window.
    pub fn apply_damage(
        &mut self,
        victim: EntityId,
        amount: u16,
        attacker: Option<EntityId>,
    ) -> Result<DamageOutcome, SessionError> {
        let now = self.world.time;
        let enabled = self.world.damage_enabled;
        let window = self.world.config.kill_credit_window_secs;
        let entity = self
            .world
            .registry
            .entity_mut(victim)
            .ok_or(SessionError::UnknownEntity(victim))?;
        let outcome = entity.take_damage(amount, attacker, now, enabled);
        if !matches!(outcome, DamageOutcome::Killed(_)) {
            return Ok(outcome);
        }

        let killer = entity.health().and_then(|h| h.killer(now, window));
        if let Some(player) = entity.player_mut() {
            player.deaths = player.deaths.saturating_add(1);
        }
        if let Some(killer) = killer.filter(|&k| k != victim) {
            if let Some(player) = self
                .world
                .registry
                .entity_mut(killer)
                .and_then(|e| e.player_mut())
            {
                player.kills = player.kills.saturating_add(1);
            }
        }
        info!(session = %self.world.id, %victim, killer = ?killer, "Entity killed");
        Ok(outcome)
    }

    /// Client only: which peer id the server assigned to this client.
    pub fn set_local_peer(&mut self, peer: PeerId) {
        if let Replication::Client(repl) = &mut self.world.replication {
            repl.set_local_peer(peer);
        }
    }

    /// Client only: the entity this client controls, once replicated.
    pub fn local_player(&self) -> Option<EntityId> {
        match &self.world.replication {
            Replication::Client(repl) => repl.local_player(),
            Replication::Server(_) => None,
        }
    }

    /// Client only: last fully applied snapshot version.
    pub fn last_snapshot(&self) -> Option<u32> {
        match &self.world.replication {
            Replication::Client(repl) => repl.last_applied(),
            Replication::Server(repl) => repl.history().latest().map(|s| s.version),
        }
    }

    /// Server only: latest snapshot version `peer` acknowledged.
    pub fn acked_by(&self, peer: PeerId) -> Option<u32> {
        match &self.world.replication {
            Replication::Server(repl) => repl.history().acked(peer),
            Replication::Client(_) => None,
        }
    }

    /// Reason given by the server if it kicked this client.
    pub fn kick_reason(&self) -> Option<&str> {
        self.world.kick_reason.as_deref()
    }

    /// Destroys every entity, drops every peer and stops the scheduler.
    /// Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.world.registry.destroy_all();
        self.world.registry.flush_teardown();
        self.world.players.clear();
        self.world.net.roster().clear();
        self.world.kick_listener.disconnect();
        self.world.net.shutdown();
        self.lifecycle.destroy();
        info!(session = %self.world.id, "Session closed");
    }
}

/// Session shared between the owner's loop and its transport tasks.
pub type SharedSession = Arc<Mutex<GameEnvironment>>;

type SessionHook = Arc<dyn Fn(&mut GameEnvironment) + Send + Sync>;

/// Every live session in the process plus the hooks run on creation.
pub struct SessionTable {
    config: Arc<EngineConfig>,
    classes: Arc<ClassRegistry>,
    sessions: BTreeMap<SessionId, SharedSession>,
    hooks: Vec<SessionHook>,
}

impl SessionTable {
    pub fn new(config: EngineConfig, classes: ClassRegistry) -> Self {
        Self {
            config: Arc::new(config),
            classes: Arc::new(classes),
            sessions: BTreeMap::new(),
            hooks: Vec::new(),
        }
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Runs `hook` on every session created from now on.
    pub fn on_session_created(&mut self, hook: impl Fn(&mut GameEnvironment) + Send + Sync + 'static) {
        self.hooks.push(Arc::new(hook));
    }

    pub fn create_session(
        &mut self,
        id: &str,
        side: Side,
        transport: Arc<dyn Transport>,
    ) -> Result<SharedSession, SessionError> {
        let key = SessionId::from(id);
        if self.sessions.contains_key(&key) {
            return Err(SessionError::DuplicateSession(id.to_string()));
        }
        let mut env = GameEnvironment::new(
            key.clone(),
            side,
            self.config.clone(),
            self.classes.clone(),
            transport,
        )?;
        for hook in &self.hooks {
            isolated("session_created", || hook(&mut env));
        }
        let shared = Arc::new(Mutex::new(env));
        self.sessions.insert(key, shared.clone());
        Ok(shared)
    }

    pub fn get(&self, id: &str) -> Option<SharedSession> {
        self.sessions.get(&SessionId::from(id)).cloned()
    }

    /// Closes and forgets a session.
    pub fn close(&mut self, id: &str) -> bool {
        let Some(session) = self.sessions.remove(&SessionId::from(id)) else {
            return false;
        };
        session.lock().unwrap_or_else(|p| p.into_inner()).close();
        true
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Mirrors a server and a client session living in the same process by
/// feeding each side's posted packets into the other's inbound queue.
pub struct LocalBridge {
    peer: PeerId,
    connections: Vec<Connection>,
}

impl LocalBridge {
    /// Registers `peer` on the server and links the two sessions.
    pub fn link(
        server: &mut GameEnvironment,
        client: &mut GameEnvironment,
        peer: Peer,
    ) -> Result<Self, SessionError> {
        if server.side() != Side::Server {
            return Err(SessionError::WrongSide(Side::Server));
        }
        if client.side() != Side::Client {
            return Err(SessionError::WrongSide(Side::Client));
        }
        let id = peer.id;
        server.register_peer(peer)?;
        client.set_local_peer(id);

        let to_client = client.inbound();
        let down = server.net().posted().connect(move |p: OutboundPacket| {
            if p.target.includes(id) {
                to_client.push(None, p.data);
            }
        });
        let to_server = server.inbound();
        let up = client.net().posted().connect(move |p: OutboundPacket| {
            if p.target == Target::Server {
                to_server.push(Some(id), p.data);
            }
        });
        Ok(Self {
            peer: id,
            connections: vec![down, up],
        })
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn unlink(&self) {
        for c in &self.connections {
            c.disconnect();
        }
    }
}

impl Drop for LocalBridge {
    fn drop(&mut self) {
        self.unlink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NullTransport;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn table() -> SessionTable {
        SessionTable::new(EngineConfig::default(), ClassRegistry::with_builtin())
    }

    fn server(table: &mut SessionTable) -> SharedSession {
        table
            .create_session("srv", Side::Server, Arc::new(NullTransport))
            .unwrap()
    }

    #[test]
    fn hooks_run_on_creation_and_duplicates_fail() {
        let mut t = table();
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        t.on_session_created(move |env| {
            env.set_attribute("mode", AttrValue::Text("ffa".into()));
            r.fetch_add(1, Ordering::SeqCst);
        });
        t.on_session_created(|_| panic!("broken hook"));

        let s = server(&mut t);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            s.lock().unwrap().attribute("mode"),
            Some(&AttrValue::Text("ffa".into()))
        );
        assert!(matches!(
            t.create_session("srv", Side::Client, Arc::new(NullTransport)),
            Err(SessionError::DuplicateSession(_))
        ));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn blocked_peers_cannot_register() {
        let mut t = table();
        let s = server(&mut t);
        let mut env = s.lock().unwrap();
        env.register_peer(Peer::new(PeerId(1), "a")).unwrap();
        assert_eq!(
            env.register_peer(Peer::new(PeerId(1), "a")),
            Err(SessionError::DuplicatePeer(PeerId(1)))
        );
        env.block(PeerId(1), "cheating").unwrap();
        assert!(!env.net().roster().contains(PeerId(1)));
        assert_eq!(
            env.register_peer(Peer::new(PeerId(1), "a")),
            Err(SessionError::Blocked(PeerId(1)))
        );
        // Same name under a fresh id.
        assert!(env.is_name_blocked("a"));
        assert_eq!(
            env.register_peer(Peer::new(PeerId(2), "a")),
            Err(SessionError::BlockedName("a".into()))
        );
        env.register_peer(Peer::new(PeerId(3), "b")).unwrap();
    }

    #[test]
    fn remove_peer_destroys_its_player() {
        let mut t = table();
        let s = server(&mut t);
        let mut env = s.lock().unwrap();
        env.register_peer(Peer::new(PeerId(4), "bob")).unwrap();
        let h = env.spawn_player(PeerId(4)).unwrap();
        let player = env.registry().get(h).unwrap().player().unwrap().clone();
        assert_eq!(player.controller, 4);
        assert_eq!(player.display_name, "bob");

        env.remove_peer(PeerId(4), "bye").unwrap();
        assert!(!env.registry().is_alive(h));
        assert_eq!(env.player_of(PeerId(4)), None);
        assert_eq!(
            env.remove_peer(PeerId(4), "again"),
            Err(SessionError::UnknownPeer(PeerId(4)))
        );
    }

    #[test]
    fn kills_are_credited_and_spawn_protection_holds() {
        let mut t = table();
        let s = server(&mut t);
        let mut env = s.lock().unwrap();
        env.register_peer(Peer::new(PeerId(1), "a")).unwrap();
        env.register_peer(Peer::new(PeerId(2), "b")).unwrap();
        env.spawn_player(PeerId(1)).unwrap();
        env.spawn_player(PeerId(2)).unwrap();
        let a = env.player_of(PeerId(1)).unwrap();
        let b = env.player_of(PeerId(2)).unwrap();

        assert_eq!(env.apply_damage(b, 50, Some(a)).unwrap(), DamageOutcome::Suppressed);
        // Past spawn protection.
        for _ in 0..30 {
            env.step(0.1);
        }
        assert!(env.time() > 2.0);
        assert_eq!(env.apply_damage(b, 60, Some(a)).unwrap(), DamageOutcome::Dealt(60));
        assert_eq!(env.apply_damage(b, 60, None).unwrap(), DamageOutcome::Killed(40));

        let reg = env.registry();
        assert_eq!(reg.entity(a).unwrap().player().unwrap().kills, 1);
        assert_eq!(reg.entity(b).unwrap().player().unwrap().deaths, 1);

        env.set_damage_enabled(false);
        env.respawn(b).unwrap();
        for _ in 0..30 {
            env.step(0.1);
        }
        assert_eq!(env.apply_damage(b, 10, Some(a)).unwrap(), DamageOutcome::Suppressed);
    }

    #[test]
    fn close_is_idempotent_and_clears_everything() {
        let mut t = table();
        let s = server(&mut t);
        {
            let mut env = s.lock().unwrap();
            env.register_peer(Peer::new(PeerId(1), "a")).unwrap();
            env.spawn_player(PeerId(1)).unwrap();
            env.registry_mut().create("BotEntity", None).unwrap();
        }
        assert!(t.close("srv"));
        assert!(!t.close("srv"));

        let mut env = s.lock().unwrap();
        assert!(env.is_closed());
        assert!(env.registry().is_empty());
        assert!(env.net().roster().is_empty());
        assert!(env.lifecycle().is_destroyed());
        assert_eq!(env.step(1.0), 0);
        env.close();
    }

    #[test]
    fn teardown_waits_for_the_next_fixed_tick() {
        let mut t = table();
        let s = server(&mut t);
        let mut env = s.lock().unwrap();
        let h = env.registry_mut().create("PropEntity", None).unwrap();
        env.registry_mut().destroy(h).unwrap();
        assert_eq!(env.registry().pending_teardown(), 1);
        env.step(0.0);
        assert_eq!(env.registry().pending_teardown(), 1);
        env.step(1.0);
        assert_eq!(env.registry().pending_teardown(), 0);
    }
}
