//! In-process replication tests: a server and a client session wired
//! together with a [`LocalBridge`], stepped frame by frame.

use std::sync::{Arc, MutexGuard};

use arena_shared::{
    codec::Value,
    config::EngineConfig,
    entity::{ClassRegistry, DamageOutcome, EntityId, EntityKind},
    math::Vec3,
    net::{NullTransport, Peer, PeerId, Side},
    session::{GameEnvironment, LocalBridge, SessionTable, SharedSession},
};

const DT: f64 = 0.1;
const PEER: PeerId = PeerId(7);

struct World {
    _table: SessionTable,
    server: SharedSession,
    client: SharedSession,
    _bridge: LocalBridge,
}

impl World {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("info")
            .with_test_writer()
            .try_init();

        let cfg = EngineConfig {
            tick_hz: 10,
            spawn_protection_secs: 0.0,
            ..Default::default()
        };
        let mut table = SessionTable::new(cfg, ClassRegistry::with_builtin());
        let server = table
            .create_session("srv", Side::Server, Arc::new(NullTransport))
            .unwrap();
        let client = table
            .create_session("cli", Side::Client, Arc::new(NullTransport))
            .unwrap();
        let bridge = {
            let mut s = server.lock().unwrap();
            let mut c = client.lock().unwrap();
            let bridge = LocalBridge::link(&mut s, &mut c, Peer::new(PEER, "alice")).unwrap();
            s.spawn_player(PEER).unwrap();
            bridge
        };
        Self {
            _table: table,
            server,
            client,
            _bridge: bridge,
        }
    }

    fn server(&self) -> MutexGuard<'_, GameEnvironment> {
        self.server.lock().unwrap()
    }

    fn client(&self) -> MutexGuard<'_, GameEnvironment> {
        self.client.lock().unwrap()
    }

    fn frames(&self, n: usize) {
        for _ in 0..n {
            self.server().step(DT);
            self.client().step(DT);
        }
    }

    fn spawn(&self, kind: EntityKind) -> EntityId {
        let mut s = self.server();
        let h = s.registry_mut().create(kind.classname(), None).unwrap();
        let id = s.registry().get(h).unwrap().id();
        s.respawn(id).unwrap();
        id
    }

    fn server_position(&self, id: EntityId) -> Vec3 {
        self.server().registry().entity(id).unwrap().world().unwrap().position
    }

    fn client_position(&self, id: EntityId) -> Vec3 {
        self.client().registry().entity(id).unwrap().world().unwrap().position
    }

    /// One frame in which every packet the client sends is lost.
    fn lossy_frame(&self) {
        self.server().step(DT);
        self.client().step(DT);
        self.server().inbound().drain();
    }

    fn set_mode(&self, id: EntityId, mode: Option<u8>) {
        let mut s = self.server();
        let entity = s.registry_mut().entity_mut(id).unwrap();
        match mode {
            Some(m) => entity.set_attribute("mode", Value::U8(m)),
            None => {
                entity.remove_attribute("mode");
            }
        }
    }

    fn client_mode(&self, id: EntityId) -> Option<Value> {
        self.client().registry().entity(id).unwrap().attribute("mode").cloned()
    }

    fn move_local_player(&self, to: Vec3) {
        let mut c = self.client();
        let id = c.local_player().unwrap();
        c.registry_mut()
            .entity_mut(id)
            .unwrap()
            .world_mut()
            .unwrap()
            .position = to;
    }
}

#[test]
fn snapshots_replicate_and_get_acked() {
    let w = World::new();
    let bot = w.spawn(EntityKind::Bot);
    w.frames(3);

    let player = w.server().player_of(PEER).unwrap();
    let c = w.client();
    assert_eq!(c.local_player(), Some(player));
    assert_eq!(c.registry().len(), 2);
    assert_eq!(c.registry().entity(bot).unwrap().kind(), EntityKind::Bot);
    let mirrored = c.registry().entity(player).unwrap().player().unwrap().clone();
    assert_eq!(mirrored.controller, PEER.0 as u64);
    assert_eq!(mirrored.display_name, "alice");
    let applied = c.last_snapshot().unwrap();
    drop(c);

    let acked = w.server().acked_by(PEER).unwrap();
    assert!(acked >= 1 && acked <= applied);
}

#[test]
fn remote_bots_track_the_server() {
    let w = World::new();
    let bot = w.spawn(EntityKind::Bot);
    w.frames(10);

    let server = w.server_position(bot);
    assert!(server.len() > 1.0, "bot never moved: {server:?}");
    assert!((w.client_position(bot) - server).len() < 1e-3);
}

#[test]
fn small_client_moves_are_accepted() {
    let w = World::new();
    w.frames(2);
    let player = w.server().player_of(PEER).unwrap();

    w.move_local_player(Vec3::new(3.0, 0.0, 1.0));
    w.frames(2);

    assert_eq!(w.server_position(player), Vec3::new(3.0, 0.0, 1.0));
    assert_eq!(w.client_position(player), Vec3::new(3.0, 0.0, 1.0));
    let s = w.server();
    assert!(!s.registry().entity(player).unwrap().player().unwrap().pending_teleport);
}

#[test]
fn far_client_claims_are_refused_and_snapped_back() {
    let w = World::new();
    w.frames(2);
    let player = w.server().player_of(PEER).unwrap();

    w.move_local_player(Vec3::new(100.0, 0.0, 0.0));
    w.frames(2);
    assert_eq!(w.server_position(player), Vec3::ZERO);
    assert_eq!(w.client_position(player), Vec3::ZERO);

    // Once the client reports the corrected pose the flag clears.
    w.frames(3);
    let s = w.server();
    assert!(!s.registry().entity(player).unwrap().player().unwrap().pending_teleport);
}

#[test]
fn damage_and_kills_replicate() {
    let w = World::new();
    let bot = w.spawn(EntityKind::Bot);
    w.frames(1);
    let player = w.server().player_of(PEER).unwrap();

    assert_eq!(
        w.server().apply_damage(bot, 30, Some(player)).unwrap(),
        DamageOutcome::Dealt(30)
    );
    w.frames(2);
    assert_eq!(w.client().registry().entity(bot).unwrap().health().unwrap().health(), 70);

    assert_eq!(
        w.server().apply_damage(bot, 200, Some(player)).unwrap(),
        DamageOutcome::Killed(70)
    );
    w.frames(2);
    let c = w.client();
    assert!(c.registry().entity(bot).unwrap().health().unwrap().is_dead());
    assert_eq!(c.registry().entity(player).unwrap().player().unwrap().kills, 1);
}

#[test]
fn server_removals_reach_the_client() {
    let w = World::new();
    let prop = w.spawn(EntityKind::Prop);
    w.frames(2);
    assert!(w.client().registry().entity(prop).is_some());

    {
        let mut s = w.server();
        let h = s.registry().by_id(prop).unwrap();
        assert!(s.registry_mut().destroy(h).unwrap());
    }
    w.frames(3);
    assert!(w.client().registry().entity(prop).is_none());
    assert_eq!(w.client().registry().len(), 1);
}

#[test]
fn kick_reaches_the_client() {
    let w = World::new();
    w.frames(2);
    w.server().remove_peer(PEER, "afk").unwrap();
    assert_eq!(w.server().player_of(PEER), None);

    w.frames(1);
    assert_eq!(w.client().kick_reason(), Some("afk"));
}

#[test]
fn lost_acks_do_not_leave_ghosts() {
    let w = World::new();
    let bot = w.spawn(EntityKind::Bot);
    for _ in 0..3 {
        w.lossy_frame();
    }
    assert!(w.client().registry().entity(bot).is_some());

    {
        let mut s = w.server();
        let h = s.registry().by_id(bot).unwrap();
        s.registry_mut().destroy(h).unwrap();
    }
    w.frames(20);

    assert!(w.server().registry().entity(bot).is_none());
    assert!(w.client().registry().entity(bot).is_none());
    assert_eq!(w.client().registry().len(), w.server().registry().len());
}

#[test]
fn reverted_fields_are_resent_after_a_lost_ack() {
    let w = World::new();
    let bot = w.spawn(EntityKind::Bot);
    w.set_mode(bot, Some(0));
    w.frames(3);
    assert_eq!(w.client_mode(bot), Some(Value::U8(0)));

    w.set_mode(bot, Some(1));
    w.lossy_frame();
    assert_eq!(w.client_mode(bot), Some(Value::U8(1)));

    w.set_mode(bot, Some(0));
    w.frames(20);
    assert_eq!(w.client_mode(bot), Some(Value::U8(0)));
}

#[test]
fn removed_attributes_reach_the_client() {
    let w = World::new();
    let bot = w.spawn(EntityKind::Bot);
    w.set_mode(bot, Some(3));
    w.frames(3);
    assert_eq!(w.client_mode(bot), Some(Value::U8(3)));

    w.set_mode(bot, None);
    w.frames(3);
    assert_eq!(w.client_mode(bot), None);
}
