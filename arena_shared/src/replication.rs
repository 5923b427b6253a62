//! Snapshot replication over the packet router.
//!
//! Server side:
//! - every `interval` fixed ticks capture a snapshot and send each peer the
//!   delta against the last version it acknowledged (full state when none)
//! - `ack` packets advance a peer's baseline
//! - `state` packets carry a client's own player buffer for reconciliation
//!
//! Client side:
//! - apply `snapshot` packets only when newer than the last complete one,
//!   ack once every part of a version has arrived
//! - each packet names the baseline it was cut against; the client rebuilds
//!   baseline plus delta and moves its registry there from the previous
//!   applied state, so a lost ack never leaves stale entities or fields
//! - remote world entities blend to their new pose over one tick
//! - send the controlled player's full state every tick
//!
//! Packet listeners only queue; all entity work happens in the session's
//! tick handler.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::{debug, error, trace, warn};

use crate::{
    codec::{BufferReader, CodecError},
    entity::{EntityId, EntityKind},
    interp::{Pose, PoseInterpolator},
    math::Vec3,
    net::{NetworkContext, NetworkManager, PeerId, RouterError},
    registry::EntityRegistry,
    signal::Connection,
    snapshot::{diff, Delta, Snapshot, SnapshotHistory, MAX_WIRE_COUNT},
};

pub const REPLICATION_PORT: &str = "replication";
pub const SNAPSHOT_PACKET: &str = "snapshot";
pub const ACK_PACKET: &str = "ack";
pub const STATE_PACKET: &str = "state";

/// Baseline version of a delta cut against nothing (full state).
pub const NO_BASELINE: u32 = 0;

/// Shared FIFO filled by packet listeners.
#[derive(Debug)]
pub struct Inbox<T> {
    inner: Arc<Mutex<VecDeque<T>>>,
}

impl<T> Clone for Inbox<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Inbox<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

impl<T> Inbox<T> {
    pub fn push(&self, item: T) {
        self.lock().push_back(item);
    }

    pub fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    pub snapshots: u64,
    pub parts_sent: u64,
    pub parts_applied: u64,
    pub stale_dropped: u64,
    pub baseline_missing: u64,
    pub acks: u64,
}

#[derive(Debug, Clone, Copy)]
struct PartHeader {
    version: u32,
    baseline: u32,
    index: usize,
    total: usize,
}

/// Server half.
pub struct ServerReplication {
    ctx: Arc<NetworkContext>,
    history: SnapshotHistory,
    interval: u64,
    acks: Inbox<(PeerId, u32)>,
    states: Inbox<(PeerId, BufferReader)>,
    connections: Vec<Connection>,
    stats: ReplicationStats,
}

impl ServerReplication {
    pub fn new(
        net: &mut NetworkManager,
        history_len: usize,
        interval_ticks: u32,
    ) -> Result<Self, RouterError> {
        let ctx = net.context(REPLICATION_PORT, None)?;
        let acks = Inbox::default();
        let states = Inbox::default();

        let inbox = acks.clone();
        let on_ack = ctx.listen(ACK_PACKET, move |mut p| {
            let Some(peer) = p.sender else { return };
            match p.reader.read_u32() {
                Ok(version) => inbox.push((peer, version)),
                Err(e) => warn!(%peer, error = %e, "Malformed ack"),
            }
        })?;
        let inbox = states.clone();
        let on_state = ctx.listen(STATE_PACKET, move |p| {
            if let Some(peer) = p.sender {
                inbox.push((peer, p.reader));
            }
        })?;

        Ok(Self {
            ctx,
            history: SnapshotHistory::new(history_len),
            interval: interval_ticks.max(1) as u64,
            acks,
            states,
            connections: vec![on_ack, on_state],
            stats: ReplicationStats::default(),
        })
    }

    pub fn history(&self) -> &SnapshotHistory {
        &self.history
    }

    pub fn stats(&self) -> ReplicationStats {
        self.stats
    }

    /// Client state buffers received since the last call, oldest first.
    pub fn take_client_states(&self) -> Vec<(PeerId, BufferReader)> {
        self.states.drain()
    }

    pub fn process_acks(&mut self) {
        for (peer, version) in self.acks.drain() {
            if self.history.ack(peer, version) {
                self.stats.acks += 1;
                trace!(%peer, version, "Snapshot acknowledged");
            }
        }
    }

    pub fn forget_peer(&mut self, peer: PeerId) {
        self.history.forget(peer);
    }

    /// Captures and sends a snapshot when `tick` falls on the interval.
    /// Returns the number of packets sent.
    pub fn on_fixed_tick(&mut self, tick: u64, registry: &EntityRegistry, peers: &[PeerId]) -> usize {
        if tick % self.interval != 0 {
            return 0;
        }
        let snapshot = self.history.capture(tick, registry);
        self.stats.snapshots += 1;

        let mut sent = 0;
        for &peer in peers {
            let baseline = self.history.baseline_for(peer);
            let base_version = baseline.map_or(NO_BASELINE, |b| b.version);
            let parts = diff(baseline.map(|b| &**b), &snapshot).split(MAX_WIRE_COUNT);
            let total = parts.len();
            for (index, part) in parts.into_iter().enumerate() {
                let header = PartHeader {
                    version: snapshot.version,
                    baseline: base_version,
                    index,
                    total,
                };
                match self.send_part(peer, header, &part) {
                    Ok(n) => sent += n,
                    Err(e) => error!(%peer, version = snapshot.version, error = %e, "Failed to encode snapshot"),
                }
            }
        }
        self.stats.parts_sent += sent as u64;
        sent
    }

    fn send_part(&self, peer: PeerId, header: PartHeader, delta: &Delta) -> anyhow::Result<usize> {
        let mut packet = self.ctx.packet(SNAPSHOT_PACKET)?;
        packet
            .body()
            .write_u32(header.version)
            .write_u32(header.baseline)
            .write_u8(u8::try_from(header.index)?)
            .write_u8(u8::try_from(header.total)?);
        delta.encode(packet.body())?;
        Ok(packet.unreliable().to([peer]).send())
    }
}

impl Drop for ServerReplication {
    fn drop(&mut self) {
        for c in &self.connections {
            c.disconnect();
        }
    }
}

struct Assembly {
    version: u32,
    baseline: u32,
    parts: u8,
    received: BTreeMap<u8, Delta>,
}

/// Client half.
pub struct ClientReplication {
    ctx: Arc<NetworkContext>,
    inbox: Inbox<BufferReader>,
    connection: Connection,
    last_applied: Option<u32>,
    assembling: Option<Assembly>,
    /// Server state as of each recently applied version, oldest first.
    applied: VecDeque<Arc<Snapshot>>,
    keep: usize,
    local_peer: Option<PeerId>,
    local_player: Option<EntityId>,
    /// Last position and rotation the server reported for the local player.
    server_pose: Option<(Vec3, Vec3)>,
    interps: HashMap<EntityId, PoseInterpolator>,
    blend_secs: f32,
    stats: ReplicationStats,
}

impl ClientReplication {
    pub fn new(
        net: &mut NetworkManager,
        tick_secs: f32,
        history_len: usize,
    ) -> Result<Self, RouterError> {
        let ctx = net.context(REPLICATION_PORT, None)?;
        let inbox = Inbox::default();
        let queued = inbox.clone();
        let connection = ctx.listen(SNAPSHOT_PACKET, move |p| queued.push(p.reader))?;
        Ok(Self {
            ctx,
            inbox,
            connection,
            last_applied: None,
            assembling: None,
            applied: VecDeque::new(),
            keep: history_len.max(1),
            local_peer: None,
            local_player: None,
            server_pose: None,
            interps: HashMap::new(),
            blend_secs: tick_secs,
            stats: ReplicationStats::default(),
        })
    }

    pub fn stats(&self) -> ReplicationStats {
        self.stats
    }

    /// Last version whose every part was applied.
    pub fn last_applied(&self) -> Option<u32> {
        self.last_applied
    }

    /// Server state as of the last applied version.
    pub fn mirror(&self) -> Option<&Arc<Snapshot>> {
        self.applied.back()
    }

    fn applied_version(&self, version: u32) -> Option<&Arc<Snapshot>> {
        self.applied.iter().rev().find(|s| s.version == version)
    }

    pub fn set_local_peer(&mut self, peer: PeerId) {
        self.local_peer = Some(peer);
        self.local_player = None;
        self.server_pose = None;
    }

    pub fn local_peer(&self) -> Option<PeerId> {
        self.local_peer
    }

    pub fn local_player(&self) -> Option<EntityId> {
        self.local_player
    }

    /// Takes in every queued snapshot part. Returns how many were accepted.
    pub fn process(&mut self, registry: &mut EntityRegistry) -> usize {
        let mut accepted = 0;
        for mut reader in self.inbox.drain() {
            match self.accept_packet(&mut reader, registry) {
                Ok(true) => accepted += 1,
                Ok(false) => self.stats.stale_dropped += 1,
                Err(e) => warn!(error = %e, "Dropping malformed snapshot"),
            }
        }
        if accepted > 0 && self.local_player.is_none() {
            self.find_local_player(registry);
        }
        accepted
    }

    fn accept_packet(
        &mut self,
        r: &mut BufferReader,
        registry: &mut EntityRegistry,
    ) -> Result<bool, CodecError> {
        let version = r.read_u32()?;
        let baseline = r.read_u32()?;
        let index = r.read_u8()?;
        let parts = r.read_u8()?.max(1);

        if index >= parts {
            warn!(version, index, parts, "Snapshot part index out of range");
            return Ok(false);
        }
        if self.last_applied.is_some_and(|last| version <= last) {
            trace!(version, "Stale snapshot");
            return Ok(false);
        }
        if baseline != NO_BASELINE && self.applied_version(baseline).is_none() {
            debug!(version, baseline, "Snapshot cut against a baseline no longer held");
            self.stats.baseline_missing += 1;
            // Re-announce what we do hold so the server moves its baseline.
            if let Some(last) = self.last_applied {
                self.send_ack(last);
            }
            return Ok(false);
        }
        let delta = Delta::decode(r)?;

        if self.assembling.as_ref().map_or(true, |a| a.version < version) {
            self.assembling = Some(Assembly {
                version,
                baseline,
                parts,
                received: BTreeMap::new(),
            });
        }
        let Some(assembly) = self.assembling.as_mut() else {
            return Ok(false);
        };
        if assembly.version != version
            || assembly.baseline != baseline
            || assembly.received.contains_key(&index)
        {
            return Ok(false);
        }
        assembly.received.insert(index, delta);
        self.stats.parts_applied += 1;

        if assembly.received.len() >= assembly.parts as usize {
            if let Some(done) = self.assembling.take() {
                self.complete(done, registry);
            }
        }
        Ok(true)
    }

    /// Rebuilds the server state as baseline plus every part, then moves
    /// the registry from the previous mirror to it.
    fn complete(&mut self, assembly: Assembly, registry: &mut EntityRegistry) {
        let mut target = if assembly.baseline == NO_BASELINE {
            Snapshot::empty(assembly.version, 0)
        } else {
            match self.applied_version(assembly.baseline) {
                Some(base) => Snapshot::clone(base),
                None => {
                    debug!(version = assembly.version, baseline = assembly.baseline, "Baseline evicted during assembly");
                    return;
                }
            }
        };
        target.version = assembly.version;
        for delta in assembly.received.values() {
            target.apply(delta);
        }

        let local = diff(self.mirror().map(|m| &**m), &target);
        self.apply_delta(local, registry);

        self.applied.push_back(Arc::new(target));
        while self.applied.len() > self.keep {
            self.applied.pop_front();
        }
        self.last_applied = Some(assembly.version);
        self.send_ack(assembly.version);
    }

    fn send_ack(&self, version: u32) {
        match self.ctx.packet(ACK_PACKET) {
            Ok(mut packet) => {
                packet.body().write_u32(version);
                packet.unreliable().send();
            }
            Err(e) => error!(error = %e, "Failed to build ack"),
        }
    }

    /// Removals, then creations, then field changes.
    pub fn apply_delta(&mut self, delta: Delta, registry: &mut EntityRegistry) {
        for id in delta.removed {
            self.interps.remove(&id);
            if let Some(handle) = registry.by_id(id) {
                let _ = registry.destroy(handle);
            }
        }

        for (id, classname) in delta.new {
            if let Some(existing) = registry.entity(id) {
                if existing.classname() == classname {
                    continue;
                }
                if let Some(handle) = registry.by_id(id) {
                    let _ = registry.destroy(handle);
                }
            }
            if let Err(e) = registry.create(&classname, Some(id)) {
                warn!(entity = %id, %classname, error = %e, "Failed to mirror entity");
            }
        }

        for (id, fields) in delta.changed {
            let Some(entity) = registry.entity_mut(id) else {
                trace!(entity = %id, "Fields for unknown entity");
                continue;
            };
            if Some(id) == self.local_player {
                let (mut position, mut rotation) = self.server_pose.unwrap_or_default();
                for (name, value) in &fields {
                    match (name.as_str(), value.as_vec3()) {
                        ("position", Some(v)) => position = v,
                        ("rotation", Some(v)) => rotation = v,
                        _ => {}
                    }
                }
                self.server_pose = Some((position, rotation));
                // A teleport may leave the pose out of the delta when the
                // server copy never moved, so restore it from the record.
                if entity.apply_local_player_fields(&fields) {
                    if let Some(world) = entity.world_mut() {
                        world.position = position;
                        world.rotation = rotation;
                    }
                    debug!(entity = %id, "Server teleported the local player");
                }
                continue;
            }

            entity.apply_snapshot_fields(&fields);
            let Some(world) = entity.world() else {
                continue;
            };
            let target = Pose::new(world.position, world.orientation());
            let teleport = entity.player().is_some_and(|p| p.pending_teleport);
            let interp = self
                .interps
                .entry(id)
                .or_insert_with(|| PoseInterpolator::new(target, self.blend_secs));
            if teleport {
                interp.snap(target);
            } else {
                interp.retarget(target);
            }
            let shown = interp.current();
            if let Some(world) = entity.world_mut() {
                world.position = shown.position;
                world.set_orientation(shown.orientation);
            }
        }
    }

    /// Moves every remote entity along its blend. Called once per frame.
    pub fn advance_interpolation(&mut self, dt: f32, registry: &mut EntityRegistry) {
        self.interps.retain(|&id, interp| {
            let Some(world) = registry.entity_mut(id).and_then(|e| e.world_mut()) else {
                return false;
            };
            if interp.is_settled() {
                return true;
            }
            let pose = interp.advance(dt);
            world.position = pose.position;
            world.set_orientation(pose.orientation);
            true
        });
    }

    fn find_local_player(&mut self, registry: &EntityRegistry) {
        let Some(peer) = self.local_peer else { return };
        self.local_player = registry
            .all_of_kind(EntityKind::Player)
            .into_iter()
            .filter_map(|h| registry.get(h))
            .find(|e| e.player().is_some_and(|p| p.controller == peer.0 as u64))
            .map(|e| e.id());
        if let Some(id) = self.local_player {
            self.interps.remove(&id);
            self.server_pose = registry
                .entity(id)
                .and_then(|e| e.world())
                .map(|w| (w.position, w.rotation));
            debug!(%peer, entity = %id, "Local player bound");
        }
    }

    /// Sends the controlled player's full state to the server.
    pub fn send_local_state(&self, registry: &EntityRegistry) -> bool {
        let Some(entity) = self.local_player.and_then(|id| registry.entity(id)) else {
            return false;
        };
        let mut packet = match self.ctx.packet(STATE_PACKET) {
            Ok(packet) => packet,
            Err(e) => {
                error!(error = %e, "Failed to build state packet");
                return false;
            }
        };
        if let Err(e) = entity.write_state_buffer(packet.body()) {
            error!(entity = %entity.id(), error = %e, "Failed to encode local state");
            return false;
        }
        packet.unreliable().send() > 0
    }
}

impl Drop for ClientReplication {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::{BufferWriter, Value},
        entity::ClassRegistry,
        net::{NullTransport, Roster, Side},
        session::SessionId,
    };

    fn client() -> (ClientReplication, NetworkManager, EntityRegistry) {
        let mut net = NetworkManager::new(Side::Client, Arc::new(NullTransport), Roster::new());
        let repl = ClientReplication::new(&mut net, 0.1, 8).unwrap();
        let reg = EntityRegistry::new(SessionId::from("c"), Arc::new(ClassRegistry::with_builtin()));
        (repl, net, reg)
    }

    fn snapshot_packet(version: u32, index: u8, parts: u8, delta: &Delta) -> BufferReader {
        packet_on(version, NO_BASELINE, index, parts, delta)
    }

    fn packet_on(version: u32, baseline: u32, index: u8, parts: u8, delta: &Delta) -> BufferReader {
        let mut w = BufferWriter::new();
        w.write_u32(version)
            .write_u32(baseline)
            .write_u8(index)
            .write_u8(parts);
        delta.encode(&mut w).unwrap();
        BufferReader::new(w.finalize())
    }

    fn spawn_bot(id: u16, x: f32) -> Delta {
        Delta {
            new: vec![(EntityId(id), "BotEntity".into())],
            changed: vec![(
                EntityId(id),
                vec![("position".into(), Value::Vec3(Vec3::new(x, 0.0, 0.0)))],
            )],
            removed: vec![],
        }
    }

    #[test]
    fn applies_only_newer_versions() {
        let (mut repl, _net, mut reg) = client();
        repl.inbox.push(snapshot_packet(2, 0, 1, &spawn_bot(1, 0.0)));
        assert_eq!(repl.process(&mut reg), 1);
        assert_eq!(repl.last_applied(), Some(2));
        assert!(reg.entity(EntityId(1)).is_some());

        repl.inbox.push(snapshot_packet(1, 0, 1, &spawn_bot(2, 0.0)));
        repl.inbox.push(snapshot_packet(2, 0, 1, &spawn_bot(3, 0.0)));
        assert_eq!(repl.process(&mut reg), 0);
        assert_eq!(repl.stats().stale_dropped, 2);
        assert!(reg.entity(EntityId(2)).is_none());
    }

    #[test]
    fn multi_part_versions_complete_before_ack() {
        let (mut repl, _net, mut reg) = client();
        repl.inbox.push(snapshot_packet(5, 1, 2, &spawn_bot(2, 0.0)));
        repl.process(&mut reg);
        assert_eq!(repl.last_applied(), None);
        repl.inbox.push(snapshot_packet(5, 0, 2, &spawn_bot(1, 0.0)));
        repl.process(&mut reg);
        assert_eq!(repl.last_applied(), Some(5));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn remote_positions_blend() {
        let (mut repl, _net, mut reg) = client();
        repl.apply_delta(spawn_bot(1, 0.0), &mut reg);
        let moved = Delta {
            changed: vec![(
                EntityId(1),
                vec![("position".into(), Value::Vec3(Vec3::new(10.0, 0.0, 0.0)))],
            )],
            ..Default::default()
        };
        repl.apply_delta(moved, &mut reg);
        let x = |reg: &EntityRegistry| reg.entity(EntityId(1)).unwrap().world().unwrap().position.x;
        assert!(x(&reg).abs() < 1e-4);
        repl.advance_interpolation(0.05, &mut reg);
        assert!((x(&reg) - 5.0).abs() < 1e-3);
        repl.advance_interpolation(0.05, &mut reg);
        assert!((x(&reg) - 10.0).abs() < 1e-3);
    }

    #[test]
    fn removal_and_class_change() {
        let (mut repl, _net, mut reg) = client();
        repl.apply_delta(spawn_bot(1, 0.0), &mut reg);
        repl.apply_delta(
            Delta {
                new: vec![(EntityId(1), "PropEntity".into())],
                ..Default::default()
            },
            &mut reg,
        );
        assert_eq!(reg.entity(EntityId(1)).unwrap().kind(), EntityKind::Prop);

        repl.apply_delta(
            Delta {
                removed: vec![EntityId(1)],
                ..Default::default()
            },
            &mut reg,
        );
        assert!(reg.entity(EntityId(1)).is_none());
    }

    #[test]
    fn local_player_keeps_its_pose_until_teleported() {
        let (mut repl, _net, mut reg) = client();
        let peer = PeerId(4);
        repl.set_local_peer(peer);
        let spawn = Delta {
            new: vec![(EntityId(1), "PlayerEntity".into())],
            changed: vec![(
                EntityId(1),
                vec![
                    ("position".into(), Value::Vec3(Vec3::new(1.0, 0.0, 0.0))),
                    ("controller".into(), Value::U64(peer.0 as u64)),
                ],
            )],
            removed: vec![],
        };
        repl.inbox.push(snapshot_packet(1, 0, 1, &spawn));
        repl.process(&mut reg);
        assert_eq!(repl.local_player(), Some(EntityId(1)));

        let pos = |reg: &EntityRegistry| reg.entity(EntityId(1)).unwrap().world().unwrap().position;
        reg.entity_mut(EntityId(1)).unwrap().world_mut().unwrap().position = Vec3::new(50.0, 0.0, 0.0);

        // Server echoes an unrelated field: the local pose stands.
        repl.apply_delta(
            Delta {
                changed: vec![(EntityId(1), vec![("kills".into(), Value::U16(1))])],
                ..Default::default()
            },
            &mut reg,
        );
        assert_eq!(pos(&reg), Vec3::new(50.0, 0.0, 0.0));

        // Teleport flag without a position: snap back to the last server pose.
        repl.apply_delta(
            Delta {
                changed: vec![(EntityId(1), vec![("pending_teleport".into(), Value::Bool(true))])],
                ..Default::default()
            },
            &mut reg,
        );
        assert_eq!(pos(&reg), Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn out_of_range_part_index_is_dropped() {
        let (mut repl, _net, mut reg) = client();
        repl.inbox.push(snapshot_packet(1, 3, 2, &spawn_bot(1, 0.0)));
        assert_eq!(repl.process(&mut reg), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn deltas_rebuild_from_their_baseline() {
        let (mut repl, _net, mut reg) = client();
        repl.inbox.push(snapshot_packet(1, 0, 1, &spawn_bot(1, 0.0)));
        repl.process(&mut reg);

        // Version 2 adds a bot; suppose its ack never reaches the server.
        let mut both = spawn_bot(1, 0.0);
        let second = spawn_bot(2, 0.0);
        both.new.extend(second.new);
        both.changed.extend(second.changed);
        repl.inbox.push(snapshot_packet(2, 0, 1, &both));
        repl.process(&mut reg);
        assert_eq!(reg.len(), 2);

        // The server removed bot 2 again and diffs against version 1, which
        // holds nothing to remove. The client still converges.
        repl.inbox.push(packet_on(3, 1, 0, 1, &Delta::default()));
        assert_eq!(repl.process(&mut reg), 1);
        assert_eq!(repl.last_applied(), Some(3));
        assert!(reg.entity(EntityId(1)).is_some());
        assert!(reg.entity(EntityId(2)).is_none());
        assert_eq!(repl.mirror().unwrap().entities.len(), 1);
    }

    #[test]
    fn unknown_baselines_are_dropped() {
        let (mut repl, _net, mut reg) = client();
        repl.inbox.push(packet_on(4, 3, 0, 1, &spawn_bot(1, 0.0)));
        assert_eq!(repl.process(&mut reg), 0);
        assert_eq!(repl.stats().baseline_missing, 1);
        assert_eq!(repl.last_applied(), None);
        assert!(reg.is_empty());
    }
}
