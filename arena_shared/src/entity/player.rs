//! Player-controlled entities and client/server reconciliation.
//!
//! The owning client sends its player's full state buffer every tick. The
//! server accepts the client's pose unless the claimed position is at least
//! `teleport_threshold` away horizontally, in which case it keeps its own
//! position and raises `pending_teleport` so the client snaps back. Health
//! and every player field are server-owned and always re-asserted.

use tracing::debug;

use crate::{
    codec::{BufferReader, BufferWriter, CodecError, Value},
    math::Vec3,
};

use super::{Body, Entity, EntityError, EntityKind, PropertySet};

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    pub team: u8,
    /// Peer id of the controlling client.
    pub controller: u64,
    pub appearance: String,
    pub display_name: String,
    pub kills: u16,
    pub deaths: u16,
    pub ready: bool,
    pub pending_teleport: bool,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            team: 0,
            controller: 0,
            appearance: "default".into(),
            display_name: String::new(),
            kills: 0,
            deaths: 0,
            ready: false,
            pending_teleport: false,
        }
    }
}

impl PlayerState {
    pub(crate) fn collect_fields(&self, out: &mut PropertySet) {
        out.push(("team".into(), Value::U8(self.team)));
        out.push(("controller".into(), Value::U64(self.controller)));
        out.push(("appearance".into(), Value::Str(self.appearance.clone())));
        out.push(("display_name".into(), Value::Str(self.display_name.clone())));
        out.push(("kills".into(), Value::U16(self.kills)));
        out.push(("deaths".into(), Value::U16(self.deaths)));
        out.push(("ready".into(), Value::Bool(self.ready)));
        out.push(("pending_teleport".into(), Value::Bool(self.pending_teleport)));
    }

    pub(crate) fn apply_field(&mut self, name: &str, value: &Value) -> bool {
        match (name, value) {
            ("team", Value::U8(v)) => self.team = *v,
            ("controller", Value::U64(v)) => self.controller = *v,
            ("appearance", Value::Str(v)) => self.appearance = v.clone(),
            ("display_name", Value::Str(v)) => self.display_name = v.clone(),
            ("kills", Value::U16(v)) => self.kills = *v,
            ("deaths", Value::U16(v)) => self.deaths = *v,
            ("ready", Value::Bool(v)) => self.ready = *v,
            ("pending_teleport", Value::Bool(v)) => self.pending_teleport = *v,
            _ => return false,
        }
        true
    }

    pub(crate) fn write(&self, w: &mut BufferWriter) -> Result<(), CodecError> {
        w.write_u8(self.team).write_u64(self.controller);
        w.write_str(&self.appearance)?;
        w.write_str(&self.display_name)?;
        w.write_u16(self.kills)
            .write_u16(self.deaths)
            .write_bool(self.ready)
            .write_bool(self.pending_teleport);
        Ok(())
    }

    pub(crate) fn read(&mut self, r: &mut BufferReader) -> Result<(), CodecError> {
        self.team = r.read_u8()?;
        self.controller = r.read_u64()?;
        self.appearance = r.read_str()?;
        self.display_name = r.read_str()?;
        self.kills = r.read_u16()?;
        self.deaths = r.read_u16()?;
        self.ready = r.read_bool()?;
        self.pending_teleport = r.read_bool()?;
        Ok(())
    }
}

/// Result of applying a client-authored state buffer on the server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reconciliation {
    Accepted,
    /// Claimed position was too far from the server's; server kept its own.
    Rejected { claimed: Vec3, distance: f32 },
}

/// Pose fields the owning client is allowed to author.
const CLIENT_POSE_FIELDS: [&str; 3] = ["position", "rotation", "velocity"];

impl Entity {
    /// Server side: applies the owning client's full-state buffer.
    pub fn apply_client_state(
        &mut self,
        r: &mut BufferReader,
        teleport_threshold: f32,
    ) -> Result<Reconciliation, EntityError> {
        let id = self.id;
        let kind = self.kind;
        let Body::Player { world, health, player } = &mut self.body else {
            return Err(EntityError::WrongKind {
                expected: EntityKind::Player,
                found: kind,
            });
        };

        // Decode everything first so a short buffer changes nothing.
        let mut claimed = *world;
        claimed.read(r)?;
        health.clone().read(r)?;
        player.clone().read(r)?;

        let distance = claimed.position.horizontal_distance(world.position);
        let outcome = if !claimed.position.is_finite() || !(distance < teleport_threshold) {
            debug!(entity = %id, distance, "Rejecting client position");
            player.pending_teleport = true;
            Reconciliation::Rejected {
                claimed: claimed.position,
                distance,
            }
        } else {
            world.position = claimed.position;
            player.pending_teleport = false;
            Reconciliation::Accepted
        };
        if claimed.rotation.is_finite() {
            world.rotation = claimed.rotation;
        }
        if claimed.velocity.is_finite() {
            world.velocity = claimed.velocity;
        }
        Ok(outcome)
    }

    /// Client side: applies a snapshot delta to the locally controlled
    /// player. Pose fields are kept local unless the server has flagged a
    /// teleport, in which case the entity snaps. Returns true on a snap.
    pub fn apply_local_player_fields(&mut self, fields: &[(String, Value)]) -> bool {
        let teleport = fields
            .iter()
            .find(|(name, _)| name == "pending_teleport")
            .and_then(|(_, v)| v.as_bool())
            .unwrap_or_else(|| self.player().is_some_and(|p| p.pending_teleport));

        if teleport {
            self.apply_snapshot_fields(fields);
            return true;
        }
        let kept: Vec<(String, Value)> = fields
            .iter()
            .filter(|(name, _)| !CLIENT_POSE_FIELDS.contains(&name.as_str()))
            .cloned()
            .collect();
        self.apply_snapshot_fields(&kept);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entity::EntityId,
        session::SessionId,
    };

    fn player() -> Entity {
        Entity::new(EntityId(3), EntityKind::Player, SessionId::from("test")).unwrap()
    }

    fn client_buffer(e: &Entity) -> BufferReader {
        let mut w = BufferWriter::new();
        e.write_state_buffer(&mut w).unwrap();
        BufferReader::new(w.finalize())
    }

    #[test]
    fn small_moves_are_accepted() {
        let mut server = player();
        let mut client = player();
        client.world_mut().unwrap().position = Vec3::new(3.0, 1.0, 4.0);
        client.world_mut().unwrap().rotation = Vec3::new(0.0, 45.0, 0.0);

        let outcome = server
            .apply_client_state(&mut client_buffer(&client), 12.0)
            .unwrap();
        assert_eq!(outcome, Reconciliation::Accepted);
        assert_eq!(server.world().unwrap().position, Vec3::new(3.0, 1.0, 4.0));
        assert_eq!(server.world().unwrap().rotation.y, 45.0);
        assert!(!server.player().unwrap().pending_teleport);
    }

    #[test]
    fn far_moves_flag_a_teleport() {
        let mut server = player();
        let mut client = player();
        client.world_mut().unwrap().position = Vec3::new(12.0, 0.0, 0.0);

        let outcome = server
            .apply_client_state(&mut client_buffer(&client), 12.0)
            .unwrap();
        assert!(matches!(outcome, Reconciliation::Rejected { distance, .. } if distance == 12.0));
        assert_eq!(server.world().unwrap().position, Vec3::ZERO);
        assert!(server.player().unwrap().pending_teleport);

        // Vertical distance does not count.
        client.world_mut().unwrap().position = Vec3::new(0.0, 50.0, 0.0);
        let outcome = server
            .apply_client_state(&mut client_buffer(&client), 12.0)
            .unwrap();
        assert_eq!(outcome, Reconciliation::Accepted);
        assert!(!server.player().unwrap().pending_teleport);
    }

    #[test]
    fn server_owned_fields_are_reasserted() {
        let mut server = player();
        server.health_mut().unwrap().set_health(40);
        server.player_mut().unwrap().kills = 2;

        let mut client = player();
        client.health_mut().unwrap().set_health(100);
        client.player_mut().unwrap().kills = 99;
        client.player_mut().unwrap().team = 5;

        server
            .apply_client_state(&mut client_buffer(&client), 12.0)
            .unwrap();
        assert_eq!(server.health().unwrap().health(), 40);
        assert_eq!(server.player().unwrap().kills, 2);
        assert_eq!(server.player().unwrap().team, 0);
    }

    #[test]
    fn non_players_are_rejected() {
        let mut bot = Entity::new(EntityId(4), EntityKind::Bot, SessionId::from("t")).unwrap();
        let client = player();
        assert!(matches!(
            bot.apply_client_state(&mut client_buffer(&client), 12.0),
            Err(EntityError::WrongKind { .. })
        ));
    }

    #[test]
    fn local_player_keeps_pose_unless_teleported() {
        let mut local = player();
        local.world_mut().unwrap().position = Vec3::new(1.0, 0.0, 1.0);

        let mut fields = vec![
            ("position".to_string(), Value::Vec3(Vec3::new(9.0, 0.0, 9.0))),
            ("health".to_string(), Value::U16(70)),
            ("pending_teleport".to_string(), Value::Bool(false)),
        ];
        assert!(!local.apply_local_player_fields(&fields));
        assert_eq!(local.world().unwrap().position, Vec3::new(1.0, 0.0, 1.0));
        assert_eq!(local.health().unwrap().health(), 70);

        fields[2].1 = Value::Bool(true);
        assert!(local.apply_local_player_fields(&fields));
        assert_eq!(local.world().unwrap().position, Vec3::new(9.0, 0.0, 9.0));
    }
}
