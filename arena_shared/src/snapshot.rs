//! Versioned world snapshots and the delta format sent between them.
//!
//! A [`Snapshot`] is every live entity's property set at one fixed tick.
//! [`diff`] compares a snapshot against the baseline a peer last
//! acknowledged (or nothing) and yields a [`Delta`]: entities created,
//! fields changed, entities removed.
//!
//! Wire format (all counts are `u8`):
//! - `new_count`, then per entity `u16 id`, `str classname`
//! - `changed_count`, then per entity `u16 id`, `u8 field_count`, then per
//!   field `str name`, `u8 byte_type`, value
//! - `removed_count`, then per entity `u16 id`
//!
//! A field that vanished since the baseline (a removed attribute) is sent as
//! `-name` carrying `true`.
//!
//! A delta that does not fit those counts must be cut with [`Delta::split`]
//! before encoding.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};

use thiserror::Error;
use tracing::trace;

use crate::{
    codec::{BufferReader, BufferWriter, CodecError},
    entity::{removed_field, EntityId, PropertySet, REMOVED_FIELD_PREFIX},
    net::PeerId,
    registry::EntityRegistry,
};

/// Largest count any section of the wire format can carry.
pub const MAX_WIRE_COUNT: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SnapshotError {
    #[error("{section} count {count} exceeds {MAX_WIRE_COUNT}, split the delta first")]
    TooMany { section: &'static str, count: usize },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub classname: String,
    pub fields: PropertySet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub version: u32,
    pub tick: u64,
    pub entities: BTreeMap<EntityId, EntitySnapshot>,
}

impl Snapshot {
    /// Captures every live entity in `registry`.
    pub fn capture(version: u32, tick: u64, registry: &EntityRegistry) -> Self {
        let entities = registry
            .iter()
            .map(|(_, e)| {
                (
                    e.id(),
                    EntitySnapshot {
                        classname: e.classname().to_string(),
                        fields: e.capture_snapshot(),
                    },
                )
            })
            .collect();
        Self {
            version,
            tick,
            entities,
        }
    }

    pub fn empty(version: u32, tick: u64) -> Self {
        Self {
            version,
            tick,
            entities: BTreeMap::new(),
        }
    }

    /// Applies a delta in place: removals, then creations, then fields.
    /// Rebuilds the sender's state from the baseline the delta was cut
    /// against.
    pub fn apply(&mut self, delta: &Delta) {
        for id in &delta.removed {
            self.entities.remove(id);
        }
        for (id, classname) in &delta.new {
            self.entities.insert(
                *id,
                EntitySnapshot {
                    classname: classname.clone(),
                    fields: PropertySet::new(),
                },
            );
        }
        for (id, fields) in &delta.changed {
            let Some(entity) = self.entities.get_mut(id) else {
                continue;
            };
            for (name, value) in fields {
                if let Some(gone) = name.strip_prefix(REMOVED_FIELD_PREFIX) {
                    entity.fields.retain(|(n, _)| n != gone);
                } else if let Some(slot) = entity.fields.iter_mut().find(|(n, _)| n == name) {
                    slot.1 = value.clone();
                } else {
                    entity.fields.push((name.clone(), value.clone()));
                }
            }
        }
    }
}

/// Difference between two snapshots. Entities in `new` also carry all of
/// their fields in `changed`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub new: Vec<(EntityId, String)>,
    pub changed: Vec<(EntityId, PropertySet)>,
    pub removed: Vec<EntityId>,
}

/// Computes what a holder of `baseline` needs to reach `current`. With no
/// baseline every entity is new.
pub fn diff(baseline: Option<&Snapshot>, current: &Snapshot) -> Delta {
    let empty = BTreeMap::new();
    let before = baseline.map_or(&empty, |b| &b.entities);
    let mut delta = Delta::default();

    for (&id, now) in &current.entities {
        match before.get(&id) {
            Some(was) if was.classname == now.classname => {
                let mut changed: PropertySet = now
                    .fields
                    .iter()
                    .filter(|(name, value)| {
                        !was.fields.iter().any(|(n, v)| n == name && v == value)
                    })
                    .cloned()
                    .collect();
                changed.extend(
                    was.fields
                        .iter()
                        .filter(|(name, _)| !now.fields.iter().any(|(n, _)| n == name))
                        .map(|(name, _)| removed_field(name)),
                );
                if !changed.is_empty() {
                    delta.changed.push((id, changed));
                }
            }
            Some(_) => {
                // Same id, different class: the old one is gone.
                delta.removed.push(id);
                delta.new.push((id, now.classname.clone()));
                delta.changed.push((id, now.fields.clone()));
            }
            None => {
                delta.new.push((id, now.classname.clone()));
                delta.changed.push((id, now.fields.clone()));
            }
        }
    }
    for id in before.keys() {
        if !current.entities.contains_key(id) {
            delta.removed.push(*id);
        }
    }
    delta
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    /// Whether every section fits the wire format's `u8` counts.
    pub fn fits_wire(&self) -> bool {
        self.new.len() <= MAX_WIRE_COUNT
            && self.changed.len() <= MAX_WIRE_COUNT
            && self.removed.len() <= MAX_WIRE_COUNT
            && self.changed.iter().all(|(_, f)| f.len() <= MAX_WIRE_COUNT)
    }

    pub fn encode(&self, w: &mut BufferWriter) -> Result<(), SnapshotError> {
        w.write_u8(wire_count("new", self.new.len())?);
        for (id, classname) in &self.new {
            w.write_u16(id.0);
            w.write_str(classname)?;
        }

        w.write_u8(wire_count("changed", self.changed.len())?);
        for (id, fields) in &self.changed {
            w.write_u16(id.0)
                .write_u8(wire_count("field", fields.len())?);
            for (name, value) in fields {
                w.write_str(name)?;
                w.write_u8(value.byte_type() as u8);
                w.write(value.clone())?;
            }
        }

        w.write_u8(wire_count("removed", self.removed.len())?);
        for id in &self.removed {
            w.write_u16(id.0);
        }
        Ok(())
    }

    pub fn decode(r: &mut BufferReader) -> Result<Self, CodecError> {
        let mut delta = Delta::default();
        for _ in 0..r.read_u8()? {
            let id = EntityId(r.read_u16()?);
            delta.new.push((id, r.read_str()?));
        }
        for _ in 0..r.read_u8()? {
            let id = EntityId(r.read_u16()?);
            let count = r.read_u8()?;
            let mut fields = PropertySet::with_capacity(count as usize);
            for _ in 0..count {
                let name = r.read_str()?;
                let ty = r.read_byte_type()?;
                fields.push((name, r.read_value(ty)?));
            }
            delta.changed.push((id, fields));
        }
        for _ in 0..r.read_u8()? {
            delta.removed.push(EntityId(r.read_u16()?));
        }
        Ok(delta)
    }

    /// Cuts the delta into parts whose every count is at most `max` (clamped
    /// to `1..=MAX_WIRE_COUNT`). Parts preserve order: removals first, then
    /// creations, then field changes, so applying them in order is
    /// equivalent to applying the whole.
    pub fn split(self, max: usize) -> Vec<Delta> {
        let max = max.clamp(1, MAX_WIRE_COUNT);
        if self.new.len() <= max
            && self.changed.len() <= max
            && self.removed.len() <= max
            && self.changed.iter().all(|(_, f)| f.len() <= max)
        {
            return vec![self];
        }

        let mut parts = Vec::new();
        let mut current = Delta::default();
        for id in self.removed {
            if current.removed.len() == max {
                parts.push(std::mem::take(&mut current));
            }
            current.removed.push(id);
        }
        for entry in self.new {
            if current.new.len() == max {
                parts.push(std::mem::take(&mut current));
            }
            current.new.push(entry);
        }
        for (id, fields) in self.changed {
            for chunk in fields.chunks(max) {
                if current.changed.len() == max {
                    parts.push(std::mem::take(&mut current));
                }
                current.changed.push((id, chunk.to_vec()));
            }
        }
        if !current.is_empty() {
            parts.push(current);
        }
        parts
    }
}

fn wire_count(section: &'static str, count: usize) -> Result<u8, SnapshotError> {
    u8::try_from(count).map_err(|_| SnapshotError::TooMany { section, count })
}

/// The last N snapshots plus what each peer has acknowledged.
#[derive(Debug)]
pub struct SnapshotHistory {
    capacity: usize,
    snapshots: VecDeque<Arc<Snapshot>>,
    acked: HashMap<PeerId, u32>,
    next_version: u32,
}

impl SnapshotHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            snapshots: VecDeque::new(),
            acked: HashMap::new(),
            next_version: 1,
        }
    }

    /// Captures the registry as the next version and retains it.
    pub fn capture(&mut self, tick: u64, registry: &EntityRegistry) -> Arc<Snapshot> {
        let snapshot = Arc::new(Snapshot::capture(self.next_version, tick, registry));
        self.next_version = self.next_version.wrapping_add(1);
        self.snapshots.push_back(snapshot.clone());
        while self.snapshots.len() > self.capacity {
            self.snapshots.pop_front();
        }
        snapshot
    }

    pub fn latest(&self) -> Option<&Arc<Snapshot>> {
        self.snapshots.back()
    }

    pub fn get(&self, version: u32) -> Option<&Arc<Snapshot>> {
        self.snapshots.iter().find(|s| s.version == version)
    }

    /// Records that `peer` holds `version`. Stale or unknown versions are
    /// ignored.
    pub fn ack(&mut self, peer: PeerId, version: u32) -> bool {
        if self.get(version).is_none() {
            trace!(%peer, version, "Ack for a version no longer retained");
            return false;
        }
        match self.acked.get(&peer) {
            Some(&prev) if prev >= version => false,
            _ => {
                self.acked.insert(peer, version);
                true
            }
        }
    }

    pub fn acked(&self, peer: PeerId) -> Option<u32> {
        self.acked.get(&peer).copied()
    }

    /// The snapshot to diff against for `peer`, if it acknowledged one that
    /// is still retained.
    pub fn baseline_for(&self, peer: PeerId) -> Option<&Arc<Snapshot>> {
        self.acked.get(&peer).and_then(|&v| self.get(v))
    }

    pub fn forget(&mut self, peer: PeerId) {
        self.acked.remove(&peer);
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::Value, entity::ClassRegistry, math::Vec3, session::SessionId};

    fn snapshot(version: u32, entities: &[(u16, &str, PropertySet)]) -> Snapshot {
        Snapshot {
            version,
            tick: version as u64,
            entities: entities
                .iter()
                .map(|(id, class, fields)| {
                    (
                        EntityId(*id),
                        EntitySnapshot {
                            classname: class.to_string(),
                            fields: fields.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn fields(health: u16) -> PropertySet {
        vec![
            ("position".into(), Value::Vec3(Vec3::ZERO)),
            ("health".into(), Value::U16(health)),
        ]
    }

    #[test]
    fn diff_without_baseline_is_full_state() {
        let s = snapshot(1, &[(1, "BotEntity", fields(100)), (2, "PropEntity", vec![])]);
        let d = diff(None, &s);
        assert_eq!(
            d.new,
            vec![(EntityId(1), "BotEntity".into()), (EntityId(2), "PropEntity".into())]
        );
        assert_eq!(d.changed, vec![(EntityId(1), fields(100)), (EntityId(2), vec![])]);
        assert!(d.removed.is_empty());
    }

    #[test]
    fn diff_reports_only_changes() {
        let a = snapshot(1, &[(1, "BotEntity", fields(100)), (2, "PropEntity", vec![])]);
        let b = snapshot(2, &[(1, "BotEntity", fields(60)), (3, "PropEntity", vec![])]);
        let d = diff(Some(&a), &b);
        assert_eq!(d.new, vec![(EntityId(3), "PropEntity".into())]);
        assert_eq!(
            d.changed,
            vec![
                (EntityId(1), vec![("health".into(), Value::U16(60))]),
                (EntityId(3), vec![])
            ]
        );
        assert_eq!(d.removed, vec![EntityId(2)]);

        assert!(diff(Some(&b), &b).is_empty());
    }

    #[test]
    fn vanished_fields_are_marked_removed() {
        let mut with_attr = fields(100);
        with_attr.push(("@mode".into(), Value::U8(1)));
        let a = snapshot(1, &[(1, "BotEntity", with_attr)]);
        let b = snapshot(2, &[(1, "BotEntity", fields(100))]);
        let d = diff(Some(&a), &b);
        assert_eq!(d.changed, vec![(EntityId(1), vec![removed_field("@mode")])]);

        let mut rebuilt = a.clone();
        rebuilt.apply(&d);
        assert_eq!(rebuilt.entities, b.entities);
    }

    #[test]
    fn baseline_plus_delta_rebuilds_current() {
        let a = snapshot(1, &[(1, "BotEntity", fields(100)), (2, "PropEntity", vec![])]);
        let b = snapshot(
            2,
            &[
                (1, "BotEntity", fields(40)),
                (2, "BotEntity", fields(100)),
                (3, "PropEntity", vec![]),
            ],
        );
        let mut rebuilt = a.clone();
        rebuilt.apply(&diff(Some(&a), &b));
        assert_eq!(rebuilt.entities, b.entities);

        let mut from_nothing = Snapshot::empty(2, 0);
        from_nothing.apply(&diff(None, &b));
        assert_eq!(from_nothing.entities, b.entities);
    }

    #[test]
    fn wire_layout() {
        let delta = Delta {
            new: vec![(EntityId(5), "Bot".into())],
            changed: vec![(EntityId(5), vec![("hp".into(), Value::U16(7))])],
            removed: vec![EntityId(9)],
        };
        let mut w = BufferWriter::new();
        delta.encode(&mut w).unwrap();
        let bytes = w.finalize();
        #[rustfmt::skip]
        let expected: &[u8] = &[
            1, 5, 0, 3, 0, b'B', b'o', b't',
            1, 5, 0, 1, 2, 0, b'h', b'p', 2, 7, 0,
            1, 9, 0,
        ];
        assert_eq!(&bytes[..], expected);
        assert_eq!(Delta::decode(&mut BufferReader::new(bytes)).unwrap(), delta);
    }

    #[test]
    fn oversized_delta_must_be_split() {
        let mut delta = Delta::default();
        for i in 0..300u16 {
            delta.removed.push(EntityId(i));
        }
        assert!(!delta.fits_wire());
        assert!(matches!(
            delta.encode(&mut BufferWriter::new()),
            Err(SnapshotError::TooMany { section: "removed", count: 300 })
        ));

        let parts = delta.split(MAX_WIRE_COUNT);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].removed.len(), 255);
        assert_eq!(parts[1].removed.len(), 45);
        assert!(parts.iter().all(Delta::fits_wire));
    }

    #[test]
    fn split_chunks_wide_field_lists() {
        let wide: PropertySet = (0..5).map(|i| (format!("f{i}"), Value::U8(i))).collect();
        let delta = Delta {
            new: vec![(EntityId(1), "Prop".into())],
            changed: vec![(EntityId(1), wide)],
            removed: vec![],
        };
        let parts = delta.split(2);
        let total: usize = parts
            .iter()
            .flat_map(|p| p.changed.iter())
            .map(|(_, f)| f.len())
            .sum();
        assert_eq!(total, 5);
        assert!(parts
            .iter()
            .all(|p| p.changed.len() <= 2 && p.changed.iter().all(|(_, f)| f.len() <= 2)));
        assert_eq!(parts[0].new.len(), 1);
    }

    #[test]
    fn history_tracks_acks_and_evicts() {
        let classes = Arc::new(ClassRegistry::with_builtin());
        let mut reg = EntityRegistry::new(SessionId::from("h"), classes);
        reg.create("PropEntity", None).unwrap();

        let mut history = SnapshotHistory::new(2);
        let peer = PeerId(1);
        let s1 = history.capture(1, &reg);
        assert!(history.baseline_for(peer).is_none());
        assert!(history.ack(peer, s1.version));
        assert_eq!(history.baseline_for(peer).unwrap().version, 1);

        let s2 = history.capture(2, &reg);
        assert!(!history.ack(peer, s1.version));
        assert!(history.ack(peer, s2.version));
        history.capture(3, &reg);
        history.capture(4, &reg);
        assert_eq!(history.len(), 2);
        // Acked version evicted: fall back to full state.
        assert!(history.baseline_for(peer).is_none());
        assert!(!history.ack(peer, 1));
    }
}
