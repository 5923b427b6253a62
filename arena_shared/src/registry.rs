//! Per-session entity registry.
//!
//! Entities live in a generational slot arena. An [`EntityHandle`] names a
//! slot plus the generation it was issued for, so a handle to a destroyed
//! entity can never reach whatever later occupies the slot.
//!
//! Destruction is two-phase:
//! - `destroy` unindexes the entity at once and fires `pre_delete`
//! - `flush_teardown` (called by the session on the next fixed tick) runs
//!   deletion callbacks, clears signals and frees the slot
//!
//! Network ids ([`EntityId`]) are allocated monotonically and never handed
//! out twice within a registry.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
    entity::{ClassRegistry, Entity, EntityId, EntityKind, ForeignHandle, ThinkContext},
    session::SessionId,
    signal::{isolated, Signal},
};

static NEXT_REGISTRY_SERIAL: AtomicU32 = AtomicU32::new(1);

/// Depth limit when walking a foreign tree upwards.
const MAX_FOREIGN_DEPTH: usize = 64;

/// Generation-checked reference to a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityHandle {
    registry: u32,
    index: u32,
    generation: u32,
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}v{}", self.registry, self.index, self.generation)
    }
}

/// Payload of the `created` and `pre_delete` signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityEvent {
    pub handle: EntityHandle,
    pub id: EntityId,
    pub kind: EntityKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown class {0}")]
    UnknownClass(String),
    #[error("entity id {0} is already in use")]
    IdInUse(EntityId),
    #[error("entity id space exhausted")]
    IdSpaceExhausted,
    #[error("handle {0} belongs to another registry")]
    ForeignHandle(EntityHandle),
    #[error("handle {0} does not name a live entity")]
    Stale(EntityHandle),
    #[error("name {0:?} is already taken")]
    NameTaken(String),
}

/// Parent lookup in an external object tree (physics bodies, visuals).
pub trait ForeignTree {
    fn parent(&self, handle: ForeignHandle) -> Option<ForeignHandle>;
}

/// A flat tree: nothing has a parent.
impl ForeignTree for () {
    fn parent(&self, _: ForeignHandle) -> Option<ForeignHandle> {
        None
    }
}

/// Child-to-parent map.
impl ForeignTree for HashMap<ForeignHandle, ForeignHandle> {
    fn parent(&self, handle: ForeignHandle) -> Option<ForeignHandle> {
        self.get(&handle).copied()
    }
}

struct Slot {
    generation: u32,
    entity: Option<Entity>,
}

pub struct EntityRegistry {
    serial: u32,
    session: SessionId,
    classes: Arc<ClassRegistry>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_id: HashMap<EntityId, u32>,
    by_name: HashMap<String, u32>,
    by_foreign: HashMap<ForeignHandle, u32>,
    next_id: u32,
    doomed: Vec<u32>,
    created: Signal<EntityEvent>,
    pre_delete: Signal<EntityEvent>,
}

impl fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("session", &self.session)
            .field("live", &self.by_id.len())
            .field("pending_teardown", &self.doomed.len())
            .finish()
    }
}

impl EntityRegistry {
    pub fn new(session: SessionId, classes: Arc<ClassRegistry>) -> Self {
        Self {
            serial: NEXT_REGISTRY_SERIAL.fetch_add(1, Ordering::Relaxed),
            session,
            classes,
            slots: Vec::new(),
            free: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            by_foreign: HashMap::new(),
            next_id: 1,
            doomed: Vec::new(),
            created: Signal::new("entity_created"),
            pre_delete: Signal::new("entity_pre_delete"),
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn classes(&self) -> &Arc<ClassRegistry> {
        &self.classes
    }

    /// Fires after an entity is constructed, bound and set up.
    pub fn created(&self) -> &Signal<EntityEvent> {
        &self.created
    }

    /// Fires when an entity is destroyed, before its teardown runs.
    pub fn pre_delete(&self) -> &Signal<EntityEvent> {
        &self.pre_delete
    }

    /// Constructs an entity of `classname`. With `id` of `None` the next
    /// unused id is allocated; clients pass the server's id explicitly.
    pub fn create(
        &mut self,
        classname: &str,
        id: Option<EntityId>,
    ) -> Result<EntityHandle, RegistryError> {
        let Some(info) = self.classes.lookup(classname).copied() else {
            warn!(session = %self.session, classname, "Unknown entity class");
            return Err(RegistryError::UnknownClass(classname.to_string()));
        };

        let id = match id {
            Some(id) if self.by_id.contains_key(&id) => {
                error!(session = %self.session, entity = %id, "Entity id already in use");
                return Err(RegistryError::IdInUse(id));
            }
            Some(id) => {
                self.next_id = self.next_id.max(id.0 as u32 + 1);
                id
            }
            None => self.allocate_id()?,
        };

        let Some(mut entity) = Entity::new(id, info.kind, self.session.clone()) else {
            return Err(RegistryError::UnknownClass(classname.to_string()));
        };
        (info.construct)(&mut entity);

        let (index, generation) = match self.free.pop() {
            Some(index) => (index, self.slots[index as usize].generation),
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entity: None,
                });
                (self.slots.len() as u32 - 1, 0)
            }
        };
        let handle = EntityHandle {
            registry: self.serial,
            index,
            generation,
        };

        entity.run_setup();
        self.slots[index as usize].entity = Some(entity);
        self.by_id.insert(id, index);
        debug!(session = %self.session, entity = %id, classname, "Entity created");

        self.created.fire(EntityEvent {
            handle,
            id,
            kind: info.kind,
        });
        Ok(handle)
    }

    fn allocate_id(&mut self) -> Result<EntityId, RegistryError> {
        while self.next_id <= u16::MAX as u32 {
            let id = EntityId(self.next_id as u16);
            self.next_id += 1;
            if !self.by_id.contains_key(&id) {
                return Ok(id);
            }
        }
        error!(session = %self.session, "Entity id space exhausted");
        Err(RegistryError::IdSpaceExhausted)
    }

    /// Marks the entity destroyed and schedules its teardown. Returns
    /// `Ok(false)` when it was already destroyed.
    pub fn destroy(&mut self, handle: EntityHandle) -> Result<bool, RegistryError> {
        if handle.registry != self.serial {
            error!(session = %self.session, %handle, "Destroy with a handle from another registry");
            return Err(RegistryError::ForeignHandle(handle));
        }
        let Some(entity) = self.slot_entity_mut(handle) else {
            return Ok(false);
        };
        if !entity.is_alive() {
            return Ok(false);
        }
        entity.mark_dead();
        let event = EntityEvent {
            handle,
            id: entity.id(),
            kind: entity.kind(),
        };
        let name = entity.name().map(str::to_string);
        let associated: Vec<ForeignHandle> = entity.associated().collect();

        self.by_id.remove(&event.id);
        if let Some(name) = name {
            self.by_name.remove(&name);
        }
        for foreign in associated {
            self.by_foreign.remove(&foreign);
        }
        self.doomed.push(handle.index);
        debug!(session = %self.session, entity = %event.id, "Entity destroyed");

        self.pre_delete.fire(event);
        Ok(true)
    }

    /// Destroys every live entity.
    pub fn destroy_all(&mut self) -> usize {
        let mut destroyed = 0;
        for handle in self.handles() {
            if let Ok(true) = self.destroy(handle) {
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Runs pending teardowns and frees their slots.
    pub fn flush_teardown(&mut self) -> usize {
        let doomed = std::mem::take(&mut self.doomed);
        let count = doomed.len();
        for index in doomed {
            let slot = &mut self.slots[index as usize];
            let entity = slot.entity.take();
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index);
            if let Some(mut entity) = entity {
                entity.teardown();
            }
        }
        count
    }

    pub fn pending_teardown(&self) -> usize {
        self.doomed.len()
    }

    fn slot_entity_mut(&mut self, handle: EntityHandle) -> Option<&mut Entity> {
        if handle.registry != self.serial {
            return None;
        }
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entity.as_mut()
    }

    fn handle_at(&self, index: u32) -> EntityHandle {
        EntityHandle {
            registry: self.serial,
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    /// The entity behind `handle`, including one still awaiting teardown.
    pub fn get(&self, handle: EntityHandle) -> Option<&Entity> {
        if handle.registry != self.serial {
            return None;
        }
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entity.as_ref()
    }

    pub fn get_mut(&mut self, handle: EntityHandle) -> Option<&mut Entity> {
        self.slot_entity_mut(handle)
    }

    pub fn is_alive(&self, handle: EntityHandle) -> bool {
        self.get(handle).is_some_and(Entity::is_alive)
    }

    pub fn by_id(&self, id: EntityId) -> Option<EntityHandle> {
        self.by_id.get(&id).map(|&index| self.handle_at(index))
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        let index = *self.by_id.get(&id)?;
        self.slots[index as usize].entity.as_ref()
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        let index = *self.by_id.get(&id)?;
        self.slots[index as usize].entity.as_mut()
    }

    pub fn by_name(&self, name: &str) -> Option<EntityHandle> {
        self.by_name.get(name).map(|&index| self.handle_at(index))
    }

    /// Names an entity. Names are unique among live entities.
    pub fn set_name(
        &mut self,
        handle: EntityHandle,
        name: Option<String>,
    ) -> Result<(), RegistryError> {
        if !self.is_alive(handle) {
            return Err(RegistryError::Stale(handle));
        }
        if let Some(name) = &name {
            if let Some(&other) = self.by_name.get(name) {
                if other != handle.index {
                    return Err(RegistryError::NameTaken(name.clone()));
                }
            }
        }
        let Some(entity) = self.slot_entity_mut(handle) else {
            return Err(RegistryError::Stale(handle));
        };
        let old = entity.name().map(str::to_string);
        entity.set_name_unchecked(name.clone());
        if let Some(old) = old {
            self.by_name.remove(&old);
        }
        if let Some(name) = name {
            self.by_name.insert(name, handle.index);
        }
        Ok(())
    }

    /// Live handles ordered by entity id.
    pub fn handles(&self) -> Vec<EntityHandle> {
        let mut ids: Vec<(EntityId, u32)> = self.by_id.iter().map(|(&id, &i)| (id, i)).collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, i)| self.handle_at(i)).collect()
    }

    /// Live entities ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = (EntityHandle, &Entity)> + '_ {
        self.handles()
            .into_iter()
            .filter_map(move |h| self.get(h).map(|e| (h, e)))
    }

    /// Live entities that satisfy `kind`, abstract kinds included.
    pub fn all_of_kind(&self, kind: EntityKind) -> Vec<EntityHandle> {
        self.iter()
            .filter(|(_, e)| e.is_a(kind))
            .map(|(h, _)| h)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Links an external object to an entity so it can be resolved back with
    /// [`EntityRegistry::from_foreign_handle`].
    pub fn associate(
        &mut self,
        handle: EntityHandle,
        foreign: ForeignHandle,
    ) -> Result<(), RegistryError> {
        if !self.is_alive(handle) {
            return Err(RegistryError::Stale(handle));
        }
        if let Some(previous) = self.by_foreign.insert(foreign, handle.index) {
            if previous != handle.index {
                let prev = self.handle_at(previous);
                if let Some(e) = self.slot_entity_mut(prev) {
                    e.associated_mut().remove(&foreign);
                }
            }
        }
        if let Some(entity) = self.slot_entity_mut(handle) {
            entity.associated_mut().insert(foreign);
        }
        Ok(())
    }

    pub fn dissociate(&mut self, foreign: ForeignHandle) -> Option<EntityHandle> {
        let index = self.by_foreign.remove(&foreign)?;
        let handle = self.handle_at(index);
        if let Some(entity) = self.slot_entity_mut(handle) {
            entity.associated_mut().remove(&foreign);
        }
        Some(handle)
    }

    /// Resolves an external object to its entity, walking up `tree` until an
    /// associated ancestor is found.
    pub fn from_foreign_handle(
        &self,
        foreign: ForeignHandle,
        tree: &impl ForeignTree,
    ) -> Option<EntityHandle> {
        let mut current = foreign;
        for _ in 0..MAX_FOREIGN_DEPTH {
            if let Some(&index) = self.by_foreign.get(&current) {
                return Some(self.handle_at(index));
            }
            current = tree.parent(current)?;
        }
        None
    }

    /// Runs `think` on every live entity, isolating panics. Returns how many
    /// entities failed.
    pub fn think_all(&mut self, ctx: &ThinkContext) -> usize {
        let mut failed = 0;
        for handle in self.handles() {
            let Some(entity) = self.slot_entity_mut(handle) else {
                continue;
            };
            if isolated("entity_think", || entity.think(ctx)).is_none() {
                failed += 1;
            }
        }
        failed
    }
}
