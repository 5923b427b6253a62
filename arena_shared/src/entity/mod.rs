//! Entity kinds and the per-entity state contract.
//!
//! Kinds form a closed set. Abstract kinds (`Base`, `World`, `Health`) are
//! never constructed; each concrete kind satisfies a fixed set of abstract
//! kinds recorded in a static bitmask table, so "is-a" queries are a mask
//! test rather than a string lookup.
//!
//! Every entity can:
//! - capture its networkable fields as an ordered property set
//! - write/apply a full-state buffer (fields in declaration order, base
//!   parts first)
//! - apply a set of named fields coming from a snapshot delta

pub mod health;
pub mod player;
pub mod rules;
pub mod world;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

use bitflags::bitflags;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::{
    codec::{BufferReader, BufferWriter, CodecError, Value},
    math::Vec3,
    session::SessionId,
    signal::isolated,
};

pub use health::{AttackRecord, DamageEvent, DamageOutcome, HealthState};
pub use player::{PlayerState, Reconciliation};
pub use rules::{MatchPhase, RulesState};
pub use world::WorldState;

/// Network identity of an entity, unique within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u16);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque handle of an external object (collision body, visual) that can be
/// associated with an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ForeignHandle(pub u64);

/// Ordered `(field name, value)` pairs.
pub type PropertySet = Vec<(String, Value)>;

/// Prefix that marks dynamic attributes in a property set.
pub const ATTRIBUTE_PREFIX: char = '@';

/// Prefix of a delta field that deletes the named field, e.g. `-@skin`.
pub const REMOVED_FIELD_PREFIX: char = '-';

/// Delta field announcing that `name` no longer exists.
pub fn removed_field(name: &str) -> (String, Value) {
    (format!("{REMOVED_FIELD_PREFIX}{name}"), Value::Bool(true))
}

bitflags! {
    /// One bit per kind, abstract and concrete.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KindMask: u16 {
        const BASE = 1 << 0;
        const WORLD = 1 << 1;
        const HEALTH = 1 << 2;
        const RULES = 1 << 3;
        const PROP = 1 << 4;
        const BOT = 1 << 5;
        const PLAYER = 1 << 6;
    }
}

/// Every entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Base,
    World,
    Health,
    Rules,
    Prop,
    Bot,
    Player,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Base,
        EntityKind::World,
        EntityKind::Health,
        EntityKind::Rules,
        EntityKind::Prop,
        EntityKind::Bot,
        EntityKind::Player,
    ];

    pub const CONCRETE: [EntityKind; 4] = [
        EntityKind::Rules,
        EntityKind::Prop,
        EntityKind::Bot,
        EntityKind::Player,
    ];

    pub fn classname(self) -> &'static str {
        match self {
            EntityKind::Base => "BaseEntity",
            EntityKind::World => "WorldEntity",
            EntityKind::Health => "HealthEntity",
            EntityKind::Rules => "GameRules",
            EntityKind::Prop => "PropEntity",
            EntityKind::Bot => "BotEntity",
            EntityKind::Player => "PlayerEntity",
        }
    }

    pub fn from_classname(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.classname() == name)
    }

    pub fn is_abstract(self) -> bool {
        matches!(
            self,
            EntityKind::Base | EntityKind::World | EntityKind::Health
        )
    }

    fn bit(self) -> KindMask {
        match self {
            EntityKind::Base => KindMask::BASE,
            EntityKind::World => KindMask::WORLD,
            EntityKind::Health => KindMask::HEALTH,
            EntityKind::Rules => KindMask::RULES,
            EntityKind::Prop => KindMask::PROP,
            EntityKind::Bot => KindMask::BOT,
            EntityKind::Player => KindMask::PLAYER,
        }
    }

    /// The kind itself plus every kind it satisfies.
    pub fn mask(self) -> KindMask {
        let ancestors = match self {
            EntityKind::Base => KindMask::empty(),
            EntityKind::World | EntityKind::Rules => KindMask::BASE,
            EntityKind::Health | EntityKind::Prop => KindMask::BASE | KindMask::WORLD,
            EntityKind::Bot | EntityKind::Player => {
                KindMask::BASE | KindMask::WORLD | KindMask::HEALTH
            }
        };
        ancestors | self.bit()
    }

    /// Polymorphic test: `Player.is_a(Health)` holds.
    pub fn is_a(self, other: EntityKind) -> bool {
        self.mask().contains(other.bit())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.classname())
    }
}

/// Entity-level errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EntityError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{found} is not a {expected}")]
    WrongKind {
        expected: EntityKind,
        found: EntityKind,
    },
}

/// Wander state for bots.
#[derive(Debug, Clone)]
pub struct BotBrain {
    rng: StdRng,
    pub speed: f32,
    retarget_in: f32,
}

impl BotBrain {
    const RETARGET_SECS: f32 = 2.0;

    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            speed: 8.0,
            retarget_in: 0.0,
        }
    }

    fn think(&mut self, world: &mut WorldState, alive: bool, dt: f32) {
        if !alive {
            world.velocity = Vec3::ZERO;
            return;
        }
        self.retarget_in -= dt;
        if self.retarget_in <= 0.0 {
            self.retarget_in = Self::RETARGET_SECS;
            let yaw: f32 = self.rng.gen_range(0.0..360.0);
            let (s, c) = yaw.to_radians().sin_cos();
            world.rotation = Vec3::new(0.0, yaw, 0.0);
            world.velocity = Vec3::new(-s, 0.0, -c) * self.speed;
        }
        world.integrate(dt);
    }
}

/// Kind-specific state.
#[derive(Debug, Clone)]
pub enum Body {
    Rules(RulesState),
    Prop(WorldState),
    Bot {
        world: WorldState,
        health: HealthState,
        brain: BotBrain,
    },
    Player {
        world: WorldState,
        health: HealthState,
        player: PlayerState,
    },
}

impl Body {
    fn for_kind(kind: EntityKind, id: EntityId) -> Option<Self> {
        Some(match kind {
            EntityKind::Rules => Body::Rules(RulesState::default()),
            EntityKind::Prop => Body::Prop(WorldState::default()),
            EntityKind::Bot => Body::Bot {
                world: WorldState::default(),
                health: HealthState::new(100),
                brain: BotBrain::new(id.0 as u64),
            },
            EntityKind::Player => Body::Player {
                world: WorldState::default(),
                health: HealthState::new(100),
                player: PlayerState::default(),
            },
            EntityKind::Base | EntityKind::World | EntityKind::Health => return None,
        })
    }
}

/// Per-tick inputs for [`Entity::think`].
#[derive(Debug, Clone, Copy)]
pub struct ThinkContext {
    pub dt: f32,
    /// Session time in seconds.
    pub now: f64,
}

type SetupFn = Box<dyn FnOnce(&mut Entity) + Send>;
type DestroyFn = Box<dyn FnOnce(EntityId) + Send>;

/// A simulated object owned by an [`crate::registry::EntityRegistry`].
pub struct Entity {
    id: EntityId,
    kind: EntityKind,
    session: SessionId,
    name: Option<String>,
    associated: BTreeSet<ForeignHandle>,
    attributes: BTreeMap<String, Value>,
    pub body: Body,
    setup: Vec<SetupFn>,
    on_destroy: Vec<DestroyFn>,
    alive: bool,
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("alive", &self.alive)
            .finish()
    }
}

impl Entity {
    /// Builds an unregistered entity. `None` for abstract kinds.
    pub(crate) fn new(id: EntityId, kind: EntityKind, session: SessionId) -> Option<Self> {
        Some(Self {
            id,
            kind,
            session,
            name: None,
            associated: BTreeSet::new(),
            attributes: BTreeMap::new(),
            body: Body::for_kind(kind, id)?,
            setup: Vec::new(),
            on_destroy: Vec::new(),
            alive: true,
        })
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn classname(&self) -> &'static str {
        self.kind.classname()
    }

    pub fn is_a(&self, kind: EntityKind) -> bool {
        self.kind.is_a(kind)
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn set_name_unchecked(&mut self, name: Option<String>) {
        self.name = name;
    }

    /// False once the registry has destroyed the entity, even while its
    /// teardown is still deferred.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub(crate) fn mark_dead(&mut self) {
        self.alive = false;
    }

    pub fn associated(&self) -> impl Iterator<Item = ForeignHandle> + '_ {
        self.associated.iter().copied()
    }

    pub(crate) fn associated_mut(&mut self) -> &mut BTreeSet<ForeignHandle> {
        &mut self.associated
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    pub fn remove_attribute(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    pub fn world(&self) -> Option<&WorldState> {
        match &self.body {
            Body::Prop(world) | Body::Bot { world, .. } | Body::Player { world, .. } => {
                Some(world)
            }
            Body::Rules(_) => None,
        }
    }

    pub fn world_mut(&mut self) -> Option<&mut WorldState> {
        match &mut self.body {
            Body::Prop(world) | Body::Bot { world, .. } | Body::Player { world, .. } => {
                Some(world)
            }
            Body::Rules(_) => None,
        }
    }

    pub fn health(&self) -> Option<&HealthState> {
        match &self.body {
            Body::Bot { health, .. } | Body::Player { health, .. } => Some(health),
            _ => None,
        }
    }

    pub fn health_mut(&mut self) -> Option<&mut HealthState> {
        match &mut self.body {
            Body::Bot { health, .. } | Body::Player { health, .. } => Some(health),
            _ => None,
        }
    }

    pub fn player(&self) -> Option<&PlayerState> {
        match &self.body {
            Body::Player { player, .. } => Some(player),
            _ => None,
        }
    }

    pub fn player_mut(&mut self) -> Option<&mut PlayerState> {
        match &mut self.body {
            Body::Player { player, .. } => Some(player),
            _ => None,
        }
    }

    pub fn rules(&self) -> Option<&RulesState> {
        match &self.body {
            Body::Rules(rules) => Some(rules),
            _ => None,
        }
    }

    pub fn rules_mut(&mut self) -> Option<&mut RulesState> {
        match &mut self.body {
            Body::Rules(rules) => Some(rules),
            _ => None,
        }
    }

    /// Queues a callback to run once the registry has bound the entity.
    pub fn on_setup(&mut self, f: impl FnOnce(&mut Entity) + Send + 'static) {
        self.setup.push(Box::new(f));
    }

    /// Registers a deletion callback. Each runs isolated during teardown.
    pub fn on_destroy(&mut self, f: impl FnOnce(EntityId) + Send + 'static) {
        self.on_destroy.push(Box::new(f));
    }

    pub(crate) fn run_setup(&mut self) {
        for f in std::mem::take(&mut self.setup) {
            isolated("entity_setup", || f(self));
        }
    }

    /// Runs deletion callbacks, clears event signals and drops every field
    /// that could hold a reference to something else.
    pub(crate) fn teardown(&mut self) {
        let id = self.id;
        for f in std::mem::take(&mut self.on_destroy) {
            isolated("entity_destroy", || f(id));
        }
        if let Some(health) = self.health_mut() {
            health.clear_signals();
        }
        self.setup.clear();
        self.attributes.clear();
        self.associated.clear();
        self.name = None;
        self.alive = false;
    }

    /// One simulation step.
    pub fn think(&mut self, ctx: &ThinkContext) {
        match &mut self.body {
            Body::Rules(rules) => rules.think(ctx.dt),
            Body::Prop(world) => world.integrate(ctx.dt),
            Body::Bot {
                world,
                health,
                brain,
            } => brain.think(world, health.health() > 0, ctx.dt),
            Body::Player { .. } => {}
        }
    }

    /// Networkable fields in declaration order, base parts first, then
    /// dynamic attributes as `@name`.
    pub fn capture_snapshot(&self) -> PropertySet {
        let mut out = PropertySet::new();
        match &self.body {
            Body::Rules(rules) => rules.collect_fields(&mut out),
            Body::Prop(world) => world.collect_fields(&mut out),
            Body::Bot { world, health, .. } => {
                world.collect_fields(&mut out);
                health.collect_fields(&mut out);
            }
            Body::Player {
                world,
                health,
                player,
            } => {
                world.collect_fields(&mut out);
                health.collect_fields(&mut out);
                player.collect_fields(&mut out);
            }
        }
        for (key, value) in &self.attributes {
            out.push((format!("{ATTRIBUTE_PREFIX}{key}"), value.clone()));
        }
        out
    }

    /// Applies named fields from a snapshot delta. Unknown names and values
    /// of the wrong type are skipped. Returns the number applied.
    pub fn apply_snapshot_fields(&mut self, fields: &[(String, Value)]) -> usize {
        let mut applied = 0;
        for (name, value) in fields {
            let ok = if let Some(removed) = name.strip_prefix(REMOVED_FIELD_PREFIX) {
                // Only attributes can disappear.
                removed
                    .strip_prefix(ATTRIBUTE_PREFIX)
                    .is_some_and(|key| self.attributes.remove(key).is_some())
            } else if let Some(key) = name.strip_prefix(ATTRIBUTE_PREFIX) {
                self.attributes.insert(key.to_string(), value.clone());
                true
            } else {
                self.apply_field(name, value)
            };
            if ok {
                applied += 1;
            } else {
                trace!(entity = %self.id, field = %name, "Skipping unknown or mistyped field");
            }
        }
        applied
    }

    fn apply_field(&mut self, name: &str, value: &Value) -> bool {
        match &mut self.body {
            Body::Rules(rules) => rules.apply_field(name, value),
            Body::Prop(world) => world.apply_field(name, value),
            Body::Bot { world, health, .. } => {
                world.apply_field(name, value) || health.apply_field(name, value)
            }
            Body::Player {
                world,
                health,
                player,
            } => {
                world.apply_field(name, value)
                    || health.apply_field(name, value)
                    || player.apply_field(name, value)
            }
        }
    }

    /// Full-state encode, strictly ordered, base parts first.
    pub fn write_state_buffer(&self, w: &mut BufferWriter) -> Result<(), CodecError> {
        match &self.body {
            Body::Rules(rules) => rules.write(w),
            Body::Prop(world) => world.write(w),
            Body::Bot { world, health, .. } => {
                world.write(w);
                health.write(w);
            }
            Body::Player {
                world,
                health,
                player,
            } => {
                world.write(w);
                health.write(w);
                player.write(w)?;
            }
        }
        Ok(())
    }

    /// Full-state decode matching [`Entity::write_state_buffer`]. Nothing is
    /// changed unless the whole buffer decodes.
    pub fn apply_state_buffer(&mut self, r: &mut BufferReader) -> Result<(), CodecError> {
        let mut body = self.body.clone();
        match &mut body {
            Body::Rules(rules) => rules.read(r)?,
            Body::Prop(world) => world.read(r)?,
            Body::Bot { world, health, .. } => {
                world.read(r)?;
                health.read(r)?;
            }
            Body::Player {
                world,
                health,
                player,
            } => {
                world.read(r)?;
                health.read(r)?;
                player.read(r)?;
            }
        }
        self.body = body;
        Ok(())
    }

    /// Applies damage through the entity's health part. Entities without one
    /// are unaffected.
    pub fn take_damage(
        &mut self,
        amount: u16,
        attacker: Option<EntityId>,
        now: f64,
        damage_enabled: bool,
    ) -> DamageOutcome {
        let id = self.id;
        match self.health_mut() {
            Some(health) => health.take_damage(id, amount, attacker, now, damage_enabled),
            None => DamageOutcome::Suppressed,
        }
    }
}

/// Builds an entity's default state for a class.
pub type Constructor = fn(&mut Entity);

/// Registration record for one concrete class.
#[derive(Debug, Clone, Copy)]
pub struct ClassInfo {
    pub kind: EntityKind,
    pub construct: Constructor,
}

/// Registry errors surfaced by [`ClassRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassError {
    #[error("class {0} is already registered")]
    Duplicate(&'static str),
    #[error("class {0} is abstract and cannot be constructed")]
    Abstract(&'static str),
}

/// The set of constructible classes. Built once at bootstrap and shared by
/// every session's entity registry.
#[derive(Debug, Default, Clone)]
pub struct ClassRegistry {
    classes: HashMap<&'static str, ClassInfo>,
}

fn construct_default(_: &mut Entity) {}

fn construct_player(entity: &mut Entity) {
    entity.on_setup(|e| {
        if let Some(world) = e.world_mut() {
            world.size = Vec3::new(2.0, 5.0, 1.0);
        }
    });
}

fn construct_bot(entity: &mut Entity) {
    entity.on_setup(|e| {
        if let Some(world) = e.world_mut() {
            world.size = Vec3::new(2.0, 5.0, 1.0);
        }
    });
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every concrete kind registered with its default
    /// constructor.
    pub fn with_builtin() -> Self {
        let mut classes = Self::new();
        for kind in EntityKind::CONCRETE {
            let construct: Constructor = match kind {
                EntityKind::Player => construct_player,
                EntityKind::Bot => construct_bot,
                _ => construct_default,
            };
            // Fresh registry: a duplicate here is impossible.
            let _ = classes.register(kind, construct);
        }
        classes
    }

    /// One-time registration of a concrete kind.
    pub fn register(&mut self, kind: EntityKind, construct: Constructor) -> Result<(), ClassError> {
        if kind.is_abstract() {
            return Err(ClassError::Abstract(kind.classname()));
        }
        if self.classes.contains_key(kind.classname()) {
            return Err(ClassError::Duplicate(kind.classname()));
        }
        self.classes
            .insert(kind.classname(), ClassInfo { kind, construct });
        Ok(())
    }

    pub fn lookup(&self, classname: &str) -> Option<&ClassInfo> {
        self.classes.get(classname)
    }

    pub fn is_registered(&self, kind: EntityKind) -> bool {
        self.classes.contains_key(kind.classname())
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
