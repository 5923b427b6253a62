//! Health, damage and kill credit.
//!
//! - damage is gated by the session's damage switch and by spawn protection
//! - each hit is recorded with its attacker and time; the most recent
//!   attacker inside the credit window gets the kill
//! - `took_damage` fires on every hit, `died` once when health reaches zero

use std::collections::VecDeque;

use crate::{
    codec::{BufferReader, BufferWriter, CodecError, Value},
    signal::Signal,
};

use super::{EntityId, PropertySet};

const MAX_ATTACK_RECORDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttackRecord {
    pub attacker: Option<EntityId>,
    pub amount: u16,
    pub at: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DamageEvent {
    pub victim: EntityId,
    pub attacker: Option<EntityId>,
    pub amount: u16,
    pub remaining: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DamageOutcome {
    /// No damage applied (disabled, protected, already dead, or no health).
    Suppressed,
    Dealt(u16),
    Killed(u16),
}

#[derive(Debug, Clone)]
pub struct HealthState {
    health: u16,
    max_health: u16,
    protected_until: f64,
    attackers: VecDeque<AttackRecord>,
    took_damage: Signal<DamageEvent>,
    died: Signal<DamageEvent>,
}

impl HealthState {
    pub fn new(max_health: u16) -> Self {
        Self {
            health: max_health,
            max_health,
            protected_until: f64::NEG_INFINITY,
            attackers: VecDeque::new(),
            took_damage: Signal::new("took_damage"),
            died: Signal::new("died"),
        }
    }

    pub fn health(&self) -> u16 {
        self.health
    }

    pub fn max_health(&self) -> u16 {
        self.max_health
    }

    pub fn is_dead(&self) -> bool {
        self.health == 0
    }

    /// Clamped to `max_health`.
    pub fn set_health(&mut self, health: u16) {
        self.health = health.min(self.max_health);
    }

    /// Lowers current health if it now exceeds the new maximum.
    pub fn set_max_health(&mut self, max_health: u16) {
        self.max_health = max_health;
        self.health = self.health.min(max_health);
    }

    pub fn heal(&mut self, amount: u16) {
        self.set_health(self.health.saturating_add(amount));
    }

    /// Refills health, forgets attackers and grants protection until
    /// `now + protection_secs`.
    pub fn respawn(&mut self, now: f64, protection_secs: f64) {
        self.health = self.max_health;
        self.attackers.clear();
        self.protected_until = now + protection_secs;
    }

    pub fn is_protected(&self, now: f64) -> bool {
        now < self.protected_until
    }

    pub fn can_take_damage(&self, now: f64, damage_enabled: bool) -> bool {
        damage_enabled && !self.is_dead() && !self.is_protected(now)
    }

    pub fn take_damage(
        &mut self,
        victim: EntityId,
        amount: u16,
        attacker: Option<EntityId>,
        now: f64,
        damage_enabled: bool,
    ) -> DamageOutcome {
        if amount == 0 || !self.can_take_damage(now, damage_enabled) {
            return DamageOutcome::Suppressed;
        }
        let dealt = amount.min(self.health);
        self.health -= dealt;
        self.attackers.push_front(AttackRecord {
            attacker,
            amount: dealt,
            at: now,
        });
        self.attackers.truncate(MAX_ATTACK_RECORDS);

        let event = DamageEvent {
            victim,
            attacker,
            amount: dealt,
            remaining: self.health,
        };
        self.took_damage.fire(event);
        if self.health == 0 {
            self.died.fire(event);
            DamageOutcome::Killed(dealt)
        } else {
            DamageOutcome::Dealt(dealt)
        }
    }

    /// Most recent attacker that hit within `window` seconds of `now`.
    pub fn killer(&self, now: f64, window: f64) -> Option<EntityId> {
        self.attackers
            .iter()
            .take_while(|r| now - r.at <= window)
            .find_map(|r| r.attacker)
    }

    pub fn attack_history(&self) -> impl Iterator<Item = &AttackRecord> {
        self.attackers.iter()
    }

    pub fn took_damage(&self) -> &Signal<DamageEvent> {
        &self.took_damage
    }

    pub fn died(&self) -> &Signal<DamageEvent> {
        &self.died
    }

    pub(crate) fn clear_signals(&self) {
        self.took_damage.clear();
        self.died.clear();
    }

    /// The maximum goes first so a raised cap is in place before the
    /// current value is clamped against it.
    pub(crate) fn collect_fields(&self, out: &mut PropertySet) {
        out.push(("max_health".into(), Value::U16(self.max_health)));
        out.push(("health".into(), Value::U16(self.health)));
    }

    pub(crate) fn apply_field(&mut self, name: &str, value: &Value) -> bool {
        match (name, value) {
            ("health", Value::U16(v)) => {
                self.set_health(*v);
                true
            }
            ("max_health", Value::U16(v)) => {
                self.set_max_health(*v);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn write(&self, w: &mut BufferWriter) {
        w.write_u16(self.health).write_u16(self.max_health);
    }

    pub(crate) fn read(&mut self, r: &mut BufferReader) -> Result<(), CodecError> {
        let health = r.read_u16()?;
        let max_health = r.read_u16()?;
        self.set_max_health(max_health);
        self.set_health(health);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    const VICTIM: EntityId = EntityId(1);

    #[test]
    fn damage_clamps_and_kills_once() {
        let mut h = HealthState::new(50);
        let deaths = Arc::new(AtomicU32::new(0));
        let d = deaths.clone();
        h.died().connect(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(h.take_damage(VICTIM, 20, None, 0.0, true), DamageOutcome::Dealt(20));
        assert_eq!(h.take_damage(VICTIM, 40, None, 0.1, true), DamageOutcome::Killed(30));
        assert_eq!(h.health(), 0);
        assert_eq!(h.take_damage(VICTIM, 5, None, 0.2, true), DamageOutcome::Suppressed);
        assert_eq!(deaths.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn damage_gates() {
        let mut h = HealthState::new(100);
        assert_eq!(h.take_damage(VICTIM, 10, None, 0.0, false), DamageOutcome::Suppressed);

        h.respawn(10.0, 2.0);
        assert!(h.is_protected(11.0));
        assert_eq!(h.take_damage(VICTIM, 10, None, 11.0, true), DamageOutcome::Suppressed);
        assert_eq!(h.take_damage(VICTIM, 10, None, 12.0, true), DamageOutcome::Dealt(10));
    }

    #[test]
    fn kill_credit_uses_latest_attacker_in_window() {
        let mut h = HealthState::new(100);
        h.take_damage(VICTIM, 10, Some(EntityId(7)), 0.0, true);
        h.take_damage(VICTIM, 10, None, 1.0, true);
        h.take_damage(VICTIM, 10, Some(EntityId(8)), 2.0, true);
        assert_eq!(h.killer(3.0, 5.0), Some(EntityId(8)));
        assert_eq!(h.killer(6.5, 5.0), Some(EntityId(8)));
        assert_eq!(h.killer(20.0, 5.0), None);
    }

    #[test]
    fn max_health_lowers_current() {
        let mut h = HealthState::new(100);
        h.set_max_health(60);
        assert_eq!(h.health(), 60);
        h.set_health(500);
        assert_eq!(h.health(), 60);
        h.take_damage(VICTIM, 30, None, 0.0, true);
        h.heal(10);
        assert_eq!(h.health(), 40);
    }

    #[test]
    fn decoded_health_is_clamped() {
        let mut w = BufferWriter::new();
        w.write_u16(200).write_u16(100);
        let mut h = HealthState::new(50);
        h.read(&mut BufferReader::new(w.finalize())).unwrap();
        assert_eq!(h.max_health(), 100);
        assert_eq!(h.health(), 100);

        assert!(h.apply_field("health", &Value::U16(500)));
        assert_eq!(h.health(), 100);

        // A raised cap applied in field order lets the new value through.
        let mut fields = PropertySet::new();
        let mut raised = HealthState::new(150);
        raised.set_health(120);
        raised.collect_fields(&mut fields);
        for (name, value) in &fields {
            h.apply_field(name, value);
        }
        assert_eq!((h.health(), h.max_health()), (120, 150));
    }
}
