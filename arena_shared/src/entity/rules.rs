//! Round state: a single replicated entity per session.

use crate::codec::{BufferReader, BufferWriter, CodecError, Value};

use super::PropertySet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MatchPhase {
    #[default]
    Warmup = 0,
    Live = 1,
    Ended = 2,
}

impl MatchPhase {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MatchPhase::Warmup),
            1 => Some(MatchPhase::Live),
            2 => Some(MatchPhase::Ended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RulesState {
    pub round: u8,
    pub phase: MatchPhase,
    /// Seconds left in the live phase.
    pub time_left: f32,
    pub score_a: u16,
    pub score_b: u16,
}

impl RulesState {
    /// Enters the live phase of the next round.
    pub fn start_round(&mut self, duration_secs: f32) {
        self.round = self.round.wrapping_add(1);
        self.phase = MatchPhase::Live;
        self.time_left = duration_secs;
    }

    pub fn think(&mut self, dt: f32) {
        if self.phase != MatchPhase::Live {
            return;
        }
        self.time_left -= dt;
        if self.time_left <= 0.0 {
            self.time_left = 0.0;
            self.phase = MatchPhase::Ended;
        }
    }

    pub(crate) fn collect_fields(&self, out: &mut PropertySet) {
        out.push(("round".into(), Value::U8(self.round)));
        out.push(("phase".into(), Value::U8(self.phase as u8)));
        out.push(("time_left".into(), Value::F32(self.time_left)));
        out.push(("score_a".into(), Value::U16(self.score_a)));
        out.push(("score_b".into(), Value::U16(self.score_b)));
    }

    pub(crate) fn apply_field(&mut self, name: &str, value: &Value) -> bool {
        match (name, value) {
            ("round", Value::U8(v)) => self.round = *v,
            ("phase", Value::U8(v)) => match MatchPhase::from_u8(*v) {
                Some(phase) => self.phase = phase,
                None => return false,
            },
            ("time_left", Value::F32(v)) => self.time_left = *v,
            ("score_a", Value::U16(v)) => self.score_a = *v,
            ("score_b", Value::U16(v)) => self.score_b = *v,
            _ => return false,
        }
        true
    }

    pub(crate) fn write(&self, w: &mut BufferWriter) {
        w.write_u8(self.round)
            .write_u8(self.phase as u8)
            .write_f32(self.time_left)
            .write_u16(self.score_a)
            .write_u16(self.score_b);
    }

    pub(crate) fn read(&mut self, r: &mut BufferReader) -> Result<(), CodecError> {
        self.round = r.read_u8()?;
        // Unknown phases decode as warmup.
        self.phase = MatchPhase::from_u8(r.read_u8()?).unwrap_or_default();
        self.time_left = r.read_f32()?;
        self.score_a = r.read_u16()?;
        self.score_b = r.read_u16()?;
        Ok(())
    }
}
